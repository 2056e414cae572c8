//! Repository traits consumed by the engine. The core never talks to a
//! storage engine directly: production wires the SQLite implementation
//! ([`crate::sqlstore`]), tests and offline replays wire the in-memory one
//! ([`crate::memstore`]).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::model::{
    Alert, ClusterEvent, NewAlert, NewClusterEvent, NewTrade, Token, Trade, Wallet,
};

/// Partial token update applied by enrichment. `None` fields are left alone,
/// so a failed metadata lookup can never blank out data we already have.
#[derive(Debug, Clone, Default)]
pub struct TokenPatch {
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub decimals: Option<u8>,
    pub market_cap_sol: Option<f64>,
    pub liquidity_sol: Option<f64>,
    pub total_supply: Option<f64>,
}

#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn get(&self, address: &str) -> Result<Option<Wallet>>;

    /// Insert or replace by address.
    async fn upsert(&self, wallet: Wallet) -> Result<()>;

    /// Active wallets, highest conviction first.
    async fn list_active(&self) -> Result<Vec<Wallet>>;

    async fn set_conviction_score(&self, address: &str, score: f64) -> Result<()>;

    async fn touch_last_activity(&self, address: &str, at: DateTime<Utc>) -> Result<()>;

    /// Returns false when the address is unknown. Wallets are deactivated,
    /// never deleted, so their trade history stays attributable.
    async fn deactivate(&self, address: &str) -> Result<bool>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(&self, contract_address: &str) -> Result<Option<Token>>;

    /// Get-or-create on first observed trade. Refreshes market cap and
    /// supply when the event carried them.
    async fn observe(
        &self,
        contract_address: &str,
        market_cap_sol: Option<f64>,
        total_supply: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Token>;

    async fn apply_patch(&self, contract_address: &str, patch: &TokenPatch) -> Result<()>;

    /// One-way flag, set by the outcome tracker on a severe drawdown.
    async fn mark_rugged(&self, contract_address: &str) -> Result<()>;
}

#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn get_by_signature(&self, tx_signature: &str) -> Result<Option<Trade>>;

    async fn insert(&self, trade: NewTrade) -> Result<Trade>;

    /// Buy trades on one token inside [from, to], chronological. This is the
    /// trailing-window query behind cluster and volume-spike detection.
    async fn buys_for_token_between(
        &self,
        token_ca: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Trade>>;

    async fn for_wallet(&self, wallet_address: &str) -> Result<Vec<Trade>>;

    /// (block_time, mcap_at_trade) pairs with a known market cap inside
    /// [from, to], chronological. Drives historical pricing in the outcome
    /// tracker and backtester.
    async fn mcap_observations(
        &self,
        token_ca: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, f64)>>;

    async fn insert_cluster_event(&self, event: NewClusterEvent) -> Result<ClusterEvent>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn insert(&self, alert: NewAlert) -> Result<Alert>;

    async fn get(&self, id: i64) -> Result<Option<Alert>>;

    /// Undelivered alerts, oldest first.
    async fn unsent(&self, limit: usize) -> Result<Vec<Alert>>;

    async fn mark_sent(&self, id: i64, at: DateTime<Utc>) -> Result<()>;

    /// Alerts created before `created_before` whose outcome was never
    /// checked, or last checked before `rechecked_before`. Bounded batch.
    async fn due_for_outcome_check(
        &self,
        created_before: DateTime<Utc>,
        rechecked_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Alert>>;

    async fn record_outcome(
        &self,
        id: i64,
        return_pct: f64,
        checked_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Alerts created inside [from, to], chronological.
    async fn created_between(&self, from: DateTime<Utc>, to: DateTime<Utc>)
        -> Result<Vec<Alert>>;

    /// Most recent alerts, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<Alert>>;
}

/// Bundle of the four repositories, cloned into every component.
#[derive(Clone)]
pub struct Stores {
    pub wallets: Arc<dyn WalletStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub trades: Arc<dyn TradeStore>,
    pub alerts: Arc<dyn AlertStore>,
}
