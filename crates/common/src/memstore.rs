//! In-memory implementation of the repository traits. Backs unit tests and
//! offline replays; behavior mirrors the SQLite implementation.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::model::{
    Alert, ClusterEvent, NewAlert, NewClusterEvent, NewTrade, Token, Trade, TradeSide, Wallet,
};
use crate::store::{AlertStore, Stores, TokenPatch, TokenStore, TradeStore, WalletStore};

#[derive(Default)]
struct Inner {
    wallets: BTreeMap<String, Wallet>,
    tokens: BTreeMap<String, Token>,
    trades: Vec<Trade>,
    clusters: Vec<ClusterEvent>,
    alerts: Vec<Alert>,
    next_trade_id: i64,
    next_cluster_id: i64,
    next_alert_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Repository bundle backed by this store.
    pub fn stores(self: &Arc<Self>) -> Stores {
        Stores {
            wallets: self.clone(),
            tokens: self.clone(),
            trades: self.clone(),
            alerts: self.clone(),
        }
    }

    /// Recorded cluster events, in insertion order.
    pub fn cluster_events(&self) -> Vec<ClusterEvent> {
        self.lock().clusters.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("memstore mutex poisoned")
    }
}

#[async_trait]
impl WalletStore for MemoryStore {
    async fn get(&self, address: &str) -> Result<Option<Wallet>> {
        Ok(self.lock().wallets.get(address).cloned())
    }

    async fn upsert(&self, wallet: Wallet) -> Result<()> {
        self.lock().wallets.insert(wallet.address.clone(), wallet);
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<Wallet>> {
        let mut active: Vec<Wallet> = self
            .lock()
            .wallets
            .values()
            .filter(|w| w.is_active)
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            b.conviction_score
                .partial_cmp(&a.conviction_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(active)
    }

    async fn set_conviction_score(&self, address: &str, score: f64) -> Result<()> {
        if let Some(w) = self.lock().wallets.get_mut(address) {
            w.conviction_score = score;
        }
        Ok(())
    }

    async fn touch_last_activity(&self, address: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(w) = self.lock().wallets.get_mut(address) {
            w.last_activity = Some(at);
        }
        Ok(())
    }

    async fn deactivate(&self, address: &str) -> Result<bool> {
        match self.lock().wallets.get_mut(address) {
            Some(w) => {
                w.is_active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn get(&self, contract_address: &str) -> Result<Option<Token>> {
        Ok(self.lock().tokens.get(contract_address).cloned())
    }

    async fn observe(
        &self,
        contract_address: &str,
        market_cap_sol: Option<f64>,
        total_supply: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Token> {
        let mut inner = self.lock();
        let token = inner
            .tokens
            .entry(contract_address.to_string())
            .or_insert_with(|| Token {
                contract_address: contract_address.to_string(),
                name: None,
                symbol: None,
                decimals: 9,
                market_cap_sol: None,
                liquidity_sol: None,
                total_supply: None,
                platform: "unknown".to_string(),
                // Launch time is approximated by first observation; enrichment
                // may refine market data but the launch estimate stands.
                launched_at: Some(now),
                discovered_at: now,
                is_rugged: false,
            });
        if market_cap_sol.is_some() {
            token.market_cap_sol = market_cap_sol;
        }
        if total_supply.is_some() {
            token.total_supply = total_supply;
        }
        Ok(token.clone())
    }

    async fn apply_patch(&self, contract_address: &str, patch: &TokenPatch) -> Result<()> {
        if let Some(token) = self.lock().tokens.get_mut(contract_address) {
            if patch.name.is_some() {
                token.name = patch.name.clone();
            }
            if patch.symbol.is_some() {
                token.symbol = patch.symbol.clone();
            }
            if let Some(decimals) = patch.decimals {
                token.decimals = decimals;
            }
            if patch.market_cap_sol.is_some() {
                token.market_cap_sol = patch.market_cap_sol;
            }
            if patch.liquidity_sol.is_some() {
                token.liquidity_sol = patch.liquidity_sol;
            }
            if patch.total_supply.is_some() {
                token.total_supply = patch.total_supply;
            }
        }
        Ok(())
    }

    async fn mark_rugged(&self, contract_address: &str) -> Result<()> {
        if let Some(token) = self.lock().tokens.get_mut(contract_address) {
            token.is_rugged = true;
        }
        Ok(())
    }
}

#[async_trait]
impl TradeStore for MemoryStore {
    async fn get_by_signature(&self, tx_signature: &str) -> Result<Option<Trade>> {
        Ok(self
            .lock()
            .trades
            .iter()
            .find(|t| t.tx_signature == tx_signature)
            .cloned())
    }

    async fn insert(&self, trade: NewTrade) -> Result<Trade> {
        let mut inner = self.lock();
        anyhow::ensure!(
            !inner
                .trades
                .iter()
                .any(|t| t.tx_signature == trade.tx_signature),
            "duplicate tx_signature {}",
            trade.tx_signature
        );
        inner.next_trade_id += 1;
        let row = Trade {
            id: inner.next_trade_id,
            wallet_address: trade.wallet_address,
            token_ca: trade.token_ca,
            tx_signature: trade.tx_signature,
            side: trade.side,
            sol_amount: trade.sol_amount,
            token_amount: trade.token_amount,
            supply_percentage: trade.supply_percentage,
            mcap_at_trade: trade.mcap_at_trade,
            block_time: trade.block_time,
        };
        inner.trades.push(row.clone());
        Ok(row)
    }

    async fn buys_for_token_between(
        &self,
        token_ca: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Trade>> {
        let mut rows: Vec<Trade> = self
            .lock()
            .trades
            .iter()
            .filter(|t| {
                t.token_ca == token_ca
                    && t.side == TradeSide::Buy
                    && t.block_time >= from
                    && t.block_time <= to
            })
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.block_time);
        Ok(rows)
    }

    async fn for_wallet(&self, wallet_address: &str) -> Result<Vec<Trade>> {
        let mut rows: Vec<Trade> = self
            .lock()
            .trades
            .iter()
            .filter(|t| t.wallet_address == wallet_address)
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.block_time);
        Ok(rows)
    }

    async fn mcap_observations(
        &self,
        token_ca: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, f64)>> {
        let mut rows: Vec<(DateTime<Utc>, f64)> = self
            .lock()
            .trades
            .iter()
            .filter(|t| t.token_ca == token_ca && t.block_time >= from && t.block_time <= to)
            .filter_map(|t| t.mcap_at_trade.map(|m| (t.block_time, m)))
            .collect();
        rows.sort_by_key(|(at, _)| *at);
        Ok(rows)
    }

    async fn insert_cluster_event(&self, event: NewClusterEvent) -> Result<ClusterEvent> {
        let mut inner = self.lock();
        inner.next_cluster_id += 1;
        let window_seconds = event.window_seconds();
        let row = ClusterEvent {
            id: inner.next_cluster_id,
            token_ca: event.token_ca,
            wallet_count: event.wallet_addresses.len() as u32,
            wallet_addresses: event.wallet_addresses,
            total_sol: event.total_sol,
            first_buy_at: event.first_buy_at,
            last_buy_at: event.last_buy_at,
            window_seconds,
            created_at: event.created_at,
        };
        inner.clusters.push(row.clone());
        Ok(row)
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn insert(&self, alert: NewAlert) -> Result<Alert> {
        let mut inner = self.lock();
        inner.next_alert_id += 1;
        let row = Alert {
            id: inner.next_alert_id,
            token_ca: alert.token_ca,
            alert_type: alert.alert_type,
            trigger_data: alert.trigger_data,
            total_sol_volume: alert.total_sol_volume,
            wallet_count: alert.wallet_count,
            avg_win_rate: alert.avg_win_rate,
            max_supply_pct: alert.max_supply_pct,
            is_sent: false,
            sent_at: None,
            created_at: alert.created_at,
            outcome_pnl: None,
            outcome_checked_at: None,
        };
        inner.alerts.push(row.clone());
        Ok(row)
    }

    async fn get(&self, id: i64) -> Result<Option<Alert>> {
        Ok(self.lock().alerts.iter().find(|a| a.id == id).cloned())
    }

    async fn unsent(&self, limit: usize) -> Result<Vec<Alert>> {
        let mut rows: Vec<Alert> = self
            .lock()
            .alerts
            .iter()
            .filter(|a| !a.is_sent)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.created_at);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn mark_sent(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        if let Some(a) = self.lock().alerts.iter_mut().find(|a| a.id == id) {
            a.is_sent = true;
            a.sent_at = Some(at);
        }
        Ok(())
    }

    async fn due_for_outcome_check(
        &self,
        created_before: DateTime<Utc>,
        rechecked_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Alert>> {
        let mut rows: Vec<Alert> = self
            .lock()
            .alerts
            .iter()
            .filter(|a| {
                a.created_at <= created_before
                    && a.outcome_checked_at.is_none_or(|at| at <= rechecked_before)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.created_at);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn record_outcome(
        &self,
        id: i64,
        return_pct: f64,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(a) = self.lock().alerts.iter_mut().find(|a| a.id == id) {
            a.outcome_pnl = Some(return_pct);
            a.outcome_checked_at = Some(checked_at);
        }
        Ok(())
    }

    async fn created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Alert>> {
        let mut rows: Vec<Alert> = self
            .lock()
            .alerts
            .iter()
            .filter(|a| a.created_at >= from && a.created_at <= to)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.created_at);
        Ok(rows)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Alert>> {
        let mut rows: Vec<Alert> = self.lock().alerts.to_vec();
        rows.sort_by_key(|a| std::cmp::Reverse(a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SignalKind, WalletSource};
    use chrono::{Duration, TimeZone};

    fn ts(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(min)
    }

    fn buy(wallet: &str, token: &str, sig: &str, sol: f64, at: DateTime<Utc>) -> NewTrade {
        NewTrade {
            wallet_address: wallet.to_string(),
            token_ca: token.to_string(),
            tx_signature: sig.to_string(),
            side: TradeSide::Buy,
            sol_amount: sol,
            token_amount: 1000.0,
            supply_percentage: 0.1,
            mcap_at_trade: Some(100.0),
            block_time: at,
        }
    }

    #[tokio::test]
    async fn test_wallet_lifecycle() {
        let stores = MemoryStore::new().stores();
        let mut wallet = Wallet::new("W1", WalletSource::Manual, ts(0));
        wallet.conviction_score = 10.0;
        stores.wallets.upsert(wallet).await.unwrap();

        let mut second = Wallet::new("W2", WalletSource::Gmgn, ts(0));
        second.conviction_score = 90.0;
        stores.wallets.upsert(second).await.unwrap();

        let active = stores.wallets.list_active().await.unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].address, "W2"); // highest conviction first

        assert!(stores.wallets.deactivate("W1").await.unwrap());
        assert!(!stores.wallets.deactivate("nope").await.unwrap());
        assert_eq!(stores.wallets.list_active().await.unwrap().len(), 1);

        // Deactivated, not deleted.
        let w1 = stores.wallets.get("W1").await.unwrap();
        assert!(w1.is_some_and(|w| !w.is_active));
    }

    #[tokio::test]
    async fn test_token_observe_is_get_or_create() {
        let stores = MemoryStore::new().stores();
        let t1 = stores
            .tokens
            .observe("CA1", Some(100.0), Some(1e6), ts(0))
            .await
            .unwrap();
        assert_eq!(t1.launched_at, Some(ts(0)));

        // Second observation refreshes market data, keeps launch estimate.
        let t2 = stores
            .tokens
            .observe("CA1", Some(250.0), None, ts(10))
            .await
            .unwrap();
        assert_eq!(t2.market_cap_sol, Some(250.0));
        assert_eq!(t2.total_supply, Some(1e6));
        assert_eq!(t2.launched_at, Some(ts(0)));
    }

    #[tokio::test]
    async fn test_token_patch_leaves_missing_fields() {
        let stores = MemoryStore::new().stores();
        stores
            .tokens
            .observe("CA1", Some(100.0), Some(1e6), ts(0))
            .await
            .unwrap();
        stores
            .tokens
            .apply_patch(
                "CA1",
                &TokenPatch {
                    symbol: Some("PULSE".to_string()),
                    ..TokenPatch::default()
                },
            )
            .await
            .unwrap();
        let token = stores.tokens.get("CA1").await.unwrap().unwrap();
        assert_eq!(token.symbol.as_deref(), Some("PULSE"));
        assert_eq!(token.market_cap_sol, Some(100.0));
    }

    #[tokio::test]
    async fn test_trade_signature_unique() {
        let stores = MemoryStore::new().stores();
        stores
            .trades
            .insert(buy("W1", "CA1", "sig1", 1.0, ts(0)))
            .await
            .unwrap();
        assert!(stores
            .trades
            .insert(buy("W2", "CA1", "sig1", 2.0, ts(1)))
            .await
            .is_err());
        assert!(stores.trades.get_by_signature("sig1").await.unwrap().is_some());
        assert!(stores.trades.get_by_signature("sig2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_buys_window_excludes_sells_and_out_of_range() {
        let stores = MemoryStore::new().stores();
        stores.trades.insert(buy("W1", "CA1", "s1", 1.0, ts(0))).await.unwrap();
        stores.trades.insert(buy("W2", "CA1", "s2", 1.0, ts(4))).await.unwrap();
        stores.trades.insert(buy("W3", "CA1", "s3", 1.0, ts(20))).await.unwrap();
        let mut sell = buy("W1", "CA1", "s4", 1.0, ts(2));
        sell.side = TradeSide::Sell;
        stores.trades.insert(sell).await.unwrap();

        let rows = stores
            .trades
            .buys_for_token_between("CA1", ts(0), ts(5))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].tx_signature, "s1");
    }

    #[tokio::test]
    async fn test_alert_outcome_selection() {
        let stores = MemoryStore::new().stores();
        let fresh = stores
            .alerts
            .insert(NewAlert {
                token_ca: "CA1".to_string(),
                alert_type: SignalKind::HighConviction,
                trigger_data: serde_json::json!({}),
                total_sol_volume: 1.0,
                wallet_count: 1,
                avg_win_rate: 70.0,
                max_supply_pct: 0.6,
                created_at: ts(100),
            })
            .await
            .unwrap();
        let stale = stores
            .alerts
            .insert(NewAlert {
                token_ca: "CA2".to_string(),
                alert_type: SignalKind::ClusterBuy,
                trigger_data: serde_json::json!({}),
                total_sol_volume: 2.0,
                wallet_count: 2,
                avg_win_rate: 68.0,
                max_supply_pct: 0.2,
                created_at: ts(0),
            })
            .await
            .unwrap();

        // Only alerts older than the cutoff are due.
        let due = stores
            .alerts
            .due_for_outcome_check(ts(40), ts(-240), 50)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, stale.id);

        // A recently checked alert drops out until the recheck window passes.
        stores.alerts.record_outcome(stale.id, -10.0, ts(41)).await.unwrap();
        let due = stores
            .alerts
            .due_for_outcome_check(ts(40), ts(30), 50)
            .await
            .unwrap();
        assert!(due.is_empty());

        let _ = fresh;
    }

    #[tokio::test]
    async fn test_unsent_is_fifo_and_mark_sent_sticks() {
        let stores = MemoryStore::new().stores();
        for (i, at) in [(0, ts(5)), (1, ts(1))] {
            stores
                .alerts
                .insert(NewAlert {
                    token_ca: format!("CA{i}"),
                    alert_type: SignalKind::VolumeSpike,
                    trigger_data: serde_json::json!({}),
                    total_sol_volume: 1.0,
                    wallet_count: 0,
                    avg_win_rate: 0.0,
                    max_supply_pct: 0.0,
                    created_at: at,
                })
                .await
                .unwrap();
        }
        let unsent = stores.alerts.unsent(10).await.unwrap();
        assert_eq!(unsent.len(), 2);
        assert_eq!(unsent[0].token_ca, "CA1"); // oldest first

        stores.alerts.mark_sent(unsent[0].id, ts(6)).await.unwrap();
        assert_eq!(stores.alerts.unsent(10).await.unwrap().len(), 1);
        let sent = stores.alerts.get(unsent[0].id).await.unwrap().unwrap();
        assert!(sent.is_sent);
        assert_eq!(sent.sent_at, Some(ts(6)));
    }
}
