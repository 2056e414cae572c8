//! Core signal engine: records buy events from tracked wallets and evaluates
//! the three trigger conditions (high conviction, cluster buy, volume spike).

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use common::config;
use common::model::{
    NewAlert, NewClusterEvent, NewTrade, SignalKind, Token, Trade, TradeSide, Wallet, WalletBrief,
};
use common::store::{Stores, TokenPatch};

use crate::enrichment::{RiskAssessor, TokenMetadataProvider};

/// Trailing window for the volume-spike volume sum.
const VOLUME_WINDOW_MINUTES: i64 = 5;

#[derive(Debug, Clone)]
pub struct SignalThresholds {
    pub high_conviction_min_sol: f64,
    pub high_conviction_min_supply_pct: f64,
    pub cluster_min_wallets: usize,
    pub cluster_window_minutes: i64,
    pub cluster_min_sol: f64,
    pub volume_spike_threshold: f64,
    pub new_token_max_age_minutes: i64,
}

impl Default for SignalThresholds {
    fn default() -> Self {
        Self {
            high_conviction_min_sol: 1.0,
            high_conviction_min_supply_pct: 0.5,
            cluster_min_wallets: 2,
            cluster_window_minutes: 5,
            cluster_min_sol: 0.5,
            volume_spike_threshold: 0.10,
            new_token_max_age_minutes: 60,
        }
    }
}

impl From<&config::Signals> for SignalThresholds {
    fn from(cfg: &config::Signals) -> Self {
        Self {
            high_conviction_min_sol: cfg.high_conviction_min_sol,
            high_conviction_min_supply_pct: cfg.high_conviction_min_supply_pct,
            cluster_min_wallets: cfg.cluster_min_wallets,
            cluster_window_minutes: cfg.cluster_window_minutes,
            cluster_min_sol: cfg.cluster_min_sol,
            volume_spike_threshold: cfg.volume_spike_threshold,
            new_token_max_age_minutes: cfg.new_token_max_age_minutes,
        }
    }
}

/// One parsed buy delivered by the ingress.
#[derive(Debug, Clone, Deserialize)]
pub struct BuyEvent {
    pub wallet_address: String,
    pub token_ca: String,
    pub sol_amount: f64,
    pub token_amount: f64,
    pub tx_signature: String,
    pub block_time: DateTime<Utc>,
    #[serde(default)]
    pub market_cap_sol: Option<f64>,
    #[serde(default)]
    pub total_supply: Option<f64>,
}

/// A triggered signal, carrying everything the alert layer needs.
#[derive(Debug, Clone)]
pub struct SignalResult {
    pub signal_type: SignalKind,
    pub token: Token,
    pub trades: Vec<Trade>,
    pub wallets: Vec<Wallet>,
    pub total_sol: f64,
    pub max_supply_pct: f64,
    pub details: serde_json::Value,

    pub rug_checked: bool,
    pub rug_passed: bool,
    pub rug_risk_score: u32,
    pub rug_warnings: Vec<String>,
}

impl SignalResult {
    fn new(signal_type: SignalKind, token: Token) -> Self {
        Self {
            signal_type,
            token,
            trades: Vec::new(),
            wallets: Vec::new(),
            total_sol: 0.0,
            max_supply_pct: 0.0,
            details: json!({}),
            rug_checked: false,
            rug_passed: true,
            rug_risk_score: 0,
            rug_warnings: Vec::new(),
        }
    }
}

pub struct SignalProcessor {
    thresholds: SignalThresholds,
    stores: Stores,
    metadata: Arc<dyn TokenMetadataProvider>,
    risk: Arc<dyn RiskAssessor>,
}

impl SignalProcessor {
    pub fn new(
        thresholds: SignalThresholds,
        stores: Stores,
        metadata: Arc<dyn TokenMetadataProvider>,
        risk: Arc<dyn RiskAssessor>,
    ) -> Self {
        Self {
            thresholds,
            stores,
            metadata,
            risk,
        }
    }

    /// Record one buy event and evaluate all three trigger conditions.
    ///
    /// Unknown wallets are a silent no-op; a duplicate `tx_signature` reuses
    /// the stored trade and yields no signals, so ingress retries can never
    /// double-alert. All window queries are anchored on the event's
    /// `block_time`, which keeps replays deterministic.
    pub async fn process_buy_event(&self, event: &BuyEvent) -> Result<Vec<SignalResult>> {
        let Some(wallet) = self.stores.wallets.get(&event.wallet_address).await? else {
            tracing::debug!(wallet = %event.wallet_address, "unknown wallet, skipping event");
            metrics::counter!("pulse_events_ignored_total", "reason" => "unknown_wallet")
                .increment(1);
            return Ok(Vec::new());
        };
        if !wallet.is_active {
            tracing::debug!(wallet = %wallet.address, "wallet deactivated, skipping event");
            metrics::counter!("pulse_events_ignored_total", "reason" => "inactive_wallet")
                .increment(1);
            return Ok(Vec::new());
        }

        if self
            .stores
            .trades
            .get_by_signature(&event.tx_signature)
            .await?
            .is_some()
        {
            tracing::debug!(tx = %event.tx_signature, "duplicate signature, reusing trade");
            metrics::counter!("pulse_events_ignored_total", "reason" => "duplicate").increment(1);
            return Ok(Vec::new());
        }

        let token = self
            .stores
            .tokens
            .observe(
                &event.token_ca,
                event.market_cap_sol,
                event.total_supply,
                event.block_time,
            )
            .await?;

        let supply_pct = match event.total_supply {
            Some(supply) if supply > 0.0 => event.token_amount / supply * 100.0,
            _ => 0.0,
        };

        let trade = self
            .stores
            .trades
            .insert(NewTrade {
                wallet_address: wallet.address.clone(),
                token_ca: token.contract_address.clone(),
                tx_signature: event.tx_signature.clone(),
                side: TradeSide::Buy,
                sol_amount: event.sol_amount,
                token_amount: event.token_amount,
                supply_percentage: supply_pct,
                mcap_at_trade: event.market_cap_sol,
                block_time: event.block_time,
            })
            .await?;
        self.stores
            .wallets
            .touch_last_activity(&wallet.address, event.block_time)
            .await?;
        metrics::counter!("pulse_trades_recorded_total").increment(1);

        let mut signals = Vec::new();

        if let Some(signal) = self.check_high_conviction(&wallet, &trade, &token, supply_pct) {
            tracing::info!(
                wallet = %wallet.address,
                token = token.display_symbol(),
                supply_pct,
                sol = event.sol_amount,
                "high conviction buy"
            );
            metrics::counter!("pulse_signals_triggered_total", "kind" => "high_conviction")
                .increment(1);
            signals.push(signal);
        }

        if let Some(signal) = self.check_cluster(&token, event.block_time).await? {
            tracing::info!(
                token = token.display_symbol(),
                wallets = signal.wallets.len(),
                "cluster buy"
            );
            metrics::counter!("pulse_signals_triggered_total", "kind" => "cluster_buy")
                .increment(1);
            signals.push(signal);
        }

        // Volume spike only applies while the token is still new.
        if token.age_minutes(event.block_time) <= self.thresholds.new_token_max_age_minutes as f64
        {
            if let Some(signal) = self.check_volume_spike(&token, event.block_time).await? {
                tracing::info!(
                    token = token.display_symbol(),
                    ratio = signal.details["volume_ratio"].as_f64().unwrap_or(0.0),
                    "volume spike"
                );
                metrics::counter!("pulse_signals_triggered_total", "kind" => "volume_spike")
                    .increment(1);
                signals.push(signal);
            }
        }

        Ok(signals)
    }

    fn check_high_conviction(
        &self,
        wallet: &Wallet,
        trade: &Trade,
        token: &Token,
        supply_pct: f64,
    ) -> Option<SignalResult> {
        let triggered = trade.sol_amount >= self.thresholds.high_conviction_min_sol
            && supply_pct >= self.thresholds.high_conviction_min_supply_pct;
        if !triggered {
            return None;
        }

        let mut signal = SignalResult::new(SignalKind::HighConviction, token.clone());
        signal.total_sol = trade.sol_amount;
        signal.max_supply_pct = supply_pct;
        signal.details = json!({
            "wallet_address": wallet.address,
            "wallet_win_rate": wallet.win_rate,
            "sol_amount": trade.sol_amount,
            "supply_pct": supply_pct,
            "conviction_score": wallet.conviction_score,
        });
        signal.trades = vec![trade.clone()];
        signal.wallets = vec![wallet.clone()];
        Some(signal)
    }

    async fn check_cluster(
        &self,
        token: &Token,
        as_of: DateTime<Utc>,
    ) -> Result<Option<SignalResult>> {
        let from = as_of - Duration::minutes(self.thresholds.cluster_window_minutes);
        let window = self
            .stores
            .trades
            .buys_for_token_between(&token.contract_address, from, as_of)
            .await?;
        let qualifying: Vec<Trade> = window
            .into_iter()
            .filter(|t| t.sol_amount >= self.thresholds.cluster_min_sol)
            .collect();

        let mut addresses: Vec<String> = Vec::new();
        for trade in &qualifying {
            if !addresses.contains(&trade.wallet_address) {
                addresses.push(trade.wallet_address.clone());
            }
        }
        if addresses.len() < self.thresholds.cluster_min_wallets {
            return Ok(None);
        }

        let mut wallets = Vec::new();
        for address in &addresses {
            if let Some(w) = self.stores.wallets.get(address).await? {
                wallets.push(w);
            }
        }

        let total_sol: f64 = qualifying.iter().map(|t| t.sol_amount).sum();
        let max_supply_pct = qualifying
            .iter()
            .map(|t| t.supply_percentage)
            .fold(0.0, f64::max);
        let first_buy_at = qualifying.iter().map(|t| t.block_time).min().unwrap_or(as_of);
        let last_buy_at = qualifying.iter().map(|t| t.block_time).max().unwrap_or(as_of);
        let avg_win_rate = if wallets.is_empty() {
            0.0
        } else {
            wallets.iter().map(|w| w.win_rate).sum::<f64>() / wallets.len() as f64
        };

        self.stores
            .trades
            .insert_cluster_event(NewClusterEvent {
                token_ca: token.contract_address.clone(),
                wallet_addresses: addresses.clone(),
                total_sol,
                first_buy_at,
                last_buy_at,
                created_at: as_of,
            })
            .await?;

        let mut signal = SignalResult::new(SignalKind::ClusterBuy, token.clone());
        signal.total_sol = total_sol;
        signal.max_supply_pct = max_supply_pct;
        signal.details = json!({
            "wallet_count": addresses.len(),
            "wallet_addresses": addresses,
            "avg_win_rate": avg_win_rate,
            "window_minutes": self.thresholds.cluster_window_minutes,
        });
        signal.trades = qualifying;
        signal.wallets = wallets;
        Ok(Some(signal))
    }

    async fn check_volume_spike(
        &self,
        token: &Token,
        as_of: DateTime<Utc>,
    ) -> Result<Option<SignalResult>> {
        // No market cap means the ratio is undefined: not triggered.
        let market_cap = match token.market_cap_sol {
            Some(mcap) if mcap > 0.0 => mcap,
            _ => return Ok(None),
        };

        let from = as_of - Duration::minutes(VOLUME_WINDOW_MINUTES);
        let recent = self
            .stores
            .trades
            .buys_for_token_between(&token.contract_address, from, as_of)
            .await?;
        let volume: f64 = recent.iter().map(|t| t.sol_amount).sum();
        let ratio = volume / market_cap;
        if ratio < self.thresholds.volume_spike_threshold {
            return Ok(None);
        }

        let mut wallets: Vec<Wallet> = Vec::new();
        for trade in &recent {
            if wallets.iter().any(|w| w.address == trade.wallet_address) {
                continue;
            }
            if let Some(w) = self.stores.wallets.get(&trade.wallet_address).await? {
                wallets.push(w);
            }
        }

        let mut signal = SignalResult::new(SignalKind::VolumeSpike, token.clone());
        signal.total_sol = volume;
        signal.details = json!({
            "volume_5m_sol": volume,
            "market_cap_sol": market_cap,
            "volume_ratio": ratio,
            "threshold": self.thresholds.volume_spike_threshold,
            "token_age_mins": token.age_minutes(as_of),
        });
        signal.trades = recent;
        signal.wallets = wallets;
        Ok(Some(signal))
    }

    /// Attach fresh metadata and a rug check to a triggered signal.
    /// Best-effort: any failure logs and returns the signal unenriched, so a
    /// flaky collaborator can never drop a valid signal.
    pub async fn enrich_and_validate_signal(&self, mut signal: SignalResult) -> SignalResult {
        if let Err(e) = self.try_enrich(&mut signal).await {
            tracing::warn!(
                error = %e,
                token = %signal.token.contract_address,
                "enrichment failed, passing signal through unenriched"
            );
            metrics::counter!("pulse_enrichment_failures_total").increment(1);
        }
        signal
    }

    async fn try_enrich(&self, signal: &mut SignalResult) -> Result<()> {
        let ca = signal.token.contract_address.clone();
        let meta = self.metadata.get_token_metadata(&ca).await?;
        tracing::debug!(token = %meta.contract_address, "fresh metadata fetched");

        let patch = TokenPatch {
            name: meta.name.clone(),
            symbol: meta.symbol.clone(),
            decimals: (meta.decimals > 0).then_some(meta.decimals),
            market_cap_sol: (meta.market_cap_sol > 0.0).then_some(meta.market_cap_sol),
            liquidity_sol: (meta.liquidity_sol > 0.0).then_some(meta.liquidity_sol),
            total_supply: (meta.total_supply > 0.0).then_some(meta.total_supply),
        };
        self.stores.tokens.apply_patch(&ca, &patch).await?;
        if let Some(token) = self.stores.tokens.get(&ca).await? {
            signal.token = token;
        }

        let assessment = self.risk.check_token(&ca).await?;
        signal.rug_checked = true;
        signal.rug_passed = assessment.passed;
        signal.rug_risk_score = assessment.risk_score;
        signal.rug_warnings = assessment.warnings.clone();
        signal.details["rug_check"] = json!({
            "passed": assessment.passed,
            "risk_score": assessment.risk_score,
            "risk_level": assessment.risk_level.as_str(),
            "warnings": assessment.warnings.iter().take(3).collect::<Vec<_>>(),
        });

        if !assessment.passed {
            tracing::warn!(
                token = %assessment.contract_address,
                score = assessment.risk_score,
                "rug check failed"
            );
        }
        Ok(())
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Persist an alert snapshot of a signal. Returns `None` when the signal
    /// failed its rug check and suppression is on; the underlying Trade and
    /// ClusterEvent rows always remain, only the alert is suppressed.
    pub async fn create_alert(
        &self,
        signal: &SignalResult,
        skip_rug_failed: bool,
    ) -> Result<Option<common::model::Alert>> {
        if skip_rug_failed && signal.rug_checked && !signal.rug_passed {
            tracing::info!(
                token = %signal.token.contract_address,
                score = signal.rug_risk_score,
                "suppressing alert, rug check failed"
            );
            metrics::counter!("pulse_alerts_suppressed_total").increment(1);
            return Ok(None);
        }

        let wallet_data: Vec<WalletBrief> = signal
            .wallets
            .iter()
            .map(|w| WalletBrief {
                address: w.address.clone(),
                win_rate: w.win_rate,
                conviction_score: w.conviction_score,
            })
            .collect();

        let avg_win_rate = signal
            .details
            .get("avg_win_rate")
            .and_then(serde_json::Value::as_f64)
            .or_else(|| signal.wallets.first().map(|w| w.win_rate))
            .unwrap_or(0.0);

        let rug_check = signal.rug_checked.then(|| {
            json!({
                "passed": signal.rug_passed,
                "risk_score": signal.rug_risk_score,
                "warnings": signal.rug_warnings,
            })
        });

        // Alerts are timestamped at the triggering trade so replayed history
        // lines up with outcome checks and backtests.
        let created_at = signal
            .trades
            .iter()
            .map(|t| t.block_time)
            .max()
            .unwrap_or_else(Utc::now);

        let alert = self
            .stores
            .alerts
            .insert(NewAlert {
                token_ca: signal.token.contract_address.clone(),
                alert_type: signal.signal_type,
                trigger_data: json!({
                    "wallets": wallet_data,
                    "details": signal.details,
                    "rug_check": rug_check,
                }),
                total_sol_volume: signal.total_sol,
                wallet_count: signal.wallets.len() as u32,
                avg_win_rate,
                max_supply_pct: signal.max_supply_pct,
                created_at,
            })
            .await?;

        tracing::info!(
            alert_id = alert.id,
            kind = alert.alert_type.as_str(),
            token = %alert.token_ca,
            "alert created"
        );
        metrics::counter!("pulse_alerts_created_total", "kind" => signal.signal_type.as_str())
            .increment(1);
        Ok(Some(alert))
    }

    /// Undelivered alerts for the dispatcher, oldest first.
    pub async fn pending_alerts(&self, limit: usize) -> Result<Vec<common::model::Alert>> {
        self.stores.alerts.unsent(limit).await
    }

    /// One-way transition; called exactly once per delivered alert.
    pub async fn mark_alert_sent(&self, alert_id: i64) -> Result<()> {
        self.stores.alerts.mark_sent(alert_id, Utc::now()).await
    }
}
