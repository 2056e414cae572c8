//! Post-hoc alert classification: did the alerted token appreciate, dump,
//! or rug? Runs as a periodic cycle over a bounded batch of due alerts.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use common::config;
use common::model::{Alert, OutcomeStatus, SignalKind};
use common::store::{AlertStore, Stores};

use crate::enrichment::TokenMetadataProvider;

#[derive(Debug, Clone)]
pub struct OutcomeThresholds {
    pub min_age_minutes: i64,
    pub recheck_after_hours: i64,
    pub batch_size: usize,
    pub win_threshold_pct: f64,
    pub loss_threshold_pct: f64,
    pub rug_threshold_pct: f64,
}

impl Default for OutcomeThresholds {
    fn default() -> Self {
        Self {
            min_age_minutes: 30,
            recheck_after_hours: 4,
            batch_size: 50,
            win_threshold_pct: 20.0,
            loss_threshold_pct: -30.0,
            rug_threshold_pct: -80.0,
        }
    }
}

impl From<&config::Outcome> for OutcomeThresholds {
    fn from(cfg: &config::Outcome) -> Self {
        Self {
            min_age_minutes: cfg.min_age_minutes,
            recheck_after_hours: cfg.recheck_after_hours,
            batch_size: cfg.batch_size,
            win_threshold_pct: cfg.win_threshold_pct,
            loss_threshold_pct: cfg.loss_threshold_pct,
            rug_threshold_pct: cfg.rug_threshold_pct,
        }
    }
}

/// Classify a return against the fixed thresholds. Exactly one status
/// applies for any (return, age) pair; alerts younger than the minimum age
/// are always pending regardless of return.
pub fn classify(return_pct: f64, age_minutes: f64, t: &OutcomeThresholds) -> OutcomeStatus {
    if age_minutes < t.min_age_minutes as f64 {
        return OutcomeStatus::Pending;
    }
    if return_pct <= t.rug_threshold_pct {
        OutcomeStatus::Rugged
    } else if return_pct >= t.win_threshold_pct {
        OutcomeStatus::Winner
    } else if return_pct <= t.loss_threshold_pct {
        OutcomeStatus::Loser
    } else {
        OutcomeStatus::Pending
    }
}

#[derive(Debug, Clone)]
pub struct AlertOutcome {
    pub alert_id: i64,
    pub token_ca: String,
    pub status: OutcomeStatus,
    pub price_at_alert: f64,
    pub price_current: f64,
    pub return_pct: f64,
    pub alert_age_mins: f64,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct TypeWinRates {
    pub high_conviction: f64,
    pub cluster_buy: f64,
    pub volume_spike: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PerformanceStats {
    pub total_alerts: usize,
    pub winners: usize,
    pub losers: usize,
    pub rugged: usize,
    pub pending: usize,
    /// Percent of resolved (winner + loser) alerts that won.
    pub win_rate: f64,
    pub avg_winner_pct: f64,
    pub avg_loser_pct: f64,
    pub best_return_pct: f64,
    pub worst_return_pct: f64,
    pub by_type: TypeWinRates,
}

pub struct OutcomeTracker {
    stores: Stores,
    metadata: Arc<dyn TokenMetadataProvider>,
    thresholds: OutcomeThresholds,
}

impl OutcomeTracker {
    pub fn new(
        stores: Stores,
        metadata: Arc<dyn TokenMetadataProvider>,
        thresholds: OutcomeThresholds,
    ) -> Self {
        Self {
            stores,
            metadata,
            thresholds,
        }
    }

    /// Re-price one alert and persist its outcome. Flags the token as rugged
    /// on a severe drawdown; that flag never clears.
    pub async fn check_alert_outcome(
        &self,
        alert: &Alert,
        now: DateTime<Utc>,
    ) -> Result<AlertOutcome> {
        let token = self
            .stores
            .tokens
            .get(&alert.token_ca)
            .await?
            .with_context(|| format!("alert {} references unknown token", alert.id))?;
        let alert_age_mins = (now - alert.created_at).num_seconds() as f64 / 60.0;

        let meta = self.metadata.get_token_metadata(&token.contract_address).await?;
        let supply = if meta.total_supply > 0.0 {
            meta.total_supply
        } else {
            token.total_supply.unwrap_or(1.0)
        };
        let price_current = if meta.price_sol > 0.0 {
            meta.price_sol
        } else if meta.market_cap_sol > 0.0 && supply > 0.0 {
            meta.market_cap_sol / supply
        } else {
            0.0
        };

        // Entry price from the market cap observed on trades around alert
        // time; falls back to the current price (zero return).
        let around = self
            .stores
            .trades
            .mcap_observations(
                &token.contract_address,
                alert.created_at - Duration::minutes(1),
                alert.created_at + Duration::minutes(1),
            )
            .await?;
        let price_at_alert = around
            .first()
            .map(|(_, mcap)| mcap / supply)
            .filter(|p| *p > 0.0)
            .unwrap_or(price_current);

        let return_pct = if price_at_alert > 0.0 {
            (price_current - price_at_alert) / price_at_alert * 100.0
        } else {
            0.0
        };

        let status = classify(return_pct, alert_age_mins, &self.thresholds);
        if status == OutcomeStatus::Rugged {
            self.stores.tokens.mark_rugged(&token.contract_address).await?;
        }

        self.stores
            .alerts
            .record_outcome(alert.id, return_pct, now)
            .await?;

        let outcome = AlertOutcome {
            alert_id: alert.id,
            token_ca: token.contract_address,
            status,
            price_at_alert,
            price_current,
            return_pct,
            alert_age_mins,
            checked_at: now,
        };
        tracing::info!(
            alert_id = outcome.alert_id,
            token = %outcome.token_ca,
            status = outcome.status.as_str(),
            return_pct = outcome.return_pct,
            price_entry = outcome.price_at_alert,
            price_now = outcome.price_current,
            age_mins = outcome.alert_age_mins,
            checked_at = %outcome.checked_at,
            "alert outcome checked"
        );
        metrics::counter!("pulse_outcomes_checked_total", "status" => status.as_str())
            .increment(1);

        Ok(outcome)
    }

    /// Check every alert due for (re-)evaluation, up to the configured batch.
    /// Per-alert failures are logged and skipped.
    pub async fn check_pending_alerts(&self, now: DateTime<Utc>) -> Result<Vec<AlertOutcome>> {
        let created_before = now - Duration::minutes(self.thresholds.min_age_minutes);
        let rechecked_before = now - Duration::hours(self.thresholds.recheck_after_hours);
        let due = self
            .stores
            .alerts
            .due_for_outcome_check(created_before, rechecked_before, self.thresholds.batch_size)
            .await?;

        let mut outcomes = Vec::with_capacity(due.len());
        for alert in due {
            match self.check_alert_outcome(&alert, now).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    tracing::warn!(alert_id = alert.id, error = %e, "outcome check failed");
                }
            }
        }
        Ok(outcomes)
    }
}

/// Aggregate win rates over a trailing window. Only needs the alert store,
/// so the CLI can call it without wiring providers.
pub async fn performance_stats(
    alerts: &dyn AlertStore,
    thresholds: &OutcomeThresholds,
    days: i64,
    now: DateTime<Utc>,
) -> Result<PerformanceStats> {
    let rows = alerts.created_between(now - Duration::days(days), now).await?;
    let mut stats = PerformanceStats {
        total_alerts: rows.len(),
        ..PerformanceStats::default()
    };
    if rows.is_empty() {
        return Ok(stats);
    }

    let checked: Vec<&Alert> = rows.iter().filter(|a| a.outcome_pnl.is_some()).collect();
    stats.pending = rows.len() - checked.len();

    let mut winner_returns = Vec::new();
    let mut loser_returns = Vec::new();
    // (winners, resolved) per signal type
    let mut per_type: std::collections::BTreeMap<SignalKind, (usize, usize)> = Default::default();

    if !checked.is_empty() {
        stats.best_return_pct = checked
            .iter()
            .filter_map(|a| a.outcome_pnl)
            .fold(f64::MIN, f64::max);
        stats.worst_return_pct = checked
            .iter()
            .filter_map(|a| a.outcome_pnl)
            .fold(f64::MAX, f64::min);
    }

    for alert in &checked {
        let pnl = alert.outcome_pnl.unwrap_or(0.0);
        let entry = per_type.entry(alert.alert_type).or_default();
        if pnl <= thresholds.rug_threshold_pct {
            stats.rugged += 1;
        }
        if pnl >= thresholds.win_threshold_pct {
            stats.winners += 1;
            winner_returns.push(pnl);
            entry.0 += 1;
            entry.1 += 1;
        } else if pnl <= thresholds.loss_threshold_pct {
            stats.losers += 1;
            loser_returns.push(pnl);
            entry.1 += 1;
        } else {
            stats.pending += 1;
        }
    }

    let resolved = stats.winners + stats.losers;
    if resolved > 0 {
        stats.win_rate = stats.winners as f64 / resolved as f64 * 100.0;
    }
    if !winner_returns.is_empty() {
        stats.avg_winner_pct = winner_returns.iter().sum::<f64>() / winner_returns.len() as f64;
    }
    if !loser_returns.is_empty() {
        stats.avg_loser_pct = loser_returns.iter().sum::<f64>() / loser_returns.len() as f64;
    }

    let rate = |kind: SignalKind| -> f64 {
        match per_type.get(&kind) {
            Some((wins, resolved)) if *resolved > 0 => *wins as f64 / *resolved as f64 * 100.0,
            _ => 0.0,
        }
    };
    stats.by_type = TypeWinRates {
        high_conviction: rate(SignalKind::HighConviction),
        cluster_buy: rate(SignalKind::ClusterBuy),
        volume_spike: rate(SignalKind::VolumeSpike),
    };

    Ok(stats)
}

/// Plain-text performance report for the CLI.
pub fn render_report(stats: &PerformanceStats, days: i64) -> String {
    format!(
        "Performance report ({days}d)\n\
         \n\
         Overview:\n\
         - total alerts: {}\n\
         - winners: {} ({:.1}% of resolved)\n\
         - losers: {}\n\
         - rugged: {}\n\
         - pending: {}\n\
         \n\
         Returns:\n\
         - avg winner: {:+.1}%\n\
         - avg loser: {:+.1}%\n\
         - best: {:+.1}%\n\
         - worst: {:+.1}%\n\
         \n\
         By signal type (win rate over resolved):\n\
         - high conviction: {:.1}%\n\
         - cluster buy: {:.1}%\n\
         - volume spike: {:.1}%",
        stats.total_alerts,
        stats.winners,
        stats.win_rate,
        stats.losers,
        stats.rugged,
        stats.pending,
        stats.avg_winner_pct,
        stats.avg_loser_pct,
        stats.best_return_pct,
        stats.worst_return_pct,
        stats.by_type.high_conviction,
        stats.by_type.cluster_buy,
        stats.by_type.volume_spike,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::testing::StaticMetadata;
    use crate::enrichment::TokenMetadata;
    use chrono::TimeZone;
    use common::memstore::MemoryStore;
    use common::model::{NewAlert, NewTrade, TradeSide};

    fn ts(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(min)
    }

    fn t() -> OutcomeThresholds {
        OutcomeThresholds::default()
    }

    #[test]
    fn test_classification_is_a_strict_partition() {
        // For age >= 30 exactly one status applies at every return level.
        let cases = [
            (-100.0, OutcomeStatus::Rugged),
            (-80.0, OutcomeStatus::Rugged),
            (-79.9, OutcomeStatus::Loser),
            (-30.0, OutcomeStatus::Loser),
            (-29.9, OutcomeStatus::Pending),
            (0.0, OutcomeStatus::Pending),
            (19.9, OutcomeStatus::Pending),
            (20.0, OutcomeStatus::Winner),
            (500.0, OutcomeStatus::Winner),
        ];
        for (ret, expected) in cases {
            assert_eq!(classify(ret, 40.0, &t()), expected, "return {ret}");
        }
    }

    #[test]
    fn test_young_alerts_always_pending() {
        assert_eq!(classify(-95.0, 10.0, &t()), OutcomeStatus::Pending);
        assert_eq!(classify(400.0, 29.9, &t()), OutcomeStatus::Pending);
        assert_eq!(classify(400.0, 30.0, &t()), OutcomeStatus::Winner);
    }

    async fn seed_alert(stores: &Stores, token: &str, created_at: DateTime<Utc>) -> Alert {
        stores
            .alerts
            .insert(NewAlert {
                token_ca: token.to_string(),
                alert_type: SignalKind::HighConviction,
                trigger_data: serde_json::json!({}),
                total_sol_volume: 1.5,
                wallet_count: 1,
                avg_win_rate: 70.0,
                max_supply_pct: 0.8,
                created_at,
            })
            .await
            .unwrap()
    }

    async fn seed_entry_mcap(stores: &Stores, token: &str, mcap: f64, at: DateTime<Utc>) {
        stores
            .trades
            .insert(NewTrade {
                wallet_address: "W1".to_string(),
                token_ca: token.to_string(),
                tx_signature: format!("{token}-{at}"),
                side: TradeSide::Buy,
                sol_amount: 1.0,
                token_amount: 1000.0,
                supply_percentage: 0.1,
                mcap_at_trade: Some(mcap),
                block_time: at,
            })
            .await
            .unwrap();
    }

    fn tracker_with_price(stores: Stores, mcap_now: f64, supply: f64) -> OutcomeTracker {
        let metadata = StaticMetadata::new(TokenMetadata {
            total_supply: supply,
            market_cap_sol: mcap_now,
            price_sol: if supply > 0.0 { mcap_now / supply } else { 0.0 },
            ..TokenMetadata::default()
        });
        OutcomeTracker::new(stores, Arc::new(metadata), t())
    }

    #[tokio::test]
    async fn test_rugged_alert_flags_token() {
        // Alert created 40 minutes ago; mcap fell 100 -> 15: return -85%.
        let store = MemoryStore::new();
        let stores = store.stores();
        stores.tokens.observe("CA1", Some(100.0), Some(1e6), ts(0)).await.unwrap();
        seed_entry_mcap(&stores, "CA1", 100.0, ts(0)).await;
        let alert = seed_alert(&stores, "CA1", ts(0)).await;

        let tracker = tracker_with_price(stores.clone(), 15.0, 1e6);
        let outcome = tracker.check_alert_outcome(&alert, ts(40)).await.unwrap();

        assert_eq!(outcome.status, OutcomeStatus::Rugged);
        assert!((outcome.return_pct + 85.0).abs() < 1e-9);
        assert!(stores.tokens.get("CA1").await.unwrap().unwrap().is_rugged);

        let reloaded = stores.alerts.get(alert.id).await.unwrap().unwrap();
        assert!((reloaded.outcome_pnl.unwrap() + 85.0).abs() < 1e-9);
        assert_eq!(reloaded.outcome_checked_at, Some(ts(40)));
    }

    #[tokio::test]
    async fn test_winner_alert() {
        let store = MemoryStore::new();
        let stores = store.stores();
        stores.tokens.observe("CA1", Some(100.0), Some(1e6), ts(0)).await.unwrap();
        seed_entry_mcap(&stores, "CA1", 100.0, ts(0)).await;
        let alert = seed_alert(&stores, "CA1", ts(0)).await;

        let tracker = tracker_with_price(stores.clone(), 150.0, 1e6);
        let outcome = tracker.check_alert_outcome(&alert, ts(60)).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Winner);
        assert!((outcome.return_pct - 50.0).abs() < 1e-9);
        assert!(!stores.tokens.get("CA1").await.unwrap().unwrap().is_rugged);
    }

    #[tokio::test]
    async fn test_missing_entry_price_degrades_to_zero_return() {
        // No trade carried an mcap near alert time: entry falls back to the
        // current price and the alert stays pending.
        let store = MemoryStore::new();
        let stores = store.stores();
        stores.tokens.observe("CA1", Some(100.0), Some(1e6), ts(0)).await.unwrap();
        let alert = seed_alert(&stores, "CA1", ts(0)).await;

        let tracker = tracker_with_price(stores.clone(), 70.0, 1e6);
        let outcome = tracker.check_alert_outcome(&alert, ts(45)).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Pending);
        assert!(outcome.return_pct.abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_check_pending_selects_only_due_alerts() {
        let store = MemoryStore::new();
        let stores = store.stores();
        stores.tokens.observe("CA1", Some(100.0), Some(1e6), ts(0)).await.unwrap();
        seed_entry_mcap(&stores, "CA1", 100.0, ts(0)).await;

        let old = seed_alert(&stores, "CA1", ts(0)).await;
        let young = seed_alert(&stores, "CA1", ts(100)).await;

        let tracker = tracker_with_price(stores.clone(), 130.0, 1e6);
        let outcomes = tracker.check_pending_alerts(ts(110)).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].alert_id, old.id);

        // Second run inside the recheck window finds nothing.
        assert!(tracker.check_pending_alerts(ts(115)).await.unwrap().is_empty());

        // After the 4h recheck window both qualify.
        let outcomes = tracker.check_pending_alerts(ts(110 + 241)).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        let _ = young;
    }

    #[tokio::test]
    async fn test_batch_survives_bad_alert() {
        let store = MemoryStore::new();
        let stores = store.stores();
        stores.tokens.observe("CA1", Some(100.0), Some(1e6), ts(0)).await.unwrap();
        seed_entry_mcap(&stores, "CA1", 100.0, ts(0)).await;
        // Alert referencing a token that was never observed.
        seed_alert(&stores, "GHOST", ts(0)).await;
        let good = seed_alert(&stores, "CA1", ts(1)).await;

        let tracker = tracker_with_price(stores.clone(), 130.0, 1e6);
        let outcomes = tracker.check_pending_alerts(ts(60)).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].alert_id, good.id);
    }

    #[tokio::test]
    async fn test_performance_stats_partitions_and_rates() {
        let store = MemoryStore::new();
        let stores = store.stores();
        let mk = |kind: SignalKind, pnl: Option<f64>, at: DateTime<Utc>| {
            let stores = stores.clone();
            async move {
                let alert = stores
                    .alerts
                    .insert(NewAlert {
                        token_ca: "CA1".to_string(),
                        alert_type: kind,
                        trigger_data: serde_json::json!({}),
                        total_sol_volume: 1.0,
                        wallet_count: 1,
                        avg_win_rate: 70.0,
                        max_supply_pct: 0.5,
                        created_at: at,
                    })
                    .await
                    .unwrap();
                if let Some(pnl) = pnl {
                    stores.alerts.record_outcome(alert.id, pnl, at).await.unwrap();
                }
            }
        };

        mk(SignalKind::HighConviction, Some(45.0), ts(0)).await; // winner
        mk(SignalKind::HighConviction, Some(-40.0), ts(1)).await; // loser
        mk(SignalKind::ClusterBuy, Some(30.0), ts(2)).await; // winner
        mk(SignalKind::ClusterBuy, Some(-85.0), ts(3)).await; // rugged + loser
        mk(SignalKind::VolumeSpike, Some(5.0), ts(4)).await; // unresolved
        mk(SignalKind::VolumeSpike, None, ts(5)).await; // never checked

        let stats = performance_stats(stores.alerts.as_ref(), &t(), 7, ts(100))
            .await
            .unwrap();
        assert_eq!(stats.total_alerts, 6);
        assert_eq!(stats.winners, 2);
        assert_eq!(stats.losers, 2);
        assert_eq!(stats.rugged, 1);
        assert_eq!(stats.pending, 2);
        assert!((stats.win_rate - 50.0).abs() < 1e-9);
        assert!((stats.avg_winner_pct - 37.5).abs() < 1e-9);
        assert!((stats.avg_loser_pct + 62.5).abs() < 1e-9);
        assert!((stats.best_return_pct - 45.0).abs() < 1e-9);
        assert!((stats.worst_return_pct + 85.0).abs() < 1e-9);
        assert!((stats.by_type.high_conviction - 50.0).abs() < 1e-9);
        assert!((stats.by_type.cluster_buy - 50.0).abs() < 1e-9);
        assert!(stats.by_type.volume_spike.abs() < 1e-9);

        let report = render_report(&stats, 7);
        assert!(report.contains("total alerts: 6"));
        assert!(report.contains("high conviction: 50.0%"));
    }

    #[tokio::test]
    async fn test_performance_stats_empty_window() {
        let store = MemoryStore::new();
        let stores = store.stores();
        let stats = performance_stats(stores.alerts.as_ref(), &t(), 7, ts(0))
            .await
            .unwrap();
        assert_eq!(stats.total_alerts, 0);
        assert!(stats.win_rate.abs() < 1e-9);
    }
}
