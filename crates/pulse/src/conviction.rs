//! Wallet reliability scoring. Six weighted components summing to a 0-100
//! conviction score; the scorer is the only writer of
//! `Wallet::conviction_score`.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};

use common::model::{Token, TradeSide, Wallet};
use common::store::Stores;

#[derive(Debug, Clone, Copy)]
pub struct ConvictionWeights {
    pub win_rate: f64,
    pub consistency: f64,
    pub frequency: f64,
    pub pnl: f64,
    pub early_entry: f64,
    pub rug_avoidance: f64,
}

impl Default for ConvictionWeights {
    fn default() -> Self {
        Self {
            win_rate: 30.0,
            consistency: 20.0,
            frequency: 15.0,
            pnl: 15.0,
            early_entry: 10.0,
            rug_avoidance: 10.0,
        }
    }
}

/// Inputs to one score computation, gathered from the wallet row and its
/// trade history.
#[derive(Debug, Clone)]
pub struct WalletMetrics {
    /// Win rate in percent (0-100).
    pub win_rate: f64,
    /// Buys in the trailing 7 days.
    pub trades_7d: u32,
    /// Lifetime realized PnL in SOL.
    pub pnl_total_sol: f64,
    /// Realized PnL per distinct token traded, in SOL.
    pub per_token_pnls: Vec<f64>,
    /// Percent of buys placed within 30 minutes of token launch.
    pub early_entry_rate: f64,
    /// Percent of distinct tokens traded that were never flagged rugged.
    pub rug_avoidance_rate: f64,
}

/// 50% win rate scores zero; 100% scores full weight, linear in between.
pub fn score_win_rate(win_rate: f64, w: &ConvictionWeights) -> f64 {
    if win_rate <= 50.0 {
        return 0.0;
    }
    ((win_rate - 50.0) / 50.0).min(1.0) * w.win_rate
}

/// Consistency on a 0-100 scale from the coefficient of variation of
/// per-token PnL. CV 0 scores 100, CV >= 2 scores 0. Fewer than three
/// distinct tokens is too small a sample: defaults to 50.
pub fn consistency_from_pnls(pnls: &[f64]) -> f64 {
    if pnls.len() < 3 {
        return 50.0;
    }
    let avg = pnls.iter().sum::<f64>() / pnls.len() as f64;
    if avg.abs() < f64::EPSILON {
        return 50.0;
    }
    let variance = pnls.iter().map(|p| (p - avg).powi(2)).sum::<f64>() / pnls.len() as f64;
    let cv = (variance.sqrt() / avg).abs();
    (100.0 - cv * 50.0).max(0.0)
}

pub fn score_consistency(consistency: f64, w: &ConvictionWeights) -> f64 {
    (consistency / 100.0).clamp(0.0, 1.0) * w.consistency
}

/// Ten buys inside the trailing week earn the full weight.
pub fn score_frequency(trades_7d: u32, w: &ConvictionWeights) -> f64 {
    (f64::from(trades_7d) / 10.0).min(1.0) * w.frequency
}

/// 100 SOL of lifetime profit earns the full weight; losses score zero.
pub fn score_pnl(pnl_total_sol: f64, w: &ConvictionWeights) -> f64 {
    if pnl_total_sol <= 0.0 {
        return 0.0;
    }
    (pnl_total_sol / 100.0).min(1.0) * w.pnl
}

/// Entering half of all positions within 30 minutes of launch earns the
/// full weight.
pub fn score_early_entry(early_entry_rate: f64, w: &ConvictionWeights) -> f64 {
    (early_entry_rate / 50.0).clamp(0.0, 1.0) * w.early_entry
}

/// Avoiding rugs half the time scores zero; a clean record earns the full
/// weight, linear in between.
pub fn score_rug_avoidance(avoidance_rate: f64, w: &ConvictionWeights) -> f64 {
    if avoidance_rate <= 50.0 {
        return 0.0;
    }
    ((avoidance_rate - 50.0) / 50.0).min(1.0) * w.rug_avoidance
}

/// Total score, clamped to [0, 100].
pub fn conviction_score(m: &WalletMetrics, w: &ConvictionWeights) -> f64 {
    let total = score_win_rate(m.win_rate, w)
        + score_consistency(consistency_from_pnls(&m.per_token_pnls), w)
        + score_frequency(m.trades_7d, w)
        + score_pnl(m.pnl_total_sol, w)
        + score_early_entry(m.early_entry_rate, w)
        + score_rug_avoidance(m.rug_avoidance_rate, w);
    total.clamp(0.0, 100.0)
}

pub struct ConvictionCalculator {
    stores: Stores,
    weights: ConvictionWeights,
}

impl ConvictionCalculator {
    pub fn new(stores: Stores) -> Self {
        Self {
            stores,
            weights: ConvictionWeights::default(),
        }
    }

    /// Gather score inputs from the wallet row and its trade history.
    pub async fn gather_metrics(
        &self,
        wallet: &Wallet,
        now: DateTime<Utc>,
    ) -> Result<WalletMetrics> {
        let trades = self.stores.trades.for_wallet(&wallet.address).await?;
        let week_ago = now - Duration::days(7);

        let buys: Vec<_> = trades
            .iter()
            .filter(|t| t.side == TradeSide::Buy)
            .collect();
        let trades_7d = buys
            .iter()
            .filter(|t| t.block_time >= week_ago)
            .count() as u32;

        // Token lookups are shared across the early-entry and rug-avoidance
        // passes.
        let mut tokens: HashMap<String, Option<Token>> = HashMap::new();
        for trade in &buys {
            if !tokens.contains_key(&trade.token_ca) {
                let token = self.stores.tokens.get(&trade.token_ca).await?;
                tokens.insert(trade.token_ca.clone(), token);
            }
        }

        let mut early_entries = 0_usize;
        for trade in &buys {
            let launched = tokens
                .get(&trade.token_ca)
                .and_then(|t| t.as_ref())
                .and_then(|t| t.launched_at);
            if let Some(launched) = launched {
                if (trade.block_time - launched).num_seconds() <= 30 * 60 {
                    early_entries += 1;
                }
            }
        }
        let early_entry_rate = if buys.is_empty() {
            0.0
        } else {
            early_entries as f64 / buys.len() as f64 * 100.0
        };

        let distinct: Vec<&String> = {
            let mut seen = Vec::new();
            for trade in &buys {
                if !seen.contains(&&trade.token_ca) {
                    seen.push(&trade.token_ca);
                }
            }
            seen
        };
        let rugged = distinct
            .iter()
            .filter(|ca| {
                tokens
                    .get(ca.as_str())
                    .and_then(|t| t.as_ref())
                    .is_some_and(|t| t.is_rugged)
            })
            .count();
        let rug_avoidance_rate = if distinct.is_empty() {
            100.0
        } else {
            (distinct.len() - rugged) as f64 / distinct.len() as f64 * 100.0
        };

        // Realized PnL per token: sells minus buys across the full history.
        let mut flows: BTreeMap<&str, (f64, f64)> = BTreeMap::new();
        for trade in &trades {
            let entry = flows.entry(trade.token_ca.as_str()).or_insert((0.0, 0.0));
            match trade.side {
                TradeSide::Buy => entry.0 += trade.sol_amount,
                TradeSide::Sell => entry.1 += trade.sol_amount,
            }
        }
        let per_token_pnls: Vec<f64> = flows.values().map(|(b, s)| s - b).collect();

        Ok(WalletMetrics {
            win_rate: wallet.win_rate,
            trades_7d,
            pnl_total_sol: wallet.pnl_total_sol,
            per_token_pnls,
            early_entry_rate,
            rug_avoidance_rate,
        })
    }

    pub async fn calculate_score(&self, wallet: &Wallet, now: DateTime<Utc>) -> Result<f64> {
        let metrics = self.gather_metrics(wallet, now).await?;
        let score = conviction_score(&metrics, &self.weights);
        tracing::debug!(
            wallet = %wallet.address,
            score,
            win_rate = metrics.win_rate,
            trades_7d = metrics.trades_7d,
            early_entry = metrics.early_entry_rate,
            rug_avoidance = metrics.rug_avoidance_rate,
            "conviction score computed"
        );
        Ok(score)
    }

    /// Recompute and persist the score for every active wallet. Per-wallet
    /// failures are logged and skipped; the batch always completes.
    pub async fn update_all_scores(&self, now: DateTime<Utc>) -> Result<usize> {
        let wallets = self.stores.wallets.list_active().await?;
        let mut updated = 0_usize;
        for wallet in wallets {
            match self.calculate_score(&wallet, now).await {
                Ok(score) => {
                    self.stores
                        .wallets
                        .set_conviction_score(&wallet.address, score)
                        .await?;
                    updated += 1;
                }
                Err(e) => {
                    tracing::warn!(wallet = %wallet.address, error = %e, "score update failed");
                }
            }
        }
        tracing::info!(updated, "conviction scores refreshed");
        metrics::counter!("pulse_conviction_updates_total").increment(updated as u64);
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common::memstore::MemoryStore;
    use common::model::{NewTrade, WalletSource};

    fn w() -> ConvictionWeights {
        ConvictionWeights::default()
    }

    #[test]
    fn test_win_rate_component() {
        assert!(score_win_rate(0.0, &w()).abs() < 1e-9);
        assert!(score_win_rate(50.0, &w()).abs() < 1e-9);
        assert!((score_win_rate(75.0, &w()) - 15.0).abs() < 1e-9);
        assert!((score_win_rate(100.0, &w()) - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_consistency_small_sample_defaults() {
        assert!((consistency_from_pnls(&[]) - 50.0).abs() < 1e-9);
        assert!((consistency_from_pnls(&[1.0, 2.0]) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_consistency_prefers_even_returns() {
        let steady = consistency_from_pnls(&[5.0, 5.0, 5.0, 5.0]);
        let lumpy = consistency_from_pnls(&[0.1, 0.1, 0.1, 40.0]);
        assert!((steady - 100.0).abs() < 1e-9);
        assert!(steady > lumpy);
    }

    #[test]
    fn test_consistency_extreme_cv_floors_at_zero() {
        // Mean near zero with large spread gives a huge CV.
        let score = consistency_from_pnls(&[-100.0, 100.0, 0.5]);
        assert!(score.abs() < 1e-9);
    }

    #[test]
    fn test_frequency_component_saturates() {
        assert!(score_frequency(0, &w()).abs() < 1e-9);
        assert!((score_frequency(5, &w()) - 7.5).abs() < 1e-9);
        assert!((score_frequency(10, &w()) - 15.0).abs() < 1e-9);
        assert!((score_frequency(100, &w()) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_pnl_component() {
        assert!(score_pnl(-5.0, &w()).abs() < 1e-9);
        assert!(score_pnl(0.0, &w()).abs() < 1e-9);
        assert!((score_pnl(50.0, &w()) - 7.5).abs() < 1e-9);
        assert!((score_pnl(1000.0, &w()) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_early_entry_component() {
        assert!(score_early_entry(0.0, &w()).abs() < 1e-9);
        assert!((score_early_entry(25.0, &w()) - 5.0).abs() < 1e-9);
        assert!((score_early_entry(50.0, &w()) - 10.0).abs() < 1e-9);
        assert!((score_early_entry(90.0, &w()) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_rug_avoidance_component() {
        assert!(score_rug_avoidance(30.0, &w()).abs() < 1e-9);
        assert!(score_rug_avoidance(50.0, &w()).abs() < 1e-9);
        assert!((score_rug_avoidance(75.0, &w()) - 5.0).abs() < 1e-9);
        assert!((score_rug_avoidance(100.0, &w()) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_score_bounded_for_arbitrary_metrics() {
        let cases = [
            WalletMetrics {
                win_rate: 0.0,
                trades_7d: 0,
                pnl_total_sol: -1000.0,
                per_token_pnls: vec![],
                early_entry_rate: 0.0,
                rug_avoidance_rate: 0.0,
            },
            WalletMetrics {
                win_rate: 100.0,
                trades_7d: u32::MAX,
                pnl_total_sol: f64::MAX / 2.0,
                per_token_pnls: vec![7.0; 50],
                early_entry_rate: 100.0,
                rug_avoidance_rate: 100.0,
            },
            WalletMetrics {
                win_rate: 150.0, // out-of-range input stays bounded
                trades_7d: 3,
                pnl_total_sol: 12.0,
                per_token_pnls: vec![-3.0, 8.0, 1.0],
                early_entry_rate: 200.0,
                rug_avoidance_rate: 120.0,
            },
        ];
        for m in cases {
            let score = conviction_score(&m, &w());
            assert!((0.0..=100.0).contains(&score), "score {score} out of range");
        }
    }

    #[test]
    fn test_zero_trade_wallet_scores_without_panicking() {
        let m = WalletMetrics {
            win_rate: 0.0,
            trades_7d: 0,
            pnl_total_sol: 0.0,
            per_token_pnls: vec![],
            early_entry_rate: 0.0,
            rug_avoidance_rate: 100.0,
        };
        // Frequency and pnl degrade to 0; consistency defaults to half
        // weight; the untouched rug record keeps its full weight.
        let score = conviction_score(&m, &w());
        assert!((score - 20.0).abs() < 1e-9);
    }

    fn ts(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(min)
    }

    async fn seed_trade(
        stores: &Stores,
        wallet: &str,
        token: &str,
        sig: &str,
        side: TradeSide,
        sol: f64,
        at: DateTime<Utc>,
    ) {
        stores
            .trades
            .insert(NewTrade {
                wallet_address: wallet.to_string(),
                token_ca: token.to_string(),
                tx_signature: sig.to_string(),
                side,
                sol_amount: sol,
                token_amount: 1000.0,
                supply_percentage: 0.1,
                mcap_at_trade: None,
                block_time: at,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_gather_metrics_from_history() {
        let store = MemoryStore::new();
        let stores = store.stores();
        let mut wallet = Wallet::new("W1", WalletSource::Gmgn, ts(-20000));
        wallet.win_rate = 80.0;
        wallet.pnl_total_sol = 40.0;
        stores.wallets.upsert(wallet.clone()).await.unwrap();

        // Tokens launch at their first observation.
        stores.tokens.observe("CA1", None, None, ts(0)).await.unwrap();
        stores.tokens.observe("CA2", None, None, ts(0)).await.unwrap();
        stores.tokens.observe("CA3", None, None, ts(0)).await.unwrap();
        stores.tokens.mark_rugged("CA3").await.unwrap();

        let now = ts(24 * 60);
        // CA1: early buy (10 min after launch), sold at a profit.
        seed_trade(&stores, "W1", "CA1", "b1", TradeSide::Buy, 2.0, ts(10)).await;
        seed_trade(&stores, "W1", "CA1", "s1", TradeSide::Sell, 5.0, ts(300)).await;
        // CA2: late buy (2h after launch), small loss.
        seed_trade(&stores, "W1", "CA2", "b2", TradeSide::Buy, 3.0, ts(120)).await;
        seed_trade(&stores, "W1", "CA2", "s2", TradeSide::Sell, 2.0, ts(400)).await;
        // CA3: late buy on the token that later rugged.
        seed_trade(&stores, "W1", "CA3", "b3", TradeSide::Buy, 1.0, ts(200)).await;

        let calc = ConvictionCalculator::new(stores);
        let metrics = calc.gather_metrics(&wallet, now).await.unwrap();

        assert_eq!(metrics.trades_7d, 3);
        assert!((metrics.early_entry_rate - 100.0 / 3.0).abs() < 1e-9);
        assert!((metrics.rug_avoidance_rate - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(metrics.per_token_pnls, vec![3.0, -1.0, -1.0]);
        assert!((metrics.win_rate - 80.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_update_all_scores_persists_and_counts() {
        let store = MemoryStore::new();
        let stores = store.stores();
        for (addr, win_rate) in [("W1", 90.0), ("W2", 40.0)] {
            let mut wallet = Wallet::new(addr, WalletSource::Manual, ts(0));
            wallet.win_rate = win_rate;
            wallet.trades_7d = 10;
            stores.wallets.upsert(wallet).await.unwrap();
        }
        let mut inactive = Wallet::new("W3", WalletSource::Manual, ts(0));
        inactive.is_active = false;
        stores.wallets.upsert(inactive).await.unwrap();

        let calc = ConvictionCalculator::new(stores.clone());
        let updated = calc.update_all_scores(ts(10)).await.unwrap();
        assert_eq!(updated, 2); // inactive wallet untouched

        let w1 = stores.wallets.get("W1").await.unwrap().unwrap();
        let w2 = stores.wallets.get("W2").await.unwrap().unwrap();
        assert!(w1.conviction_score > w2.conviction_score);
        assert!(w1.conviction_score > 0.0);
        let w3 = stores.wallets.get("W3").await.unwrap().unwrap();
        assert!(w3.conviction_score.abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_zero_trade_wallet_update_does_not_fail() {
        let store = MemoryStore::new();
        let stores = store.stores();
        stores
            .wallets
            .upsert(Wallet::new("W1", WalletSource::Manual, ts(0)))
            .await
            .unwrap();
        let calc = ConvictionCalculator::new(stores.clone());
        assert_eq!(calc.update_all_scores(ts(10)).await.unwrap(), 1);
        let w1 = stores.wallets.get("W1").await.unwrap().unwrap();
        assert!((0.0..=100.0).contains(&w1.conviction_score));
    }
}
