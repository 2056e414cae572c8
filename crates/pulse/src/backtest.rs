//! Pure replay engine: runs historical alerts through a configurable
//! entry/exit simulation. No live side effects; reads stores only.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::Normal;
use std::collections::BTreeMap;

use common::model::{Alert, SignalKind};
use common::store::Stores;

/// Extra minutes of price history fetched past the exit deadline so the
/// around-deadline average has data on both sides.
const EXIT_SLACK_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStrategy {
    FixedTime,
    TakeProfit,
    StopLoss,
    TrailingStop,
}

#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub signal_types: Vec<SignalKind>,
    pub min_wallet_win_rate: f64,
    pub position_size_sol: f64,
    pub exit_strategy: ExitStrategy,
    pub exit_time_minutes: i64,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub trailing_stop_pct: f64,
    pub skip_rugged_tokens: bool,
}

impl BacktestConfig {
    /// Fixed-time config over the trailing `days`, all signal types.
    pub fn last_days(days: i64, now: DateTime<Utc>) -> Self {
        Self {
            start: now - Duration::days(days),
            end: now,
            signal_types: SignalKind::ALL.to_vec(),
            min_wallet_win_rate: 65.0,
            position_size_sol: 1.0,
            exit_strategy: ExitStrategy::FixedTime,
            exit_time_minutes: 60,
            take_profit_pct: 50.0,
            stop_loss_pct: -30.0,
            trailing_stop_pct: 20.0,
            skip_rugged_tokens: true,
        }
    }
}

/// Exit-price fallback when no trade history exists near the simulated exit.
/// Pluggable and seedable so backtests can be made deterministic; the exact
/// distribution is a modeling choice, not a contract.
pub trait ExitModel: Send {
    fn exit_multiplier(&mut self, token_rugged: bool) -> f64;
}

/// Default fallback: rugged tokens draw a uniform 0.1-0.5x haircut, others a
/// gaussian around a mildly positive multiple.
pub struct GaussianExitModel {
    rng: StdRng,
    normal: Normal,
}

impl GaussianExitModel {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            normal: Normal::new(1.2, 0.5).expect("gaussian parameters are fixed and valid"),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            normal: Normal::new(1.2, 0.5).expect("gaussian parameters are fixed and valid"),
        }
    }
}

impl ExitModel for GaussianExitModel {
    fn exit_multiplier(&mut self, token_rugged: bool) -> f64 {
        if token_rugged {
            self.rng.gen_range(0.1..0.5)
        } else {
            self.rng.sample(self.normal).max(0.1)
        }
    }
}

#[derive(Debug, Clone)]
pub struct BacktestTrade {
    pub token_ca: String,
    pub token_symbol: Option<String>,
    pub signal_type: SignalKind,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub entry_mcap: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_price: f64,
    pub exit_reason: &'static str,
    pub position_size_sol: f64,
    pub pnl_sol: f64,
    pub pnl_pct: f64,
    pub wallet_win_rate: f64,
    pub wallet_count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct TypeStats {
    pub trades: usize,
    pub win_rate: f64,
    pub avg_pnl_pct: f64,
    pub total_pnl_sol: f64,
}

#[derive(Debug, Default)]
pub struct BacktestResult {
    pub trades: Vec<BacktestTrade>,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_pnl_sol: f64,
    pub total_pnl_pct: f64,
    pub avg_pnl_pct: f64,
    pub best_trade_pct: f64,
    pub worst_trade_pct: f64,
    /// Peak-to-trough of cumulative PnL% across trades in entry order.
    pub max_drawdown_pct: f64,
    /// Gross profit over gross loss; infinite for a lossless run.
    pub profit_factor: f64,
    pub by_type: BTreeMap<SignalKind, TypeStats>,
}

pub struct Backtester {
    stores: Stores,
}

impl Backtester {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    pub async fn run_backtest(
        &self,
        config: &BacktestConfig,
        model: &mut dyn ExitModel,
    ) -> Result<BacktestResult> {
        let alerts = self
            .stores
            .alerts
            .created_between(config.start, config.end)
            .await?;
        let selected: Vec<Alert> = alerts
            .into_iter()
            .filter(|a| config.signal_types.contains(&a.alert_type))
            .collect();
        tracing::info!(
            alerts = selected.len(),
            from = %config.start,
            to = %config.end,
            "backtest started"
        );

        let mut trades = Vec::new();
        for alert in &selected {
            match self.simulate_trade(alert, config, model).await {
                Ok(Some(trade)) => trades.push(trade),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(alert_id = alert.id, error = %e, "trade simulation failed");
                }
            }
        }

        let result = compute_stats(trades);
        tracing::info!(
            trades = result.total_trades,
            win_rate = result.win_rate,
            total_pnl_sol = result.total_pnl_sol,
            "backtest complete"
        );
        Ok(result)
    }

    async fn simulate_trade(
        &self,
        alert: &Alert,
        config: &BacktestConfig,
        model: &mut dyn ExitModel,
    ) -> Result<Option<BacktestTrade>> {
        let Some(token) = self.stores.tokens.get(&alert.token_ca).await? else {
            return Ok(None);
        };
        if config.skip_rugged_tokens && token.is_rugged {
            return Ok(None);
        }
        if alert.avg_win_rate < config.min_wallet_win_rate {
            return Ok(None);
        }

        let supply = token.total_supply.filter(|s| *s > 0.0).unwrap_or(1.0);

        // Entry from the market cap observed at alert time; the token row
        // only has the latest snapshot.
        let around_entry = self
            .stores
            .trades
            .mcap_observations(
                &alert.token_ca,
                alert.created_at - Duration::minutes(1),
                alert.created_at + Duration::minutes(1),
            )
            .await?;
        let entry_mcap = around_entry
            .first()
            .map(|(_, mcap)| *mcap)
            .or(token.market_cap_sol)
            .unwrap_or(0.0);
        if entry_mcap <= 0.0 {
            return Ok(None);
        }
        let entry_price = entry_mcap / supply;

        let (exit_time, exit_price, exit_reason) = self
            .simulate_exit(alert, &token, entry_price, supply, config, model)
            .await?;

        let pnl_pct = (exit_price - entry_price) / entry_price * 100.0;
        let pnl_sol = config.position_size_sol * (pnl_pct / 100.0);

        Ok(Some(BacktestTrade {
            token_ca: alert.token_ca.clone(),
            token_symbol: token.symbol.clone(),
            signal_type: alert.alert_type,
            entry_time: alert.created_at,
            entry_price,
            entry_mcap,
            exit_time,
            exit_price,
            exit_reason,
            position_size_sol: config.position_size_sol,
            pnl_sol,
            pnl_pct,
            wallet_win_rate: alert.avg_win_rate,
            wallet_count: alert.wallet_count,
        }))
    }

    async fn simulate_exit(
        &self,
        alert: &Alert,
        token: &common::model::Token,
        entry_price: f64,
        supply: f64,
        config: &BacktestConfig,
        model: &mut dyn ExitModel,
    ) -> Result<(DateTime<Utc>, f64, &'static str)> {
        let deadline = alert.created_at + Duration::minutes(config.exit_time_minutes);
        let horizon = deadline + Duration::minutes(EXIT_SLACK_MINUTES);

        // Price path after entry, from observed trade market caps.
        let path: Vec<(DateTime<Utc>, f64)> = self
            .stores
            .trades
            .mcap_observations(&alert.token_ca, alert.created_at + Duration::seconds(1), horizon)
            .await?
            .into_iter()
            .map(|(at, mcap)| (at, mcap / supply))
            .collect();

        let at_deadline = |model: &mut dyn ExitModel| -> (DateTime<Utc>, f64, &'static str) {
            let window: Vec<f64> = path
                .iter()
                .filter(|(at, _)| {
                    *at >= deadline - Duration::minutes(EXIT_SLACK_MINUTES) && *at <= horizon
                })
                .map(|(_, p)| *p)
                .collect();
            if window.is_empty() {
                let multiplier = model.exit_multiplier(token.is_rugged);
                (deadline, entry_price * multiplier, "modeled")
            } else {
                let avg = window.iter().sum::<f64>() / window.len() as f64;
                (deadline, avg, "fixed_time")
            }
        };

        let exit = match config.exit_strategy {
            ExitStrategy::FixedTime => at_deadline(model),
            ExitStrategy::TakeProfit => {
                let target = entry_price * (1.0 + config.take_profit_pct / 100.0);
                match path
                    .iter()
                    .find(|(at, p)| *at <= deadline && *p >= target)
                {
                    Some((at, _)) => (*at, target, "take_profit"),
                    None => {
                        let (at, price, _) = at_deadline(model);
                        (at, price, "timeout")
                    }
                }
            }
            ExitStrategy::StopLoss => {
                let stop = entry_price * (1.0 + config.stop_loss_pct / 100.0);
                match path.iter().find(|(at, p)| *at <= deadline && *p <= stop) {
                    Some((at, _)) => (*at, stop, "stop_loss"),
                    None => {
                        let (at, price, _) = at_deadline(model);
                        (at, price, "timeout")
                    }
                }
            }
            ExitStrategy::TrailingStop => {
                let retain = 1.0 - config.trailing_stop_pct / 100.0;
                let mut peak = entry_price;
                let mut hit = None;
                for (at, price) in &path {
                    if *at > deadline {
                        break;
                    }
                    peak = peak.max(*price);
                    if *price <= peak * retain {
                        hit = Some((*at, *price, "trailing_stop"));
                        break;
                    }
                }
                match hit {
                    Some(exit) => exit,
                    None => {
                        let (at, price, _) = at_deadline(model);
                        (at, price, "timeout")
                    }
                }
            }
        };
        Ok(exit)
    }
}

/// Aggregate a list of simulated trades. Pure, so the math is testable
/// without stores.
pub fn compute_stats(trades: Vec<BacktestTrade>) -> BacktestResult {
    let mut result = BacktestResult {
        total_trades: trades.len(),
        ..BacktestResult::default()
    };
    if trades.is_empty() {
        result.trades = trades;
        return result;
    }

    result.winning_trades = trades.iter().filter(|t| t.pnl_pct > 0.0).count();
    result.losing_trades = result.total_trades - result.winning_trades;
    result.win_rate = result.winning_trades as f64 / result.total_trades as f64 * 100.0;

    result.total_pnl_sol = trades.iter().map(|t| t.pnl_sol).sum();
    result.total_pnl_pct = trades.iter().map(|t| t.pnl_pct).sum();
    result.avg_pnl_pct = result.total_pnl_pct / result.total_trades as f64;
    result.best_trade_pct = trades.iter().map(|t| t.pnl_pct).fold(f64::MIN, f64::max);
    result.worst_trade_pct = trades.iter().map(|t| t.pnl_pct).fold(f64::MAX, f64::min);

    let gross_profit: f64 = trades.iter().filter(|t| t.pnl_sol > 0.0).map(|t| t.pnl_sol).sum();
    let gross_loss: f64 = trades
        .iter()
        .filter(|t| t.pnl_sol < 0.0)
        .map(|t| t.pnl_sol.abs())
        .sum();
    result.profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    // Drawdown over cumulative PnL% in chronological order.
    let mut ordered: Vec<&BacktestTrade> = trades.iter().collect();
    ordered.sort_by_key(|t| t.entry_time);
    let mut cumulative = 0.0_f64;
    let mut peak = 0.0_f64;
    let mut max_dd = 0.0_f64;
    for trade in ordered {
        cumulative += trade.pnl_pct;
        peak = peak.max(cumulative);
        max_dd = max_dd.max(peak - cumulative);
    }
    result.max_drawdown_pct = max_dd;

    for trade in &trades {
        let entry = result.by_type.entry(trade.signal_type).or_default();
        entry.trades += 1;
        entry.total_pnl_sol += trade.pnl_sol;
        entry.avg_pnl_pct += trade.pnl_pct; // running sum, divided below
        if trade.pnl_pct > 0.0 {
            entry.win_rate += 1.0; // running count, divided below
        }
    }
    for stats in result.by_type.values_mut() {
        stats.avg_pnl_pct /= stats.trades as f64;
        stats.win_rate = stats.win_rate / stats.trades as f64 * 100.0;
    }

    result.trades = trades;
    result
}

/// Render a backtest summary for the CLI.
pub fn render_report(result: &BacktestResult, config: &BacktestConfig) -> String {
    let mut report = format!(
        "Backtest {} to {}\n\
         \n\
         Summary:\n\
         - trades: {} (winners {} / losers {})\n\
         - win rate: {:.1}%\n\
         \n\
         PnL:\n\
         - total: {:+.2} SOL ({:+.1}%)\n\
         - average: {:+.1}% per trade\n\
         - best: {:+.1}% | worst: {:+.1}%\n\
         \n\
         Risk:\n\
         - max drawdown: {:.1}%\n\
         - profit factor: {:.2}\n\
         \n\
         By signal type:\n",
        config.start.date_naive(),
        config.end.date_naive(),
        result.total_trades,
        result.winning_trades,
        result.losing_trades,
        result.win_rate,
        result.total_pnl_sol,
        result.total_pnl_pct,
        result.avg_pnl_pct,
        result.best_trade_pct,
        result.worst_trade_pct,
        result.max_drawdown_pct,
        result.profit_factor,
    );
    for (kind, stats) in &result.by_type {
        report.push_str(&format!(
            "- {}: {} trades, {:.0}% WR, {:.1}% avg, {:+.2} SOL\n",
            kind.as_str(),
            stats.trades,
            stats.win_rate,
            stats.avg_pnl_pct,
            stats.total_pnl_sol
        ));
    }

    report.push_str("\nTrades:\n");
    for t in result.trades.iter().take(20) {
        report.push_str(&format!(
            "- {} {} [{}] {} -> {} ({}): entry mcap {:.0}, {:.2e} -> {:.2e}, \
             size {:.2} SOL, pnl {:+.1}% ({:+.3} SOL), wr {:.0}% x{}\n",
            t.entry_time.format("%m-%d %H:%M"),
            t.token_symbol.as_deref().unwrap_or(&t.token_ca),
            t.signal_type.as_str(),
            t.entry_time.format("%H:%M"),
            t.exit_time.format("%H:%M"),
            t.exit_reason,
            t.entry_mcap,
            t.entry_price,
            t.exit_price,
            t.position_size_sol,
            t.pnl_pct,
            t.pnl_sol,
            t.wallet_win_rate,
            t.wallet_count,
        ));
    }
    if result.trades.len() > 20 {
        report.push_str(&format!("  ... and {} more\n", result.trades.len() - 20));
    }
    report
}
