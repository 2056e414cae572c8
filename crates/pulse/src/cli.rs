use anyhow::Result;
use chrono::Utc;

use common::config::Config;
use common::model::{Wallet, WalletSource};
use common::store::Stores;

use crate::backtest::{render_report, BacktestConfig, Backtester, GaussianExitModel};
use crate::outcome::{performance_stats, OutcomeThresholds};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run,
    Wallets,
    Wallet { address: String },
    AddWallet { address: String, tag: Option<String> },
    RemoveWallet { address: String },
    Alerts,
    Stats { days: i64 },
    Backtest { days: i64 },
}

pub fn parse_args<I>(mut args: I) -> std::result::Result<Command, String>
where
    I: Iterator<Item = String>,
{
    // Drop argv[0].
    let _ = args.next();

    let Some(cmd) = args.next() else {
        return Ok(Command::Run);
    };

    let parse_days = |arg: Option<String>| -> std::result::Result<i64, String> {
        match arg {
            None => Ok(7),
            Some(s) => s.parse().map_err(|_| format!("bad day count: {s}")),
        }
    };

    match cmd.as_str() {
        "run" => Ok(Command::Run),
        "wallets" => Ok(Command::Wallets),
        "wallet" => {
            let address = args
                .next()
                .ok_or_else(|| "usage: pulse wallet <address>".to_string())?;
            Ok(Command::Wallet { address })
        }
        "add-wallet" => {
            let address = args
                .next()
                .ok_or_else(|| "usage: pulse add-wallet <address> [tag]".to_string())?;
            Ok(Command::AddWallet {
                address,
                tag: args.next(),
            })
        }
        "remove-wallet" => {
            let address = args
                .next()
                .ok_or_else(|| "usage: pulse remove-wallet <address>".to_string())?;
            Ok(Command::RemoveWallet { address })
        }
        "alerts" => Ok(Command::Alerts),
        "stats" => Ok(Command::Stats {
            days: parse_days(args.next())?,
        }),
        "backtest" => Ok(Command::Backtest {
            days: parse_days(args.next())?,
        }),
        other => Err(format!("unknown command: {other}")),
    }
}

pub async fn run_command(stores: &Stores, config: &Config, cmd: Command) -> Result<()> {
    match cmd {
        Command::Run => Ok(()),
        Command::Wallets => show_wallets(stores, config).await,
        Command::Wallet { address } => show_wallet(stores, &address).await,
        Command::AddWallet { address, tag } => add_wallet(stores, &address, tag).await,
        Command::RemoveWallet { address } => remove_wallet(stores, &address).await,
        Command::Alerts => show_alerts(stores).await,
        Command::Stats { days } => show_stats(stores, config, days).await,
        Command::Backtest { days } => run_backtest(stores, days).await,
    }
}

async fn show_wallets(stores: &Stores, config: &Config) -> Result<()> {
    println!("Tracked wallets (active, by conviction; * meets smart threshold):");
    for w in stores.wallets.list_active().await? {
        let smart = w.meets_tracking_threshold(
            config.tracking.min_win_rate,
            config.tracking.min_trades_7d,
        );
        println!(
            "{}{:>6.1}  wr={:>5.1}%  7d={:>3}  src={}  {}{}",
            if smart { "*" } else { " " },
            w.conviction_score,
            w.win_rate,
            w.trades_7d,
            w.source.as_str(),
            w.address,
            w.tag.as_deref().map(|t| format!("  ({t})")).unwrap_or_default(),
        );
    }
    Ok(())
}

async fn show_wallet(stores: &Stores, address: &str) -> Result<()> {
    println!("Wallet: {address}");
    match stores.wallets.get(address).await? {
        Some(w) => {
            println!(
                "  source={}  active={}  win_rate={:.1}%  conviction={:.1}",
                w.source.as_str(),
                w.is_active,
                w.win_rate,
                w.conviction_score
            );
            println!(
                "  pnl_total={:.2} SOL  trades_7d={}  last_activity={:?}",
                w.pnl_total_sol, w.trades_7d, w.last_activity
            );
        }
        None => println!("  (not tracked)"),
    }
    let trades = stores.trades.for_wallet(address).await?;
    println!("  recorded trades: {}", trades.len());
    Ok(())
}

async fn add_wallet(stores: &Stores, address: &str, tag: Option<String>) -> Result<()> {
    let mut wallet = Wallet::new(address, WalletSource::Manual, Utc::now());
    wallet.tag = tag;
    stores.wallets.upsert(wallet).await?;
    println!("tracking {address}");
    Ok(())
}

async fn remove_wallet(stores: &Stores, address: &str) -> Result<()> {
    if stores.wallets.deactivate(address).await? {
        println!("deactivated {address}");
    } else {
        println!("{address} was not tracked");
    }
    Ok(())
}

async fn show_alerts(stores: &Stores) -> Result<()> {
    println!("Recent alerts:");
    for a in stores.alerts.recent(20).await? {
        println!(
            "#{:<5} {}  {:<15} {}  sol={:.2}  wallets={}  sent={}  outcome={}",
            a.id,
            a.created_at.format("%m-%d %H:%M"),
            a.alert_type.as_str(),
            a.token_ca,
            a.total_sol_volume,
            a.wallet_count,
            a.is_sent,
            a.outcome_pnl
                .map(|p| format!("{p:+.1}%"))
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    Ok(())
}

async fn show_stats(stores: &Stores, config: &Config, days: i64) -> Result<()> {
    let thresholds = OutcomeThresholds::from(&config.outcome);
    let stats = performance_stats(stores.alerts.as_ref(), &thresholds, days, Utc::now()).await?;
    println!("{}", crate::outcome::render_report(&stats, days));
    Ok(())
}

async fn run_backtest(stores: &Stores, days: i64) -> Result<()> {
    let config = BacktestConfig::last_days(days, Utc::now());
    let backtester = Backtester::new(stores.clone());
    let mut model = GaussianExitModel::from_entropy();
    let result = backtester.run_backtest(&config, &mut model).await?;
    println!("{}", render_report(&result, &config));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> impl Iterator<Item = String> {
        std::iter::once("pulse".to_string())
            .chain(parts.iter().map(|s| (*s).to_string()))
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn test_no_args_defaults_to_run() {
        assert_eq!(parse_args(argv(&[])).unwrap(), Command::Run);
    }

    #[test]
    fn test_parse_wallet_commands() {
        assert_eq!(parse_args(argv(&["wallets"])).unwrap(), Command::Wallets);
        assert_eq!(
            parse_args(argv(&["wallet", "W1"])).unwrap(),
            Command::Wallet {
                address: "W1".to_string()
            }
        );
        assert_eq!(
            parse_args(argv(&["add-wallet", "W1", "Whale_001"])).unwrap(),
            Command::AddWallet {
                address: "W1".to_string(),
                tag: Some("Whale_001".to_string())
            }
        );
        assert!(parse_args(argv(&["wallet"])).is_err());
    }

    #[test]
    fn test_parse_days_arguments() {
        assert_eq!(parse_args(argv(&["stats"])).unwrap(), Command::Stats { days: 7 });
        assert_eq!(
            parse_args(argv(&["backtest", "30"])).unwrap(),
            Command::Backtest { days: 30 }
        );
        assert!(parse_args(argv(&["backtest", "soon"])).is_err());
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(parse_args(argv(&["explode"])).is_err());
    }

    #[tokio::test]
    async fn test_add_then_remove_wallet_round_trip() {
        let store = common::memstore::MemoryStore::new();
        let stores = store.stores();
        add_wallet(&stores, "W1", Some("Whale_001".to_string())).await.unwrap();

        let w = stores.wallets.get("W1").await.unwrap().unwrap();
        assert_eq!(w.source, WalletSource::Manual);
        assert_eq!(w.tag.as_deref(), Some("Whale_001"));
        assert!(w.is_active);

        remove_wallet(&stores, "W1").await.unwrap();
        assert!(!stores.wallets.get("W1").await.unwrap().unwrap().is_active);
    }
}
