use anyhow::Result;
use std::sync::Arc;

mod backtest;
mod cli;
mod conviction;
mod enrichment;
mod events;
mod metrics;
mod notify;
mod outcome;
mod processor;
mod scheduler;

use common::db::AsyncDb;
use common::sqlstore::SqliteStores;
use common::store::Stores;
use enrichment::{HttpMetadataProvider, HttpRiskAssessor, RiskAssessor, TokenMetadataProvider};

#[allow(clippy::too_many_lines)] // job wiring and worker loops
#[tokio::main]
async fn main() -> Result<()> {
    let config = common::config::Config::load()?;

    let dispatch = common::observability::build_dispatch(&config.general.log_level);
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;

    tracing::info!(mode = %config.general.mode, "pulse engine starting");

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let cmd = cli::parse_args(std::env::args()).map_err(anyhow::Error::msg)?;

    let db = AsyncDb::open(&config.database.path).await?;
    let sql = Arc::new(SqliteStores::new(db.clone()));
    let stores = Stores {
        wallets: sql.clone(),
        tokens: sql.clone(),
        trades: sql.clone(),
        alerts: sql,
    };

    // Admin commands run against the same stores and exit immediately.
    if cmd != cli::Command::Run {
        return cli::run_command(&stores, &config, cmd).await;
    }

    metrics::install_prometheus(config.observability.prometheus_port)?;
    metrics::describe();

    let timeout = std::time::Duration::from_secs(config.enrichment.request_timeout_secs);
    let metadata: Arc<dyn TokenMetadataProvider> = Arc::new(HttpMetadataProvider::new(
        &config.enrichment.metadata_api_url,
        timeout,
    )?);
    let risk: Arc<dyn RiskAssessor> = Arc::new(HttpRiskAssessor::new(
        &config.enrichment.security_api_url,
        timeout,
        metadata.clone(),
        config.enrichment.top_holders,
    )?);

    let signal_processor = Arc::new(processor::SignalProcessor::new(
        (&config.signals).into(),
        stores.clone(),
        metadata.clone(),
        risk,
    ));
    let skip_rug_failed = config.alerts.skip_rug_failed;

    // Replay mode: pump the piped event history through the pipeline and
    // exit. No background cycles, no delivery.
    if config.general.mode == "replay" {
        let summary = events::run_stdin_ingest(&signal_processor, skip_rug_failed).await?;
        println!(
            "replayed {} events ({} skipped): {} signals, {} alerts",
            summary.events, summary.skipped, summary.signals, summary.alerts
        );
        return Ok(());
    }

    let outcome_tracker = Arc::new(outcome::OutcomeTracker::new(
        stores.clone(),
        metadata.clone(),
        (&config.outcome).into(),
    ));
    let conviction_calc = Arc::new(conviction::ConvictionCalculator::new(stores.clone()));
    let sink: Arc<dyn notify::NotificationSink> = Arc::new(notify::LogSink);

    let (outcome_tx, mut outcome_rx) = tokio::sync::mpsc::channel::<()>(8);
    let (conviction_tx, mut conviction_rx) = tokio::sync::mpsc::channel::<()>(8);
    let (dispatch_tx, mut dispatch_rx) = tokio::sync::mpsc::channel::<()>(8);
    let (wal_tx, mut wal_rx) = tokio::sync::mpsc::channel::<()>(8);

    // Workers are spawned before the scheduler so immediate ticks land.
    tokio::spawn({
        let tracker = outcome_tracker.clone();
        async move {
            while outcome_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = "outcome_check");
                let _g = span.enter();
                match tracker.check_pending_alerts(chrono::Utc::now()).await {
                    Ok(outcomes) => tracing::info!(checked = outcomes.len(), "outcome_check done"),
                    Err(e) => tracing::error!(error = %e, "outcome_check failed"),
                }
            }
        }
    });

    tokio::spawn({
        let calc = conviction_calc.clone();
        async move {
            while conviction_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = "conviction_update");
                let _g = span.enter();
                match calc.update_all_scores(chrono::Utc::now()).await {
                    Ok(updated) => tracing::info!(updated, "conviction_update done"),
                    Err(e) => tracing::error!(error = %e, "conviction_update failed"),
                }
            }
        }
    });

    tokio::spawn({
        let processor = signal_processor.clone();
        let sink = sink.clone();
        let batch = config.alerts.dispatch_batch;
        async move {
            while dispatch_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = "alert_dispatch");
                let _g = span.enter();
                match notify::dispatch_unsent(processor.as_ref(), sink.as_ref(), batch).await {
                    Ok(0) => {}
                    Ok(delivered) => tracing::info!(delivered, "alert_dispatch done"),
                    Err(e) => tracing::error!(error = %e, "alert_dispatch failed"),
                }
            }
        }
    });

    tokio::spawn({
        let db = db.clone();
        async move {
            while wal_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = "wal_checkpoint");
                let _g = span.enter();
                match db.wal_checkpoint().await {
                    Ok((log, checkpointed)) => {
                        tracing::info!(log, checkpointed, "wal_checkpoint done");
                    }
                    Err(e) => tracing::error!(error = %e, "wal_checkpoint failed"),
                }
            }
        }
    });

    let _scheduler_handles = scheduler::start(vec![
        scheduler::JobSpec {
            name: "outcome_check".to_string(),
            interval: std::time::Duration::from_secs(config.outcome.check_interval_secs),
            tick: outcome_tx,
            run_immediately: true,
        },
        scheduler::JobSpec {
            name: "conviction_update".to_string(),
            interval: std::time::Duration::from_secs(config.conviction.update_interval_secs),
            tick: conviction_tx,
            run_immediately: true,
        },
        scheduler::JobSpec {
            name: "alert_dispatch".to_string(),
            interval: std::time::Duration::from_secs(config.alerts.dispatch_interval_secs),
            tick: dispatch_tx,
            run_immediately: true,
        },
        scheduler::JobSpec {
            name: "wal_checkpoint".to_string(),
            interval: std::time::Duration::from_secs(300),
            tick: wal_tx,
            run_immediately: false,
        },
    ]);
    tracing::info!("worker loops and scheduler started");

    // Live intake: the ingress pipes parsed buy events into stdin. EOF just
    // means the feed went away; background cycles keep running.
    tokio::spawn({
        let signal_processor = signal_processor.clone();
        async move {
            match events::run_stdin_ingest(&signal_processor, skip_rug_failed).await {
                Ok(summary) => tracing::info!(events = summary.events, "event feed closed"),
                Err(e) => tracing::error!(error = %e, "event feed failed"),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down (force exit in 5s)");

    // In-flight enrichment or outcome checks are safe to abandon: all writes
    // are append-only or single-field updates.
    tokio::spawn(async {
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        tracing::warn!("force exit after timeout");
        std::process::exit(0);
    });

    Ok(())
}
