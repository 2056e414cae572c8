use anyhow::Result;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

pub fn describe() {
    describe_counter!(
        "pulse_trades_recorded_total",
        "Buy trades recorded from tracked wallets."
    );
    describe_counter!(
        "pulse_events_ignored_total",
        "Buy events dropped before processing (unknown wallet, duplicate)."
    );
    describe_counter!(
        "pulse_signals_triggered_total",
        "Signals triggered, labeled by kind."
    );
    describe_counter!(
        "pulse_alerts_created_total",
        "Alerts persisted, labeled by kind."
    );
    describe_counter!(
        "pulse_alerts_suppressed_total",
        "Alerts suppressed by a failed rug check."
    );
    describe_counter!(
        "pulse_alerts_delivered_total",
        "Alerts accepted by the notification sink."
    );
    describe_counter!(
        "pulse_enrichment_failures_total",
        "Signals passed through unenriched after a collaborator failure."
    );
    describe_counter!(
        "pulse_outcomes_checked_total",
        "Alert outcome checks, labeled by resulting status."
    );
    describe_counter!(
        "pulse_conviction_updates_total",
        "Wallet conviction scores recomputed."
    );
    describe_counter!(
        "pulse_tracing_error_events",
        "ERROR-level log events."
    );
    describe_histogram!(
        "pulse_db_query_latency_ms",
        "SQLite query latency in milliseconds, labeled by op."
    );
    describe_counter!(
        "pulse_db_query_errors_total",
        "SQLite query errors, labeled by op."
    );
}

pub fn install_prometheus(port: u16) -> Result<PrometheusHandle> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    Ok(PrometheusBuilder::new()
        .with_http_listener(addr)
        .install_recorder()?)
}
