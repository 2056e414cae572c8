use anyhow::Result;
use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub general: General,
    pub database: Database,
    pub tracking: Tracking,
    pub signals: Signals,
    pub outcome: Outcome,
    pub conviction: Conviction,
    pub alerts: Alerts,
    pub enrichment: Enrichment,
    pub observability: Observability,
}

#[derive(Debug, Deserialize)]
pub struct General {
    pub mode: String,
    pub log_level: String,
}

#[derive(Debug, Deserialize)]
pub struct Database {
    pub path: String,
}

/// Thresholds a wallet must meet to count as "smart" in reporting queries.
#[derive(Debug, Deserialize)]
pub struct Tracking {
    pub min_win_rate: f64,
    pub min_trades_7d: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Signals {
    pub high_conviction_min_sol: f64,
    pub high_conviction_min_supply_pct: f64,
    pub cluster_min_wallets: usize,
    pub cluster_window_minutes: i64,
    pub cluster_min_sol: f64,
    pub volume_spike_threshold: f64,
    pub new_token_max_age_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Outcome {
    pub check_interval_secs: u64,
    pub min_age_minutes: i64,
    pub recheck_after_hours: i64,
    pub batch_size: usize,
    pub win_threshold_pct: f64,
    pub loss_threshold_pct: f64,
    pub rug_threshold_pct: f64,
}

#[derive(Debug, Deserialize)]
pub struct Conviction {
    pub update_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct Alerts {
    pub dispatch_interval_secs: u64,
    pub dispatch_batch: usize,
    pub skip_rug_failed: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Enrichment {
    pub metadata_api_url: String,
    pub security_api_url: String,
    pub request_timeout_secs: u64,
    pub top_holders: usize,
}

#[derive(Debug, Deserialize)]
pub struct Observability {
    pub prometheus_port: u16,
}

impl Config {
    pub fn load() -> Result<Self> {
        let content = std::fs::read_to_string("config/default.toml")?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_toml_str(s)
    }
}
