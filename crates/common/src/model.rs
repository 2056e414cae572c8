use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SignalKind {
    HighConviction,
    ClusterBuy,
    VolumeSpike,
}

impl SignalKind {
    pub const ALL: [Self; 3] = [Self::HighConviction, Self::ClusterBuy, Self::VolumeSpike];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HighConviction => "high_conviction",
            Self::ClusterBuy => "cluster_buy",
            Self::VolumeSpike => "volume_spike",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "high_conviction" => Some(Self::HighConviction),
            "cluster_buy" => Some(Self::ClusterBuy),
            "volume_spike" => Some(Self::VolumeSpike),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Pending,
    Winner,
    Loser,
    Rugged,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Winner => "winner",
            Self::Loser => "loser",
            Self::Rugged => "rugged",
        }
    }

    /// Terminal states never flip back to pending.
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletSource {
    Gmgn,
    Dexscreener,
    Manual,
}

impl WalletSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gmgn => "gmgn",
            Self::Dexscreener => "dexscreener",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gmgn" => Some(Self::Gmgn),
            "dexscreener" => Some(Self::Dexscreener),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// A tracked wallet with rolling performance metrics. The win_rate / pnl
/// fields are maintained by whatever discovers the wallet; conviction_score
/// is owned exclusively by the conviction calculator.
#[derive(Debug, Clone)]
pub struct Wallet {
    pub address: String,
    pub tag: Option<String>,
    pub source: WalletSource,
    pub win_rate: f64,
    pub total_trades: u32,
    pub trades_7d: u32,
    pub pnl_total_sol: f64,
    pub pnl_7d_sol: f64,
    pub conviction_score: f64,
    pub is_active: bool,
    pub last_activity: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(address: &str, source: WalletSource, discovered_at: DateTime<Utc>) -> Self {
        Self {
            address: address.to_string(),
            tag: None,
            source,
            win_rate: 0.0,
            total_trades: 0,
            trades_7d: 0,
            pnl_total_sol: 0.0,
            pnl_7d_sol: 0.0,
            conviction_score: 0.0,
            is_active: true,
            last_activity: None,
            discovered_at,
        }
    }

    pub fn meets_tracking_threshold(&self, min_win_rate: f64, min_trades_7d: u32) -> bool {
        self.win_rate >= min_win_rate && self.trades_7d >= min_trades_7d
    }
}

/// A token observed on a tracked wallet's trade. Created lazily on the first
/// trade; name/symbol stay empty until enrichment fills them in.
#[derive(Debug, Clone)]
pub struct Token {
    pub contract_address: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub decimals: u8,
    pub market_cap_sol: Option<f64>,
    pub liquidity_sol: Option<f64>,
    pub total_supply: Option<f64>,
    pub platform: String,
    pub launched_at: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
    pub is_rugged: bool,
}

impl Token {
    /// Age in minutes at `now`, or 0 when the launch time is unknown.
    pub fn age_minutes(&self, now: DateTime<Utc>) -> f64 {
        match self.launched_at {
            Some(launched) => (now - launched).num_seconds() as f64 / 60.0,
            None => 0.0,
        }
    }

    /// Spot price implied by market cap over supply, when both are known.
    pub fn price_sol(&self) -> Option<f64> {
        match (self.market_cap_sol, self.total_supply) {
            (Some(mcap), Some(supply)) if mcap > 0.0 && supply > 0.0 => Some(mcap / supply),
            _ => None,
        }
    }

    pub fn display_symbol(&self) -> &str {
        self.symbol.as_deref().unwrap_or("?")
    }
}

/// Immutable record of one observed buy/sell. `tx_signature` is the
/// idempotency key: replayed webhook deliveries never create a second row.
#[derive(Debug, Clone)]
pub struct Trade {
    pub id: i64,
    pub wallet_address: String,
    pub token_ca: String,
    pub tx_signature: String,
    pub side: TradeSide,
    pub sol_amount: f64,
    pub token_amount: f64,
    pub supply_percentage: f64,
    pub mcap_at_trade: Option<f64>,
    pub block_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTrade {
    pub wallet_address: String,
    pub token_ca: String,
    pub tx_signature: String,
    pub side: TradeSide,
    pub sol_amount: f64,
    pub token_amount: f64,
    pub supply_percentage: f64,
    pub mcap_at_trade: Option<f64>,
    pub block_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub id: i64,
    pub token_ca: String,
    pub alert_type: SignalKind,
    pub trigger_data: serde_json::Value,
    pub total_sol_volume: f64,
    pub wallet_count: u32,
    pub avg_win_rate: f64,
    pub max_supply_pct: f64,
    pub is_sent: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub outcome_pnl: Option<f64>,
    pub outcome_checked_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// Wallets captured in the trigger context at alert time.
    pub fn trigger_wallets(&self) -> Vec<WalletBrief> {
        self.trigger_data
            .get("wallets")
            .and_then(|w| serde_json::from_value(w.clone()).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct NewAlert {
    pub token_ca: String,
    pub alert_type: SignalKind,
    pub trigger_data: serde_json::Value,
    pub total_sol_volume: f64,
    pub wallet_count: u32,
    pub avg_win_rate: f64,
    pub max_supply_pct: f64,
    pub created_at: DateTime<Utc>,
}

/// Wallet snapshot serialized into an alert's trigger context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletBrief {
    pub address: String,
    pub win_rate: f64,
    pub conviction_score: f64,
}

/// Snapshot of a detected multi-wallet buy cluster. Immutable once written.
#[derive(Debug, Clone)]
pub struct ClusterEvent {
    pub id: i64,
    pub token_ca: String,
    pub wallet_addresses: Vec<String>,
    pub wallet_count: u32,
    pub total_sol: f64,
    pub first_buy_at: DateTime<Utc>,
    pub last_buy_at: DateTime<Utc>,
    pub window_seconds: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewClusterEvent {
    pub token_ca: String,
    pub wallet_addresses: Vec<String>,
    pub total_sol: f64,
    pub first_buy_at: DateTime<Utc>,
    pub last_buy_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl NewClusterEvent {
    pub fn window_seconds(&self) -> i64 {
        (self.last_buy_at - self.first_buy_at).num_seconds()
    }
}
