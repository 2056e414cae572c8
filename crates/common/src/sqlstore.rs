//! SQLite implementation of the repository traits, layered on [`AsyncDb`].

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::OptionalExtension;

use crate::db::AsyncDb;
use crate::model::{
    Alert, ClusterEvent, NewAlert, NewClusterEvent, NewTrade, SignalKind, Token, Trade, TradeSide,
    Wallet, WalletSource,
};
use crate::store::{AlertStore, TokenPatch, TokenStore, TradeStore, WalletStore};

#[derive(Clone)]
pub struct SqliteStores {
    db: AsyncDb,
}

impl SqliteStores {
    pub fn new(db: AsyncDb) -> Self {
        Self { db }
    }
}

/// Fixed-width RFC 3339 so lexicographic TEXT comparison matches time order.
fn ts_to_sql(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn sql_err(msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, msg.into())
}

fn get_ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| sql_err(format!("bad timestamp {s}: {e}")))
}

fn get_ts_opt(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| sql_err(format!("bad timestamp {s}: {e}")))
    })
    .transpose()
}

const WALLET_COLS: &str = "address, tag, source, win_rate, total_trades, trades_7d, \
     pnl_total_sol, pnl_7d_sol, conviction_score, is_active, last_activity, discovered_at";

fn wallet_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Wallet> {
    let source: String = row.get(2)?;
    Ok(Wallet {
        address: row.get(0)?,
        tag: row.get(1)?,
        source: WalletSource::parse(&source)
            .ok_or_else(|| sql_err(format!("bad wallet source {source}")))?,
        win_rate: row.get(3)?,
        total_trades: row.get(4)?,
        trades_7d: row.get(5)?,
        pnl_total_sol: row.get(6)?,
        pnl_7d_sol: row.get(7)?,
        conviction_score: row.get(8)?,
        is_active: row.get(9)?,
        last_activity: get_ts_opt(row, 10)?,
        discovered_at: get_ts(row, 11)?,
    })
}

const TOKEN_COLS: &str = "contract_address, name, symbol, decimals, market_cap_sol, \
     liquidity_sol, total_supply, platform, launched_at, discovered_at, is_rugged";

fn token_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Token> {
    Ok(Token {
        contract_address: row.get(0)?,
        name: row.get(1)?,
        symbol: row.get(2)?,
        decimals: row.get(3)?,
        market_cap_sol: row.get(4)?,
        liquidity_sol: row.get(5)?,
        total_supply: row.get(6)?,
        platform: row.get(7)?,
        launched_at: get_ts_opt(row, 8)?,
        discovered_at: get_ts(row, 9)?,
        is_rugged: row.get(10)?,
    })
}

const TRADE_COLS: &str = "id, wallet_address, token_ca, tx_signature, side, sol_amount, \
     token_amount, supply_percentage, mcap_at_trade, block_time";

fn trade_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trade> {
    let side: String = row.get(4)?;
    Ok(Trade {
        id: row.get(0)?,
        wallet_address: row.get(1)?,
        token_ca: row.get(2)?,
        tx_signature: row.get(3)?,
        side: TradeSide::parse(&side).ok_or_else(|| sql_err(format!("bad side {side}")))?,
        sol_amount: row.get(5)?,
        token_amount: row.get(6)?,
        supply_percentage: row.get(7)?,
        mcap_at_trade: row.get(8)?,
        block_time: get_ts(row, 9)?,
    })
}

const ALERT_COLS: &str = "id, token_ca, alert_type, trigger_data, total_sol_volume, \
     wallet_count, avg_win_rate, max_supply_pct, is_sent, sent_at, created_at, \
     outcome_pnl, outcome_checked_at";

fn alert_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Alert> {
    let alert_type: String = row.get(2)?;
    let trigger: Option<String> = row.get(3)?;
    Ok(Alert {
        id: row.get(0)?,
        token_ca: row.get(1)?,
        alert_type: SignalKind::parse(&alert_type)
            .ok_or_else(|| sql_err(format!("bad alert type {alert_type}")))?,
        trigger_data: trigger
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(serde_json::Value::Null),
        total_sol_volume: row.get(4)?,
        wallet_count: row.get(5)?,
        avg_win_rate: row.get(6)?,
        max_supply_pct: row.get(7)?,
        is_sent: row.get(8)?,
        sent_at: get_ts_opt(row, 9)?,
        created_at: get_ts(row, 10)?,
        outcome_pnl: row.get(11)?,
        outcome_checked_at: get_ts_opt(row, 12)?,
    })
}

#[async_trait]
impl WalletStore for SqliteStores {
    async fn get(&self, address: &str) -> Result<Option<Wallet>> {
        let address = address.to_string();
        self.db
            .call_named("wallets.get", move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {WALLET_COLS} FROM wallets WHERE address = ?1"),
                        rusqlite::params![address],
                        wallet_from_row,
                    )
                    .optional()?)
            })
            .await
    }

    async fn upsert(&self, wallet: Wallet) -> Result<()> {
        self.db
            .call_named("wallets.upsert", move |conn| {
                conn.execute(
                    "INSERT INTO wallets (address, tag, source, win_rate, total_trades,
                        trades_7d, pnl_total_sol, pnl_7d_sol, conviction_score, is_active,
                        last_activity, discovered_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT(address) DO UPDATE SET
                        tag = excluded.tag,
                        source = excluded.source,
                        win_rate = excluded.win_rate,
                        total_trades = excluded.total_trades,
                        trades_7d = excluded.trades_7d,
                        pnl_total_sol = excluded.pnl_total_sol,
                        pnl_7d_sol = excluded.pnl_7d_sol,
                        conviction_score = excluded.conviction_score,
                        is_active = excluded.is_active,
                        last_activity = excluded.last_activity",
                    rusqlite::params![
                        wallet.address,
                        wallet.tag,
                        wallet.source.as_str(),
                        wallet.win_rate,
                        wallet.total_trades,
                        wallet.trades_7d,
                        wallet.pnl_total_sol,
                        wallet.pnl_7d_sol,
                        wallet.conviction_score,
                        wallet.is_active,
                        wallet.last_activity.map(ts_to_sql),
                        ts_to_sql(wallet.discovered_at),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn list_active(&self) -> Result<Vec<Wallet>> {
        self.db
            .call_named("wallets.list_active", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {WALLET_COLS} FROM wallets
                     WHERE is_active = 1 ORDER BY conviction_score DESC, address ASC"
                ))?;
                let rows = stmt
                    .query_map([], wallet_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn set_conviction_score(&self, address: &str, score: f64) -> Result<()> {
        let address = address.to_string();
        self.db
            .call_named("wallets.set_conviction_score", move |conn| {
                conn.execute(
                    "UPDATE wallets SET conviction_score = ?2 WHERE address = ?1",
                    rusqlite::params![address, score],
                )?;
                Ok(())
            })
            .await
    }

    async fn touch_last_activity(&self, address: &str, at: DateTime<Utc>) -> Result<()> {
        let address = address.to_string();
        self.db
            .call_named("wallets.touch_last_activity", move |conn| {
                conn.execute(
                    "UPDATE wallets SET last_activity = ?2 WHERE address = ?1",
                    rusqlite::params![address, ts_to_sql(at)],
                )?;
                Ok(())
            })
            .await
    }

    async fn deactivate(&self, address: &str) -> Result<bool> {
        let address = address.to_string();
        self.db
            .call_named("wallets.deactivate", move |conn| {
                let changed = conn.execute(
                    "UPDATE wallets SET is_active = 0 WHERE address = ?1",
                    rusqlite::params![address],
                )?;
                Ok(changed > 0)
            })
            .await
    }
}

#[async_trait]
impl TokenStore for SqliteStores {
    async fn get(&self, contract_address: &str) -> Result<Option<Token>> {
        let ca = contract_address.to_string();
        self.db
            .call_named("tokens.get", move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {TOKEN_COLS} FROM tokens WHERE contract_address = ?1"),
                        rusqlite::params![ca],
                        token_from_row,
                    )
                    .optional()?)
            })
            .await
    }

    async fn observe(
        &self,
        contract_address: &str,
        market_cap_sol: Option<f64>,
        total_supply: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Token> {
        let ca = contract_address.to_string();
        self.db
            .call_named("tokens.observe", move |conn| {
                conn.execute(
                    "INSERT INTO tokens (contract_address, market_cap_sol, total_supply,
                        platform, launched_at, discovered_at)
                     VALUES (?1, ?2, ?3, 'unknown', ?4, ?4)
                     ON CONFLICT(contract_address) DO UPDATE SET
                        market_cap_sol = COALESCE(excluded.market_cap_sol, tokens.market_cap_sol),
                        total_supply = COALESCE(excluded.total_supply, tokens.total_supply)",
                    rusqlite::params![ca, market_cap_sol, total_supply, ts_to_sql(now)],
                )?;
                let token = conn.query_row(
                    &format!("SELECT {TOKEN_COLS} FROM tokens WHERE contract_address = ?1"),
                    rusqlite::params![ca],
                    token_from_row,
                )?;
                Ok(token)
            })
            .await
    }

    async fn apply_patch(&self, contract_address: &str, patch: &TokenPatch) -> Result<()> {
        let ca = contract_address.to_string();
        let patch = patch.clone();
        self.db
            .call_named("tokens.apply_patch", move |conn| {
                conn.execute(
                    "UPDATE tokens SET
                        name = COALESCE(?2, name),
                        symbol = COALESCE(?3, symbol),
                        decimals = COALESCE(?4, decimals),
                        market_cap_sol = COALESCE(?5, market_cap_sol),
                        liquidity_sol = COALESCE(?6, liquidity_sol),
                        total_supply = COALESCE(?7, total_supply)
                     WHERE contract_address = ?1",
                    rusqlite::params![
                        ca,
                        patch.name,
                        patch.symbol,
                        patch.decimals,
                        patch.market_cap_sol,
                        patch.liquidity_sol,
                        patch.total_supply,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn mark_rugged(&self, contract_address: &str) -> Result<()> {
        let ca = contract_address.to_string();
        self.db
            .call_named("tokens.mark_rugged", move |conn| {
                conn.execute(
                    "UPDATE tokens SET is_rugged = 1 WHERE contract_address = ?1",
                    rusqlite::params![ca],
                )?;
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl TradeStore for SqliteStores {
    async fn get_by_signature(&self, tx_signature: &str) -> Result<Option<Trade>> {
        let sig = tx_signature.to_string();
        self.db
            .call_named("trades.get_by_signature", move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {TRADE_COLS} FROM trades WHERE tx_signature = ?1"),
                        rusqlite::params![sig],
                        trade_from_row,
                    )
                    .optional()?)
            })
            .await
    }

    async fn insert(&self, trade: NewTrade) -> Result<Trade> {
        self.db
            .call_named("trades.insert", move |conn| {
                conn.execute(
                    "INSERT INTO trades (wallet_address, token_ca, tx_signature, side,
                        sol_amount, token_amount, supply_percentage, mcap_at_trade, block_time)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        trade.wallet_address,
                        trade.token_ca,
                        trade.tx_signature,
                        trade.side.as_str(),
                        trade.sol_amount,
                        trade.token_amount,
                        trade.supply_percentage,
                        trade.mcap_at_trade,
                        ts_to_sql(trade.block_time),
                    ],
                )?;
                let id = conn.last_insert_rowid();
                Ok(Trade {
                    id,
                    wallet_address: trade.wallet_address,
                    token_ca: trade.token_ca,
                    tx_signature: trade.tx_signature,
                    side: trade.side,
                    sol_amount: trade.sol_amount,
                    token_amount: trade.token_amount,
                    supply_percentage: trade.supply_percentage,
                    mcap_at_trade: trade.mcap_at_trade,
                    block_time: trade.block_time,
                })
            })
            .await
    }

    async fn buys_for_token_between(
        &self,
        token_ca: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Trade>> {
        let ca = token_ca.to_string();
        self.db
            .call_named("trades.buys_for_token_between", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TRADE_COLS} FROM trades
                     WHERE token_ca = ?1 AND side = 'BUY'
                       AND block_time >= ?2 AND block_time <= ?3
                     ORDER BY block_time ASC"
                ))?;
                let rows = stmt
                    .query_map(
                        rusqlite::params![ca, ts_to_sql(from), ts_to_sql(to)],
                        trade_from_row,
                    )?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn for_wallet(&self, wallet_address: &str) -> Result<Vec<Trade>> {
        let address = wallet_address.to_string();
        self.db
            .call_named("trades.for_wallet", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TRADE_COLS} FROM trades
                     WHERE wallet_address = ?1 ORDER BY block_time ASC"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![address], trade_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn mcap_observations(
        &self,
        token_ca: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, f64)>> {
        let ca = token_ca.to_string();
        self.db
            .call_named("trades.mcap_observations", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT block_time, mcap_at_trade FROM trades
                     WHERE token_ca = ?1 AND mcap_at_trade IS NOT NULL
                       AND block_time >= ?2 AND block_time <= ?3
                     ORDER BY block_time ASC",
                )?;
                let rows = stmt
                    .query_map(
                        rusqlite::params![ca, ts_to_sql(from), ts_to_sql(to)],
                        |row| Ok((get_ts(row, 0)?, row.get::<_, f64>(1)?)),
                    )?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn insert_cluster_event(&self, event: NewClusterEvent) -> Result<ClusterEvent> {
        self.db
            .call_named("trades.insert_cluster_event", move |conn| {
                let addresses = serde_json::to_string(&event.wallet_addresses)?;
                let window_seconds = event.window_seconds();
                conn.execute(
                    "INSERT INTO cluster_events (token_ca, wallet_addresses, wallet_count,
                        total_sol, first_buy_at, last_buy_at, window_seconds, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        event.token_ca,
                        addresses,
                        event.wallet_addresses.len() as i64,
                        event.total_sol,
                        ts_to_sql(event.first_buy_at),
                        ts_to_sql(event.last_buy_at),
                        window_seconds,
                        ts_to_sql(event.created_at),
                    ],
                )?;
                let id = conn.last_insert_rowid();
                Ok(ClusterEvent {
                    id,
                    token_ca: event.token_ca,
                    wallet_count: event.wallet_addresses.len() as u32,
                    wallet_addresses: event.wallet_addresses,
                    total_sol: event.total_sol,
                    first_buy_at: event.first_buy_at,
                    last_buy_at: event.last_buy_at,
                    window_seconds,
                    created_at: event.created_at,
                })
            })
            .await
    }
}

#[async_trait]
impl AlertStore for SqliteStores {
    async fn insert(&self, alert: NewAlert) -> Result<Alert> {
        self.db
            .call_named("alerts.insert", move |conn| {
                let trigger = serde_json::to_string(&alert.trigger_data)?;
                conn.execute(
                    "INSERT INTO alerts (token_ca, alert_type, trigger_data, total_sol_volume,
                        wallet_count, avg_win_rate, max_supply_pct, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        alert.token_ca,
                        alert.alert_type.as_str(),
                        trigger,
                        alert.total_sol_volume,
                        alert.wallet_count,
                        alert.avg_win_rate,
                        alert.max_supply_pct,
                        ts_to_sql(alert.created_at),
                    ],
                )?;
                let id = conn.last_insert_rowid();
                Ok(Alert {
                    id,
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
                })
            })
            .await
    }

    async fn get(&self, id: i64) -> Result<Option<Alert>> {
        self.db
            .call_named("alerts.get", move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {ALERT_COLS} FROM alerts WHERE id = ?1"),
                        rusqlite::params![id],
                        alert_from_row,
                    )
                    .optional()?)
            })
            .await
    }

    async fn unsent(&self, limit: usize) -> Result<Vec<Alert>> {
        self.db
            .call_named("alerts.unsent", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ALERT_COLS} FROM alerts
                     WHERE is_sent = 0 ORDER BY created_at ASC LIMIT ?1"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![limit as i64], alert_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn mark_sent(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        self.db
            .call_named("alerts.mark_sent", move |conn| {
                conn.execute(
                    "UPDATE alerts SET is_sent = 1, sent_at = ?2 WHERE id = ?1",
                    rusqlite::params![id, ts_to_sql(at)],
                )?;
                Ok(())
            })
            .await
    }

    async fn due_for_outcome_check(
        &self,
        created_before: DateTime<Utc>,
        rechecked_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Alert>> {
        self.db
            .call_named("alerts.due_for_outcome_check", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ALERT_COLS} FROM alerts
                     WHERE created_at <= ?1
                       AND (outcome_checked_at IS NULL OR outcome_checked_at <= ?2)
                     ORDER BY created_at ASC LIMIT ?3"
                ))?;
                let rows = stmt
                    .query_map(
                        rusqlite::params![
                            ts_to_sql(created_before),
                            ts_to_sql(rechecked_before),
                            limit as i64
                        ],
                        alert_from_row,
                    )?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn record_outcome(
        &self,
        id: i64,
        return_pct: f64,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        self.db
            .call_named("alerts.record_outcome", move |conn| {
                conn.execute(
                    "UPDATE alerts SET outcome_pnl = ?2, outcome_checked_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, return_pct, ts_to_sql(checked_at)],
                )?;
                Ok(())
            })
            .await
    }

    async fn created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Alert>> {
        self.db
            .call_named("alerts.created_between", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ALERT_COLS} FROM alerts
                     WHERE created_at >= ?1 AND created_at <= ?2
                     ORDER BY created_at ASC"
                ))?;
                let rows = stmt
                    .query_map(
                        rusqlite::params![ts_to_sql(from), ts_to_sql(to)],
                        alert_from_row,
                    )?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Alert>> {
        self.db
            .call_named("alerts.recent", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ALERT_COLS} FROM alerts ORDER BY created_at DESC LIMIT ?1"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![limit as i64], alert_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}
