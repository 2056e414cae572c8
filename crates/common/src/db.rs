use anyhow::Result;

/// Async wrapper around `tokio_rusqlite::Connection`.
///
/// All SQLite work runs on a dedicated background thread, keeping the Tokio
/// runtime cooperative. Clone is cheap (shared sender to that thread).
#[derive(Clone)]
pub struct AsyncDb {
    conn: tokio_rusqlite::Connection,
}

impl AsyncDb {
    /// Open a database at `path`, set PRAGMAs (WAL, foreign keys,
    /// busy_timeout) and apply the schema. The schema batch is idempotent so
    /// reopening an existing file is a no-op.
    pub async fn open(path: &str) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open(path).await?;
        conn.call(|conn| -> std::result::Result<(), rusqlite::Error> {
            conn.busy_timeout(std::time::Duration::from_secs(30))?;
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(|e| anyhow::anyhow!("AsyncDb::open: {e}"))?;
        Ok(Self { conn })
    }

    /// Run a closure on the background SQLite thread and return the result.
    pub async fn call<F, R>(&self, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn.call(move |conn| function(conn)).await.map_err(
            |e: tokio_rusqlite::Error<anyhow::Error>| match e {
                tokio_rusqlite::Error::ConnectionClosed => {
                    anyhow::anyhow!("database connection closed")
                }
                tokio_rusqlite::Error::Close((_, err)) => {
                    anyhow::anyhow!("database close error: {err}")
                }
                tokio_rusqlite::Error::Error(err) => err,
                other => anyhow::anyhow!("database error: {other}"),
            },
        )
    }

    /// Like [`Self::call`], but records query latency and error metrics.
    /// Measures full wall-clock time including queueing on the SQLite thread.
    pub async fn call_named<F, R>(&self, op: &'static str, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let start = std::time::Instant::now();
        let res = self.call(function).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;

        let status = if res.is_ok() { "ok" } else { "err" };
        metrics::histogram!("pulse_db_query_latency_ms", "op" => op, "status" => status)
            .record(ms);
        if res.is_err() {
            metrics::counter!("pulse_db_query_errors_total", "op" => op).increment(1);
        }

        res
    }

    /// WAL checkpoint; returns (log frames, checkpointed frames).
    pub async fn wal_checkpoint(&self) -> Result<(i64, i64)> {
        self.call_named("wal_checkpoint", |conn| {
            let row = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
            })?;
            Ok(row)
        })
        .await
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS wallets (
    address TEXT PRIMARY KEY,
    tag TEXT,
    source TEXT NOT NULL,                  -- gmgn, dexscreener, manual
    win_rate REAL NOT NULL DEFAULT 0.0,    -- 0-100
    total_trades INTEGER NOT NULL DEFAULT 0,
    trades_7d INTEGER NOT NULL DEFAULT 0,
    pnl_total_sol REAL NOT NULL DEFAULT 0.0,
    pnl_7d_sol REAL NOT NULL DEFAULT 0.0,
    conviction_score REAL NOT NULL DEFAULT 0.0,  -- 0-100, owned by the scorer
    is_active INTEGER NOT NULL DEFAULT 1,
    last_activity TEXT,
    discovered_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tokens (
    contract_address TEXT PRIMARY KEY,
    name TEXT,
    symbol TEXT,
    decimals INTEGER NOT NULL DEFAULT 9,
    market_cap_sol REAL,
    liquidity_sol REAL,
    total_supply REAL,
    platform TEXT NOT NULL DEFAULT 'unknown',
    launched_at TEXT,
    discovered_at TEXT NOT NULL,
    is_rugged INTEGER NOT NULL DEFAULT 0   -- one-way, set by outcome tracker
);

CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet_address TEXT NOT NULL,
    token_ca TEXT NOT NULL,
    tx_signature TEXT NOT NULL UNIQUE,     -- idempotency key
    side TEXT NOT NULL,                    -- BUY or SELL
    sol_amount REAL NOT NULL,
    token_amount REAL NOT NULL,
    supply_percentage REAL NOT NULL DEFAULT 0.0,
    mcap_at_trade REAL,
    block_time TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cluster_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    token_ca TEXT NOT NULL,
    wallet_addresses TEXT NOT NULL,        -- JSON array
    wallet_count INTEGER NOT NULL,
    total_sol REAL NOT NULL,
    first_buy_at TEXT NOT NULL,
    last_buy_at TEXT NOT NULL,
    window_seconds INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    token_ca TEXT NOT NULL,
    alert_type TEXT NOT NULL,              -- high_conviction, cluster_buy, volume_spike
    trigger_data TEXT,                     -- JSON trigger context
    total_sol_volume REAL NOT NULL DEFAULT 0.0,
    wallet_count INTEGER NOT NULL DEFAULT 0,
    avg_win_rate REAL NOT NULL DEFAULT 0.0,
    max_supply_pct REAL NOT NULL DEFAULT 0.0,
    is_sent INTEGER NOT NULL DEFAULT 0,
    sent_at TEXT,
    created_at TEXT NOT NULL,
    outcome_pnl REAL,
    outcome_checked_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_wallets_active ON wallets(is_active, conviction_score);
CREATE INDEX IF NOT EXISTS idx_trades_token_time ON trades(token_ca, block_time);
CREATE INDEX IF NOT EXISTS idx_trades_wallet ON trades(wallet_address);
CREATE INDEX IF NOT EXISTS idx_cluster_events_token_time ON cluster_events(token_ca, created_at);
CREATE INDEX IF NOT EXISTS idx_alerts_unsent ON alerts(is_sent, created_at);
CREATE INDEX IF NOT EXISTS idx_alerts_outcome ON alerts(outcome_checked_at, created_at);
CREATE INDEX IF NOT EXISTS idx_alerts_type_time ON alerts(alert_type, created_at);
"#;
