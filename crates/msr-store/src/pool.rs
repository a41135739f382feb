use std::path::Path;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use msr_core::error::CoreResult;

use crate::store_err;

pub type DbPool = Pool<SqliteConnectionManager>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Open (creating if needed) the engine database and ensure the schema.
pub fn open_pool(path: &Path, max_size: u32) -> CoreResult<DbPool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(store_err)?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(init_connection);
    let pool = Pool::builder()
        .max_size(max_size.max(1))
        .build(manager)
        .map_err(store_err)?;

    let conn = pool.get().map_err(store_err)?;
    ensure_schema(&conn)?;
    tracing::info!(path = %path.display(), "engine database ready");
    Ok(pool)
}

/// Single-connection in-memory pool for tests.
pub fn open_memory_pool() -> CoreResult<DbPool> {
    let manager = SqliteConnectionManager::memory().with_init(init_connection);
    let pool = Pool::builder()
        .max_size(1)
        .build(manager)
        .map_err(store_err)?;
    let conn = pool.get().map_err(store_err)?;
    ensure_schema(&conn)?;
    Ok(pool)
}

fn init_connection(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // Pragmas are best-effort; WAL fails on some filesystems.
    let _ = conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;");
    Ok(())
}

fn ensure_schema(conn: &Connection) -> CoreResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS bars (
            symbol TEXT NOT NULL,
            timeframe TEXT NOT NULL,
            open_time INTEGER NOT NULL,
            open REAL NOT NULL,
            high REAL NOT NULL,
            low REAL NOT NULL,
            close REAL NOT NULL,
            volume REAL NOT NULL,
            updated_at TEXT,
            PRIMARY KEY (symbol, timeframe, open_time)
        );
        CREATE INDEX IF NOT EXISTS idx_bars_series_time
        ON bars(symbol, timeframe, open_time);

        CREATE TABLE IF NOT EXISTS signals (
            id TEXT PRIMARY KEY,
            symbol TEXT NOT NULL,
            timeframe TEXT NOT NULL,
            signal_time INTEGER NOT NULL,
            direction TEXT NOT NULL,
            entry REAL NOT NULL,
            tp REAL NOT NULL,
            sl REAL NOT NULL,
            atr_at_signal REAL NOT NULL,
            streak_at_signal INTEGER NOT NULL,
            state TEXT NOT NULL,
            mae_ratio REAL NOT NULL DEFAULT 0,
            mfe_ratio REAL NOT NULL DEFAULT 0,
            close_time INTEGER,
            close_price REAL,
            updated_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_signals_state ON signals(state);

        CREATE TABLE IF NOT EXISTS streaks (
            symbol TEXT NOT NULL,
            timeframe TEXT NOT NULL,
            current_streak INTEGER NOT NULL,
            total_wins INTEGER NOT NULL,
            total_losses INTEGER NOT NULL,
            updated_at TEXT,
            PRIMARY KEY (symbol, timeframe)
        );

        CREATE TABLE IF NOT EXISTS processing_state (
            symbol TEXT NOT NULL,
            timeframe TEXT NOT NULL,
            last_processed INTEGER NOT NULL,
            status TEXT NOT NULL,
            updated_at TEXT,
            PRIMARY KEY (symbol, timeframe)
        );
        "#,
    )
    .map_err(store_err)
}
