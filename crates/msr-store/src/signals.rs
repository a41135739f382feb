use rusqlite::{params, Row};

use msr_core::candle::Timeframe;
use msr_core::error::CoreResult;
use msr_core::ports::SignalStore;
use msr_core::signal::{Direction, Signal, SignalState};

use crate::{now_rfc3339, store_err, DbPool};

/// Signal persistence, unique by deterministic signal id. Replayed
/// emissions upsert onto the same row.
#[derive(Clone)]
pub struct SqliteSignalStore {
    pool: DbPool,
}

impl SqliteSignalStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn row_to_signal(row: &Row<'_>) -> rusqlite::Result<RawSignal> {
        Ok(RawSignal {
            id: row.get(0)?,
            symbol: row.get(1)?,
            timeframe: row.get(2)?,
            signal_time: row.get(3)?,
            direction: row.get(4)?,
            entry: row.get(5)?,
            tp: row.get(6)?,
            sl: row.get(7)?,
            atr_at_signal: row.get(8)?,
            streak_at_signal: row.get(9)?,
            state: row.get(10)?,
            mae_ratio: row.get(11)?,
            mfe_ratio: row.get(12)?,
            close_time: row.get(13)?,
            close_price: row.get(14)?,
        })
    }
}

struct RawSignal {
    id: String,
    symbol: String,
    timeframe: String,
    signal_time: i64,
    direction: String,
    entry: f64,
    tp: f64,
    sl: f64,
    atr_at_signal: f64,
    streak_at_signal: i32,
    state: String,
    mae_ratio: f64,
    mfe_ratio: f64,
    close_time: Option<i64>,
    close_price: Option<f64>,
}

impl RawSignal {
    fn build(self) -> CoreResult<Signal> {
        Ok(Signal {
            id: self.id,
            symbol: self.symbol,
            timeframe: self.timeframe.parse::<Timeframe>().map_err(store_err)?,
            signal_time_ms: self.signal_time,
            direction: self.direction.parse::<Direction>().map_err(store_err)?,
            entry: self.entry,
            tp: self.tp,
            sl: self.sl,
            atr_at_signal: self.atr_at_signal,
            streak_at_signal: self.streak_at_signal,
            state: self.state.parse::<SignalState>().map_err(store_err)?,
            mae_ratio: self.mae_ratio,
            mfe_ratio: self.mfe_ratio,
            close_time_ms: self.close_time,
            close_price: self.close_price,
        })
    }
}

impl SignalStore for SqliteSignalStore {
    fn save(&self, signal: &Signal) -> CoreResult<()> {
        let conn = self.pool.get().map_err(store_err)?;
        conn.execute(
            r#"
            INSERT INTO signals (
                id, symbol, timeframe, signal_time, direction,
                entry, tp, sl, atr_at_signal, streak_at_signal,
                state, mae_ratio, mfe_ratio, close_time, close_price, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                mae_ratio = excluded.mae_ratio,
                mfe_ratio = excluded.mfe_ratio,
                close_time = excluded.close_time,
                close_price = excluded.close_price,
                updated_at = excluded.updated_at
            "#,
            params![
                signal.id,
                signal.symbol,
                signal.timeframe.as_str(),
                signal.signal_time_ms,
                signal.direction.as_str(),
                signal.entry,
                signal.tp,
                signal.sl,
                signal.atr_at_signal,
                signal.streak_at_signal,
                signal.state.as_str(),
                signal.mae_ratio,
                signal.mfe_ratio,
                signal.close_time_ms,
                signal.close_price,
                now_rfc3339(),
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn update_state(
        &self,
        signal_id: &str,
        state: SignalState,
        close_time_ms: i64,
        close_price: f64,
    ) -> CoreResult<()> {
        let conn = self.pool.get().map_err(store_err)?;
        conn.execute(
            "UPDATE signals
             SET state = ?2, close_time = ?3, close_price = ?4, updated_at = ?5
             WHERE id = ?1",
            params![signal_id, state.as_str(), close_time_ms, close_price, now_rfc3339()],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn update_mae_mfe(&self, signal_id: &str, mae_ratio: f64, mfe_ratio: f64) -> CoreResult<()> {
        let conn = self.pool.get().map_err(store_err)?;
        conn.execute(
            "UPDATE signals SET mae_ratio = ?2, mfe_ratio = ?3, updated_at = ?4 WHERE id = ?1",
            params![signal_id, mae_ratio, mfe_ratio, now_rfc3339()],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn load_active(&self) -> CoreResult<Vec<Signal>> {
        let conn = self.pool.get().map_err(store_err)?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, symbol, timeframe, signal_time, direction,
                        entry, tp, sl, atr_at_signal, streak_at_signal,
                        state, mae_ratio, mfe_ratio, close_time, close_price
                 FROM signals
                 WHERE state = 'ACTIVE'
                 ORDER BY signal_time ASC",
            )
            .map_err(store_err)?;
        let raw = stmt
            .query_map([], Self::row_to_signal)
            .map_err(store_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)?;
        raw.into_iter().map(RawSignal::build).collect()
    }
}
