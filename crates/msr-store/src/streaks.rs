use rusqlite::params;

use msr_core::candle::{SeriesKey, Timeframe};
use msr_core::error::CoreResult;
use msr_core::ports::StreakStore;
use msr_core::streak::StreakTracker;

use crate::{now_rfc3339, store_err, DbPool};

/// Streak persistence so counters resume from their last confirmed value
/// after a restart.
#[derive(Clone)]
pub struct SqliteStreakStore {
    pool: DbPool,
}

impl SqliteStreakStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl StreakStore for SqliteStreakStore {
    fn save(&self, symbol: &str, timeframe: Timeframe, tracker: &StreakTracker) -> CoreResult<()> {
        let conn = self.pool.get().map_err(store_err)?;
        conn.execute(
            r#"
            INSERT INTO streaks (symbol, timeframe, current_streak, total_wins, total_losses, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(symbol, timeframe) DO UPDATE SET
                current_streak = excluded.current_streak,
                total_wins = excluded.total_wins,
                total_losses = excluded.total_losses,
                updated_at = excluded.updated_at
            "#,
            params![
                symbol,
                timeframe.as_str(),
                tracker.current_streak,
                tracker.total_wins,
                tracker.total_losses,
                now_rfc3339(),
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn load_all(&self) -> CoreResult<Vec<(SeriesKey, StreakTracker)>> {
        let conn = self.pool.get().map_err(store_err)?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT symbol, timeframe, current_streak, total_wins, total_losses FROM streaks",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i32>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, u32>(4)?,
                ))
            })
            .map_err(store_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)?;

        rows.into_iter()
            .map(|(symbol, tf, current_streak, total_wins, total_losses)| {
                let timeframe = tf.parse::<Timeframe>().map_err(store_err)?;
                Ok((
                    (symbol, timeframe),
                    StreakTracker {
                        current_streak,
                        total_wins,
                        total_losses,
                    },
                ))
            })
            .collect()
    }
}
