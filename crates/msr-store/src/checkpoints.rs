use rusqlite::{params, OptionalExtension};

use msr_core::candle::Timeframe;
use msr_core::error::CoreResult;
use msr_core::ports::{CheckpointStatus, CheckpointStore, ProcessingCheckpoint};

use crate::{now_rfc3339, store_err, DbPool};

fn status_str(status: CheckpointStatus) -> &'static str {
    match status {
        CheckpointStatus::Pending => "pending",
        CheckpointStatus::Confirmed => "confirmed",
    }
}

fn parse_status(raw: &str) -> CoreResult<CheckpointStatus> {
    match raw {
        "pending" => Ok(CheckpointStatus::Pending),
        "confirmed" => Ok(CheckpointStatus::Confirmed),
        other => Err(store_err(format!("unknown checkpoint status '{other}'"))),
    }
}

/// Replay-progress persistence. `pending` rows at startup mean a replay
/// crashed mid-flight and its window must be re-replayed.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    pool: DbPool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn get(&self, symbol: &str, timeframe: Timeframe) -> CoreResult<Option<ProcessingCheckpoint>> {
        let conn = self.pool.get().map_err(store_err)?;
        let row = conn
            .query_row(
                "SELECT last_processed, status FROM processing_state
                 WHERE symbol = ?1 AND timeframe = ?2",
                params![symbol, timeframe.as_str()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(store_err)?;

        row.map(|(last_processed, status)| {
            Ok(ProcessingCheckpoint {
                symbol: symbol.to_string(),
                timeframe,
                last_processed_ms: last_processed,
                status: parse_status(&status)?,
            })
        })
        .transpose()
    }

    fn upsert(&self, checkpoint: &ProcessingCheckpoint) -> CoreResult<()> {
        let conn = self.pool.get().map_err(store_err)?;
        conn.execute(
            r#"
            INSERT INTO processing_state (symbol, timeframe, last_processed, status, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(symbol, timeframe) DO UPDATE SET
                last_processed = excluded.last_processed,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
            params![
                checkpoint.symbol,
                checkpoint.timeframe.as_str(),
                checkpoint.last_processed_ms,
                status_str(checkpoint.status),
                now_rfc3339(),
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn mark_pending(&self, symbol: &str, timeframe: Timeframe) -> CoreResult<()> {
        let conn = self.pool.get().map_err(store_err)?;
        conn.execute(
            "UPDATE processing_state SET status = 'pending', updated_at = ?3
             WHERE symbol = ?1 AND timeframe = ?2",
            params![symbol, timeframe.as_str(), now_rfc3339()],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn load_pending(&self) -> CoreResult<Vec<ProcessingCheckpoint>> {
        let conn = self.pool.get().map_err(store_err)?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT symbol, timeframe, last_processed, status FROM processing_state
                 WHERE status = 'pending'",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(store_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)?;

        rows.into_iter()
            .map(|(symbol, tf, last_processed, status)| {
                Ok(ProcessingCheckpoint {
                    symbol,
                    timeframe: tf.parse::<Timeframe>().map_err(store_err)?,
                    last_processed_ms: last_processed,
                    status: parse_status(&status)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pool;

    fn checkpoint(last: i64, status: CheckpointStatus) -> ProcessingCheckpoint {
        ProcessingCheckpoint {
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::M1,
            last_processed_ms: last,
            status,
        }
    }

    #[test]
    fn get_missing_is_none() {
        let store = SqliteCheckpointStore::new(test_pool());
        assert!(store.get("BTCUSDT", Timeframe::M1).unwrap().is_none());
    }

    #[test]
    fn upsert_and_get_round_trips() {
        let store = SqliteCheckpointStore::new(test_pool());
        let cp = checkpoint(600_000, CheckpointStatus::Confirmed);
        store.upsert(&cp).unwrap();
        assert_eq!(store.get("BTCUSDT", Timeframe::M1).unwrap(), Some(cp));
    }

    #[test]
    fn mark_pending_then_confirm() {
        let store = SqliteCheckpointStore::new(test_pool());
        store
            .upsert(&checkpoint(600_000, CheckpointStatus::Confirmed))
            .unwrap();
        store.mark_pending("BTCUSDT", Timeframe::M1).unwrap();

        let pending = store.load_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, CheckpointStatus::Pending);

        store
            .upsert(&checkpoint(900_000, CheckpointStatus::Confirmed))
            .unwrap();
        assert!(store.load_pending().unwrap().is_empty());
    }
}
