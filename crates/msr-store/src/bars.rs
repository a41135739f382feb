use rusqlite::{params, Row};

use msr_core::candle::{Candle, Timeframe};
use msr_core::error::CoreResult;
use msr_core::ports::BarStore;

use crate::{now_rfc3339, store_err, DbPool};

/// Bar persistence. Unique by (symbol, timeframe, open_time); rows are
/// always closed bars.
#[derive(Clone)]
pub struct SqliteBarStore {
    pool: DbPool,
}

impl SqliteBarStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn row_to_candle(row: &Row<'_>) -> rusqlite::Result<(String, String, i64, f64, f64, f64, f64, f64)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
        ))
    }

    fn build_candle(
        raw: (String, String, i64, f64, f64, f64, f64, f64),
    ) -> CoreResult<Candle> {
        let (symbol, tf, open_time, open, high, low, close, volume) = raw;
        Ok(Candle {
            symbol,
            timeframe: tf.parse::<Timeframe>().map_err(store_err)?,
            open_time_ms: open_time,
            open,
            high,
            low,
            close,
            volume,
            closed: true,
        })
    }
}

const UPSERT_SQL: &str = r#"
    INSERT INTO bars (symbol, timeframe, open_time, open, high, low, close, volume, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
    ON CONFLICT(symbol, timeframe, open_time) DO UPDATE SET
        open = excluded.open,
        high = excluded.high,
        low = excluded.low,
        close = excluded.close,
        volume = excluded.volume,
        updated_at = excluded.updated_at
"#;

impl BarStore for SqliteBarStore {
    fn upsert(&self, bar: &Candle) -> CoreResult<()> {
        let conn = self.pool.get().map_err(store_err)?;
        conn.execute(
            UPSERT_SQL,
            params![
                bar.symbol,
                bar.timeframe.as_str(),
                bar.open_time_ms,
                bar.open,
                bar.high,
                bar.low,
                bar.close,
                bar.volume,
                now_rfc3339(),
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn upsert_batch(&self, bars: &[Candle]) -> CoreResult<()> {
        if bars.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().map_err(store_err)?;
        let tx = conn.transaction().map_err(store_err)?;
        {
            let mut stmt = tx.prepare_cached(UPSERT_SQL).map_err(store_err)?;
            let updated_at = now_rfc3339();
            for bar in bars {
                stmt.execute(params![
                    bar.symbol,
                    bar.timeframe.as_str(),
                    bar.open_time_ms,
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume,
                    updated_at,
                ])
                .map_err(store_err)?;
            }
        }
        tx.commit().map_err(store_err)
    }

    fn range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from_ms: i64,
        to_ms: i64,
    ) -> CoreResult<Vec<Candle>> {
        let conn = self.pool.get().map_err(store_err)?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT symbol, timeframe, open_time, open, high, low, close, volume
                 FROM bars
                 WHERE symbol = ?1 AND timeframe = ?2 AND open_time >= ?3 AND open_time < ?4
                 ORDER BY open_time ASC",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(
                params![symbol, timeframe.as_str(), from_ms, to_ms],
                Self::row_to_candle,
            )
            .map_err(store_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)?;
        rows.into_iter().map(Self::build_candle).collect()
    }

    fn last_open_time(&self, symbol: &str, timeframe: Timeframe) -> CoreResult<Option<i64>> {
        let conn = self.pool.get().map_err(store_err)?;
        conn.query_row(
            "SELECT MAX(open_time) FROM bars WHERE symbol = ?1 AND timeframe = ?2",
            params![symbol, timeframe.as_str()],
            |row| row.get::<_, Option<i64>>(0),
        )
        .map_err(store_err)
    }

    fn tail(&self, symbol: &str, timeframe: Timeframe, n: usize) -> CoreResult<Vec<Candle>> {
        let conn = self.pool.get().map_err(store_err)?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT symbol, timeframe, open_time, open, high, low, close, volume
                 FROM bars
                 WHERE symbol = ?1 AND timeframe = ?2
                 ORDER BY open_time DESC
                 LIMIT ?3",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(
                params![symbol, timeframe.as_str(), n as i64],
                Self::row_to_candle,
            )
            .map_err(store_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)?;
        let mut candles = rows
            .into_iter()
            .map(Self::build_candle)
            .collect::<CoreResult<Vec<_>>>()?;
        // Newest-first from the query; hand back chronological.
        candles.reverse();
        Ok(candles)
    }

    fn tail_until(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        until_ms: i64,
        n: usize,
    ) -> CoreResult<Vec<Candle>> {
        let conn = self.pool.get().map_err(store_err)?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT symbol, timeframe, open_time, open, high, low, close, volume
                 FROM bars
                 WHERE symbol = ?1 AND timeframe = ?2 AND open_time <= ?3
                 ORDER BY open_time DESC
                 LIMIT ?4",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(
                params![symbol, timeframe.as_str(), until_ms, n as i64],
                Self::row_to_candle,
            )
            .map_err(store_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)?;
        let mut candles = rows
            .into_iter()
            .map(Self::build_candle)
            .collect::<CoreResult<Vec<_>>>()?;
        candles.reverse();
        Ok(candles)
    }

    fn open_times_between(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from_ms: i64,
        to_ms: i64,
    ) -> CoreResult<Vec<i64>> {
        let conn = self.pool.get().map_err(store_err)?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT open_time FROM bars
                 WHERE symbol = ?1 AND timeframe = ?2 AND open_time >= ?3 AND open_time < ?4
                 ORDER BY open_time ASC",
            )
            .map_err(store_err)?;
        let result = stmt
            .query_map(params![symbol, timeframe.as_str(), from_ms, to_ms], |row| {
                row.get(0)
            })
            .map_err(store_err)?
            .collect::<Result<Vec<i64>, _>>()
            .map_err(store_err);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pool;

    fn bar(t: i64, close: f64) -> Candle {
        Candle {
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::M1,
            open_time_ms: t,
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 2.0,
            closed: true,
        }
    }

    #[test]
    fn upsert_is_idempotent() {
        let store = SqliteBarStore::new(test_pool());
        store.upsert(&bar(60_000, 100.0)).unwrap();
        store.upsert(&bar(60_000, 101.0)).unwrap();

        let rows = store.range("BTCUSDT", Timeframe::M1, 0, 120_000).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].close, 101.0);
    }

    #[test]
    fn range_is_half_open_and_sorted() {
        let store = SqliteBarStore::new(test_pool());
        store
            .upsert_batch(&[bar(0, 1.0), bar(60_000, 2.0), bar(120_000, 3.0)])
            .unwrap();

        let rows = store.range("BTCUSDT", Timeframe::M1, 0, 120_000).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].open_time_ms < rows[1].open_time_ms);
    }

    #[test]
    fn tail_returns_chronological_suffix() {
        let store = SqliteBarStore::new(test_pool());
        for i in 0..10i64 {
            store.upsert(&bar(i * 60_000, i as f64 + 1.0)).unwrap();
        }
        let rows = store.tail("BTCUSDT", Timeframe::M1, 3).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].open_time_ms, 7 * 60_000);
        assert_eq!(rows[2].open_time_ms, 9 * 60_000);
    }

    #[test]
    fn tail_until_excludes_later_bars() {
        let store = SqliteBarStore::new(test_pool());
        for i in 0..10i64 {
            store.upsert(&bar(i * 60_000, i as f64 + 1.0)).unwrap();
        }
        let rows = store
            .tail_until("BTCUSDT", Timeframe::M1, 5 * 60_000, 3)
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].open_time_ms, 3 * 60_000);
        assert_eq!(rows[2].open_time_ms, 5 * 60_000);
    }

    #[test]
    fn last_open_time_and_gap_scan() {
        let store = SqliteBarStore::new(test_pool());
        assert_eq!(store.last_open_time("BTCUSDT", Timeframe::M1).unwrap(), None);

        store
            .upsert_batch(&[bar(0, 1.0), bar(60_000, 2.0), bar(240_000, 3.0)])
            .unwrap();
        assert_eq!(
            store.last_open_time("BTCUSDT", Timeframe::M1).unwrap(),
            Some(240_000)
        );
        let times = store
            .open_times_between("BTCUSDT", Timeframe::M1, 0, 300_000)
            .unwrap();
        assert_eq!(times, vec![0, 60_000, 240_000]);
    }

    #[test]
    fn series_are_isolated() {
        let store = SqliteBarStore::new(test_pool());
        store.upsert(&bar(0, 1.0)).unwrap();
        let mut other = bar(0, 9.0);
        other.timeframe = Timeframe::M5;
        store.upsert(&other).unwrap();

        assert_eq!(store.range("BTCUSDT", Timeframe::M1, 0, 60_000).unwrap().len(), 1);
        assert_eq!(store.range("BTCUSDT", Timeframe::M5, 0, 60_000).unwrap().len(), 1);
        assert!(store.range("ETHUSDT", Timeframe::M1, 0, 60_000).unwrap().is_empty());
    }
}
