//! Deterministic test doubles for the pipeline and engine suites.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::Result;
use tokio::sync::mpsc;

use msr_core::candle::{Candle, Timeframe, Trade};

use crate::source::{ExchangeSource, MarketEvent, SourceHandle};

/// Scripted exchange source.
///
/// `fetch_bars` answers from a fixed in-memory history; each `subscribe`
/// call consumes the next queued session, whose events the test injects
/// through the paired sender. Dropping that sender simulates a
/// disconnect. When no session is queued the stream stays open and idle.
pub struct ScriptedSource {
    history: Vec<Candle>,
    sessions: Mutex<VecDeque<mpsc::Receiver<MarketEvent>>>,
}

impl ScriptedSource {
    pub fn new(history: Vec<Candle>) -> Self {
        Self {
            history,
            sessions: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue one live session and return its injection handle.
    pub fn add_session(&self) -> mpsc::Sender<MarketEvent> {
        let (tx, rx) = mpsc::channel(1_024);
        self.sessions.lock().expect("sessions poisoned").push_back(rx);
        tx
    }
}

impl ExchangeSource for ScriptedSource {
    async fn subscribe(
        &self,
        _symbols: &[String],
        events: mpsc::Sender<MarketEvent>,
    ) -> Result<SourceHandle> {
        let session = self.sessions.lock().expect("sessions poisoned").pop_front();
        let task = tokio::spawn(async move {
            match session {
                Some(mut rx) => {
                    while let Some(event) = rx.recv().await {
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                    // Script exhausted: drop the sender => disconnect.
                }
                None => {
                    // Keep the subscription open with no traffic.
                    let _keep_alive = events;
                    std::future::pending::<()>().await;
                }
            }
        });
        Ok(SourceHandle::new(vec![task]))
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<Candle>> {
        Ok(self
            .history
            .iter()
            .filter(|b| {
                b.symbol == symbol
                    && b.timeframe == timeframe
                    && b.open_time_ms >= from_ms
                    && b.open_time_ms < to_ms
            })
            .cloned()
            .collect())
    }
}

/// Closed 1m bar on a deterministic, mildly oscillating price path.
pub fn scripted_bar(symbol: &str, index: i64, base_ms: i64) -> Candle {
    let p = 100.0 + (index % 7) as f64 * 0.2;
    Candle {
        symbol: symbol.to_string(),
        timeframe: Timeframe::M1,
        open_time_ms: base_ms + index * 60_000,
        open: p,
        high: p + 0.5,
        low: p - 0.5,
        close: p + 0.1,
        volume: 1.0,
        closed: true,
    }
}

pub fn scripted_trade(symbol: &str, timestamp_ms: i64, price: f64) -> Trade {
    Trade {
        symbol: symbol.to_string(),
        timestamp_ms,
        price,
        quantity: 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_bars_filters_series_and_window() {
        let history: Vec<Candle> = (0..10).map(|i| scripted_bar("BTCUSDT", i, 0)).collect();
        let source = ScriptedSource::new(history);

        let got = source
            .fetch_bars("BTCUSDT", Timeframe::M1, 120_000, 300_000)
            .await
            .unwrap();
        assert_eq!(got.len(), 3);
        assert!(got.iter().all(|b| b.open_time_ms >= 120_000 && b.open_time_ms < 300_000));

        let none = source
            .fetch_bars("ETHUSDT", Timeframe::M1, 0, 600_000)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn session_forwards_then_disconnects() {
        let source = ScriptedSource::new(Vec::new());
        let feed = source.add_session();

        let (tx, mut rx) = mpsc::channel(16);
        let _handle = source.subscribe(&["BTCUSDT".to_string()], tx).await.unwrap();

        feed.send(MarketEvent::Bar(scripted_bar("BTCUSDT", 0, 0)))
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(MarketEvent::Bar(_))));

        drop(feed);
        assert!(rx.recv().await.is_none());
    }
}
