//! Exchange source port.
//!
//! Implementations stream market events into a channel owned by the
//! pipeline and answer REST backfill queries. The streaming tasks must
//! terminate on disconnect (dropping their sender) — the pipeline treats a
//! closed event channel as the disconnect signal and re-enters INIT.

use std::future::Future;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use msr_core::candle::{Candle, Timeframe, Trade};

/// One upstream event: a 1m bar (open or closed) or an aggregated trade.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Bar(Candle),
    Trade(Trade),
}

/// Handle over the background tasks a `subscribe` call spawned.
pub struct SourceHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl SourceHandle {
    pub fn new(tasks: Vec<JoinHandle<()>>) -> Self {
        Self { tasks }
    }

    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub trait ExchangeSource: Send + Sync + 'static {
    /// Open the 1m bar and trade subscriptions for `symbols`, streaming
    /// into `events`. Returns once the connection is established.
    fn subscribe(
        &self,
        symbols: &[String],
        events: mpsc::Sender<MarketEvent>,
    ) -> impl Future<Output = Result<SourceHandle>> + Send;

    /// Closed bars with `from_ms <= open_time < to_ms`, ascending.
    fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from_ms: i64,
        to_ms: i64,
    ) -> impl Future<Output = Result<Vec<Candle>>> + Send;
}
