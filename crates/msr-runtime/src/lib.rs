//! Async runtime around the strategy kernel: the serialized core engine,
//! the crash-recoverable ingestion pipeline and the exchange source.

pub mod binance;
pub mod bus;
pub mod engine;
pub mod pipeline;
pub mod source;
pub mod testing;

pub use bus::EventBus;
pub use engine::{CoreEngine, EngineStores};
pub use pipeline::{IngestionPipeline, PipelinePhase, PipelineReport};
pub use source::{ExchangeSource, MarketEvent, SourceHandle};
