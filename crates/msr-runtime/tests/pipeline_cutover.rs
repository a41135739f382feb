//! Cutover completeness and reconnect behavior: every closed bar that
//! arrives while the pipeline is still starting up is processed exactly
//! once, stale repeats never advance the checkpoint, and a disconnect
//! re-enters INIT and resumes from the confirmed checkpoint.

mod common;

use std::time::Duration;

use msr_core::candle::Timeframe;
use msr_core::ports::BarStore;
use msr_runtime::testing::ScriptedSource;
use msr_runtime::{CoreEngine, EventBus, IngestionPipeline, MarketEvent};

use common::{memory_stores, scripted_bar, scripted_bars, seed_checkpoint, test_config, wait_for_checkpoint};

#[tokio::test(flavor = "multi_thread")]
async fn buffered_bars_are_processed_exactly_once() {
    let stores = memory_stores();
    stores
        .bars
        .upsert_batch(&scripted_bars(100))
        .expect("persist history");
    seed_checkpoint(stores.checkpoints.as_ref());

    let source = ScriptedSource::new(Vec::new());
    let feed = source.add_session();
    // Arrives while the pipeline is replaying: must be buffered, then
    // drained by the two-phase cutover.
    for i in 100..110 {
        feed.send(MarketEvent::Bar(scripted_bar(i)))
            .await
            .expect("feed buffered bar");
    }

    let engine = CoreEngine::new(test_config(), None, stores.clone(), EventBus::new());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let run = tokio::spawn(IngestionPipeline::new(engine, source, shutdown_rx).run());

    // Replay covers 0..100, cutover drains 100..110.
    wait_for_checkpoint(stores.checkpoints.clone(), 109 * 60_000).await;

    // A live bar after cutover flows straight through.
    feed.send(MarketEvent::Bar(scripted_bar(110)))
        .await
        .expect("feed live bar");
    wait_for_checkpoint(stores.checkpoints.clone(), 110 * 60_000).await;

    // Stale repeats: one duplicate of the newest bar, one ancient bar.
    feed.send(MarketEvent::Bar(scripted_bar(110)))
        .await
        .expect("feed duplicate");
    feed.send(MarketEvent::Bar(scripted_bar(50)))
        .await
        .expect("feed ancient bar");
    tokio::time::sleep(Duration::from_millis(500)).await;

    shutdown_tx.send(true).expect("signal shutdown");
    let report = run.await.expect("join").expect("pipeline run");

    // The duplicates were dropped by the dedup guard, nothing reached the
    // aggregator out of order, and the checkpoint never moved backwards.
    assert_eq!(report.stale_bars_dropped, 2);
    assert_eq!(report.aggregator_out_of_order_dropped, 0);
    assert_eq!(report.buffer_overflow_dropped, 0);
    assert_eq!(report.last_processed.get(common::SYMBOL), Some(&(110 * 60_000)));

    // Every bar that ever arrived is persisted exactly once per open time.
    let times = stores
        .bars
        .open_times_between(common::SYMBOL, Timeframe::M1, 0, 200 * 60_000)
        .expect("open times");
    assert_eq!(times.len(), 111);
    assert!(times.windows(2).all(|w| w[1] - w[0] == 60_000));
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_reenters_init_and_resumes() {
    let stores = memory_stores();
    stores
        .bars
        .upsert_batch(&scripted_bars(80))
        .expect("persist history");
    seed_checkpoint(stores.checkpoints.as_ref());

    let source = ScriptedSource::new(Vec::new());
    let first_session = source.add_session();
    let second_session = source.add_session();

    let engine = CoreEngine::new(test_config(), None, stores.clone(), EventBus::new());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let run = tokio::spawn(IngestionPipeline::new(engine, source, shutdown_rx).run());

    wait_for_checkpoint(stores.checkpoints.clone(), 79 * 60_000).await;

    first_session
        .send(MarketEvent::Bar(scripted_bar(80)))
        .await
        .expect("feed live bar");
    wait_for_checkpoint(stores.checkpoints.clone(), 80 * 60_000).await;

    // Dropping the session ends the upstream stream: the pipeline must
    // fall back to INIT, run the recovery phases again and pick up the
    // second session.
    drop(first_session);

    second_session
        .send(MarketEvent::Bar(scripted_bar(81)))
        .await
        .expect("feed bar on second session");
    wait_for_checkpoint(stores.checkpoints.clone(), 81 * 60_000).await;

    shutdown_tx.send(true).expect("signal shutdown");
    let report = run.await.expect("join").expect("pipeline run");
    assert_eq!(report.last_processed.get(common::SYMBOL), Some(&(81 * 60_000)));
}
