//! Worker pool tests: load sampling, placement and fatal worker death.
//!
//! Uses tokio's paused clock where the sampler or the death grace delay
//! is involved.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::sync::Arc;
use std::time::Duration;

use sfu_controller::engine::MediaEngine;
use sfu_controller::errors::SfuError;
use sfu_controller::workers::{WorkerDeath, WorkerPool};
use sfu_test_utils::fixtures;
use sfu_test_utils::{MockEngine, RoomHarness};
use tokio_util::sync::CancellationToken;

async fn pool(engine: &Arc<MockEngine>, size: usize, cancel: &CancellationToken) -> Arc<WorkerPool> {
    WorkerPool::create(
        Arc::clone(engine) as Arc<dyn MediaEngine>,
        fixtures::pool_settings(size),
        cancel.child_token(),
    )
    .await
    .unwrap()
}

// ============================================================================
// Creation
// ============================================================================

#[tokio::test]
async fn test_pool_starts_every_worker_on_its_own_port() {
    let engine = MockEngine::new();
    let cancel = CancellationToken::new();
    let pool = pool(&engine, 3, &cancel).await;

    assert_eq!(pool.len(), 3);
    let ports: Vec<u16> = pool.workers().iter().map(|w| w.listen_port()).collect();
    assert_eq!(ports, vec![44_444, 44_445, 44_446]);
    assert_eq!(engine.worker(2).settings().webrtc_port, 44_446);
    assert_eq!(pool.loads(), vec![0.0, 0.0, 0.0]);

    cancel.cancel();
}

#[tokio::test]
async fn test_empty_pool_is_a_config_error() {
    let engine = MockEngine::new();
    let result = WorkerPool::create(
        engine as Arc<dyn MediaEngine>,
        fixtures::pool_settings(0),
        CancellationToken::new(),
    )
    .await;

    assert!(matches!(result, Err(SfuError::Config(_))));
}

#[tokio::test]
async fn test_worker_start_failure_fails_pool() {
    let engine = MockEngine::new();
    engine.fail_worker_creation(true);

    let result = WorkerPool::create(
        Arc::clone(&engine) as Arc<dyn MediaEngine>,
        fixtures::pool_settings(2),
        CancellationToken::new(),
    )
    .await;

    assert!(matches!(result, Err(SfuError::Engine(_))));
}

// ============================================================================
// Load sampling
// ============================================================================

#[tokio::test]
async fn test_load_is_cpu_delta_over_interval() {
    let engine = MockEngine::new();
    let cancel = CancellationToken::new();
    let pool = pool(&engine, 2, &cancel).await;

    engine.worker(0).add_cpu_time(Duration::from_millis(500));
    engine.worker(1).add_cpu_time(Duration::from_millis(100));
    pool.sample_loads(Duration::from_secs(1)).await;

    let loads = pool.loads();
    assert!((loads[0] - 0.5).abs() < 1e-9);
    assert!((loads[1] - 0.1).abs() < 1e-9);
    assert_eq!(pool.select_least_loaded().unwrap().index(), 1);

    // Next interval only counts new CPU time
    engine.worker(1).add_cpu_time(Duration::from_millis(900));
    pool.sample_loads(Duration::from_secs(1)).await;
    let loads = pool.loads();
    assert!(loads[0].abs() < 1e-9);
    assert!((loads[1] - 0.9).abs() < 1e-9);
    assert_eq!(pool.select_least_loaded().unwrap().index(), 0);

    cancel.cancel();
}

#[tokio::test]
async fn test_failed_usage_read_keeps_previous_load() {
    let engine = MockEngine::new();
    let cancel = CancellationToken::new();
    let pool = pool(&engine, 1, &cancel).await;

    engine.worker(0).add_cpu_time(Duration::from_millis(300));
    pool.sample_loads(Duration::from_secs(1)).await;

    engine.worker(0).fail_usage(true);
    engine.worker(0).add_cpu_time(Duration::from_millis(900));
    pool.sample_loads(Duration::from_secs(1)).await;

    assert!((pool.loads()[0] - 0.3).abs() < 1e-9);

    cancel.cancel();
}

#[tokio::test]
async fn test_ties_go_to_first_worker() {
    let engine = MockEngine::new();
    let cancel = CancellationToken::new();
    let pool = pool(&engine, 3, &cancel).await;

    assert_eq!(pool.select_least_loaded().unwrap().index(), 0);

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_sampler_updates_loads_each_interval() {
    let engine = MockEngine::new();
    let cancel = CancellationToken::new();
    let pool = pool(&engine, 2, &cancel).await;
    let sampler = pool.spawn_load_sampler(Duration::from_secs(1), cancel.child_token());

    engine.worker(0).add_cpu_time(Duration::from_millis(800));
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let loads = pool.loads();
    assert!((loads[0] - 0.8).abs() < 1e-9);
    assert!(loads[1].abs() < 1e-9);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), sampler)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_rooms_placed_on_least_loaded_worker() {
    let harness = RoomHarness::start(2).await;
    harness.engine.worker(0).add_cpu_time(Duration::from_millis(700));
    harness.pool.sample_loads(Duration::from_secs(1)).await;

    harness.registry.get_or_create("room-1").await.unwrap();
    assert_eq!(harness.engine.worker(0).router_count(), 0);
    assert_eq!(harness.engine.worker(1).router_count(), 1);

    harness.stop().await;
}

// ============================================================================
// Worker death
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_worker_death_is_published_after_grace() {
    let engine = MockEngine::new();
    let cancel = CancellationToken::new();
    let pool = pool(&engine, 2, &cancel).await;

    engine.worker(1).kill("segfault");

    let death = tokio::time::timeout(Duration::from_secs(5), pool.fatal())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        death,
        WorkerDeath {
            index: 1,
            reason: "segfault".to_string()
        }
    );
    assert_eq!(pool.death(), Some(death.clone()));

    let err: SfuError = death.into();
    assert_eq!(err.class(), sfu_controller::errors::ErrorClass::Fatal);
}

#[tokio::test(start_paused = true)]
async fn test_first_death_wins() {
    let engine = MockEngine::new();
    let cancel = CancellationToken::new();
    let pool = pool(&engine, 2, &cancel).await;

    engine.worker(0).kill("first");
    tokio::time::sleep(Duration::from_millis(10)).await;
    engine.worker(1).kill("second");

    let death = pool.fatal().await.unwrap();
    assert_eq!(death.index, 0);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(pool.death().unwrap().index, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_pool_does_not_report_death() {
    let engine = MockEngine::new();
    let cancel = CancellationToken::new();
    let pool = pool(&engine, 1, &cancel).await;

    cancel.cancel();
    tokio::task::yield_now().await;
    engine.worker(0).kill("closed during shutdown");

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(pool.death().is_none());
}
