//! Integration tests for the worker pool lifecycle
//!
//! These tests drive the pool with mock processors to cover:
//! - Queueing when tasks outnumber workers
//! - Crash recovery, redispatch and retry exhaustion
//! - Stall detection
//! - Health reporting
//! - Termination

mod common;

use common::builders::{fast_settings, WorkerConfigBuilder};
use common::mock_helpers::{MockFactory, CRASH, HANG};
use common::{wait_for_active_workers, wait_until};
use frameflow_rs::config::{OperationMode, PoolSettings, WorkerConfigPatch};
use frameflow_rs::error::ProcessorError;
use frameflow_rs::types::DatasetValue;
use frameflow_rs::WorkerPool;
use serial_test::serial;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn mock_pool(workers: usize, settings: PoolSettings, factory: MockFactory) -> WorkerPool {
    let config = WorkerConfigBuilder::new()
        .mode(OperationMode::QuickPlot)
        .workers(workers)
        .build();
    WorkerPool::with_factory(config, settings, factory.into_factory()).unwrap()
}

fn length_of(result: &frameflow_rs::TaskResult) -> f64 {
    let output = result.as_ref().unwrap();
    match output.frames[0].result.as_ref().unwrap()[0] {
        DatasetValue::Number(n) => n,
        ref other => panic!("unexpected value {:?}", other),
    }
}

#[test]
#[serial]
fn test_more_tasks_than_workers_are_queued() {
    let (factory, gate) = MockFactory::new().gated();
    let pool = mock_pool(1, fast_settings(), factory);

    let tickets: Vec<_> = (0..4).map(|i| pool.process_data(vec![0u8; i + 1])).collect();
    assert!(wait_until(|| pool.queued_task_count() > 0));
    assert!(pool.is_healthy());

    for _ in 0..4 {
        gate.send(()).unwrap();
    }
    for (i, ticket) in tickets.into_iter().enumerate() {
        let result = ticket.wait();
        assert_eq!(length_of(&result), (i + 1) as f64);
    }

    assert_eq!(pool.queued_task_count(), 0);
    assert_eq!(pool.statistics().tasks_processed, 4);
    pool.terminate_blocking();
}

#[test]
#[serial]
fn test_single_worker_completes_in_submission_order() {
    let pool = mock_pool(1, fast_settings(), MockFactory::new());
    let tickets: Vec<_> = (1..=5).map(|n| pool.process_data(vec![1u8; n])).collect();

    let mut ids = Vec::new();
    for ticket in tickets {
        ids.push(ticket.id());
        ticket.wait().unwrap();
    }
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    pool.terminate_blocking();
}

#[test]
#[serial]
fn test_crash_mid_task_is_redispatched() {
    let pool = mock_pool(2, fast_settings(), MockFactory::new().flaky(1));

    let result = pool.process_data(b"flaky-task".to_vec()).wait();
    assert_eq!(length_of(&result), 10.0);

    assert!(wait_for_active_workers(&pool, 2));
    let stats = pool.statistics();
    assert_eq!(stats.workers_created, 3);
    assert_eq!(stats.workers_terminated, 1);
    assert_eq!(stats.recent_crashes, 1);
    assert!(stats.workers_created >= stats.workers_terminated);
    pool.terminate_blocking();
}

#[test]
#[serial]
fn test_crash_retries_exhausted() {
    let settings = PoolSettings {
        max_task_retries: 2,
        crash_threshold: 10,
        ..fast_settings()
    };
    let pool = mock_pool(2, settings, MockFactory::new());

    let ticket = pool.process_data(CRASH.to_vec());
    let task_id = ticket.id();
    assert_eq!(
        ticket.wait(),
        Err(ProcessorError::WorkerCrash {
            task_id: task_id.0,
            attempts: 3,
        })
    );

    assert!(wait_for_active_workers(&pool, 2));
    let stats = pool.statistics();
    assert_eq!(stats.workers_created, 5);
    assert_eq!(stats.workers_terminated, 3);
    assert_eq!(stats.tasks_failed, 1);

    // Other work still goes through
    assert!(pool.process_data(b"ok".to_vec()).wait().is_ok());
    pool.terminate_blocking();
}

#[test]
#[serial]
fn test_stalled_worker_is_replaced() {
    let settings = PoolSettings {
        parse_timeout_ms: 50,
        stall_timeout_ms: 100,
        max_task_retries: 0,
        ..fast_settings()
    };
    let factory = MockFactory::new().hang_for(Duration::from_secs(2));
    let pool = mock_pool(1, settings, factory);

    let ticket = pool.process_data(HANG.to_vec());
    assert!(matches!(
        ticket.wait(),
        Err(ProcessorError::WorkerCrash { attempts: 1, .. })
    ));

    // The replacement serves new tasks while the stalled thread sleeps
    let result = pool.process_data(b"abc".to_vec()).wait();
    assert_eq!(length_of(&result), 3.0);

    let stats = pool.statistics();
    assert_eq!(stats.workers_created, 2);
    assert_eq!(stats.workers_terminated, 1);
    pool.terminate_blocking();
}

#[test]
#[serial]
fn test_unhealthy_when_all_workers_dead_with_queued_tasks() {
    let factory = MockFactory::new().build_limit(1);
    let pool = mock_pool(1, fast_settings(), factory);
    assert!(pool.is_healthy());

    let crashing = pool.process_data(CRASH.to_vec());
    let waiting = pool.process_data(b"queued".to_vec());

    assert!(wait_until(|| !pool.is_healthy()));
    assert_eq!(pool.active_worker_count(), 0);
    assert!(pool.queued_task_count() > 0);

    pool.terminate_blocking();
    assert_eq!(crashing.wait(), Err(ProcessorError::PoolTerminated));
    assert_eq!(waiting.wait(), Err(ProcessorError::PoolTerminated));
}

#[test]
#[serial]
fn test_pool_recovers_once_factory_builds_again() {
    let factory = MockFactory::new().flaky(1);
    let control = factory.clone();
    let pool = mock_pool(1, fast_settings(), factory);
    control.refuse_builds(true);

    let ticket = pool.process_data(b"flaky-task".to_vec());
    assert!(wait_until(|| !pool.is_healthy()));
    assert_eq!(pool.active_worker_count(), 0);
    assert_eq!(pool.queued_task_count(), 1);

    control.refuse_builds(false);
    assert!(wait_for_active_workers(&pool, 1));
    assert_eq!(length_of(&ticket.wait()), 10.0);

    assert!(control.builds() >= 3);
    assert!(pool.is_healthy());
    assert_eq!(pool.statistics().workers_created, 2);
    pool.terminate_blocking();
}

#[test]
#[serial]
fn test_unhealthy_after_crash_burst() {
    let settings = PoolSettings {
        max_task_retries: 0,
        crash_threshold: 1,
        ..fast_settings()
    };
    let pool = mock_pool(2, settings, MockFactory::new());

    for _ in 0..2 {
        assert!(pool.process_data(CRASH.to_vec()).wait().is_err());
    }
    assert!(wait_for_active_workers(&pool, 2));
    assert!(!pool.is_healthy());
    assert_eq!(pool.statistics().recent_crashes, 2);
    pool.terminate_blocking();
}

#[test]
#[serial]
fn test_terminate_rejects_queue_and_finishes_running_task() {
    let (factory, gate) = MockFactory::new().gated();
    let settings = PoolSettings {
        shutdown_grace_ms: 5_000,
        ..fast_settings()
    };
    let pool = Arc::new(mock_pool(1, settings, factory));

    let running = pool.process_data(b"run".to_vec());
    let queued: Vec<_> = (0..2).map(|_| pool.process_data(b"later".to_vec())).collect();
    assert!(wait_until(|| pool.queued_task_count() == 2));

    let terminator = {
        let pool = pool.clone();
        thread::spawn(move || pool.terminate_blocking())
    };

    for ticket in queued {
        assert_eq!(ticket.wait(), Err(ProcessorError::PoolTerminated));
    }

    gate.send(()).unwrap();
    assert_eq!(length_of(&running.wait()), 3.0);
    terminator.join().unwrap();

    assert_eq!(pool.active_worker_count(), 0);
    let stats = pool.statistics();
    assert_eq!(stats.workers_created, stats.workers_terminated);
}

#[test]
#[serial]
fn test_terminate_abandons_workers_after_grace_period() {
    let (factory, _gate) = MockFactory::new().gated();
    let settings = PoolSettings {
        shutdown_grace_ms: 100,
        ..fast_settings()
    };
    let pool = mock_pool(1, settings, factory);

    let running = pool.process_data(b"stuck".to_vec());
    assert!(wait_until(|| pool.queued_task_count() == 0));

    pool.terminate_blocking();
    assert_eq!(running.wait(), Err(ProcessorError::PoolTerminated));
}

#[tokio::test]
#[serial]
async fn test_terminate_is_idempotent() {
    let pool = mock_pool(2, fast_settings(), MockFactory::new());
    pool.terminate().await;
    pool.terminate().await;

    assert!(pool.is_terminated());
    assert_eq!(
        pool.process_data(b"late".to_vec()).await,
        Err(ProcessorError::PoolTerminated)
    );
    assert_eq!(pool.statistics().active_workers, 0);
}

#[tokio::test]
#[serial]
async fn test_batch_results_in_input_order() {
    let settings = PoolSettings {
        max_task_retries: 0,
        ..fast_settings()
    };
    let pool = mock_pool(3, settings, MockFactory::new());

    let results = pool
        .process_batch(vec![b"a".to_vec(), CRASH.to_vec(), b"ccc".to_vec()])
        .await;

    assert_eq!(results.len(), 3);
    assert_eq!(length_of(&results[0]), 1.0);
    assert!(matches!(
        results[1],
        Err(ProcessorError::WorkerCrash { attempts: 1, .. })
    ));
    assert_eq!(length_of(&results[2]), 3.0);
    pool.terminate().await;
}

#[test]
#[serial]
fn test_shrinking_pool_retires_idle_workers() {
    let pool = mock_pool(4, fast_settings(), MockFactory::new());
    assert_eq!(pool.active_worker_count(), 4);

    pool.update_config(WorkerConfigPatch::new().max_workers(2))
        .unwrap();
    assert!(wait_for_active_workers(&pool, 2));
    assert!(wait_until(|| pool.statistics().workers_terminated == 2));

    pool.update_config(WorkerConfigPatch::new().max_workers(3))
        .unwrap();
    assert!(wait_for_active_workers(&pool, 3));
    assert_eq!(pool.statistics().workers_created, 5);
    pool.terminate_blocking();
}
