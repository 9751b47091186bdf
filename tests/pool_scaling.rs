//! Elastic growth, ceiling enforcement and saturation behavior.

mod common;

use common::{math_system, operands};
use plugmux::{HostError, PluginManager};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn pool_grows_to_cover_concurrent_load() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(PluginManager::new(math_system(dir.path(), 1, 5)));
    manager.start().await.unwrap();

    let mut calls = Vec::new();
    for _ in 0..5 {
        let manager = manager.clone();
        calls.push(tokio::spawn(async move {
            manager
                .call("math", "sleep_ms", operands(&[("ms", 1000.0)]))
                .await
        }));
    }

    // By the time all five are in flight, five instances exist.
    tokio::time::sleep(Duration::from_millis(700)).await;
    let status = manager.status("math").await.unwrap();
    assert_eq!(status.total_instances, 5);

    for call in calls {
        let result = call.await.unwrap().unwrap();
        assert_eq!(result.as_f64(), Some(1000.0));
    }

    manager.stop().await;
}

#[tokio::test]
async fn instance_count_never_exceeds_the_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(PluginManager::new(math_system(dir.path(), 1, 3)));
    manager.start().await.unwrap();

    let mut calls = Vec::new();
    for i in 0..30u32 {
        let manager = manager.clone();
        calls.push(tokio::spawn(async move {
            manager
                .call(
                    "math",
                    "add",
                    operands(&[("a", f64::from(i)), ("b", 1.0)]),
                )
                .await
        }));
    }
    for call in calls {
        assert!(call.await.unwrap().is_ok());
    }

    let status = manager.status("math").await.unwrap();
    assert!(status.total_instances >= 1);
    assert!(
        status.total_instances <= 3,
        "ceiling exceeded: {} instances",
        status.total_instances
    );

    manager.stop().await;
}

#[tokio::test]
async fn saturated_pool_rejects_the_overflow_caller() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(PluginManager::new(math_system(dir.path(), 1, 2)));
    manager.start().await.unwrap();

    let mut calls = Vec::new();
    for _ in 0..3 {
        let manager = manager.clone();
        calls.push(tokio::spawn(async move {
            let started = Instant::now();
            let result = manager
                .call("math", "sleep_ms", operands(&[("ms", 7000.0)]))
                .await;
            (result, started.elapsed())
        }));
    }

    let mut successes = 0;
    let mut exhausted = 0;
    for call in calls {
        match call.await.unwrap() {
            (Ok(result), _) => {
                assert_eq!(result.as_f64(), Some(7000.0));
                successes += 1;
            }
            (Err(HostError::PoolExhausted), elapsed) => {
                // The overflow caller gives up after the 5 s acquire wait,
                // well before the in-flight calls finish.
                assert!(elapsed >= Duration::from_millis(4500), "gave up early: {elapsed:?}");
                assert!(elapsed < Duration::from_millis(6500), "gave up late: {elapsed:?}");
                exhausted += 1;
            }
            (Err(other), _) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(successes, 2);
    assert_eq!(exhausted, 1);

    manager.stop().await;
}
