//! End-to-end scenarios through the control-plane facade
//!
//! These tests drive the full admission → cache → execute → record sequence
//! with a manually advanced clock, covering the rate-limit and TTL scenarios
//! a real client would observe.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use quantgate::clock::ManualClock;
use quantgate::config::PlaneConfig;
use quantgate::plane::{AnalysisJob, ControlPlane, PlaneError};

fn backtest_params(tickers: &[&str]) -> Value {
    json!({
        "strategy": "ma_cross",
        "tickers": tickers,
        "short_window": 50,
        "long_window": 200,
        "initial_capital": 100_000
    })
}

fn plane_with_clock(config: PlaneConfig) -> (Arc<ControlPlane>, Arc<ManualClock>) {
    init_tracing();
    let clock = Arc::new(ManualClock::new());
    let plane = ControlPlane::with_clock(config, clock.clone()).unwrap();
    (Arc::new(plane), clock)
}

/// Route component logs through the test harness, honoring `RUST_LOG`
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[tokio::test]
async fn three_requests_admitted_fourth_denied_with_six_second_hint() {
    // 10 requests/minute with a burst of 3: client c1 fires 4 analysis
    // requests within the same instant.
    let (plane, _clock) = plane_with_clock(PlaneConfig::default());

    for i in 0..3 {
        let params = backtest_params(&[&format!("SYM{}", i)]);
        let response = plane
            .handle_analysis("c1", "/backtest", &params, || Ok(json!({"total_return": 0.12})))
            .await
            .unwrap();
        assert!(!response.cached);
    }

    let denied = plane
        .handle_analysis("c1", "/backtest", &backtest_params(&["SYM9"]), || {
            Ok(json!({}))
        })
        .await;

    match denied {
        Err(PlaneError::RateLimited { retry_after_secs }) => assert_eq!(retry_after_secs, 6),
        other => panic!("expected rate limit denial, got {:?}", other.is_ok()),
    }

    // Denials show up as rate_limited, not as errors
    let stats = plane.request_stats(Duration::from_secs(3600));
    assert_eq!(stats.total_requests, 4);
    assert_eq!(stats.by_outcome["rate_limited"], 1);
    assert_eq!(stats.error_rate, 0.0);
}

#[tokio::test]
async fn budget_recovers_after_waiting_out_the_hint() {
    let (plane, clock) = plane_with_clock(PlaneConfig::default());

    for i in 0..3 {
        let params = backtest_params(&[&format!("SYM{}", i)]);
        plane
            .handle_analysis("c1", "/backtest", &params, || Ok(json!({})))
            .await
            .unwrap();
    }
    assert!(plane
        .handle_analysis("c1", "/backtest", &backtest_params(&["SYM9"]), || Ok(json!({})))
        .await
        .is_err());

    // Wait out the hint (plus a beat); one token has accrued
    clock.advance(Duration::from_secs(7));
    plane
        .handle_analysis("c1", "/backtest", &backtest_params(&["SYM9"]), || Ok(json!({})))
        .await
        .unwrap();
}

#[tokio::test]
async fn cached_result_expires_with_simulated_time() {
    let mut config = PlaneConfig::default();
    config.cache.default_ttl_secs = 1;
    let (plane, clock) = plane_with_clock(config);

    let params = backtest_params(&["AAPL"]);
    let computed = Arc::new(AtomicUsize::new(0));

    let c = computed.clone();
    let first = plane
        .handle_analysis("c1", "/backtest", &params, move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"sharpe": 1.4}))
        })
        .await
        .unwrap();
    assert!(!first.cached);
    assert_eq!(plane.cache_stats().size, 1);

    // Immediate re-request is a hit
    let c = computed.clone();
    let second = plane
        .handle_analysis("c1", "/backtest", &params, move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"sharpe": 1.4}))
        })
        .await
        .unwrap();
    assert!(second.cached);
    assert_eq!(computed.load(Ordering::SeqCst), 1);

    // 1.1s later the entry has expired; the recompute replaces it
    clock.advance(Duration::from_millis(1100));
    assert_eq!(plane.cache_stats().expired_pending, 1);

    let c = computed.clone();
    let third = plane
        .handle_analysis("c1", "/backtest", &params, move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"sharpe": 1.4}))
        })
        .await
        .unwrap();
    assert!(!third.cached);
    assert_eq!(computed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn batch_mixes_hits_misses_and_failures_in_input_order() {
    let mut config = PlaneConfig::default();
    config.analysis_limit.burst = 10.0;
    let (plane, _clock) = plane_with_clock(config);

    // Warm the cache for one symbol
    plane
        .handle_analysis("c1", "/backtest", &backtest_params(&["AAPL"]), || {
            Ok(json!({"warm": true}))
        })
        .await
        .unwrap();

    let jobs = vec![
        AnalysisJob::new(backtest_params(&["MSFT"]), || Ok(json!({"i": 0}))),
        AnalysisJob::new(backtest_params(&["AAPL"]), || {
            anyhow::bail!("cache should have answered this")
        }),
        AnalysisJob::new(backtest_params(&["BAD"]), || {
            anyhow::bail!("unknown symbol")
        }),
        AnalysisJob::new(backtest_params(&["NVDA"]), || Ok(json!({"i": 3}))),
    ];

    let results = plane
        .handle_analysis_batch("c1", "/backtest/batch", jobs, 2)
        .await
        .unwrap();

    assert_eq!(results.len(), 4);
    assert_eq!(results[0].as_ref().unwrap().result, json!({"i": 0}));
    assert!(results[1].as_ref().unwrap().cached);
    assert!(matches!(results[2], Err(PlaneError::Computation(_))));
    assert_eq!(results[3].as_ref().unwrap().result, json!({"i": 3}));
}

#[tokio::test]
async fn concurrent_clients_admit_independently() {
    let (plane, _clock) = plane_with_clock(PlaneConfig::default());

    let mut handles = Vec::new();
    for client in ["c1", "c2", "c3", "c4"] {
        let plane = plane.clone();
        handles.push(tokio::spawn(async move {
            let params = backtest_params(&["AAPL"]);
            plane
                .handle_analysis(client, "/backtest", &params, || Ok(json!({"ok": true})))
                .await
        }));
    }

    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    // All four shared one fingerprint; only the first computed
    let stats = plane.cache_stats();
    assert_eq!(stats.size, 1);

    let requests = plane.request_stats(Duration::from_secs(3600));
    assert_eq!(requests.total_requests, 4);
    assert_eq!(requests.unique_clients, 4);
}

#[tokio::test]
async fn health_surface_reflects_error_rate() {
    let (plane, _clock) = plane_with_clock(PlaneConfig::default());

    // 2 failures out of 10 analysis calls: 20% error rate
    for i in 0..10 {
        let params = backtest_params(&[&format!("S{}", i)]);
        let fail = i < 2;
        let _ = plane
            .handle_analysis("c1", "/backtest", &params, move || {
                if fail {
                    anyhow::bail!("engine failure")
                } else {
                    Ok(json!({}))
                }
            })
            .await;
        // Stay inside the burst budget
        plane.reset_client("c1");
    }

    let report = plane.health_status();
    assert!(!report.healthy);
    assert!(report.issues.iter().any(|i| i.contains("error rate")));
}

#[tokio::test]
async fn shutdown_drains_and_rejects() {
    let (plane, _clock) = plane_with_clock(PlaneConfig::default());

    plane
        .handle_analysis("c1", "/backtest", &backtest_params(&["AAPL"]), || {
            Ok(json!({}))
        })
        .await
        .unwrap();

    plane.shutdown().await;
    plane.shutdown().await; // idempotent

    let result = plane
        .handle_analysis("c1", "/backtest", &backtest_params(&["MSFT"]), || {
            Ok(json!({}))
        })
        .await;
    assert!(matches!(result, Err(PlaneError::ShuttingDown)));
}

#[tokio::test]
async fn stats_snapshot_covers_every_component() {
    let (plane, _clock) = plane_with_clock(PlaneConfig::default());

    plane
        .handle_analysis("c1", "/backtest", &backtest_params(&["AAPL"]), || {
            Ok(json!({}))
        })
        .await
        .unwrap();

    let stats = plane.stats();
    assert_eq!(stats.cache.size, 1);
    assert_eq!(stats.analysis_limiter.active_clients, 1);
    assert!(stats.executor.io_workers > 0);
    assert_eq!(stats.requests_1h.total_requests, 1);

    // The snapshot is serializable for the (external) HTTP layer
    let encoded = serde_json::to_string(&stats).unwrap();
    assert!(encoded.contains("\"cache\""));
}
