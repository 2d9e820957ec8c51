//! Control-plane facade
//!
//! The single entry and exit point an inbound request flows through:
//! admission control, result cache, bounded execution and metrics, composed
//! in that order. One [`ControlPlane`] is constructed at service startup and
//! handed by `Arc` into every request-handling path; there is no global
//! mutable state.
//!
//! The strategy/backtest computation itself stays behind an opaque callable
//! boundary: the plane dispatches it, times it out and caches its result,
//! but has no knowledge of what it computes.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::{fingerprint, CacheStats, EntryMeta, ResultCache};
use crate::clock::{system_clock, SharedClock};
use crate::config::{ConfigError, PlaneConfig};
use crate::executor::{blocking_work, BoundedExecutor, ExecError, ExecutorStats};
use crate::limiter::{Admission, RateLimiter, RateLimiterStats};
use crate::metrics::{
    CleanupCounts, HealthReport, MetricsAggregator, Outcome, RequestStats, SystemStats,
};

/// Errors surfaced to the caller-facing boundary
///
/// Rate limiting and timeouts are distinct, typed outcomes the caller must
/// branch on: a denied request carries a machine-readable retry hint and a
/// timed-out request may be retried, while a computation error is forwarded
/// opaque and uninterpreted.
#[derive(Error, Debug)]
pub enum PlaneError {
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("analysis timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("service is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Computation(anyhow::Error),
}

impl From<ExecError> for PlaneError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Timeout { timeout } => PlaneError::Timeout { timeout },
            ExecError::ShuttingDown => PlaneError::ShuttingDown,
            ExecError::Computation(e) => PlaneError::Computation(e),
        }
    }
}

/// A completed analysis request
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResponse {
    pub request_id: Uuid,
    pub result: Value,
    /// Whether the result came from the cache
    pub cached: bool,
    pub fingerprint: String,
}

/// One item of a batch analysis: normalized parameters plus the opaque
/// computation bound to them
pub struct AnalysisJob {
    pub params: Value,
    pub compute: Box<dyn FnOnce() -> anyhow::Result<Value> + Send + 'static>,
}

impl AnalysisJob {
    pub fn new<F>(params: Value, compute: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<Value> + Send + 'static,
    {
        Self {
            params,
            compute: Box::new(compute),
        }
    }
}

/// Combined read-only snapshot for a stats endpoint
#[derive(Debug, Clone, Serialize)]
pub struct PlaneStats {
    pub cache: CacheStats,
    pub analysis_limiter: RateLimiterStats,
    pub management_limiter: RateLimiterStats,
    pub executor: ExecutorStats,
    pub requests_1h: RequestStats,
}

/// The request control-plane
pub struct ControlPlane {
    cache: ResultCache<Value>,
    analysis_limiter: RateLimiter,
    management_limiter: RateLimiter,
    executor: BoundedExecutor,
    metrics: MetricsAggregator,
    timeout: Duration,
}

impl ControlPlane {
    /// Build a control-plane from validated configuration
    pub fn new(config: PlaneConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, system_clock())
    }

    /// Build with an explicit time source (deterministic tests)
    pub fn with_clock(config: PlaneConfig, clock: SharedClock) -> Result<Self, ConfigError> {
        config.validate()?;

        info!(
            cache_size = config.cache.max_size,
            analysis_rpm = config.analysis_limit.requests_per_minute,
            io_workers = config.executor.io_workers,
            cpu_workers = config.executor.cpu_workers,
            "control plane starting"
        );

        Ok(Self {
            cache: ResultCache::new(
                config.cache.max_size,
                config.cache.default_ttl(),
                clock.clone(),
            ),
            analysis_limiter: RateLimiter::new(
                config.analysis_limit.to_limiter_config(),
                clock.clone(),
            ),
            management_limiter: RateLimiter::new(
                config.management_limit.to_limiter_config(),
                clock.clone(),
            ),
            executor: BoundedExecutor::new(config.executor.to_executor_config()),
            metrics: MetricsAggregator::new(config.metrics.to_metrics_config(), clock),
            timeout: config.executor.timeout(),
        })
    }

    /// Run one analysis request through the full admission → cache →
    /// execute → record sequence
    ///
    /// `compute` is the opaque, CPU-bound strategy evaluation with its
    /// arguments already bound; it only runs on a cache miss.
    pub async fn handle_analysis<F>(
        &self,
        client_id: &str,
        endpoint: &str,
        params: &Value,
        compute: F,
    ) -> Result<AnalysisResponse, PlaneError>
    where
        F: FnOnce() -> anyhow::Result<Value> + Send + 'static,
    {
        let request_id = Uuid::new_v4();
        let started = std::time::Instant::now();

        if let Err(denied) = self.admit(&self.analysis_limiter, client_id, endpoint, 1.0) {
            return Err(denied);
        }

        let fp = fingerprint(params);
        if let Some(result) = self.cache.get(&fp) {
            debug!(%request_id, client = client_id, fingerprint = %fp, "served from cache");
            self.metrics
                .record_request(endpoint, Outcome::Success, started.elapsed(), client_id);
            return Ok(AnalysisResponse {
                request_id,
                result,
                cached: true,
                fingerprint: fp,
            });
        }

        match self.executor.execute_blocking(compute, self.timeout).await {
            Ok(result) => {
                self.cache
                    .put_with_metadata(fp.clone(), result.clone(), meta_from_params(params));
                self.metrics
                    .record_request(endpoint, Outcome::Success, started.elapsed(), client_id);
                debug!(%request_id, client = client_id, latency_ms = started.elapsed().as_millis() as u64, "analysis complete");
                Ok(AnalysisResponse {
                    request_id,
                    result,
                    cached: false,
                    fingerprint: fp,
                })
            }
            Err(err) => {
                self.metrics
                    .record_request(endpoint, Outcome::Error, started.elapsed(), client_id);
                Err(err.into())
            }
        }
    }

    /// Run a batch of analysis requests with bounded concurrency
    ///
    /// Admission is charged once at the batch's size, but metrics record
    /// each item individually. Output order matches input order and each
    /// item's failure is captured independently; cache hits short-circuit
    /// without occupying a concurrency slot.
    pub async fn handle_analysis_batch(
        &self,
        client_id: &str,
        endpoint: &str,
        jobs: Vec<AnalysisJob>,
        max_concurrent: usize,
    ) -> Result<Vec<Result<AnalysisResponse, PlaneError>>, PlaneError> {
        let started = std::time::Instant::now();
        let batch_cost = jobs.len() as f64;
        if let Err(denied) = self.admit(&self.analysis_limiter, client_id, endpoint, batch_cost) {
            return Err(denied);
        }

        let mut out: Vec<Option<Result<AnalysisResponse, PlaneError>>> =
            (0..jobs.len()).map(|_| None).collect();
        let mut misses = Vec::new();
        let mut items = Vec::new();

        for (idx, job) in jobs.into_iter().enumerate() {
            let fp = fingerprint(&job.params);
            if let Some(result) = self.cache.get(&fp) {
                self.metrics.record_request(
                    endpoint,
                    Outcome::Success,
                    started.elapsed(),
                    client_id,
                );
                out[idx] = Some(Ok(AnalysisResponse {
                    request_id: Uuid::new_v4(),
                    result,
                    cached: true,
                    fingerprint: fp,
                }));
            } else {
                misses.push((idx, fp, job.params));
                items.push(blocking_work(job.compute));
            }
        }

        let results = self
            .executor
            .execute_batch(items, max_concurrent, self.timeout)
            .await;

        for ((idx, fp, params), result) in misses.into_iter().zip(results) {
            out[idx] = Some(match result {
                Ok(result) => {
                    self.cache.put_with_metadata(
                        fp.clone(),
                        result.clone(),
                        meta_from_params(&params),
                    );
                    self.metrics.record_request(
                        endpoint,
                        Outcome::Success,
                        started.elapsed(),
                        client_id,
                    );
                    Ok(AnalysisResponse {
                        request_id: Uuid::new_v4(),
                        result,
                        cached: false,
                        fingerprint: fp,
                    })
                }
                Err(err) => {
                    self.metrics.record_request(
                        endpoint,
                        Outcome::Error,
                        started.elapsed(),
                        client_id,
                    );
                    Err(err.into())
                }
            });
        }

        Ok(out
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Err(PlaneError::Computation(anyhow::anyhow!(
                        "batch result slot never filled"
                    )))
                })
            })
            .collect())
    }

    /// Run a cheap management operation (listing, invalidation, stats
    /// lookups) under the lenient limiter
    pub async fn handle_management<T, F>(
        &self,
        client_id: &str,
        endpoint: &str,
        op: F,
    ) -> Result<T, PlaneError>
    where
        F: FnOnce() -> anyhow::Result<T>,
    {
        let started = std::time::Instant::now();
        if let Err(denied) = self.admit(&self.management_limiter, client_id, endpoint, 1.0) {
            return Err(denied);
        }

        match op() {
            Ok(value) => {
                self.metrics
                    .record_request(endpoint, Outcome::Success, started.elapsed(), client_id);
                Ok(value)
            }
            Err(err) => {
                self.metrics
                    .record_request(endpoint, Outcome::Error, started.elapsed(), client_id);
                Err(PlaneError::Computation(err))
            }
        }
    }

    /// Admission check; a denial is recorded as rate-limited, never as an
    /// error
    fn admit(
        &self,
        limiter: &RateLimiter,
        client_id: &str,
        endpoint: &str,
        cost: f64,
    ) -> Result<(), PlaneError> {
        match limiter.admit_with_cost(client_id, cost) {
            Admission::Allowed => Ok(()),
            denied @ Admission::Denied { .. } => {
                let retry_after_secs = denied.retry_after_secs();
                debug!(client = client_id, endpoint, retry_after_secs, "request rate limited");
                self.metrics
                    .record_request(endpoint, Outcome::RateLimited, Duration::ZERO, client_id);
                Err(PlaneError::RateLimited { retry_after_secs })
            }
        }
    }

    /// Drop cached results involving the given ticker
    pub fn invalidate_ticker(&self, ticker: &str) -> usize {
        let needle = ticker.to_uppercase();
        self.cache.invalidate_matching(|meta| {
            meta.get("tickers")
                .map(|t| t.split(',').any(|s| s == needle))
                .unwrap_or(false)
        })
    }

    /// Drop every cached result
    pub fn invalidate_cache(&self) {
        self.cache.invalidate_all();
    }

    /// Refill one client's analysis budget
    pub fn reset_client(&self, client_id: &str) {
        self.analysis_limiter.reset(client_id);
        self.management_limiter.reset(client_id);
    }

    /// Take a system resource sample; intended for a periodic scheduler
    pub fn record_system_sample(&self) {
        self.metrics.record_system_sample();
    }

    /// Periodic housekeeping: expired cache entries and aged metrics
    pub fn cleanup(&self, metrics_max_age: Duration) -> CleanupCounts {
        self.cache.cleanup();
        self.metrics.cleanup_old(metrics_max_age)
    }

    /// Stop accepting work and drain the executor
    pub async fn shutdown(&self) {
        info!("control plane shutting down");
        self.executor.shutdown().await;
    }

    // ------------------------------------------------------------------
    // Read-only snapshots for the metrics/health surface
    // ------------------------------------------------------------------

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn analysis_limiter_stats(&self) -> RateLimiterStats {
        self.analysis_limiter.stats()
    }

    pub fn management_limiter_stats(&self) -> RateLimiterStats {
        self.management_limiter.stats()
    }

    pub fn executor_stats(&self) -> ExecutorStats {
        self.executor.stats()
    }

    pub fn request_stats(&self, window: Duration) -> RequestStats {
        self.metrics.request_stats(window)
    }

    pub fn system_stats(&self) -> SystemStats {
        self.metrics.system_stats()
    }

    pub fn health_status(&self) -> HealthReport {
        self.metrics.health_status()
    }

    /// Everything a `/stats` endpoint needs in one call
    pub fn stats(&self) -> PlaneStats {
        PlaneStats {
            cache: self.cache.stats(),
            analysis_limiter: self.analysis_limiter.stats(),
            management_limiter: self.management_limiter.stats(),
            executor: self.executor.stats(),
            requests_1h: self.metrics.request_stats(Duration::from_secs(3600)),
        }
    }
}

/// Extract invalidation metadata from analysis parameters
///
/// Tickers are uppercased, sorted and joined so lookups are
/// order-insensitive, matching the fingerprint normalization.
fn meta_from_params(params: &Value) -> EntryMeta {
    let mut meta = EntryMeta::new();
    if let Some(tickers) = params.get("tickers").and_then(|t| t.as_array()) {
        let mut names: Vec<String> = tickers
            .iter()
            .filter_map(|t| t.as_str())
            .map(|t| t.to_uppercase())
            .collect();
        names.sort();
        meta.insert("tickers".to_string(), names.join(","));
    }
    if let Some(strategy) = params.get("strategy").and_then(|s| s.as_str()) {
        meta.insert("strategy".to_string(), strategy.to_string());
    }
    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn test_plane() -> (ControlPlane, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let plane = ControlPlane::with_clock(PlaneConfig::default(), clock.clone()).unwrap();
        (plane, clock)
    }

    fn params(tickers: &[&str]) -> Value {
        json!({"strategy": "ma_cross", "tickers": tickers, "short_window": 50, "long_window": 200})
    }

    #[tokio::test]
    async fn test_analysis_computes_then_serves_from_cache() {
        let (plane, _clock) = test_plane();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_a = calls.clone();
        let first = plane
            .handle_analysis("c1", "/backtest", &params(&["AAPL"]), move || {
                calls_a.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"sharpe": 1.2}))
            })
            .await
            .unwrap();
        assert!(!first.cached);

        let calls_b = calls.clone();
        let second = plane
            .handle_analysis("c1", "/backtest", &params(&["AAPL"]), move || {
                calls_b.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"sharpe": 1.2}))
            })
            .await
            .unwrap();
        assert!(second.cached);
        assert_eq!(second.result, first.result);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ticker_order_shares_cache_entry() {
        let (plane, _clock) = test_plane();

        let first = plane
            .handle_analysis("c1", "/backtest", &params(&["AAPL", "MSFT"]), || {
                Ok(json!({"sharpe": 0.9}))
            })
            .await
            .unwrap();

        let second = plane
            .handle_analysis("c1", "/backtest", &params(&["MSFT", "AAPL"]), || {
                anyhow::bail!("should have been served from cache")
            })
            .await
            .unwrap();

        assert_eq!(first.fingerprint, second.fingerprint);
        assert!(second.cached);
    }

    #[tokio::test]
    async fn test_rate_limit_denial_has_retry_hint() {
        let (plane, _clock) = test_plane();

        // Default analysis limit: 10/min with burst 3
        for i in 0..3 {
            let p = params(&[&format!("T{}", i)]);
            plane
                .handle_analysis("c1", "/backtest", &p, || Ok(json!({})))
                .await
                .unwrap();
        }

        let denied = plane
            .handle_analysis("c1", "/backtest", &params(&["X"]), || Ok(json!({})))
            .await;

        match denied {
            Err(PlaneError::RateLimited { retry_after_secs }) => {
                assert_eq!(retry_after_secs, 6);
            }
            other => panic!("expected rate limit denial, got {:?}", other.map(|r| r.cached)),
        }
    }

    #[tokio::test]
    async fn test_computation_error_passes_through() {
        let (plane, _clock) = test_plane();

        let result = plane
            .handle_analysis("c1", "/backtest", &params(&["AAPL"]), || {
                anyhow::bail!("insufficient price history")
            })
            .await;

        match result {
            Err(PlaneError::Computation(e)) => {
                assert!(e.to_string().contains("insufficient price history"))
            }
            _ => panic!("expected computation error"),
        }

        // Failures are not cached
        assert_eq!(plane.cache_stats().size, 0);
    }

    #[tokio::test]
    async fn test_management_limiter_is_independent() {
        let (plane, _clock) = test_plane();

        // Exhaust the analysis budget
        for i in 0..3 {
            let p = params(&[&format!("T{}", i)]);
            plane
                .handle_analysis("c1", "/backtest", &p, || Ok(json!({})))
                .await
                .unwrap();
        }
        assert!(plane
            .handle_analysis("c1", "/backtest", &params(&["X"]), || Ok(json!({})))
            .await
            .is_err());

        // Management operations still flow
        let listed = plane
            .handle_management("c1", "/strategies", || Ok(vec!["ma_cross", "macd"]))
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_ticker_targets_entries() {
        let (plane, _clock) = test_plane();

        plane
            .handle_analysis("c1", "/backtest", &params(&["AAPL", "MSFT"]), || {
                Ok(json!({"a": 1}))
            })
            .await
            .unwrap();
        plane
            .handle_analysis("c1", "/backtest", &params(&["NVDA"]), || Ok(json!({"b": 2})))
            .await
            .unwrap();

        assert_eq!(plane.invalidate_ticker("aapl"), 1);
        assert_eq!(plane.cache_stats().size, 1);
    }

    #[tokio::test]
    async fn test_batch_preserves_order_and_isolates_failures() {
        let (plane, _clock) = test_plane();

        let jobs = vec![
            AnalysisJob::new(params(&["A"]), || Ok(json!({"i": 0}))),
            AnalysisJob::new(params(&["B"]), || anyhow::bail!("bad symbol")),
            AnalysisJob::new(params(&["C"]), || Ok(json!({"i": 2}))),
        ];

        let results = plane
            .handle_analysis_batch("c1", "/backtest/batch", jobs, 2)
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().result, json!({"i": 0}));
        assert!(matches!(results[1], Err(PlaneError::Computation(_))));
        assert_eq!(results[2].as_ref().unwrap().result, json!({"i": 2}));
    }

    #[tokio::test]
    async fn test_batch_uses_cache_hits() {
        let (plane, _clock) = test_plane();

        plane
            .handle_analysis("c1", "/backtest", &params(&["AAPL"]), || Ok(json!({"v": 1})))
            .await
            .unwrap();
        plane.reset_client("c1");

        let jobs = vec![
            AnalysisJob::new(params(&["AAPL"]), || {
                anyhow::bail!("should have hit the cache")
            }),
            AnalysisJob::new(params(&["NVDA"]), || Ok(json!({"v": 2}))),
        ];

        let results = plane
            .handle_analysis_batch("c1", "/backtest/batch", jobs, 2)
            .await
            .unwrap();

        assert!(results[0].as_ref().unwrap().cached);
        assert!(!results[1].as_ref().unwrap().cached);
    }

    #[tokio::test]
    async fn test_batch_records_one_metric_per_item() {
        let (plane, _clock) = test_plane();

        let jobs = vec![
            AnalysisJob::new(params(&["A"]), || Ok(json!({"i": 0}))),
            AnalysisJob::new(params(&["B"]), || anyhow::bail!("bad symbol")),
            AnalysisJob::new(params(&["C"]), || Ok(json!({"i": 2}))),
        ];

        plane
            .handle_analysis_batch("c1", "/backtest/batch", jobs, 2)
            .await
            .unwrap();

        // A partially failed batch still surfaces its successes
        let stats = plane.request_stats(Duration::from_secs(3600));
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.by_outcome["success"], 2);
        assert_eq!(stats.by_outcome["error"], 1);
    }

    #[tokio::test]
    async fn test_metrics_recorded_per_outcome() {
        let (plane, _clock) = test_plane();

        plane
            .handle_analysis("c1", "/backtest", &params(&["AAPL"]), || Ok(json!({})))
            .await
            .unwrap();
        let _ = plane
            .handle_analysis("c2", "/backtest", &params(&["MSFT"]), || {
                anyhow::bail!("boom")
            })
            .await;

        let stats = plane.request_stats(Duration::from_secs(3600));
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.unique_clients, 2);
        assert_eq!(stats.by_outcome["success"], 1);
        assert_eq!(stats.by_outcome["error"], 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_analysis() {
        let (plane, _clock) = test_plane();
        plane.shutdown().await;

        let result = plane
            .handle_analysis("c1", "/backtest", &params(&["AAPL"]), || Ok(json!({})))
            .await;
        assert!(matches!(result, Err(PlaneError::ShuttingDown)));
    }

    #[test]
    fn test_meta_from_params_sorts_and_uppercases() {
        let meta = meta_from_params(&json!({
            "strategy": "macd",
            "tickers": ["msft", "AAPL"]
        }));
        assert_eq!(meta["tickers"], "AAPL,MSFT");
        assert_eq!(meta["strategy"], "macd");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = PlaneConfig::default();
        config.cache.max_size = 0;
        assert!(ControlPlane::new(config).is_err());
    }
}
