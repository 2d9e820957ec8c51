//! Request metrics and health aggregation
//!
//! Per-request outcomes land in a count- and age-bounded ring buffer;
//! system resource samples land in a second one. Rolling statistics are
//! derived on demand over a caller-chosen window, and a composite health
//! verdict combines resource thresholds with the 1-hour error rate.
//!
//! Telemetry is fatal to nothing: a failed resource reading skips that one
//! observation and never propagates to request handling.

mod system;

pub use system::{SystemSample, SystemSampler};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::clock::SharedClock;

/// Resource thresholds for the health verdict
const CPU_UNHEALTHY_PCT: f64 = 90.0;
const MEMORY_UNHEALTHY_PCT: f64 = 90.0;
const DISK_UNHEALTHY_PCT: f64 = 95.0;
const CPU_DEGRADED_PCT: f64 = 75.0;
const MEMORY_DEGRADED_PCT: f64 = 80.0;
const DISK_DEGRADED_PCT: f64 = 85.0;
const ERROR_RATE_UNHEALTHY: f64 = 0.10;
const ERROR_RATE_DEGRADED: f64 = 0.05;

/// Classification of a request outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Error,
    RateLimited,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Error => "error",
            Outcome::RateLimited => "rate_limited",
        }
    }
}

/// One recorded request
#[derive(Debug, Clone, Serialize)]
pub struct RequestMetric {
    pub endpoint: String,
    pub outcome: Outcome,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
    pub client_id: String,
}

/// Rolling all-time tally for one endpoint
#[derive(Debug, Clone, Default, Serialize)]
pub struct EndpointTally {
    pub count: u64,
    pub total_latency: Duration,
    pub errors: u64,
}

/// Per-endpoint breakdown within a stats window
#[derive(Debug, Clone, Default, Serialize)]
pub struct EndpointStats {
    pub count: u64,
    pub avg_latency_ms: f64,
    pub errors: u64,
}

/// Windowed request statistics
///
/// All-zero (not an error) when no requests fall inside the window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestStats {
    pub total_requests: u64,
    pub avg_latency_ms: f64,
    pub error_rate: f64,
    pub requests_per_hour: f64,
    pub unique_clients: usize,
    pub by_outcome: HashMap<String, u64>,
    pub by_endpoint: HashMap<String, EndpointStats>,
}

/// Latest sample plus 1-hour rolling averages
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub latest: Option<SystemSample>,
    pub avg_cpu_percent_1h: f64,
    pub avg_memory_percent_1h: f64,
    pub avg_disk_percent_1h: f64,
    pub sample_count: usize,
}

/// Composite health verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health verdict with one textual issue per contributing factor
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub status: HealthState,
    pub issues: Vec<String>,
}

/// Entries removed by [`MetricsAggregator::cleanup_old`]
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CleanupCounts {
    pub requests_removed: usize,
    pub samples_removed: usize,
}

/// Aggregator configuration
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Ring buffer cap for request metrics
    pub max_requests: usize,
    /// Ring buffer cap for system samples
    pub max_samples: usize,
    /// Entries older than this are dropped on append
    pub retention: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_requests: 10_000,
            max_samples: 1_440,
            retention: Duration::from_secs(24 * 3600),
        }
    }
}

struct MetricsInner {
    requests: VecDeque<RequestMetric>,
    samples: VecDeque<SystemSample>,
    endpoints: HashMap<String, EndpointTally>,
}

/// Records outcomes and resource samples, derives stats and health
///
/// One mutex guards both ring buffers and the endpoint tally; the sysinfo
/// handles sit behind a second mutex, and the two are never held together.
pub struct MetricsAggregator {
    config: MetricsConfig,
    clock: SharedClock,
    inner: Mutex<MetricsInner>,
    sampler: Mutex<SystemSampler>,
}

impl MetricsAggregator {
    pub fn new(config: MetricsConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(MetricsInner {
                requests: VecDeque::new(),
                samples: VecDeque::new(),
                endpoints: HashMap::new(),
            }),
            sampler: Mutex::new(SystemSampler::new()),
        }
    }

    /// Record one request outcome
    pub fn record_request(
        &self,
        endpoint: &str,
        outcome: Outcome,
        latency: Duration,
        client_id: &str,
    ) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();

        let tally = inner.endpoints.entry(endpoint.to_string()).or_default();
        tally.count += 1;
        tally.total_latency += latency;
        if outcome == Outcome::Error {
            tally.errors += 1;
        }

        inner.requests.push_back(RequestMetric {
            endpoint: endpoint.to_string(),
            outcome,
            latency,
            timestamp: now,
            client_id: client_id.to_string(),
        });

        let max = self.config.max_requests;
        let horizon = self.age_horizon(now);
        evict(&mut inner.requests, max, horizon, |m| m.timestamp);
    }

    /// Take and record a system resource sample, best-effort
    pub fn record_system_sample(&self) {
        let now = self.clock.now();
        let sample = self.sampler.lock().unwrap().sample(now);
        match sample {
            Some(sample) => self.record_sample(sample),
            None => debug!("system sample skipped"),
        }
    }

    /// Record an externally built sample (synthetic or alternate source)
    pub fn record_sample(&self, sample: SystemSample) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        inner.samples.push_back(sample);

        let max = self.config.max_samples;
        let horizon = self.age_horizon(now);
        evict(&mut inner.samples, max, horizon, |s| s.timestamp);
    }

    /// Statistics over requests recorded within the trailing window
    pub fn request_stats(&self, window: Duration) -> RequestStats {
        let now = self.clock.now();
        let cutoff = now
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::hours(1));
        let inner = self.inner.lock().unwrap();

        let in_window: Vec<&RequestMetric> = inner
            .requests
            .iter()
            .filter(|m| m.timestamp >= cutoff)
            .collect();

        if in_window.is_empty() {
            return RequestStats::default();
        }

        let total = in_window.len() as u64;
        let total_latency: Duration = in_window.iter().map(|m| m.latency).sum();
        let errors = in_window
            .iter()
            .filter(|m| m.outcome == Outcome::Error)
            .count() as u64;
        let clients: HashSet<&str> = in_window.iter().map(|m| m.client_id.as_str()).collect();

        let mut by_outcome: HashMap<String, u64> = HashMap::new();
        let mut by_endpoint: HashMap<String, EndpointStats> = HashMap::new();
        let mut endpoint_latency: HashMap<String, Duration> = HashMap::new();
        for metric in &in_window {
            *by_outcome
                .entry(metric.outcome.as_str().to_string())
                .or_default() += 1;
            let entry = by_endpoint.entry(metric.endpoint.clone()).or_default();
            entry.count += 1;
            if metric.outcome == Outcome::Error {
                entry.errors += 1;
            }
            *endpoint_latency.entry(metric.endpoint.clone()).or_default() += metric.latency;
        }
        for (endpoint, stats) in by_endpoint.iter_mut() {
            if let Some(latency) = endpoint_latency.get(endpoint) {
                stats.avg_latency_ms = latency.as_secs_f64() * 1000.0 / stats.count as f64;
            }
        }

        let window_hours = window.as_secs_f64() / 3600.0;

        RequestStats {
            total_requests: total,
            avg_latency_ms: total_latency.as_secs_f64() * 1000.0 / total as f64,
            error_rate: errors as f64 / total as f64,
            requests_per_hour: if window_hours > 0.0 {
                total as f64 / window_hours
            } else {
                0.0
            },
            unique_clients: clients.len(),
            by_outcome,
            by_endpoint,
        }
    }

    /// All-time per-endpoint tallies
    pub fn endpoint_totals(&self) -> HashMap<String, EndpointTally> {
        self.inner.lock().unwrap().endpoints.clone()
    }

    /// Latest sample plus 1-hour rolling averages
    ///
    /// Takes an on-demand sample when none have been recorded yet.
    pub fn system_stats(&self) -> SystemStats {
        self.ensure_sampled();

        let now = self.clock.now();
        let cutoff = now - chrono::Duration::hours(1);
        let inner = self.inner.lock().unwrap();

        let recent: Vec<&SystemSample> = inner
            .samples
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .collect();
        let n = recent.len().max(1) as f64;

        SystemStats {
            latest: inner.samples.back().cloned(),
            avg_cpu_percent_1h: recent.iter().map(|s| s.cpu_percent).sum::<f64>() / n,
            avg_memory_percent_1h: recent.iter().map(|s| s.memory_percent).sum::<f64>() / n,
            avg_disk_percent_1h: recent.iter().map(|s| s.disk_percent).sum::<f64>() / n,
            sample_count: inner.samples.len(),
        }
    }

    /// Composite health verdict
    ///
    /// Unhealthy when CPU, memory or disk exceed their hard thresholds, or
    /// when the 1-hour error rate exceeds 10%. Elevated-but-tolerable
    /// readings degrade instead. Every contributing factor gets one issue
    /// line.
    pub fn health_status(&self) -> HealthReport {
        self.ensure_sampled();

        let mut issues = Vec::new();
        let mut status = HealthState::Healthy;
        fn raise(status: &mut HealthState, target: HealthState) {
            if target == HealthState::Unhealthy || *status == HealthState::Healthy {
                *status = target;
            }
        }

        let latest = self.inner.lock().unwrap().samples.back().cloned();
        if let Some(sample) = latest {
            if sample.cpu_percent > CPU_UNHEALTHY_PCT {
                issues.push(format!("CPU usage critical: {:.1}%", sample.cpu_percent));
                raise(&mut status, HealthState::Unhealthy);
            } else if sample.cpu_percent > CPU_DEGRADED_PCT {
                issues.push(format!("CPU usage elevated: {:.1}%", sample.cpu_percent));
                raise(&mut status, HealthState::Degraded);
            }

            if sample.memory_percent > MEMORY_UNHEALTHY_PCT {
                issues.push(format!(
                    "memory usage critical: {:.1}%",
                    sample.memory_percent
                ));
                raise(&mut status, HealthState::Unhealthy);
            } else if sample.memory_percent > MEMORY_DEGRADED_PCT {
                issues.push(format!(
                    "memory usage elevated: {:.1}%",
                    sample.memory_percent
                ));
                raise(&mut status, HealthState::Degraded);
            }

            if sample.disk_percent > DISK_UNHEALTHY_PCT {
                issues.push(format!("disk usage critical: {:.1}%", sample.disk_percent));
                raise(&mut status, HealthState::Unhealthy);
            } else if sample.disk_percent > DISK_DEGRADED_PCT {
                issues.push(format!("disk usage elevated: {:.1}%", sample.disk_percent));
                raise(&mut status, HealthState::Degraded);
            }
        }

        let hour = self.request_stats(Duration::from_secs(3600));
        if hour.total_requests > 0 {
            if hour.error_rate > ERROR_RATE_UNHEALTHY {
                issues.push(format!(
                    "error rate critical: {:.1}% over the last hour",
                    hour.error_rate * 100.0
                ));
                raise(&mut status, HealthState::Unhealthy);
            } else if hour.error_rate > ERROR_RATE_DEGRADED {
                issues.push(format!(
                    "error rate elevated: {:.1}% over the last hour",
                    hour.error_rate * 100.0
                ));
                raise(&mut status, HealthState::Degraded);
            }
        }

        HealthReport {
            healthy: status == HealthState::Healthy,
            status,
            issues,
        }
    }

    /// Drop entries older than `max_age` from both ring buffers
    pub fn cleanup_old(&self, max_age: Duration) -> CleanupCounts {
        let now = self.clock.now();
        let cutoff = now
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::hours(24));
        let mut inner = self.inner.lock().unwrap();

        let requests_before = inner.requests.len();
        inner.requests.retain(|m| m.timestamp >= cutoff);
        let samples_before = inner.samples.len();
        inner.samples.retain(|s| s.timestamp >= cutoff);

        let counts = CleanupCounts {
            requests_removed: requests_before - inner.requests.len(),
            samples_removed: samples_before - inner.samples.len(),
        };
        if counts.requests_removed > 0 || counts.samples_removed > 0 {
            debug!(
                requests = counts.requests_removed,
                samples = counts.samples_removed,
                "dropped aged metrics"
            );
        }
        counts
    }

    fn ensure_sampled(&self) {
        let empty = self.inner.lock().unwrap().samples.is_empty();
        if empty {
            self.record_system_sample();
        }
    }

    fn age_horizon(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::hours(24))
    }
}

/// Ring-buffer eviction: oldest out by count, then by age
fn evict<T>(
    buf: &mut VecDeque<T>,
    max: usize,
    horizon: DateTime<Utc>,
    timestamp: impl Fn(&T) -> DateTime<Utc>,
) {
    while buf.len() > max {
        buf.pop_front();
    }
    while buf.front().map(|e| timestamp(e) < horizon).unwrap_or(false) {
        buf.pop_front();
    }
}
