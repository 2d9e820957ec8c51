//! quantgate: request control-plane for a backtesting/analysis API
//!
//! Every analysis request passes through the same sequence of
//! concurrency-safe building blocks before and after the (external)
//! strategy computation:
//!
//! 1. [`limiter::RateLimiter`]: per-client token-bucket admission, with
//!    separate budgets for expensive analysis and cheap management traffic
//! 2. [`cache::ResultCache`]: fingerprint-keyed results with per-entry TTL
//!    and bounded size
//! 3. [`executor::BoundedExecutor`]: fixed-size worker pools with per-call
//!    timeouts and bounded, order-preserving batches
//! 4. [`metrics::MetricsAggregator`]: outcome ring buffers, rolling stats
//!    and a composite health verdict
//!
//! [`plane::ControlPlane`] composes the four into the single entry point a
//! service embeds; HTTP routing, CLI parsing and the strategy computation
//! itself live outside this crate.
//!
//! Everything is single-process and in-memory, safe for any number of
//! concurrent callers within one service instance.

pub mod cache;
pub mod clock;
pub mod config;
pub mod executor;
pub mod limiter;
pub mod metrics;
pub mod plane;

pub use cache::{fingerprint, CacheStats, ResultCache};
pub use clock::{ManualClock, SharedClock, SystemClock, TimeSource};
pub use config::{ConfigError, PlaneConfig};
pub use executor::{BoundedExecutor, ExecError, ExecutorConfig};
pub use limiter::{Admission, RateLimitConfig, RateLimiter};
pub use metrics::{HealthReport, HealthState, MetricsAggregator, Outcome};
pub use plane::{AnalysisJob, AnalysisResponse, ControlPlane, PlaneError};
