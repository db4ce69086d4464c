//! MonitorMachines - Circuit breaking, rate limiting and metrics for async operations
//!
//! This crate wraps fallible async work with:
//! - A per-operation circuit breaker (Closed → Open → HalfOpen) with a single half-open probe
//! - Fixed-spacing rate limiting per resource, released in arrival order
//! - Metric recording and duration timers published as events
//! - An in-process event bus with panic-isolated subscribers
//! - Administrative overrides for operators
//!
//! # Example
//!
//! ```rust
//! use monitor_machines::{Monitor, MonitorEvent};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let monitor = Monitor::builder()
//!     .failure_threshold(3)
//!     .reset_timeout(Duration::from_secs(30))
//!     .on_open(|name| println!("Circuit {} opened!", name))
//!     .build()
//!     .unwrap();
//!
//! monitor.subscribe(|event| {
//!     if let MonitorEvent::OperationFailure { operation, error } = event {
//!         eprintln!("{operation} failed: {error}");
//!     }
//! });
//!
//! // Execute with circuit protection
//! let result = monitor
//!     .execute_with_circuit_breaker("fetch", || async {
//!         // Your service call here
//!         Ok::<_, String>("success")
//!     })
//!     .await;
//! assert_eq!(result.unwrap(), "success");
//!
//! // Record an observation of your own
//! monitor.record_metric("queue.depth", 12.0);
//! # }
//! ```

pub mod builder;
pub mod callbacks;
pub mod circuit;
pub mod classifier;
pub mod config;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod monitor;
pub mod rate_limiter;

pub use builder::MonitorBuilder;
pub use callbacks::{Transition, TransitionHooks};
pub use circuit::{CircuitBreaker, CircuitSnapshot, CircuitState, Permit};
pub use classifier::{DefaultClassifier, FailureClassifier, FailureContext, PredicateClassifier};
pub use config::{
    CircuitConfig, EventConfig, MonitorConfig, MonitorSettings, RateLimitConfig,
};
pub use errors::{CircuitError, MisuseError};
pub use events::{EventBus, MonitorEvent, SubscriptionId};
pub use metrics::{Metric, MetricRecorder, Tags, TimerHandle};
pub use monitor::{AdminHandle, CallOptions, FallbackContext, Monitor};
pub use rate_limiter::{DEFAULT_RESOURCE, RateLimiter};
