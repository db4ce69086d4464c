//! Operation executor
//!
//! [`Monitor`] composes the circuit breaker, rate limiter and metric recorder
//! around a unit of work and publishes the outcome on the event bus. It is a
//! cheap handle: clone it into every task that needs it.

use crate::circuit::{CircuitBreaker, CircuitSnapshot, CircuitState};
use crate::config::MonitorConfig;
use crate::errors::{CircuitError, MisuseError};
use crate::events::{EventBus, MonitorEvent, SubscriptionId};
use crate::metrics::{MetricRecorder, TimerHandle};
use crate::rate_limiter::{DEFAULT_RESOURCE, RateLimiter};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Context handed to a fallback when the circuit refuses a call
#[derive(Debug, Clone)]
pub struct FallbackContext {
    pub operation: String,
    pub state: CircuitState,
    pub retry_after: Option<Duration>,
}

pub type FallbackFn<T, E> = Box<dyn FnOnce(&FallbackContext) -> Result<T, E> + Send>;

/// Per-call options
pub struct CallOptions<T, E> {
    /// Rate-limit resource; defaults to the operation name
    pub resource: Option<String>,
    /// Run instead of returning `CircuitError::Open`
    pub fallback: Option<FallbackFn<T, E>>,
}

impl<T, E> Default for CallOptions<T, E> {
    fn default() -> Self {
        Self {
            resource: None,
            fallback: None,
        }
    }
}

impl<T, E> CallOptions<T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_fallback<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&FallbackContext) -> Result<T, E> + Send + 'static,
    {
        self.fallback = Some(Box::new(f));
        self
    }
}

impl<T, E> std::fmt::Debug for CallOptions<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOptions")
            .field("resource", &self.resource)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct MonitorInner {
    config: MonitorConfig,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    recorder: MetricRecorder,
    bus: Arc<EventBus>,
}

/// Resilience and metrics monitor
#[derive(Debug, Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

impl Monitor {
    /// Build a monitor from a validated configuration
    pub fn new(config: MonitorConfig) -> Result<Self, MisuseError> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> crate::builder::MonitorBuilder {
        crate::builder::MonitorBuilder::new()
    }

    pub(crate) fn from_parts(config: MonitorConfig, breaker: CircuitBreaker) -> Self {
        let bus = Arc::new(EventBus::new(config.events.channel_capacity));
        let recorder = MetricRecorder::new(bus.clone());
        let limiter = RateLimiter::new(config.rate_limit.clone());

        info!(
            rate_limit_delay_ms = config.rate_limit.delay.as_millis() as u64,
            rate_limit_overrides = config.rate_limit.resources.len(),
            "Monitor initialized"
        );

        Self {
            inner: Arc::new(MonitorInner {
                config,
                breaker,
                limiter,
                recorder,
                bus,
            }),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Run `work` behind the circuit, rate limit and instrumentation for `name`
    pub async fn execute_with_circuit_breaker<F, Fut, T, E>(
        &self,
        name: &str,
        work: F,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display + 'static,
    {
        self.execute_with_options(name, work, CallOptions::default())
            .await
    }

    /// Same as [`Monitor::execute_with_circuit_breaker`], with per-call options
    pub async fn execute_with_options<F, Fut, T, E>(
        &self,
        name: &str,
        work: F,
        options: CallOptions<T, E>,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display + 'static,
    {
        let inner = &self.inner;

        let permit = match inner.breaker.admit::<E>(name) {
            Ok(permit) => permit,
            Err(CircuitError::Open {
                circuit,
                retry_after,
            }) => {
                if let Some(fallback) = options.fallback {
                    debug!(operation = %name, "Circuit open, using fallback");
                    let ctx = FallbackContext {
                        operation: circuit,
                        state: CircuitState::Open,
                        retry_after,
                    };
                    return fallback(&ctx).map_err(CircuitError::Execution);
                }
                return Err(CircuitError::Open {
                    circuit,
                    retry_after,
                });
            }
            Err(other) => return Err(other),
        };

        let resource = options.resource.as_deref().unwrap_or(name);
        inner.limiter.acquire(resource).await;

        let timer = inner.recorder.start_timer(name);
        let result = work().await;
        let elapsed = timer.finish();

        match result {
            Ok(value) => {
                permit.succeed();
                inner
                    .recorder
                    .record_tagged(name, 1.0, [("outcome", "success")]);
                inner.bus.publish(MonitorEvent::OperationSuccess {
                    operation: name.to_string(),
                });
                Ok(value)
            }
            Err(error) => {
                let counted = inner.breaker.should_count(name, &error, elapsed);
                permit.fail(counted);
                inner
                    .recorder
                    .record_tagged(name, 1.0, [("outcome", "failure")]);
                inner.bus.publish(MonitorEvent::OperationFailure {
                    operation: name.to_string(),
                    error: error.to_string(),
                });
                Err(CircuitError::Execution(error))
            }
        }
    }

    /// Wait for the rate limit of `resource`
    pub async fn enforce_rate_limit(&self, resource: &str) {
        self.inner.limiter.acquire(resource).await;
    }

    /// Wait for the rate limit shared by callers that name no resource
    ///
    /// Uses the [`DEFAULT_RESOURCE`] key, so a `"default"` entry in the
    /// per-resource overrides applies here.
    pub async fn enforce_default_rate_limit(&self) {
        self.enforce_rate_limit(DEFAULT_RESOURCE).await;
    }

    pub fn record_metric(&self, name: impl Into<String>, value: f64) {
        self.inner.recorder.record(name, value);
    }

    pub fn record_metric_tagged<I, K, V>(&self, name: impl Into<String>, value: f64, tags: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.inner.recorder.record_tagged(name, value, tags);
    }

    pub fn start_timer(&self, operation: impl Into<String>) -> TimerHandle {
        self.inner.recorder.start_timer(operation)
    }

    pub fn recorder(&self) -> &MetricRecorder {
        &self.inner.recorder
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&MonitorEvent) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.bus.unsubscribe(id)
    }

    pub fn subscribe_channel(&self) -> broadcast::Receiver<MonitorEvent> {
        self.inner.bus.subscribe_channel()
    }

    pub fn circuit_state(&self, name: &str) -> CircuitState {
        self.inner.breaker.state(name)
    }

    pub fn circuit_snapshot(&self, name: &str) -> Option<CircuitSnapshot> {
        self.inner.breaker.snapshot(name)
    }

    /// Operator surface for overriding circuits and clearing state
    pub fn admin(&self) -> AdminHandle {
        AdminHandle {
            monitor: self.clone(),
        }
    }
}

/// Administrative controls over a monitor
#[derive(Debug, Clone)]
pub struct AdminHandle {
    monitor: Monitor,
}

impl AdminHandle {
    pub fn force_open(&self, name: &str) {
        self.monitor.inner.breaker.force_open(name);
    }

    pub fn force_close(&self, name: &str) {
        self.monitor.inner.breaker.force_close(name);
    }

    pub fn reset(&self, name: &str) {
        self.monitor.inner.breaker.reset(name);
    }

    /// Reset every circuit and forget every rate-limit schedule
    pub fn reset_all(&self) {
        warn!("Resetting all circuits and rate limits");
        self.monitor.inner.breaker.reset_all();
        self.monitor.inner.limiter.reset();
    }

    pub fn snapshot(&self, name: &str) -> Option<CircuitSnapshot> {
        self.monitor.inner.breaker.snapshot(name)
    }

    pub fn circuits(&self) -> Vec<CircuitSnapshot> {
        self.monitor.inner.breaker.snapshots()
    }
}
