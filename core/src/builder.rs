//! Builder API for ergonomic monitor configuration

use crate::{
    callbacks::TransitionHooks,
    circuit::CircuitBreaker,
    classifier::FailureClassifier,
    config::MonitorConfig,
    errors::MisuseError,
    monitor::Monitor,
};
use std::sync::Arc;
use std::time::Duration;

/// Builder for creating monitors with fluent API
#[derive(Debug, Default)]
pub struct MonitorBuilder {
    config: MonitorConfig,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    hooks: TransitionHooks,
}

impl MonitorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration, e.g. one loaded from `MonitorSettings`
    pub fn config(mut self, config: MonitorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the consecutive failures needed to open a circuit
    pub fn failure_threshold(mut self, threshold: usize) -> Self {
        self.config.circuit.failure_threshold = threshold;
        self
    }

    /// Set how long an open circuit refuses calls before probing
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.circuit.reset_timeout = timeout;
        self
    }

    /// Set the success threshold (successes needed to close from half-open)
    pub fn success_threshold(mut self, threshold: usize) -> Self {
        self.config.circuit.success_threshold = threshold;
        self
    }

    /// Set the jitter factor (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: timeout * (1 - jitter + rand * jitter)
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.config.circuit.jitter_factor = factor;
        self
    }

    /// Set the default spacing between calls to the same resource
    pub fn rate_limit_delay(mut self, delay: Duration) -> Self {
        self.config.rate_limit.delay = delay;
        self
    }

    /// Override the spacing for one resource
    pub fn resource_delay(mut self, resource: impl Into<String>, delay: Duration) -> Self {
        self.config.rate_limit.resources.insert(resource.into(), delay);
        self
    }

    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.events.channel_capacity = capacity;
        self
    }

    /// Set a failure classifier to filter which errors should trip circuits
    ///
    /// Errors the classifier rejects are still returned to the caller and
    /// still published as `operation:failure`, but never move a circuit.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use monitor_machines::{Monitor, PredicateClassifier};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// let monitor = Monitor::builder()
    ///     .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
    ///         // Only trip on slow errors
    ///         ctx.elapsed > Duration::from_secs(1)
    ///     })))
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    /// Set callback for when a circuit opens
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.hooks.on_open = Some(Arc::new(f));
        self
    }

    /// Set callback for when a circuit closes
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.hooks.on_close = Some(Arc::new(f));
        self
    }

    /// Set callback for when a circuit enters half-open
    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.hooks.on_half_open = Some(Arc::new(f));
        self
    }

    /// Validate the configuration and build the monitor
    pub fn build(self) -> Result<Monitor, MisuseError> {
        self.config.validate()?;

        let breaker = CircuitBreaker::with_parts(
            self.config.circuit.clone(),
            self.failure_classifier,
            self.hooks,
        );

        Ok(Monitor::from_parts(self.config, breaker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitState;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_builder_defaults() {
        let monitor = MonitorBuilder::new().build().expect("defaults are valid");

        assert_eq!(monitor.config(), &MonitorConfig::default());
        assert_eq!(monitor.circuit_state("anything"), CircuitState::Closed);
    }

    #[test]
    fn test_builder_custom_config() {
        let monitor = MonitorBuilder::new()
            .failure_threshold(10)
            .reset_timeout(Duration::from_secs(60))
            .success_threshold(3)
            .rate_limit_delay(Duration::from_millis(20))
            .resource_delay("billing", Duration::from_millis(500))
            .build()
            .expect("valid config");

        let config = monitor.config();
        assert_eq!(config.circuit.failure_threshold, 10);
        assert_eq!(config.circuit.reset_timeout, Duration::from_secs(60));
        assert_eq!(config.circuit.success_threshold, 3);
        assert_eq!(
            config.rate_limit.spacing_for("billing"),
            Duration::from_millis(500)
        );
        assert_eq!(
            config.rate_limit.spacing_for("search"),
            Duration::from_millis(20)
        );
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let err = MonitorBuilder::new().failure_threshold(0).build().unwrap_err();
        assert!(matches!(
            err,
            MisuseError::InvalidConfig {
                field: "failure_threshold",
                ..
            }
        ));

        let err = MonitorBuilder::new().jitter_factor(1.5).build().unwrap_err();
        assert!(matches!(
            err,
            MisuseError::InvalidConfig {
                field: "jitter_factor",
                ..
            }
        ));

        let err = MonitorBuilder::new()
            .event_channel_capacity(0)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            MisuseError::InvalidConfig {
                field: "channel_capacity",
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_builder_with_callbacks() {
        let opened = Arc::new(AtomicBool::new(false));
        let opened_clone = opened.clone();

        let monitor = MonitorBuilder::new()
            .failure_threshold(2)
            .on_open(move |_name| {
                opened_clone.store(true, Ordering::SeqCst);
            })
            .build()
            .expect("valid config");

        // Trigger failures to open circuit
        let _ = monitor
            .execute_with_circuit_breaker("test", || async { Err::<(), _>("error 1") })
            .await;
        let _ = monitor
            .execute_with_circuit_breaker("test", || async { Err::<(), _>("error 2") })
            .await;

        // Callback should have been triggered
        assert!(opened.load(Ordering::SeqCst));
    }
}
