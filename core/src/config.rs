//! Monitor configuration
//!
//! `MonitorConfig` is the validated runtime shape. `MonitorSettings` is what a
//! settings file or the environment provides: durations in milliseconds and
//! signed integers, so a negative value is reported as a configuration error
//! instead of a parse failure.

use crate::errors::MisuseError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Environment prefix for settings overrides (`MONITOR__CIRCUIT__FAILURE_THRESHOLD=3`)
pub const ENV_PREFIX: &str = "MONITOR";

/// Circuit breaker configuration, shared by every circuit of a monitor
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    /// Consecutive failures in Closed that open the circuit
    pub failure_threshold: usize,

    /// How long Open is held before a half-open probe is admitted
    pub reset_timeout: Duration,

    /// Successes needed in HalfOpen to close the circuit
    pub success_threshold: usize,

    /// Jitter factor for reset_timeout (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: timeout * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 1,
            jitter_factor: 0.0,
        }
    }
}

impl CircuitConfig {
    pub fn validate(&self) -> Result<(), MisuseError> {
        if self.failure_threshold == 0 {
            return Err(MisuseError::invalid(
                "failure_threshold",
                "must be greater than 0",
            ));
        }

        if self.success_threshold == 0 {
            return Err(MisuseError::invalid(
                "success_threshold",
                "must be greater than 0",
            ));
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(MisuseError::invalid(
                "jitter_factor",
                format!("must be within 0.0..=1.0, got {}", self.jitter_factor),
            ));
        }

        Ok(())
    }

    /// Time an opened circuit stays Open, with jitter applied
    pub(crate) fn hold_time(&self) -> Duration {
        if self.jitter_factor <= 0.0 {
            return self.reset_timeout;
        }

        let base_ms = self.reset_timeout.as_millis() as u64;
        let policy = chrono_machines::Policy {
            max_attempts: 1,
            base_delay_ms: base_ms,
            multiplier: 1.0,
            max_delay_ms: base_ms,
        };
        Duration::from_millis(policy.calculate_delay(1, self.jitter_factor))
    }
}

/// Fixed-spacing rate limit configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitConfig {
    /// Minimum spacing between releases of the same resource; zero disables limiting
    pub delay: Duration,

    /// Per-resource spacing overrides
    pub resources: HashMap<String, Duration>,
}

impl RateLimitConfig {
    /// Spacing that applies to `resource`
    pub fn spacing_for(&self, resource: &str) -> Duration {
        self.resources.get(resource).copied().unwrap_or(self.delay)
    }
}

/// Event bus configuration
#[derive(Debug, Clone, PartialEq)]
pub struct EventConfig {
    /// Buffer of the broadcast channel handed out by `subscribe_channel`
    pub channel_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

/// Complete monitor configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorConfig {
    pub circuit: CircuitConfig,
    pub rate_limit: RateLimitConfig,
    pub events: EventConfig,
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), MisuseError> {
        self.circuit.validate()?;

        if self.events.channel_capacity == 0 {
            return Err(MisuseError::invalid(
                "channel_capacity",
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitSettings {
    pub failure_threshold: i64,
    pub reset_timeout_ms: i64,
    pub success_threshold: i64,
    pub jitter_factor: f64,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        let defaults = CircuitConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold as i64,
            reset_timeout_ms: defaults.reset_timeout.as_millis() as i64,
            success_threshold: defaults.success_threshold as i64,
            jitter_factor: defaults.jitter_factor,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub delay_ms: i64,
    pub resources: HashMap<String, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    pub channel_capacity: i64,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            channel_capacity: EventConfig::default().channel_capacity as i64,
        }
    }
}

/// Settings as read from a TOML file and `MONITOR__*` environment variables
///
/// ```toml
/// [circuit]
/// failure_threshold = 3
/// reset_timeout_ms = 100
///
/// [rate_limit]
/// delay_ms = 50
///
/// [rate_limit.resources]
/// search_api = 250
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub circuit: CircuitSettings,
    pub rate_limit: RateLimitSettings,
    pub events: EventSettings,
}

impl MonitorSettings {
    /// Load settings from an optional TOML file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, MisuseError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            debug!(path = %path.display(), "Loading monitor settings file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(settings)
    }

    /// Parse settings from TOML text, without environment overrides
    pub fn from_toml_str(source: &str) -> Result<Self, MisuseError> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        Ok(settings)
    }

    /// Validate and convert into the runtime configuration
    pub fn into_config(self) -> Result<MonitorConfig, MisuseError> {
        let mut resources = HashMap::with_capacity(self.rate_limit.resources.len());
        for (resource, delay_ms) in self.rate_limit.resources {
            resources.insert(resource, millis("rate_limit.resources", delay_ms)?);
        }

        let config = MonitorConfig {
            circuit: CircuitConfig {
                failure_threshold: count("failure_threshold", self.circuit.failure_threshold)?,
                reset_timeout: millis("reset_timeout_ms", self.circuit.reset_timeout_ms)?,
                success_threshold: count("success_threshold", self.circuit.success_threshold)?,
                jitter_factor: self.circuit.jitter_factor,
            },
            rate_limit: RateLimitConfig {
                delay: millis("delay_ms", self.rate_limit.delay_ms)?,
                resources,
            },
            events: EventConfig {
                channel_capacity: count("channel_capacity", self.events.channel_capacity)?,
            },
        };

        config.validate()?;
        Ok(config)
    }
}

fn count(field: &'static str, value: i64) -> Result<usize, MisuseError> {
    usize::try_from(value)
        .map_err(|_| MisuseError::invalid(field, format!("must not be negative, got {value}")))
}

fn millis(field: &'static str, value: i64) -> Result<Duration, MisuseError> {
    u64::try_from(value)
        .map(Duration::from_millis)
        .map_err(|_| MisuseError::invalid(field, format!("must not be negative, got {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MonitorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.circuit.success_threshold, 1);
        assert_eq!(config.circuit.reset_timeout, Duration::from_secs(30));
        assert_eq!(config.rate_limit.delay, Duration::ZERO);
    }

    #[test]
    fn test_circuit_config_validation() {
        let mut config = CircuitConfig {
            failure_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config = CircuitConfig {
            success_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config = CircuitConfig {
            jitter_factor: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(MisuseError::InvalidConfig {
                field: "jitter_factor",
                ..
            })
        ));
    }

    #[test]
    fn test_hold_time_without_jitter_is_exact() {
        let config = CircuitConfig {
            reset_timeout: Duration::from_millis(1000),
            ..Default::default()
        };

        for _ in 0..10 {
            assert_eq!(config.hold_time(), Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_hold_time_jitter_within_bounds() {
        let config = CircuitConfig {
            reset_timeout: Duration::from_millis(1000),
            jitter_factor: 0.25,
            ..Default::default()
        };

        for _ in 0..50 {
            let hold = config.hold_time();
            assert!(hold >= Duration::from_millis(740), "hold {:?} too short", hold);
            assert!(hold <= Duration::from_millis(1010), "hold {:?} too long", hold);
        }
    }

    #[test]
    fn test_spacing_for_uses_override() {
        let mut config = RateLimitConfig {
            delay: Duration::from_millis(50),
            ..Default::default()
        };
        config
            .resources
            .insert("search".to_string(), Duration::from_millis(250));

        assert_eq!(config.spacing_for("search"), Duration::from_millis(250));
        assert_eq!(config.spacing_for("api"), Duration::from_millis(50));
    }

    #[test]
    fn test_settings_from_toml() {
        let settings = MonitorSettings::from_toml_str(
            r#"
            [circuit]
            failure_threshold = 3
            reset_timeout_ms = 100

            [rate_limit]
            delay_ms = 50

            [rate_limit.resources]
            search = 250
            "#,
        )
        .expect("valid toml");

        let config = settings.into_config().expect("valid settings");
        assert_eq!(config.circuit.failure_threshold, 3);
        assert_eq!(config.circuit.reset_timeout, Duration::from_millis(100));
        assert_eq!(config.circuit.success_threshold, 1);
        assert_eq!(config.rate_limit.delay, Duration::from_millis(50));
        assert_eq!(
            config.rate_limit.spacing_for("search"),
            Duration::from_millis(250)
        );
        assert_eq!(config.events.channel_capacity, 256);
    }

    #[test]
    fn test_negative_settings_are_rejected() {
        let settings = MonitorSettings::from_toml_str(
            r#"
            [circuit]
            reset_timeout_ms = -5
            "#,
        )
        .expect("valid toml");

        match settings.into_config() {
            Err(MisuseError::InvalidConfig { field, reason }) => {
                assert_eq!(field, "reset_timeout_ms");
                assert!(reason.contains("-5"));
            }
            other => panic!("Expected InvalidConfig, got {:?}", other),
        }

        let settings = MonitorSettings {
            circuit: CircuitSettings {
                failure_threshold: -1,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(settings.into_config().is_err());
    }

    #[test]
    fn test_empty_settings_yield_defaults() {
        let config = MonitorSettings::from_toml_str("")
            .expect("empty toml")
            .into_config()
            .expect("defaults are valid");

        assert_eq!(config, MonitorConfig::default());
    }
}
