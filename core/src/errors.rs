//! Error types for monitored operations

use std::time::Duration;

/// Errors surfaced by a monitored call
///
/// `Open` means the work was never invoked. `Execution` carries the error the
/// work itself produced, untouched, so callers can pick a different retry
/// policy for each.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// Circuit is open (or a half-open probe is already in flight)
    #[error("circuit '{circuit}' is open")]
    Open {
        circuit: String,
        /// Time left before the circuit admits a probe, when known
        retry_after: Option<Duration>,
    },
    /// The wrapped operation failed
    #[error("operation failed: {0}")]
    Execution(E),
}

impl<E> CircuitError<E> {
    /// True when the call was refused without running the work
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }

    /// Name of the refusing circuit, if this is an `Open` error
    pub fn circuit(&self) -> Option<&str> {
        match self {
            CircuitError::Open { circuit, .. } => Some(circuit),
            CircuitError::Execution(_) => None,
        }
    }

    /// Recover the original error produced by the work
    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitError::Execution(e) => Some(e),
            CircuitError::Open { .. } => None,
        }
    }
}

/// Caller errors: bad configuration or a timer stopped twice
#[derive(Debug, thiserror::Error)]
pub enum MisuseError {
    #[error("timer '{label}' was already stopped")]
    TimerAlreadyStopped { label: String },

    #[error("invalid configuration for `{field}`: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("failed to load monitor settings: {0}")]
    ConfigLoad(#[from] config::ConfigError),
}

impl MisuseError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        MisuseError::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_display_and_accessors() {
        let err: CircuitError<String> = CircuitError::Open {
            circuit: "fetch".to_string(),
            retry_after: Some(Duration::from_millis(100)),
        };

        assert!(err.is_open());
        assert_eq!(err.circuit(), Some("fetch"));
        assert_eq!(err.to_string(), "circuit 'fetch' is open");
        assert!(err.into_inner().is_none());
    }

    #[test]
    fn test_execution_error_keeps_original() {
        let err = CircuitError::Execution("connection reset".to_string());

        assert!(!err.is_open());
        assert_eq!(err.to_string(), "operation failed: connection reset");
        assert_eq!(err.into_inner().as_deref(), Some("connection reset"));
    }

    #[test]
    fn test_invalid_config_message() {
        let err = MisuseError::invalid("failure_threshold", "must be greater than 0");
        assert_eq!(
            err.to_string(),
            "invalid configuration for `failure_threshold`: must be greater than 0"
        );
    }
}
