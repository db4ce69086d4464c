//! Failure classification
//!
//! Decides which errors count against a circuit. An error that is not counted
//! still reaches the caller and still publishes `operation:failure`; it simply
//! leaves the circuit's counters alone.

use std::any::Any;
use std::time::Duration;

/// What a classifier gets to look at
#[derive(Debug)]
pub struct FailureContext<'a> {
    /// Operation (circuit) name
    pub operation: &'a str,
    /// The error returned by the work, downcastable to its concrete type
    pub error: &'a dyn Any,
    /// How long the work ran before failing
    pub elapsed: Duration,
}

/// Decides whether a failure counts toward opening the circuit
///
/// ```rust
/// use monitor_machines::{FailureClassifier, FailureContext};
///
/// #[derive(Debug)]
/// struct TimeoutsOnly;
///
/// impl FailureClassifier for TimeoutsOnly {
///     fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
///         ctx.error
///             .downcast_ref::<std::io::Error>()
///             .map(|e| e.kind() == std::io::ErrorKind::TimedOut)
///             .unwrap_or(false)
///     }
/// }
/// ```
pub trait FailureClassifier: Send + Sync + std::fmt::Debug {
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool;
}

/// Counts every error
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn should_trip(&self, _ctx: &FailureContext<'_>) -> bool {
        true
    }
}

/// Classifier backed by a closure
pub struct PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    predicate: F,
}

impl<F> PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> FailureClassifier for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
        (self.predicate)(ctx)
    }
}

impl<F> std::fmt::Debug for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateClassifier")
            .field("predicate", &"<closure>")
            .finish()
    }
}
