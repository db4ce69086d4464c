//! Hooks fired on circuit state transitions

use crate::circuit::CircuitState;
use std::sync::Arc;

type Hook = Arc<dyn Fn(&str) + Send + Sync>;

/// A state change that happened while settling or admitting a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened,
    HalfOpened,
    Closed,
}

impl Transition {
    /// State the circuit is in after this transition
    pub fn target(self) -> CircuitState {
        match self {
            Transition::Opened => CircuitState::Open,
            Transition::HalfOpened => CircuitState::HalfOpen,
            Transition::Closed => CircuitState::Closed,
        }
    }
}

/// Transition hooks registered through the builder
///
/// Hooks run after the circuit's lock has been released, so they may call
/// back into the monitor.
#[derive(Clone, Default)]
pub struct TransitionHooks {
    pub on_open: Option<Hook>,
    pub on_close: Option<Hook>,
    pub on_half_open: Option<Hook>,
}

impl TransitionHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self, transition: Transition, circuit: &str) {
        let hook = match transition {
            Transition::Opened => &self.on_open,
            Transition::HalfOpened => &self.on_half_open,
            Transition::Closed => &self.on_close,
        };

        if let Some(hook) = hook {
            hook(circuit);
        }
    }
}

impl std::fmt::Debug for TransitionHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionHooks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .finish()
    }
}
