//! Per-operation circuit breaker
//!
//! Each operation name owns a circuit record: a `state-machines` machine plus
//! the failure tally its guards read. Records are created on first use and
//! every admission or settlement happens under the record's mutex, so
//! counting, threshold checks and transitions are atomic per name.
//!
//! A call goes through two steps: [`CircuitBreaker::admit`] hands out a
//! [`Permit`] (or refuses with `CircuitError::Open`), and the permit is
//! settled with the outcome once the work has actually completed. A permit
//! dropped without settling only gives back a half-open probe slot; counters
//! and state are untouched.

use crate::callbacks::{Transition, TransitionHooks};
use crate::classifier::{FailureClassifier, FailureContext};
use crate::config::CircuitConfig;
use crate::errors::CircuitError;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use state_machines::state_machine;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Observable circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_machine(state: &str) -> Self {
        match state {
            "Closed" => CircuitState::Closed,
            "HalfOpen" => CircuitState::HalfOpen,
            // Unknown names are treated as the safest state
            _ => CircuitState::Open,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consecutive failure count read by the trip guard
#[derive(Debug, Default)]
pub struct FailureTally {
    failures: AtomicUsize,
}

impl FailureTally {
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Acquire)
    }

    fn increment(&self) -> usize {
        self.failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn reset(&self) {
        self.failures.store(0, Ordering::Release);
    }
}

/// Data shared by every state of one circuit's machine
#[derive(Debug, Clone, Default)]
pub struct CircuitContext {
    pub name: String,
    pub config: CircuitConfig,
    pub tally: Arc<FailureTally>,
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    pub opened_at: Option<Instant>,
    /// Jittered reset timeout chosen when the circuit opened
    pub hold_for: Duration,
    /// Opened by an operator; only an operator (or reset) closes it
    pub forced: bool,
}

/// Data specific to the HalfOpen state
#[derive(Debug, Clone, Default)]
pub struct HalfOpenData {
    pub consecutive_successes: usize,
    pub probe_in_flight: bool,
}

state_machine! {
    name: Circuit,
    context: CircuitContext,
    dynamic: true,

    initial: Closed,
    states: [
        Closed,
        Open(OpenData),
        HalfOpen(HalfOpenData),
    ],
    events {
        trip {
            guards: [should_open],
            transition: { from: [Closed, HalfOpen], to: Open }
        }
        attempt_reset {
            guards: [timeout_elapsed],
            transition: { from: Open, to: HalfOpen }
        }
        close {
            guards: [should_close],
            transition: { from: HalfOpen, to: Closed }
        }
        force_open {
            guards: [operator_override],
            transition: { from: [Closed, HalfOpen], to: Open }
        }
    }
}

impl Circuit<Closed> {
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        ctx.tally.failures() >= ctx.config.failure_threshold
    }

    fn operator_override(&self, _ctx: &CircuitContext) -> bool {
        true
    }
}

impl Circuit<HalfOpen> {
    /// Any counted failure while probing reopens the circuit
    fn should_open(&self, _ctx: &CircuitContext) -> bool {
        true
    }

    fn should_close(&self, ctx: &CircuitContext) -> bool {
        self.state_data_half_open()
            .map(|data| data.consecutive_successes >= ctx.config.success_threshold)
            .unwrap_or(false)
    }

    fn operator_override(&self, _ctx: &CircuitContext) -> bool {
        true
    }
}

impl Circuit<Open> {
    fn timeout_elapsed(&self, _ctx: &CircuitContext) -> bool {
        match self.state_data_open() {
            Some(data) if data.forced => false,
            Some(OpenData {
                opened_at: Some(opened_at),
                hold_for,
                ..
            }) => opened_at.elapsed() >= *hold_for,
            _ => true,
        }
    }
}

/// Point-in-time view of one circuit
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: usize,
    pub consecutive_successes: usize,
    pub probe_in_flight: bool,
    pub forced_open: bool,
    pub opened_at: Option<Instant>,
    pub last_failure_at: Option<Instant>,
    /// Time until a probe is admitted, while Open
    pub retry_after: Option<Duration>,
}

struct CircuitRecord {
    machine: DynamicCircuit,
    context: CircuitContext,
    /// Bumped on every transition and reset; settlements from an older epoch are ignored
    epoch: u64,
    last_failure_at: Option<Instant>,
}

impl CircuitRecord {
    fn new(name: &str, config: CircuitConfig) -> Self {
        let context = CircuitContext {
            name: name.to_string(),
            config,
            tally: Arc::new(FailureTally::default()),
        };

        Self {
            machine: DynamicCircuit::new(context.clone()),
            context,
            epoch: 0,
            last_failure_at: None,
        }
    }

    fn state(&self) -> CircuitState {
        CircuitState::from_machine(self.machine.current_state())
    }

    fn retry_after(&self) -> Option<Duration> {
        let data = self.machine.open_data()?;
        if data.forced {
            return None;
        }
        let opened_at = data.opened_at?;
        Some(data.hold_for.saturating_sub(opened_at.elapsed()))
    }

    fn transitioned(&mut self, transition: Transition, transitions: &mut Vec<Transition>) {
        self.epoch += 1;
        transitions.push(transition);
    }

    fn admit(&mut self, transitions: &mut Vec<Transition>) -> Result<bool, Option<Duration>> {
        if self.state() == CircuitState::Open
            && self.machine.handle(CircuitEvent::AttemptReset).is_ok()
        {
            self.transitioned(Transition::HalfOpened, transitions);
        }

        match self.state() {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => Err(self.retry_after()),
            CircuitState::HalfOpen => match self.machine.half_open_data_mut() {
                Some(data) if data.probe_in_flight => Err(None),
                Some(data) => {
                    data.probe_in_flight = true;
                    Ok(true)
                }
                None => Err(None),
            },
        }
    }

    fn release_probe(&mut self) {
        if let Some(data) = self.machine.half_open_data_mut() {
            data.probe_in_flight = false;
        }
    }

    fn record_success(&mut self, probe: bool, transitions: &mut Vec<Transition>) {
        match self.state() {
            CircuitState::Closed => self.context.tally.reset(),
            CircuitState::HalfOpen => {
                if let Some(data) = self.machine.half_open_data_mut() {
                    data.consecutive_successes += 1;
                    if probe {
                        data.probe_in_flight = false;
                    }
                }

                if self.machine.handle(CircuitEvent::Close).is_ok() {
                    self.context.tally.reset();
                    self.last_failure_at = None;
                    self.transitioned(Transition::Closed, transitions);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&mut self, probe: bool, counted: bool, transitions: &mut Vec<Transition>) {
        if !counted {
            if probe {
                self.release_probe();
            }
            return;
        }

        self.last_failure_at = Some(Instant::now());
        if self.state() == CircuitState::Open {
            return;
        }

        self.context.tally.increment();
        if self.machine.handle(CircuitEvent::Trip).is_ok() {
            self.mark_open(false);
            self.transitioned(Transition::Opened, transitions);
        }
    }

    fn mark_open(&mut self, forced: bool) {
        let hold_for = self.context.config.hold_time();
        if let Some(data) = self.machine.open_data_mut() {
            data.opened_at = Some(Instant::now());
            data.hold_for = hold_for;
            data.forced = forced;
        }
    }

    fn force_open(&mut self, transitions: &mut Vec<Transition>) {
        if self.state() == CircuitState::Open {
            if let Some(data) = self.machine.open_data_mut() {
                data.forced = true;
            }
            self.epoch += 1;
            return;
        }

        if self.machine.handle(CircuitEvent::ForceOpen).is_ok() {
            self.mark_open(true);
            self.transitioned(Transition::Opened, transitions);
        }
    }

    fn reset(&mut self, transitions: &mut Vec<Transition>) {
        let was = self.state();
        self.context.tally.reset();
        self.machine = DynamicCircuit::new(self.context.clone());
        self.last_failure_at = None;
        self.epoch += 1;
        if was != CircuitState::Closed {
            transitions.push(Transition::Closed);
        }
    }

    fn snapshot(&self) -> CircuitSnapshot {
        let half_open = self.machine.half_open_data();
        let open = self.machine.open_data();

        CircuitSnapshot {
            name: self.context.name.clone(),
            state: self.state(),
            failure_count: self.context.tally.failures(),
            consecutive_successes: half_open.map(|d| d.consecutive_successes).unwrap_or(0),
            probe_in_flight: half_open.map(|d| d.probe_in_flight).unwrap_or(false),
            forced_open: open.map(|d| d.forced).unwrap_or(false),
            opened_at: open.and_then(|d| d.opened_at),
            last_failure_at: self.last_failure_at,
            retry_after: self.retry_after(),
        }
    }
}

/// Circuit breaker over every operation name
pub struct CircuitBreaker {
    config: CircuitConfig,
    circuits: DashMap<String, Arc<Mutex<CircuitRecord>>>,
    classifier: Option<Arc<dyn FailureClassifier>>,
    hooks: TransitionHooks,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self::with_parts(config, None, TransitionHooks::new())
    }

    pub(crate) fn with_parts(
        config: CircuitConfig,
        classifier: Option<Arc<dyn FailureClassifier>>,
        hooks: TransitionHooks,
    ) -> Self {
        info!(
            failure_threshold = config.failure_threshold,
            reset_timeout_ms = config.reset_timeout.as_millis() as u64,
            success_threshold = config.success_threshold,
            "Circuit breaker initialized"
        );

        Self {
            config,
            circuits: DashMap::new(),
            classifier,
            hooks,
        }
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Run `work` under the circuit for `name`
    pub async fn execute<F, Fut, T, E>(&self, name: &str, work: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: 'static,
    {
        let permit = self.admit(name)?;
        let started = Instant::now();

        match work().await {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(error) => {
                let counted = self.should_count(name, &error, started.elapsed());
                permit.fail(counted);
                Err(CircuitError::Execution(error))
            }
        }
    }

    /// Ask the circuit for `name` to admit one call
    ///
    /// Open circuits whose reset timeout has elapsed move to HalfOpen here and
    /// the caller becomes the single probe. While a probe is outstanding every
    /// other caller is refused.
    pub fn admit<E>(&self, name: &str) -> Result<Permit<'_>, CircuitError<E>> {
        let record = self.record(name);
        let mut transitions = Vec::new();

        let admitted = {
            let mut guard = record.lock();
            guard
                .admit(&mut transitions)
                .map(|probe| (probe, guard.epoch))
        };
        self.announce(name, &transitions);

        match admitted {
            Ok((probe, epoch)) => {
                debug!(circuit = %name, probe, "Call admitted");
                Ok(Permit {
                    breaker: self,
                    record,
                    name: name.to_string(),
                    epoch,
                    probe,
                    settled: false,
                })
            }
            Err(retry_after) => {
                debug!(circuit = %name, "Call rejected, circuit open");
                Err(CircuitError::Open {
                    circuit: name.to_string(),
                    retry_after,
                })
            }
        }
    }

    /// Whether an error from `name` counts against its circuit
    pub fn should_count<E: 'static>(&self, name: &str, error: &E, elapsed: Duration) -> bool {
        match &self.classifier {
            Some(classifier) => classifier.should_trip(&FailureContext {
                operation: name,
                error: error as &dyn std::any::Any,
                elapsed,
            }),
            None => true,
        }
    }

    /// Current state; unknown names are Closed
    pub fn state(&self, name: &str) -> CircuitState {
        self.circuits
            .get(name)
            .map(|record| Arc::clone(record.value()))
            .map(|record| record.lock().state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, name: &str) -> Option<CircuitSnapshot> {
        let record = self.circuits.get(name).map(|r| Arc::clone(r.value()))?;
        let snapshot = record.lock().snapshot();
        Some(snapshot)
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let records: Vec<_> = self
            .circuits
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut snapshots: Vec<_> = records.iter().map(|r| r.lock().snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Open the circuit and hold it open until forced closed or reset
    pub fn force_open(&self, name: &str) {
        let record = self.record(name);
        let mut transitions = Vec::new();
        record.lock().force_open(&mut transitions);
        warn!(circuit = %name, "Circuit forced open by operator");
        self.announce(name, &transitions);
    }

    /// Close the circuit and clear its counters
    pub fn force_close(&self, name: &str) {
        self.reset(name);
        warn!(circuit = %name, "Circuit forced closed by operator");
    }

    /// Clear one circuit back to Closed with zeroed counters
    pub fn reset(&self, name: &str) {
        let Some(record) = self.circuits.get(name).map(|r| Arc::clone(r.value())) else {
            return;
        };
        let mut transitions = Vec::new();
        record.lock().reset(&mut transitions);
        self.announce(name, &transitions);
    }

    /// Clear every circuit
    pub fn reset_all(&self) {
        let names: Vec<String> = self.circuits.iter().map(|e| e.key().clone()).collect();
        for name in &names {
            self.reset(name);
        }
        info!(circuits = names.len(), "All circuits reset");
    }

    fn record(&self, name: &str) -> Arc<Mutex<CircuitRecord>> {
        if let Some(record) = self.circuits.get(name) {
            return Arc::clone(record.value());
        }

        let entry = self
            .circuits
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitRecord::new(name, self.config.clone()))));
        Arc::clone(entry.value())
    }

    fn announce(&self, name: &str, transitions: &[Transition]) {
        for &transition in transitions {
            match transition {
                Transition::Opened => warn!(circuit = %name, "Circuit opened"),
                Transition::HalfOpened => info!(circuit = %name, "Circuit half-open, probing"),
                Transition::Closed => info!(circuit = %name, "Circuit closed"),
            }
            self.hooks.fire(transition, name);
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("circuits", &self.circuits.len())
            .field("classifier", &self.classifier)
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// Admission to run one call
///
/// Settle it with [`Permit::succeed`] or [`Permit::fail`] once the work has
/// finished. Dropping it unsettled releases a probe slot and nothing else.
#[must_use = "a permit must be settled with the call outcome"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    record: Arc<Mutex<CircuitRecord>>,
    name: String,
    epoch: u64,
    probe: bool,
    settled: bool,
}

impl Permit<'_> {
    /// True if this call is the half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn succeed(mut self) {
        self.settle(|record, probe, transitions| record.record_success(probe, transitions));
    }

    /// Report a failure; `counted` is false when the classifier ignored it
    pub fn fail(mut self, counted: bool) {
        self.settle(|record, probe, transitions| {
            record.record_failure(probe, counted, transitions)
        });
    }

    fn settle<F>(&mut self, apply: F)
    where
        F: FnOnce(&mut CircuitRecord, bool, &mut Vec<Transition>),
    {
        self.settled = true;
        let mut transitions = Vec::new();
        {
            let mut record = self.record.lock();
            if record.epoch != self.epoch {
                debug!(circuit = %self.name, "Ignoring outcome admitted before a transition or reset");
                return;
            }
            apply(&mut *record, self.probe, &mut transitions);
        }
        self.breaker.announce(&self.name, &transitions);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.settled || !self.probe {
            return;
        }

        let mut record = self.record.lock();
        if record.epoch == self.epoch {
            debug!(circuit = %self.name, "Probe abandoned, releasing slot");
            record.release_probe();
        }
    }
}

impl std::fmt::Debug for Permit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("name", &self.name)
            .field("epoch", &self.epoch)
            .field("probe", &self.probe)
            .field("settled", &self.settled)
            .finish()
    }
}
