//! Metric recording and duration timers
//!
//! The recorder keeps nothing: every observation is stamped and published as
//! a `metric:recorded` event. Aggregation belongs to whoever subscribes.

use crate::errors::MisuseError;
use crate::events::{EventBus, MonitorEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{trace, warn};

pub type Tags = BTreeMap<String, String>;

/// A single observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(rename = "metric")]
    pub name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: Tags,
    pub timestamp: DateTime<Utc>,
}

/// Append-only metric sink publishing onto the event bus
#[derive(Debug, Clone)]
pub struct MetricRecorder {
    bus: Arc<EventBus>,
}

impl MetricRecorder {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    /// Record an untagged observation
    pub fn record(&self, name: impl Into<String>, value: f64) {
        self.emit(name.into(), value, Tags::new());
    }

    /// Record an observation with labels
    pub fn record_tagged<I, K, V>(&self, name: impl Into<String>, value: f64, tags: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let tags = tags
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.emit(name.into(), value, tags);
    }

    /// Start a timer whose stop records `"<label>.duration"` in milliseconds
    pub fn start_timer(&self, label: impl Into<String>) -> TimerHandle {
        TimerHandle {
            label: label.into(),
            started: Instant::now(),
            stopped: AtomicBool::new(false),
            recorder: self.clone(),
        }
    }

    fn emit(&self, name: String, value: f64, tags: Tags) {
        trace!(metric = %name, value, "Metric recorded");
        self.bus.publish(MonitorEvent::MetricRecorded(Metric {
            name,
            value,
            tags,
            timestamp: Utc::now(),
        }));
    }
}

/// Running duration timer
#[derive(Debug)]
pub struct TimerHandle {
    label: String,
    started: Instant,
    stopped: AtomicBool,
    recorder: MetricRecorder,
}

impl TimerHandle {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Record the elapsed time. Only the first stop records anything.
    pub fn stop(&self) -> Result<Duration, MisuseError> {
        self.record_once().ok_or_else(|| {
            warn!(timer = %self.label, "Timer stopped more than once; ignoring");
            MisuseError::TimerAlreadyStopped {
                label: self.label.clone(),
            }
        })
    }

    /// Stop a timer nobody else can reach; consuming it rules out a second stop
    pub(crate) fn finish(self) -> Duration {
        self.record_once().unwrap_or_else(|| self.started.elapsed())
    }

    fn record_once(&self) -> Option<Duration> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return None;
        }

        let elapsed = self.started.elapsed();
        self.recorder.record(
            format!("{}.duration", self.label),
            elapsed.as_secs_f64() * 1000.0,
        );
        Some(elapsed)
    }
}
