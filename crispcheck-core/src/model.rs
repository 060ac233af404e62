//! Data carried between the engine, the orchestrator and their callers.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DiagnosticCategory;

/// One URL to classify. Immutable once enqueued.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Target(String);

impl Target {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Target").field(&self.0).finish()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Target {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Target {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    Detected,
    NotDetected,
    Error,
    Cancelled,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detected => "Detected",
            Self::NotDetected => "NotDetected",
            Self::Error => "Error",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Status string used in client-facing results (`url,status,error`).
    pub fn label(self) -> &'static str {
        match self {
            Self::Detected => "Uses Crisp",
            Self::NotDetected => "Does NOT use Crisp",
            Self::Error => "Error",
            Self::Cancelled => "Cancelled",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        [Self::Detected, Self::NotDetected, Self::Error, Self::Cancelled]
            .into_iter()
            .find(|classification| classification.label() == label)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl TraceLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

/// A timestamped stage note. Observability only; never read back by the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub at: DateTime<Utc>,
    pub level: TraceLevel,
    pub message: String,
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.at.format("%H:%M:%S"),
            self.level.as_str(),
            self.message
        )
    }
}

/// Ordered, append-only record of what happened while checking one target.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Trace(Vec<TraceEvent>);

impl Trace {
    pub fn entries(&self) -> &[TraceEvent] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TraceEvent> {
        self.0.iter()
    }

    /// Rendered `[HH:MM:SS] LEVEL: message` lines.
    pub fn lines(&self) -> impl Iterator<Item = String> + '_ {
        self.0.iter().map(ToString::to_string)
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.0.iter().any(|event| event.message.contains(needle))
    }
}

/// Shared append handle used while a check is in flight.
///
/// The engine and the response observer both write into the same recorder;
/// appends are serialized, so entries stay in the order they happened.
#[derive(Clone, Default)]
pub struct TraceRecorder {
    events: Arc<Mutex<Vec<TraceEvent>>>,
}

impl fmt::Debug for TraceRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.events.try_lock().map(|events| events.len()).ok();
        f.debug_struct("TraceRecorder").field("len", &len).finish()
    }
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, level: TraceLevel, message: impl Into<String>) {
        let event = TraceEvent {
            at: Utc::now(),
            level,
            message: message.into(),
        };
        let mut events = self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        events.push(event);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.record(TraceLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.record(TraceLevel::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.record(TraceLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.record(TraceLevel::Error, message);
    }

    pub fn critical(&self, message: impl Into<String>) {
        self.record(TraceLevel::Critical, message);
    }

    pub fn snapshot(&self) -> Trace {
        let events = self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Trace(events.clone())
    }
}

/// Final result for one target within a batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionOutcome {
    pub target: Target,
    pub classification: Classification,
    /// Stable category. `None` for clean `Detected`/`NotDetected` results; a
    /// `Detected` outcome may still carry the category of a later failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<DiagnosticCategory>,
    /// Free-form context for the diagnostic (raw transport text and the like).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub trace: Trace,
}

impl DetectionOutcome {
    /// Outcome for a task that never ran. The trace holds a single entry so it
    /// is never empty.
    pub fn without_run(
        target: Target,
        classification: Classification,
        diagnostic: DiagnosticCategory,
        detail: impl Into<String>,
        level: TraceLevel,
    ) -> Self {
        let detail = detail.into();
        let recorder = TraceRecorder::new();
        recorder.record(level, format!("Check for {target} not run: {detail}"));
        Self {
            target,
            classification,
            diagnostic: Some(diagnostic),
            detail: Some(detail),
            trace: recorder.snapshot(),
        }
    }

    pub fn cancelled_before_start(target: Target) -> Self {
        Self::without_run(
            target,
            Classification::Cancelled,
            DiagnosticCategory::CancelledBeforeStart,
            "cancelled before start",
            TraceLevel::Info,
        )
    }

    pub fn resource_unavailable(target: Target) -> Self {
        Self::without_run(
            target,
            Classification::Error,
            DiagnosticCategory::ResourceUnavailable,
            "resource unavailable",
            TraceLevel::Error,
        )
    }

    pub fn task_failure(target: Target, detail: impl Into<String>) -> Self {
        Self::without_run(
            target,
            Classification::Error,
            DiagnosticCategory::TaskExecutionFailure,
            detail,
            TraceLevel::Critical,
        )
    }

    /// `""`, `"Category"` or `"Category: detail"`, for flat reports.
    pub fn diagnostic_text(&self) -> String {
        match (&self.diagnostic, &self.detail) {
            (None, _) => String::new(),
            (Some(category), None) => category.to_string(),
            (Some(category), Some(detail)) => format!("{category}: {detail}"),
        }
    }
}

/// Per-target lifecycle inside a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Terminal state implied by a finished outcome.
    pub fn terminal_for(outcome: &DetectionOutcome) -> Self {
        match (outcome.classification, outcome.diagnostic) {
            (Classification::Cancelled, _) => Self::Cancelled,
            (Classification::Error, Some(DiagnosticCategory::TaskExecutionFailure)) => Self::Failed,
            _ => Self::Completed,
        }
    }
}

/// Snapshot emitted after each task reaches a terminal state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub completed_count: usize,
    pub total_count: usize,
    pub last_target: Target,
    pub last_classification: Classification,
}

impl ProgressEvent {
    /// Whole percentage, 100 for an empty batch.
    pub fn percent(&self) -> u8 {
        percent_of(self.completed_count, self.total_count)
    }
}

pub(crate) fn percent_of(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((completed.min(total) * 100) / total) as u8
}

/// Everything a batch produced, in the caller's input order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub cancelled: bool,
    pub outcomes: Vec<DetectionOutcome>,
    pub progress: u8,
}

impl BatchReport {
    pub fn new(batch_id: Uuid, cancelled: bool, outcomes: Vec<DetectionOutcome>) -> Self {
        Self {
            batch_id,
            cancelled,
            outcomes,
            progress: 100,
        }
    }

    pub fn summary(&self) -> BatchSummary {
        let mut summary = BatchSummary {
            total: self.outcomes.len(),
            ..BatchSummary::default()
        };
        for outcome in &self.outcomes {
            match outcome.classification {
                Classification::Detected => summary.detected += 1,
                Classification::NotDetected => summary.not_detected += 1,
                Classification::Error => summary.errors += 1,
                Classification::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }

    pub fn outcome_for(&self, target: &str) -> Option<&DetectionOutcome> {
        self.outcomes.iter().find(|outcome| outcome.target.as_str() == target)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub detected: usize,
    pub not_detected: usize,
    pub errors: usize,
    pub cancelled: usize,
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} checked: {} detected, {} not detected, {} errors, {} cancelled",
            self.total, self.detected, self.not_detected, self.errors, self.cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_keeps_append_order() {
        let recorder = TraceRecorder::new();
        recorder.info("first");
        recorder.warning("second");
        let trace = recorder.snapshot();
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.entries()[0].message, "first");
        assert_eq!(trace.entries()[1].level, TraceLevel::Warning);
    }

    #[test]
    fn trace_lines_use_level_prefix() {
        let recorder = TraceRecorder::new();
        recorder.error("Timeout: 30000ms exceeded");
        let line = recorder.snapshot().lines().next().unwrap();
        assert!(line.starts_with('['));
        assert!(line.ends_with("ERROR: Timeout: 30000ms exceeded"));
    }

    #[test]
    fn synthetic_outcomes_are_never_traceless() {
        let outcome = DetectionOutcome::cancelled_before_start(Target::new("https://a.test"));
        assert_eq!(outcome.classification, Classification::Cancelled);
        assert_eq!(outcome.diagnostic, Some(DiagnosticCategory::CancelledBeforeStart));
        assert!(!outcome.trace.is_empty());
        assert_eq!(
            outcome.diagnostic_text(),
            "CancelledBeforeStart: cancelled before start"
        );
        assert_eq!(TaskState::terminal_for(&outcome), TaskState::Cancelled);
    }

    #[test]
    fn task_failure_maps_to_failed_state() {
        let outcome = DetectionOutcome::task_failure(Target::new("https://b.test"), "boom");
        assert_eq!(TaskState::terminal_for(&outcome), TaskState::Failed);
        let unavailable = DetectionOutcome::resource_unavailable(Target::new("https://c.test"));
        assert_eq!(TaskState::terminal_for(&unavailable), TaskState::Completed);
    }

    #[test]
    fn progress_percent_is_bounded() {
        assert_eq!(percent_of(0, 0), 100);
        assert_eq!(percent_of(1, 3), 33);
        assert_eq!(percent_of(3, 3), 100);
        assert_eq!(percent_of(4, 3), 100);
    }

    #[test]
    fn summary_counts_each_classification() {
        let outcomes = vec![
            DetectionOutcome::cancelled_before_start(Target::new("a")),
            DetectionOutcome::resource_unavailable(Target::new("b")),
            DetectionOutcome::task_failure(Target::new("c"), "x"),
        ];
        let report = BatchReport::new(Uuid::now_v7(), true, outcomes);
        let summary = report.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.errors, 2);
        assert_eq!(report.progress, 100);
        assert!(report.outcome_for("b").is_some());
    }
}
