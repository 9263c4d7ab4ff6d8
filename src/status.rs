//! Run observability: status notifications, lifecycle events and summaries.
//!
//! Three independent views of a run live here:
//!
//! - [`StatusEvent`]: level + message notifications written by steps to
//!   the per-run status stream (see
//!   [`Context::write_event_to_stream`](crate::Context::write_event_to_stream)).
//! - [`WorkflowEvent`]: engine lifecycle events broadcast to anyone who
//!   called [`Workflow::subscribe`](crate::Workflow::subscribe).
//! - [`RunSummary`]: a per-step account of a finished run.
//!
//! None of them influence control flow. Dropping every notification is
//! always safe.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a status notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    /// Progress information.
    Info,
    /// Something degraded but the run continues.
    Warning,
    /// Something failed.
    Error,
}

/// A one-way progress notification for an external observer (e.g. a UI).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Severity.
    pub level: StatusLevel,
    /// Human-readable message.
    pub message: String,
    /// The step that wrote the notification, filled in by the context.
    pub step: Option<String>,
    /// When the notification was created.
    pub emitted_at: DateTime<Utc>,
}

impl StatusEvent {
    /// Creates a notification with the given level.
    pub fn new(level: StatusLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            step: None,
            emitted_at: Utc::now(),
        }
    }

    /// Creates an info-level notification.
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(StatusLevel::Info, message)
    }

    /// Creates a warning-level notification.
    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(StatusLevel::Warning, message)
    }

    /// Creates an error-level notification.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(StatusLevel::Error, message)
    }
}

/// The lifecycle phase of a run.
///
/// `Idle → Running → {Completed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    /// Created but not yet driven.
    Idle,
    /// The control loop is dispatching events.
    Running,
    /// A stop event was produced.
    Completed,
    /// A step failed, the run timed out, stalled, or was aborted.
    Failed,
}

impl RunPhase {
    /// Returns true for `Completed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Failed)
    }
}

/// An engine lifecycle event.
///
/// Events use `String` for identifiers to keep the type simple and easy
/// to serialize for logging or transmission.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum WorkflowEvent {
    /// A run started.
    RunStarted {
        /// The run identifier.
        run_id: String,
        /// Name of the workflow.
        workflow: String,
    },

    /// A step invocation acquired a worker and started executing.
    StepStarted {
        /// The run identifier.
        run_id: String,
        /// The step name.
        step: String,
        /// Kind of the event being consumed.
        event: String,
    },

    /// A step invocation finished successfully.
    StepCompleted {
        /// The run identifier.
        run_id: String,
        /// The step name.
        step: String,
        /// Kind of the event returned, if any.
        emitted: Option<String>,
    },

    /// A step invocation failed; the run fails with it.
    StepFailed {
        /// The run identifier.
        run_id: String,
        /// The step name.
        step: String,
        /// Error message describing the failure.
        error: String,
    },

    /// The run produced its stop event.
    RunCompleted {
        /// The run identifier.
        run_id: String,
    },

    /// The run terminated in error.
    RunFailed {
        /// The run identifier.
        run_id: String,
        /// Error message describing the failure.
        error: String,
    },
}

impl WorkflowEvent {
    /// Returns the run ID for this event.
    pub fn run_id(&self) -> &str {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::StepStarted { run_id, .. }
            | Self::StepCompleted { run_id, .. }
            | Self::StepFailed { run_id, .. }
            | Self::RunCompleted { run_id }
            | Self::RunFailed { run_id, .. } => run_id,
        }
    }

    /// Returns the step name for this event, if applicable.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::StepStarted { step, .. }
            | Self::StepCompleted { step, .. }
            | Self::StepFailed { step, .. } => Some(step),
            Self::RunStarted { .. } | Self::RunCompleted { .. } | Self::RunFailed { .. } => None,
        }
    }

    /// Returns true if this is an error event.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::StepFailed { .. } | Self::RunFailed { .. })
    }
}

/// What happened to one step during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    /// The step name.
    pub name: String,
    /// Worker-pool size.
    pub workers: usize,
    /// Invocations dispatched.
    pub invocations: u32,
    /// Invocations that returned successfully.
    pub completed: u32,
    /// Successful invocations that returned an event.
    pub emitted: u32,
    /// When the first invocation was dispatched.
    pub first_started_at: Option<DateTime<Utc>>,
    /// When the last invocation finished.
    pub last_finished_at: Option<DateTime<Utc>>,
}

impl StepSummary {
    /// Creates an empty summary for a registered step.
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        Self {
            name: name.into(),
            workers,
            invocations: 0,
            completed: 0,
            emitted: 0,
            first_started_at: None,
            last_finished_at: None,
        }
    }

    pub(crate) fn record_dispatch(&mut self) {
        self.invocations += 1;
        if self.first_started_at.is_none() {
            self.first_started_at = Some(Utc::now());
        }
    }

    pub(crate) fn record_completion(&mut self, emitted: bool) {
        self.completed += 1;
        if emitted {
            self.emitted += 1;
        }
        self.last_finished_at = Some(Utc::now());
    }

    /// Invocations that were dispatched but never finished (cut short by
    /// the stop event).
    pub fn abandoned(&self) -> u32 {
        self.invocations - self.completed
    }

    fn status_char(&self) -> char {
        if self.invocations == 0 {
            '·'
        } else if self.abandoned() > 0 {
            '…'
        } else {
            '✓'
        }
    }
}

/// Per-step account of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// The run identifier.
    pub run_id: String,
    /// Name of the workflow.
    pub workflow: String,
    /// One entry per registered step, in registration order.
    pub steps: Vec<StepSummary>,
}

impl RunSummary {
    /// Returns the summary for `step`.
    pub fn step(&self, name: &str) -> Option<&StepSummary> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Total invocations across every step.
    pub fn total_invocations(&self) -> u32 {
        self.steps.iter().map(|s| s.invocations).sum()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} of workflow \"{}\":", self.run_id, self.workflow)?;
        writeln!(f)?;

        for step in &self.steps {
            let time_str = step
                .last_finished_at
                .or(step.first_started_at)
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());

            write!(
                f,
                "  {} {:<28} x{:<3} ok {:<3} emitted {:<3} {}",
                step.status_char(),
                step.name,
                step.invocations,
                step.completed,
                step.emitted,
                time_str
            )?;

            if step.workers > 1 {
                write!(f, "  (workers {})", step.workers)?;
            }
            if step.abandoned() > 0 {
                write!(f, "  abandoned {}", step.abandoned())?;
            }

            writeln!(f)?;
        }

        writeln!(f)?;
        writeln!(f, "Invocations: {}", self.total_invocations())
    }
}
