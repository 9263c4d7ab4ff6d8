//! The caller's side of a running workflow.

use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::status::{RunPhase, RunSummary, StatusEvent};
use crate::{HeddleError, Result};

/// What a completed run hands back.
#[derive(Debug, Clone)]
pub struct RunOutput<S> {
    /// The stop event's payload.
    pub result: JsonValue,
    /// The run state as it was when the engine took the stop event off
    /// its queue. Invocations cancelled by the stop do not show up here.
    pub state: S,
    /// Per-step account of the run.
    pub steps: RunSummary,
}

/// Handle to one in-flight run.
///
/// The run executes on its own task from the moment
/// [`Workflow::run`](crate::Workflow::run) returns. The handler can
/// observe its status stream while it executes and await its result.
/// Dropping the handler does not stop the run; use [`abort`](Self::abort).
#[derive(Debug)]
pub struct WorkflowHandler<S> {
    run_id: String,
    status_rx: mpsc::UnboundedReceiver<StatusEvent>,
    phase_rx: watch::Receiver<RunPhase>,
    join: JoinHandle<Result<RunOutput<S>>>,
}

impl<S> WorkflowHandler<S> {
    pub(crate) fn new(
        run_id: String,
        status_rx: mpsc::UnboundedReceiver<StatusEvent>,
        phase_rx: watch::Receiver<RunPhase>,
        join: JoinHandle<Result<RunOutput<S>>>,
    ) -> Self {
        Self {
            run_id,
            status_rx,
            phase_rx,
            join,
        }
    }

    /// The identifier of this run.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The current lifecycle phase.
    pub fn phase(&self) -> RunPhase {
        let phase = *self.phase_rx.borrow();
        if !phase.is_terminal() && (self.join.is_finished() || self.phase_rx.has_changed().is_err()) {
            // the run task went away before the engine could record an outcome
            return RunPhase::Failed;
        }
        phase
    }

    /// Waits for the next status notification.
    ///
    /// Notifications arrive in the order they were written. Returns
    /// `None` once the run has ended and every notification written
    /// before the end, including those preceding a failure, has been
    /// delivered.
    pub async fn next_status(&mut self) -> Option<StatusEvent> {
        self.status_rx.recv().await
    }

    /// Waits until the run reaches a terminal phase and returns it.
    ///
    /// A run that was aborted, or whose task died, reports
    /// [`RunPhase::Failed`].
    pub async fn wait_for_terminal(&mut self) -> RunPhase {
        match self.phase_rx.wait_for(RunPhase::is_terminal).await {
            Ok(phase) => *phase,
            Err(_) => RunPhase::Failed,
        }
    }

    /// Cancels the run. In-flight step invocations are abandoned.
    pub fn abort(&self) {
        self.join.abort();
    }

    /// Waits for the run and returns its full output.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the run, or
    /// [`HeddleError::RunAborted`] if the run was aborted.
    pub async fn finish(self) -> Result<RunOutput<S>> {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => Err(HeddleError::RunAborted("run was aborted".into())),
            Err(e) => Err(HeddleError::RunAborted(e.to_string())),
        }
    }

    /// Waits for the run and returns the stop event's payload.
    ///
    /// # Errors
    ///
    /// Same as [`finish`](Self::finish).
    pub async fn result(self) -> Result<JsonValue> {
        self.finish().await.map(|output| output.result)
    }
}
