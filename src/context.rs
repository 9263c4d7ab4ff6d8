//! The handle a step invocation gets to its run.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::collector::EventCollector;
use crate::event::{AnyEvent, Event, EventKind};
use crate::status::{StatusEvent, StatusLevel};
use crate::{HeddleError, Result, RunState, StateStore};

/// Everything one run shares between its step invocations.
#[derive(Debug)]
pub(crate) struct RunShared<S> {
    pub(crate) run_id: String,
    pub(crate) store: StateStore<S>,
    pub(crate) queue: mpsc::UnboundedSender<AnyEvent>,
    pub(crate) status: mpsc::UnboundedSender<StatusEvent>,
    pub(crate) collector: EventCollector,
}

/// Per-invocation access to the run: state, event queue, status stream
/// and fan-in buffers.
///
/// Contexts are passed explicitly to every step; there is no ambient
/// run context.
#[derive(Debug)]
pub struct Context<S> {
    step_name: String,
    shared: Arc<RunShared<S>>,
}

impl<S> Clone for Context<S> {
    fn clone(&self) -> Self {
        Self {
            step_name: self.step_name.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: RunState> Context<S> {
    pub(crate) fn new(shared: Arc<RunShared<S>>, step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            shared,
        }
    }

    /// The identifier of the current run.
    pub fn run_id(&self) -> &str {
        &self.shared.run_id
    }

    /// The name of the step being invoked.
    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    /// The run's state store.
    pub fn store(&self) -> &StateStore<S> {
        &self.shared.store
    }

    /// Injects an event into the run's queue.
    ///
    /// Used for fan-out: a step sends any number of events and returns
    /// [`StepOutcome::Continue`](crate::StepOutcome::Continue).
    ///
    /// # Errors
    ///
    /// Returns [`HeddleError::RunClosed`] if the run already ended.
    pub fn send_event<E: Event>(&self, event: E) -> Result<()> {
        self.send_any(AnyEvent::new(event))
    }

    /// Injects an already-erased event into the run's queue.
    ///
    /// # Errors
    ///
    /// Returns [`HeddleError::RunClosed`] if the run already ended.
    pub fn send_any(&self, event: AnyEvent) -> Result<()> {
        self.shared
            .queue
            .send(event)
            .map_err(|_| HeddleError::RunClosed)
    }

    /// Writes a notification to the run's status stream and logs it.
    ///
    /// Best-effort: if nobody is listening the notification is dropped.
    pub fn write_event_to_stream(&self, mut status: StatusEvent) {
        match status.level {
            StatusLevel::Info => info!(step = %self.step_name, "{}", status.message),
            StatusLevel::Warning => warn!(step = %self.step_name, "{}", status.message),
            StatusLevel::Error => error!(step = %self.step_name, "{}", status.message),
        }
        if status.step.is_none() {
            status.step = Some(self.step_name.clone());
        }
        let _ = self.shared.status.send(status);
    }

    /// Buffers `event` until `expected` events of type `E` have arrived
    /// at this step, then returns all of them in arrival order.
    ///
    /// Returns `Ok(None)` while the set is incomplete; the step should
    /// then return [`StepOutcome::Continue`](crate::StepOutcome::Continue).
    /// The full set is returned to exactly one invocation.
    ///
    /// # Errors
    ///
    /// Returns [`HeddleError::UnexpectedEvent`] if `event` is not an `E`,
    /// and [`HeddleError::InvalidWorkflow`] if `expected` is zero.
    pub async fn collect_events<E: Event>(
        &self,
        event: AnyEvent,
        expected: usize,
    ) -> Result<Option<Vec<Arc<E>>>> {
        let Some(events) = self
            .collect_any(event, &[EventKind::of::<E>()], expected)
            .await?
        else {
            return Ok(None);
        };

        events
            .into_iter()
            .map(|event| event.expect::<E>(&self.step_name))
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    /// Like [`collect_events`](Self::collect_events) over several kinds.
    ///
    /// Passing a failure kind alongside the success kind lets a fan-in
    /// step see partial failures instead of waiting for a total that
    /// will never be reached.
    ///
    /// # Errors
    ///
    /// Returns [`HeddleError::UnexpectedEvent`] if `event` is not one of
    /// `kinds`, and [`HeddleError::InvalidWorkflow`] if `expected` is zero.
    pub async fn collect_any(
        &self,
        event: AnyEvent,
        kinds: &[EventKind],
        expected: usize,
    ) -> Result<Option<Vec<AnyEvent>>> {
        self.shared
            .collector
            .collect(&self.step_name, event, kinds, expected)
            .await
    }
}
