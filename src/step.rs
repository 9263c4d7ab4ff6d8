//! The step abstraction.
//!
//! A step is a named unit of work bound to the event kinds it consumes.
//! It knows nothing about other steps: it receives one event, may read and
//! edit run state through its [`Context`], and returns at most one event.

use std::fmt::Debug;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::event::{AnyEvent, Event, EventKind, StopEvent};
use crate::{Context, Result};

/// What a step invocation hands back to the engine.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Submit this event to the run's queue.
    Emit(AnyEvent),

    /// No direct successor. Either the step injected its successors with
    /// [`Context::send_event`], or it is a fan-in step still waiting for
    /// the rest of its collection.
    Continue,
}

impl StepOutcome {
    /// Emits a concrete event.
    pub fn emit<E: Event>(event: E) -> Self {
        Self::Emit(AnyEvent::new(event))
    }

    /// Emits a [`StopEvent`] carrying `result`, ending the run.
    pub fn stop(result: JsonValue) -> Self {
        Self::emit(StopEvent::new(result))
    }

    /// Emits a [`StopEvent`] carrying any serializable result.
    ///
    /// # Errors
    ///
    /// Returns [`HeddleError::Serialization`](crate::HeddleError::Serialization)
    /// if the value cannot be represented as JSON.
    pub fn stop_with<T: Serialize>(result: &T) -> Result<Self> {
        Ok(Self::emit(StopEvent::from_serialize(result)?))
    }

    /// Returns the emitted event, if any.
    pub fn event(&self) -> Option<&AnyEvent> {
        match self {
            Self::Emit(event) => Some(event),
            Self::Continue => None,
        }
    }
}

/// A unit of work in a workflow.
///
/// # Object Safety
///
/// This trait is object-safe; the registry stores steps as
/// `Arc<dyn Step<S>>`.
///
/// # Examples
///
/// ```
/// use heddle::{async_trait, AnyEvent, Context, Event, EventKind, Result, Step, StepOutcome};
///
/// #[derive(Debug)]
/// struct FileEvent {
///     file_id: String,
/// }
/// impl Event for FileEvent {}
///
/// #[derive(Debug)]
/// struct Echo;
///
/// #[async_trait]
/// impl Step<()> for Echo {
///     fn name(&self) -> &str {
///         "echo"
///     }
///
///     fn accepts(&self) -> Vec<EventKind> {
///         vec![EventKind::of::<FileEvent>()]
///     }
///
///     async fn execute(&self, event: AnyEvent, _ctx: &Context<()>) -> Result<StepOutcome> {
///         let file = event.expect::<FileEvent>(self.name())?;
///         Ok(StepOutcome::stop(serde_json::json!(file.file_id)))
///     }
/// }
/// ```
#[async_trait]
pub trait Step<S>: Debug + Send + Sync {
    /// Returns the name of this step.
    ///
    /// Step names must be unique within a workflow; they label log spans,
    /// lifecycle events and errors.
    fn name(&self) -> &str;

    /// The event kinds this step consumes. Must not be empty.
    fn accepts(&self) -> Vec<EventKind>;

    /// The event kinds this step may emit, directly or through
    /// [`Context::send_event`].
    ///
    /// Optional. When declared, the workflow builder checks that each kind
    /// has a consumer and that the step can reach a stop-producing step.
    fn produces(&self) -> Vec<EventKind> {
        Vec::new()
    }

    /// Handles one event.
    ///
    /// Invocations of the same step may run concurrently, up to the
    /// step's worker-pool size. An error ends the run.
    async fn execute(&self, event: AnyEvent, ctx: &Context<S>) -> Result<StepOutcome>;
}
