//! The event model.
//!
//! Steps communicate exclusively through events. An event is any
//! `Debug + Send + Sync + 'static` type that opts in by implementing
//! [`Event`]. The engine routes events by type identity ([`EventKind`]),
//! never by field content, and moves them around as type-erased
//! [`AnyEvent`] envelopes.
//!
//! Two event types are reserved: [`StartEvent`], a parameterless entry
//! point, and [`StopEvent`], which terminates a run and carries its
//! result. Any user event type may start a run.

use std::any::{Any, TypeId};
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::{HeddleError, Result};

/// Marker trait for types that can flow between steps.
///
/// # Examples
///
/// ```
/// use heddle::Event;
///
/// #[derive(Debug)]
/// struct FileDownloaded {
///     path: std::path::PathBuf,
/// }
///
/// impl Event for FileDownloaded {}
/// ```
pub trait Event: Debug + Send + Sync + 'static {}

/// The type identity of an event, used as the routing key.
#[derive(Clone, Copy)]
pub struct EventKind {
    id: TypeId,
    type_name: &'static str,
}

impl EventKind {
    /// Returns the kind of event type `E`.
    pub fn of<E: Event>() -> Self {
        Self {
            id: TypeId::of::<E>(),
            type_name: std::any::type_name::<E>(),
        }
    }

    /// Returns the unqualified type name, e.g. `FileDownloaded`.
    pub fn name(&self) -> &'static str {
        self.type_name
            .rsplit("::")
            .next()
            .unwrap_or(self.type_name)
    }

    /// Returns the fully qualified type name.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl PartialEq for EventKind {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EventKind {}

impl Hash for EventKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Debug for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventKind({})", self.name())
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Object-safe view of an event used for erasure.
trait ErasedEvent: Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<E: Event> ErasedEvent for E {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A type-erased, immutable event.
///
/// Cloning is cheap: the payload is shared, so an event delivered to
/// several steps is never copied.
#[derive(Clone)]
pub struct AnyEvent {
    kind: EventKind,
    payload: Arc<dyn ErasedEvent>,
}

impl AnyEvent {
    /// Wraps a concrete event.
    pub fn new<E: Event>(event: E) -> Self {
        Self {
            kind: EventKind::of::<E>(),
            payload: Arc::new(event),
        }
    }

    /// Returns the routing key of this event.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Returns true if the payload is an `E`.
    pub fn is<E: Event>(&self) -> bool {
        self.kind == EventKind::of::<E>()
    }

    /// Borrows the payload as an `E`.
    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        self.payload.as_any().downcast_ref::<E>()
    }

    /// Converts into a shared `E`, returning the envelope unchanged on a
    /// kind mismatch.
    pub fn downcast<E: Event>(self) -> std::result::Result<Arc<E>, AnyEvent> {
        if !self.is::<E>() {
            return Err(self);
        }
        let kind = self.kind;
        let retained = Arc::clone(&self.payload);
        self.payload.into_any().downcast::<E>().map_err(|_| AnyEvent {
            kind,
            payload: retained,
        })
    }

    /// Like [`downcast`](Self::downcast), but reports a mismatch as
    /// [`HeddleError::UnexpectedEvent`] attributed to `step`.
    pub fn expect<E: Event>(self, step: &str) -> Result<Arc<E>> {
        self.downcast::<E>().map_err(|other| HeddleError::UnexpectedEvent {
            step: step.to_string(),
            expected: EventKind::of::<E>().name().to_string(),
            actual: other.kind().name().to_string(),
        })
    }
}

impl Debug for AnyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.payload, f)
    }
}

/// A parameterless start event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartEvent;

impl Event for StartEvent {}

/// The terminal event of a run; its payload becomes the run result.
#[derive(Debug, Clone, PartialEq)]
pub struct StopEvent {
    result: JsonValue,
}

impl StopEvent {
    /// Creates a stop event carrying a JSON result.
    pub fn new(result: JsonValue) -> Self {
        Self { result }
    }

    /// Creates a stop event from any serializable result.
    ///
    /// # Errors
    ///
    /// Returns [`HeddleError::Serialization`] if the value cannot be
    /// represented as JSON.
    pub fn from_serialize<T: Serialize>(result: &T) -> Result<Self> {
        Ok(Self {
            result: serde_json::to_value(result)?,
        })
    }

    /// Returns the result payload.
    pub fn result(&self) -> &JsonValue {
        &self.result
    }

    /// Consumes the event, returning its payload.
    pub fn into_result(self) -> JsonValue {
        self.result
    }
}

impl Event for StopEvent {}
