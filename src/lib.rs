//! # Heddle
//!
//! An event-driven workflow engine for short-lived document-processing
//! pipelines, plus the invoice-reconciliation pipelines built on it.
//!
//! A workflow is a set of [`Step`]s. Each step consumes one or more event
//! types and returns at most one event; the engine routes every event to
//! all steps subscribed to its type until a [`StopEvent`] ends the run.
//! Steps share a run-scoped [`StateStore`], may fan out by sending any
//! number of events through their [`Context`], and fan in with
//! [`Context::collect_events`]. Progress notifications go to a per-run
//! status stream that callers read while the run is still going.
//!
//! Runs are meant to be small: one document or a short batch, a handful
//! of steps, state held in memory for the lifetime of the run.
//!
//! ## Quick Example
//!
//! ```
//! use heddle::{async_trait, AnyEvent, Context, EventKind, Result, StartEvent, Step, StepOutcome, Workflow};
//!
//! #[derive(Debug)]
//! struct Hello;
//!
//! #[async_trait]
//! impl Step<()> for Hello {
//!     fn name(&self) -> &str {
//!         "hello"
//!     }
//!
//!     fn accepts(&self) -> Vec<EventKind> {
//!         vec![EventKind::of::<StartEvent>()]
//!     }
//!
//!     async fn execute(&self, _event: AnyEvent, _ctx: &Context<()>) -> Result<StepOutcome> {
//!         Ok(StepOutcome::stop(serde_json::json!("hello")))
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<()> {
//! let workflow = Workflow::<()>::builder("greeting").step(Hello).build()?;
//! let result = workflow.run(StartEvent).result().await?;
//! assert_eq!(result, serde_json::json!("hello"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Pipelines
//!
//! The [`pipelines`] module wires the engine to external collaborators
//! described in [`services`]: a file store, an extraction service, a
//! contracts index, a structured-prediction model and a [`RecordStore`].

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![forbid(unsafe_code)]

mod collector;
pub mod config;
mod context;
pub mod error;
pub mod event;
mod handler;
pub mod invoice;
pub mod pipelines;
pub mod record_store;
mod registry;
pub mod services;
mod state;
pub mod status;
mod step;
mod workflow;

pub use async_trait::async_trait;

pub use config::{ExtractionMode, ExtractionSettings, PipelineConfig};
pub use context::Context;
pub use error::{HeddleError, Result};
pub use event::{AnyEvent, Event, EventKind, StartEvent, StopEvent};
pub use handler::{RunOutput, WorkflowHandler};
pub use invoice::{
    ExtractedRecord, InvoiceFields, InvoiceWithReconciliation, MatchConfidence, RecordStatus,
};
pub use record_store::{MemoryRecordStore, RecordFilter, RecordStore, StoredItem};
#[cfg(feature = "sqlite")]
pub use record_store::SqliteRecordStore;
pub use services::Services;
pub use state::{RunState, StateStore};
pub use status::{RunPhase, RunSummary, StatusEvent, StatusLevel, StepSummary, WorkflowEvent};
pub use step::{Step, StepOutcome};
pub use workflow::{Workflow, WorkflowBuilder};

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
