//! The invoice-reconciliation pipelines built on the engine.
//!
//! - [`process_file`]: extract one invoice, reconcile it, store the record
//! - [`index_contract`]: index one contract, or a batch with fan-out/fan-in
//! - [`metadata`]: report schema and collection names
//!
//! Each module exposes its events, state type, steps, and a builder that
//! wires the steps from [`Services`](crate::Services) and
//! [`PipelineConfig`](crate::PipelineConfig).

pub mod index_contract;
pub mod metadata;
pub mod process_file;
pub mod reconcile;

pub use index_contract::{batch_index_workflow, index_contract_workflow};
pub use metadata::metadata_workflow;
pub use process_file::process_file_workflow;
