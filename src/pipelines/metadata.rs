//! Single-step workflow exposing pipeline configuration to a UI.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::config::PipelineConfig;
use crate::invoice::invoice_schema;
use crate::services::{ContractIndex, Services};
use crate::{AnyEvent, Context, EventKind, Result, StartEvent, Step, StepOutcome, StopEvent, Workflow};

/// The metadata workflow's result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataResponse {
    /// Schema of the stored invoice records.
    pub json_schema: JsonValue,
    /// Collection the records are stored in.
    pub extracted_data_collection: String,
    /// Identifier of the contracts index.
    pub contracts_pipeline_id: String,
}

/// Answers a [`StartEvent`] with a [`MetadataResponse`].
#[derive(Debug)]
pub struct GetMetadata {
    contracts: Arc<dyn ContractIndex>,
    collection: String,
}

impl GetMetadata {
    /// Creates the step.
    pub fn new(contracts: Arc<dyn ContractIndex>, collection: impl Into<String>) -> Self {
        Self {
            contracts,
            collection: collection.into(),
        }
    }
}

#[async_trait]
impl Step<()> for GetMetadata {
    fn name(&self) -> &str {
        "get_metadata"
    }

    fn accepts(&self) -> Vec<EventKind> {
        vec![EventKind::of::<StartEvent>()]
    }

    fn produces(&self) -> Vec<EventKind> {
        vec![EventKind::of::<StopEvent>()]
    }

    async fn execute(&self, _event: AnyEvent, _ctx: &Context<()>) -> Result<StepOutcome> {
        StepOutcome::stop_with(&MetadataResponse {
            json_schema: invoice_schema(),
            extracted_data_collection: self.collection.clone(),
            contracts_pipeline_id: self.contracts.id().to_string(),
        })
    }
}

/// Builds the metadata workflow.
///
/// # Errors
///
/// Returns an error if the workflow fails validation.
pub fn metadata_workflow(services: &Services, config: &PipelineConfig) -> Result<Workflow<()>> {
    Workflow::builder("metadata")
        .step(GetMetadata::new(
            Arc::clone(&services.contracts),
            config.extracted_data_collection.clone(),
        ))
        .maybe_timeout(config.run_timeout)
        .build()
}
