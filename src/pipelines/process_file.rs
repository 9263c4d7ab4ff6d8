//! Single-invoice pipeline: download, extract, reconcile, record.
//!
//! ```text
//! FileEvent -> run_file -> DownloadFileEvent -> download_file
//!   -> FileDownloadedEvent -> extract_file
//!   -> ExtractedEvent -> reconcile_with_contract -> ReconciledEvent ----\
//!   -> ExtractedInvalidEvent ------------------------------------------> record_extracted_data -> StopEvent
//! ```
//!
//! The run result is the id of the stored record.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::invoice::{content_hash, ExtractedRecord, InvoiceFields};
use crate::pipelines::reconcile;
use crate::record_store::RecordFilter;
use crate::services::{fetch_to_scratch, ExtractionOutcome, Services, SourceDocument};
use crate::{
    AnyEvent, Context, Event, EventKind, HeddleError, Result, StatusEvent, Step, StepOutcome,
    StopEvent, Workflow,
};

/// Starts processing of one stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    /// File identifier in the file store.
    pub file_id: String,
}

impl Event for FileEvent {}

/// Asks the download step to fetch the file recorded in state.
#[derive(Debug, Clone, Copy)]
pub struct DownloadFileEvent;

impl Event for DownloadFileEvent {}

/// The file is on local scratch storage.
#[derive(Debug, Clone, Copy)]
pub struct FileDownloadedEvent;

impl Event for FileDownloadedEvent {}

/// Extraction produced schema-conforming invoice fields.
#[derive(Debug, Clone)]
pub struct ExtractedEvent {
    /// The extracted invoice.
    pub invoice: InvoiceFields,
    /// Per-field metadata from the extraction service.
    pub field_metadata: JsonValue,
}

impl Event for ExtractedEvent {}

/// Extraction output failed validation; the raw payload is kept.
#[derive(Debug, Clone)]
pub struct ExtractedInvalidEvent {
    /// Record holding the invalid payload.
    pub record: ExtractedRecord,
}

impl Event for ExtractedInvalidEvent {}

/// The invoice was reconciled against contracts.
#[derive(Debug, Clone)]
pub struct ReconciledEvent {
    /// Record holding the reconciled invoice.
    pub record: ExtractedRecord,
}

impl Event for ReconciledEvent {}

/// Run state of the process-file pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionState {
    /// File being processed.
    pub file_id: Option<String>,
    /// Where the file was downloaded.
    pub file_path: Option<PathBuf>,
    /// Original file name.
    pub filename: Option<String>,
}

impl ExtractionState {
    fn downloaded(&self) -> Result<(String, String, PathBuf)> {
        match (&self.file_id, &self.filename, &self.file_path) {
            (Some(id), Some(name), Some(path)) => Ok((id.clone(), name.clone(), path.clone())),
            _ => Err(HeddleError::StepExecution(
                "File path or filename is not set".to_string(),
            )),
        }
    }
}

/// Records the file id and requests the download.
#[derive(Debug, Default)]
pub struct RunFile;

#[async_trait]
impl Step<ExtractionState> for RunFile {
    fn name(&self) -> &str {
        "run_file"
    }

    fn accepts(&self) -> Vec<EventKind> {
        vec![EventKind::of::<FileEvent>()]
    }

    fn produces(&self) -> Vec<EventKind> {
        vec![EventKind::of::<DownloadFileEvent>()]
    }

    async fn execute(&self, event: AnyEvent, ctx: &Context<ExtractionState>) -> Result<StepOutcome> {
        let file = event.expect::<FileEvent>(self.name())?;
        info!(file_id = %file.file_id, "running file");

        ctx.store()
            .edit_state(|state| {
                state.file_id = Some(file.file_id.clone());
                Ok::<_, HeddleError>(())
            })
            .await?;

        Ok(StepOutcome::emit(DownloadFileEvent))
    }
}

/// Downloads the file to scratch storage.
#[derive(Debug)]
pub struct DownloadFile {
    services: Services,
    scratch_dir: PathBuf,
}

impl DownloadFile {
    /// Creates the step.
    pub fn new(services: Services, scratch_dir: PathBuf) -> Self {
        Self {
            services,
            scratch_dir,
        }
    }
}

#[async_trait]
impl Step<ExtractionState> for DownloadFile {
    fn name(&self) -> &str {
        "download_file"
    }

    fn accepts(&self) -> Vec<EventKind> {
        vec![EventKind::of::<DownloadFileEvent>()]
    }

    fn produces(&self) -> Vec<EventKind> {
        vec![EventKind::of::<FileDownloadedEvent>()]
    }

    async fn execute(&self, _event: AnyEvent, ctx: &Context<ExtractionState>) -> Result<StepOutcome> {
        let file_id = ctx
            .store()
            .get_state()
            .await
            .file_id
            .ok_or_else(|| HeddleError::StepExecution("File ID is not set".to_string()))?;

        let fetched = match fetch_to_scratch(
            self.services.files.as_ref(),
            self.services.fetcher.as_ref(),
            &self.scratch_dir,
            &file_id,
        )
        .await
        {
            Ok(fetched) => fetched,
            Err(e) => {
                ctx.write_event_to_stream(StatusEvent::error(format!(
                    "Error downloading file {file_id}: {e}"
                )));
                return Err(e);
            }
        };

        ctx.store()
            .edit_state(|state| {
                state.file_path = Some(fetched.path.clone());
                state.filename = Some(fetched.filename.clone());
                Ok::<_, HeddleError>(())
            })
            .await?;

        Ok(StepOutcome::emit(FileDownloadedEvent))
    }
}

/// Runs extraction and routes valid and invalid output apart.
#[derive(Debug)]
pub struct ExtractFile {
    services: Services,
    config: PipelineConfig,
}

impl ExtractFile {
    /// Creates the step.
    pub fn new(services: Services, config: PipelineConfig) -> Self {
        Self { services, config }
    }

    async fn extract(&self, file_id: String, filename: String, path: PathBuf) -> Result<StepOutcome> {
        let document = SourceDocument {
            file_id: file_id.clone(),
            filename: filename.clone(),
            path: path.clone(),
        };

        let outcome = self
            .services
            .extractor
            .extract(&document, &self.config.extraction)
            .await?;

        let run = match outcome {
            ExtractionOutcome::Valid(run) => run,
            ExtractionOutcome::Invalid(invalid) => {
                info!(error = %invalid.error, "extraction failed validation");
                let hash = content_hash(&path).await?;
                let record = ExtractedRecord::invalid(invalid.data, invalid.error, file_id, filename, hash);
                return Ok(StepOutcome::emit(ExtractedInvalidEvent { record }));
            }
        };

        if is_empty_payload(&run.data) {
            return Err(HeddleError::StepExecution(
                "No data extracted from invoice".to_string(),
            ));
        }

        match serde_json::from_value::<InvoiceFields>(run.data.clone()) {
            Ok(invoice) => {
                debug!(?invoice, "extracted invoice data");
                Ok(StepOutcome::emit(ExtractedEvent {
                    invoice,
                    field_metadata: run.field_metadata,
                }))
            }
            Err(e) => {
                info!(error = %e, "extracted data does not fit the invoice schema");
                let hash = content_hash(&path).await?;
                let record = ExtractedRecord::invalid(run.data, e.to_string(), file_id, filename, hash);
                Ok(StepOutcome::emit(ExtractedInvalidEvent { record }))
            }
        }
    }
}

fn is_empty_payload(data: &JsonValue) -> bool {
    match data {
        JsonValue::Null => true,
        JsonValue::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[async_trait]
impl Step<ExtractionState> for ExtractFile {
    fn name(&self) -> &str {
        "extract_file"
    }

    fn accepts(&self) -> Vec<EventKind> {
        vec![EventKind::of::<FileDownloadedEvent>()]
    }

    fn produces(&self) -> Vec<EventKind> {
        vec![
            EventKind::of::<ExtractedEvent>(),
            EventKind::of::<ExtractedInvalidEvent>(),
        ]
    }

    async fn execute(&self, _event: AnyEvent, ctx: &Context<ExtractionState>) -> Result<StepOutcome> {
        let (file_id, filename, path) = ctx.store().get_state().await.downloaded()?;

        ctx.write_event_to_stream(StatusEvent::info(format!(
            "Extracting data from file {filename}"
        )));

        let outcome = self.extract(file_id, filename.clone(), path).await;
        if let Err(e) = &outcome {
            ctx.write_event_to_stream(StatusEvent::error(format!(
                "Error extracting data from file {filename}: {e}"
            )));
        }
        outcome
    }
}

/// Matches the invoice against indexed contracts.
#[derive(Debug)]
pub struct ReconcileWithContract {
    services: Services,
    config: PipelineConfig,
}

impl ReconcileWithContract {
    /// Creates the step.
    pub fn new(services: Services, config: PipelineConfig) -> Self {
        Self { services, config }
    }
}

#[async_trait]
impl Step<ExtractionState> for ReconcileWithContract {
    fn name(&self) -> &str {
        "reconcile_with_contract"
    }

    fn accepts(&self) -> Vec<EventKind> {
        vec![EventKind::of::<ExtractedEvent>()]
    }

    fn produces(&self) -> Vec<EventKind> {
        vec![EventKind::of::<ReconciledEvent>()]
    }

    async fn execute(&self, event: AnyEvent, ctx: &Context<ExtractionState>) -> Result<StepOutcome> {
        let extracted = event.expect::<ExtractedEvent>(self.name())?;
        let (file_id, filename, path) = ctx.store().get_state().await.downloaded()?;

        ctx.write_event_to_stream(StatusEvent::info("Matching invoice with contracts..."));
        let reconciled = reconcile::reconcile(&self.services, &self.config, &extracted.invoice).await;

        let hash = content_hash(&path).await?;
        let record = ExtractedRecord::reconciled(
            &reconciled,
            file_id,
            filename,
            hash,
            extracted.field_metadata.clone(),
        )?;

        Ok(StepOutcome::emit(ReconciledEvent { record }))
    }
}

/// Replaces any prior record for the same content and stores the new one.
#[derive(Debug)]
pub struct RecordExtractedData {
    services: Services,
}

impl RecordExtractedData {
    /// Creates the step.
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    async fn record(&self, record: &ExtractedRecord) -> Result<String> {
        if !record.file_hash.is_empty() {
            let removed = self
                .services
                .records
                .delete(&RecordFilter::eq("file_hash", record.file_hash.as_str()))
                .await?;
            info!(
                file_name = %record.file_name,
                file_hash = %record.file_hash,
                removed,
                "removed past data for file"
            );
        }

        let item = self
            .services
            .records
            .create_item(serde_json::to_value(record)?)
            .await?;
        Ok(item.id)
    }
}

#[async_trait]
impl Step<ExtractionState> for RecordExtractedData {
    fn name(&self) -> &str {
        "record_extracted_data"
    }

    fn accepts(&self) -> Vec<EventKind> {
        vec![
            EventKind::of::<ReconciledEvent>(),
            EventKind::of::<ExtractedInvalidEvent>(),
        ]
    }

    fn produces(&self) -> Vec<EventKind> {
        vec![EventKind::of::<StopEvent>()]
    }

    async fn execute(&self, event: AnyEvent, ctx: &Context<ExtractionState>) -> Result<StepOutcome> {
        let record = match event.downcast::<ReconciledEvent>() {
            Ok(reconciled) => reconciled.record.clone(),
            Err(other) => other.expect::<ExtractedInvalidEvent>(self.name())?.record.clone(),
        };

        match self.record(&record).await {
            Ok(item_id) => {
                ctx.write_event_to_stream(StatusEvent::info(format!(
                    "Recorded extracted data for file {}",
                    record.file_name
                )));
                Ok(StepOutcome::stop(json!(item_id)))
            }
            Err(e) => {
                ctx.write_event_to_stream(StatusEvent::error(format!(
                    "Error recording extracted data for file {}: {e}",
                    record.file_name
                )));
                Err(e)
            }
        }
    }
}

/// Builds the process-file workflow.
///
/// # Errors
///
/// Returns an error if the workflow fails validation.
pub fn process_file_workflow(
    services: &Services,
    config: &PipelineConfig,
) -> Result<Workflow<ExtractionState>> {
    Workflow::builder("process-file")
        .step(RunFile)
        .step(DownloadFile::new(services.clone(), config.scratch_dir.clone()))
        .step(ExtractFile::new(services.clone(), config.clone()))
        .step(ReconcileWithContract::new(services.clone(), config.clone()))
        .step(RecordExtractedData::new(services.clone()))
        .maybe_timeout(config.run_timeout)
        .build()
}
