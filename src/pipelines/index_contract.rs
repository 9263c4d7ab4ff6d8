//! Contract indexing, one file at a time or as a fan-out/fan-in batch.
//!
//! The batch pipeline sends one [`DownloadContractRequest`] per file id,
//! downloads and indexes them on bounded worker pools, and gathers the
//! [`ContractIndexed`] events once `total_expected` have arrived.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use tracing::info;

use crate::config::PipelineConfig;
use crate::services::{fetch_known, ContractDocument, Services};
use crate::{
    AnyEvent, Context, Event, EventKind, HeddleError, Result, RunState, StatusEvent, Step,
    StepOutcome, StopEvent, Workflow,
};

/// Reads a downloaded contract as text, dropping undecodable bytes.
pub async fn read_contract_text(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(String::from_utf8_lossy(&bytes)
        .chars()
        .filter(|c| *c != char::REPLACEMENT_CHARACTER)
        .collect())
}

/// Metadata stored with an indexed contract.
pub fn contract_metadata(file_id: &str, filename: &str) -> Map<String, JsonValue> {
    let mut metadata = Map::new();
    metadata.insert("filename".to_string(), json!(filename));
    metadata.insert("file_id".to_string(), json!(file_id));
    metadata.insert("document_type".to_string(), json!("contract"));
    metadata
}

/// Inserts one downloaded contract into the index, reporting progress.
async fn index_downloaded<S: RunState>(
    services: &Services,
    ctx: &Context<S>,
    file_id: &str,
    filename: &str,
    path: &Path,
) -> Result<()> {
    ctx.write_event_to_stream(StatusEvent::info(format!("Indexing contract: {filename}")));

    let text = read_contract_text(path).await?;
    services
        .contracts
        .insert(ContractDocument {
            text,
            metadata: contract_metadata(file_id, filename),
        })
        .await?;

    ctx.write_event_to_stream(StatusEvent::info(format!(
        "Successfully indexed contract: {filename}"
    )));
    Ok(())
}

/// Downloads `file_id`, reporting the file name before the transfer.
async fn download_contract<S: RunState>(
    services: &Services,
    ctx: &Context<S>,
    scratch_dir: &Path,
    file_id: &str,
) -> Result<(String, PathBuf)> {
    let metadata = services.files.get_file_metadata(file_id).await?;
    ctx.write_event_to_stream(StatusEvent::info(format!(
        "Downloading contract: {}",
        metadata.name
    )));

    let fetched = fetch_known(
        services.files.as_ref(),
        services.fetcher.as_ref(),
        scratch_dir,
        &metadata,
    )
    .await?;
    info!(path = %fetched.path.display(), "downloaded contract");
    Ok((fetched.filename, fetched.path))
}

/// Starts indexing of a single contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractFileEvent {
    /// File identifier in the file store.
    pub file_id: String,
}

impl Event for ContractFileEvent {}

/// Requests the download of the contract in state.
#[derive(Debug, Clone, Copy)]
pub struct DownloadContractEvent;

impl Event for DownloadContractEvent {}

/// The contract in state is on local storage.
#[derive(Debug, Clone, Copy)]
pub struct ContractDownloadedEvent;

impl Event for ContractDownloadedEvent {}

/// Run state of the single-contract pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractIndexState {
    /// Contract being indexed.
    pub file_id: Option<String>,
    /// Where it was downloaded.
    pub file_path: Option<PathBuf>,
    /// Original file name.
    pub filename: Option<String>,
}

/// Records the contract's file id.
#[derive(Debug, Default)]
pub struct StartIndexing;

#[async_trait]
impl Step<ContractIndexState> for StartIndexing {
    fn name(&self) -> &str {
        "start_indexing"
    }

    fn accepts(&self) -> Vec<EventKind> {
        vec![EventKind::of::<ContractFileEvent>()]
    }

    fn produces(&self) -> Vec<EventKind> {
        vec![EventKind::of::<DownloadContractEvent>()]
    }

    async fn execute(&self, event: AnyEvent, ctx: &Context<ContractIndexState>) -> Result<StepOutcome> {
        let start = event.expect::<ContractFileEvent>(self.name())?;
        info!(file_id = %start.file_id, "starting contract indexing");

        ctx.store()
            .edit_state(|state| {
                state.file_id = Some(start.file_id.clone());
                Ok::<_, HeddleError>(())
            })
            .await?;
        Ok(StepOutcome::emit(DownloadContractEvent))
    }
}

/// Downloads the contract recorded in state.
#[derive(Debug)]
pub struct DownloadContract {
    services: Services,
    scratch_dir: PathBuf,
}

impl DownloadContract {
    /// Creates the step.
    pub fn new(services: Services, scratch_dir: PathBuf) -> Self {
        Self {
            services,
            scratch_dir,
        }
    }
}

#[async_trait]
impl Step<ContractIndexState> for DownloadContract {
    fn name(&self) -> &str {
        "download_contract"
    }

    fn accepts(&self) -> Vec<EventKind> {
        vec![EventKind::of::<DownloadContractEvent>()]
    }

    fn produces(&self) -> Vec<EventKind> {
        vec![EventKind::of::<ContractDownloadedEvent>()]
    }

    async fn execute(&self, _event: AnyEvent, ctx: &Context<ContractIndexState>) -> Result<StepOutcome> {
        let file_id = ctx
            .store()
            .get_state()
            .await
            .file_id
            .ok_or_else(|| HeddleError::StepExecution("File ID is not set".to_string()))?;

        let (filename, path) =
            download_contract(&self.services, ctx, &self.scratch_dir, &file_id).await?;

        ctx.store()
            .edit_state(|state| {
                state.file_path = Some(path.clone());
                state.filename = Some(filename.clone());
                Ok::<_, HeddleError>(())
            })
            .await?;
        Ok(StepOutcome::emit(ContractDownloadedEvent))
    }
}

/// Inserts the downloaded contract into the index.
#[derive(Debug)]
pub struct IndexContract {
    services: Services,
}

impl IndexContract {
    /// Creates the step.
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step<ContractIndexState> for IndexContract {
    fn name(&self) -> &str {
        "index_contract"
    }

    fn accepts(&self) -> Vec<EventKind> {
        vec![EventKind::of::<ContractDownloadedEvent>()]
    }

    fn produces(&self) -> Vec<EventKind> {
        vec![EventKind::of::<StopEvent>()]
    }

    async fn execute(&self, _event: AnyEvent, ctx: &Context<ContractIndexState>) -> Result<StepOutcome> {
        let state = ctx.store().get_state().await;
        let (Some(file_id), Some(filename), Some(path)) = (state.file_id, state.filename, state.file_path)
        else {
            return Err(HeddleError::StepExecution(
                "File path or filename is not set".to_string(),
            ));
        };

        index_downloaded(&self.services, ctx, &file_id, &filename, &path).await?;
        Ok(StepOutcome::stop(json!({"file_id": file_id, "filename": filename})))
    }
}

/// Builds the single-contract indexing workflow.
///
/// # Errors
///
/// Returns an error if the workflow fails validation.
pub fn index_contract_workflow(
    services: &Services,
    config: &PipelineConfig,
) -> Result<Workflow<ContractIndexState>> {
    Workflow::builder("index-contract")
        .step(StartIndexing)
        .step(DownloadContract::new(services.clone(), config.scratch_dir.clone()))
        .step(IndexContract::new(services.clone()))
        .maybe_timeout(config.run_timeout)
        .build()
}

/// Starts indexing of several contracts in parallel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchContractEvent {
    /// File identifiers in the file store.
    pub file_ids: Vec<String>,
}

impl Event for BatchContractEvent {}

/// One contract to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadContractRequest {
    /// File identifier.
    pub file_id: String,
}

impl Event for DownloadContractRequest {}

/// One contract is on local storage; path and name are in state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractFetched {
    /// File identifier.
    pub file_id: String,
}

impl Event for ContractFetched {}

/// One contract was inserted into the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContractIndexed {
    /// File identifier.
    pub file_id: String,
    /// Original file name.
    pub filename: String,
}

impl Event for ContractIndexed {}

/// Run state of the batch pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchIndexState {
    /// How many contracts the fan-in waits for.
    pub total_expected: usize,
    /// Downloaded path per file id.
    pub file_paths: BTreeMap<String, PathBuf>,
    /// File name per file id.
    pub filenames: BTreeMap<String, String>,
}

/// Fans a batch out into one download request per file.
#[derive(Debug, Default)]
pub struct FanOutContracts;

#[async_trait]
impl Step<BatchIndexState> for FanOutContracts {
    fn name(&self) -> &str {
        "fan_out_contracts"
    }

    fn accepts(&self) -> Vec<EventKind> {
        vec![EventKind::of::<BatchContractEvent>()]
    }

    fn produces(&self) -> Vec<EventKind> {
        vec![
            EventKind::of::<DownloadContractRequest>(),
            EventKind::of::<StopEvent>(),
        ]
    }

    async fn execute(&self, event: AnyEvent, ctx: &Context<BatchIndexState>) -> Result<StepOutcome> {
        let batch = event.expect::<BatchContractEvent>(self.name())?;
        if batch.file_ids.is_empty() {
            return Ok(StepOutcome::stop(json!({"contracts": [], "total": 0})));
        }

        info!(count = batch.file_ids.len(), "indexing contract batch");
        ctx.store()
            .edit_state(|state| {
                state.total_expected = batch.file_ids.len();
                Ok::<_, HeddleError>(())
            })
            .await?;

        for file_id in &batch.file_ids {
            ctx.send_event(DownloadContractRequest {
                file_id: file_id.clone(),
            })?;
        }
        Ok(StepOutcome::Continue)
    }
}

/// Downloads one contract of a batch.
#[derive(Debug)]
pub struct DownloadBatchContract {
    services: Services,
    scratch_dir: PathBuf,
}

impl DownloadBatchContract {
    /// Creates the step.
    pub fn new(services: Services, scratch_dir: PathBuf) -> Self {
        Self {
            services,
            scratch_dir,
        }
    }
}

#[async_trait]
impl Step<BatchIndexState> for DownloadBatchContract {
    fn name(&self) -> &str {
        "download_batch_contract"
    }

    fn accepts(&self) -> Vec<EventKind> {
        vec![EventKind::of::<DownloadContractRequest>()]
    }

    fn produces(&self) -> Vec<EventKind> {
        vec![EventKind::of::<ContractFetched>()]
    }

    async fn execute(&self, event: AnyEvent, ctx: &Context<BatchIndexState>) -> Result<StepOutcome> {
        let request = event.expect::<DownloadContractRequest>(self.name())?;
        let (filename, path) =
            download_contract(&self.services, ctx, &self.scratch_dir, &request.file_id).await?;

        ctx.store()
            .edit_state(|state| {
                state.file_paths.insert(request.file_id.clone(), path.clone());
                state.filenames.insert(request.file_id.clone(), filename.clone());
                Ok::<_, HeddleError>(())
            })
            .await?;

        Ok(StepOutcome::emit(ContractFetched {
            file_id: request.file_id.clone(),
        }))
    }
}

/// Indexes one downloaded contract of a batch.
#[derive(Debug)]
pub struct IndexBatchContract {
    services: Services,
}

impl IndexBatchContract {
    /// Creates the step.
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step<BatchIndexState> for IndexBatchContract {
    fn name(&self) -> &str {
        "index_batch_contract"
    }

    fn accepts(&self) -> Vec<EventKind> {
        vec![EventKind::of::<ContractFetched>()]
    }

    fn produces(&self) -> Vec<EventKind> {
        vec![EventKind::of::<ContractIndexed>()]
    }

    async fn execute(&self, event: AnyEvent, ctx: &Context<BatchIndexState>) -> Result<StepOutcome> {
        let fetched = event.expect::<ContractFetched>(self.name())?;
        let state = ctx.store().get_state().await;
        let (Some(path), Some(filename)) = (
            state.file_paths.get(&fetched.file_id),
            state.filenames.get(&fetched.file_id),
        ) else {
            return Err(HeddleError::StepExecution(format!(
                "No download recorded for contract {}",
                fetched.file_id
            )));
        };

        index_downloaded(&self.services, ctx, &fetched.file_id, filename, path).await?;
        Ok(StepOutcome::emit(ContractIndexed {
            file_id: fetched.file_id.clone(),
            filename: filename.clone(),
        }))
    }
}

/// Waits for every contract of the batch and reports them together.
#[derive(Debug, Default)]
pub struct GatherContracts;

#[async_trait]
impl Step<BatchIndexState> for GatherContracts {
    fn name(&self) -> &str {
        "gather_contracts"
    }

    fn accepts(&self) -> Vec<EventKind> {
        vec![EventKind::of::<ContractIndexed>()]
    }

    fn produces(&self) -> Vec<EventKind> {
        vec![EventKind::of::<StopEvent>()]
    }

    async fn execute(&self, event: AnyEvent, ctx: &Context<BatchIndexState>) -> Result<StepOutcome> {
        let expected = ctx.store().get_state().await.total_expected;
        let Some(indexed) = ctx.collect_events::<ContractIndexed>(event, expected).await? else {
            return Ok(StepOutcome::Continue);
        };

        let contracts: Vec<&ContractIndexed> = indexed.iter().map(|c| c.as_ref()).collect();
        info!(total = contracts.len(), "contract batch indexed");
        StepOutcome::stop_with(&BatchIndexed {
            total: contracts.len(),
            contracts,
        })
    }
}

#[derive(Serialize)]
struct BatchIndexed<'a> {
    contracts: Vec<&'a ContractIndexed>,
    total: usize,
}

/// Builds the batch contract-indexing workflow.
///
/// Download and index steps run on pools of `config.batch_workers`.
///
/// # Errors
///
/// Returns an error if the workflow fails validation.
pub fn batch_index_workflow(
    services: &Services,
    config: &PipelineConfig,
) -> Result<Workflow<BatchIndexState>> {
    Workflow::builder("batch-index-contracts")
        .step(FanOutContracts)
        .step_with_workers(
            DownloadBatchContract::new(services.clone(), config.scratch_dir.clone()),
            config.batch_workers,
        )
        .step_with_workers(IndexBatchContract::new(services.clone()), config.batch_workers)
        .step(GatherContracts)
        .maybe_timeout(config.run_timeout)
        .build()
}
