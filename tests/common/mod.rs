//! In-memory collaborators for pipeline tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use heddle::config::ExtractionSettings;
use heddle::pipelines::reconcile::render_prompt;
use heddle::services::{
    ContentFetcher, ContractDocument, ContractIndex, ExtractionOutcome, ExtractionRun, Extractor,
    FileContentUrl, FileMetadata, FileStore, InvalidExtraction, PredictionTarget, RetrievedNode,
    SourceDocument, StructuredPredictor,
};
use heddle::{HeddleError, MemoryRecordStore, PipelineConfig, Result, Services};

/// Files by id: name and content. Doubles as file store and fetcher.
#[derive(Debug, Default)]
pub struct Cloud {
    files: HashMap<String, (String, Vec<u8>)>,
    downloads: AtomicUsize,
    delay: Option<Duration>,
}

impl Cloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, id: &str, name: &str, content: &[u8]) -> Self {
        self.files
            .insert(id.to_string(), (name.to_string(), content.to_vec()));
        self
    }

    /// Sleeps this long inside each download.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileStore for Cloud {
    async fn get_file_metadata(&self, file_id: &str) -> Result<FileMetadata> {
        let (name, _) = self
            .files
            .get(file_id)
            .ok_or_else(|| HeddleError::Service(format!("file {file_id} not found")))?;
        Ok(FileMetadata {
            id: file_id.to_string(),
            name: name.clone(),
        })
    }

    async fn get_file_content_url(&self, file_id: &str) -> Result<FileContentUrl> {
        Ok(FileContentUrl {
            url: format!("mem://{file_id}"),
        })
    }
}

#[async_trait]
impl ContentFetcher for Cloud {
    async fn download(&self, url: &str, destination: &Path) -> Result<u64> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let id = url.trim_start_matches("mem://");
        let (_, content) = self
            .files
            .get(id)
            .ok_or_else(|| HeddleError::Service(format!("404 for {url}")))?;
        tokio::fs::write(destination, content).await?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(content.len() as u64)
    }
}

/// What the stub extractor returns.
#[derive(Debug, Clone)]
pub enum Extraction {
    Valid(JsonValue),
    Invalid(JsonValue, String),
    Fail(String),
}

#[derive(Debug)]
pub struct StubExtractor {
    pub outcome: Extraction,
    pub seen: Mutex<Vec<PathBuf>>,
    pub agents: Mutex<Vec<String>>,
}

impl StubExtractor {
    pub fn new(outcome: Extraction) -> Self {
        Self {
            outcome,
            seen: Mutex::new(Vec::new()),
            agents: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Extractor for StubExtractor {
    async fn extract(
        &self,
        document: &SourceDocument,
        settings: &ExtractionSettings,
    ) -> Result<ExtractionOutcome> {
        self.seen.lock().unwrap().push(document.path.clone());
        self.agents.lock().unwrap().push(settings.agent_name.clone());
        match &self.outcome {
            Extraction::Valid(data) => Ok(ExtractionOutcome::Valid(ExtractionRun {
                data: data.clone(),
                field_metadata: serde_json::json!({"total": {"confidence": 0.9}}),
            })),
            Extraction::Invalid(data, error) => Ok(ExtractionOutcome::Invalid(InvalidExtraction {
                data: data.clone(),
                error: error.clone(),
            })),
            Extraction::Fail(message) => Err(HeddleError::Service(message.clone())),
        }
    }
}

/// Contracts index that returns everything inserted, up to `top_k`.
#[derive(Debug, Default)]
pub struct StubIndex {
    pub documents: Mutex<Vec<ContractDocument>>,
    pub queries: Mutex<Vec<String>>,
    pub fail_retrieval: bool,
}

impl StubIndex {
    pub fn with_contracts(documents: Vec<ContractDocument>) -> Self {
        Self {
            documents: Mutex::new(documents),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_retrieval: true,
            ..Default::default()
        }
    }

    pub fn inserted(&self) -> Vec<ContractDocument> {
        self.documents.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContractIndex for StubIndex {
    fn id(&self) -> &str {
        "contracts-index-1"
    }

    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedNode>> {
        self.queries.lock().unwrap().push(query.to_string());
        if self.fail_retrieval {
            return Err(HeddleError::Service("index unavailable".to_string()));
        }
        Ok(self
            .documents
            .lock()
            .unwrap()
            .iter()
            .take(top_k)
            .map(|doc| RetrievedNode {
                text: doc.text.clone(),
                metadata: doc.metadata.clone(),
                score: Some(0.8),
            })
            .collect())
    }

    async fn insert(&self, document: ContractDocument) -> Result<()> {
        self.documents.lock().unwrap().push(document);
        Ok(())
    }
}

/// Predictor returning a canned answer and keeping rendered prompts.
#[derive(Debug)]
pub struct StubPredictor {
    pub answer: JsonValue,
    pub prompts: Mutex<Vec<String>>,
}

impl StubPredictor {
    pub fn new(answer: JsonValue) -> Self {
        Self {
            answer,
            prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl StructuredPredictor for StubPredictor {
    async fn predict(
        &self,
        _target: &PredictionTarget,
        prompt: &str,
        variables: &HashMap<String, String>,
    ) -> Result<JsonValue> {
        self.prompts
            .lock()
            .unwrap()
            .push(render_prompt(prompt, variables));
        Ok(self.answer.clone())
    }
}

/// Handles to the stubs behind a [`Services`] bundle.
pub struct Harness {
    pub cloud: Arc<Cloud>,
    pub extractor: Arc<StubExtractor>,
    pub index: Arc<StubIndex>,
    pub predictor: Arc<StubPredictor>,
    pub records: MemoryRecordStore,
    pub services: Services,
    pub config: PipelineConfig,
    _scratch: tempfile::TempDir,
}

impl Harness {
    pub fn new(cloud: Cloud, extraction: Extraction, index: StubIndex, answer: JsonValue) -> Self {
        let scratch = tempfile::tempdir().unwrap();
        let cloud = Arc::new(cloud);
        let extractor = Arc::new(StubExtractor::new(extraction));
        let index = Arc::new(index);
        let predictor = Arc::new(StubPredictor::new(answer));
        let records = MemoryRecordStore::new("invoices");

        let services = Services {
            files: cloud.clone(),
            fetcher: cloud.clone(),
            extractor: extractor.clone(),
            contracts: index.clone(),
            predictor: predictor.clone(),
            records: Arc::new(records.clone()),
        };
        let config = PipelineConfig {
            scratch_dir: scratch.path().to_path_buf(),
            run_timeout: Some(Duration::from_secs(10)),
            ..PipelineConfig::default()
        };

        Self {
            cloud,
            extractor,
            index,
            predictor,
            records,
            services,
            config,
            _scratch: scratch,
        }
    }
}

pub fn contract(file_id: &str, filename: &str, text: &str) -> ContractDocument {
    ContractDocument {
        text: text.to_string(),
        metadata: heddle::pipelines::index_contract::contract_metadata(file_id, filename),
    }
}
