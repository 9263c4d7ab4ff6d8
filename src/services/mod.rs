//! Contracts with the external collaborators the pipelines call.
//!
//! Every collaborator is a shared, reentrant handle: implementations must
//! be safe to call from concurrent step invocations. The pipelines only
//! ever talk to them through these traits, so tests and demos swap in
//! in-memory stand-ins.

mod download;

use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::config::ExtractionSettings;
use crate::record_store::RecordStore;
use crate::{HeddleError, Result};

pub use download::{fetch_known, fetch_to_scratch, scratch_path, FetchedFile, HttpFetcher};

/// Metadata of a stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// File identifier.
    pub id: String,
    /// Original file name.
    pub name: String,
}

/// A short-lived URL to a stored file's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContentUrl {
    /// Download URL.
    pub url: String,
}

/// Cloud file storage.
#[async_trait]
pub trait FileStore: Debug + Send + Sync {
    /// Looks up a file's metadata.
    async fn get_file_metadata(&self, file_id: &str) -> Result<FileMetadata>;

    /// Returns a URL the file's content can be downloaded from.
    async fn get_file_content_url(&self, file_id: &str) -> Result<FileContentUrl>;
}

/// Streams remote content to local scratch storage.
#[async_trait]
pub trait ContentFetcher: Debug + Send + Sync {
    /// Downloads `url` to `destination`, returning the byte count.
    ///
    /// On failure no partial file is left behind.
    async fn download(&self, url: &str, destination: &Path) -> Result<u64>;
}

/// A downloaded document handed to the extraction service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDocument {
    /// File identifier in the file store.
    pub file_id: String,
    /// Original file name.
    pub filename: String,
    /// Local path of the downloaded content.
    pub path: PathBuf,
}

/// Schema-conforming extraction output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRun {
    /// Extracted fields.
    pub data: JsonValue,
    /// Per-field confidence and citation metadata.
    #[serde(default)]
    pub field_metadata: JsonValue,
}

/// Extraction output that does not conform to the schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidExtraction {
    /// The raw, partially invalid payload.
    pub data: JsonValue,
    /// Why validation failed.
    pub error: String,
}

/// Result of one extraction call.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionOutcome {
    /// Output conforms to the schema.
    Valid(ExtractionRun),
    /// Output was produced but failed validation.
    Invalid(InvalidExtraction),
}

/// Managed structured-extraction service.
#[async_trait]
pub trait Extractor: Debug + Send + Sync {
    /// Extracts structured fields from `document`.
    ///
    /// Schema violations are reported as [`ExtractionOutcome::Invalid`];
    /// an `Err` means the call itself failed.
    async fn extract(
        &self,
        document: &SourceDocument,
        settings: &ExtractionSettings,
    ) -> Result<ExtractionOutcome>;
}

/// A retrieved chunk of indexed text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedNode {
    /// Chunk text.
    pub text: String,
    /// Metadata attached at insert time (`filename`, `file_id`, ...).
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
    /// Similarity score, if the index reports one.
    #[serde(default)]
    pub score: Option<f64>,
}

impl RetrievedNode {
    /// Returns a string metadata value.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(JsonValue::as_str)
    }
}

/// A document to insert into the contracts index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractDocument {
    /// Full text.
    pub text: String,
    /// Metadata stored alongside the text.
    pub metadata: Map<String, JsonValue>,
}

/// Managed vector index over contract text.
#[async_trait]
pub trait ContractIndex: Debug + Send + Sync {
    /// Name or identifier of the index.
    fn id(&self) -> &str;

    /// Returns up to `top_k` nodes ordered by relevance. May be empty.
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedNode>>;

    /// Adds a document to the index.
    async fn insert(&self, document: ContractDocument) -> Result<()>;
}

/// The type a structured prediction should produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionTarget {
    /// Name of the output type.
    pub name: String,
    /// JSON schema of the output type.
    pub schema: JsonValue,
}

/// Language-model structured prediction.
#[async_trait]
pub trait StructuredPredictor: Debug + Send + Sync {
    /// Renders `prompt` with `variables` and returns an instance of
    /// `target` as JSON.
    async fn predict(
        &self,
        target: &PredictionTarget,
        prompt: &str,
        variables: &HashMap<String, String>,
    ) -> Result<JsonValue>;
}

/// Runs a prediction and deserializes it into `T`.
///
/// # Errors
///
/// Propagates the predictor's error, or returns
/// [`HeddleError::Validation`] if the output does not fit `T`.
pub async fn predict_as<T: DeserializeOwned>(
    predictor: &dyn StructuredPredictor,
    target: &PredictionTarget,
    prompt: &str,
    variables: &HashMap<String, String>,
) -> Result<T> {
    let value = predictor.predict(target, prompt, variables).await?;
    serde_json::from_value(value).map_err(|e| {
        HeddleError::Validation(format!("{} output does not match its schema: {e}", target.name))
    })
}

/// Shared collaborator handles for the pipelines.
#[derive(Debug, Clone)]
pub struct Services {
    /// File storage.
    pub files: Arc<dyn FileStore>,
    /// Content downloader.
    pub fetcher: Arc<dyn ContentFetcher>,
    /// Extraction service.
    pub extractor: Arc<dyn Extractor>,
    /// Contracts index.
    pub contracts: Arc<dyn ContractIndex>,
    /// Structured-prediction model.
    pub predictor: Arc<dyn StructuredPredictor>,
    /// Record store for extracted data.
    pub records: Arc<dyn RecordStore>,
}
