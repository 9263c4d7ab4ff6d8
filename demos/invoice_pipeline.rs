//! Invoice reconciliation end to end, against in-memory collaborators.
//!
//! This example demonstrates:
//! - Indexing a batch of contracts with fan-out/fan-in
//! - Processing an invoice: download, extract, reconcile, record
//! - Reading the status stream while a run executes
//! - Subscribing to lifecycle events and printing the run summary
//!
//! Run with: `cargo run --example invoice_pipeline`
//!
//! Set `RUST_LOG=heddle=debug` to see the engine's tracing output.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use heddle::config::ExtractionSettings;
use heddle::pipelines::index_contract::BatchContractEvent;
use heddle::pipelines::process_file::FileEvent;
use heddle::pipelines::{batch_index_workflow, process_file_workflow};
use heddle::services::{
    ContentFetcher, ContractDocument, ContractIndex, ExtractionOutcome, ExtractionRun, Extractor,
    FileContentUrl, FileMetadata, FileStore, PredictionTarget, RetrievedNode, SourceDocument,
    StructuredPredictor,
};
use heddle::{
    async_trait, HeddleError, MemoryRecordStore, PipelineConfig, RecordStore, Result, Services,
    StatusLevel, WorkflowEvent, WorkflowHandler,
};
use serde_json::{json, Value as JsonValue};

/// A fixed set of files served from memory.
#[derive(Debug)]
struct Drive {
    files: HashMap<&'static str, (&'static str, &'static str)>,
}

impl Drive {
    fn new() -> Self {
        let files = HashMap::from([
            (
                "file-c1",
                (
                    "acme-msa.txt",
                    "Master services agreement between Example Corp and Acme Supplies. \
                     Payment terms: Net 30. Office supplies at agreed unit prices.",
                ),
            ),
            (
                "file-c2",
                (
                    "globex-cleaning.txt",
                    "Cleaning services agreement with Globex Facilities. Payment terms: Net 45.",
                ),
            ),
            (
                "file-inv",
                (
                    "acme-invoice-1042.txt",
                    "vendor_name: Acme Supplies\n\
                     invoice_number: INV-1042\n\
                     invoice_date: 2026-09-30\n\
                     payment_terms: Net 15\n\
                     total: 1250.00\n",
                ),
            ),
        ]);
        Self { files }
    }
}

#[async_trait]
impl FileStore for Drive {
    async fn get_file_metadata(&self, file_id: &str) -> Result<FileMetadata> {
        let (name, _) = self
            .files
            .get(file_id)
            .ok_or_else(|| HeddleError::Service(format!("file {file_id} not found")))?;
        Ok(FileMetadata {
            id: file_id.to_string(),
            name: name.to_string(),
        })
    }

    async fn get_file_content_url(&self, file_id: &str) -> Result<FileContentUrl> {
        Ok(FileContentUrl {
            url: format!("memory://{file_id}"),
        })
    }
}

#[async_trait]
impl ContentFetcher for Drive {
    async fn download(&self, url: &str, destination: &Path) -> Result<u64> {
        let id = url.trim_start_matches("memory://");
        let (_, content) = self
            .files
            .get(id)
            .ok_or_else(|| HeddleError::Service(format!("nothing at {url}")))?;
        tokio::fs::write(destination, content).await?;
        Ok(content.len() as u64)
    }
}

/// Reads `key: value` lines as invoice fields.
#[derive(Debug)]
struct LineExtractor;

#[async_trait]
impl Extractor for LineExtractor {
    async fn extract(
        &self,
        document: &SourceDocument,
        _settings: &ExtractionSettings,
    ) -> Result<ExtractionOutcome> {
        let text = tokio::fs::read_to_string(&document.path).await?;
        let mut data = serde_json::Map::new();
        for line in text.lines() {
            if let Some((key, value)) = line.split_once(':') {
                let value = value.trim();
                let value = match value.parse::<f64>() {
                    Ok(number) => json!(number),
                    Err(_) => json!(value),
                };
                data.insert(key.trim().to_string(), value);
            }
        }
        Ok(ExtractionOutcome::Valid(ExtractionRun {
            data: JsonValue::Object(data),
            field_metadata: json!({}),
        }))
    }
}

/// Ranks contracts by how many query words they contain.
#[derive(Debug, Default)]
struct KeywordIndex {
    documents: Mutex<Vec<ContractDocument>>,
}

#[async_trait]
impl ContractIndex for KeywordIndex {
    fn id(&self) -> &str {
        "demo-contracts"
    }

    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedNode>> {
        let words: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        let documents = self
            .documents
            .lock()
            .map_err(|_| HeddleError::Service("index lock poisoned".into()))?;
        let mut scored: Vec<(usize, &ContractDocument)> = documents
            .iter()
            .map(|doc| {
                let text = doc.text.to_lowercase();
                (words.iter().filter(|w| text.contains(w.as_str())).count(), doc)
            })
            .filter(|(hits, _)| *hits > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(hits, doc)| RetrievedNode {
                text: doc.text.clone(),
                metadata: doc.metadata.clone(),
                score: Some(hits as f64 / words.len().max(1) as f64),
            })
            .collect())
    }

    async fn insert(&self, document: ContractDocument) -> Result<()> {
        self.documents
            .lock()
            .map_err(|_| HeddleError::Service("index lock poisoned".into()))?
            .push(document);
        Ok(())
    }
}

/// Always picks the top-ranked contract and compares payment terms.
#[derive(Debug)]
struct FirstMatch;

#[async_trait]
impl StructuredPredictor for FirstMatch {
    async fn predict(
        &self,
        _target: &PredictionTarget,
        _prompt: &str,
        variables: &HashMap<String, String>,
    ) -> Result<JsonValue> {
        let invoice_terms = variables.get("payment_terms").cloned().unwrap_or_default();
        let contracts = variables.get("contracts_text").cloned().unwrap_or_default();
        let contract_terms = contracts
            .split("Payment terms:")
            .nth(1)
            .and_then(|rest| rest.split('.').next())
            .map(|terms| terms.trim().to_string());

        let mut discrepancies = Vec::new();
        if let Some(terms) = &contract_terms {
            if *terms != invoice_terms {
                discrepancies.push(json!({
                    "field": "payment_terms",
                    "invoice_value": invoice_terms,
                    "contract_value": terms,
                    "severity": "medium",
                    "note": "Invoice terms differ from the contract",
                }));
            }
        }

        Ok(json!({
            "is_match": true,
            "matched_contract_index": 0,
            "match_confidence": "high",
            "match_rationale": "Vendor name appears in the top-ranked contract",
            "contract_payment_terms": contract_terms,
            "discrepancies": discrepancies,
        }))
    }
}

async fn drain_status<S>(handler: &mut WorkflowHandler<S>) {
    while let Some(status) = handler.next_status().await {
        let marker = match status.level {
            StatusLevel::Info => "ℹ️ ",
            StatusLevel::Warning => "⚠️ ",
            StatusLevel::Error => "❌",
        };
        println!("   {} {}", marker, status.message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    println!("╔═══════════════════════════════════════════╗");
    println!("║  Heddle Invoice Pipeline Example          ║");
    println!("╚═══════════════════════════════════════════╝\n");

    let scratch = std::env::temp_dir().join(format!("heddle-demo-{}", std::process::id()));
    tokio::fs::create_dir_all(&scratch).await?;

    let mut config = PipelineConfig::from_env()?;
    config.scratch_dir = scratch.clone();

    let drive = Arc::new(Drive::new());
    let records = MemoryRecordStore::new(config.extracted_data_collection.clone());
    let services = Services {
        files: drive.clone(),
        fetcher: drive,
        extractor: Arc::new(LineExtractor),
        contracts: Arc::new(KeywordIndex::default()),
        predictor: Arc::new(FirstMatch),
        records: Arc::new(records.clone()),
    };

    // Index contracts
    println!("📚 Indexing contracts");
    println!("─────────────────────────────────────────");
    let indexing = batch_index_workflow(&services, &config)?;
    let mut handler = indexing.run(BatchContractEvent {
        file_ids: vec!["file-c1".into(), "file-c2".into()],
    });
    drain_status(&mut handler).await;
    let output = handler.finish().await?;
    println!("   Result: {}\n", output.result);

    // Process an invoice
    println!("🧾 Processing invoice");
    println!("─────────────────────────────────────────");
    let processing = process_file_workflow(&services, &config)?;

    let mut lifecycle = processing.subscribe();
    let watcher = tokio::spawn(async move {
        let mut finished = Vec::new();
        while let Ok(event) = lifecycle.recv().await {
            match event {
                WorkflowEvent::StepCompleted { step, .. } => finished.push(step),
                WorkflowEvent::RunCompleted { .. } | WorkflowEvent::RunFailed { .. } => break,
                _ => {}
            }
        }
        finished
    });

    let mut handler = processing.run(FileEvent {
        file_id: "file-inv".into(),
    });
    drain_status(&mut handler).await;
    let output = handler.finish().await?;
    let steps = watcher.await.unwrap_or_default();
    println!("   Steps completed: {}\n", steps.join(" → "));

    // Show the stored record
    println!("📊 Stored record");
    println!("─────────────────────────────────────────");
    let item_id = output.result.as_str().unwrap_or_default();
    if let Some(item) = records.get_item(item_id).await? {
        println!("{}", serde_json::to_string_pretty(&item.data)?);
    }

    println!("\n{}", output.steps);

    tokio::fs::remove_dir_all(&scratch).await?;
    println!("🎉 Done!\n");
    Ok(())
}
