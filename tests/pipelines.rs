//! End-to-end tests of the invoice pipelines against in-memory
//! collaborators.

mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use serde_json::{json, Value as JsonValue};

use common::{contract, Cloud, Extraction, Harness, StubIndex};
use heddle::pipelines::index_contract::{BatchContractEvent, ContractFileEvent};
use heddle::pipelines::process_file::FileEvent;
use heddle::pipelines::{
    batch_index_workflow, index_contract_workflow, metadata_workflow, process_file_workflow,
};
use heddle::{
    HeddleError, RecordFilter, RecordStore, Result, RunOutput, StartEvent, StatusEvent,
    StatusLevel, WorkflowHandler,
};

const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

/// Reads the whole status stream, then the run result.
async fn drain<S>(mut handler: WorkflowHandler<S>) -> (Vec<StatusEvent>, Result<RunOutput<S>>) {
    let mut statuses = Vec::new();
    while let Some(status) = handler.next_status().await {
        statuses.push(status);
    }
    (statuses, handler.finish().await)
}

fn messages(statuses: &[StatusEvent]) -> Vec<&str> {
    statuses.iter().map(|s| s.message.as_str()).collect()
}

fn invoice_json() -> JsonValue {
    json!({
        "invoice_number": "INV-1",
        "vendor_name": "Acme Corp",
        "purchase_order_number": "PO-7",
        "payment_terms": "Net 30",
        "total": 1200.0
    })
}

fn matched_answer() -> JsonValue {
    json!({
        "is_match": true,
        "matched_contract_index": 0,
        "match_confidence": "high",
        "match_rationale": "Vendor and PO number agree",
        "discrepancies": [{
            "field": "payment_terms",
            "invoice_value": "Net 30",
            "contract_value": "Net 45",
            "severity": "high"
        }]
    })
}

fn invoice_harness(index: StubIndex, extraction: Extraction, answer: JsonValue) -> Harness {
    Harness::new(
        Cloud::new().with_file("inv-1", "invoice.pdf", b"abc"),
        extraction,
        index,
        answer,
    )
}

fn msa_index() -> StubIndex {
    StubIndex::with_contracts(vec![contract(
        "c-1",
        "acme-msa.pdf",
        "Master services agreement with Acme Corp. Payment terms: Net 45.",
    )])
}

async fn stored_record(harness: &Harness, result: &JsonValue) -> JsonValue {
    let id = result.as_str().expect("record id");
    harness
        .records
        .get_item(id)
        .await
        .unwrap()
        .expect("stored record")
        .data
}

#[tokio::test]
async fn test_process_file_reconciles_and_records() {
    let harness = invoice_harness(msa_index(), Extraction::Valid(invoice_json()), matched_answer());
    let workflow = process_file_workflow(&harness.services, &harness.config).unwrap();

    let (statuses, output) = drain(workflow.run(FileEvent {
        file_id: "inv-1".into(),
    }))
    .await;
    let output = output.unwrap();

    assert_eq!(
        messages(&statuses),
        vec![
            "Extracting data from file invoice.pdf",
            "Matching invoice with contracts...",
            "Recorded extracted data for file invoice.pdf",
        ]
    );

    let record = stored_record(&harness, &output.result).await;
    assert_eq!(record["status"], json!("reconciled"));
    assert_eq!(record["file_id"], json!("inv-1"));
    assert_eq!(record["file_name"], json!("invoice.pdf"));
    assert_eq!(record["file_hash"], json!(ABC_SHA256));
    assert_eq!(record["field_metadata"]["total"]["confidence"], json!(0.9));

    let data = &record["data"];
    assert_eq!(data["vendor_name"], json!("Acme Corp"));
    assert_eq!(data["matched_contract_id"], json!("c-1"));
    assert_eq!(data["matched_contract_name"], json!("acme-msa.pdf"));
    assert_eq!(data["match_confidence"], json!("high"));
    assert_eq!(data["discrepancies"][0]["contract_value"], json!("Net 45"));

    assert_eq!(
        harness.index.queries.lock().unwrap().as_slice(),
        ["vendor: Acme Corp PO: PO-7 invoice: INV-1"]
    );
    let prompts = harness.predictor.prompts.lock().unwrap();
    assert!(prompts[0].contains("- Vendor: Acme Corp"));
    assert!(prompts[0].contains("- Invoice Date: N/A"));
    assert!(prompts[0].contains("Contract 0 (File: acme-msa.pdf):\nMaster services agreement"));

    let state = output.state;
    assert_eq!(state.file_id.as_deref(), Some("inv-1"));
    assert_eq!(state.filename.as_deref(), Some("invoice.pdf"));
    assert!(state.file_path.unwrap().ends_with("inv-1-invoice.pdf"));
}

#[tokio::test]
async fn test_reprocessing_replaces_record_with_same_hash() {
    let harness = invoice_harness(msa_index(), Extraction::Valid(invoice_json()), matched_answer());
    let workflow = process_file_workflow(&harness.services, &harness.config).unwrap();

    let first = workflow
        .run(FileEvent { file_id: "inv-1".into() })
        .result()
        .await
        .unwrap();
    let second = workflow
        .run(FileEvent { file_id: "inv-1".into() })
        .result()
        .await
        .unwrap();

    assert_ne!(first, second);
    let live = harness
        .records
        .list_items(&RecordFilter::eq("file_hash", ABC_SHA256))
        .await
        .unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(json!(live[0].id), second);
    assert!(harness.records.get_item(first.as_str().unwrap()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_extraction_is_persisted_not_raised() {
    let harness = invoice_harness(
        msa_index(),
        Extraction::Invalid(json!({"total": "lots"}), "total: expected a number".into()),
        matched_answer(),
    );
    let workflow = process_file_workflow(&harness.services, &harness.config).unwrap();

    let output = workflow
        .run(FileEvent { file_id: "inv-1".into() })
        .finish()
        .await
        .unwrap();

    let record = stored_record(&harness, &output.result).await;
    assert_eq!(record["status"], json!("invalid"));
    assert_eq!(record["data"], json!({"total": "lots"}));
    assert_eq!(record["validation_error"], json!("total: expected a number"));
    assert_eq!(record["file_hash"], json!(ABC_SHA256));

    let summary = output.steps;
    assert_eq!(summary.step("reconcile_with_contract").unwrap().invocations, 0);
    assert!(harness.index.queries.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_output_not_fitting_invoice_fields_takes_invalid_path() {
    let harness = invoice_harness(
        msa_index(),
        Extraction::Valid(json!({"line_items": "three widgets"})),
        matched_answer(),
    );
    let workflow = process_file_workflow(&harness.services, &harness.config).unwrap();

    let result = workflow
        .run(FileEvent { file_id: "inv-1".into() })
        .result()
        .await
        .unwrap();

    let record = stored_record(&harness, &result).await;
    assert_eq!(record["status"], json!("invalid"));
    assert_eq!(record["data"]["line_items"], json!("three widgets"));
}

#[tokio::test]
async fn test_empty_index_yields_confidence_none() {
    let harness = invoice_harness(
        StubIndex::default(),
        Extraction::Valid(invoice_json()),
        matched_answer(),
    );
    let workflow = process_file_workflow(&harness.services, &harness.config).unwrap();

    let result = workflow
        .run(FileEvent { file_id: "inv-1".into() })
        .result()
        .await
        .unwrap();

    let data = stored_record(&harness, &result).await["data"].clone();
    assert_eq!(data["match_confidence"], json!("none"));
    assert_eq!(data["match_rationale"], json!("No contracts found in the system"));
    assert_eq!(data["discrepancies"], json!([]));
    assert!(data["matched_contract_id"].is_null());
    assert!(harness.predictor.prompts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_retrieval_failure_degrades_to_error_confidence() {
    let harness = invoice_harness(
        StubIndex::failing(),
        Extraction::Valid(invoice_json()),
        matched_answer(),
    );
    let workflow = process_file_workflow(&harness.services, &harness.config).unwrap();

    let result = workflow
        .run(FileEvent { file_id: "inv-1".into() })
        .result()
        .await
        .unwrap();

    let data = stored_record(&harness, &result).await["data"].clone();
    assert_eq!(data["match_confidence"], json!("error"));
    let rationale = data["match_rationale"].as_str().unwrap();
    assert!(rationale.starts_with("Error during reconciliation:"));
    assert!(rationale.contains("index unavailable"));
    assert_eq!(data["discrepancies"], json!([]));
}

#[tokio::test]
async fn test_out_of_range_match_index_degrades_to_error_confidence() {
    let mut answer = matched_answer();
    answer["matched_contract_index"] = json!(4);
    let harness = invoice_harness(msa_index(), Extraction::Valid(invoice_json()), answer);
    let workflow = process_file_workflow(&harness.services, &harness.config).unwrap();

    let result = workflow
        .run(FileEvent { file_id: "inv-1".into() })
        .result()
        .await
        .unwrap();

    let data = stored_record(&harness, &result).await["data"].clone();
    assert_eq!(data["match_confidence"], json!("error"));
    assert!(data["match_rationale"]
        .as_str()
        .unwrap()
        .contains("out of range"));
}

#[tokio::test]
async fn test_extraction_runs_the_configured_agent() {
    let mut harness = invoice_harness(msa_index(), Extraction::Valid(invoice_json()), matched_answer());
    harness.config.extraction.agent_name = "invoices-eu".to_string();
    let workflow = process_file_workflow(&harness.services, &harness.config).unwrap();

    workflow
        .run(FileEvent { file_id: "inv-1".into() })
        .result()
        .await
        .unwrap();

    assert_eq!(
        harness.extractor.agents.lock().unwrap().as_slice(),
        ["invoices-eu"]
    );
}

#[tokio::test]
async fn test_unrecognised_confidence_tier_keeps_the_match() {
    let mut answer = matched_answer();
    answer["match_confidence"] = json!("moderate");
    let harness = invoice_harness(msa_index(), Extraction::Valid(invoice_json()), answer);
    let workflow = process_file_workflow(&harness.services, &harness.config).unwrap();

    let result = workflow
        .run(FileEvent { file_id: "inv-1".into() })
        .result()
        .await
        .unwrap();

    let data = stored_record(&harness, &result).await["data"].clone();
    assert_eq!(data["match_confidence"], json!("moderate"));
    assert_eq!(data["matched_contract_id"], json!("c-1"));
    assert_eq!(data["matched_contract_name"], json!("acme-msa.pdf"));
    assert_eq!(data["match_rationale"], json!("Vendor and PO number agree"));
    assert_eq!(data["discrepancies"][0]["field"], json!("payment_terms"));
}

#[tokio::test]
async fn test_empty_extraction_fails_run_with_status() {
    let harness = invoice_harness(msa_index(), Extraction::Valid(json!({})), matched_answer());
    let workflow = process_file_workflow(&harness.services, &harness.config).unwrap();

    let (statuses, output) = drain(workflow.run(FileEvent {
        file_id: "inv-1".into(),
    }))
    .await;

    match output.unwrap_err() {
        HeddleError::StepFailed { step, source } => {
            assert_eq!(step, "extract_file");
            assert!(source.to_string().contains("No data extracted from invoice"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    let last = statuses.last().unwrap();
    assert_eq!(last.level, StatusLevel::Error);
    assert!(last
        .message
        .starts_with("Error extracting data from file invoice.pdf:"));
    assert_eq!(harness.records.item_count().await, 0);
}

#[tokio::test]
async fn test_download_failure_reports_status_and_fails() {
    let harness = invoice_harness(msa_index(), Extraction::Valid(invoice_json()), matched_answer());
    let workflow = process_file_workflow(&harness.services, &harness.config).unwrap();

    let (statuses, output) = drain(workflow.run(FileEvent {
        file_id: "missing".into(),
    }))
    .await;

    assert!(matches!(
        output.unwrap_err(),
        HeddleError::StepFailed { ref step, .. } if step == "download_file"
    ));
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].level, StatusLevel::Error);
    assert!(statuses[0].message.starts_with("Error downloading file missing:"));
    assert_eq!(statuses[0].step.as_deref(), Some("download_file"));
}

#[tokio::test]
async fn test_index_single_contract() {
    let harness = Harness::new(
        Cloud::new().with_file("c-9", "supply.txt", b"Supply agreement \xfe\xffNet 60"),
        Extraction::Fail("unused".into()),
        StubIndex::default(),
        JsonValue::Null,
    );
    let workflow = index_contract_workflow(&harness.services, &harness.config).unwrap();

    let (statuses, output) = drain(workflow.run(ContractFileEvent {
        file_id: "c-9".into(),
    }))
    .await;

    assert_eq!(
        output.unwrap().result,
        json!({"file_id": "c-9", "filename": "supply.txt"})
    );
    assert_eq!(
        messages(&statuses),
        vec![
            "Downloading contract: supply.txt",
            "Indexing contract: supply.txt",
            "Successfully indexed contract: supply.txt",
        ]
    );

    let inserted = harness.index.inserted();
    assert_eq!(inserted.len(), 1);
    assert_eq!(inserted[0].text, "Supply agreement Net 60");
    assert_eq!(inserted[0].metadata["document_type"], json!("contract"));
    assert_eq!(inserted[0].metadata["file_id"], json!("c-9"));
}

fn batch_harness() -> Harness {
    let cloud = Cloud::new()
        .with_file("a", "a.txt", b"contract a")
        .with_file("b", "b.txt", b"contract b")
        .with_file("c", "c.txt", b"contract c")
        .with_delay(Duration::from_millis(20));
    Harness::new(cloud, Extraction::Fail("unused".into()), StubIndex::default(), JsonValue::Null)
}

#[tokio::test]
async fn test_batch_indexes_every_contract_once() {
    let harness = batch_harness();
    let workflow = batch_index_workflow(&harness.services, &harness.config).unwrap();

    let output = workflow
        .run(BatchContractEvent {
            file_ids: vec!["a".into(), "b".into(), "c".into()],
        })
        .finish()
        .await
        .unwrap();

    assert_eq!(output.result["total"], json!(3));
    let ids: BTreeSet<&str> = output.result["contracts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["file_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, BTreeSet::from(["a", "b", "c"]));
    assert!(output.result["contracts"]
        .as_array()
        .unwrap()
        .iter()
        .all(|c| c["filename"] == json!(format!("{}.txt", c["file_id"].as_str().unwrap()))));

    assert_eq!(harness.cloud.downloads(), 3);
    assert_eq!(harness.index.inserted().len(), 3);

    let steps = &output.steps;
    assert_eq!(steps.step("download_batch_contract").unwrap().invocations, 3);
    assert_eq!(steps.step("index_batch_contract").unwrap().invocations, 3);
    let gather = steps.step("gather_contracts").unwrap();
    assert_eq!(gather.invocations, 3);
    assert_eq!(gather.emitted, 1);

    assert_eq!(output.state.total_expected, 3);
    assert_eq!(output.state.filenames.len(), 3);
}

#[tokio::test]
async fn test_empty_batch_stops_immediately() {
    let harness = batch_harness();
    let workflow = batch_index_workflow(&harness.services, &harness.config).unwrap();

    let result = workflow
        .run(BatchContractEvent { file_ids: vec![] })
        .result()
        .await
        .unwrap();

    assert_eq!(result, json!({"contracts": [], "total": 0}));
    assert_eq!(harness.cloud.downloads(), 0);
}

#[tokio::test]
async fn test_batch_with_missing_file_fails_instead_of_hanging() {
    let harness = batch_harness();
    let workflow = batch_index_workflow(&harness.services, &harness.config).unwrap();

    let err = workflow
        .run(BatchContractEvent {
            file_ids: vec!["a".into(), "ghost".into()],
        })
        .result()
        .await
        .unwrap_err();

    match err {
        HeddleError::StepFailed { step, source } => {
            assert_eq!(step, "download_batch_contract");
            assert!(matches!(*source, HeddleError::Service(_)));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_metadata_workflow_reports_schema_and_names() {
    let harness = batch_harness();
    let workflow = metadata_workflow(&harness.services, &harness.config).unwrap();

    let result = workflow.run(StartEvent).result().await.unwrap();

    assert_eq!(result["extracted_data_collection"], json!("invoices"));
    assert_eq!(result["contracts_pipeline_id"], json!("contracts-index-1"));
    assert_eq!(result["json_schema"]["title"], json!("InvoiceWithReconciliation"));
    assert!(result["json_schema"]["properties"]["match_rationale"].is_object());
}
