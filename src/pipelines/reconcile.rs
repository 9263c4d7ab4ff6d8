//! Matching an invoice against retrieved contracts.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::invoice::{Discrepancy, InvoiceFields, InvoiceWithReconciliation, MatchConfidence};
use crate::services::{predict_as, PredictionTarget, RetrievedNode, Services};
use crate::{HeddleError, Result};

/// Query used when the invoice carries no identifying fields.
pub const DEFAULT_QUERY: &str = "contract agreement";

/// Rationale recorded when the index returns nothing.
pub const NO_CONTRACTS_RATIONALE: &str = "No contracts found in the system";

/// Prompt for the structured match. Placeholders are `{name}` variables.
pub const MATCH_PROMPT: &str = r#"You are analyzing an invoice to match it with the correct contract and identify any discrepancies.

Invoice Details:
- Vendor: {vendor_name}
- Invoice Number: {invoice_number}
- Invoice Date: {invoice_date}
- PO Number: {po_number}
- Payment Terms: {payment_terms}
- Total: {total}

Retrieved Contracts:
{contracts_text}

Task:
1. Determine if any of the retrieved contracts plausibly matches this invoice based on:
   - Vendor name matching or similarity
   - PO number or invoice number references
   - Date ranges or validity periods
   - Any other relevant identifiers

2. If a match is found, identify discrepancies between invoice and contract, focusing on:
   - Payment terms differences (CRITICAL)
   - Total amount mismatches if contract specifies amounts
   - Vendor name discrepancies
   - Any other obvious conflicts

3. Assess match confidence:
   - 'high': Clear match with strong vendor/PO/identifier alignment
   - 'medium': Probable match with some uncertainty
   - 'low': Weak match, possibly relevant but uncertain
   - 'none': No plausible match found

Provide your analysis in the specified format."#;

/// The model's verdict on which retrieved contract, if any, matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractMatchResult {
    /// Whether a plausible match was found.
    pub is_match: bool,
    /// Zero-based index into the retrieved contracts.
    #[serde(default)]
    pub matched_contract_index: Option<usize>,
    /// Confidence tier.
    pub match_confidence: MatchConfidence,
    /// Explanation of the verdict.
    pub match_rationale: String,
    /// Payment terms found in the matched contract.
    #[serde(default)]
    pub contract_payment_terms: Option<String>,
    /// Disagreements between invoice and contract.
    #[serde(default)]
    pub discrepancies: Vec<Discrepancy>,
}

impl ContractMatchResult {
    /// Prediction target describing this type to the model.
    pub fn target() -> PredictionTarget {
        PredictionTarget {
            name: "ContractMatchResult".to_string(),
            schema: json!({
                "title": "ContractMatchResult",
                "description": "Result of matching invoice to contract",
                "type": "object",
                "properties": {
                    "is_match": {"type": "boolean", "description": "Whether a plausible contract match was found"},
                    "matched_contract_index": {
                        "anyOf": [{"type": "integer", "minimum": 0}, {"type": "null"}],
                        "description": "Index (0-based) of the matched contract in the provided list, or null if no match"
                    },
                    "match_confidence": {
                        "type": "string",
                        "enum": ["high", "medium", "low", "none"],
                        "description": "Confidence level: 'high', 'medium', 'low', or 'none'"
                    },
                    "match_rationale": {"type": "string", "description": "Explanation of why this contract was or was not matched"},
                    "contract_payment_terms": {
                        "anyOf": [{"type": "string"}, {"type": "null"}],
                        "description": "Payment terms found in the matched contract"
                    },
                    "discrepancies": {
                        "type": "array",
                        "items": {"type": "object"},
                        "description": "List of discrepancies found between invoice and contract"
                    }
                },
                "required": ["is_match", "match_confidence", "match_rationale"]
            }),
        }
    }
}

/// Builds the retrieval query from vendor, PO and invoice number.
pub fn build_query(invoice: &InvoiceFields) -> String {
    let parts: Vec<String> = [
        ("vendor", &invoice.vendor_name),
        ("PO", &invoice.purchase_order_number),
        ("invoice", &invoice.invoice_number),
    ]
    .into_iter()
    .filter_map(|(label, value)| {
        value
            .as_deref()
            .filter(|v| !v.is_empty())
            .map(|v| format!("{label}: {v}"))
    })
    .collect();

    if parts.is_empty() {
        DEFAULT_QUERY.to_string()
    } else {
        parts.join(" ")
    }
}

/// Lists each retrieved contract with the first `snippet_chars`
/// characters of its text.
pub fn contracts_context(nodes: &[RetrievedNode], snippet_chars: usize) -> String {
    nodes
        .iter()
        .enumerate()
        .map(|(i, node)| {
            let snippet: String = node.text.chars().take(snippet_chars).collect();
            format!(
                "Contract {i} (File: {}):\n{snippet}",
                node.metadata_str("filename").unwrap_or("Unknown")
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Variables bound into [`MATCH_PROMPT`]; missing fields become `N/A`.
pub fn prompt_variables(invoice: &InvoiceFields, contracts_text: String) -> HashMap<String, String> {
    let text = |value: &Option<String>| value.clone().unwrap_or_else(|| "N/A".to_string());

    HashMap::from([
        ("vendor_name".to_string(), text(&invoice.vendor_name)),
        ("invoice_number".to_string(), text(&invoice.invoice_number)),
        ("invoice_date".to_string(), text(&invoice.invoice_date)),
        ("po_number".to_string(), text(&invoice.purchase_order_number)),
        ("payment_terms".to_string(), text(&invoice.payment_terms)),
        (
            "total".to_string(),
            invoice
                .total
                .map(|t| t.to_string())
                .unwrap_or_else(|| "N/A".to_string()),
        ),
        ("contracts_text".to_string(), contracts_text),
    ])
}

/// Substitutes `{name}` placeholders in `template`. Unknown placeholders
/// are left as they are.
pub fn render_prompt(template: &str, variables: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) if variables.contains_key(&after[..close]) => {
                out.push_str(&variables[&after[..close]]);
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Reconciles `invoice` against the contracts index.
///
/// Never fails: an empty index yields confidence `none`, and any
/// retrieval or prediction error yields confidence `error` with the error
/// in the rationale.
pub async fn reconcile(
    services: &Services,
    config: &PipelineConfig,
    invoice: &InvoiceFields,
) -> InvoiceWithReconciliation {
    match try_reconcile(services, config, invoice).await {
        Ok(reconciled) => {
            info!(confidence = ?reconciled.match_confidence, "reconciliation complete");
            reconciled
        }
        Err(e) => {
            warn!(error = %e, "reconciliation failed");
            InvoiceWithReconciliation::unmatched(
                invoice.clone(),
                MatchConfidence::Error,
                format!("Error during reconciliation: {e}"),
            )
        }
    }
}

async fn try_reconcile(
    services: &Services,
    config: &PipelineConfig,
    invoice: &InvoiceFields,
) -> Result<InvoiceWithReconciliation> {
    let query = build_query(invoice);
    let nodes = services
        .contracts
        .retrieve(&query, config.retrieval_top_k)
        .await?;

    if nodes.is_empty() {
        info!("no contracts found in index");
        return Ok(InvoiceWithReconciliation::unmatched(
            invoice.clone(),
            MatchConfidence::None,
            NO_CONTRACTS_RATIONALE,
        ));
    }

    let variables = prompt_variables(
        invoice,
        contracts_context(&nodes, config.contract_snippet_chars),
    );
    let verdict: ContractMatchResult = predict_as(
        services.predictor.as_ref(),
        &ContractMatchResult::target(),
        MATCH_PROMPT,
        &variables,
    )
    .await?;

    if !verdict.match_confidence.is_known() {
        warn!(confidence = %verdict.match_confidence, "model returned an unrecognised confidence tier");
    }

    let matched = match (verdict.is_match, verdict.matched_contract_index) {
        (true, Some(index)) => Some(nodes.get(index).ok_or_else(|| {
            HeddleError::Validation(format!(
                "matched contract index {index} is out of range for {} retrieved contracts",
                nodes.len()
            ))
        })?),
        _ => None,
    };

    Ok(InvoiceWithReconciliation {
        invoice: invoice.clone(),
        matched_contract_id: matched.and_then(|n| n.metadata_str("file_id").map(str::to_string)),
        matched_contract_name: matched.and_then(|n| n.metadata_str("filename").map(str::to_string)),
        match_confidence: Some(verdict.match_confidence),
        match_rationale: Some(verdict.match_rationale),
        discrepancies: Some(verdict.discrepancies),
    })
}
