//! Invoice data model: extracted fields, reconciliation results and the
//! record persisted at the end of a run.

use std::convert::Infallible;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::Result;

/// One line of an invoice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    /// Description of the line item.
    #[serde(default)]
    pub description: Option<String>,
    /// Quantity of the item.
    #[serde(default)]
    pub quantity: Option<f64>,
    /// Price per unit.
    #[serde(default)]
    pub unit_price: Option<f64>,
    /// Total price for this line.
    #[serde(default)]
    pub total: Option<f64>,
}

/// Fields extracted from an invoice document. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoiceFields {
    /// Invoice number or identifier.
    #[serde(default)]
    pub invoice_number: Option<String>,
    /// Invoice date, `YYYY-MM-DD` where possible.
    #[serde(default)]
    pub invoice_date: Option<String>,
    /// Vendor or supplier name.
    #[serde(default)]
    pub vendor_name: Option<String>,
    /// Vendor address.
    #[serde(default)]
    pub vendor_address: Option<String>,
    /// Purchase order number.
    #[serde(default)]
    pub purchase_order_number: Option<String>,
    /// Payment terms, e.g. `Net 30`.
    #[serde(default)]
    pub payment_terms: Option<String>,
    /// Line items.
    #[serde(default)]
    pub line_items: Option<Vec<LineItem>>,
    /// Subtotal before tax.
    #[serde(default)]
    pub subtotal: Option<f64>,
    /// Tax amount.
    #[serde(default)]
    pub tax: Option<f64>,
    /// Total amount due.
    #[serde(default)]
    pub total: Option<f64>,
}

/// A disagreement between an invoice and its contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    /// Field the discrepancy was found in.
    pub field: String,
    /// Value on the invoice.
    #[serde(default)]
    pub invoice_value: Option<String>,
    /// Value expected by the contract.
    #[serde(default)]
    pub contract_value: Option<String>,
    /// Severity, e.g. `high`.
    #[serde(default)]
    pub severity: Option<String>,
    /// Free-form note.
    #[serde(default)]
    pub note: Option<String>,
}

/// How confidently an invoice was matched to a contract.
///
/// The known tiers parse case-insensitively. Any other label the model
/// returns is kept verbatim as [`MatchConfidence::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MatchConfidence {
    /// Clear match on vendor, PO or other identifiers.
    High,
    /// Probable match.
    Medium,
    /// Weak match.
    Low,
    /// No plausible match.
    None,
    /// Reconciliation itself failed.
    Error,
    /// A tier outside the known set, as reported.
    Other(String),
}

impl MatchConfidence {
    /// The wire name: lowercase for known tiers, verbatim otherwise.
    pub fn as_str(&self) -> &str {
        match self {
            MatchConfidence::High => "high",
            MatchConfidence::Medium => "medium",
            MatchConfidence::Low => "low",
            MatchConfidence::None => "none",
            MatchConfidence::Error => "error",
            MatchConfidence::Other(label) => label,
        }
    }

    /// Returns true for one of the five known tiers.
    pub fn is_known(&self) -> bool {
        !matches!(self, MatchConfidence::Other(_))
    }
}

impl fmt::Display for MatchConfidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchConfidence {
    type Err = Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Infallible> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "high" => MatchConfidence::High,
            "medium" => MatchConfidence::Medium,
            "low" => MatchConfidence::Low,
            "none" => MatchConfidence::None,
            "error" => MatchConfidence::Error,
            _ => MatchConfidence::Other(s.trim().to_string()),
        })
    }
}

impl From<String> for MatchConfidence {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(confidence) => confidence,
            Err(never) => match never {},
        }
    }
}

impl From<MatchConfidence> for String {
    fn from(value: MatchConfidence) -> Self {
        match value {
            MatchConfidence::Other(label) => label,
            known => known.as_str().to_string(),
        }
    }
}

/// Invoice fields plus the outcome of contract reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceWithReconciliation {
    /// The extracted invoice.
    #[serde(flatten)]
    pub invoice: InvoiceFields,
    /// File id of the matched contract.
    #[serde(default)]
    pub matched_contract_id: Option<String>,
    /// File name of the matched contract.
    #[serde(default)]
    pub matched_contract_name: Option<String>,
    /// Match confidence tier.
    #[serde(default)]
    pub match_confidence: Option<MatchConfidence>,
    /// Why the contract was or was not matched.
    #[serde(default)]
    pub match_rationale: Option<String>,
    /// Disagreements between invoice and contract.
    #[serde(default)]
    pub discrepancies: Option<Vec<Discrepancy>>,
}

impl InvoiceWithReconciliation {
    /// An unmatched result carrying `confidence` and `rationale`.
    pub fn unmatched(
        invoice: InvoiceFields,
        confidence: MatchConfidence,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            invoice,
            matched_contract_id: None,
            matched_contract_name: None,
            match_confidence: Some(confidence),
            match_rationale: Some(rationale.into()),
            discrepancies: Some(Vec::new()),
        }
    }
}

/// Whether a record went through reconciliation or failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Valid extraction, reconciled against contracts.
    Reconciled,
    /// Extraction output did not match the schema; data is the raw payload.
    Invalid,
}

/// The document persisted for each processed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    /// Reconciled invoice, or the raw payload for invalid extractions.
    pub data: JsonValue,
    /// Source file id.
    pub file_id: String,
    /// Source file name.
    pub file_name: String,
    /// Hex SHA-256 of the source file's bytes.
    pub file_hash: String,
    /// Per-field confidence and citation metadata.
    #[serde(default)]
    pub field_metadata: JsonValue,
    /// Processing outcome.
    pub status: RecordStatus,
    /// Validation error for invalid records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_error: Option<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl ExtractedRecord {
    /// A record for a reconciled invoice.
    pub fn reconciled(
        data: &InvoiceWithReconciliation,
        file_id: impl Into<String>,
        file_name: impl Into<String>,
        file_hash: impl Into<String>,
        field_metadata: JsonValue,
    ) -> Result<Self> {
        Ok(Self {
            data: serde_json::to_value(data)?,
            file_id: file_id.into(),
            file_name: file_name.into(),
            file_hash: file_hash.into(),
            field_metadata,
            status: RecordStatus::Reconciled,
            validation_error: None,
            created_at: Utc::now(),
        })
    }

    /// A record for extraction output that failed validation.
    pub fn invalid(
        data: JsonValue,
        error: impl Into<String>,
        file_id: impl Into<String>,
        file_name: impl Into<String>,
        file_hash: impl Into<String>,
    ) -> Self {
        Self {
            data,
            file_id: file_id.into(),
            file_name: file_name.into(),
            file_hash: file_hash.into(),
            field_metadata: JsonValue::Null,
            status: RecordStatus::Invalid,
            validation_error: Some(error.into()),
            created_at: Utc::now(),
        }
    }
}

/// Hex SHA-256 digest of the file at `path`, read in chunks.
///
/// # Errors
///
/// Returns [`HeddleError::Io`](crate::HeddleError::Io) if the file cannot be read.
pub async fn content_hash(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

fn nullable(kind: &str, description: &str) -> JsonValue {
    json!({"anyOf": [{"type": kind}, {"type": "null"}], "default": null, "description": description})
}

/// JSON schema of [`InvoiceWithReconciliation`], with references inlined.
pub fn invoice_schema() -> JsonValue {
    let line_item = json!({
        "title": "LineItem",
        "type": "object",
        "properties": {
            "description": nullable("string", "Description of the line item"),
            "quantity": nullable("number", "Quantity of the item"),
            "unit_price": nullable("number", "Price per unit of the item"),
            "total": nullable("number", "Total price for this line item"),
        }
    });
    let discrepancy = json!({
        "title": "Discrepancy",
        "description": "Represents a single discrepancy between invoice and contract",
        "type": "object",
        "properties": {
            "field": {"type": "string", "description": "Field name where discrepancy was found"},
            "invoice_value": nullable("string", "Value from the invoice"),
            "contract_value": nullable("string", "Expected value from the contract"),
            "severity": nullable("string", "Severity of the discrepancy (e.g., 'high', 'medium', 'low')"),
            "note": nullable("string", "Additional notes about the discrepancy"),
        },
        "required": ["field"]
    });

    json!({
        "title": "InvoiceWithReconciliation",
        "description": "Invoice data with reconciliation information",
        "type": "object",
        "properties": {
            "invoice_number": nullable("string", "Invoice number or identifier"),
            "invoice_date": nullable("string", "Date of the invoice (YYYY-MM-DD format if possible)"),
            "vendor_name": nullable("string", "Name of the vendor or supplier"),
            "vendor_address": nullable("string", "Address of the vendor"),
            "purchase_order_number": nullable("string", "Purchase order (PO) number if present"),
            "payment_terms": nullable("string", "Payment terms (e.g., Net 30, Net 60, Due on receipt)"),
            "line_items": {
                "anyOf": [{"type": "array", "items": line_item}, {"type": "null"}],
                "default": null,
                "description": "List of line items on the invoice"
            },
            "subtotal": nullable("number", "Subtotal before tax and other charges"),
            "tax": nullable("number", "Tax amount"),
            "total": nullable("number", "Total amount due on the invoice"),
            "matched_contract_id": nullable("string", "ID of the matched contract file"),
            "matched_contract_name": nullable("string", "Name of the matched contract file"),
            "match_confidence": {
                "anyOf": [
                    {"type": "string", "enum": ["high", "medium", "low", "none", "error"]},
                    {"type": "null"}
                ],
                "default": null,
                "description": "Confidence level of the match"
            },
            "match_rationale": nullable("string", "Explanation of why this contract was matched"),
            "discrepancies": {
                "anyOf": [{"type": "array", "items": discrepancy}, {"type": "null"}],
                "default": null,
                "description": "List of discrepancies found between invoice and contract"
            },
        }
    })
}
