//! Pipeline configuration.
//!
//! Loaded from the process environment (after reading a `.env` file, if
//! present). Every setting has a default, so an empty environment yields
//! a working configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{HeddleError, Result};

const PREFIX: &str = "HEDDLE_";

/// How thoroughly the extraction service should work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMode {
    /// Cheapest, least accurate.
    Fast,
    /// Middle ground.
    Balanced,
    /// Most accurate; required for reasoning.
    Premium,
}

impl FromStr for ExtractionMode {
    type Err = HeddleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "balanced" => Ok(Self::Balanced),
            "premium" => Ok(Self::Premium),
            other => Err(HeddleError::Config(format!(
                "unknown extraction mode: {other}"
            ))),
        }
    }
}

/// Options forwarded to the extraction service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionSettings {
    /// Name of the extraction agent the service should run.
    pub agent_name: String,
    /// Extraction mode.
    pub mode: ExtractionMode,
    /// Optional system prompt override.
    pub system_prompt: Option<String>,
    /// Ask the service to reason before answering (premium only).
    pub use_reasoning: bool,
    /// Ask the service to cite source spans.
    pub cite_sources: bool,
    /// Ask for per-field confidence scores.
    pub confidence_scores: bool,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            agent_name: "invoice-reconciliation".to_string(),
            mode: ExtractionMode::Premium,
            system_prompt: None,
            use_reasoning: false,
            cite_sources: false,
            confidence_scores: true,
        }
    }
}

/// Settings shared by the invoice pipelines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Collection that stores extracted records.
    pub extracted_data_collection: String,
    /// How many contracts to retrieve per invoice.
    pub retrieval_top_k: usize,
    /// How many characters of each contract go into the match prompt.
    pub contract_snippet_chars: usize,
    /// Where downloaded files are written.
    pub scratch_dir: PathBuf,
    /// Deadline for a single run, if any.
    #[serde(with = "optional_secs")]
    pub run_timeout: Option<Duration>,
    /// Worker-pool size of the batch download and index steps.
    pub batch_workers: usize,
    /// Extraction service options.
    pub extraction: ExtractionSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            extracted_data_collection: "invoices".to_string(),
            retrieval_top_k: 3,
            contract_snippet_chars: 1000,
            scratch_dir: std::env::temp_dir(),
            run_timeout: None,
            batch_workers: 4,
            extraction: ExtractionSettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Loads `.env` (if any) and reads `HEDDLE_*` variables.
    ///
    /// # Errors
    ///
    /// Returns [`HeddleError::Config`] if a variable is set but cannot be
    /// parsed.
    pub fn from_env() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => debug!(path = %path.display(), "loaded .env"),
            Err(e) if e.not_found() => {}
            Err(e) => return Err(HeddleError::Config(format!("failed to read .env: {e}"))),
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    ///
    /// Keys are the full variable names, e.g. `HEDDLE_RETRIEVAL_TOP_K`.
    ///
    /// # Errors
    ///
    /// Returns [`HeddleError::Config`] if a variable is set but cannot be
    /// parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let run_timeout = parse::<u64>(get("RUN_TIMEOUT_SECS"), "RUN_TIMEOUT_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let batch_workers =
            parse::<usize>(get("BATCH_WORKERS"), "BATCH_WORKERS")?.unwrap_or(defaults.batch_workers);
        if batch_workers == 0 {
            return Err(HeddleError::Config(
                "HEDDLE_BATCH_WORKERS must be at least 1".to_string(),
            ));
        }

        let extraction = ExtractionSettings {
            agent_name: get("EXTRACTION_AGENT_NAME")
                .or_else(|| get("DEPLOYMENT_NAME"))
                .unwrap_or(defaults.extraction.agent_name),
            mode: parse(get("EXTRACTION_MODE"), "EXTRACTION_MODE")?
                .unwrap_or(defaults.extraction.mode),
            system_prompt: get("EXTRACTION_SYSTEM_PROMPT"),
            use_reasoning: parse_flag(get("EXTRACTION_USE_REASONING"), "EXTRACTION_USE_REASONING")?
                .unwrap_or(defaults.extraction.use_reasoning),
            cite_sources: parse_flag(get("EXTRACTION_CITE_SOURCES"), "EXTRACTION_CITE_SOURCES")?
                .unwrap_or(defaults.extraction.cite_sources),
            confidence_scores: parse_flag(
                get("EXTRACTION_CONFIDENCE_SCORES"),
                "EXTRACTION_CONFIDENCE_SCORES",
            )?
            .unwrap_or(defaults.extraction.confidence_scores),
        };

        Ok(Self {
            extracted_data_collection: get("EXTRACTED_DATA_COLLECTION")
                .unwrap_or(defaults.extracted_data_collection),
            retrieval_top_k: parse(get("RETRIEVAL_TOP_K"), "RETRIEVAL_TOP_K")?
                .unwrap_or(defaults.retrieval_top_k),
            contract_snippet_chars: parse(get("CONTRACT_SNIPPET_CHARS"), "CONTRACT_SNIPPET_CHARS")?
                .unwrap_or(defaults.contract_snippet_chars),
            scratch_dir: get("SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_dir),
            run_timeout,
            batch_workers,
            extraction,
        })
    }
}

fn parse<T>(raw: Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(|value| {
        value
            .parse::<T>()
            .map_err(|e| HeddleError::Config(format!("{PREFIX}{name}={value}: {e}")))
    })
    .transpose()
}

fn parse_flag(raw: Option<String>, name: &str) -> Result<Option<bool>> {
    raw.map(|value| match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(HeddleError::Config(format!(
            "{PREFIX}{name}={value}: expected a boolean"
        ))),
    })
    .transpose()
}

mod optional_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
