use std::fmt;

use thiserror::Error;

/// Why a raw listing was dropped by the normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationReject {
    #[error("price in foreign currency: {0}")]
    ForeignCurrency(String),
    #[error("price not published: {0}")]
    PriceUnavailable(String),
    #[error("unparsable price: {0:?}")]
    UnparsablePrice(String),
    #[error("empty location")]
    EmptyLocation,
}

/// A listing entry lacked a field under every selector tried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no match for field `{field}`")]
pub struct ExtractionGap {
    pub field: &'static str,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("malformed record on line {line}: {message}")]
    Json { line: usize, message: String },
    #[error("blob `{0}` not found")]
    MissingBlob(String),
    #[error("table `{0}` does not exist")]
    MissingTable(String),
    #[error("schema drift on `{table}`: {detail}")]
    SchemaDrift { table: String, detail: String },
}

/// Controller states, in the order a run walks through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Fetched,
    Extracted,
    Normalized,
    Materialized,
    Loaded,
    Aggregated,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Fetched => "fetch",
            Stage::Extracted => "extract",
            Stage::Normalized => "normalize",
            Stage::Materialized => "materialize",
            Stage::Loaded => "load",
            Stage::Aggregated => "aggregate",
        };
        f.write_str(name)
    }
}

/// Terminal failure of a run: FAILED(stage).
#[derive(Debug, Error)]
#[error("run {run_id} failed at {stage}: {source}")]
pub struct PipelineError {
    pub run_id: String,
    pub stage: Stage,
    #[source]
    pub source: anyhow::Error,
}
