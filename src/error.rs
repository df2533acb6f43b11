use thiserror::Error;

/// Everything a single pipeline step can fail with.
///
/// Steps never unwind the whole run: the orchestrator turns an `EtlError`
/// into a failed step result and keeps going with independent steps.
#[derive(Error, Debug)]
pub enum EtlError {
    #[error("cannot read source {path}: {reason}")]
    SourceRead { path: String, reason: String },

    #[error("{relation}.{column} row {row}: cannot normalize {value:?}: {reason}")]
    Normalization {
        relation: String,
        column: String,
        row: u64,
        value: String,
        reason: String,
    },

    /// A bulk-insert chunk was rejected; `offset` is the 0-based index of
    /// its first row in the stream.
    #[error("{relation} chunk {chunk} (rows from {offset}): {source}")]
    Chunk {
        relation: String,
        chunk: usize,
        offset: u64,
        #[source]
        source: Box<EtlError>,
    },

    #[error("relation {relation} exists with an incompatible definition: {detail}")]
    SchemaConflict { relation: String, detail: String },

    #[error("relational store unreachable: {0}")]
    Connectivity(String),

    #[error("{relation} skipped: prerequisite {dependency} failed")]
    DependencyFailed { relation: String, dependency: String },

    #[error("relation {0} does not exist")]
    MissingRelation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("store operation failed: {0}")]
    Store(#[from] duckdb::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("download failed: {0}")]
    Fetch(String),
}

impl EtlError {
    /// Short name of the error class, used in step reports.
    pub fn kind(&self) -> &'static str {
        match self {
            EtlError::SourceRead { .. } => "SourceReadError",
            EtlError::Normalization { .. } => "NormalizationError",
            EtlError::Chunk { source, .. } => source.kind(),
            EtlError::SchemaConflict { .. } => "SchemaConflictError",
            EtlError::Connectivity(_) => "ConnectivityError",
            EtlError::DependencyFailed { .. } => "DependencyFailedError",
            EtlError::MissingRelation(_) => "MissingRelationError",
            EtlError::Config(_) => "ConfigError",
            EtlError::Store(_) => "StoreError",
            EtlError::Io(_) => "IoError",
            EtlError::Fetch(_) => "FetchError",
        }
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;
