use thiserror::Error;

/// Structural problems with an input table. Fatal for the stage that hits them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("no id column detected in {columns:?}")]
    NoIdColumn { columns: Vec<String> },

    #[error("column `{column}` appears more than once after name normalisation")]
    DuplicateColumn { column: String },
}

/// Failures surfaced by an [`crate::store::ObjectStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bucket `{0}` does not exist")]
    NoSuchBucket(String),

    #[error("object `{bucket}/{key}` not found")]
    NotFound { bucket: String, key: String },

    #[error("invalid object key `{0}`")]
    InvalidKey(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store internal error: {0}")]
    Internal(String),

    #[error("I/O error on `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound { .. } | StoreError::NoSuchBucket(_)
        )
    }
}

/// Problems building or running the stage graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("circular dependency: {cycle}")]
    CircularDependency { cycle: String },

    #[error("stage `{0}` registered twice")]
    DuplicateStage(String),

    #[error("stage `{stage}` depends on unknown stage `{dependency}`")]
    UnknownDependency { stage: String, dependency: String },
}

/// True when any error in the chain is a transient [`StoreError`].
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<StoreError>())
        .any(StoreError::is_transient)
}

/// True when any error in the chain is a missing bucket or object.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<StoreError>())
        .any(StoreError::is_not_found)
}
