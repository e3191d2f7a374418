use std::sync::PoisonError;
use thiserror::Error;
use tokio::task::JoinError;

/// Failures of an online store backend.
#[derive(Debug, Error)]
pub enum StoreError {

    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Poison error: {0}")]
    Poisoned(String),

    #[error("Store error: {0}")]
    Custom(String),
}

impl StoreError {
    /// Whether repeating the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::RedbTransaction(_) | StoreError::RedbStorage(_) | StoreError::RedbCommit(_) | StoreError::Io(_)
        )
    }
}

impl<T> From<PoisonError<T>> for StoreError {
    fn from(e: PoisonError<T>) -> Self {
        StoreError::Poisoned(e.to_string())
    }
}

/// Failure of one on-demand feature view. Scoped to the feature references of that view,
/// the rest of a retrieval still resolves.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OdfvError {
    #[error("on demand feature view '{odfv}' is missing input column '{column}'")]
    MissingFeature { odfv: String, column: String },

    #[error("on demand feature view '{odfv}' output does not match its schema: {reason}")]
    SchemaValidation { odfv: String, reason: String },

    #[error("transform of on demand feature view '{odfv}' failed: {message}")]
    TransformExecution { odfv: String, message: String },
}

impl OdfvError {
    pub fn odfv(&self) -> &str {
        match self {
            OdfvError::MissingFeature { odfv, .. } => odfv,
            OdfvError::SchemaValidation { odfv, .. } => odfv,
            OdfvError::TransformExecution { odfv, .. } => odfv,
        }
    }
}

/// Misuse of a columnar [`crate::batch::Batch`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("column '{0}' not found")]
    ColumnNotFound(String),

    #[error("column '{0}' already exists")]
    DuplicateColumn(String),

    #[error("column '{name}' has {actual} values, expected {expected}")]
    LengthMismatch { name: String, expected: usize, actual: usize },
}

/// Request level failures; any of these aborts the whole call.
#[derive(Debug, Error)]
pub enum FeatureStoreError {

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("invalid feature reference '{0}'")]
    InvalidFeatureRef(String),

    #[error("entity row {row} is missing join key '{join_key}' required by '{view}'")]
    MissingEntityKey { view: String, join_key: String, row: usize },

    #[error("join key '{join_key}' has value {value} that is not a valid {expected}")]
    InvalidEntityValue { join_key: String, value: String, expected: String },

    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("push to '{push_source}' rejected: {reason}")]
    PushValidation { push_source: String, reason: String },

    #[error("Store: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Odfv(#[from] OdfvError),

    #[error("Batch: {0}")]
    Batch(#[from] BatchError),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Join: {0}")]
    Join(#[from] JoinError),
}

impl FeatureStoreError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        FeatureStoreError::NotFound { kind, name: name.into() }
    }

    pub fn push(push_source: &str, reason: impl Into<String>) -> Self {
        FeatureStoreError::PushValidation { push_source: push_source.to_string(), reason: reason.into() }
    }
}
