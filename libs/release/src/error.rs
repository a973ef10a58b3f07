//! Error types for manifests and release storage.

use thiserror::Error;

/// Result type for release store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Release store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The revision already exists, or is not the next revision in sequence.
    #[error("revision conflict for {namespace}/{name}: cannot create revision {revision} (latest is {latest:?})")]
    Conflict {
        name: String,
        namespace: String,
        revision: u32,
        latest: Option<u32>,
    },

    /// The requested record does not exist.
    #[error("release {namespace}/{name} revision {revision} not found")]
    NotFound {
        name: String,
        namespace: String,
        revision: u32,
    },

    /// An update attempted to change a field that is fixed at creation.
    #[error("release {namespace}/{name} revision {revision}: field '{field}' cannot be updated")]
    ImmutableField {
        name: String,
        namespace: String,
        revision: u32,
        field: &'static str,
    },

    /// The encoded record exceeds the backend's size limit.
    #[error("encoded release is {size} bytes, exceeding the {limit} byte limit")]
    RecordTooLarge { size: usize, limit: usize },

    /// Encoding or decoding a stored record failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// SQLite backend error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem backend error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The record or key is malformed.
    #[error("invalid record: {0}")]
    Invalid(String),
}

impl StoreError {
    /// Returns true if this error is a revision conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// Returns true if the record was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}

/// Errors produced while building a manifest set from rendered documents.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManifestError {
    /// A document is not valid YAML.
    #[error("{source_path}: invalid YAML document: {message}")]
    Parse {
        source_path: String,
        message: String,
    },

    /// A document parsed to something other than a mapping.
    #[error("{source_path}: document is not a mapping")]
    NotAnObject { source_path: String },

    /// A required identity field is missing or empty.
    #[error("{source_path}: missing required field '{field}'")]
    MissingField {
        source_path: String,
        field: &'static str,
    },

    /// A hook annotation could not be interpreted.
    #[error("{source_path}: invalid hook annotation '{annotation}': {value}")]
    InvalidHookAnnotation {
        source_path: String,
        annotation: &'static str,
        value: String,
    },

    /// Two documents share the same resource identity.
    #[error("{source_path}: duplicate resource {identity}")]
    Duplicate {
        source_path: String,
        identity: String,
    },
}
