#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },
    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: &'static str, name: String },
    #[error("illegal field name {field:?} in index {index}")]
    IllegalFieldName { index: String, field: String },
    #[error("limit of total fields [{limit}] in index [{index}] has been exceeded")]
    FieldLimitExceeded { index: String, limit: u64 },
    #[error("connection to {url} failed: {cause}")]
    Connection { url: String, cause: String },
    #[error("{operation} timed out")]
    Timeout { operation: String },
    #[error("search backend returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("{operation} failed after {attempts} attempt(s): {last_error}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last_error: Box<StoreError>,
    },
    #[cfg(feature = "sql")]
    #[error("SQL error: {0}")]
    SQL(#[from] libsql::Error),
    #[error("SQL value has an unexpected type")]
    SQLInvalidTypeError,
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid document: {0}")]
    InvalidDocument(String),
    #[error("failed to lock the store")]
    LockError,
    #[error("{0}")]
    Custom(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Http { status, .. } => *status == 404,
            Self::RetryExhausted { last_error, .. } => last_error.is_not_found(),
            _ => false,
        }
    }

    /// Whether retrying the same call may succeed. "Not found" never does.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } => true,
            // 429 = throttled, 502/503/504 = node restarting or overloaded
            Self::Http { status, .. } => matches!(*status, 429 | 502 | 503 | 504),
            _ => false,
        }
    }
}
