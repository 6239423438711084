//! Error taxonomy for the ingestion pipeline.
//!
//! Per-candidate problems (`ProviderError`, `ValidationError`, `DuplicateError`,
//! `FetchError`) are classified into a [`Rejection`] and counted; only
//! [`PipelineError`] ends a run.

use thiserror::Error;

/// Failure reported by a source adapter. The coordinator only looks at `retriable`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{provider} request failed (status {}): {message}", status_label(.http_status))]
pub struct ProviderError {
    pub provider: String,
    pub http_status: Option<u16>,
    pub retriable: bool,
    pub message: String,
}

fn status_label(status: &Option<u16>) -> String {
    status.map_or_else(|| "none".to_string(), |s| s.to_string())
}

impl ProviderError {
    pub fn from_status(provider: &str, status: u16, message: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            http_status: Some(status),
            retriable: is_retriable_status(status),
            message: message.into(),
        }
    }

    pub fn transport(provider: &str, message: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            http_status: None,
            retriable: true,
            message: message.into(),
        }
    }

    /// Malformed payloads never get better on retry.
    pub fn malformed(provider: &str, message: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            http_status: None,
            retriable: false,
            message: message.into(),
        }
    }
}

/// 429 and server errors are worth another attempt; other statuses are not.
pub fn is_retriable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

/// Quality or format problem with a downloaded candidate.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("bytes do not decode as an image: {0}")]
    Undecodable(String),

    #[error("{width}x{height} is below the {min_width}x{min_height} floor")]
    BelowDimensionFloor {
        width: u32,
        height: u32,
        min_width: u32,
        min_height: u32,
    },

    #[error("aspect ratio {ratio:.2} exceeds {max:.2}")]
    AspectRatio { ratio: f64, max: f64 },
}

/// A classified outcome, not a failure: the catalog already holds this image.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DuplicateError {
    #[error("{provider}/{provider_native_id} is already cataloged")]
    AlreadyCataloged {
        provider: String,
        provider_native_id: String,
    },

    #[error("content hash {content_hash} is already cataloged")]
    ExactContent { content_hash: String },

    #[error("perceptual hash within distance {distance} of record {existing}")]
    NearDuplicate { existing: String, distance: u32 },
}

/// Catalog failures. `Busy` is transient; everything else is not.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("catalog unavailable: {0}")]
    Unavailable(String),

    #[error("catalog busy: {0}")]
    Busy(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("corrupt catalog row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("blob storage error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Busy(_))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StorageError::Busy(err.to_string())
            }
            Some(ErrorCode::ConstraintViolation) => StorageError::Constraint(err.to_string()),
            Some(ErrorCode::CannotOpen) | Some(ErrorCode::NotADatabase) => {
                StorageError::Unavailable(err.to_string())
            }
            _ => StorageError::Sqlite(err),
        }
    }
}

/// Failure to obtain the bytes of a candidate.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("download failed with status {status}")]
    Status { status: u16 },

    #[error("download failed: {0}")]
    Transport(String),

    #[error("download exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("download cancelled")]
    Cancelled,

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

impl FetchError {
    pub fn is_retriable(&self) -> bool {
        match self {
            FetchError::Status { status } => is_retriable_status(*status),
            FetchError::Transport(_) => true,
            _ => false,
        }
    }
}

/// How a single candidate left the pipeline without becoming a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    Quality(ValidationError),
    Duplicate(DuplicateError),
    Error(String),
}

impl From<FetchError> for Rejection {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Invalid(v) => Rejection::Quality(v),
            other => Rejection::Error(other.to_string()),
        }
    }
}

impl From<ValidationError> for Rejection {
    fn from(err: ValidationError) -> Self {
        Rejection::Quality(err)
    }
}

impl From<DuplicateError> for Rejection {
    fn from(err: DuplicateError) -> Self {
        Rejection::Duplicate(err)
    }
}

impl From<StorageError> for Rejection {
    fn from(err: StorageError) -> Self {
        Rejection::Error(err.to_string())
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::Quality(e) => write!(f, "quality: {}", e),
            Rejection::Duplicate(e) => write!(f, "duplicate: {}", e),
            Rejection::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// Run-level failures. Anything here ends the run in the `Failed` state.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("catalog unavailable at start: {0}")]
    CatalogUnavailable(#[source] StorageError),

    #[error("no providers configured for this run")]
    NoProviders,

    #[error("all providers unreachable ({failed_pages} page requests failed, none succeeded)")]
    AllProvidersUnreachable { failed_pages: u64 },

    #[error("pipeline worker failed: {0}")]
    Worker(String),
}
