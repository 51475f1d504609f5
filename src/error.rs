//! Error types for PanelSync
//!
//! This module defines error types using thiserror for ergonomic error handling.
//! Errors are categorized by how the download pipeline reacts to them rather than
//! by where they were raised.
//!
//! ## Error Taxonomy
//!
//! ### Network (from the page fetcher and the content extractor)
//! - Timeouts, connection drops, 5xx and 429 responses → `TransientNetwork`
//! - 404/410 and other permanent client errors → `PermanentContent`
//! - Page list resolution failures → `Extraction` (transient unless marked permanent)
//!
//! ### Local storage (from the image cache, the key-value store, the queue snapshot)
//! - Disk write/delete failures → `Storage`
//! - Database driver failures → `SqlxError` (via `#[from]`)
//!
//! ### Integrity (from the download validator)
//! - Failed integrity checks → `Validation` (surfaced as a recommendation by callers)
//!
//! ### Caller mistakes
//! - Malformed identifiers or URLs → `InvalidInput`
//! - Operation not valid for the current job state → `InvalidState`

use thiserror::Error;

/// Result type alias using our PanelSyncError type
pub type Result<T> = std::result::Result<T, PanelSyncError>;

/// Main error type for PanelSync
#[derive(Error, Debug)]
pub enum PanelSyncError {
    // ===== Network Errors =====

    /// Retryable network failure (timeout, connection reset, 5xx, rate limiting)
    #[error("Network error: {message}")]
    TransientNetwork {
        message: String,
        /// HTTP status code if the server answered
        status_code: Option<u16>,
    },

    /// Content is missing or invalid and retrying will not help
    #[error("Content unavailable: {message}")]
    PermanentContent {
        message: String,
        /// HTTP status code if the server answered
        status_code: Option<u16>,
    },

    /// The content extractor could not produce a page list
    #[error("Page extraction failed: {message}")]
    Extraction {
        message: String,
        /// Extractor explicitly classified the failure as permanent
        permanent: bool,
    },

    // ===== Storage Errors =====

    /// Local disk or key-value store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database record not found
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    // ===== Validation Errors =====

    /// Chapter integrity check failed
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Generic input validation error
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ===== Configuration/State Errors =====

    /// Operation not valid for the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration file error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    // ===== General Errors =====

    /// Operation was cancelled by user or system
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation timed out
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    // ===== External Library Errors =====

    /// HTTP client error from reqwest
    #[error("HTTP client error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    /// Database driver error from sqlx
    #[error("Database error: {0}")]
    SqlxError(#[from] sqlx::Error),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<url::ParseError> for PanelSyncError {
    fn from(err: url::ParseError) -> Self {
        PanelSyncError::InvalidInput(format!("Invalid URL: {}", err))
    }
}

// Helper methods for creating common errors
impl PanelSyncError {
    /// Create a TransientNetwork error
    pub fn transient<S: Into<String>>(message: S, status_code: Option<u16>) -> Self {
        PanelSyncError::TransientNetwork {
            message: message.into(),
            status_code,
        }
    }

    /// Create a PermanentContent error
    pub fn permanent<S: Into<String>>(message: S, status_code: Option<u16>) -> Self {
        PanelSyncError::PermanentContent {
            message: message.into(),
            status_code,
        }
    }

    /// Create an Extraction error
    pub fn extraction<S: Into<String>>(message: S, permanent: bool) -> Self {
        PanelSyncError::Extraction {
            message: message.into(),
            permanent,
        }
    }

    /// Create a Storage error with a message
    pub fn storage<S: Into<String>>(message: S) -> Self {
        PanelSyncError::Storage(message.into())
    }

    /// Create an InvalidInput error with a message
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        PanelSyncError::InvalidInput(message.into())
    }

    /// Create a RecordNotFound error with a resource name
    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        PanelSyncError::RecordNotFound(resource.into())
    }

    /// Classify an HTTP status code returned for a content request
    ///
    /// 5xx, 408 and 429 are transient; every other non-success code is permanent.
    pub fn from_status(status_code: u16, url: &str) -> Self {
        let message = format!("HTTP {} for {}", status_code, url);
        match status_code {
            408 | 429 | 500..=599 => Self::transient(message, Some(status_code)),
            _ => Self::permanent(message, Some(status_code)),
        }
    }

    /// Check if error is retryable
    ///
    /// Returns `true` for transient errors that might succeed on retry:
    /// - Transient network errors
    /// - Timeouts
    /// - Extraction failures not explicitly marked permanent
    /// - reqwest timeouts, connection failures and 5xx responses
    pub fn is_retryable(&self) -> bool {
        match self {
            PanelSyncError::TransientNetwork { .. } | PanelSyncError::Timeout(_) => true,
            PanelSyncError::Extraction { permanent, .. } => !permanent,
            PanelSyncError::ReqwestError(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Check if error is related to local disk or database operations
    pub fn is_storage_error(&self) -> bool {
        matches!(
            self,
            PanelSyncError::Storage(_)
                | PanelSyncError::SqlxError(_)
                | PanelSyncError::IoError(_)
        )
    }

    /// Get user-friendly error message suitable for display
    pub fn user_message(&self) -> String {
        match self {
            PanelSyncError::TransientNetwork { .. } | PanelSyncError::Timeout(_) => {
                "The connection was interrupted. The download will be retried.".to_string()
            }
            PanelSyncError::PermanentContent { .. } => {
                "This chapter is no longer available from the source.".to_string()
            }
            PanelSyncError::Extraction { permanent: true, .. } => {
                "The chapter pages could not be read from the source.".to_string()
            }
            PanelSyncError::Storage(_) | PanelSyncError::IoError(_) => {
                "Could not save pages to device storage. Check available space.".to_string()
            }
            _ => self.to_string(),
        }
    }
}
