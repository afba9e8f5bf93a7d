/// Errors produced by the OCI distribution layer.
#[derive(Debug, thiserror::Error)]
pub enum OciError {
    #[error("registry error: {0}")]
    Registry(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("layer error: {0}")]
    Layer(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    /// The registry rejected our credentials (401 after the token flow).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The registry refused access to an existing resource (403).
    #[error("access denied: {0}")]
    Denied(String),
}

impl OciError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, OciError::NotFound(_))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, OciError::Unauthorized(_))
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, OciError::Denied(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OciError>;
