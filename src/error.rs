//! Error types for imgbundle

use imgbundle_oci::OciError;
use thiserror::Error;

/// Result type alias using the imgbundle Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving or relocating bundles
#[derive(Error, Debug)]
pub enum Error {
    /// Registry, reference or manifest errors from the OCI layer
    #[error(transparent)]
    Oci(#[from] OciError),

    /// Invalid combination of inputs
    #[error("usage error: {0}")]
    Usage(String),

    /// A bundle was required but the image has no bundle label
    #[error("expected '{reference}' to be a bundle, but it is a plain image (use --image)")]
    NotABundle { reference: String },

    /// A plain image was required but the image is a bundle
    #[error("expected '{reference}' to be a plain image, but it is a bundle (use --bundle)")]
    ExpectedBundle { reference: String },

    /// Malformed BundleLock / ImagesLock / locations document
    #[error("lock file error: {0}")]
    Lock(String),

    /// The bundle layer does not contain `.imgpkg/images.yml`
    #[error("bundle '{bundle}' does not contain {path}")]
    MissingImagesLock { bundle: String, path: String },

    /// The destination reported a different digest than the one uploaded
    #[error("Expected imported image {image} to have digest {expected} but was {actual}")]
    DigestMismatch {
        image: String,
        expected: String,
        actual: String,
    },

    /// No signature/SBOM/attestation with the derived tag exists
    #[error("artifact not found: {image_ref}")]
    ArtifactNotFound { image_ref: String },

    /// The registry refused access while probing for an artifact
    #[error("access denied: {image_ref}")]
    AccessDenied { image_ref: String },

    /// An entry the archive index refers to is absent
    #[error("archive entry missing: {path}")]
    ArchiveEntryMissing { path: String },

    /// Archive content is truncated or does not match its digest
    #[error("archive corrupt: {0}")]
    ArchiveCorrupt(String),

    /// The operation failed on every attempt
    #[error("{source} (after {attempts} attempts)")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        source: Box<Error>,
    },

    /// Settings errors
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A spawned task panicked or was cancelled
    #[error("task error: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Task(e.to_string())
    }
}

impl Error {
    /// Whether repeating the failed operation could succeed.
    ///
    /// Transport failures and 5xx responses are retryable. Authentication
    /// failures, semantic registry answers (not found, denied) and local
    /// archive damage are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Oci(e) => matches!(
                e,
                OciError::Registry(_)
                    | OciError::Http(_)
                    | OciError::Io(_)
                    | OciError::DigestMismatch { .. }
            ),
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// The error underneath any retry wrapping.
    pub fn root(&self) -> &Error {
        match self {
            Error::RetriesExhausted { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Error::Oci(e) => e.is_not_found(),
            Error::ArtifactNotFound { .. } => true,
            _ => false,
        }
    }

    pub fn is_access_denied(&self) -> bool {
        match self.root() {
            Error::Oci(e) => e.is_denied() || e.is_unauthorized(),
            Error::AccessDenied { .. } => true,
            _ => false,
        }
    }
}
