use thiserror::Error;

/// Wharf error types
#[derive(Error, Debug)]
pub enum PullError {
    /// Image reference string could not be parsed
    #[error("Malformed image reference '{reference}': {message}")]
    MalformedReference { reference: String, message: String },

    /// Digest string is not a valid `<algorithm>:<hex>` pair
    #[error("Malformed digest '{digest}': {message}")]
    MalformedDigest { digest: String, message: String },

    /// Token service or basic authentication rejected the credentials
    #[error("Authentication failed: {registry} - {message}")]
    AuthFailed { registry: String, message: String },

    /// A 401 was received after the single allowed re-authentication
    #[error("Authorization expired: {registry} - re-authentication already attempted")]
    AuthExpired { registry: String },

    /// Registry returned 404 for the requested manifest
    #[error("Manifest not found: {reference}")]
    ManifestNotFound { reference: String },

    /// Registry answered with a manifest media type we did not ask for
    #[error("Unsupported manifest media type '{media_type}' for {reference}")]
    UnsupportedMediaType {
        reference: String,
        media_type: String,
    },

    /// Manifest list has no entry for the requested platform
    #[error("No matching platform {os}/{architecture} in manifest list for {reference}")]
    NoMatchingPlatform {
        reference: String,
        os: String,
        architecture: String,
    },

    /// Downloaded content does not hash to the requested digest
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Network failure that survived the retry policy
    #[error("Network error: {0}")]
    Network(String),

    /// Tarball assembly failed
    #[error("Pack failed: {0}")]
    PackFailed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for PullError {
    fn from(err: serde_json::Error) -> Self {
        PullError::Serialization(err.to_string())
    }
}

/// Result type alias for wharf operations
pub type Result<T> = std::result::Result<T, PullError>;
