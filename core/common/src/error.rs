//! Error taxonomy for Sentinel.

use thiserror::Error;

/// Top-level error type shared by the vault and the orchestrator.
///
/// The vault deliberately collapses crypto and I/O failures into the opaque
/// `Auth`, `CorruptMetadata` and `CorruptValue` variants at its API boundary
/// so that callers cannot distinguish which internal step failed. Details are
/// logged internally instead.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration file or label violation.
    #[error("configuration error: {0}")]
    Config(String),

    /// Unlock or passphrase verification failure.
    ///
    /// Always rendered with the same message, regardless of cause.
    #[error("failed to verify passphrase")]
    Auth,

    /// Item metadata failed its HMAC check or named a different item.
    #[error("corrupt metadata: {0}")]
    CorruptMetadata(String),

    /// Item value failed to decrypt or did not match its checksum.
    #[error("corrupt value for item {0}")]
    CorruptValue(String),

    /// An operation other than unlock was attempted on a locked vault.
    #[error("vault is locked")]
    Locked,

    /// Unknown item id or absent record.
    #[error("not found: {0}")]
    NotFound(String),

    /// A pinned item was accessed by a different peer.
    #[error("client credentials mismatch")]
    PeerMismatch,

    /// A subprocess or container-engine call ended unsuccessfully.
    #[error("{0}")]
    Subprocess(String),

    /// Cooperative cancellation; never reported as a failure.
    #[error("operation cancelled")]
    Cancelled,

    /// Internal cryptographic failure.
    ///
    /// Never crosses the vault API boundary; the vault maps it to `Auth`,
    /// `CorruptMetadata` or `CorruptValue` before surfacing.
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Input was syntactically valid but semantically unsupported.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Opaque operation failure; detail is logged, never surfaced.
    #[error("{0}")]
    Internal(String),

    /// I/O failure outside the vault boundary.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Serialization(value.to_string())
    }
}

/// Result type alias using the common error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_is_opaque() {
        assert_eq!(Error::Auth.to_string(), "failed to verify passphrase");
    }

    #[test]
    fn test_io_error_converts() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, Error::Io(_)));
    }
}
