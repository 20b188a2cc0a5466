//! Error types for the refseal engine
//!
//! Every rejection names the rule or threshold that failed so callers can
//! audit the outcome.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed rule or document: threshold above principal count,
    /// duplicate rule name, missing signer, bad pattern.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A signature threshold was not met on apply, or the trust anchor
    /// itself failed its own threshold check.
    #[error("trust threshold unmet: {0}")]
    Trust(String),

    /// Hash-chain mismatch or missing predecessor entry. Fatal: never
    /// auto-repaired, verification refuses to proceed past it.
    #[error("log integrity violated: {0}")]
    Integrity(String),

    /// A draft was applied against a superseded base version. The caller
    /// must re-stage on the current document.
    #[error("stale draft: {0}")]
    Conflict(String),

    /// Timeout or transient I/O on an external capability. Safe to retry;
    /// no partial state was left behind.
    #[error("retryable failure: {0}")]
    Retryable(String),

    #[error("cryptographic error: {0}")]
    Crypto(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Machine-readable kind tag, reported on stderr by the CLI layer.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Trust(_) => "trust",
            Error::Integrity(_) => "integrity",
            Error::Conflict(_) => "conflict",
            Error::Retryable(_) => "retryable",
            Error::Crypto(_) => "crypto",
            Error::NotFound(_) => "not-found",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
        }
    }
}
