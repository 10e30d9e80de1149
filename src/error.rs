// =============================================================================
// Error taxonomy
// =============================================================================
//
// Fallible setup and I/O (config load, storage open, provider HTTP calls) use
// `anyhow::Result` with `.context()` chains for causal, human-readable
// failures. The two taxonomies below sit on top of that for call sites that
// need to match on *kind* rather than parse an error string: `WriteOutcome`
// at the Storage write boundary (replacing the source's exception-driven
// "locked database" control flow), and `ProviderError` at the Data Provider /
// Broker Connector boundary, mirroring the kinds in the error handling table.

use thiserror::Error;

/// Result of a Storage write attempt. `Retryable` carries the short-retry
/// cases (lock contention); `Fatal` carries corruption/integrity failures
/// that must halt the write path and surface to the health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Ok,
    Retryable(String),
    Fatal(String),
}

impl WriteOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Error kinds at the Data Provider / Broker Connector boundary, per the
/// error handling table: transient I/O is retried by the caller, bad input
/// is substituted with a safe default and logged once, protocol violations
/// are dropped, duplicates are accepted idempotently, unrecoverable errors
/// halt the write path, and programmer errors are logged without crashing
/// the owning loop.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transient I/O error: {0}")]
    Transient(String),

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("unrecoverable: {0}")]
    Unrecoverable(String),
}

impl ProviderError {
    /// True for the kinds a caller may retry; false for kinds that should be
    /// logged and dropped immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
