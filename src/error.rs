//! Error types shared across the tracing pipeline.
//!
//! Failures inside the pipeline never surface to request-handling code; at
//! worst telemetry is incomplete. The variants here are returned only from
//! the explicit lifecycle entry points (`init`, `shutdown`, `force_flush`)
//! and from exporter internals.

use std::sync::PoisonError;
use std::time::Duration;
use thiserror::Error;

/// Describe the result of operations in the tracing pipeline.
pub type TraceResult<T> = Result<T, TraceError>;

/// Errors returned by the tracing pipeline.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TraceError {
    /// The exporter connection could not be established at startup.
    ///
    /// Tracing is assumed required, so callers should treat this as fatal
    /// and abort startup.
    #[error("exporter initialization failed: {0}")]
    Initialization(String),

    /// Flush or close failed during provider teardown.
    #[error("shutdown failed: {0}")]
    Shutdown(String),

    /// Flush or shutdown did not complete within the deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Shutdown was already performed on this provider or processor.
    #[error("already shut down")]
    AlreadyShutdown,

    /// A batch of finished spans could not be delivered to the sink.
    #[error("span export failed: {0}")]
    Export(String),

    /// Other failures not covered by the variants above.
    #[error("{0}")]
    Other(String),
}

impl<T> From<PoisonError<T>> for TraceError {
    fn from(err: PoisonError<T>) -> Self {
        TraceError::Other(err.to_string())
    }
}
