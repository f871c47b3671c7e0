//! Error types for the prober.
//!
//! [`ScanError`] covers the fatal cases: bad configuration, an unopenable
//! diagnostic sink, and input/output stream failures. Everything that goes
//! wrong while probing a single host is *not* an error at this level: it is
//! recorded as a tri-state in the host's capability record and, at most,
//! reported through the diagnostic sink as a [`StageError`] message.

use std::io;

use thiserror::Error;

/// Fatal errors that abort a scan run.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Worker count must be a positive number.
    #[error("worker count must be a positive number (got {0})")]
    InvalidWorkerCount(i64),

    /// The diagnostic sink destination could not be opened.
    #[error("failed to create log file {path}: {source}")]
    DiagSink {
        /// Destination path as given on the command line.
        path: String,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Reading the host-name input stream failed.
    ///
    /// Surfaced only after already-dispatched hosts have been probed and
    /// written out.
    #[error("error reading input: {0}")]
    Input(io::Error),

    /// Writing the record output stream failed.
    #[error("error writing output: {0}")]
    Output(io::Error),
}

/// Result alias for scan-level operations.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// A single probe-stage failure, carried through the network seam.
///
/// Consumed into a tri-state plus a diagnostic message; never propagated as
/// a process-level error.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct StageError(pub String);

impl StageError {
    /// Wrap a failure message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
