//! Scan configuration.

use crate::error::{ScanError, ScanResult};

/// Default number of concurrent probe workers.
pub const DEFAULT_WORKERS: usize = 10;

/// Configuration consumed by [`run_scan`](crate::run_scan).
///
/// Passed explicitly; the pipeline holds no process-wide state.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Number of concurrent probe workers. Must be at least 1.
    pub workers: usize,
    /// Emit a header line with the field names before the first record.
    pub fields_header: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            fields_header: false,
        }
    }
}

impl ScanConfig {
    /// Reject configurations that cannot run.
    pub fn validate(&self) -> ScanResult<()> {
        if self.workers == 0 {
            return Err(ScanError::InvalidWorkerCount(0));
        }
        Ok(())
    }
}
