//! Concurrent network-capability prober.
//!
//! Given a stream of DNS host names, runs an escalating sequence of checks
//! per host (resolution, TCP reachability on port 443, TLS handshake with
//! ALPN, an HTTPS request, and requests over the alternate application
//! protocols the server negotiated, SPDY/3.1 and HTTP/2) and produces one
//! fixed-order capability record per host.
//!
//! The probing pipeline is a fixed-size worker pool fed by a dispatcher and
//! drained by a single collector; records are emitted in completion order,
//! not input order. Per-host probe failures are data (tri-states in the
//! record), never process errors.

mod config;
mod diag;
mod error;
mod net;
mod pipeline;
mod probe;
mod report;
mod spdy;

#[cfg(test)]
mod test_support;

pub use config::ScanConfig;
pub use diag::{spawn_diag_writer, DiagHandle};
pub use error::{ScanError, ScanResult, StageError};
pub use net::{AltOutcome, AltProtocol, NetProbe, TokioNetProbe};
pub use pipeline::run_scan;
pub use probe::probe_host;
pub use report::{HostReport, Tri};
pub use spdy::{ClientSession, SpdyError, SpdyResponse};
