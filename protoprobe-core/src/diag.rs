//! Diagnostic sink: free-form per-host failure messages.
//!
//! All workers share one sink. Access is serialized through a dedicated
//! writer task fed by a channel, so a diagnostic line is always written as
//! one unit and concurrent workers can never interleave partial messages.
//! Distinct from ambient `log` output: the sink is a user-facing feature
//! (the `--log` flag), not instrumentation.

use std::fmt;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Cheap cloneable handle for emitting diagnostic messages.
///
/// A disabled handle discards everything, so probe code can emit
/// unconditionally.
#[derive(Debug, Clone)]
pub struct DiagHandle {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl DiagHandle {
    /// Handle that discards every message.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Whether messages actually go anywhere.
    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue one diagnostic line, tagged with the host it concerns.
    pub fn emit(&self, host: &str, message: impl fmt::Display) {
        if let Some(tx) = &self.tx {
            // Send fails only once the writer task is gone; nothing to do then.
            let _ = tx.send(format!("{host}: {message}\n"));
        }
    }
}

/// Spawn the dedicated writer task serializing diagnostic lines to `sink`.
///
/// Returns the handle and the writer's join handle. The task drains the
/// channel, exits once every handle clone has been dropped, and flushes the
/// sink on the way out. Await the join handle before process exit to
/// guarantee nothing is lost.
pub fn spawn_diag_writer<W>(sink: W) -> (DiagHandle, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let task = tokio::spawn(async move {
        let mut sink = sink;
        while let Some(line) = rx.recv().await {
            if let Err(e) = sink.write_all(line.as_bytes()).await {
                log::warn!("diagnostic sink write failed, discarding further messages: {e}");
                break;
            }
        }
        if let Err(e) = sink.flush().await {
            log::warn!("diagnostic sink flush failed: {e}");
        }
    });
    (DiagHandle { tx: Some(tx) }, task)
}
