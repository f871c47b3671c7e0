//! The concurrent probing pipeline.
//!
//! Dispatcher → work queue → worker pool → result queue → collector.
//!
//! The dispatcher turns each non-empty input line into a capability record
//! and closes the work queue at end of input. A fixed pool of workers pulls
//! records, runs the probe state machine, and forwards finished records.
//! Once the worker task group has fully drained, the last result sender is
//! dropped, so the collector observes end-of-stream exactly once and no
//! record can be lost or duplicated. Records are emitted in completion
//! order; input order is deliberately not preserved.

use std::io;
use std::sync::Arc;

use log::{trace, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use crate::config::ScanConfig;
use crate::diag::DiagHandle;
use crate::error::{ScanError, ScanResult};
use crate::net::NetProbe;
use crate::probe::probe_host;
use crate::report::HostReport;

/// Run the full pipeline: read host names from `input`, probe them with
/// `config.workers` concurrent workers, and write one record per host to
/// `output`. Returns the number of records written.
///
/// An input read error is surfaced only after every already-dispatched host
/// has been probed and written out. Probe failures are recorded in the
/// records themselves and never fail the run.
pub async fn run_scan<R, W>(
    net: Arc<dyn NetProbe>,
    input: R,
    output: W,
    diag: DiagHandle,
    config: &ScanConfig,
) -> ScanResult<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    config.validate()?;

    let (work_tx, work_rx) = mpsc::channel::<HostReport>(config.workers * 2);
    let (result_tx, result_rx) = mpsc::channel::<HostReport>(config.workers * 2);
    let work_rx = Arc::new(Mutex::new(work_rx));

    let collector = tokio::spawn(collect(result_rx, output, config.fields_header));

    let mut workers = JoinSet::new();
    for id in 0..config.workers {
        workers.spawn(worker_loop(
            id,
            Arc::clone(&net),
            Arc::clone(&work_rx),
            result_tx.clone(),
            diag.clone(),
        ));
    }
    // Workers hold the only remaining result senders.
    drop(result_tx);

    // Dispatch: one record per non-empty input line, in input order. On a
    // read error, stop dispatching but let everything in flight finish.
    let mut read_error: Option<io::Error> = None;
    let mut lines = input.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let name = line.trim();
                if name.is_empty() {
                    continue;
                }
                if work_tx.send(HostReport::new(name)).await.is_err() {
                    // Every worker is gone; nothing left to feed.
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                read_error = Some(e);
                break;
            }
        }
    }
    // Close the work queue so workers can drain and exit.
    drop(work_tx);

    // Completion coordination: wait for the whole task group. When the last
    // worker exits, its result sender drops and the collector sees the
    // stream close.
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            warn!("probe worker aborted: {e}");
        }
    }

    let written = collector
        .await
        .map_err(|e| ScanError::Output(io::Error::other(e)))?
        .map_err(ScanError::Output)?;

    match read_error {
        Some(e) => Err(ScanError::Input(e)),
        None => Ok(written),
    }
}

/// One worker: pull a record, probe it, forward it, until the work queue is
/// closed and drained.
async fn worker_loop(
    id: usize,
    net: Arc<dyn NetProbe>,
    work: Arc<Mutex<mpsc::Receiver<HostReport>>>,
    results: mpsc::Sender<HostReport>,
    diag: DiagHandle,
) {
    loop {
        // Hold the receiver lock only while pulling, never while probing.
        let next = { work.lock().await.recv().await };
        let Some(mut report) = next else { break };
        trace!("[worker {id}] probing {}", report.name);
        probe_host(net.as_ref(), &mut report, &diag).await;
        if results.send(report).await.is_err() {
            // Collector is gone; no point probing further.
            break;
        }
    }
    trace!("[worker {id}] work queue drained");
}

/// Serialize finished records to the output sink, with the optional header
/// line ahead of the first record.
async fn collect<W>(
    mut results: mpsc::Receiver<HostReport>,
    mut output: W,
    fields_header: bool,
) -> io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0usize;
    while let Some(report) = results.recv().await {
        if fields_header && written == 0 {
            output
                .write_all(format!("{}\n", HostReport::FIELDS).as_bytes())
                .await?;
        }
        output.write_all(format!("{report}\n").as_bytes()).await?;
        written += 1;
    }
    output.flush().await?;
    Ok(written)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeSet;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::{AsyncRead, AsyncReadExt, BufReader, ReadBuf};

    use super::*;
    use crate::test_support::{MockNet, Script};

    /// Run a scan over `input` and return `(result, output text)`.
    async fn scan(
        net: MockNet,
        input: &str,
        config: &ScanConfig,
    ) -> (ScanResult<usize>, String) {
        let (output, mut readback) = tokio::io::duplex(1 << 16);
        let reader = tokio::spawn(async move {
            let mut text = String::new();
            readback.read_to_string(&mut text).await.unwrap();
            text
        });
        let result = run_scan(
            Arc::new(net),
            input.as_bytes(),
            output,
            DiagHandle::disabled(),
            config,
        )
        .await;
        (result, reader.await.unwrap())
    }

    fn mixed_fleet() -> (MockNet, &'static str) {
        let mut net = MockNet::new();
        net.insert("a.example", Script::h2_host());
        net.insert("b.example", Script::unresolvable());
        net.insert("c.example", Script::port_closed());
        net.insert("d.example", Script::https_only());
        net.insert("e.example", Script::spdy_host());
        (net, "a.example\nb.example\nc.example\nd.example\ne.example\n")
    }

    #[tokio::test]
    async fn test_one_record_per_input_line() {
        let (net, input) = mixed_fleet();
        let (result, out) = scan(net, input, &ScanConfig::default()).await;
        assert_eq!(result.unwrap(), 5);
        assert_eq!(out.lines().count(), 5);
    }

    #[tokio::test]
    async fn test_empty_input_produces_no_output() {
        let config = ScanConfig {
            fields_header: true,
            ..ScanConfig::default()
        };
        let (result, out) = scan(MockNet::new(), "", &config).await;
        assert_eq!(result.unwrap(), 0);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_blank_lines_skipped() {
        let net = MockNet::single("a.example", Script::https_only());
        let (result, out) = scan(net, "\n\na.example\n   \n", &ScanConfig::default()).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(out.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_records_are_permutation_of_input() {
        let (net, input) = mixed_fleet();
        let (_, out) = scan(net, input, &ScanConfig::default()).await;
        let names: BTreeSet<String> = out
            .lines()
            .map(|l| l.split(',').next().unwrap().to_string())
            .collect();
        let expected: BTreeSet<String> = ["a.example", "b.example", "c.example", "d.example", "e.example"]
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(names, expected);
    }

    #[tokio::test]
    async fn test_same_record_set_for_one_and_fifty_workers() {
        let mut net = MockNet::new();
        let mut input = String::new();
        for i in 0..20 {
            let name = format!("host{i}.example");
            let script = match i % 4 {
                0 => Script::h2_host(),
                1 => Script::unresolvable(),
                2 => Script::port_closed(),
                _ => Script::https_only(),
            };
            net.insert(&name, script);
            input.push_str(&name);
            input.push('\n');
        }
        let single = ScanConfig {
            workers: 1,
            fields_header: false,
        };
        let wide = ScanConfig {
            workers: 50,
            fields_header: false,
        };

        let net2 = net.clone();
        let (r1, out1) = scan(net, &input, &single).await;
        let (r2, out2) = scan(net2, &input, &wide).await;
        assert_eq!(r1.unwrap(), 20);
        assert_eq!(r2.unwrap(), 20);

        let set1: BTreeSet<&str> = out1.lines().collect();
        let set2: BTreeSet<&str> = out2.lines().collect();
        assert_eq!(set1, set2);
    }

    #[tokio::test]
    async fn test_header_emitted_exactly_once_when_enabled() {
        let (net, input) = mixed_fleet();
        let config = ScanConfig {
            fields_header: true,
            ..ScanConfig::default()
        };
        let (_, out) = scan(net, input, &config).await;
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0], HostReport::FIELDS);
        assert_eq!(
            lines.iter().filter(|l| **l == HostReport::FIELDS).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_no_header_when_disabled() {
        let (net, input) = mixed_fleet();
        let (_, out) = scan(net, input, &ScanConfig::default()).await;
        assert!(!out.contains(HostReport::FIELDS));
    }

    #[tokio::test]
    async fn test_scenario_records() {
        let (net, input) = mixed_fleet();
        let (_, out) = scan(net, input, &ScanConfig::default()).await;
        let lines: BTreeSet<&str> = out.lines().collect();
        assert!(lines.contains("a.example,t,t,t,t,f,t,-,t,h2"));
        assert!(lines.contains("b.example,f,-,-,-,-,-,-,-,"));
        assert!(lines.contains("c.example,t,f,-,-,-,-,-,-,"));
        assert!(lines.contains("d.example,t,t,t,t,f,f,-,-,"));
        assert!(lines.contains("e.example,t,t,t,t,t,f,t,-,spdy/3.1"));
    }

    #[tokio::test]
    async fn test_invalid_worker_count_aborts_before_probing() {
        let config = ScanConfig {
            workers: 0,
            fields_header: false,
        };
        let (result, out) = scan(MockNet::new(), "a.example\n", &config).await;
        assert!(matches!(result, Err(ScanError::InvalidWorkerCount(0))));
        assert!(out.is_empty());
    }

    /// Reader yielding some complete lines, then an I/O error.
    struct FailAfter {
        data: Vec<u8>,
        pos: usize,
    }

    impl AsyncRead for FailAfter {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.pos < self.data.len() {
                let n = buf.remaining().min(self.data.len() - self.pos);
                buf.put_slice(&self.data[self.pos..self.pos + n]);
                self.pos += n;
                Poll::Ready(Ok(()))
            } else {
                Poll::Ready(Err(io::Error::other("stream broke")))
            }
        }
    }

    #[tokio::test]
    async fn test_read_error_surfaced_after_drain() {
        let mut net = MockNet::new();
        net.insert("a.example", Script::https_only());
        net.insert("b.example", Script::unresolvable());

        let reader = BufReader::new(FailAfter {
            data: b"a.example\nb.example\n".to_vec(),
            pos: 0,
        });
        let (output, mut readback) = tokio::io::duplex(1 << 16);
        let collector = tokio::spawn(async move {
            let mut text = String::new();
            readback.read_to_string(&mut text).await.unwrap();
            text
        });

        let result = run_scan(
            Arc::new(net),
            reader,
            output,
            DiagHandle::disabled(),
            &ScanConfig::default(),
        )
        .await;
        let out = collector.await.unwrap();

        // Both dispatched hosts were still probed and written.
        assert!(matches!(result, Err(ScanError::Input(_))));
        assert_eq!(out.lines().count(), 2);
    }
}
