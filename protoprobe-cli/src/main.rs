//! Command-line front end for the prober.
//!
//! Reads one host name per line from stdin, probes each with a pool of
//! concurrent workers, and writes one capability record per host to stdout.
//! Records use stdout exclusively; tracing goes to stderr and the optional
//! per-host failure diagnostics go to the `--log` file.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use protoprobe_core::{
    run_scan, spawn_diag_writer, DiagHandle, ScanConfig, ScanError, TokioNetProbe,
};
use tokio::io::{stdin, stdout, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Probe hosts read from stdin for TLS, HTTPS, SPDY/3.1 and HTTP/2 support.
#[derive(Debug, Parser)]
#[command(name = "protoprobe", version, about)]
struct Cli {
    /// Print a header line naming the record fields before the first record.
    #[arg(long)]
    fields: bool,

    /// Number of hosts probed concurrently.
    #[arg(long, default_value_t = 10)]
    workers: i64,

    /// Write per-host failure diagnostics to this file.
    #[arg(long, value_name = "FILE")]
    log: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Records own stdout, so tracing goes to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .without_time()
                .with_ansi(false),
        )
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(count) => {
            tracing::debug!("scan finished, {count} record(s) written");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("protoprobe: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<usize, ScanError> {
    let workers =
        usize::try_from(cli.workers).map_err(|_| ScanError::InvalidWorkerCount(cli.workers))?;
    let config = ScanConfig {
        workers,
        fields_header: cli.fields,
    };

    let (diag, diag_task) = match cli.log {
        Some(path) => {
            let file = tokio::fs::File::create(&path)
                .await
                .map_err(|source| ScanError::DiagSink {
                    path: path.display().to_string(),
                    source,
                })?;
            let (handle, task) = spawn_diag_writer(file);
            (handle, Some(task))
        }
        None => (DiagHandle::disabled(), None),
    };

    let net = Arc::new(TokioNetProbe::new());
    let result = run_scan(net, BufReader::new(stdin()), stdout(), diag, &config).await;

    // run_scan dropped the last sender; wait for the writer to drain.
    if let Some(task) = diag_task {
        let _ = task.await;
    }
    result
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["protoprobe"]);
        assert!(!cli.fields);
        assert_eq!(cli.workers, 10);
        assert!(cli.log.is_none());
    }

    #[test]
    fn test_all_flags() {
        let cli = Cli::parse_from([
            "protoprobe",
            "--fields",
            "--workers",
            "25",
            "--log",
            "/tmp/probe.log",
        ]);
        assert!(cli.fields);
        assert_eq!(cli.workers, 25);
        assert_eq!(cli.log.unwrap().to_str().unwrap(), "/tmp/probe.log");
    }

    #[test]
    fn test_negative_workers_rejected_by_run() {
        let cli = Cli::parse_from(["protoprobe", "--workers=-2"]);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let err = runtime.block_on(run(cli)).unwrap_err();
        assert!(matches!(err, ScanError::InvalidWorkerCount(-2)));
    }
}
