//! External network capabilities behind the [`NetProbe`] seam.
//!
//! The probe state machine only orchestrates; everything that actually
//! touches the network (DNS lookup, TCP dial, TLS handshake, HTTP
//! requests) lives behind this trait. [`TokioNetProbe`] is the production
//! implementation (hickory-resolver, tokio, rustls, reqwest, and the
//! in-crate SPDY client); tests substitute a scripted mock.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::{
    config::ResolverConfig, name_server::TokioConnectionProvider, TokioResolver,
};
use log::{debug, trace};
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::error::StageError;
use crate::spdy;

/// TCP connect timeout (reference behavior).
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// TLS handshake timeout. The reference behavior had none; a bound is
/// carried so a hung handshake cannot starve a worker forever.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-request timeout for the HTTPS, SPDY and HTTP/2 request stages.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Alternate application protocols probed after the TLS stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AltProtocol {
    /// SPDY/3.1.
    Spdy,
    /// HTTP/2.
    H2,
}

impl AltProtocol {
    /// ALPN protocol identifier as it appears on the wire.
    pub fn id(self) -> &'static str {
        match self {
            Self::Spdy => "spdy/3.1",
            Self::H2 => "h2",
        }
    }
}

impl fmt::Display for AltProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spdy => write!(f, "SPDY"),
            Self::H2 => write!(f, "HTTP/2"),
        }
    }
}

/// Outcome of an alternate-protocol request attempt.
///
/// The distinctions matter to the state machine: a connect failure is an
/// attempted-and-failed check, while a negotiation mismatch or a session
/// that could not be established leaves the check un-attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AltOutcome {
    /// TCP dial or TLS handshake failed.
    ConnectFailed(String),
    /// The handshake completed but the server negotiated something else
    /// (payload: what it negotiated, or `"none"`).
    NotNegotiated(String),
    /// The protocol client session could not be established.
    SessionFailed(String),
    /// The session came up but the request failed.
    RequestFailed(String),
    /// The request completed.
    Ok,
}

/// External capabilities consumed by the probe state machine.
#[async_trait]
pub trait NetProbe: Send + Sync {
    /// Resolve `host` to at least one address.
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, StageError>;

    /// Open and immediately close a TCP connection to `host:port`, bounded
    /// by the connect timeout.
    async fn dial(&self, host: &str, port: u16) -> Result<(), StageError>;

    /// TLS handshake to `host:port` with SNI = `host` and the given ALPN
    /// offer. Returns the protocols the server selected (at most one with
    /// ALPN; empty when the server selected none). The connection is closed
    /// before returning.
    async fn tls_probe(
        &self,
        host: &str,
        port: u16,
        alpn: &[&str],
    ) -> Result<Vec<String>, StageError>;

    /// `GET /` over ordinary HTTPS (TLS + HTTP/1.1), response body drained.
    async fn https_get(&self, host: &str) -> Result<(), StageError>;

    /// Open a fresh TLS connection advertising only `proto`, verify the
    /// negotiation, establish a protocol client session and `GET /`.
    async fn alt_request(&self, host: &str, proto: AltProtocol) -> AltOutcome;
}

/// Initialize the rustls `CryptoProvider` (once).
///
/// `install_default` returns `Err` only when a provider is already
/// installed, which is fine.
fn ensure_crypto_provider() {
    let _ = CryptoProvider::install_default(rustls::crypto::ring::default_provider());
}

/// Build a resolver from the host system DNS configuration, falling back to
/// Hickory's default upstream set if it cannot be loaded.
fn build_system_resolver() -> TokioResolver {
    match TokioResolver::builder_tokio() {
        Ok(builder) => builder.build(),
        Err(e) => {
            log::warn!("Failed to load system DNS configuration, falling back to defaults: {e}");
            TokioResolver::builder_with_config(
                ResolverConfig::default(),
                TokioConnectionProvider::default(),
            )
            .build()
        }
    }
}

/// Production [`NetProbe`] on top of tokio, rustls and reqwest.
pub struct TokioNetProbe {
    resolver: TokioResolver,
    tls_base: Arc<ClientConfig>,
    http_client: reqwest::Client,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    request_timeout: Duration,
}

impl Default for TokioNetProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl TokioNetProbe {
    /// Probe with the default timeouts.
    pub fn new() -> Self {
        Self::with_timeouts(CONNECT_TIMEOUT, HANDSHAKE_TIMEOUT, REQUEST_TIMEOUT)
    }

    /// Probe with explicit timeouts.
    pub fn with_timeouts(
        connect_timeout: Duration,
        handshake_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        ensure_crypto_provider();

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_base = Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );

        let http_client = reqwest::Client::builder()
            .http1_only()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .unwrap_or_default();

        Self {
            resolver: build_system_resolver(),
            tls_base,
            http_client,
            connect_timeout,
            handshake_timeout,
            request_timeout,
        }
    }

    /// Clone the base TLS config with a specific ALPN offer.
    fn tls_config(&self, alpn: &[&str]) -> Arc<ClientConfig> {
        let mut config = (*self.tls_base).clone();
        config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        Arc::new(config)
    }

    /// Dial and complete a TLS handshake with the given ALPN offer.
    async fn tls_connect(
        &self,
        host: &str,
        port: u16,
        alpn: &[&str],
    ) -> Result<TlsStream<TcpStream>, StageError> {
        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect(format!("{host}:{port}")),
        )
        .await
        .map_err(|_| {
            StageError::new(format!(
                "TCP connect timed out ({}s)",
                self.connect_timeout.as_secs()
            ))
        })?
        .map_err(|e| StageError::new(format!("TCP connect failed: {e}")))?;

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| StageError::new(format!("invalid server name: {host}")))?;
        let connector = TlsConnector::from(self.tls_config(alpn));

        timeout(self.handshake_timeout, connector.connect(server_name, stream))
            .await
            .map_err(|_| {
                StageError::new(format!(
                    "TLS handshake timed out ({}s)",
                    self.handshake_timeout.as_secs()
                ))
            })?
            .map_err(|e| StageError::new(format!("TLS handshake failed: {e}")))
    }

    /// Negotiated ALPN protocol of an established TLS stream, if any.
    fn negotiated(stream: &TlsStream<TcpStream>) -> Option<String> {
        let (_, conn) = stream.get_ref();
        conn.alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned())
    }

    async fn spdy_request(&self, host: &str, stream: TlsStream<TcpStream>) -> AltOutcome {
        let mut session = match spdy::ClientSession::new(stream) {
            Ok(s) => s,
            Err(e) => return AltOutcome::SessionFailed(e.to_string()),
        };
        match timeout(self.request_timeout, session.get(host)).await {
            Ok(Ok(response)) => {
                debug!(
                    "[SPDY] {host} answered {:?} with {} body byte(s)",
                    response.status, response.body_len
                );
                AltOutcome::Ok
            }
            Ok(Err(e)) => AltOutcome::RequestFailed(e.to_string()),
            Err(_) => AltOutcome::RequestFailed(format!(
                "request timed out ({}s)",
                self.request_timeout.as_secs()
            )),
        }
    }

    async fn h2_request(&self, host: &str, stream: TlsStream<TcpStream>) -> AltOutcome {
        match timeout(self.request_timeout, h2_get(host, stream)).await {
            Ok(outcome) => outcome,
            Err(_) => AltOutcome::RequestFailed(format!(
                "request timed out ({}s)",
                self.request_timeout.as_secs()
            )),
        }
    }
}

/// Drive one `GET /` over an established HTTP/2 connection.
async fn h2_get(host: &str, stream: TlsStream<TcpStream>) -> AltOutcome {
    let (mut send_request, connection) = match h2::client::handshake(stream).await {
        Ok(pair) => pair,
        Err(e) => return AltOutcome::SessionFailed(format!("HTTP/2 handshake failed: {e}")),
    };

    // The connection future must be polled for the request to make progress.
    let driver = tokio::spawn(async move {
        if let Err(e) = connection.await {
            trace!("[H2] connection terminated: {e}");
        }
    });

    let result = async {
        let request = http::Request::builder()
            .method(http::Method::GET)
            .uri(format!("https://{host}/"))
            .body(())
            .map_err(|e| format!("failed to build request: {e}"))?;

        let send_ready = send_request
            .ready()
            .await
            .map_err(|e| format!("HTTP/2 connection not ready: {e}"));
        let mut send_request = send_ready?;

        let (response, _) = send_request
            .send_request(request, true)
            .map_err(|e| format!("failed to send request: {e}"))?;
        let response = response
            .await
            .map_err(|e| format!("HTTP/2 request failed: {e}"))?;
        trace!("[H2] {host} responded {}", response.status());

        // Drain the body, releasing connection-level flow-control capacity
        // as data arrives.
        let mut body = response.into_body();
        let mut flow = body.flow_control().clone();
        while let Some(chunk) = body.data().await {
            let chunk = chunk.map_err(|e| format!("failed to read body: {e}"))?;
            let _ = flow.release_capacity(chunk.len());
        }
        Ok::<(), String>(())
    }
    .await;

    // Release the transport regardless of outcome.
    driver.abort();

    match result {
        Ok(()) => AltOutcome::Ok,
        Err(e) => AltOutcome::RequestFailed(e),
    }
}

#[async_trait]
impl NetProbe for TokioNetProbe {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, StageError> {
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| StageError::new(e.to_string()))?;
        let addrs: Vec<IpAddr> = lookup.iter().collect();
        if addrs.is_empty() {
            return Err(StageError::new("name resolved to no addresses"));
        }
        trace!("[DNS] {host} resolved to {} address(es)", addrs.len());
        Ok(addrs)
    }

    async fn dial(&self, host: &str, port: u16) -> Result<(), StageError> {
        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect(format!("{host}:{port}")),
        )
        .await
        .map_err(|_| {
            StageError::new(format!(
                "dial timed out ({}s)",
                self.connect_timeout.as_secs()
            ))
        })?
        .map_err(|e| StageError::new(e.to_string()))?;
        drop(stream);
        Ok(())
    }

    async fn tls_probe(
        &self,
        host: &str,
        port: u16,
        alpn: &[&str],
    ) -> Result<Vec<String>, StageError> {
        let stream = self.tls_connect(host, port, alpn).await?;
        let protocols: Vec<String> = Self::negotiated(&stream).into_iter().collect();
        trace!("[TLS] {host} selected {protocols:?} from offer {alpn:?}");
        Ok(protocols)
    }

    async fn https_get(&self, host: &str) -> Result<(), StageError> {
        let url = format!("https://{host}/");
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| StageError::new(format!("HTTP request failed: {e}")))?;
        // Fully drain the body; a mid-body failure does not retroactively
        // fail the request.
        if let Err(e) = response.bytes().await {
            debug!("[HTTPS] {host}: body drain failed: {e}");
        }
        Ok(())
    }

    async fn alt_request(&self, host: &str, proto: AltProtocol) -> AltOutcome {
        let stream = match self.tls_connect(host, 443, &[proto.id()]).await {
            Ok(s) => s,
            Err(e) => return AltOutcome::ConnectFailed(e.to_string()),
        };
        match Self::negotiated(&stream) {
            Some(p) if p == proto.id() => {}
            other => {
                return AltOutcome::NotNegotiated(other.unwrap_or_else(|| "none".to_string()))
            }
        }
        match proto {
            AltProtocol::Spdy => self.spdy_request(host, stream).await,
            AltProtocol::H2 => self.h2_request(host, stream).await,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::probe::probe_host;
    use crate::report::{HostReport, Tri};
    use crate::DiagHandle;

    #[test]
    fn test_alt_protocol_ids() {
        assert_eq!(AltProtocol::Spdy.id(), "spdy/3.1");
        assert_eq!(AltProtocol::H2.id(), "h2");
    }

    #[test]
    fn test_alt_protocol_display() {
        assert_eq!(AltProtocol::Spdy.to_string(), "SPDY");
        assert_eq!(AltProtocol::H2.to_string(), "HTTP/2");
    }

    #[tokio::test]
    async fn test_tls_config_carries_alpn_offer() {
        let probe = TokioNetProbe::new();
        let config = probe.tls_config(&["spdy/3.1", "h2"]);
        assert_eq!(
            config.alpn_protocols,
            vec![b"spdy/3.1".to_vec(), b"h2".to_vec()]
        );
        let empty = probe.tls_config(&[]);
        assert!(empty.alpn_protocols.is_empty());
    }

    // NOTE: These tests depend on external networks; failures may be due to
    // firewall/proxy issues.

    #[tokio::test]
    #[ignore = "requires network access"]
    async fn test_probe_real_https_host() {
        let net = TokioNetProbe::new();
        let mut report = HostReport::new("google.com");
        probe_host(&net, &mut report, &DiagHandle::disabled()).await;
        assert_eq!(report.resolves, Tri::Yes);
        assert_eq!(report.port_open, Tri::Yes);
        assert_eq!(report.tls, Tri::Yes);
        assert_eq!(report.https, Tri::Yes);
        // Modern servers select h2 and no longer speak SPDY.
        assert_eq!(report.spdy_advertised, Tri::No);
    }

    #[tokio::test]
    #[ignore = "requires network access"]
    async fn test_probe_nonexistent_host() {
        let net = TokioNetProbe::new();
        let mut report = HostReport::new("this-domain-does-not-exist-12345.com");
        probe_host(&net, &mut report, &DiagHandle::disabled()).await;
        assert_eq!(report.resolves, Tri::No);
        assert_eq!(report.port_open, Tri::NotAttempted);
        assert_eq!(report.tls, Tri::NotAttempted);
    }
}
