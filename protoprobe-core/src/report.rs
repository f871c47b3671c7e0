//! Tri-state probe results and the per-host capability record.

use std::fmt;

/// Three-valued probe outcome.
///
/// Modelled as a single enumeration rather than an `(attempted, value)`
/// pair, so an inconsistent "not attempted but true" state cannot exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Tri {
    /// The check never ran (a prerequisite stage failed).
    #[default]
    NotAttempted,
    /// The check ran and failed.
    No,
    /// The check ran and succeeded.
    Yes,
}

impl Tri {
    /// Convert an attempted check's outcome.
    pub fn from_bool(value: bool) -> Self {
        if value {
            Self::Yes
        } else {
            Self::No
        }
    }
}

impl fmt::Display for Tri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAttempted => write!(f, "-"),
            Self::No => write!(f, "f"),
            Self::Yes => write!(f, "t"),
        }
    }
}

/// Capability record for one probed host.
///
/// Created by the dispatcher with every check un-attempted, mutated by
/// exactly one worker while probing, and immutable once handed to the
/// collector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostReport {
    /// DNS name of the host. Rewritten once to `www.<name>` if the first
    /// TLS handshake fails; the rewrite is visible in the emitted record.
    pub name: String,

    /// Whether the name resolves to at least one address.
    pub resolves: Tri,
    /// Whether port 443 accepts a TCP connection.
    pub port_open: Tri,
    /// Whether a TLS handshake completes.
    pub tls: Tri,
    /// Whether an HTTPS (HTTP/1.1) request works.
    pub https: Tri,
    /// Whether the server selected `spdy/3.1` during ALPN.
    pub spdy_advertised: Tri,
    /// Whether the server selected `h2` during ALPN.
    pub h2_advertised: Tri,
    /// Whether a SPDY/3.1 request works.
    pub spdy_request: Tri,
    /// Whether an HTTP/2 request works.
    pub h2_request: Tri,

    /// Protocols the server selected during the TLS handshake, in the order
    /// they were learned. Empty if the handshake never completed or the
    /// server selected none of the offered protocols.
    pub alpn_protocols: Vec<String>,
}

impl HostReport {
    /// Header line naming every record field, in emission order.
    pub const FIELDS: &'static str = "name,resolves,port443Open,tlsWorks,httpsWorks,\
                                      spdyAdvertised,h2Advertised,spdyWorks,h2Works,alpnProtocols";

    /// New record for a host, with every check un-attempted.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl fmt::Display for HostReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{},{},{},{},{}",
            self.name,
            self.resolves,
            self.port_open,
            self.tls,
            self.https,
            self.spdy_advertised,
            self.h2_advertised,
            self.spdy_request,
            self.h2_request,
            self.alpn_protocols.join(" ")
        )
    }
}
