//! Scripted [`NetProbe`] mock for deterministic pipeline and state-machine
//! tests. No sockets are opened; every host's behavior is declared up
//! front, keyed by the host name in effect at call time (so `www.` retries
//! consult their own script).

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;

use crate::error::StageError;
use crate::net::{AltOutcome, AltProtocol, NetProbe};

/// Scripted behavior for one host name.
#[derive(Debug, Clone)]
pub struct Script {
    pub resolve: Result<(), String>,
    pub dial: Result<(), String>,
    /// `Ok` carries the ALPN protocols the fake server selects.
    pub tls: Result<Vec<String>, String>,
    pub https: Result<(), String>,
    pub spdy: AltOutcome,
    pub h2: AltOutcome,
}

impl Script {
    /// Everything succeeds; the server selects no alternate protocol.
    pub fn https_only() -> Self {
        Self {
            resolve: Ok(()),
            dial: Ok(()),
            tls: Ok(vec![]),
            https: Ok(()),
            spdy: AltOutcome::NotNegotiated("none".to_string()),
            h2: AltOutcome::NotNegotiated("none".to_string()),
        }
    }

    /// The name does not resolve.
    pub fn unresolvable() -> Self {
        Self {
            resolve: Err("no such host".to_string()),
            ..Self::https_only()
        }
    }

    /// The name resolves but port 443 is closed.
    pub fn port_closed() -> Self {
        Self {
            dial: Err("connection timed out".to_string()),
            ..Self::https_only()
        }
    }

    /// TCP works but every TLS handshake fails.
    pub fn tls_broken() -> Self {
        Self {
            tls: Err("certificate name mismatch".to_string()),
            ..Self::https_only()
        }
    }

    /// The server selects and speaks HTTP/2.
    pub fn h2_host() -> Self {
        Self {
            tls: Ok(vec!["h2".to_string()]),
            h2: AltOutcome::Ok,
            ..Self::https_only()
        }
    }

    /// The server selects and speaks SPDY/3.1.
    pub fn spdy_host() -> Self {
        Self {
            tls: Ok(vec!["spdy/3.1".to_string()]),
            spdy: AltOutcome::Ok,
            ..Self::https_only()
        }
    }
}

/// [`NetProbe`] implementation backed by per-host scripts.
///
/// Hosts without a script behave as unresolvable.
#[derive(Debug, Clone, Default)]
pub struct MockNet {
    hosts: HashMap<String, Script>,
}

impl MockNet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(name: &str, script: Script) -> Self {
        let mut net = Self::new();
        net.insert(name, script);
        net
    }

    pub fn insert(&mut self, name: &str, script: Script) {
        self.hosts.insert(name.to_string(), script);
    }

    fn script(&self, host: &str) -> Script {
        self.hosts.get(host).cloned().unwrap_or_else(|| Script {
            resolve: Err(format!("unknown host {host}")),
            ..Script::https_only()
        })
    }
}

#[async_trait]
impl NetProbe for MockNet {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, StageError> {
        self.script(host)
            .resolve
            .map(|()| vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))])
            .map_err(StageError::new)
    }

    async fn dial(&self, host: &str, _port: u16) -> Result<(), StageError> {
        self.script(host).dial.map_err(StageError::new)
    }

    async fn tls_probe(
        &self,
        host: &str,
        _port: u16,
        _alpn: &[&str],
    ) -> Result<Vec<String>, StageError> {
        self.script(host).tls.map_err(StageError::new)
    }

    async fn https_get(&self, host: &str) -> Result<(), StageError> {
        self.script(host).https.map_err(StageError::new)
    }

    async fn alt_request(&self, host: &str, proto: AltProtocol) -> AltOutcome {
        let script = self.script(host);
        match proto {
            AltProtocol::Spdy => script.spdy,
            AltProtocol::H2 => script.h2,
        }
    }
}
