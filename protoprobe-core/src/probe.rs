//! The escalating probe state machine.
//!
//! Runs the per-host checks in order with early-exit-on-failure semantics:
//! a stage only runs when its prerequisite succeeded, so the capability
//! record can never claim a later check was attempted after an earlier one
//! failed. The two request stages are gated on their own advertisement
//! check, not on each other.

use log::debug;

use crate::diag::DiagHandle;
use crate::net::{AltOutcome, AltProtocol, NetProbe};
use crate::report::{HostReport, Tri};

const HTTPS_PORT: u16 = 443;

/// Probe one host, mutating its capability record in place.
///
/// Exactly one worker calls this for a given record; nothing else reads or
/// writes the record until it is handed to the collector. Every stage
/// failure is written to the diagnostic sink, tagged with the host name
/// active at the time (the name may have gained a `www.` prefix by then).
pub async fn probe_host(net: &dyn NetProbe, report: &mut HostReport, diag: &DiagHandle) {
    // Check the name resolves, give up if it does not.
    match net.resolve(&report.name).await {
        Ok(_) => report.resolves = Tri::Yes,
        Err(e) => {
            diag.emit(&report.name, format_args!("Error resolving name: {e}"));
            report.resolves = Tri::No;
            return;
        }
    }

    // See if port 443 is open, give up if it is not.
    match net.dial(&report.name, HTTPS_PORT).await {
        Ok(()) => report.port_open = Tri::Yes,
        Err(e) => {
            diag.emit(&report.name, format_args!("TCP dial to port 443 failed: {e}"));
            report.port_open = Tri::No;
            return;
        }
    }

    // See if TLS works, offering both alternate protocols so the handshake
    // tells us what the server is willing to speak. A handshake failure may
    // be a certificate issued for the www host, so retry once with a `www.`
    // prefix; the rename is permanent and visible in the emitted record.
    let offer = [AltProtocol::Spdy.id(), AltProtocol::H2.id()];
    let selected = match net.tls_probe(&report.name, HTTPS_PORT, &offer).await {
        Ok(protocols) => protocols,
        Err(first) => {
            debug!(
                "[TLS] handshake with {} failed ({first}), retrying with www. prefix",
                report.name
            );
            report.name = format!("www.{}", report.name);
            match net.tls_probe(&report.name, HTTPS_PORT, &offer).await {
                Ok(protocols) => protocols,
                Err(e) => {
                    diag.emit(
                        &report.name,
                        format_args!("Error performing TLS connection: {e}"),
                    );
                    report.tls = Tri::No;
                    return;
                }
            }
        }
    };
    report.tls = Tri::Yes;
    report.alpn_protocols = selected;

    // Both advertisement checks run once the handshake has succeeded,
    // whatever their outcome.
    report.spdy_advertised = advertised(report, AltProtocol::Spdy);
    report.h2_advertised = advertised(report, AltProtocol::H2);

    // See if HTTPS works by performing GET /. A failure here no longer
    // gates the alternate-protocol stages.
    match net.https_get(&report.name).await {
        Ok(()) => report.https = Tri::Yes,
        Err(e) => {
            diag.emit(&report.name, format_args!("HTTP request failed: {e}"));
            report.https = Tri::No;
        }
    }

    if report.spdy_advertised == Tri::Yes {
        report.spdy_request = alt_stage(net, &report.name, AltProtocol::Spdy, diag).await;
    }
    if report.h2_advertised == Tri::Yes {
        report.h2_request = alt_stage(net, &report.name, AltProtocol::H2, diag).await;
    }
}

/// Contains-check over the protocols the server selected during stage 3.
fn advertised(report: &HostReport, proto: AltProtocol) -> Tri {
    Tri::from_bool(report.alpn_protocols.iter().any(|p| p == proto.id()))
}

/// Run one alternate-protocol request and map its outcome to a tri-state.
///
/// A connect failure or a failed request count as attempted-and-failed. A
/// negotiation mismatch or a session that could not be established leave
/// the check un-attempted: the stage was skipped, not failed.
async fn alt_stage(net: &dyn NetProbe, host: &str, proto: AltProtocol, diag: &DiagHandle) -> Tri {
    match net.alt_request(host, proto).await {
        AltOutcome::Ok => Tri::Yes,
        AltOutcome::ConnectFailed(e) => {
            diag.emit(host, format_args!("Failed to dial port 443 for {proto}: {e}"));
            Tri::No
        }
        AltOutcome::RequestFailed(e) => {
            diag.emit(host, format_args!("Failed to do {proto} request: {e}"));
            Tri::No
        }
        AltOutcome::NotNegotiated(got) => {
            diag.emit(
                host,
                format_args!("Negotiated protocol not {}: {got}", proto.id()),
            );
            Tri::NotAttempted
        }
        AltOutcome::SessionFailed(e) => {
            diag.emit(
                host,
                format_args!("Failed to create {proto} client connection: {e}"),
            );
            Tri::NotAttempted
        }
    }
}
