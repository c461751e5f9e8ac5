//! ICE candidates and server configuration.
//!
//! Candidates travel between peers as opaque `candidate:` strings inside
//! `IceCandidateInit`; the simulated peer connection gathers and checks them
//! through this module.

use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Default public STUN server used when no ICE servers are configured.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// One STUN/TURN server handed to the peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// A TURN entry without both username and credential cannot authenticate.
    pub fn validate(&self) -> Result<()> {
        if self.urls.is_empty() {
            bail!("ICE server entry has no urls");
        }
        for url in &self.urls {
            let scheme = url.split(':').next().unwrap_or_default();
            match scheme {
                "stun" | "stuns" => {}
                "turn" | "turns" => {
                    if self.username.is_none() || self.credential.is_none() {
                        bail!("TURN server {} needs a username and credential", url);
                    }
                }
                other => bail!("unsupported ICE server scheme '{}' in {}", other, url),
            }
        }
        Ok(())
    }
}

impl Default for IceServerConfig {
    fn default() -> Self {
        Self::stun(DEFAULT_STUN_SERVER)
    }
}

// ---- Candidates ----

/// Type preference of a host candidate (RFC 8445 section 5.1.2.2).
const HOST_TYPE_PREFERENCE: u32 = 126;

/// A UDP host candidate, the only kind the simulated transport gathers or
/// accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u8,
    pub priority: u32,
    pub address: String,
    pub port: u16,
}

impl IceCandidate {
    pub fn host(foundation: u32, component: u8, address: impl Into<String>, port: u16) -> Self {
        let local_preference = 65535u16.saturating_sub(foundation as u16);
        Self {
            foundation: foundation.to_string(),
            component,
            priority: host_priority(local_preference, component),
            address: address.into(),
            port,
        }
    }

    /// Format as the `candidate:` attribute value (without the `a=` prefix).
    pub fn to_sdp_line(&self) -> String {
        format!(
            "candidate:{} {} UDP {} {} {} typ host",
            self.foundation, self.component, self.priority, self.address, self.port
        )
    }
}

/// One UDP host candidate per local address, in preference order.
pub fn gather_host_candidates(addrs: &[SocketAddr]) -> Vec<IceCandidate> {
    addrs
        .iter()
        .enumerate()
        .map(|(i, addr)| IceCandidate::host(i as u32 + 1, 1, addr.ip().to_string(), addr.port()))
        .collect()
}

/// Parse an `a=candidate:` or bare `candidate:` line.
///
/// Anything but a UDP host candidate is rejected. Trailing extension
/// attributes (`generation`, `ufrag`, ...) are ignored.
pub fn parse_candidate(line: &str) -> Result<IceCandidate> {
    let line = line.trim();
    let body = line
        .strip_prefix("a=")
        .unwrap_or(line)
        .strip_prefix("candidate:")
        .with_context(|| format!("not a candidate line: {}", line))?;

    let mut fields = body.split_whitespace();
    let mut next = |what: &'static str| fields.next().with_context(|| format!("candidate line has no {}: {}", what, line));

    let foundation = next("foundation")?.to_string();
    let component = next("component")?.parse().context("bad component")?;
    let transport = next("transport")?;
    if !transport.eq_ignore_ascii_case("udp") {
        bail!("only UDP candidates are supported, got {}", transport);
    }
    let priority = next("priority")?.parse().context("bad priority")?;
    let address = next("address")?.to_string();
    let port = next("port")?.parse().context("bad port")?;
    match (next("typ")?, next("candidate type")?) {
        ("typ", "host") => {}
        ("typ", other) => bail!("only host candidates are supported, got {}", other),
        (other, _) => bail!("expected 'typ', got {}", other),
    }

    Ok(IceCandidate {
        foundation,
        component,
        priority,
        address,
        port,
    })
}

fn host_priority(local_preference: u16, component: u8) -> u32 {
    (HOST_TYPE_PREFERENCE << 24) | ((local_preference as u32) << 8) | (256 - component as u32)
}
