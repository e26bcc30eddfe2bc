//! ICE candidate lines and connectivity-discovery servers.
//!
//! Candidates travel through the relay as opaque `candidate:` strings; this
//! module parses and formats them so transports can validate what they are
//! handed, and describes the STUN/TURN servers a transport is built with.

use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Public STUN server used when no ICE servers are configured.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// A STUN or TURN server handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Check URL schemes; TURN servers need credentials.
    pub fn validate(&self) -> Result<()> {
        if self.urls.is_empty() {
            bail!("ICE server has no urls");
        }
        for url in &self.urls {
            let (scheme, rest) = url
                .split_once(':')
                .with_context(|| format!("ICE server url without scheme: {}", url))?;
            match scheme {
                "stun" | "stuns" => {}
                "turn" | "turns" => {
                    if self.username.is_none() || self.credential.is_none() {
                        bail!("TURN server {} requires username and credential", url);
                    }
                }
                other => bail!("unsupported ICE server scheme '{}' in {}", other, url),
            }
            if rest.is_empty() {
                bail!("ICE server url without host: {}", url);
            }
        }
        Ok(())
    }
}

impl Default for IceServer {
    fn default() -> Self {
        Self::stun(DEFAULT_STUN_SERVER)
    }
}

/// ICE candidate type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    fn as_str(&self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        }
    }
}

/// ICE transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// Parsed ICE candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u8,
    pub transport: Transport,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub candidate_type: CandidateType,
    /// For srflx/prflx/relay: the related address.
    pub raddr: Option<String>,
    pub rport: Option<u16>,
}

impl IceCandidate {
    /// A host candidate for a locally bound address.
    pub fn host(foundation: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            foundation: foundation.into(),
            component: 1,
            transport: Transport::Udp,
            priority: compute_priority(CandidateType::Host, 65535, 1),
            address: addr.ip().to_string(),
            port: addr.port(),
            candidate_type: CandidateType::Host,
            raddr: None,
            rport: None,
        }
    }

    /// Format as a `candidate:` line, the form carried by the relay.
    pub fn to_sdp_line(&self) -> String {
        let transport_str = match self.transport {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        };
        let mut line = format!(
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            transport_str,
            self.priority,
            self.address,
            self.port,
            self.candidate_type.as_str()
        );
        if let (Some(ref ra), Some(rp)) = (&self.raddr, self.rport) {
            line.push_str(&format!(" raddr {} rport {}", ra, rp));
        }
        line
    }

    #[cfg(test)]
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        format!("{}:{}", self.address, self.port).parse().ok()
    }
}

/// Parse an `a=candidate:` or `candidate:` line.
///
/// Trailing extension attributes (`generation`, `ufrag`, `tcptype`, ...) are
/// skipped.
pub fn parse_candidate(line: &str) -> Result<IceCandidate> {
    let line = line.trim();
    let content = if let Some(rest) = line.strip_prefix("a=candidate:") {
        rest
    } else if let Some(rest) = line.strip_prefix("candidate:") {
        rest
    } else {
        bail!("not a candidate line: {}", line);
    };

    let parts: Vec<&str> = content.split_whitespace().collect();
    if parts.len() < 8 {
        bail!("candidate line too short: {}", line);
    }

    let foundation = parts[0].to_string();
    let component: u8 = parts[1].parse().context("bad component")?;

    let transport = match parts[2].to_ascii_lowercase().as_str() {
        "udp" => Transport::Udp,
        "tcp" => Transport::Tcp,
        other => bail!("unsupported transport: {}", other),
    };

    let priority: u32 = parts[3].parse().context("bad priority")?;
    let address = parts[4].to_string();
    let port: u16 = parts[5].parse().context("bad port")?;

    if parts[6] != "typ" {
        bail!("expected 'typ' keyword at position 6, got: {}", parts[6]);
    }

    let candidate_type = match parts[7] {
        "host" => CandidateType::Host,
        "srflx" => CandidateType::ServerReflexive,
        "prflx" => CandidateType::PeerReflexive,
        "relay" => CandidateType::Relay,
        other => bail!("unknown candidate type: {}", other),
    };

    let mut raddr = None;
    let mut rport = None;
    let mut i = 8;
    while i < parts.len() {
        match parts[i] {
            "raddr" if i + 1 < parts.len() => {
                raddr = Some(parts[i + 1].to_string());
                i += 2;
            }
            "rport" if i + 1 < parts.len() => {
                rport = Some(parts[i + 1].parse().context("bad rport")?);
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    Ok(IceCandidate {
        foundation,
        component,
        transport,
        priority,
        address,
        port,
        candidate_type,
        raddr,
        rport,
    })
}

/// Compute ICE candidate priority per RFC 8445 section 5.1.2.1.
pub fn compute_priority(ctype: CandidateType, local_preference: u16, component: u8) -> u32 {
    let type_preference: u32 = match ctype {
        CandidateType::Host => 126,
        CandidateType::PeerReflexive => 110,
        CandidateType::ServerReflexive => 100,
        CandidateType::Relay => 0,
    };
    (type_preference << 24) | ((local_preference as u32) << 8) | (256 - component as u32)
}
