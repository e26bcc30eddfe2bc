//! In-process transport network.
//!
//! Every transport created from one `LoopbackNetwork` lives in a shared hub.
//! Descriptions carry the endpoint id, so setting a peer's description links
//! the two endpoints. A pair connects once both sides hold a local and a
//! remote description and have applied at least one peer candidate. The
//! network can be severed and restored to emulate a connectivity drop.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::calling::ice::{self, CandidateType, IceCandidate, IceServer};
use crate::calling::media::{MediaTrack, TrackKind};
use crate::calling::transport::{
    ConnectionStatus, PeerTransport, TransportError, TransportEvent, TransportEvents,
    TransportFactory,
};
use crate::models::{ConnectivityCandidate, SdpKind, SessionDescription};

const ENDPOINT_ATTR: &str = "a=x-loopback-endpoint:";
const BASE_PORT: u16 = 40000;
const PORT_SPAN: u64 = 20000;

struct Endpoint {
    tracks: Vec<MediaTrack>,
    stun: bool,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    peer: Option<u64>,
    applied: Vec<ConnectivityCandidate>,
    rejected: usize,
    status: ConnectionStatus,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Endpoint {
    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status == status {
            return;
        }
        self.status = status;
        let _ = self.events.send(TransportEvent::StatusChanged(status));
    }

    fn ready(&self) -> bool {
        self.local.is_some() && self.remote.is_some() && !self.applied.is_empty()
    }

    fn is_closed(&self) -> bool {
        self.status == ConnectionStatus::Closed
    }
}

#[derive(Default)]
struct Hub {
    next_id: u64,
    endpoints: HashMap<u64, Endpoint>,
    severed: bool,
}

impl Hub {
    /// Bring `id` and its peer to `Connected` if both are ready.
    fn evaluate(&mut self, id: u64) {
        let Some(peer_id) = self.endpoints.get(&id).and_then(|e| e.peer) else {
            return;
        };
        let both_ready = match (self.endpoints.get(&id), self.endpoints.get(&peer_id)) {
            (Some(a), Some(b)) => {
                a.ready() && b.ready() && !a.is_closed() && !b.is_closed() && b.peer == Some(id)
            }
            _ => false,
        };
        if !both_ready || self.severed {
            return;
        }
        for key in [id, peer_id] {
            if let Some(e) = self.endpoints.get_mut(&key) {
                e.set_status(ConnectionStatus::Connected);
            }
        }
    }
}

/// Per-endpoint counters for inspection.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStats {
    pub id: u64,
    pub status: ConnectionStatus,
    pub applied_candidates: Vec<String>,
    pub rejected_candidates: usize,
    pub has_local_description: bool,
    pub has_remote_description: bool,
}

/// Shared hub of loopback transports. Also the `TransportFactory` for them.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of transports ever created.
    #[cfg(test)]
    pub fn transports_created(&self) -> usize {
        self.hub().next_id as usize
    }

    #[cfg(test)]
    pub fn stats(&self) -> Vec<EndpointStats> {
        let hub = self.hub();
        let mut stats: Vec<_> = hub
            .endpoints
            .iter()
            .map(|(id, e)| EndpointStats {
                id: *id,
                status: e.status,
                applied_candidates: e.applied.iter().map(|c| c.candidate.clone()).collect(),
                rejected_candidates: e.rejected,
                has_local_description: e.local.is_some(),
                has_remote_description: e.remote.is_some(),
            })
            .collect();
        stats.sort_by_key(|s| s.id);
        stats
    }

    /// Drop every link: connected endpoints report `Disconnected`.
    pub fn sever(&self) {
        let mut hub = self.hub();
        hub.severed = true;
        for e in hub.endpoints.values_mut() {
            if e.status == ConnectionStatus::Connected {
                e.set_status(ConnectionStatus::Disconnected);
            }
        }
        tracing::info!("Loopback network severed");
    }

    /// Undo `sever`; ready pairs reconnect.
    pub fn restore(&self) {
        let mut hub = self.hub();
        hub.severed = false;
        let ids: Vec<u64> = hub.endpoints.keys().copied().collect();
        for id in ids {
            hub.evaluate(id);
        }
        tracing::info!("Loopback network restored");
    }
}

#[async_trait]
impl TransportFactory for LoopbackNetwork {
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut hub = self.hub();
        hub.next_id += 1;
        let id = hub.next_id;
        hub.endpoints.insert(
            id,
            Endpoint {
                tracks: Vec::new(),
                stun: ice_servers
                    .iter()
                    .flat_map(|s| s.urls.iter())
                    .any(|u| u.starts_with("stun")),
                local: None,
                remote: None,
                peer: None,
                applied: Vec::new(),
                rejected: 0,
                status: ConnectionStatus::New,
                events: tx,
            },
        );
        tracing::debug!("Loopback transport {} created", id);
        let transport = LoopbackTransport {
            id,
            network: self.clone(),
        };
        Ok((Arc::new(transport), rx))
    }
}

/// One endpoint in a `LoopbackNetwork`.
pub struct LoopbackTransport {
    id: u64,
    network: LoopbackNetwork,
}

impl LoopbackTransport {
    fn with_endpoint<R>(
        &self,
        f: impl FnOnce(&mut Hub, u64) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let mut hub = self.network.hub();
        let open = hub.endpoints.get(&self.id).is_some_and(|e| !e.is_closed());
        if !open {
            return Err(TransportError::Closed);
        }
        f(&mut *hub, self.id)
    }

    fn describe(&self, kind: SdpKind, tracks: &[MediaTrack]) -> SessionDescription {
        let mut sdp = format!(
            "v=0\r\no=- {id} 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n{attr}{id}\r\n",
            id = self.id,
            attr = ENDPOINT_ATTR
        );
        for track in tracks {
            let pt = match track.kind() {
                TrackKind::Audio => 111,
                TrackKind::Video => 96,
            };
            sdp.push_str(&format!(
                "m={} 9 UDP/TLS/RTP/SAVPF {}\r\na=msid:- {}\r\n",
                track.kind().as_str(),
                pt,
                track.id()
            ));
        }
        SessionDescription { kind, sdp }
    }

    fn local_candidates(&self, stun: bool) -> Vec<ConnectivityCandidate> {
        let port = BASE_PORT + (self.id % PORT_SPAN) as u16;
        let host = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let host_candidate = IceCandidate::host(self.id.to_string(), host);
        let mut out = vec![host_candidate.clone()];
        if stun {
            out.push(IceCandidate {
                foundation: format!("{}s", self.id),
                candidate_type: CandidateType::ServerReflexive,
                priority: ice::compute_priority(CandidateType::ServerReflexive, 65535, 1),
                address: "203.0.113.1".into(),
                raddr: Some(host.ip().to_string()),
                rport: Some(port),
                ..host_candidate
            });
        }
        out.into_iter()
            .map(|c| ConnectivityCandidate::new(c.to_sdp_line()))
            .collect()
    }
}

fn endpoint_of(desc: &SessionDescription) -> Result<u64, TransportError> {
    desc.sdp
        .lines()
        .find_map(|l| l.trim().strip_prefix(ENDPOINT_ATTR))
        .and_then(|id| id.trim().parse().ok())
        .ok_or_else(|| TransportError::InvalidDescription("no loopback endpoint".into()))
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn add_track(&self, track: MediaTrack) -> Result<(), TransportError> {
        self.with_endpoint(|hub, id| {
            if let Some(e) = hub.endpoints.get_mut(&id) {
                e.tracks.push(track);
            }
            Ok(())
        })
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let tracks = self.with_endpoint(|hub, id| {
            Ok(hub.endpoints.get(&id).map(|e| e.tracks.clone()).unwrap_or_default())
        })?;
        Ok(self.describe(SdpKind::Offer, &tracks))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let tracks = self.with_endpoint(|hub, id| {
            let e = hub.endpoints.get(&id).ok_or(TransportError::Closed)?;
            match &e.remote {
                Some(d) if d.kind == SdpKind::Offer => Ok(e.tracks.clone()),
                _ => Err(TransportError::InvalidState("answer requires a remote offer")),
            }
        })?;
        Ok(self.describe(SdpKind::Answer, &tracks))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.with_endpoint(|hub, id| {
            if endpoint_of(&desc)? != id {
                return Err(TransportError::InvalidDescription(
                    "description belongs to another endpoint".into(),
                ));
            }
            let Some(e) = hub.endpoints.get_mut(&id) else {
                return Err(TransportError::Closed);
            };
            if e.local.is_some() {
                return Err(TransportError::InvalidState("local description already set"));
            }
            e.local = Some(desc);
            let stun = e.stun;
            for candidate in self.local_candidates(stun) {
                let _ = e.events.send(TransportEvent::LocalCandidate(candidate));
            }
            if e.remote.is_some() {
                e.set_status(ConnectionStatus::Connecting);
            }
            hub.evaluate(id);
            Ok(())
        })
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let peer = endpoint_of(&desc)?;
        self.with_endpoint(|hub, id| {
            if peer == id {
                return Err(TransportError::InvalidDescription(
                    "remote description is our own".into(),
                ));
            }
            let peer_tracks: Vec<MediaTrack> = hub
                .endpoints
                .get(&peer)
                .map(|p| {
                    p.tracks
                        .iter()
                        .map(|t| MediaTrack::remote(t.kind(), format!("peer {}", t.kind().as_str())))
                        .collect()
                })
                .unwrap_or_default();
            let Some(e) = hub.endpoints.get_mut(&id) else {
                return Err(TransportError::Closed);
            };
            if e.remote.is_some() {
                return Err(TransportError::InvalidState("remote description already set"));
            }
            e.remote = Some(desc);
            e.peer = Some(peer);
            for track in peer_tracks {
                let _ = e.events.send(TransportEvent::RemoteTrack(track));
            }
            if e.local.is_some() {
                e.set_status(ConnectionStatus::Connecting);
            }
            hub.evaluate(id);
            Ok(())
        })
    }

    async fn add_candidate(&self, candidate: ConnectivityCandidate) -> Result<(), TransportError> {
        self.with_endpoint(|hub, id| {
            let Some(e) = hub.endpoints.get_mut(&id) else {
                return Err(TransportError::Closed);
            };
            if e.remote.is_none() {
                e.rejected += 1;
                tracing::debug!(
                    "Loopback transport {} refused candidate #{} before the remote description",
                    id,
                    e.rejected
                );
                return Err(TransportError::NoRemoteDescription);
            }
            ice::parse_candidate(&candidate.candidate)
                .map_err(|err| TransportError::MalformedCandidate(err.to_string()))?;
            e.applied.push(candidate);
            hub.evaluate(id);
            Ok(())
        })
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.network
            .hub()
            .endpoints
            .get(&self.id)
            .map(|e| e.status)
            .unwrap_or(ConnectionStatus::Closed)
    }

    async fn close(&self) {
        let mut hub = self.network.hub();
        let peer = match hub.endpoints.get_mut(&self.id) {
            Some(e) if !e.is_closed() => {
                e.set_status(ConnectionStatus::Closed);
                e.peer
            }
            _ => return,
        };
        tracing::debug!("Loopback transport {} closed", self.id);
        if let Some(p) = peer.and_then(|p| hub.endpoints.get_mut(&p)) {
            if p.status == ConnectionStatus::Connected {
                p.set_status(ConnectionStatus::Disconnected);
            }
        }
    }
}
