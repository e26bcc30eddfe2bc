//! `PeerTransport` over the `webrtc` crate.
//!
//! Tracks are negotiated as Opus/VP8 `TrackLocalStaticRTP`s. Capture and
//! encoding are left to whoever writes RTP into them.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use crate::calling::ice::IceServer;
use crate::calling::media::{MediaTrack, TrackKind};
use crate::calling::transport::{
    ConnectionStatus, PeerTransport, TransportError, TransportEvent, TransportEvents,
    TransportFactory,
};
use crate::models::{ConnectivityCandidate, SdpKind, SessionDescription};

fn backend(e: webrtc::Error) -> TransportError {
    TransportError::Backend(e.to_string())
}

fn from_rtc_state(state: RTCPeerConnectionState) -> ConnectionStatus {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionStatus::Connecting,
        RTCPeerConnectionState::Connected => ConnectionStatus::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionStatus::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionStatus::Failed,
        RTCPeerConnectionState::Closed => ConnectionStatus::Closed,
        _ => ConnectionStatus::New,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let converted = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    converted.map_err(|e| TransportError::InvalidDescription(e.to_string()))
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(TransportError::InvalidDescription(format!(
            "unexpected description type {}",
            other
        ))),
    }
}

/// Builds one `RTCPeerConnection` per call.
pub struct RtcTransportFactory {
    api: API,
}

impl RtcTransportFactory {
    pub fn new() -> Result<Self, TransportError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(backend)?;
        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(backend)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), TransportError> {
        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await.map_err(backend)?);
        let (events_tx, events) = mpsc::unbounded_channel();

        let tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(ConnectivityCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let tx = events_tx.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    _ => return,
                };
                tracing::debug!("Remote {} track {}", kind.as_str(), track.id());
                let _ = tx.send(TransportEvent::RemoteTrack(MediaTrack::remote(
                    kind,
                    track.stream_id(),
                )));
            })
        }));

        let tx = events_tx;
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(TransportEvent::StatusChanged(from_rtc_state(state)));
            })
        }));

        let transport = RtcTransport {
            pc,
            local_tracks: Mutex::new(Vec::new()),
        };
        Ok((Arc::new(transport), events))
    }
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    local_tracks: Mutex<Vec<Arc<TrackLocalStaticRTP>>>,
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn add_track(&self, track: MediaTrack) -> Result<(), TransportError> {
        let mime_type = match track.kind() {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let local = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_string(),
                ..Default::default()
            },
            track.id().to_string(),
            "peercall".to_string(),
        ));
        self.pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(backend)?;
        self.local_tracks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(local);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(backend)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        if self.pc.remote_description().await.is_none() {
            return Err(TransportError::NoRemoteDescription);
        }
        let answer = self.pc.create_answer(None).await.map_err(backend)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(backend)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(backend)
    }

    async fn add_candidate(&self, candidate: ConnectivityCandidate) -> Result<(), TransportError> {
        if self.pc.remote_description().await.is_none() {
            return Err(TransportError::NoRemoteDescription);
        }
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::MalformedCandidate(e.to_string()))
    }

    fn connection_status(&self) -> ConnectionStatus {
        from_rtc_state(self.pc.connection_state())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
    }
}
