//! Negotiation seam between the call engine and a media transport.
//!
//! A transport speaks offer/answer plus trickled candidates and reports its
//! connectivity state. Everything it wants to tell the engine arrives on the
//! event channel returned by `TransportFactory::create`.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::calling::ice::IceServer;
use crate::calling::media::MediaTrack;
use crate::models::{ConnectivityCandidate, SessionDescription};

/// Transport connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::New => "new",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Failed => "failed",
            ConnectionStatus::Closed => "closed",
        }
    }

    /// States from which only a reconnect (or teardown) can recover.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ConnectionStatus::Disconnected | ConnectionStatus::Failed)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("remote description not set")]
    NoRemoteDescription,
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("malformed candidate: {0}")]
    MalformedCandidate(String),
    #[error("operation not valid in current signaling state: {0}")]
    InvalidState(&'static str),
    #[error("transport closed")]
    Closed,
    #[error("transport backend error: {0}")]
    Backend(String),
}

/// Something the transport reports asynchronously.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(ConnectivityCandidate),
    RemoteTrack(MediaTrack),
    StatusChanged(ConnectionStatus),
}

/// A live two-party negotiated transport.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: MediaTrack) -> Result<(), TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Requires a remote offer.
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    /// Fails with `NoRemoteDescription` until a remote description is set.
    async fn add_candidate(&self, candidate: ConnectivityCandidate) -> Result<(), TransportError>;

    fn connection_status(&self) -> ConnectionStatus;

    async fn close(&self);
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Builds one transport per negotiated call.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), TransportError>;
}

/// Holds peer candidates back until the remote description is set.
///
/// Duplicate deliveries (relay replays) are recognised by candidate string
/// and dropped.
#[derive(Debug, Default)]
pub struct CandidateGate {
    open: bool,
    pending: Vec<ConnectivityCandidate>,
    seen: HashSet<String>,
}

impl CandidateGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a delivered candidate. Returns it if it may be applied now.
    pub fn admit(&mut self, candidate: ConnectivityCandidate) -> Option<ConnectivityCandidate> {
        if !self.seen.insert(candidate.candidate.clone()) {
            tracing::debug!("Dropping duplicate candidate: {}", candidate.candidate);
            return None;
        }
        if self.open {
            Some(candidate)
        } else {
            self.pending.push(candidate);
            None
        }
    }

    /// Mark the remote description as set; returns the buffered candidates in
    /// delivery order.
    pub fn open(&mut self) -> Vec<ConnectivityCandidate> {
        self.open = true;
        std::mem::take(&mut self.pending)
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.open
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Distinct candidates delivered so far.
    #[cfg(test)]
    pub fn delivered(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(s: &str) -> ConnectivityCandidate {
        ConnectivityCandidate::new(s)
    }

    #[test]
    fn test_gate_buffers_until_open() {
        let mut gate = CandidateGate::new();
        assert!(gate.admit(cand("candidate:a")).is_none());
        assert!(gate.admit(cand("candidate:b")).is_none());
        assert_eq!(gate.pending(), 2);

        let flushed = gate.open();
        let names: Vec<_> = flushed.iter().map(|c| c.candidate.as_str()).collect();
        assert_eq!(names, vec!["candidate:a", "candidate:b"]);
        assert_eq!(gate.pending(), 0);

        assert_eq!(
            gate.admit(cand("candidate:c")).map(|c| c.candidate),
            Some("candidate:c".to_string())
        );
        assert_eq!(gate.delivered(), 3);
    }

    #[test]
    fn test_gate_drops_duplicates() {
        let mut gate = CandidateGate::new();
        gate.admit(cand("candidate:a"));
        gate.admit(cand("candidate:a"));
        assert_eq!(gate.open().len(), 1);
        assert!(gate.admit(cand("candidate:a")).is_none());
        assert_eq!(gate.delivered(), 1);
    }

    #[test]
    fn test_interrupted_states() {
        assert!(ConnectionStatus::Disconnected.is_interrupted());
        assert!(ConnectionStatus::Failed.is_interrupted());
        assert!(!ConnectionStatus::Connected.is_interrupted());
        assert!(!ConnectionStatus::Closed.is_interrupted());
    }
}
