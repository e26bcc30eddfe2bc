//! Call document models shared with the signaling relay

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UserId;

/// Opaque relay-assigned call identifier.
pub type CallId = String;

/// Media requested for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Audio => "audio",
            CallType::Video => "video",
        }
    }

    pub fn wants_video(&self) -> bool {
        matches!(self, CallType::Video)
    }
}

impl std::fmt::Display for CallType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable call status as stored in the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Answered,
    Declined,
    Ended,
}

impl CallStatus {
    /// `Declined` and `Ended` never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Declined | CallStatus::Ended)
    }

    /// Ringing or answered: the call still occupies both participants.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Answered => "answered",
            CallStatus::Declined => "declined",
            CallStatus::Ended => "ended",
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Offer or answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description exchanged during offer/answer negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled connectivity candidate, in the shape browsers exchange them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityCandidate {
    /// `candidate:...` attribute line (without the `a=` prefix).
    pub candidate: String,
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
}

impl ConnectivityCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }
}

/// Which participant wrote a candidate collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Caller,
    Callee,
}

impl Side {
    pub fn peer(&self) -> Side {
        match self {
            Side::Caller => Side::Callee,
            Side::Callee => Side::Caller,
        }
    }
}

/// Fields the caller supplies when creating a call record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCall {
    pub caller_id: UserId,
    pub caller_name: String,
    #[serde(rename = "callerPhotoURL")]
    pub caller_photo_url: Option<String>,
    pub receiver_id: UserId,
    pub call_type: CallType,
}

/// The call document: single source of truth for a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: CallId,
    pub caller_id: UserId,
    pub caller_name: String,
    #[serde(rename = "callerPhotoURL")]
    pub caller_photo_url: Option<String>,
    pub receiver_id: UserId,
    pub call_type: CallType,
    pub status: CallStatus,
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
    pub created_at: DateTime<Utc>,
}

impl CallRecord {
    /// Materialize a freshly created record with status `ringing`.
    pub fn from_new(id: CallId, new: NewCall) -> Self {
        Self {
            id,
            caller_id: new.caller_id,
            caller_name: new.caller_name,
            caller_photo_url: new.caller_photo_url,
            receiver_id: new.receiver_id,
            call_type: new.call_type,
            status: CallStatus::Ringing,
            offer: None,
            answer: None,
            created_at: Utc::now(),
        }
    }

    /// The side `user_id` plays in this call, if they participate at all.
    pub fn side_of(&self, user_id: &str) -> Option<Side> {
        if self.caller_id == user_id {
            Some(Side::Caller)
        } else if self.receiver_id == user_id {
            Some(Side::Callee)
        } else {
            None
        }
    }
}
