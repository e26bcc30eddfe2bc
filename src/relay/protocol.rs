//! JSON frames exchanged between `RelayClient` and the relay server.
//!
//! Requests carry a client-chosen id echoed in the reply. Subscriptions carry
//! a client-chosen subscription id so events can be routed before the reply
//! to the subscribe request has been processed.

use serde::{Deserialize, Serialize};

use super::RelayError;
use crate::models::{
    CallId, CallRecord, CallStatus, ConnectivityCandidate, NewCall, SessionDescription, Side,
    UserId, UserProfile,
};

/// Frames sent by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ClientFrame {
    Request { id: u64, request: RelayRequest },
    Unsubscribe { sub: u64 },
}

/// One relay operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RelayRequest {
    CreateCall { call: NewCall },
    GetCall { call_id: CallId },
    UpdateStatus { call_id: CallId, status: CallStatus },
    WriteOffer { call_id: CallId, offer: SessionDescription },
    WriteAnswer { call_id: CallId, answer: SessionDescription },
    AppendCandidate { call_id: CallId, side: Side, candidate: ConnectivityCandidate },
    SubscribeCall { sub: u64, call_id: CallId },
    SubscribeCandidates { sub: u64, call_id: CallId, side: Side },
    SubscribeIncoming { sub: u64, receiver_id: UserId },
    PutProfile { profile: UserProfile },
    GetProfile { user_id: UserId },
}

/// Successful reply payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayReply {
    Done,
    Created { call_id: CallId },
    Call { call: Option<CallRecord> },
    Profile { profile: Option<UserProfile> },
}

/// Error payload; mirrors `RelayError` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum WireError {
    NotFound { call_id: CallId },
    Terminal { call_id: CallId },
    Unavailable { message: String },
    Protocol { message: String },
}

impl From<RelayError> for WireError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::NotFound(call_id) => WireError::NotFound { call_id },
            RelayError::Terminal(call_id) => WireError::Terminal { call_id },
            RelayError::Unavailable(message) => WireError::Unavailable { message },
            RelayError::Protocol(message) => WireError::Protocol { message },
        }
    }
}

impl From<WireError> for RelayError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::NotFound { call_id } => RelayError::NotFound(call_id),
            WireError::Terminal { call_id } => RelayError::Terminal(call_id),
            WireError::Unavailable { message } => RelayError::Unavailable(message),
            WireError::Protocol { message } => RelayError::Protocol(message),
        }
    }
}

/// Subscription payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayEvent {
    Call { call: CallRecord },
    Candidate { candidate: ConnectivityCandidate },
}

/// Frames sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ServerFrame {
    Reply {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ok: Option<RelayReply>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },
    Event { sub: u64, event: RelayEvent },
}

impl ServerFrame {
    pub fn reply(id: u64, result: Result<RelayReply, RelayError>) -> Self {
        match result {
            Ok(reply) => ServerFrame::Reply {
                id,
                ok: Some(reply),
                error: None,
            },
            Err(e) => ServerFrame::Reply {
                id,
                ok: None,
                error: Some(e.into()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame_shape() {
        let frame = ClientFrame::Request {
            id: 7,
            request: RelayRequest::UpdateStatus {
                call_id: "c1".into(),
                status: CallStatus::Answered,
            },
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["frame"], "request");
        assert_eq!(json["request"]["op"], "update_status");
        assert_eq!(json["request"]["status"], "answered");
    }

    #[test]
    fn test_error_reply_maps_back_to_relay_error() {
        let frame = ServerFrame::reply(3, Err(RelayError::Terminal("c9".into())));
        let text = serde_json::to_string(&frame).unwrap();
        match serde_json::from_str::<ServerFrame>(&text).unwrap() {
            ServerFrame::Reply {
                id,
                ok: None,
                error: Some(error),
            } => {
                assert_eq!(id, 3);
                assert_eq!(RelayError::from(error), RelayError::Terminal("c9".into()));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}
