//! Relay client over a WebSocket connection to `relay::server`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::protocol::{ClientFrame, RelayEvent, RelayReply, RelayRequest, ServerFrame};
use super::{RelayError, RelayResult, SignalingRelay, Subscription};
use crate::models::{
    CallId, CallRecord, CallStatus, ConnectivityCandidate, NewCall, SessionDescription, Side,
    UserId, UserProfile,
};

/// Where events for one subscription are delivered.
enum SubSink {
    Call(mpsc::UnboundedSender<CallRecord>),
    Candidate(mpsc::UnboundedSender<ConnectivityCandidate>),
}

#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<RelayResult<RelayReply>>>>,
    subs: Mutex<HashMap<u64, SubSink>>,
}

impl Shared {
    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<RelayResult<RelayReply>>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn subs(&self) -> std::sync::MutexGuard<'_, HashMap<u64, SubSink>> {
        self.subs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail every in-flight request and close every subscription.
    fn shut_down(&self, reason: &str) {
        for (_, tx) in self.pending().drain() {
            let _ = tx.send(Err(RelayError::Unavailable(reason.to_string())));
        }
        self.subs().clear();
    }

    fn dispatch(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Reply { id, ok, error } => {
                let Some(tx) = self.pending().remove(&id) else {
                    tracing::debug!("relay reply for unknown request {}", id);
                    return;
                };
                let result = match (ok, error) {
                    (_, Some(e)) => Err(e.into()),
                    (Some(reply), None) => Ok(reply),
                    (None, None) => Err(RelayError::Protocol("empty reply".into())),
                };
                let _ = tx.send(result);
            }
            ServerFrame::Event { sub, event } => {
                let mut subs = self.subs();
                let delivered = match (subs.get(&sub), event) {
                    (Some(SubSink::Call(tx)), RelayEvent::Call { call }) => tx.send(call).is_ok(),
                    (Some(SubSink::Candidate(tx)), RelayEvent::Candidate { candidate }) => {
                        tx.send(candidate).is_ok()
                    }
                    (Some(_), other) => {
                        tracing::warn!("relay event kind mismatch on sub {}: {:?}", sub, other);
                        true
                    }
                    (None, _) => true,
                };
                if !delivered {
                    subs.remove(&sub);
                }
            }
        }
    }
}

/// `SignalingRelay` backed by a remote relay server.
///
/// Cloning yields another handle on the same connection.
#[derive(Clone)]
pub struct RelayClient {
    out: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
    next_id: Arc<AtomicU64>,
}

impl RelayClient {
    /// Connect to a relay server at `url` (`ws://` or `wss://`).
    pub async fn connect(url: &str) -> Result<Self> {
        let url = url
            .replace("https://", "wss://")
            .replace("http://", "ws://");

        tracing::info!("Connecting to relay at {}", url);

        let (stream, response) = connect_async(url.as_str())
            .await
            .context("Relay WebSocket connection failed")?;

        tracing::info!("Relay connected (status={})", response.status());

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let shared = Arc::new(Shared::default());

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    tracing::warn!("Relay send failed: {:#}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_shared = Arc::clone(&shared);
        let pong_tx = out_tx.clone();
        tokio::spawn(async move {
            let reason = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        tracing::trace!("relay recv: {}", text);
                        match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(frame) => reader_shared.dispatch(frame),
                            Err(e) => tracing::warn!("Unparseable relay frame: {} ({})", text, e),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = pong_tx.send(Message::Pong(data));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!("Relay closed: {:?}", frame);
                        break "relay closed the connection";
                    }
                    Some(Ok(other)) => {
                        tracing::debug!("Relay frame (ignored): {:?}", other);
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Relay receive error: {:#}", e);
                        break "relay connection error";
                    }
                    None => break "relay connection ended",
                }
            };
            reader_shared.shut_down(reason);
        });

        Ok(Self {
            out: out_tx,
            shared,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    fn send_frame(&self, frame: &ClientFrame) -> RelayResult<()> {
        let text =
            serde_json::to_string(frame).map_err(|e| RelayError::Protocol(e.to_string()))?;
        tracing::trace!("relay send: {}", text);
        self.out
            .send(Message::Text(text))
            .map_err(|_| RelayError::Unavailable("relay connection closed".into()))
    }

    async fn request(&self, request: RelayRequest) -> RelayResult<RelayReply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id, tx);

        if let Err(e) = self.send_frame(&ClientFrame::Request { id, request }) {
            self.shared.pending().remove(&id);
            return Err(e);
        }

        rx.await
            .unwrap_or_else(|_| Err(RelayError::Unavailable("relay connection closed".into())))
    }

    async fn expect_done(&self, request: RelayRequest) -> RelayResult<()> {
        match self.request(request).await? {
            RelayReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Register a sink, then ask the server to start feeding it.
    async fn subscribe<T: Send + 'static>(
        &self,
        wrap: impl FnOnce(mpsc::UnboundedSender<T>) -> SubSink,
        request: impl FnOnce(u64) -> RelayRequest,
    ) -> RelayResult<Subscription<T>> {
        let sub = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subs().insert(sub, wrap(tx));

        if let Err(e) = self.expect_done(request(sub)).await {
            self.shared.subs().remove(&sub);
            return Err(e);
        }

        let shared = Arc::clone(&self.shared);
        let out = self.out.clone();
        Ok(Subscription::new(rx, move || {
            shared.subs().remove(&sub);
            if let Ok(text) = serde_json::to_string(&ClientFrame::Unsubscribe { sub }) {
                let _ = out.send(Message::Text(text));
            }
        }))
    }
}

fn unexpected(reply: RelayReply) -> RelayError {
    RelayError::Protocol(format!("unexpected reply: {:?}", reply))
}

#[async_trait]
impl SignalingRelay for RelayClient {
    async fn create_call(&self, call: NewCall) -> RelayResult<CallId> {
        match self.request(RelayRequest::CreateCall { call }).await? {
            RelayReply::Created { call_id } => Ok(call_id),
            other => Err(unexpected(other)),
        }
    }

    async fn get_call(&self, id: &CallId) -> RelayResult<Option<CallRecord>> {
        match self
            .request(RelayRequest::GetCall {
                call_id: id.clone(),
            })
            .await?
        {
            RelayReply::Call { call } => Ok(call),
            other => Err(unexpected(other)),
        }
    }

    async fn update_status(&self, id: &CallId, status: CallStatus) -> RelayResult<()> {
        self.expect_done(RelayRequest::UpdateStatus {
            call_id: id.clone(),
            status,
        })
        .await
    }

    async fn write_offer(&self, id: &CallId, offer: SessionDescription) -> RelayResult<()> {
        self.expect_done(RelayRequest::WriteOffer {
            call_id: id.clone(),
            offer,
        })
        .await
    }

    async fn write_answer(&self, id: &CallId, answer: SessionDescription) -> RelayResult<()> {
        self.expect_done(RelayRequest::WriteAnswer {
            call_id: id.clone(),
            answer,
        })
        .await
    }

    async fn append_candidate(
        &self,
        id: &CallId,
        side: Side,
        candidate: ConnectivityCandidate,
    ) -> RelayResult<()> {
        self.expect_done(RelayRequest::AppendCandidate {
            call_id: id.clone(),
            side,
            candidate,
        })
        .await
    }

    async fn subscribe_call(&self, id: &CallId) -> RelayResult<Subscription<CallRecord>> {
        let call_id = id.clone();
        self.subscribe(SubSink::Call, move |sub| RelayRequest::SubscribeCall {
            sub,
            call_id,
        })
        .await
    }

    async fn subscribe_candidates(
        &self,
        id: &CallId,
        side: Side,
    ) -> RelayResult<Subscription<ConnectivityCandidate>> {
        let call_id = id.clone();
        self.subscribe(SubSink::Candidate, move |sub| {
            RelayRequest::SubscribeCandidates { sub, call_id, side }
        })
        .await
    }

    async fn subscribe_incoming(&self, receiver: &UserId) -> RelayResult<Subscription<CallRecord>> {
        let receiver_id = receiver.clone();
        self.subscribe(SubSink::Call, move |sub| RelayRequest::SubscribeIncoming {
            sub,
            receiver_id,
        })
        .await
    }

    async fn put_profile(&self, profile: UserProfile) -> RelayResult<()> {
        self.expect_done(RelayRequest::PutProfile { profile }).await
    }

    async fn get_profile(&self, id: &UserId) -> RelayResult<Option<UserProfile>> {
        match self
            .request(RelayRequest::GetProfile {
                user_id: id.clone(),
            })
            .await?
        {
            RelayReply::Profile { profile } => Ok(profile),
            other => Err(unexpected(other)),
        }
    }
}
