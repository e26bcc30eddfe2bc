//! WebSocket relay server hosting a `MemoryRelay` for remote clients.

use std::collections::HashMap;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::memory::MemoryRelay;
use super::protocol::{ClientFrame, RelayEvent, RelayReply, RelayRequest, ServerFrame};
use super::{RelayResult, SignalingRelay, Subscription};

/// Bind `listen` and serve relay clients until the task is cancelled.
pub async fn serve(listen: &str, relay: MemoryRelay) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind relay on {}", listen))?;
    tracing::info!("Relay listening on {}", listener.local_addr()?);
    serve_listener(listener, relay).await
}

/// Serve relay clients on an already-bound listener.
pub async fn serve_listener(listener: TcpListener, relay: MemoryRelay) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("Relay accept failed")?;
        let relay = relay.clone();
        tokio::spawn(async move {
            tracing::info!("Relay client connected: {}", peer);
            match handle_connection(stream, relay).await {
                Ok(()) => tracing::info!("Relay client disconnected: {}", peer),
                Err(e) => tracing::warn!("Relay client {} failed: {:#}", peer, e),
            }
        });
    }
}

fn encode(frame: &ServerFrame) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(Message::Text(text)),
        Err(e) => {
            tracing::error!("Failed to encode relay frame: {}", e);
            None
        }
    }
}

async fn handle_connection(stream: TcpStream, relay: MemoryRelay) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .context("WebSocket handshake failed")?;
    let (mut sink, mut source) = ws.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut forwarders: HashMap<u64, JoinHandle<()>> = HashMap::new();

    while let Some(msg) = source.next().await {
        match msg.context("Relay receive error")? {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Request { id, request }) => {
                    let result = execute(&relay, request, &out_tx, &mut forwarders).await;
                    if let Some(reply) = encode(&ServerFrame::reply(id, result)) {
                        let _ = out_tx.send(reply);
                    }
                }
                Ok(ClientFrame::Unsubscribe { sub }) => {
                    if let Some(handle) = forwarders.remove(&sub) {
                        handle.abort();
                    }
                }
                Err(e) => tracing::warn!("Bad client frame: {} ({})", text, e),
            },
            Message::Ping(data) => {
                let _ = out_tx.send(Message::Pong(data));
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    for (_, handle) in forwarders.drain() {
        handle.abort();
    }
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

/// Pump a relay subscription into event frames for one client.
fn forward<T: Send + 'static>(
    mut subscription: Subscription<T>,
    sub: u64,
    out: mpsc::UnboundedSender<Message>,
    wrap: fn(T) -> RelayEvent,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = subscription.recv().await {
            let Some(msg) = encode(&ServerFrame::Event {
                sub,
                event: wrap(item),
            }) else {
                continue;
            };
            if out.send(msg).is_err() {
                break;
            }
        }
    })
}

async fn execute(
    relay: &MemoryRelay,
    request: RelayRequest,
    out: &mpsc::UnboundedSender<Message>,
    forwarders: &mut HashMap<u64, JoinHandle<()>>,
) -> RelayResult<RelayReply> {
    match request {
        RelayRequest::CreateCall { call } => {
            let call_id = relay.create_call(call).await?;
            Ok(RelayReply::Created { call_id })
        }
        RelayRequest::GetCall { call_id } => {
            let call = relay.get_call(&call_id).await?;
            Ok(RelayReply::Call { call })
        }
        RelayRequest::UpdateStatus { call_id, status } => {
            relay.update_status(&call_id, status).await?;
            Ok(RelayReply::Done)
        }
        RelayRequest::WriteOffer { call_id, offer } => {
            relay.write_offer(&call_id, offer).await?;
            Ok(RelayReply::Done)
        }
        RelayRequest::WriteAnswer { call_id, answer } => {
            relay.write_answer(&call_id, answer).await?;
            Ok(RelayReply::Done)
        }
        RelayRequest::AppendCandidate {
            call_id,
            side,
            candidate,
        } => {
            relay.append_candidate(&call_id, side, candidate).await?;
            Ok(RelayReply::Done)
        }
        RelayRequest::SubscribeCall { sub, call_id } => {
            let subscription = relay.subscribe_call(&call_id).await?;
            let handle = forward(subscription, sub, out.clone(), |call| RelayEvent::Call {
                call,
            });
            forwarders.insert(sub, handle);
            Ok(RelayReply::Done)
        }
        RelayRequest::SubscribeCandidates { sub, call_id, side } => {
            let subscription = relay.subscribe_candidates(&call_id, side).await?;
            let handle = forward(subscription, sub, out.clone(), |candidate| {
                RelayEvent::Candidate { candidate }
            });
            forwarders.insert(sub, handle);
            Ok(RelayReply::Done)
        }
        RelayRequest::SubscribeIncoming { sub, receiver_id } => {
            let subscription = relay.subscribe_incoming(&receiver_id).await?;
            let handle = forward(subscription, sub, out.clone(), |call| RelayEvent::Call {
                call,
            });
            forwarders.insert(sub, handle);
            Ok(RelayReply::Done)
        }
        RelayRequest::PutProfile { profile } => {
            relay.put_profile(profile).await?;
            Ok(RelayReply::Done)
        }
        RelayRequest::GetProfile { user_id } => {
            let profile = relay.get_profile(&user_id).await?;
            Ok(RelayReply::Profile { profile })
        }
    }
}
