//! Signaling relay client
//!
//! The relay is a shared, subscribable document store used only to ferry
//! signaling between two parties who cannot talk directly yet. It holds one
//! call document per call plus two append-only candidate collections (one
//! per side). It has no business logic and never retries: write failures are
//! returned to the caller, who owns the retry policy.

pub mod memory;
pub mod protocol;
pub mod server;
pub mod websocket;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::models::{
    CallId, CallRecord, CallStatus, ConnectivityCandidate, NewCall, SessionDescription, Side,
    UserId, UserProfile,
};

pub use memory::MemoryRelay;
pub use websocket::RelayClient;

/// Errors reported by relay operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RelayError {
    #[error("call {0} not found")]
    NotFound(CallId),
    #[error("call {0} already reached a terminal status")]
    Terminal(CallId),
    #[error("relay unavailable: {0}")]
    Unavailable(String),
    #[error("relay protocol error: {0}")]
    Protocol(String),
}

pub type RelayResult<T> = std::result::Result<T, RelayError>;

/// Transport abstraction over the relay document store.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// Create a call document with status `ringing`; returns its id.
    async fn create_call(&self, call: NewCall) -> RelayResult<CallId>;

    /// Read the current state of a call document.
    async fn get_call(&self, id: &CallId) -> RelayResult<Option<CallRecord>>;

    async fn update_status(&self, id: &CallId, status: CallStatus) -> RelayResult<()>;

    async fn write_offer(&self, id: &CallId, offer: SessionDescription) -> RelayResult<()>;

    async fn write_answer(&self, id: &CallId, answer: SessionDescription) -> RelayResult<()>;

    /// Append to `side`'s candidate collection.
    async fn append_candidate(
        &self,
        id: &CallId,
        side: Side,
        candidate: ConnectivityCandidate,
    ) -> RelayResult<()>;

    /// Current document followed by every change to it.
    async fn subscribe_call(&self, id: &CallId) -> RelayResult<Subscription<CallRecord>>;

    /// Every candidate in `side`'s collection, existing ones first.
    async fn subscribe_candidates(
        &self,
        id: &CallId,
        side: Side,
    ) -> RelayResult<Subscription<ConnectivityCandidate>>;

    /// Ringing calls addressed to `receiver`, as they appear.
    async fn subscribe_incoming(&self, receiver: &UserId) -> RelayResult<Subscription<CallRecord>>;

    async fn put_profile(&self, profile: UserProfile) -> RelayResult<()>;

    async fn get_profile(&self, id: &UserId) -> RelayResult<Option<UserProfile>>;
}

type CancelFn = Box<dyn FnOnce() + Send>;

/// A live relay subscription.
///
/// Events arrive in relay order until the subscription is dropped or
/// explicitly unsubscribed. `recv` returns `None` once the relay side closes.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    cancel: Option<CancelFn>,
}

impl<T> Subscription<T> {
    /// Wrap a receiver; `cancel` runs exactly once when the subscription ends.
    pub fn new(rx: mpsc::UnboundedReceiver<T>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Non-suspending receive, for draining already-delivered events.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    #[cfg(test)]
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_subscription_cancels_once() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        let counter = Arc::clone(&cancelled);
        let mut sub = Subscription::new(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tx.send(1u32).unwrap();
        assert_eq!(sub.recv().await, Some(1));

        sub.unsubscribe();
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_cancels_on_drop() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let (_tx, rx) = mpsc::unbounded_channel::<u32>();
        let counter = Arc::clone(&cancelled);
        {
            let _sub = Subscription::new(rx, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }
}
