//! In-process relay document store.
//!
//! Backs the relay server and the in-process demo. Subscriptions get the
//! current state on subscribe and every later change, in write order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{RelayError, RelayResult, SignalingRelay, Subscription};
use crate::models::{
    CallId, CallRecord, CallStatus, ConnectivityCandidate, NewCall, SessionDescription, Side,
    UserId, UserProfile,
};

/// One accepted write, kept per call for inspection.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayWrite {
    Created,
    Status(CallStatus),
    Offer,
    Answer,
    Candidate(Side),
}

struct CallDoc {
    record: CallRecord,
    caller_candidates: Vec<ConnectivityCandidate>,
    callee_candidates: Vec<ConnectivityCandidate>,
    log: Vec<RelayWrite>,
    rejected: usize,
}

impl CallDoc {
    fn candidates(&self, side: Side) -> &Vec<ConnectivityCandidate> {
        match side {
            Side::Caller => &self.caller_candidates,
            Side::Callee => &self.callee_candidates,
        }
    }

    fn candidates_mut(&mut self, side: Side) -> &mut Vec<ConnectivityCandidate> {
        match side {
            Side::Caller => &mut self.caller_candidates,
            Side::Callee => &mut self.callee_candidates,
        }
    }
}

struct Watch<K, T> {
    id: u64,
    key: K,
    tx: mpsc::UnboundedSender<T>,
}

#[derive(Default)]
struct RelayState {
    calls: HashMap<CallId, CallDoc>,
    profiles: HashMap<UserId, UserProfile>,
    call_watches: Vec<Watch<CallId, CallRecord>>,
    candidate_watches: Vec<Watch<(CallId, Side), ConnectivityCandidate>>,
    incoming_watches: Vec<Watch<UserId, CallRecord>>,
    next_watch_id: u64,
    offline: bool,
}

impl RelayState {
    fn next_id(&mut self) -> u64 {
        self.next_watch_id += 1;
        self.next_watch_id
    }

    fn check_online(&self) -> RelayResult<()> {
        if self.offline {
            return Err(RelayError::Unavailable("relay is offline".into()));
        }
        Ok(())
    }

    /// Fetch a call for mutation, refusing terminal documents.
    fn mutable_call(&mut self, id: &CallId) -> RelayResult<&mut CallDoc> {
        let doc = self
            .calls
            .get_mut(id)
            .ok_or_else(|| RelayError::NotFound(id.clone()))?;
        if doc.record.status.is_terminal() {
            doc.rejected += 1;
            tracing::debug!("Refused write #{} to finished call {}", doc.rejected, id);
            return Err(RelayError::Terminal(id.clone()));
        }
        Ok(doc)
    }

    fn publish_call(&mut self, id: &CallId) {
        let Some(doc) = self.calls.get(id) else {
            return;
        };
        let record = doc.record.clone();
        self.call_watches
            .retain(|w| w.key != *id || w.tx.send(record.clone()).is_ok());
    }

    fn remove_watch(&mut self, watch_id: u64) {
        self.call_watches.retain(|w| w.id != watch_id);
        self.candidate_watches.retain(|w| w.id != watch_id);
        self.incoming_watches.retain(|w| w.id != watch_id);
    }
}

/// Shared in-memory relay. Cloning yields another handle to the same store.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RelayState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn canceller(&self, watch_id: u64) -> impl FnOnce() + Send + 'static {
        let weak: Weak<Mutex<RelayState>> = Arc::downgrade(&self.inner);
        move || {
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.lock().unwrap_or_else(|e| e.into_inner());
                state.remove_watch(watch_id);
            }
        }
    }

    /// Simulate losing the network: every write fails until restored.
    #[cfg(test)]
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Snapshot of a call document.
    #[cfg(test)]
    pub fn call(&self, id: &str) -> Option<CallRecord> {
        self.state().calls.get(id).map(|d| d.record.clone())
    }

    /// Every accepted write for a call, oldest first.
    pub fn history(&self, id: &str) -> Vec<RelayWrite> {
        self.state()
            .calls
            .get(id)
            .map(|d| d.log.clone())
            .unwrap_or_default()
    }

    /// Writes refused because the call had already ended.
    #[cfg(test)]
    pub fn rejected_writes(&self, id: &str) -> usize {
        self.state().calls.get(id).map(|d| d.rejected).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn candidates(&self, id: &str, side: Side) -> Vec<ConnectivityCandidate> {
        self.state()
            .calls
            .get(id)
            .map(|d| d.candidates(side).clone())
            .unwrap_or_default()
    }

    /// All calls involving `user`, newest last.
    #[cfg(test)]
    pub fn calls_for(&self, user: &str) -> Vec<CallRecord> {
        let mut calls: Vec<CallRecord> = self
            .state()
            .calls
            .values()
            .filter(|d| d.record.caller_id == user || d.record.receiver_id == user)
            .map(|d| d.record.clone())
            .collect();
        calls.sort_by_key(|r| r.created_at);
        calls
    }

    /// Number of live subscriptions of any kind.
    #[cfg(test)]
    pub fn subscription_count(&self) -> usize {
        let state = self.state();
        state.call_watches.len() + state.candidate_watches.len() + state.incoming_watches.len()
    }

    /// Simulate the relay connection dropping: every open feed ends.
    #[cfg(test)]
    pub fn drop_subscribers(&self) {
        let mut state = self.state();
        state.call_watches.clear();
        state.candidate_watches.clear();
        state.incoming_watches.clear();
    }
}

#[async_trait]
impl SignalingRelay for MemoryRelay {
    async fn create_call(&self, call: NewCall) -> RelayResult<CallId> {
        let mut state = self.state();
        state.check_online()?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let record = CallRecord::from_new(id.clone(), call);
        tracing::debug!(
            "relay: created call {} ({} -> {}, {})",
            id,
            record.caller_id,
            record.receiver_id,
            record.call_type
        );

        let receiver = record.receiver_id.clone();
        state
            .incoming_watches
            .retain(|w| w.key != receiver || w.tx.send(record.clone()).is_ok());
        state.calls.insert(
            id.clone(),
            CallDoc {
                record,
                caller_candidates: Vec::new(),
                callee_candidates: Vec::new(),
                log: vec![RelayWrite::Created],
                rejected: 0,
            },
        );
        Ok(id)
    }

    async fn get_call(&self, id: &CallId) -> RelayResult<Option<CallRecord>> {
        let state = self.state();
        state.check_online()?;
        Ok(state.calls.get(id).map(|d| d.record.clone()))
    }

    async fn update_status(&self, id: &CallId, status: CallStatus) -> RelayResult<()> {
        let mut state = self.state();
        state.check_online()?;
        let doc = state.mutable_call(id)?;
        doc.record.status = status;
        doc.log.push(RelayWrite::Status(status));
        tracing::debug!("relay: call {} -> {}", id, status);
        state.publish_call(id);
        Ok(())
    }

    async fn write_offer(&self, id: &CallId, offer: SessionDescription) -> RelayResult<()> {
        let mut state = self.state();
        state.check_online()?;
        let doc = state.mutable_call(id)?;
        doc.record.offer = Some(offer);
        doc.log.push(RelayWrite::Offer);
        state.publish_call(id);
        Ok(())
    }

    async fn write_answer(&self, id: &CallId, answer: SessionDescription) -> RelayResult<()> {
        let mut state = self.state();
        state.check_online()?;
        let doc = state.mutable_call(id)?;
        doc.record.answer = Some(answer);
        doc.log.push(RelayWrite::Answer);
        state.publish_call(id);
        Ok(())
    }

    async fn append_candidate(
        &self,
        id: &CallId,
        side: Side,
        candidate: ConnectivityCandidate,
    ) -> RelayResult<()> {
        let mut state = self.state();
        state.check_online()?;
        let doc = state.mutable_call(id)?;
        doc.candidates_mut(side).push(candidate.clone());
        doc.log.push(RelayWrite::Candidate(side));

        let key = (id.clone(), side);
        state
            .candidate_watches
            .retain(|w| w.key != key || w.tx.send(candidate.clone()).is_ok());
        Ok(())
    }

    async fn subscribe_call(&self, id: &CallId) -> RelayResult<Subscription<CallRecord>> {
        let (watch_id, rx) = {
            let mut state = self.state();
            let record = state
                .calls
                .get(id)
                .map(|d| d.record.clone())
                .ok_or_else(|| RelayError::NotFound(id.clone()))?;
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(record);
            let watch_id = state.next_id();
            state.call_watches.push(Watch {
                id: watch_id,
                key: id.clone(),
                tx,
            });
            (watch_id, rx)
        };
        Ok(Subscription::new(rx, self.canceller(watch_id)))
    }

    async fn subscribe_candidates(
        &self,
        id: &CallId,
        side: Side,
    ) -> RelayResult<Subscription<ConnectivityCandidate>> {
        let (watch_id, rx) = {
            let mut state = self.state();
            let existing = state
                .calls
                .get(id)
                .map(|d| d.candidates(side).clone())
                .ok_or_else(|| RelayError::NotFound(id.clone()))?;
            let (tx, rx) = mpsc::unbounded_channel();
            for c in existing {
                let _ = tx.send(c);
            }
            let watch_id = state.next_id();
            state.candidate_watches.push(Watch {
                id: watch_id,
                key: (id.clone(), side),
                tx,
            });
            (watch_id, rx)
        };
        Ok(Subscription::new(rx, self.canceller(watch_id)))
    }

    async fn subscribe_incoming(&self, receiver: &UserId) -> RelayResult<Subscription<CallRecord>> {
        let (watch_id, rx) = {
            let mut state = self.state();
            let (tx, rx) = mpsc::unbounded_channel();
            let mut ringing: Vec<CallRecord> = state
                .calls
                .values()
                .filter(|d| d.record.receiver_id == *receiver)
                .filter(|d| d.record.status == CallStatus::Ringing)
                .map(|d| d.record.clone())
                .collect();
            ringing.sort_by_key(|r| r.created_at);
            for record in ringing {
                let _ = tx.send(record);
            }
            let watch_id = state.next_id();
            state.incoming_watches.push(Watch {
                id: watch_id,
                key: receiver.clone(),
                tx,
            });
            (watch_id, rx)
        };
        Ok(Subscription::new(rx, self.canceller(watch_id)))
    }

    async fn put_profile(&self, profile: UserProfile) -> RelayResult<()> {
        let mut state = self.state();
        state.check_online()?;
        state.profiles.insert(profile.id.clone(), profile);
        Ok(())
    }

    async fn get_profile(&self, id: &UserId) -> RelayResult<Option<UserProfile>> {
        let state = self.state();
        state.check_online()?;
        Ok(state.profiles.get(id).cloned())
    }
}
