//! Call session state machine.
//!
//! One `CallEngine` task owns everything about the single active call: the
//! relay subscriptions, the transport, both media streams and the timers.
//! UI code talks to it through a cloneable `CallHandle` and observes it
//! through a `watch` of `CallSnapshot` plus a broadcast of `Notice`s.
//!
//! Handlers run one at a time inside a single `select!` loop. Work that may
//! wait on the user (permission prompts, device access) runs in spawned
//! tasks whose results are tagged with the call id, so a result that arrives
//! after its call ended is recognised and discarded.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{self, Instant};

use crate::calling::directory::{ActiveCallPointer, SessionDirectory};
use crate::calling::ice::IceServer;
use crate::calling::media::{MediaAccessError, MediaDevices, MediaStream};
use crate::calling::permission::{DenialReason, PermissionGate, PermissionOutcome};
use crate::calling::transport::{
    CandidateGate, ConnectionStatus, PeerTransport, TransportError, TransportEvent,
    TransportEvents, TransportFactory,
};
use crate::models::{
    CallId, CallRecord, CallStatus, CallType, ConnectivityCandidate, SessionDescription, Side,
    UserId, UserProfile,
};
use crate::relay::{RelayError, SignalingRelay, Subscription};

/// Timing and connectivity knobs for the engine.
#[derive(Debug, Clone)]
pub struct CallSettings {
    /// How long a call may ring, on either side, before it is declined.
    pub ring_timeout: Duration,
    /// How long a dropped connection may take to recover.
    pub reconnect_timeout: Duration,
    /// How long `Ended`/`Declined` stays visible before returning to idle.
    pub linger: Duration,
    pub ice_servers: Vec<IceServer>,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(15),
            reconnect_timeout: Duration::from_secs(15),
            linger: Duration::from_secs(3),
            ice_servers: vec![IceServer::default()],
        }
    }
}

/// Lifecycle phase of the local call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallPhase {
    #[default]
    Idle,
    OutgoingRinging,
    IncomingRinging,
    Answered,
    Connecting,
    Connected,
    Ended,
    Declined,
}

impl CallPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallPhase::Idle => "idle",
            CallPhase::OutgoingRinging => "ringing (outgoing)",
            CallPhase::IncomingRinging => "ringing (incoming)",
            CallPhase::Answered => "answered",
            CallPhase::Connecting => "connecting",
            CallPhase::Connected => "connected",
            CallPhase::Ended => "ended",
            CallPhase::Declined => "declined",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallPhase::Ended | CallPhase::Declined)
    }
}

impl std::fmt::Display for CallPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which half of the offer/answer exchange this client performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

impl Role {
    /// Role of `user_id` in `record`, decided by identity alone.
    pub fn for_user(record: &CallRecord, user_id: &str) -> Option<Role> {
        record.side_of(user_id).map(|side| match side {
            Side::Caller => Role::Caller,
            Side::Callee => Role::Callee,
        })
    }

    /// The candidate collection this role writes.
    pub fn side(&self) -> Side {
        match self {
            Role::Caller => Side::Caller,
            Role::Callee => Side::Callee,
        }
    }
}

/// User-facing side channel. Never carries raw errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    NotAnswered { call_id: CallId },
    Missed { call_id: CallId, caller: String },
    PeerDeclined { call_id: CallId },
    PeerEnded { call_id: CallId },
    CallFailed { reason: String },
    /// Show the blocking permission interstitial with a retry button.
    PermissionDenied { call_type: CallType },
    PermissionRestored { call_type: CallType },
    DeviceError,
    /// The relay stopped delivering; the engine has shut down.
    RelayLost,
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notice::NotAnswered { .. } => write!(f, "Not answered"),
            Notice::Missed { caller, .. } => write!(f, "Missed call from {}", caller),
            Notice::PeerDeclined { .. } => write!(f, "Call declined"),
            Notice::PeerEnded { .. } => write!(f, "Call ended"),
            Notice::CallFailed { reason } => write!(f, "Call failed: {}", reason),
            Notice::PermissionDenied { call_type } => write!(
                f,
                "{} access was denied. Allow it in your system settings and retry.",
                if call_type.wants_video() {
                    "Camera and microphone"
                } else {
                    "Microphone"
                }
            ),
            Notice::PermissionRestored { .. } => write!(f, "Media access granted"),
            Notice::DeviceError => write!(f, "Could not access camera or microphone"),
            Notice::RelayLost => write!(f, "Lost connection to the relay"),
        }
    }
}

/// Read-only view of the local call state.
#[derive(Debug, Clone, Default)]
pub struct CallSnapshot {
    pub phase: CallPhase,
    pub call: Option<CallRecord>,
    pub role: Option<Role>,
    pub peer: Option<UserProfile>,
    pub connection_status: ConnectionStatus,
    pub is_muted: bool,
    pub camera_off: bool,
    pub local_stream: Option<MediaStream>,
    pub remote_stream: Option<MediaStream>,
}

impl CallSnapshot {
    pub fn call_id(&self) -> Option<&CallId> {
        self.call.as_ref().map(|c| &c.id)
    }
}

/// Everything the engine needs from its surroundings.
pub struct CallContext {
    pub relay: Arc<dyn SignalingRelay>,
    pub devices: Arc<dyn MediaDevices>,
    pub transports: Arc<dyn TransportFactory>,
    pub pointer: ActiveCallPointer,
    pub settings: CallSettings,
    pub local_user: UserProfile,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("call engine has stopped")]
    Stopped,
}

enum EngineCommand {
    StartCall {
        receiver: UserProfile,
        call_type: CallType,
    },
    Dial {
        user_id: UserId,
        call_type: CallType,
    },
    Accept,
    Decline,
    HangUp {
        call_id: Option<CallId>,
        status: CallStatus,
    },
    ToggleMute,
    ToggleCamera,
    RetryPermission {
        call_type: CallType,
    },
    Unload {
        done: oneshot::Sender<()>,
    },
}

/// Results of spawned work, fed back into the engine loop.
enum TaskOutcome {
    StartPermission {
        receiver: UserProfile,
        call_type: CallType,
        outcome: PermissionOutcome,
    },
    AcceptPermission {
        call_id: CallId,
        outcome: PermissionOutcome,
    },
    RetryPermission {
        call_type: CallType,
        outcome: PermissionOutcome,
    },
    LocalMedia {
        call_id: CallId,
        result: Result<MediaStream, MediaAccessError>,
    },
}

/// Cloneable front end of a running `CallEngine`.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
    state: watch::Receiver<CallSnapshot>,
    notices: broadcast::Sender<Notice>,
}

impl CallHandle {
    fn send(&self, cmd: EngineCommand) -> Result<(), EngineError> {
        self.commands.send(cmd).map_err(|_| EngineError::Stopped)
    }

    /// Ring `receiver`. Progress is reported through the snapshot.
    pub fn start_call(&self, receiver: UserProfile, call_type: CallType) -> Result<(), EngineError> {
        self.send(EngineCommand::StartCall {
            receiver,
            call_type,
        })
    }

    /// Ring the user with id `user_id`, resolving their profile through the
    /// session directory.
    pub fn call_user(&self, user_id: impl Into<UserId>, call_type: CallType) -> Result<(), EngineError> {
        self.send(EngineCommand::Dial {
            user_id: user_id.into(),
            call_type,
        })
    }

    pub fn accept(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Accept)
    }

    pub fn decline(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Decline)
    }

    /// End the active call with `status`. With `call_id`, only if it matches.
    pub fn hang_up(&self, call_id: Option<CallId>, status: CallStatus) -> Result<(), EngineError> {
        self.send(EngineCommand::HangUp { call_id, status })
    }

    pub fn toggle_mute(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::ToggleMute)
    }

    pub fn toggle_camera(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::ToggleCamera)
    }

    /// Re-run the permission prompt after a denial.
    pub fn retry_permission(&self, call_type: CallType) -> Result<(), EngineError> {
        self.send(EngineCommand::RetryPermission { call_type })
    }

    /// Decline or end whatever is in progress, then stop the engine.
    ///
    /// Returns once the terminal status has been written.
    pub async fn unload(&self) -> Result<(), EngineError> {
        let (done, wait) = oneshot::channel();
        self.send(EngineCommand::Unload { done })?;
        wait.await.map_err(|_| EngineError::Stopped)
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> CallSnapshot {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.state.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Wait until the snapshot satisfies `f`.
    #[cfg(test)]
    pub async fn wait_for(
        &self,
        f: impl FnMut(&CallSnapshot) -> bool,
    ) -> Result<CallSnapshot, EngineError> {
        let mut rx = self.watch();
        let snapshot = rx.wait_for(f).await.map_err(|_| EngineError::Stopped)?;
        Ok(snapshot.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    /// Unanswered outgoing call, or unattended incoming ring.
    Ring,
    /// Connection dropped; waiting for it to come back.
    Recovery,
    /// Terminal phase shown; return to idle.
    Settle,
}

struct Timer {
    kind: TimerKind,
    call_id: CallId,
    at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Local,
    Remote,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Origin::Local => "local",
            Origin::Remote => "remote",
        })
    }
}

const FINISHED_LIMIT: usize = 32;

/// Recently finished calls, so a ring replayed by a fresh incoming
/// subscription is not shown again. Oldest ids are forgotten first.
#[derive(Debug, Default)]
struct FinishedCalls {
    ids: VecDeque<CallId>,
}

impl FinishedCalls {
    fn insert(&mut self, call_id: CallId) {
        if self.contains(&call_id) {
            return;
        }
        if self.ids.len() == FINISHED_LIMIT {
            self.ids.pop_front();
        }
        self.ids.push_back(call_id);
    }

    fn contains(&self, call_id: &str) -> bool {
        self.ids.iter().any(|id| id == call_id)
    }
}

#[derive(Debug, thiserror::Error)]
enum NegotiationError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

struct ActiveCall {
    record: CallRecord,
    role: Role,
    accepting: bool,
    negotiation_started: bool,
    media_ready: bool,
    local_description_set: bool,
    remote_description_set: bool,
    transport: Option<Arc<dyn PeerTransport>>,
    gate: CandidateGate,
}

impl ActiveCall {
    fn new(record: CallRecord, role: Role) -> Self {
        Self {
            record,
            role,
            accepting: false,
            negotiation_started: false,
            media_ready: false,
            local_description_set: false,
            remote_description_set: false,
            transport: None,
            gate: CandidateGate::new(),
        }
    }
}

async fn next_from<T>(feed: &mut Option<Subscription<T>>) -> Option<T> {
    match feed {
        Some(feed) => feed.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_event(events: &mut Option<TransportEvents>) -> Option<TransportEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// The task that owns the call. Started with `CallEngine::spawn`.
pub struct CallEngine {
    relay: Arc<dyn SignalingRelay>,
    gate: PermissionGate,
    transports: Arc<dyn TransportFactory>,
    directory: SessionDirectory,
    settings: CallSettings,
    local: UserProfile,

    commands: mpsc::UnboundedReceiver<EngineCommand>,
    tasks_tx: mpsc::UnboundedSender<TaskOutcome>,
    tasks_rx: mpsc::UnboundedReceiver<TaskOutcome>,

    incoming_feed: Option<Subscription<CallRecord>>,
    record_feed: Option<Subscription<CallRecord>>,
    candidate_feed: Option<Subscription<ConnectivityCandidate>>,
    transport_events: Option<TransportEvents>,

    active: Option<ActiveCall>,
    starting: bool,
    timer: Option<Timer>,
    finished: FinishedCalls,

    snapshot: CallSnapshot,
    state_tx: watch::Sender<CallSnapshot>,
    notices: broadcast::Sender<Notice>,
}

impl CallEngine {
    /// Settle any call left over from a previous run, subscribe to incoming
    /// rings and spawn the engine task.
    pub async fn spawn(ctx: CallContext) -> Result<CallHandle> {
        let CallContext {
            relay,
            devices,
            transports,
            pointer,
            settings,
            local_user,
        } = ctx;

        let mut directory = SessionDirectory::new(Arc::clone(&relay), pointer);
        directory.reconcile().await;
        directory.profiles_mut().remember(local_user.clone());

        let incoming_feed = relay
            .subscribe_incoming(&local_user.id)
            .await
            .context("Failed to subscribe to incoming calls")?;

        let (cmd_tx, commands) = mpsc::unbounded_channel();
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallSnapshot::default());
        let (notices, _) = broadcast::channel(32);

        let engine = CallEngine {
            relay,
            gate: PermissionGate::new(devices),
            transports,
            directory,
            settings,
            local: local_user,
            commands,
            tasks_tx,
            tasks_rx,
            incoming_feed: Some(incoming_feed),
            record_feed: None,
            candidate_feed: None,
            transport_events: None,
            active: None,
            starting: false,
            timer: None,
            finished: FinishedCalls::default(),
            snapshot: CallSnapshot::default(),
            state_tx,
            notices: notices.clone(),
        };

        tracing::info!("Call engine started for {}", engine.local.id);
        tokio::spawn(engine.run());

        Ok(CallHandle {
            commands: cmd_tx,
            state: state_rx,
            notices,
        })
    }

    async fn run(mut self) {
        let mut unloaded = None;
        loop {
            let deadline = self.timer.as_ref().map(|t| t.at);
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(EngineCommand::Unload { done }) => {
                        self.unload().await;
                        unloaded = Some(done);
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        tracing::debug!("All call handles dropped");
                        self.unload().await;
                        break;
                    }
                },
                Some(outcome) = self.tasks_rx.recv() => self.handle_outcome(outcome).await,
                ring = next_from(&mut self.incoming_feed) => match ring {
                    Some(record) => self.on_incoming(record).await,
                    None => {
                        tracing::warn!("Incoming call feed closed, shutting down");
                        self.incoming_feed = None;
                        if self.active.is_some() {
                            self.fail_call("lost the relay").await;
                        }
                        self.notify(Notice::RelayLost);
                        self.unload().await;
                        break;
                    }
                },
                update = next_from(&mut self.record_feed) => match update {
                    Some(record) => self.on_record_update(record).await,
                    None => {
                        tracing::warn!("Call record feed closed");
                        self.record_feed = None;
                        if self.active.is_some() {
                            self.fail_call("lost the relay").await;
                        }
                    }
                },
                candidate = next_from(&mut self.candidate_feed) => match candidate {
                    Some(candidate) => self.on_peer_candidate(candidate).await,
                    None => {
                        tracing::warn!("Peer candidate feed closed");
                        self.candidate_feed = None;
                    }
                },
                event = next_event(&mut self.transport_events) => match event {
                    Some(event) => self.on_transport_event(event).await,
                    None => self.transport_events = None,
                },
                _ = sleep_until(deadline) => self.on_timer().await,
            }
        }
        self.commands.close();
        self.incoming_feed = None;
        tracing::info!("Call engine for {} stopped", self.local.id);
        if let Some(done) = unloaded {
            let _ = done.send(());
        }
    }

    // ----- plumbing -----

    fn publish(&self) {
        self.state_tx.send_replace(self.snapshot.clone());
    }

    fn notify(&self, notice: Notice) {
        tracing::info!("Notice: {}", notice);
        let _ = self.notices.send(notice);
    }

    fn is_busy(&self) -> bool {
        self.starting || self.active.is_some()
    }

    fn is_current(&self, call_id: &str) -> bool {
        self.active.as_ref().is_some_and(|a| a.record.id == call_id)
    }

    fn set_phase(&mut self, phase: CallPhase) {
        if self.snapshot.phase != phase {
            tracing::info!("Call phase: {} -> {}", self.snapshot.phase, phase);
            self.snapshot.phase = phase;
        }
    }

    fn arm_timer(&mut self, kind: TimerKind, call_id: CallId, after: Duration) {
        tracing::debug!("Timer {:?} armed for call {} ({:?})", kind, call_id, after);
        self.timer = Some(Timer {
            kind,
            call_id,
            at: Instant::now() + after,
        });
    }

    fn cancel_timer(&mut self, kind: TimerKind) {
        if self.timer.as_ref().is_some_and(|t| t.kind == kind) {
            tracing::debug!("Timer {:?} cancelled", kind);
            self.timer = None;
        }
    }

    fn spawn_permission(
        &self,
        call_type: CallType,
        wrap: impl FnOnce(PermissionOutcome) -> TaskOutcome + Send + 'static,
    ) {
        let gate = self.gate.clone();
        let tx = self.tasks_tx.clone();
        tokio::spawn(async move {
            let outcome = gate.request_access(call_type).await;
            let _ = tx.send(wrap(outcome));
        });
    }

    fn permission_refused(&self, call_type: CallType, reason: Option<DenialReason>) {
        match reason {
            Some(DenialReason::Error) => self.notify(Notice::DeviceError),
            Some(DenialReason::Denied) | None => self.notify(Notice::PermissionDenied { call_type }),
        }
    }

    /// Make `record` the active call. Returns false if the local user is not
    /// a party to it.
    fn begin_call(&mut self, record: CallRecord, peer: UserProfile, phase: CallPhase) -> bool {
        let Some(role) = Role::for_user(&record, &self.local.id) else {
            tracing::warn!("{} is not a party to call {}", self.local.id, record.id);
            return false;
        };
        let call_id = record.id.clone();
        self.snapshot = CallSnapshot {
            phase: CallPhase::Idle,
            call: Some(record.clone()),
            role: Some(role),
            peer: Some(peer),
            ..CallSnapshot::default()
        };
        self.set_phase(phase);
        self.active = Some(ActiveCall::new(record, role));
        self.arm_timer(TimerKind::Ring, call_id, self.settings.ring_timeout);
        true
    }

    // ----- commands -----

    async fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::StartCall {
                receiver,
                call_type,
            } => self.request_start(receiver, call_type),
            EngineCommand::Dial { user_id, call_type } => {
                if self.is_busy() {
                    tracing::warn!("Ignoring call to {}: a call is already in progress", user_id);
                    return;
                }
                let receiver = self
                    .directory
                    .profile(&user_id)
                    .await
                    .unwrap_or_else(|| UserProfile::unknown(&user_id));
                self.request_start(receiver, call_type);
            }
            EngineCommand::Accept => self.accept(),
            EngineCommand::Decline => {
                if self.snapshot.phase == CallPhase::IncomingRinging {
                    self.teardown(CallStatus::Declined, Origin::Local).await;
                }
            }
            EngineCommand::HangUp { call_id, status } => self.hang_up(call_id, status).await,
            EngineCommand::ToggleMute => {
                if self.active.is_some() {
                    self.snapshot.is_muted = !self.snapshot.is_muted;
                    self.apply_track_flags();
                    self.publish();
                }
            }
            EngineCommand::ToggleCamera => {
                if self.active.is_some() {
                    self.snapshot.camera_off = !self.snapshot.camera_off;
                    self.apply_track_flags();
                    self.publish();
                }
            }
            EngineCommand::RetryPermission { call_type } => {
                self.spawn_permission(call_type, move |outcome| TaskOutcome::RetryPermission {
                    call_type,
                    outcome,
                });
            }
            EngineCommand::Unload { .. } => {}
        }
    }

    fn request_start(&mut self, receiver: UserProfile, call_type: CallType) {
        if self.is_busy() {
            tracing::warn!("Ignoring call to {}: a call is already in progress", receiver.id);
            return;
        }
        if receiver.id == self.local.id {
            tracing::warn!("Ignoring call to self");
            return;
        }
        self.starting = true;
        self.spawn_permission(call_type, move |outcome| TaskOutcome::StartPermission {
            receiver,
            call_type,
            outcome,
        });
    }

    fn accept(&mut self) {
        if self.snapshot.phase != CallPhase::IncomingRinging {
            tracing::debug!("Accept ignored in phase {}", self.snapshot.phase);
            return;
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.accepting {
            return;
        }
        active.accepting = true;
        let call_id = active.record.id.clone();
        let call_type = active.record.call_type;
        self.spawn_permission(call_type, move |outcome| TaskOutcome::AcceptPermission {
            call_id,
            outcome,
        });
    }

    async fn hang_up(&mut self, call_id: Option<CallId>, status: CallStatus) {
        let Some(active) = self.active.as_ref() else {
            tracing::debug!("Hang-up ignored: no active call");
            return;
        };
        if let Some(id) = &call_id {
            if *id != active.record.id {
                tracing::debug!("Hang-up ignored: {} is not the active call", id);
                return;
            }
        }
        let status = if status.is_terminal() {
            status
        } else {
            tracing::warn!("Hang-up with non-terminal status {}; using ended", status);
            CallStatus::Ended
        };
        self.teardown(status, Origin::Local).await;
    }

    fn apply_track_flags(&self) {
        if let Some(stream) = &self.snapshot.local_stream {
            for track in stream.audio_tracks() {
                track.set_enabled(!self.snapshot.is_muted);
            }
            for track in stream.video_tracks() {
                track.set_enabled(!self.snapshot.camera_off);
            }
        }
    }

    async fn unload(&mut self) {
        self.starting = false;
        if self.snapshot.phase == CallPhase::IncomingRinging {
            self.teardown(CallStatus::Declined, Origin::Local).await;
        } else if self.active.is_some() {
            self.teardown(CallStatus::Ended, Origin::Local).await;
        }
        self.timer = None;
    }

    // ----- spawned work -----

    async fn handle_outcome(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::StartPermission {
                receiver,
                call_type,
                outcome,
            } => self.on_start_permission(receiver, call_type, outcome).await,
            TaskOutcome::AcceptPermission { call_id, outcome } => {
                self.on_accept_permission(call_id, outcome).await
            }
            TaskOutcome::RetryPermission { call_type, outcome } => {
                if outcome.granted {
                    self.notify(Notice::PermissionRestored { call_type });
                } else {
                    self.permission_refused(call_type, outcome.reason);
                }
            }
            TaskOutcome::LocalMedia { call_id, result } => {
                self.on_local_media(call_id, result).await
            }
        }
    }

    async fn on_start_permission(
        &mut self,
        receiver: UserProfile,
        call_type: CallType,
        outcome: PermissionOutcome,
    ) {
        if !self.starting {
            tracing::debug!("Dropping permission result for a cancelled call");
            return;
        }
        self.starting = false;
        if !outcome.granted {
            self.permission_refused(call_type, outcome.reason);
            return;
        }

        let record = match self
            .directory
            .allocate_call(&self.local, &receiver, call_type)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Failed to create call to {}: {}", receiver.id, e);
                self.notify(Notice::CallFailed {
                    reason: "could not reach the relay".into(),
                });
                return;
            }
        };

        let call_id = record.id.clone();
        if !self.begin_call(record, receiver, CallPhase::OutgoingRinging) {
            return;
        }
        self.directory.pointer_mut().arm(&call_id);
        match self.relay.subscribe_call(&call_id).await {
            Ok(feed) => self.record_feed = Some(feed),
            Err(e) => {
                tracing::warn!("Failed to watch call {}: {}", call_id, e);
                self.fail_call("could not reach the relay").await;
                return;
            }
        }
        self.publish();
    }

    async fn on_accept_permission(&mut self, call_id: CallId, outcome: PermissionOutcome) {
        if !self.is_current(&call_id) || self.snapshot.phase != CallPhase::IncomingRinging {
            tracing::debug!("Dropping stale accept for call {}", call_id);
            return;
        }
        if !outcome.granted {
            let call_type = self
                .active
                .as_ref()
                .map(|a| a.record.call_type)
                .unwrap_or(CallType::Audio);
            self.permission_refused(call_type, outcome.reason);
            self.teardown(CallStatus::Declined, Origin::Local).await;
            return;
        }

        self.directory.pointer_mut().arm(&call_id);
        if let Err(e) = self.relay.update_status(&call_id, CallStatus::Answered).await {
            tracing::warn!("Failed to answer call {}: {}", call_id, e);
            self.fail_call("the call is no longer available").await;
            return;
        }
        self.cancel_timer(TimerKind::Ring);
        if let Some(active) = self.active.as_mut() {
            active.record.status = CallStatus::Answered;
            self.snapshot.call = Some(active.record.clone());
        }
        self.set_phase(CallPhase::Answered);
        self.publish();
        self.start_negotiation().await;
        self.publish();
    }

    async fn on_local_media(
        &mut self,
        call_id: CallId,
        result: Result<MediaStream, MediaAccessError>,
    ) {
        if !self.is_current(&call_id) {
            if let Ok(stream) = result {
                let released = stream.stop_all();
                tracing::debug!(
                    "Released {} tracks acquired for finished call {}",
                    released,
                    call_id
                );
            }
            return;
        }

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Local media for call {} unavailable: {}", call_id, e);
                let call_type = self.snapshot.call.as_ref().map(|c| c.call_type);
                match e {
                    MediaAccessError::Denied => self.notify(Notice::PermissionDenied {
                        call_type: call_type.unwrap_or(CallType::Audio),
                    }),
                    MediaAccessError::Device(_) => self.notify(Notice::DeviceError),
                }
                self.teardown(CallStatus::Ended, Origin::Local).await;
                return;
            }
        };

        let Some(transport) = self.active.as_ref().and_then(|a| a.transport.clone()) else {
            stream.stop_all();
            return;
        };
        for track in stream.tracks() {
            let kind = track.kind();
            if let Err(e) = transport.add_track(track).await {
                tracing::warn!("Failed to attach local {} track: {}", kind.as_str(), e);
            }
        }
        self.snapshot.local_stream = Some(stream);
        self.apply_track_flags();

        let role = match self.active.as_mut() {
            Some(active) => {
                active.media_ready = true;
                active.role
            }
            None => return,
        };
        if role == Role::Caller {
            if let Err(e) = self.send_offer(&call_id, transport.as_ref()).await {
                tracing::warn!("Failed to send offer for call {}: {}", call_id, e);
                self.fail_call("negotiation failed").await;
                return;
            }
        }
        self.advance_negotiation().await;
        self.publish();
    }

    // ----- negotiation -----

    async fn start_negotiation(&mut self) {
        let (call_id, role, call_type) = match self.active.as_mut() {
            Some(active) if !active.negotiation_started => {
                active.negotiation_started = true;
                (active.record.id.clone(), active.role, active.record.call_type)
            }
            _ => return,
        };
        tracing::info!("Negotiating call {} as {:?}", call_id, role);

        let (transport, events) = match self.transports.create(&self.settings.ice_servers).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("Failed to create transport for call {}: {}", call_id, e);
                self.fail_call("could not set up the connection").await;
                return;
            }
        };
        self.snapshot.connection_status = transport.connection_status();
        self.snapshot.remote_stream = Some(MediaStream::new());
        self.transport_events = Some(events);
        if let Some(active) = self.active.as_mut() {
            active.transport = Some(transport);
        }
        self.set_phase(CallPhase::Connecting);

        match self
            .relay
            .subscribe_candidates(&call_id, role.side().peer())
            .await
        {
            Ok(feed) => self.candidate_feed = Some(feed),
            Err(e) => {
                tracing::warn!("Failed to watch peer candidates for {}: {}", call_id, e);
                self.fail_call("could not reach the relay").await;
                return;
            }
        }

        let gate = self.gate.clone();
        let tx = self.tasks_tx.clone();
        tokio::spawn(async move {
            let result = gate.acquire(call_type).await;
            let _ = tx.send(TaskOutcome::LocalMedia { call_id, result });
        });
    }

    async fn send_offer(
        &mut self,
        call_id: &CallId,
        transport: &dyn PeerTransport,
    ) -> Result<(), NegotiationError> {
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;
        if let Some(active) = self.active.as_mut() {
            active.local_description_set = true;
        }
        self.relay.write_offer(call_id, offer).await?;
        tracing::debug!("Offer published for call {}", call_id);
        Ok(())
    }

    /// Apply whatever the latest record allows: the offer on the callee, the
    /// answer on the caller. Duplicate deliveries are ignored.
    async fn advance_negotiation(&mut self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        if !active.media_ready || active.remote_description_set {
            return;
        }
        let Some(transport) = active.transport.clone() else {
            return;
        };
        let call_id = active.record.id.clone();
        let role = active.role;
        let local_set = active.local_description_set;
        let offer = active.record.offer.clone();
        let answer = active.record.answer.clone();

        let result = match (role, offer, answer) {
            (Role::Callee, Some(offer), _) => {
                self.answer_offer(&call_id, transport.as_ref(), offer).await
            }
            (Role::Caller, _, Some(answer)) if local_set => {
                self.apply_remote(transport.as_ref(), answer).await
            }
            _ => return,
        };
        if let Err(e) = result {
            tracing::warn!("Negotiation for call {} failed: {}", call_id, e);
            self.fail_call("negotiation failed").await;
        }
    }

    async fn answer_offer(
        &mut self,
        call_id: &CallId,
        transport: &dyn PeerTransport,
        offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.apply_remote(transport, offer).await?;
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        if let Some(active) = self.active.as_mut() {
            active.local_description_set = true;
        }
        self.relay.write_answer(call_id, answer).await?;
        tracing::debug!("Answer published for call {}", call_id);
        Ok(())
    }

    /// Set the remote description, then release held-back candidates.
    async fn apply_remote(
        &mut self,
        transport: &dyn PeerTransport,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        transport.set_remote_description(desc).await?;
        let held = match self.active.as_mut() {
            Some(active) => {
                active.remote_description_set = true;
                active.gate.open()
            }
            None => return Ok(()),
        };
        if !held.is_empty() {
            tracing::debug!("Flushing {} held candidates", held.len());
        }
        for candidate in held {
            apply_candidate(transport, candidate).await;
        }
        Ok(())
    }

    async fn on_peer_candidate(&mut self, candidate: ConnectivityCandidate) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let Some(transport) = active.transport.clone() else {
            return;
        };
        if let Some(candidate) = active.gate.admit(candidate) {
            apply_candidate(transport.as_ref(), candidate).await;
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let Some((call_id, side)) = self
                    .active
                    .as_ref()
                    .map(|a| (a.record.id.clone(), a.role.side()))
                else {
                    return;
                };
                tracing::debug!("Local candidate for {}: {}", call_id, candidate.candidate);
                if let Err(e) = self.relay.append_candidate(&call_id, side, candidate).await {
                    tracing::warn!("Failed to publish candidate for {}: {}", call_id, e);
                }
            }
            TransportEvent::RemoteTrack(track) => {
                if let Some(remote) = &self.snapshot.remote_stream {
                    tracing::debug!("Remote {} track arrived", track.kind().as_str());
                    remote.add_track(track);
                    self.publish();
                }
            }
            TransportEvent::StatusChanged(status) => self.on_connection_status(status),
        }
    }

    fn on_connection_status(&mut self, status: ConnectionStatus) {
        let Some(call_id) = self.active.as_ref().map(|a| a.record.id.clone()) else {
            return;
        };
        tracing::info!("Call {} connection {}", call_id, status);
        self.snapshot.connection_status = status;
        match status {
            ConnectionStatus::Connected => {
                self.cancel_timer(TimerKind::Recovery);
                if matches!(
                    self.snapshot.phase,
                    CallPhase::Answered | CallPhase::Connecting
                ) {
                    self.set_phase(CallPhase::Connected);
                }
            }
            ConnectionStatus::Disconnected | ConnectionStatus::Failed => {
                if !self
                    .timer
                    .as_ref()
                    .is_some_and(|t| t.kind == TimerKind::Recovery)
                {
                    self.arm_timer(TimerKind::Recovery, call_id, self.settings.reconnect_timeout);
                }
            }
            _ => {}
        }
        self.publish();
    }

    // ----- relay feeds -----

    async fn on_incoming(&mut self, record: CallRecord) {
        if record.status != CallStatus::Ringing
            || record.receiver_id != self.local.id
            || record.caller_id == self.local.id
        {
            return;
        }
        if self.finished.contains(&record.id) || self.is_current(&record.id) {
            return;
        }
        if self.is_busy() {
            tracing::info!(
                "Ignoring incoming call {} from {}: busy",
                record.id,
                record.caller_id
            );
            return;
        }

        let caller = match self.directory.profile(&record.caller_id).await {
            Some(profile) => profile,
            None => {
                let profile = UserProfile {
                    id: record.caller_id.clone(),
                    display_name: record.caller_name.clone(),
                    photo_url: record.caller_photo_url.clone(),
                };
                self.directory.profiles_mut().remember(profile.clone());
                profile
            }
        };
        tracing::info!(
            "Incoming {} call {} from {}",
            record.call_type,
            record.id,
            caller.display_name
        );

        let call_id = record.id.clone();
        if !self.begin_call(record, caller, CallPhase::IncomingRinging) {
            return;
        }
        match self.relay.subscribe_call(&call_id).await {
            Ok(feed) => self.record_feed = Some(feed),
            Err(e) => {
                tracing::warn!("Failed to watch call {}: {}", call_id, e);
                self.active = None;
                self.timer = None;
                self.snapshot = CallSnapshot::default();
            }
        }
        self.publish();
    }

    async fn on_record_update(&mut self, record: CallRecord) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if record.id != active.record.id {
            return;
        }
        active.record = record.clone();
        let role = active.role;
        self.snapshot.call = Some(record.clone());

        if record.status.is_terminal() {
            let notice = self.remote_end_notice(&record, role);
            self.notify(notice);
            self.teardown(record.status, Origin::Remote).await;
            return;
        }

        if record.status == CallStatus::Answered
            && role == Role::Caller
            && self.snapshot.phase == CallPhase::OutgoingRinging
        {
            tracing::info!("Call {} answered", record.id);
            self.cancel_timer(TimerKind::Ring);
            self.set_phase(CallPhase::Answered);
            self.publish();
            self.start_negotiation().await;
        }

        self.advance_negotiation().await;
        self.publish();
    }

    fn remote_end_notice(&self, record: &CallRecord, role: Role) -> Notice {
        let call_id = record.id.clone();
        // The peer gave up on a dropped connection at the same time we did.
        let recovery_expired = self
            .timer
            .as_ref()
            .is_some_and(|t| t.kind == TimerKind::Recovery && t.at <= Instant::now());
        if recovery_expired {
            return Notice::CallFailed {
                reason: "connection lost".into(),
            };
        }
        match (self.snapshot.phase, record.status, role) {
            (CallPhase::IncomingRinging, _, _) => Notice::Missed {
                call_id,
                caller: record.caller_name.clone(),
            },
            (_, CallStatus::Declined, Role::Caller) => Notice::PeerDeclined { call_id },
            _ => Notice::PeerEnded { call_id },
        }
    }

    // ----- timers -----

    async fn on_timer(&mut self) {
        let Some(timer) = self.timer.take() else {
            return;
        };
        match timer.kind {
            TimerKind::Ring => {
                if !self.is_current(&timer.call_id) {
                    return;
                }
                match self.snapshot.phase {
                    CallPhase::OutgoingRinging => {
                        self.notify(Notice::NotAnswered {
                            call_id: timer.call_id,
                        });
                        self.teardown(CallStatus::Declined, Origin::Local).await;
                    }
                    CallPhase::IncomingRinging => {
                        let caller = self
                            .snapshot
                            .peer
                            .as_ref()
                            .map(|p| p.display_name.clone())
                            .unwrap_or_default();
                        self.notify(Notice::Missed {
                            call_id: timer.call_id,
                            caller,
                        });
                        self.teardown(CallStatus::Declined, Origin::Local).await;
                    }
                    _ => {}
                }
            }
            TimerKind::Recovery => {
                if self.is_current(&timer.call_id)
                    && self.snapshot.connection_status.is_interrupted()
                {
                    self.fail_call("connection lost").await;
                }
            }
            TimerKind::Settle => {
                if self.active.is_none() && self.snapshot.phase.is_terminal() {
                    self.snapshot = CallSnapshot::default();
                    self.set_phase(CallPhase::Idle);
                    self.publish();
                }
            }
        }
    }

    // ----- teardown -----

    async fn fail_call(&mut self, reason: &str) {
        self.notify(Notice::CallFailed {
            reason: reason.to_string(),
        });
        self.teardown(CallStatus::Ended, Origin::Local).await;
    }

    /// Release everything held for the active call. Safe to call repeatedly.
    ///
    /// The terminal status is written to the relay only when the end was
    /// decided locally; a write failure is logged and teardown continues.
    async fn teardown(&mut self, status: CallStatus, origin: Origin) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        let call_id = active.record.id.clone();
        tracing::info!("Tearing down call {} ({}, {})", call_id, status, origin);

        self.timer = None;
        self.record_feed = None;
        self.candidate_feed = None;
        self.transport_events = None;

        let mut released = 0;
        if let Some(stream) = self.snapshot.local_stream.take() {
            released += stream.stop_all();
        }
        if let Some(stream) = self.snapshot.remote_stream.take() {
            released += stream.stop_all();
        }
        if let Some(transport) = active.transport.take() {
            transport.close().await;
            self.snapshot.connection_status = ConnectionStatus::Closed;
        }
        tracing::debug!("Released {} tracks for call {}", released, call_id);

        self.directory.pointer_mut().clear();
        self.finished.insert(call_id.clone());

        if origin == Origin::Local {
            if let Err(e) = self.relay.update_status(&call_id, status).await {
                tracing::warn!("Failed to publish {} for call {}: {}", status, call_id, e);
            }
        }

        active.record.status = status;
        self.snapshot.call = Some(active.record);
        self.set_phase(if status == CallStatus::Declined {
            CallPhase::Declined
        } else {
            CallPhase::Ended
        });
        self.arm_timer(TimerKind::Settle, call_id, self.settings.linger);
        self.publish();
    }
}

async fn apply_candidate(transport: &dyn PeerTransport, candidate: ConnectivityCandidate) {
    if let Err(e) = transport.add_candidate(candidate).await {
        tracing::warn!("Failed to apply peer candidate: {}", e);
    }
}
