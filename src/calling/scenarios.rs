//! Two-party call scenarios over the in-memory relay and loopback network.
//!
//! Time is paused, so ring and recovery deadlines run instantly and
//! deterministically.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{self, Instant};

use crate::calling::directory::ActiveCallPointer;
use crate::calling::loopback::LoopbackNetwork;
use crate::calling::media::{DevicePolicy, SyntheticDevices};
use crate::calling::session::{
    CallContext, CallEngine, CallHandle, CallPhase, CallSettings, CallSnapshot, Notice, Role,
};
use crate::calling::transport::ConnectionStatus;
use crate::calling::session::EngineError;
use crate::models::{
    CallId, CallStatus, CallType, ConnectivityCandidate, NewCall, Side, UserProfile,
};
use crate::relay::memory::RelayWrite;
use crate::relay::{MemoryRelay, SignalingRelay};

struct World {
    relay: MemoryRelay,
    network: LoopbackNetwork,
}

struct Party {
    profile: UserProfile,
    handle: CallHandle,
    devices: SyntheticDevices,
    notices: broadcast::Receiver<Notice>,
    pointer_path: PathBuf,
}

impl World {
    fn new() -> Self {
        Self {
            relay: MemoryRelay::new(),
            network: LoopbackNetwork::new(),
        }
    }

    async fn join(&self, id: &str, name: &str, policy: DevicePolicy) -> Party {
        let profile = UserProfile::new(id, name);
        let devices = SyntheticDevices::new(policy);
        let pointer_path = std::env::temp_dir()
            .join(format!("peercall-scenario-{}", uuid::Uuid::new_v4().simple()))
            .join("pointer.json");
        let settings = CallSettings {
            linger: Duration::from_secs(30),
            ..CallSettings::default()
        };
        let handle = CallEngine::spawn(CallContext {
            relay: Arc::new(self.relay.clone()),
            devices: Arc::new(devices.clone()),
            transports: Arc::new(self.network.clone()),
            pointer: ActiveCallPointer::persistent(pointer_path.clone()),
            settings,
            local_user: profile.clone(),
        })
        .await
        .unwrap();
        let notices = handle.notices();
        Party {
            profile,
            handle,
            devices,
            notices,
            pointer_path,
        }
    }
}

impl Party {
    async fn until(&self, what: &str, f: impl FnMut(&CallSnapshot) -> bool) -> CallSnapshot {
        time::timeout(Duration::from_secs(60), self.handle.wait_for(f))
            .await
            .unwrap_or_else(|_| panic!("{} timed out waiting for {}", self.profile.id, what))
            .unwrap()
    }

    async fn until_phase(&self, phase: CallPhase) -> CallSnapshot {
        self.until(phase.as_str(), |s| s.phase == phase).await
    }

    fn drain_notices(&mut self) -> Vec<Notice> {
        let mut out = Vec::new();
        while let Ok(n) = self.notices.try_recv() {
            out.push(n);
        }
        out
    }

    fn pointer(&self) -> Option<CallId> {
        ActiveCallPointer::load(&self.pointer_path).unwrap()
    }
}

impl Drop for Party {
    fn drop(&mut self) {
        if let Some(dir) = self.pointer_path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}

/// A calls B and B picks up; returns the call id once both are connected.
async fn connect(a: &Party, b: &Party, call_type: CallType) -> CallId {
    a.handle.start_call(b.profile.clone(), call_type).unwrap();
    b.until_phase(CallPhase::IncomingRinging).await;
    b.handle.accept().unwrap();
    let snap = a.until_phase(CallPhase::Connected).await;
    b.until_phase(CallPhase::Connected).await;
    snap.call.unwrap().id
}

fn writes(relay: &MemoryRelay, id: &str, wanted: &RelayWrite) -> usize {
    relay.history(id).iter().filter(|w| *w == wanted).count()
}

#[tokio::test(start_paused = true)]
async fn test_start_call_creates_ringing_record_and_arms_pointer() {
    for call_type in [CallType::Audio, CallType::Video] {
        let world = World::new();
        let a = world.join("alice", "Alice", DevicePolicy::Grant).await;

        let started = Instant::now();
        a.handle
            .start_call(UserProfile::new("bob", "Bob"), call_type)
            .unwrap();
        let snap = a.until_phase(CallPhase::OutgoingRinging).await;
        assert_eq!(Instant::now(), started);

        let id = snap.call_id().unwrap().clone();
        let record = world.relay.call(&id).unwrap();
        assert_eq!(record.status, CallStatus::Ringing);
        assert_eq!(record.call_type, call_type);
        assert_eq!(record.caller_id, "alice");
        assert_eq!(snap.role, Some(Role::Caller));
        assert_eq!(a.pointer(), Some(id));
        assert_eq!(a.devices.ledger().live(), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_video_call_reaches_connected_with_one_offer_and_one_answer() {
    let world = World::new();
    let a = world.join("alice", "Alice", DevicePolicy::Grant).await;
    let b = world.join("bob", "Bob", DevicePolicy::Grant).await;

    let started = Instant::now();
    a.handle.start_call(b.profile.clone(), CallType::Video).unwrap();
    let ringing = b.until_phase(CallPhase::IncomingRinging).await;
    assert_eq!(Instant::now(), started);
    let incoming = ringing.call.clone().unwrap();
    assert_eq!(incoming.call_type, CallType::Video);
    assert_eq!(incoming.status, CallStatus::Ringing);
    assert_eq!(ringing.peer.as_ref().unwrap().display_name, "Alice");

    b.handle.accept().unwrap();
    let a_snap = a.until_phase(CallPhase::Connected).await;
    let b_snap = b.until_phase(CallPhase::Connected).await;
    let id = incoming.id;

    assert_eq!(world.relay.call(&id).unwrap().status, CallStatus::Answered);
    assert_eq!(writes(&world.relay, &id, &RelayWrite::Offer), 1);
    assert_eq!(writes(&world.relay, &id, &RelayWrite::Answer), 1);
    assert_eq!(a_snap.role, Some(Role::Caller));
    assert_eq!(b_snap.role, Some(Role::Callee));

    for snap in [&a_snap, &b_snap] {
        assert_eq!(snap.connection_status, ConnectionStatus::Connected);
        assert_eq!(snap.local_stream.as_ref().unwrap().tracks().len(), 2);
        let remote = snap.remote_stream.as_ref().unwrap();
        assert_eq!(remote.audio_tracks().len(), 1);
        assert_eq!(remote.video_tracks().len(), 1);
    }
    assert_eq!(world.network.transports_created(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_candidates_applied_only_after_remote_description() {
    let world = World::new();
    let a = world.join("alice", "Alice", DevicePolicy::Grant).await;
    let b = world.join("bob", "Bob", DevicePolicy::Grant).await;
    let id = connect(&a, &b, CallType::Audio).await;

    let delivered: HashSet<String> = [Side::Caller, Side::Callee]
        .into_iter()
        .flat_map(|side| world.relay.candidates(&id, side))
        .map(|c| c.candidate)
        .collect();
    assert!(!delivered.is_empty());

    let stats = world.network.stats();
    assert_eq!(stats.len(), 2);
    for endpoint in stats {
        assert_eq!(endpoint.rejected_candidates, 0);
        assert!(endpoint.has_remote_description);
        assert!(!endpoint.applied_candidates.is_empty());
        for applied in &endpoint.applied_candidates {
            assert!(delivered.contains(applied), "{} was never delivered", applied);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_candidate_sent_while_ringing_waits_for_answer() {
    let world = World::new();
    let a = world.join("alice", "Alice", DevicePolicy::Grant).await;
    let b = world.join("bob", "Bob", DevicePolicy::Grant).await;

    a.handle.start_call(b.profile.clone(), CallType::Audio).unwrap();
    let id = b
        .until_phase(CallPhase::IncomingRinging)
        .await
        .call_id()
        .unwrap()
        .clone();
    let early = "candidate:99 1 udp 2130706431 127.0.0.1 49999 typ host";
    world
        .relay
        .append_candidate(&id, Side::Callee, ConnectivityCandidate::new(early))
        .await
        .unwrap();

    b.handle.accept().unwrap();
    a.until_phase(CallPhase::Connected).await;
    b.until_phase(CallPhase::Connected).await;

    let stats = world.network.stats();
    let holders = stats
        .iter()
        .filter(|e| e.applied_candidates.iter().any(|c| c == early))
        .count();
    assert_eq!(holders, 1);
    assert!(stats.iter().all(|e| e.rejected_candidates == 0));

    let history = world.relay.history(&id);
    let candidate_at = history
        .iter()
        .position(|w| *w == RelayWrite::Candidate(Side::Callee))
        .unwrap();
    let answer_at = history
        .iter()
        .position(|w| *w == RelayWrite::Answer)
        .unwrap();
    assert!(candidate_at < answer_at);
}

#[tokio::test(start_paused = true)]
async fn test_ring_from_self_is_ignored() {
    let world = World::new();
    let a = world.join("alice", "Alice", DevicePolicy::Grant).await;

    world
        .relay
        .create_call(NewCall {
            caller_id: "alice".into(),
            caller_name: "Alice".into(),
            caller_photo_url: None,
            receiver_id: "alice".into(),
            call_type: CallType::Audio,
        })
        .await
        .unwrap();
    time::sleep(Duration::from_millis(10)).await;

    let snap = a.handle.snapshot();
    assert_eq!(snap.phase, CallPhase::Idle);
    assert!(snap.role.is_none());
    assert_eq!(a.pointer(), None);
}

#[tokio::test(start_paused = true)]
async fn test_hang_up_while_relay_offline_still_releases() {
    let world = World::new();
    let a = world.join("alice", "Alice", DevicePolicy::Grant).await;
    let b = world.join("bob", "Bob", DevicePolicy::Grant).await;
    let id = connect(&a, &b, CallType::Video).await;

    world.relay.set_offline(true);
    a.handle.hang_up(Some(id.clone()), CallStatus::Ended).unwrap();
    let snap = a.until_phase(CallPhase::Ended).await;

    assert_eq!(snap.connection_status, ConnectionStatus::Closed);
    assert!(snap.local_stream.is_none());
    assert!(snap.remote_stream.is_none());
    assert_eq!(a.devices.ledger().live(), 0);
    assert_eq!(a.pointer(), None);
    assert_eq!(writes(&world.relay, &id, &RelayWrite::Status(CallStatus::Ended)), 0);
    assert_eq!(world.relay.call(&id).unwrap().status, CallStatus::Answered);
}

#[tokio::test(start_paused = true)]
async fn test_relay_loss_ends_call_and_stops_engine() {
    let world = World::new();
    let mut a = world.join("alice", "Alice", DevicePolicy::Grant).await;
    let mut b = world.join("bob", "Bob", DevicePolicy::Grant).await;
    connect(&a, &b, CallType::Audio).await;

    world.relay.drop_subscribers();
    time::sleep(Duration::from_secs(1)).await;

    for party in [&mut a, &mut b] {
        assert_eq!(party.handle.snapshot().phase, CallPhase::Ended);
        let notices = party.drain_notices();
        assert!(notices.iter().any(|n| matches!(n, Notice::CallFailed { .. })));
        assert!(notices.contains(&Notice::RelayLost));
        assert!(matches!(party.handle.accept(), Err(EngineError::Stopped)));
        assert_eq!(party.devices.ledger().live(), 0);
        assert_eq!(party.pointer(), None);
    }
}

#[tokio::test(start_paused = true)]
async fn test_double_hang_up_writes_once_and_releases_once() {
    let world = World::new();
    let a = world.join("alice", "Alice", DevicePolicy::Grant).await;
    let b = world.join("bob", "Bob", DevicePolicy::Grant).await;
    let id = connect(&a, &b, CallType::Video).await;

    a.handle.hang_up(Some(id.clone()), CallStatus::Ended).unwrap();
    a.handle.hang_up(Some(id.clone()), CallStatus::Ended).unwrap();
    let a_snap = a.until_phase(CallPhase::Ended).await;
    b.until_phase(CallPhase::Ended).await;
    a.handle.hang_up(None, CallStatus::Ended).unwrap();
    a.handle.unload().await.unwrap();

    assert_eq!(writes(&world.relay, &id, &RelayWrite::Status(CallStatus::Ended)), 1);
    assert_eq!(world.relay.rejected_writes(&id), 0);
    assert_eq!(a_snap.connection_status, ConnectionStatus::Closed);
    assert!(a_snap.local_stream.is_none());
    for devices in [&a.devices, &b.devices] {
        let ledger = devices.ledger();
        assert_eq!(ledger.live(), 0);
        assert_eq!(ledger.released(), ledger.opened());
    }
    assert_eq!(a.pointer(), None);
    assert_eq!(b.pointer(), None);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_declines_at_ring_timeout() {
    let world = World::new();
    let mut a = world.join("alice", "Alice", DevicePolicy::Grant).await;

    a.handle
        .start_call(UserProfile::new("carol", "Carol"), CallType::Audio)
        .unwrap();
    let ringing = a.until_phase(CallPhase::OutgoingRinging).await;
    let id = ringing.call_id().unwrap().clone();
    let started = Instant::now();

    let declined = a.until_phase(CallPhase::Declined).await;
    assert_eq!(started.elapsed(), Duration::from_secs(15));
    assert_eq!(declined.call.unwrap().status, CallStatus::Declined);
    assert_eq!(world.relay.call(&id).unwrap().status, CallStatus::Declined);
    assert!(a
        .drain_notices()
        .contains(&Notice::NotAnswered { call_id: id.clone() }));
    assert_eq!(a.pointer(), None);
}

#[tokio::test(start_paused = true)]
async fn test_answer_just_before_timeout_is_not_declined() {
    let world = World::new();
    let a = world.join("alice", "Alice", DevicePolicy::Grant).await;
    let b = world.join("bob", "Bob", DevicePolicy::Grant).await;

    a.handle.start_call(b.profile.clone(), CallType::Audio).unwrap();
    a.until_phase(CallPhase::OutgoingRinging).await;
    let ringing = b.until_phase(CallPhase::IncomingRinging).await;
    let id = ringing.call_id().unwrap().clone();

    time::sleep(Duration::from_millis(14_900)).await;
    b.handle.accept().unwrap();
    a.until_phase(CallPhase::Connected).await;

    time::sleep(Duration::from_secs(5)).await;
    assert_eq!(a.handle.snapshot().phase, CallPhase::Connected);
    assert_eq!(b.handle.snapshot().phase, CallPhase::Connected);
    assert_eq!(world.relay.call(&id).unwrap().status, CallStatus::Answered);
    assert_eq!(
        writes(&world.relay, &id, &RelayWrite::Status(CallStatus::Declined)),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_incoming_call_rings_out_as_missed() {
    let world = World::new();
    let a = world.join("alice", "Alice", DevicePolicy::Grant).await;
    let mut b = world.join("bob", "Bob", DevicePolicy::Grant).await;

    a.handle.start_call(b.profile.clone(), CallType::Audio).unwrap();
    let ringing = b.until_phase(CallPhase::IncomingRinging).await;
    let id = ringing.call_id().unwrap().clone();

    b.until_phase(CallPhase::Declined).await;
    a.until_phase(CallPhase::Declined).await;
    assert_eq!(world.relay.call(&id).unwrap().status, CallStatus::Declined);
    assert!(b
        .drain_notices()
        .iter()
        .any(|n| matches!(n, Notice::Missed { .. })));
    assert_eq!(world.network.transports_created(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_permission_denied_on_accept_declines_without_transport() {
    let world = World::new();
    let mut a = world.join("alice", "Alice", DevicePolicy::Grant).await;
    let mut b = world.join("bob", "Bob", DevicePolicy::Deny).await;

    a.handle.start_call(b.profile.clone(), CallType::Video).unwrap();
    let ringing = b.until_phase(CallPhase::IncomingRinging).await;
    let id = ringing.call_id().unwrap().clone();

    b.handle.accept().unwrap();
    b.until_phase(CallPhase::Declined).await;
    a.until_phase(CallPhase::Declined).await;

    let history = world.relay.history(&id);
    assert_eq!(
        history,
        vec![RelayWrite::Created, RelayWrite::Status(CallStatus::Declined)]
    );
    assert_eq!(world.network.transports_created(), 0);
    assert!(b.drain_notices().contains(&Notice::PermissionDenied {
        call_type: CallType::Video
    }));
    assert!(a
        .drain_notices()
        .contains(&Notice::PeerDeclined { call_id: id.clone() }));
    assert_eq!(a.pointer(), None);

    let idle = a.until_phase(CallPhase::Idle).await;
    assert!(idle.call.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_denial_reports_restored_access() {
    let world = World::new();
    let mut a = world.join("alice", "Alice", DevicePolicy::Deny).await;

    a.handle
        .start_call(UserProfile::new("bob", "Bob"), CallType::Audio)
        .unwrap();
    time::sleep(Duration::from_millis(10)).await;
    assert_eq!(a.handle.snapshot().phase, CallPhase::Idle);
    assert!(world.relay.calls_for("alice").is_empty());

    a.devices.set_policy(DevicePolicy::Grant);
    a.handle.retry_permission(CallType::Audio).unwrap();
    time::sleep(Duration::from_millis(10)).await;

    let notices = a.drain_notices();
    assert_eq!(
        notices,
        vec![
            Notice::PermissionDenied {
                call_type: CallType::Audio
            },
            Notice::PermissionRestored {
                call_type: CallType::Audio
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_network_drop_ends_call_on_both_sides() {
    let world = World::new();
    let mut a = world.join("alice", "Alice", DevicePolicy::Grant).await;
    let mut b = world.join("bob", "Bob", DevicePolicy::Grant).await;
    let id = connect(&a, &b, CallType::Video).await;

    world.network.sever();
    a.until("disconnect", |s| s.connection_status == ConnectionStatus::Disconnected)
        .await;
    b.until("disconnect", |s| s.connection_status == ConnectionStatus::Disconnected)
        .await;
    let dropped = Instant::now();

    a.until_phase(CallPhase::Ended).await;
    b.until_phase(CallPhase::Ended).await;
    assert_eq!(dropped.elapsed(), Duration::from_secs(15));
    assert_eq!(world.relay.call(&id).unwrap().status, CallStatus::Ended);

    for party in [&mut a, &mut b] {
        assert!(party
            .drain_notices()
            .iter()
            .any(|n| matches!(n, Notice::CallFailed { .. })));
        assert_eq!(party.devices.ledger().live(), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_connection_recovering_in_time_keeps_call() {
    let world = World::new();
    let a = world.join("alice", "Alice", DevicePolicy::Grant).await;
    let b = world.join("bob", "Bob", DevicePolicy::Grant).await;
    let id = connect(&a, &b, CallType::Audio).await;

    world.network.sever();
    a.until("disconnect", |s| s.connection_status == ConnectionStatus::Disconnected)
        .await;
    time::sleep(Duration::from_secs(10)).await;
    world.network.restore();
    a.until("reconnect", |s| s.connection_status == ConnectionStatus::Connected)
        .await;

    time::sleep(Duration::from_secs(20)).await;
    assert_eq!(a.handle.snapshot().phase, CallPhase::Connected);
    assert_eq!(b.handle.snapshot().phase, CallPhase::Connected);
    assert_eq!(world.relay.call(&id).unwrap().status, CallStatus::Answered);
}

#[tokio::test(start_paused = true)]
async fn test_incoming_ring_ignored_while_busy() {
    let world = World::new();
    let a = world.join("alice", "Alice", DevicePolicy::Grant).await;
    let b = world.join("bob", "Bob", DevicePolicy::Grant).await;
    let c = world.join("carol", "Carol", DevicePolicy::Grant).await;
    let id = connect(&a, &b, CallType::Audio).await;

    c.handle.start_call(b.profile.clone(), CallType::Audio).unwrap();
    c.until_phase(CallPhase::OutgoingRinging).await;
    time::sleep(Duration::from_millis(10)).await;

    assert_eq!(b.handle.snapshot().call_id(), Some(&id));
    assert_eq!(b.handle.snapshot().phase, CallPhase::Connected);
    c.until_phase(CallPhase::Declined).await;
    assert_eq!(b.handle.snapshot().phase, CallPhase::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_unload_declines_ringing_call() {
    let world = World::new();
    let mut a = world.join("alice", "Alice", DevicePolicy::Grant).await;
    let b = world.join("bob", "Bob", DevicePolicy::Grant).await;

    a.handle.start_call(b.profile.clone(), CallType::Audio).unwrap();
    let ringing = b.until_phase(CallPhase::IncomingRinging).await;
    let id = ringing.call_id().unwrap().clone();

    b.handle.unload().await.unwrap();
    assert_eq!(world.relay.call(&id).unwrap().status, CallStatus::Declined);
    a.until_phase(CallPhase::Declined).await;
    assert!(a
        .drain_notices()
        .contains(&Notice::PeerDeclined { call_id: id }));
}

#[tokio::test(start_paused = true)]
async fn test_mute_and_camera_toggle_local_tracks() {
    let world = World::new();
    let a = world.join("alice", "Alice", DevicePolicy::Grant).await;
    let b = world.join("bob", "Bob", DevicePolicy::Grant).await;
    connect(&a, &b, CallType::Video).await;

    a.handle.toggle_mute().unwrap();
    let snap = a.until("mute", |s| s.is_muted).await;
    let local = snap.local_stream.unwrap();
    assert!(local.audio_tracks().iter().all(|t| !t.is_enabled()));
    assert!(local.video_tracks().iter().all(|t| t.is_enabled()));

    a.handle.toggle_camera().unwrap();
    a.until("camera off", |s| s.camera_off).await;
    assert!(local.video_tracks().iter().all(|t| !t.is_enabled()));

    a.handle.toggle_mute().unwrap();
    a.until("unmute", |s| !s.is_muted).await;
    assert!(local.audio_tracks().iter().all(|t| t.is_enabled()));
}

#[tokio::test(start_paused = true)]
async fn test_restart_ends_call_left_by_previous_run() {
    let world = World::new();
    let a = world.join("alice", "Alice", DevicePolicy::Grant).await;
    a.handle
        .start_call(UserProfile::new("bob", "Bob"), CallType::Audio)
        .unwrap();
    let id = a
        .until_phase(CallPhase::OutgoingRinging)
        .await
        .call_id()
        .unwrap()
        .clone();

    // A second engine picking up the same pointer file, as after a crash.
    let handle = CallEngine::spawn(CallContext {
        relay: Arc::new(world.relay.clone()),
        devices: Arc::new(SyntheticDevices::new(DevicePolicy::Grant)),
        transports: Arc::new(world.network.clone()),
        pointer: ActiveCallPointer::persistent(a.pointer_path.clone()),
        settings: CallSettings::default(),
        local_user: a.profile.clone(),
    })
    .await
    .unwrap();

    assert_eq!(world.relay.call(&id).unwrap().status, CallStatus::Ended);
    assert_eq!(ActiveCallPointer::load(&a.pointer_path).unwrap(), None);
    assert_eq!(handle.snapshot().phase, CallPhase::Idle);
}
