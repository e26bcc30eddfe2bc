//! peercall - peer-to-peer audio/video calls
//!
//! Call state lives in one engine task per client; a shared relay carries
//! only the signaling between the two parties.

mod calling;
mod config;
mod models;
mod relay;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use calling::media::MediaDevices;
use calling::presentation::PresentationController;
use calling::ringtone::{spawn_ringtones, TerminalBell, TracingAlerts};
use calling::session::EngineError;
use calling::transport::TransportFactory;
use calling::{
    ActiveCallPointer, CallContext, CallEngine, CallHandle, CallPhase, CallSettings, CallSnapshot,
    DevicePolicy, LoopbackNetwork, Notice, SyntheticDevices,
};
use config::Config;
use models::{CallStatus, CallType, UserProfile};
use relay::{MemoryRelay, RelayClient, SignalingRelay};

#[derive(Parser)]
#[command(name = "peercall")]
#[command(about = "Peer-to-peer audio/video calls with relay signaling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a signaling relay server
    Relay {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:9780")]
        listen: String,
    },

    /// Show or update the local profile and publish it to the relay
    Profile {
        /// User id other parties call you by
        #[arg(long)]
        id: Option<String>,

        /// Display name shown to the other party
        #[arg(long)]
        name: Option<String>,

        /// Photo URL shown to the other party
        #[arg(long)]
        photo: Option<String>,
    },

    /// Wait for incoming calls
    Listen {
        /// Answer every incoming call
        #[arg(long)]
        auto_accept: bool,
    },

    /// Call another user
    Call {
        /// Id of the user to call
        user_id: String,

        /// Video call instead of audio only
        #[arg(long)]
        video: bool,

        /// Hang up this many seconds after connecting
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Show the persisted active call, if any
    Status,

    /// Run a call between two in-process parties
    Demo {
        /// Video call instead of audio only
        #[arg(long)]
        video: bool,

        /// Callee denies camera/microphone access
        #[arg(long)]
        deny: bool,

        /// Drop the network once connected
        #[arg(long)]
        drop_network: bool,

        /// Callee never answers
        #[arg(long)]
        no_answer: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Relay { listen } => {
            relay::server::serve(&listen, MemoryRelay::new()).await?;
        }
        Commands::Profile { id, name, photo } => {
            let mut config = Config::load(config_path)?;
            let changed = id.is_some() || name.is_some() || photo.is_some();
            if let Some(id) = id {
                config.user.id = Some(id);
            }
            if let Some(name) = name {
                config.user.display_name = Some(name);
            }
            if let Some(photo) = photo {
                config.user.photo_url = Some(photo);
            }
            let profile = config.user.profile()?;
            if changed {
                config.save(config_path)?;
                tracing::info!("Profile saved");
                match RelayClient::connect(&config.relay_url).await {
                    Ok(relay) => relay
                        .put_profile(profile.clone())
                        .await
                        .context("Failed to publish profile")?,
                    Err(e) => tracing::warn!("Profile not published: {:#}", e),
                }
            }
            println!("Id:      {}", profile.id);
            println!("Name:    {}", profile.display_name);
            println!("Photo:   {}", profile.photo_url.as_deref().unwrap_or("-"));
            println!("Relay:   {}", config.relay_url);
        }
        Commands::Listen { auto_accept } => {
            let config = Config::load(config_path)?;
            let local = config.user.profile()?;
            let relay = RelayClient::connect(&config.relay_url).await?;
            relay
                .put_profile(local.clone())
                .await
                .context("Failed to publish profile")?;
            let handle = start_engine(&config, Arc::new(relay), local.clone()).await?;
            let _ring = spawn_ringtones(handle.watch(), TerminalBell::new());
            println!("Listening for calls to {} (`help` for commands)", local.id);
            follow(
                &handle,
                Follow {
                    label: "",
                    auto_accept,
                    hang_up_after: None,
                    exit_when_done: false,
                    dial: None,
                    input: Some(spawn_stdin_commands()),
                },
            )
            .await?;
        }
        Commands::Call {
            user_id,
            video,
            duration,
        } => {
            let config = Config::load(config_path)?;
            let local = config.user.profile()?;
            let relay = RelayClient::connect(&config.relay_url).await?;
            let handle = start_engine(&config, Arc::new(relay), local).await?;
            let _ring = spawn_ringtones(handle.watch(), TerminalBell::new());
            let call_type = if video { CallType::Video } else { CallType::Audio };
            println!("Calling {} ({}, `help` for commands)", user_id, call_type);
            follow(
                &handle,
                Follow {
                    label: "",
                    auto_accept: false,
                    hang_up_after: duration.map(Duration::from_secs),
                    exit_when_done: true,
                    dial: Some((user_id, call_type)),
                    input: Some(spawn_stdin_commands()),
                },
            )
            .await?;
        }
        Commands::Status => {
            let config = Config::load(config_path)?;
            let local = config.user.profile()?;
            let path = ActiveCallPointer::path_for(&Config::session_dir()?, &local.id);
            match ActiveCallPointer::load(&path)? {
                Some(id) => {
                    println!("Active call: {}", id);
                    match RelayClient::connect(&config.relay_url).await {
                        Ok(relay) => match relay.get_call(&id).await {
                            Ok(Some(record)) => println!(
                                "  {} call, {} -> {}, {}",
                                record.call_type, record.caller_id, record.receiver_id, record.status
                            ),
                            Ok(None) => println!("  (no longer on the relay)"),
                            Err(e) => println!("  (lookup failed: {})", e),
                        },
                        Err(e) => println!("  (relay unreachable: {:#})", e),
                    }
                }
                None => println!("No active call"),
            }
        }
        Commands::Demo {
            video,
            deny,
            drop_network,
            no_answer,
        } => {
            let config = Config::load(config_path)?;
            run_demo(&config, video, deny, drop_network, no_answer).await?;
        }
    }

    Ok(())
}

fn transport_factory() -> Result<Arc<dyn TransportFactory>> {
    #[cfg(feature = "webrtc")]
    {
        let factory = calling::rtc::RtcTransportFactory::new()
            .context("Failed to initialise WebRTC")?;
        Ok(Arc::new(factory))
    }
    #[cfg(not(feature = "webrtc"))]
    {
        tracing::warn!("Built without the `webrtc` feature; media will not flow between processes");
        Ok(Arc::new(LoopbackNetwork::new()))
    }
}

async fn start_engine(
    config: &Config,
    relay: Arc<dyn SignalingRelay>,
    local: UserProfile,
) -> Result<CallHandle> {
    let pointer = ActiveCallPointer::persistent(ActiveCallPointer::path_for(
        &Config::session_dir()?,
        &local.id,
    ));
    CallEngine::spawn(CallContext {
        relay,
        devices: Arc::new(SyntheticDevices::new(DevicePolicy::Grant)),
        transports: transport_factory()?,
        pointer,
        settings: config.call.settings(),
        local_user: local,
    })
    .await
}

fn describe(snap: &CallSnapshot) -> String {
    let peer = snap
        .peer
        .as_ref()
        .map(|p| p.display_name.as_str())
        .unwrap_or("-");
    match &snap.call {
        Some(call) => format!(
            "{} ({} call with {}, connection {})",
            snap.phase, call.call_type, peer, snap.connection_status
        ),
        None => snap.phase.to_string(),
    }
}

struct Follow<'a> {
    label: &'a str,
    auto_accept: bool,
    hang_up_after: Option<Duration>,
    exit_when_done: bool,
    /// User to ring once following starts, and again after a denied
    /// permission is granted.
    dial: Option<(String, CallType)>,
    /// Typed commands, one per line.
    input: Option<mpsc::UnboundedReceiver<String>>,
}

/// A command typed while following a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Input {
    Accept,
    Decline,
    HangUp,
    Mute,
    Camera,
    Retry,
    Help,
    Quit,
}

const HELP: &str = "Commands: accept, decline, hangup, mute, camera, retry, quit";

impl Input {
    fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "a" | "accept" | "answer" => Some(Input::Accept),
            "d" | "decline" => Some(Input::Decline),
            "h" | "hangup" | "hang-up" | "end" => Some(Input::HangUp),
            "m" | "mute" | "unmute" => Some(Input::Mute),
            "c" | "camera" => Some(Input::Camera),
            "r" | "retry" => Some(Input::Retry),
            "?" | "help" => Some(Input::Help),
            "q" | "quit" | "exit" => Some(Input::Quit),
            _ => None,
        }
    }
}

/// Forward stdin lines from a plain thread, so a read blocked on the
/// terminal never holds up runtime shutdown.
fn spawn_stdin_commands() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn next_line(input: &mut Option<mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match input {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Act on one typed line. Returns false when the user asked to quit.
fn apply_input(
    handle: &CallHandle,
    line: &str,
    denied: Option<CallType>,
    label: &str,
) -> Result<bool> {
    let Some(input) = Input::parse(line) else {
        println!("{}Unknown command `{}`. {}", label, line.trim(), HELP);
        return Ok(true);
    };
    match input {
        Input::Accept => handle.accept()?,
        Input::Decline => handle.decline()?,
        Input::HangUp => handle.hang_up(None, CallStatus::Ended)?,
        Input::Mute => handle.toggle_mute()?,
        Input::Camera => handle.toggle_camera()?,
        Input::Retry => match denied {
            Some(call_type) => handle.retry_permission(call_type)?,
            None => println!("{}Nothing to retry", label),
        },
        Input::Help => println!("{}{}", label, HELP),
        Input::Quit => return Ok(false),
    }
    Ok(true)
}

/// Print phase changes and notices and act on typed commands until the call
/// is over, the user quits or Ctrl-C.
async fn follow(handle: &CallHandle, mut opts: Follow<'_>) -> Result<()> {
    let mut state = handle.watch();
    let mut notices = handle.notices();
    let (mut last, mut muted, mut camera_off) = {
        let snap = state.borrow_and_update();
        (snap.phase, snap.is_muted, snap.camera_off)
    };
    let mut hang_up_at = None;
    let mut denied = None;
    if let Some((user_id, call_type)) = &opts.dial {
        handle.call_user(user_id.clone(), *call_type)?;
    }

    loop {
        // Engine output first, so typed input sees the latest notice
        tokio::select! {
            biased;
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let snap = state.borrow_and_update().clone();
                if (snap.is_muted, snap.camera_off) != (muted, camera_off) {
                    muted = snap.is_muted;
                    camera_off = snap.camera_off;
                    println!(
                        "{}microphone {}, camera {}",
                        opts.label,
                        if muted { "muted" } else { "on" },
                        if camera_off { "off" } else { "on" }
                    );
                }
                if snap.phase == last {
                    continue;
                }
                last = snap.phase;
                println!("{}{}", opts.label, describe(&snap));
                match snap.phase {
                    CallPhase::IncomingRinging if opts.auto_accept => handle.accept()?,
                    CallPhase::IncomingRinging if opts.input.is_some() => {
                        println!("{}Type `accept` or `decline`", opts.label);
                    }
                    CallPhase::Connected => {
                        hang_up_at = opts.hang_up_after.map(|after| Instant::now() + after);
                    }
                    phase if phase.is_terminal() => {
                        hang_up_at = None;
                        if opts.exit_when_done {
                            break;
                        }
                    }
                    _ => {}
                }
            }
            notice = notices.recv() => match notice {
                Ok(notice) => {
                    println!("{}! {}", opts.label, notice);
                    match notice {
                        Notice::RelayLost => break,
                        Notice::PermissionDenied { call_type } if opts.input.is_some() => {
                            denied = Some(call_type);
                            println!("{}Type `retry` once access is allowed", opts.label);
                        }
                        Notice::PermissionRestored { .. } => {
                            denied = None;
                            let settled = last == CallPhase::Idle || last.is_terminal();
                            match &opts.dial {
                                Some((user_id, call_type)) if settled => {
                                    println!("{}Calling {} again", opts.label, user_id);
                                    handle.call_user(user_id.clone(), *call_type)?;
                                }
                                _ => {}
                            }
                        }
                        // A refused permission or failed dial never leaves idle
                        _ if opts.exit_when_done && last == CallPhase::Idle => break,
                        _ => {}
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Skipped {} notices", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            line = next_line(&mut opts.input) => match line {
                Some(line) => {
                    if !apply_input(handle, &line, denied, opts.label)? {
                        break;
                    }
                }
                None => opts.input = None,
            },
            _ = sleep_until_opt(hang_up_at) => {
                hang_up_at = None;
                println!("{}Hanging up", opts.label);
                handle.hang_up(None, CallStatus::Ended)?;
            }
            _ = tokio::signal::ctrl_c() => {
                println!("{}Interrupted", opts.label);
                break;
            }
        }
    }

    // The engine only stops on its own when the relay is gone.
    match handle.unload().await {
        Ok(()) => Ok(()),
        Err(EngineError::Stopped) => bail!("Lost connection to the relay"),
    }
}

async fn spawn_party(
    relay: &MemoryRelay,
    network: &LoopbackNetwork,
    devices: Arc<dyn MediaDevices>,
    settings: CallSettings,
    profile: UserProfile,
) -> Result<CallHandle> {
    relay
        .put_profile(profile.clone())
        .await
        .context("Failed to publish demo profile")?;
    CallEngine::spawn(CallContext {
        relay: Arc::new(relay.clone()),
        devices,
        transports: Arc::new(network.clone()),
        pointer: ActiveCallPointer::in_memory(),
        settings,
        local_user: profile,
    })
    .await
}

async fn run_demo(
    config: &Config,
    video: bool,
    deny: bool,
    drop_network: bool,
    no_answer: bool,
) -> Result<()> {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let settings = config.call.settings();
    let alice = UserProfile::new("alice", "Alice");
    let bob = UserProfile::new("bob", "Bob");
    let bob_policy = if deny {
        DevicePolicy::Deny
    } else {
        DevicePolicy::Grant
    };

    let a = spawn_party(
        &relay,
        &network,
        Arc::new(SyntheticDevices::new(DevicePolicy::Grant)),
        settings.clone(),
        alice,
    )
    .await?;
    let b = spawn_party(
        &relay,
        &network,
        Arc::new(SyntheticDevices::new(bob_policy)),
        settings,
        bob.clone(),
    )
    .await?;
    let _ring = spawn_ringtones(a.watch(), TracingAlerts);

    let callee = b.clone();
    let bob_side = tokio::spawn(async move {
        follow(
            &callee,
            Follow {
                label: "  bob: ",
                auto_accept: !no_answer,
                hang_up_after: None,
                exit_when_done: true,
                dial: None,
                input: None,
            },
        )
        .await
    });

    let call_type = if video { CallType::Video } else { CallType::Audio };
    a.start_call(bob, call_type)?;

    let mut view = PresentationController::new(config.presentation.settings());
    let mut state = a.watch();
    let mut notices = a.notices();
    let mut last = CallPhase::Idle;
    let mut hang_up_at = None;
    let mut call_id = None;

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let snap = state.borrow_and_update().clone();
                view.sync(&snap);
                if let Some(id) = snap.call_id() {
                    call_id = Some(id.clone());
                }
                if snap.phase == last {
                    continue;
                }
                last = snap.phase;
                println!("alice: {}", describe(&snap));
                if snap.phase == CallPhase::Connected {
                    view.toggle_view();
                    view.drag_to(120.0, 80.0);
                    view.drag_by(-20.0, 10.0);
                    view.toggle_size();
                    let size = view.dimensions();
                    println!(
                        "alice: view {} {} {}x{} at {:?} for call {}",
                        view.view_mode().as_str(),
                        view.size_mode().as_str(),
                        size.width,
                        size.height,
                        view.position(),
                        view.attached_call().map(String::as_str).unwrap_or("-")
                    );
                    if drop_network {
                        println!("-- network severed");
                        network.sever();
                    } else {
                        hang_up_at = Some(Instant::now() + Duration::from_secs(3));
                    }
                }
                if snap.phase.is_terminal() {
                    break;
                }
            }
            notice = notices.recv() => {
                if let Ok(notice) = notice {
                    println!("alice! {}", notice);
                    if last == CallPhase::Idle {
                        break;
                    }
                }
            }
            _ = sleep_until_opt(hang_up_at) => {
                hang_up_at = None;
                view.toggle_view();
                while view.is_restoring() {
                    view.advance(Duration::from_millis(16));
                }
                println!("alice: view {} at {:?}", view.view_mode().as_str(), view.position());
                a.hang_up(None, CallStatus::Ended)?;
            }
        }
    }

    a.unload().await?;
    bob_side.await.context("Callee task panicked")??;

    if let Some(id) = call_id {
        println!("Relay writes for call {}:", id);
        for write in relay.history(&id) {
            println!("  {:?}", write);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pair {
        caller: CallHandle,
        callee: CallHandle,
        caller_devices: SyntheticDevices,
    }

    async fn pair(caller_policy: DevicePolicy) -> Pair {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let caller_devices = SyntheticDevices::new(caller_policy);
        let caller = spawn_party(
            &relay,
            &network,
            Arc::new(caller_devices.clone()),
            CallSettings::default(),
            UserProfile::new("alice", "Alice"),
        )
        .await
        .unwrap();
        let callee = spawn_party(
            &relay,
            &network,
            Arc::new(SyntheticDevices::new(DevicePolicy::Grant)),
            CallSettings::default(),
            UserProfile::new("bob", "Bob"),
        )
        .await
        .unwrap();
        Pair {
            caller,
            callee,
            caller_devices,
        }
    }

    async fn until(handle: &CallHandle, f: impl FnMut(&CallSnapshot) -> bool) -> CallSnapshot {
        tokio::time::timeout(Duration::from_secs(60), handle.wait_for(f))
            .await
            .unwrap()
            .unwrap()
    }

    fn typed(
        handle: &CallHandle,
        dial: Option<(String, CallType)>,
        exit_when_done: bool,
    ) -> (
        mpsc::UnboundedSender<String>,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = handle.clone();
        let task = tokio::spawn(async move {
            follow(
                &handle,
                Follow {
                    label: "",
                    auto_accept: false,
                    hang_up_after: None,
                    exit_when_done,
                    dial,
                    input: Some(rx),
                },
            )
            .await
        });
        (tx, task)
    }

    #[test]
    fn test_input_parsing() {
        assert_eq!(Input::parse("accept"), Some(Input::Accept));
        assert_eq!(Input::parse("  A \n"), Some(Input::Accept));
        assert_eq!(Input::parse("decline"), Some(Input::Decline));
        assert_eq!(Input::parse("hangup"), Some(Input::HangUp));
        assert_eq!(Input::parse("end"), Some(Input::HangUp));
        assert_eq!(Input::parse("MUTE"), Some(Input::Mute));
        assert_eq!(Input::parse("c"), Some(Input::Camera));
        assert_eq!(Input::parse("retry"), Some(Input::Retry));
        assert_eq!(Input::parse("?"), Some(Input::Help));
        assert_eq!(Input::parse("exit"), Some(Input::Quit));
        assert_eq!(Input::parse("dance"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_typed_decline_reaches_caller() {
        let p = pair(DevicePolicy::Grant).await;
        let (tx, task) = typed(&p.callee, None, false);

        p.caller.call_user("bob", CallType::Audio).unwrap();
        until(&p.callee, |s| s.phase == CallPhase::IncomingRinging).await;
        tx.send("decline".into()).unwrap();
        until(&p.caller, |s| s.phase == CallPhase::Declined).await;

        tx.send("quit".into()).unwrap();
        task.await.unwrap().unwrap();
        assert!(matches!(p.callee.accept(), Err(EngineError::Stopped)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_typed_commands_drive_connected_call() {
        let p = pair(DevicePolicy::Grant).await;
        let (tx, task) = typed(&p.callee, None, false);

        p.caller.call_user("bob", CallType::Video).unwrap();
        until(&p.callee, |s| s.phase == CallPhase::IncomingRinging).await;
        tx.send("accept".into()).unwrap();
        let snap = until(&p.caller, |s| s.phase == CallPhase::Connected).await;
        assert_eq!(snap.peer.unwrap().display_name, "Bob");
        until(&p.callee, |s| s.phase == CallPhase::Connected).await;

        tx.send("mute".into()).unwrap();
        until(&p.callee, |s| s.is_muted).await;
        tx.send("camera".into()).unwrap();
        until(&p.callee, |s| s.camera_off).await;

        tx.send("hangup".into()).unwrap();
        until(&p.caller, |s| s.phase == CallPhase::Ended).await;
        until(&p.callee, |s| s.phase == CallPhase::Ended).await;

        tx.send("quit".into()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_denial_dials_again() {
        let p = pair(DevicePolicy::Deny).await;
        let mut notices = p.caller.notices();
        let (tx, task) = typed(&p.caller, Some(("bob".into(), CallType::Audio)), true);

        loop {
            let notice = tokio::time::timeout(Duration::from_secs(60), notices.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(notice, Notice::PermissionDenied { .. }) {
                break;
            }
        }
        assert_eq!(p.caller.snapshot().phase, CallPhase::Idle);

        p.caller_devices.set_policy(DevicePolicy::Grant);
        tx.send("retry".into()).unwrap();
        until(&p.callee, |s| s.phase == CallPhase::IncomingRinging).await;
        let snap = until(&p.caller, |s| s.phase == CallPhase::OutgoingRinging).await;
        assert_eq!(snap.peer.unwrap().id, "bob");

        tx.send("hangup".into()).unwrap();
        task.await.unwrap().unwrap();
        until(&p.callee, |s| s.phase.is_terminal()).await;
    }
}
