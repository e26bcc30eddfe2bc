//! Ring and ringback alerts driven by the call phase.

use std::io::Write;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::calling::session::{CallPhase, CallSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alert {
    /// Someone is calling us.
    Incoming,
    /// Ringback while we wait for the peer.
    Outgoing,
}

impl Alert {
    pub fn for_phase(phase: CallPhase) -> Option<Alert> {
        match phase {
            CallPhase::IncomingRinging => Some(Alert::Incoming),
            CallPhase::OutgoingRinging => Some(Alert::Outgoing),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Alert::Incoming => "incoming",
            Alert::Outgoing => "outgoing",
        }
    }

    /// Interval between repeats of the alert.
    pub fn cadence(&self) -> Duration {
        match self {
            Alert::Incoming => Duration::from_millis(1500),
            Alert::Outgoing => Duration::from_secs(3),
        }
    }
}

/// Something that can loop an alert sound.
pub trait AlertSink: Send {
    fn start_loop(&mut self, alert: Alert);
    fn stop(&mut self, alert: Alert);
}

/// Logs alert changes instead of playing them.
#[derive(Debug, Default)]
pub struct TracingAlerts;

impl AlertSink for TracingAlerts {
    fn start_loop(&mut self, alert: Alert) {
        tracing::info!("Ringing ({})", alert.as_str());
    }

    fn stop(&mut self, alert: Alert) {
        tracing::debug!("Ring stopped ({})", alert.as_str());
    }
}

/// Rings the terminal bell on stderr at the alert's cadence.
#[derive(Debug, Default)]
pub struct TerminalBell {
    task: Option<(Alert, JoinHandle<()>)>,
}

impl TerminalBell {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AlertSink for TerminalBell {
    fn start_loop(&mut self, alert: Alert) {
        if let Some((_, task)) = self.task.take() {
            task.abort();
        }
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(alert.cadence());
            loop {
                ticker.tick().await;
                let mut err = std::io::stderr();
                let _ = err.write_all(b"\x07");
                let _ = err.flush();
            }
        });
        self.task = Some((alert, handle));
    }

    fn stop(&mut self, alert: Alert) {
        if self.task.as_ref().is_some_and(|(a, _)| *a == alert) {
            if let Some((_, task)) = self.task.take() {
                task.abort();
            }
        }
    }
}

impl Drop for TerminalBell {
    fn drop(&mut self) {
        if let Some((_, task)) = self.task.take() {
            task.abort();
        }
    }
}

/// Keeps at most one alert looping, matching the current phase.
pub struct RingtoneCoordinator<S: AlertSink> {
    sink: S,
    playing: Option<Alert>,
}

impl<S: AlertSink> RingtoneCoordinator<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            playing: None,
        }
    }

    #[cfg(test)]
    pub fn playing(&self) -> Option<Alert> {
        self.playing
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Apply a phase. The old alert is stopped before a new one starts.
    pub fn update(&mut self, phase: CallPhase) {
        let wanted = Alert::for_phase(phase);
        if wanted == self.playing {
            return;
        }
        if let Some(current) = self.playing.take() {
            self.sink.stop(current);
        }
        if let Some(next) = wanted {
            self.sink.start_loop(next);
            self.playing = Some(next);
        }
    }

    pub fn silence(&mut self) {
        if let Some(current) = self.playing.take() {
            self.sink.stop(current);
        }
    }
}

/// Drive `sink` from the engine's snapshots until the engine goes away.
pub fn spawn_ringtones<S>(mut state: watch::Receiver<CallSnapshot>, sink: S) -> JoinHandle<()>
where
    S: AlertSink + 'static,
{
    tokio::spawn(async move {
        let mut coordinator = RingtoneCoordinator::new(sink);
        loop {
            let phase = state.borrow_and_update().phase;
            coordinator.update(phase);
            if state.changed().await.is_err() {
                break;
            }
        }
        coordinator.silence();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records calls and fails on overlapping loops.
    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<String>>>,
        live: Arc<Mutex<Vec<Alert>>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl AlertSink for Recorder {
        fn start_loop(&mut self, alert: Alert) {
            let mut live = self.live.lock().unwrap();
            assert!(live.is_empty(), "{:?} started while {:?} looping", alert, live);
            live.push(alert);
            self.events
                .lock()
                .unwrap()
                .push(format!("start {}", alert.as_str()));
        }

        fn stop(&mut self, alert: Alert) {
            self.live.lock().unwrap().retain(|a| *a != alert);
            self.events
                .lock()
                .unwrap()
                .push(format!("stop {}", alert.as_str()));
        }
    }

    #[test]
    fn test_phase_mapping() {
        assert_eq!(Alert::for_phase(CallPhase::IncomingRinging), Some(Alert::Incoming));
        assert_eq!(Alert::for_phase(CallPhase::OutgoingRinging), Some(Alert::Outgoing));
        assert_eq!(Alert::for_phase(CallPhase::Connected), None);
        assert_eq!(Alert::for_phase(CallPhase::Idle), None);
    }

    #[test]
    fn test_switch_stops_before_starting() {
        let rec = Recorder::default();
        let mut coord = RingtoneCoordinator::new(rec.clone());

        coord.update(CallPhase::IncomingRinging);
        coord.update(CallPhase::IncomingRinging);
        coord.update(CallPhase::OutgoingRinging);
        coord.update(CallPhase::Answered);
        coord.update(CallPhase::Connected);

        assert_eq!(
            rec.events(),
            vec!["start incoming", "stop incoming", "start outgoing", "stop outgoing"]
        );
        assert_eq!(coord.playing(), None);
    }

    #[tokio::test]
    async fn test_spawned_coordinator_follows_snapshots() {
        let (tx, rx) = watch::channel(CallSnapshot::default());
        let rec = Recorder::default();
        let task = spawn_ringtones(rx, rec.clone());

        tx.send_modify(|s| s.phase = CallPhase::OutgoingRinging);
        tokio::task::yield_now().await;
        tx.send_modify(|s| s.phase = CallPhase::Declined);
        tokio::task::yield_now().await;
        drop(tx);
        task.await.unwrap();

        let events = rec.events();
        assert_eq!(events.first().map(String::as_str), Some("start outgoing"));
        assert_eq!(events.last().map(String::as_str), Some("stop outgoing"));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_terminal_bell_aborts_loop_on_stop() {
        let mut bell = TerminalBell::new();
        bell.start_loop(Alert::Incoming);
        bell.stop(Alert::Outgoing);
        assert!(bell.task.is_some());
        bell.stop(Alert::Incoming);
        assert!(bell.task.is_none());
    }
}
