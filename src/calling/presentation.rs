//! Call window presentation state: full view vs a draggable floating tile.
//!
//! Purely local UI state. Nothing here looks at connectivity.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::calling::session::CallSnapshot;
use crate::models::CallId;

/// Pixel dimensions of the floating tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileSize {
    pub width: u32,
    pub height: u32,
}

impl TileSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewMode {
    #[default]
    Full,
    Floating,
}

impl ViewMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewMode::Full => "full",
            ViewMode::Floating => "floating",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizeMode {
    #[default]
    Medium,
    Large,
}

impl SizeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SizeMode::Medium => "medium",
            SizeMode::Large => "large",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PresentationSettings {
    pub medium: TileSize,
    pub large: TileSize,
    /// Length of the floating-to-full restore animation.
    pub restore_duration: Duration,
}

impl Default for PresentationSettings {
    fn default() -> Self {
        Self {
            medium: TileSize::new(256, 192),
            large: TileSize::new(320, 240),
            restore_duration: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Restore {
    from: (f64, f64),
    elapsed: Duration,
}

/// View/size mode plus drag position of the call window.
#[derive(Debug)]
pub struct PresentationController {
    settings: PresentationSettings,
    view: ViewMode,
    size: SizeMode,
    position: (f64, f64),
    restore: Option<Restore>,
    attached: Option<CallId>,
}

impl Default for PresentationController {
    fn default() -> Self {
        Self::new(PresentationSettings::default())
    }
}

impl PresentationController {
    pub fn new(settings: PresentationSettings) -> Self {
        Self {
            settings,
            view: ViewMode::Full,
            size: SizeMode::Medium,
            position: (0.0, 0.0),
            restore: None,
            attached: None,
        }
    }

    /// Current view mode. Stays `Floating` while a restore is animating.
    pub fn view_mode(&self) -> ViewMode {
        self.view
    }

    pub fn size_mode(&self) -> SizeMode {
        self.size
    }

    pub fn dimensions(&self) -> TileSize {
        match self.size {
            SizeMode::Medium => self.settings.medium,
            SizeMode::Large => self.settings.large,
        }
    }

    pub fn position(&self) -> (f64, f64) {
        self.position
    }

    pub fn is_restoring(&self) -> bool {
        self.restore.is_some()
    }

    pub fn attached_call(&self) -> Option<&CallId> {
        self.attached.as_ref()
    }

    /// Switch to the floating tile. Immediate; interrupts a running restore
    /// and keeps the tile where the animation had got to.
    pub fn enter_floating(&mut self) {
        if self.restore.take().is_some() {
            tracing::debug!("Restore interrupted at {:?}", self.position);
        }
        self.view = ViewMode::Floating;
    }

    /// Animate back to full view; the mode flips when `advance` completes it.
    pub fn exit_floating(&mut self) {
        if self.view != ViewMode::Floating || self.restore.is_some() {
            return;
        }
        self.restore = Some(Restore {
            from: self.position,
            elapsed: Duration::ZERO,
        });
        if self.settings.restore_duration.is_zero() {
            self.finish_restore();
        }
    }

    pub fn toggle_view(&mut self) {
        match (self.view, self.restore.is_some()) {
            (ViewMode::Full, _) | (ViewMode::Floating, true) => self.enter_floating(),
            (ViewMode::Floating, false) => self.exit_floating(),
        }
    }

    /// Dimensions only; position and animation are untouched.
    pub fn toggle_size(&mut self) {
        self.size = match self.size {
            SizeMode::Medium => SizeMode::Large,
            SizeMode::Large => SizeMode::Medium,
        };
    }

    /// Move the floating tile. Ignored in full view and during a restore.
    pub fn drag_to(&mut self, x: f64, y: f64) {
        if self.view == ViewMode::Floating && self.restore.is_none() {
            self.position = (x, y);
        }
    }

    pub fn drag_by(&mut self, dx: f64, dy: f64) {
        let (x, y) = self.position;
        self.drag_to(x + dx, y + dy);
    }

    /// Step the restore animation. Returns true on the step that completes it.
    pub fn advance(&mut self, elapsed: Duration) -> bool {
        let Some(restore) = self.restore.as_mut() else {
            return false;
        };
        restore.elapsed += elapsed;
        let total = self.settings.restore_duration.as_secs_f64();
        let t = (restore.elapsed.as_secs_f64() / total).min(1.0);
        if t >= 1.0 {
            self.finish_restore();
            return true;
        }
        // ease-out cubic
        let remaining = (1.0 - t).powi(3);
        let (fx, fy) = restore.from;
        self.position = (fx * remaining, fy * remaining);
        false
    }

    fn finish_restore(&mut self) {
        self.restore = None;
        self.position = (0.0, 0.0);
        self.view = ViewMode::Full;
    }

    /// A new call took over the window.
    pub fn attach(&mut self, call_id: CallId) {
        tracing::debug!("Presentation attached to call {}", call_id);
        self.attached = Some(call_id);
    }

    /// The call finished; the window returns to full view without animating.
    pub fn detach(&mut self) {
        if let Some(id) = self.attached.take() {
            tracing::debug!("Presentation detached from call {}", id);
        }
        self.restore = None;
        self.position = (0.0, 0.0);
        self.view = ViewMode::Full;
    }

    /// Follow the session: attach when a call is live, detach once it is over.
    pub fn sync(&mut self, snapshot: &CallSnapshot) {
        let live = !snapshot.phase.is_terminal() && snapshot.call.is_some();
        match (live, snapshot.call_id()) {
            (true, Some(id)) if self.attached.as_ref() != Some(id) => self.attach(id.clone()),
            (false, _) if self.attached.is_some() => self.detach(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::session::CallPhase;
    use crate::models::{CallRecord, CallType, NewCall};

    fn floating_at(x: f64, y: f64) -> PresentationController {
        let mut p = PresentationController::default();
        p.enter_floating();
        p.drag_to(x, y);
        p
    }

    #[test]
    fn test_enter_floating_is_immediate() {
        let mut p = PresentationController::default();
        assert_eq!(p.view_mode(), ViewMode::Full);
        p.toggle_view();
        assert_eq!(p.view_mode(), ViewMode::Floating);
        assert!(!p.is_restoring());
    }

    #[test]
    fn test_restore_flips_mode_only_when_animation_completes() {
        let mut p = floating_at(100.0, -40.0);
        p.toggle_view();
        assert!(p.is_restoring());
        assert_eq!(p.view_mode(), ViewMode::Floating);

        assert!(!p.advance(Duration::from_millis(150)));
        assert_eq!(p.view_mode(), ViewMode::Floating);
        let (x, y) = p.position();
        assert!(x > 0.0 && x < 100.0);
        assert!(y < 0.0 && y > -40.0);

        assert!(p.advance(Duration::from_millis(150)));
        assert_eq!(p.view_mode(), ViewMode::Full);
        assert_eq!(p.position(), (0.0, 0.0));
        assert!(!p.advance(Duration::from_millis(10)));
    }

    #[test]
    fn test_size_toggle_leaves_position_and_animation_alone() {
        let mut p = floating_at(30.0, 30.0);
        p.toggle_size();
        assert_eq!(p.dimensions(), TileSize::new(320, 240));
        assert_eq!(p.position(), (30.0, 30.0));

        p.exit_floating();
        p.toggle_size();
        assert!(p.is_restoring());
        assert_eq!(p.dimensions(), TileSize::new(256, 192));
    }

    #[test]
    fn test_drag_ignored_in_full_view() {
        let mut p = PresentationController::default();
        p.drag_to(50.0, 50.0);
        assert_eq!(p.position(), (0.0, 0.0));

        let mut p = floating_at(10.0, 10.0);
        p.drag_by(5.0, -5.0);
        assert_eq!(p.position(), (15.0, 5.0));
    }

    #[test]
    fn test_sync_detaches_finished_call_to_full_view() {
        let record = CallRecord::from_new(
            "call-1".into(),
            NewCall {
                caller_id: "alice".into(),
                caller_name: "Alice".into(),
                caller_photo_url: None,
                receiver_id: "bob".into(),
                call_type: CallType::Video,
            },
        );
        let mut snap = CallSnapshot {
            phase: CallPhase::Connected,
            call: Some(record),
            ..CallSnapshot::default()
        };
        let mut p = PresentationController::default();
        p.sync(&snap);
        assert_eq!(p.attached_call().map(String::as_str), Some("call-1"));

        p.enter_floating();
        p.drag_to(80.0, 20.0);
        snap.phase = CallPhase::Ended;
        p.sync(&snap);
        assert!(p.attached_call().is_none());
        assert_eq!(p.view_mode(), ViewMode::Full);
        assert_eq!(p.position(), (0.0, 0.0));
    }
}
