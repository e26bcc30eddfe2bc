//! Camera/microphone permission gate.

use std::sync::Arc;

use crate::calling::media::{MediaAccessError, MediaDevices, MediaStream};
use crate::models::CallType;

/// Why access was not granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    /// The user refused; only a manual retry can recover.
    Denied,
    /// Device missing, busy or otherwise unusable.
    Error,
}

/// Result of a feasibility check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionOutcome {
    pub granted: bool,
    pub reason: Option<DenialReason>,
}

impl PermissionOutcome {
    pub fn granted() -> Self {
        Self {
            granted: true,
            reason: None,
        }
    }

    pub fn refused(reason: DenialReason) -> Self {
        Self {
            granted: false,
            reason: Some(reason),
        }
    }
}

impl From<&MediaAccessError> for DenialReason {
    fn from(e: &MediaAccessError) -> Self {
        match e {
            MediaAccessError::Denied => DenialReason::Denied,
            MediaAccessError::Device(_) => DenialReason::Error,
        }
    }
}

/// Wraps the platform devices with the call-level permission policy.
#[derive(Clone)]
pub struct PermissionGate {
    devices: Arc<dyn MediaDevices>,
}

impl PermissionGate {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self { devices }
    }

    /// Check whether media for `call_type` can be opened, without holding it.
    ///
    /// Prompts on every call. Tracks acquired for the check are stopped
    /// before returning.
    pub async fn request_access(&self, call_type: CallType) -> PermissionOutcome {
        match self.devices.get_user_media(call_type).await {
            Ok(stream) => {
                let stopped = stream.stop_all();
                tracing::debug!(
                    "Permission granted for {} call (released {} trial tracks)",
                    call_type,
                    stopped
                );
                PermissionOutcome::granted()
            }
            Err(e) => {
                tracing::warn!("Permission check for {} call failed: {}", call_type, e);
                PermissionOutcome::refused(DenialReason::from(&e))
            }
        }
    }

    /// Open media for `call_type` and keep it; the caller owns the tracks.
    pub async fn acquire(&self, call_type: CallType) -> Result<MediaStream, MediaAccessError> {
        self.devices.get_user_media(call_type).await
    }
}
