//! Session directory: call allocation, the persisted active-call pointer and
//! the participant profile cache.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{CallId, CallRecord, CallStatus, CallType, NewCall, UserId, UserProfile};
use crate::relay::{RelayResult, SignalingRelay};

#[derive(Debug, Serialize, Deserialize)]
struct PointerFile {
    call_id: CallId,
    armed_at: DateTime<Utc>,
}

/// Id of the call active for this client, persisted across restarts.
#[derive(Debug, Default)]
pub struct ActiveCallPointer {
    path: Option<PathBuf>,
    current: Option<CallId>,
}

impl ActiveCallPointer {
    /// Pointer file for `user_id` inside `dir`.
    pub fn path_for(dir: &Path, user_id: &str) -> PathBuf {
        let safe: String = user_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        dir.join(format!("active-call-{}.json", safe))
    }

    /// A pointer that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// A pointer backed by `path`, picking up whatever a previous run left.
    pub fn persistent(path: PathBuf) -> Self {
        let current = match Self::load(&path) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("Ignoring unreadable call pointer {}: {:#}", path.display(), e);
                None
            }
        };
        Self {
            path: Some(path),
            current,
        }
    }

    /// Read a pointer file without taking ownership of it.
    pub fn load(path: &Path) -> Result<Option<CallId>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path).context("Failed to read call pointer")?;
        let file: PointerFile =
            serde_json::from_str(&content).context("Failed to parse call pointer")?;
        Ok(Some(file.call_id))
    }

    pub fn current(&self) -> Option<&CallId> {
        self.current.as_ref()
    }

    pub fn arm(&mut self, call_id: &CallId) {
        self.current = Some(call_id.clone());
        if let Some(path) = &self.path {
            if let Err(e) = write_pointer(path, call_id) {
                tracing::warn!("Failed to persist call pointer: {:#}", e);
            }
        }
    }

    pub fn clear(&mut self) {
        self.current = None;
        if let Some(path) = &self.path {
            if path.exists() {
                if let Err(e) = fs::remove_file(path) {
                    tracing::warn!("Failed to remove call pointer {}: {}", path.display(), e);
                }
            }
        }
    }
}

fn write_pointer(path: &Path, call_id: &CallId) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).context("Failed to create session directory")?;
    }
    let file = PointerFile {
        call_id: call_id.clone(),
        armed_at: Utc::now(),
    };
    let content = serde_json::to_string(&file).context("Failed to serialize call pointer")?;
    fs::write(path, content).context("Failed to write call pointer")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perms).context("Failed to set call pointer permissions")?;
    }

    Ok(())
}

/// Participant id to public profile, filled from the relay on a miss.
#[derive(Debug, Default)]
pub struct ProfileCache {
    profiles: HashMap<UserId, UserProfile>,
}

impl ProfileCache {
    pub fn remember(&mut self, profile: UserProfile) {
        self.profiles.insert(profile.id.clone(), profile);
    }

    /// Cached profile for `id`, asking the relay on a miss. Misses are not
    /// cached so a profile published later is still found.
    pub async fn lookup(&mut self, relay: &dyn SignalingRelay, id: &UserId) -> Option<UserProfile> {
        if let Some(p) = self.profiles.get(id) {
            return Some(p.clone());
        }
        let profile = match relay.get_profile(id).await {
            Ok(profile) => profile?,
            Err(e) => {
                tracing::debug!("Profile lookup for {} failed: {}", id, e);
                return None;
            }
        };
        self.remember(profile.clone());
        Some(profile)
    }
}

/// Process-wide call registry for one local user.
pub struct SessionDirectory {
    relay: Arc<dyn SignalingRelay>,
    pointer: ActiveCallPointer,
    profiles: ProfileCache,
}

impl SessionDirectory {
    pub fn new(relay: Arc<dyn SignalingRelay>, pointer: ActiveCallPointer) -> Self {
        Self {
            relay,
            pointer,
            profiles: ProfileCache::default(),
        }
    }

    /// Create a ringing call record from `caller` to `receiver`.
    pub async fn allocate_call(
        &mut self,
        caller: &UserProfile,
        receiver: &UserProfile,
        call_type: CallType,
    ) -> RelayResult<CallRecord> {
        let new = NewCall {
            caller_id: caller.id.clone(),
            caller_name: caller.display_name.clone(),
            caller_photo_url: caller.photo_url.clone(),
            receiver_id: receiver.id.clone(),
            call_type,
        };
        let id = self.relay.create_call(new.clone()).await?;
        self.profiles.remember(receiver.clone());
        tracing::info!("Allocated {} call {} to {}", call_type, id, receiver.id);
        Ok(CallRecord::from_new(id, new))
    }

    pub fn pointer_mut(&mut self) -> &mut ActiveCallPointer {
        &mut self.pointer
    }

    pub fn profiles_mut(&mut self) -> &mut ProfileCache {
        &mut self.profiles
    }

    pub async fn profile(&mut self, id: &UserId) -> Option<UserProfile> {
        self.profiles.lookup(self.relay.as_ref(), id).await
    }

    /// Settle a pointer left by a previous run.
    ///
    /// A transport never survives a restart, so a record still ringing or
    /// answered is ended. Returns the id of the call that was ended, if any.
    pub async fn reconcile(&mut self) -> Option<CallId> {
        let id = self.pointer.current()?.clone();
        tracing::info!("Found call pointer {} from a previous run", id);

        let ended = match self.relay.get_call(&id).await {
            Ok(Some(record)) if record.status.is_active() => {
                match self.relay.update_status(&id, CallStatus::Ended).await {
                    Ok(()) => {
                        tracing::info!("Ended orphaned call {}", id);
                        Some(id)
                    }
                    Err(e) => {
                        tracing::warn!("Failed to end orphaned call {}: {}", id, e);
                        None
                    }
                }
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("Could not check orphaned call {}: {}", id, e);
                None
            }
        };
        self.pointer.clear();
        ended
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::MemoryRelay;

    fn temp_pointer_path(tag: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("peercall-test-{}-{}", tag, uuid::Uuid::new_v4().simple()))
            .join("pointer.json")
    }

    #[test]
    fn test_pointer_survives_reload() {
        let path = temp_pointer_path("reload");
        let mut pointer = ActiveCallPointer::persistent(path.clone());
        assert!(pointer.current().is_none());

        pointer.arm(&"call-9".to_string());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        let reloaded = ActiveCallPointer::persistent(path.clone());
        assert_eq!(reloaded.current().map(String::as_str), Some("call-9"));

        pointer.clear();
        assert!(!path.exists());
        assert_eq!(ActiveCallPointer::load(&path).unwrap(), None);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_pointer_path_is_sanitized() {
        let path = ActiveCallPointer::path_for(Path::new("/tmp"), "a/b c");
        assert_eq!(path, PathBuf::from("/tmp/active-call-a_b_c.json"));
    }

    #[tokio::test]
    async fn test_profile_cache_fills_on_miss() {
        let relay = MemoryRelay::new();
        relay
            .put_profile(UserProfile::new("bob", "Bob"))
            .await
            .unwrap();
        let mut cache = ProfileCache::default();

        assert_eq!(
            cache.lookup(&relay, &"bob".to_string()).await.unwrap().display_name,
            "Bob"
        );
        assert!(cache.profiles.contains_key("bob"));

        assert!(cache.lookup(&relay, &"zed".to_string()).await.is_none());
        assert!(!cache.profiles.contains_key("zed"));
        relay
            .put_profile(UserProfile::new("zed", "Zed"))
            .await
            .unwrap();
        assert_eq!(
            cache.lookup(&relay, &"zed".to_string()).await.unwrap().display_name,
            "Zed"
        );
    }

    #[tokio::test]
    async fn test_allocate_creates_ringing_record() {
        let relay = MemoryRelay::new();
        let mut dir = SessionDirectory::new(Arc::new(relay.clone()), ActiveCallPointer::in_memory());

        let record = dir
            .allocate_call(
                &UserProfile::new("alice", "Alice"),
                &UserProfile::new("bob", "Bob"),
                CallType::Audio,
            )
            .await
            .unwrap();
        let stored = relay.call(&record.id).unwrap();
        assert_eq!(stored.status, CallStatus::Ringing);
        assert_eq!(stored.caller_name, "Alice");
        assert_eq!(
            dir.profile(&"bob".to_string()).await.unwrap().display_name,
            "Bob"
        );
    }

    #[tokio::test]
    async fn test_reconcile_ends_orphaned_call() {
        let relay = MemoryRelay::new();
        let mut dir = SessionDirectory::new(Arc::new(relay.clone()), ActiveCallPointer::in_memory());
        let record = dir
            .allocate_call(
                &UserProfile::new("alice", "Alice"),
                &UserProfile::new("bob", "Bob"),
                CallType::Video,
            )
            .await
            .unwrap();
        dir.pointer_mut().arm(&record.id);

        assert_eq!(dir.reconcile().await, Some(record.id.clone()));
        assert_eq!(relay.call(&record.id).unwrap().status, CallStatus::Ended);
        assert!(dir.pointer_mut().current().is_none());
        assert_eq!(dir.reconcile().await, None);
    }
}
