//! Configuration storage

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::calling::ice::IceServer;
use crate::calling::presentation::{PresentationSettings, TileSize};
use crate::calling::session::CallSettings;
use crate::models::UserProfile;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:9780";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// WebSocket URL of the signaling relay
    pub relay_url: String,
    /// Local identity published to the relay
    pub user: UserConfig,
    pub call: CallConfig,
    pub presentation: PresentationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            user: UserConfig::default(),
            call: CallConfig::default(),
            presentation: PresentationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub id: Option<String>,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
}

impl UserConfig {
    /// The configured identity. Display name falls back to the id.
    pub fn profile(&self) -> Result<UserProfile> {
        let Some(id) = self.id.as_deref().filter(|id| !id.is_empty()) else {
            bail!("No user id configured; run `peercall profile --id <ID>` first");
        };
        Ok(UserProfile {
            id: id.to_string(),
            display_name: self.display_name.clone().unwrap_or_else(|| id.to_string()),
            photo_url: self.photo_url.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub ring_timeout_secs: u64,
    pub reconnect_timeout_secs: u64,
    pub ice_servers: Vec<IceServer>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 15,
            reconnect_timeout_secs: 15,
            ice_servers: vec![IceServer::default()],
        }
    }
}

impl CallConfig {
    pub fn settings(&self) -> CallSettings {
        CallSettings {
            ring_timeout: Duration::from_secs(self.ring_timeout_secs),
            reconnect_timeout: Duration::from_secs(self.reconnect_timeout_secs),
            ice_servers: self.ice_servers.clone(),
            ..CallSettings::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresentationConfig {
    pub restore_ms: u64,
    pub medium: TileSize,
    pub large: TileSize,
}

impl Default for PresentationConfig {
    fn default() -> Self {
        let defaults = PresentationSettings::default();
        Self {
            restore_ms: defaults.restore_duration.as_millis() as u64,
            medium: defaults.medium,
            large: defaults.large,
        }
    }
}

impl PresentationConfig {
    pub fn settings(&self) -> PresentationSettings {
        PresentationSettings {
            medium: self.medium,
            large: self.large,
            restore_duration: Duration::from_millis(self.restore_ms),
        }
    }
}

impl Config {
    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("com", "peercall", "peercall").context("Could not determine config directory")
    }

    /// Default config file path
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    /// Directory for per-user session state (the active-call pointer)
    pub fn session_dir() -> Result<PathBuf> {
        let dirs = Self::project_dirs()?;
        Ok(dirs
            .state_dir()
            .unwrap_or_else(|| dirs.data_local_dir())
            .to_path_buf())
    }

    /// Load configuration from `path`, or the default location
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.call.ring_timeout_secs == 0 || self.call.reconnect_timeout_secs == 0 {
            bail!("Call timeouts must be at least one second");
        }
        for server in &self.call.ice_servers {
            server
                .validate()
                .with_context(|| format!("Invalid ICE server {:?}", server.urls))?;
        }
        Ok(())
    }

    /// Save configuration to `path`, or the default location
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).context("Failed to write config file")?;

        // Set restrictive permissions on config file (contains TURN credentials)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }
}
