//! Configuration loading for the shaper daemon.
//!
//! The daemon is configured from a single YAML file naming the managed
//! routers, the LAN interface carrying the queueing tree, the two rate
//! classes, and the session/command timing knobs.
//!
//! ```yaml
//! lan_interface: br-lan
//! full_rate: 100mbit
//! limited_rate: 2mbit
//! session_ttl_secs: 300
//! command_timeout_secs: 15
//! protected_devices:
//!   - "c4:6e:1f:00:aa:01"
//! routers:
//!   - id: living-room
//!     host: 192.168.1.1
//!     user: root
//!     identity_file: /etc/shaperd/id_ed25519
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{ShaperError, ShaperResult};

/// Connection endpoint for one managed router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterEndpoint {
    /// Stable router identifier used as the transport key.
    pub id: String,

    /// Hostname or address of the router's shell service.
    pub host: String,

    /// SSH port.
    #[serde(default = "defaults::ssh_port")]
    pub port: u16,

    /// Login user on the router.
    #[serde(default = "defaults::ssh_user")]
    pub user: String,

    /// Path to the private key used for authentication.
    pub identity_file: Option<String>,
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShaperConfig {
    /// LAN-side interface that carries the queueing tree.
    #[serde(default = "defaults::lan_interface")]
    pub lan_interface: String,

    /// Rate of the unrestricted class (e.g. "100mbit", or "100" = Mbit/s).
    #[serde(default = "defaults::full_rate")]
    pub full_rate: String,

    /// Rate of the limited class.
    #[serde(default = "defaults::limited_rate")]
    pub limited_rate: String,

    /// Idle seconds before a session is expired by the sweep task.
    #[serde(default = "defaults::session_ttl_secs")]
    pub session_ttl_secs: u64,

    /// Upper bound on any single remote command, in seconds.
    #[serde(default = "defaults::command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// MAC addresses that must never be blocked or limited.
    #[serde(default)]
    pub protected_devices: Vec<String>,

    /// Managed routers.
    pub routers: Vec<RouterEndpoint>,
}

/// Default values for daemon configuration.
pub mod defaults {
    /// Default LAN bridge interface on consumer routers.
    pub fn lan_interface() -> String {
        "br-lan".to_string()
    }

    /// Default full rate.
    pub fn full_rate() -> String {
        "100mbit".to_string()
    }

    /// Default limited rate.
    pub fn limited_rate() -> String {
        "2mbit".to_string()
    }

    /// Default session TTL (seconds).
    pub fn session_ttl_secs() -> u64 {
        300
    }

    /// Default per-command timeout (seconds).
    pub fn command_timeout_secs() -> u64 {
        15
    }

    /// Default SSH port.
    pub fn ssh_port() -> u16 {
        22
    }

    /// Default SSH user on consumer routers.
    pub fn ssh_user() -> String {
        "root".to_string()
    }
}

impl ShaperConfig {
    /// Loads configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> ShaperResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ShaperError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parses configuration from a YAML string.
    pub fn from_yaml(raw: &str) -> ShaperResult<Self> {
        let cfg: ShaperConfig = serde_yaml::from_str(raw)
            .map_err(|e| ShaperError::config(format!("malformed config: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates cross-field constraints.
    fn validate(&self) -> ShaperResult<()> {
        if self.routers.is_empty() {
            return Err(ShaperError::config("no routers configured"));
        }
        let mut seen = HashMap::new();
        for r in &self.routers {
            if r.id.is_empty() {
                return Err(ShaperError::config("router with empty id"));
            }
            if seen.insert(r.id.clone(), ()).is_some() {
                return Err(ShaperError::config(format!("duplicate router id '{}'", r.id)));
            }
        }
        if self.session_ttl_secs == 0 {
            return Err(ShaperError::config("session_ttl_secs must be non-zero"));
        }
        Ok(())
    }

    /// Returns the endpoint for a router id, if configured.
    pub fn router(&self, id: &str) -> Option<&RouterEndpoint> {
        self.routers.iter().find(|r| r.id == id)
    }

    /// Session TTL as a [`Duration`].
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Command timeout as a [`Duration`].
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}
