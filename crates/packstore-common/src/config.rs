//! Configuration types for packstore
//!
//! Every field has a default so a partial TOML file (or none at all, with
//! environment overrides) yields a usable configuration. Per virtual host
//! behaviour lives in one immutable [`VhostConfig`] resolved per request.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for packstore
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listener configuration
    pub server: ServerConfig,
    /// Host identity
    pub node: NodeConfig,
    /// Path lock retry budget
    pub locks: LockConfig,
    /// Embedded store open policy
    pub store: StoreConfig,
    /// Background compaction
    pub compaction: CompactionConfig,
    /// Logging
    pub logging: LoggingConfig,
    /// Virtual hosts served by this process
    pub vhosts: Vec<VhostConfig>,
}

impl Config {
    /// Check cross-field constraints that serde defaults cannot express
    pub fn validate(&self) -> Result<()> {
        if self.vhosts.is_empty() {
            return Err(Error::Configuration("no virtual hosts configured".into()));
        }
        if self.locks.try_times == 0 {
            return Err(Error::Configuration("locks.try_times must be at least 1".into()));
        }
        if self.store.open_attempts == 0 {
            return Err(Error::Configuration(
                "store.open_attempts must be at least 1".into(),
            ));
        }
        if self.compaction.enabled && self.compaction.workers == 0 {
            return Err(Error::Configuration(
                "compaction.workers must be at least 1".into(),
            ));
        }
        if self.compaction.enabled && self.compaction.interval_secs == 0 {
            return Err(Error::Configuration(
                "compaction.interval_secs must be at least 1".into(),
            ));
        }

        let mut seen = HashSet::new();
        for vhost in &self.vhosts {
            if !vhost.root.is_absolute() {
                return Err(Error::Configuration(format!(
                    "vhost '{}': root {} is not absolute",
                    vhost.name,
                    vhost.root.display()
                )));
            }
            if vhost.hosts.is_empty() {
                return Err(Error::Configuration(format!(
                    "vhost '{}': no host names",
                    vhost.name
                )));
            }
            for host in &vhost.hosts {
                if !seen.insert(host.to_ascii_lowercase()) {
                    return Err(Error::Configuration(format!(
                        "host name '{host}' is claimed by more than one vhost"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// HTTP listener configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address for the object API
    pub listen: SocketAddr,
    /// Address for the metrics endpoint (disabled when unset)
    pub metrics_listen: Option<SocketAddr>,
    /// Largest accepted request body
    pub max_body_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9700)),
            metrics_listen: Some(SocketAddr::from(([0, 0, 0, 0], 9790))),
            max_body_size: 1024 * 1024 * 1024, // 1 GB
        }
    }
}

/// Host identity
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable host identifier used to partition compaction work.
    /// Falls back to the OS hostname when unset.
    pub host_id: Option<String>,
}

/// Path lock wait budget: a waiter gives up after `try_times × sleep_ms`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub try_times: u32,
    pub sleep_ms: u64,
}

impl LockConfig {
    #[must_use]
    pub const fn sleep(&self) -> Duration {
        Duration::from_millis(self.sleep_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            try_times: 1000,
            sleep_ms: 10,
        }
    }
}

/// Embedded store open policy
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Attempts to open an archive held open elsewhere
    pub open_attempts: u32,
    /// Pause between open attempts
    pub open_sleep_ms: u64,
    /// Idle archive handles kept open between requests; 0 closes every
    /// archive after use so other processes can open it
    pub cached_handles: usize,
}

impl StoreConfig {
    #[must_use]
    pub const fn open_sleep(&self) -> Duration {
        Duration::from_millis(self.open_sleep_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            open_attempts: 5,
            open_sleep_ms: 20,
            cached_handles: 64,
        }
    }
}

/// Background compaction configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub enabled: bool,
    /// Time between scheduler passes (seconds)
    pub interval_secs: u64,
    /// Minimum dirty age before an archive is compacted (seconds)
    pub min_age_secs: u64,
    /// Archives compacted concurrently within one pass
    pub workers: usize,
    /// Failed passes tolerated before a task is dropped
    pub max_attempts: u32,
    /// Location of the compaction task store
    pub coordinator_path: PathBuf,
}

impl CompactionConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    #[must_use]
    pub const fn min_age(&self) -> Duration {
        Duration::from_secs(self.min_age_secs)
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            min_age_secs: 300,
            workers: 4,
            max_attempts: 3,
            coordinator_path: PathBuf::from("/var/lib/packstore/compaction.redb"),
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Behaviour of one virtual host
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VhostConfig {
    /// Name used in logs
    pub name: String,
    /// `Host` header values served by this vhost (port is ignored)
    pub hosts: Vec<String>,
    /// Directory the request path is resolved against
    pub root: PathBuf,
    /// Accept PUT
    pub upload: bool,
    /// Accept DELETE
    pub delete: bool,
    /// Accept `Archive: 1` writes
    pub archive: bool,
    /// Largest payload packed into an archive; bigger uploads stay standalone
    pub archive_max_size: u64,
    /// Store and verify payload checksums
    pub integrity: bool,
    /// Refuse a name that already exists in the other storage form
    pub unique_keys: bool,
    /// Remove a directory left empty by a delete
    pub prune_dirs: bool,
    /// Permission bits for uploaded files and new archives
    pub file_mode: u32,
    /// Permission bits for directories created by uploads
    pub dir_mode: u32,
    /// `Cache-Control: max-age` value (seconds)
    pub cache_max_age: u64,
    /// Content types accepted on PUT; empty accepts any
    pub allowed_content_types: Vec<String>,
}

impl VhostConfig {
    /// Whether a PUT with this `Content-Type` is acceptable
    #[must_use]
    pub fn accepts_content_type(&self, content_type: Option<&str>) -> bool {
        if self.allowed_content_types.is_empty() {
            return true;
        }
        let Some(content_type) = content_type else {
            return false;
        };
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        self.allowed_content_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&essence))
    }
}

impl Default for VhostConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            hosts: vec!["localhost".to_string()],
            root: PathBuf::from("/var/lib/packstore/data"),
            upload: true,
            delete: true,
            archive: true,
            archive_max_size: 1024 * 1024, // 1 MB
            integrity: true,
            unique_keys: false,
            prune_dirs: false,
            file_mode: 0o640,
            dir_mode: 0o750,
            cache_max_age: 0,
            allowed_content_types: Vec::new(),
        }
    }
}
