//! TOML-based configuration for the relay.
//!
//! A host application can ship a `lanscope.toml` next to its binary, or build
//! a [`RelayConfig`] in code.  Every field has a default, so an empty file (or
//! no file at all) gives a working relay:
//!
//! ```toml
//! [discovery]
//! service_type = "_lanscope._tcp"
//! domain = "local."
//! discovery_port = 43434
//!
//! [transport]
//! queue_capacity = 256
//!
//! [capture]
//! max_body_bytes = 10485760
//! enable_delegate_hooks = false
//!
//! [project]
//! project_name = "shop-app"
//! ```
//!
//! # Serde default values
//!
//! Fields annotated with `#[serde(default = "some_fn")]` use the return value
//! of `some_fn()` when the field is absent, so older config files keep
//! working when new fields are added.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lanscope_core::{
    frame_len_for_body_cap, DeviceDescriptor, Environment, ProjectDescriptor, TrackerConfig,
    DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_FRAME_LEN, INTERCEPTOR_VERSION,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::infrastructure::discovery::DiscoveryConfig;
use crate::infrastructure::transport::TransportConfig;

/// Error type for configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// An address field does not hold a valid IP address.
    #[error("invalid address {value:?}: {source}")]
    InvalidAddress {
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },

    /// A packet with both bodies at the capture cap would not fit one frame.
    #[error(
        "transport.max_frame_len {max_frame_len} is below the {required} bytes \
         needed for capture.max_body_bytes {max_body_bytes}"
    )]
    FrameLimitTooSmall {
        max_frame_len: usize,
        max_body_bytes: usize,
        required: usize,
    },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub capture: CaptureSection,
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub device: DeviceSection,
}

/// Which service the relay browses for and how.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoverySection {
    /// Service type; must match the viewer's exactly.
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Service domain; must match the viewer's exactly.
    #[serde(default = "default_domain")]
    pub domain: String,
    /// UDP port announcements are broadcast to.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Destination address for announcements (advertiser side).
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: String,
    #[serde(default = "default_announce_interval_ms")]
    pub announce_interval_ms: u64,
    /// A peer not heard from for this long is considered lost.
    #[serde(default = "default_peer_ttl_ms")]
    pub peer_ttl_ms: u64,
}

/// Outbound session tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportSection {
    /// Packets kept while no viewer is connected.  Oldest are dropped first.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

/// What gets captured.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureSection {
    /// Request and response bodies are each truncated past this many bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Capture requests made through task-style APIs.
    #[serde(default = "default_true")]
    pub enable_task_hooks: bool,
    /// Capture requests made through delegate-style connections.
    #[serde(default = "default_true")]
    pub enable_delegate_hooks: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectSection {
    #[serde(default = "default_project_name")]
    pub project_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_device_description")]
    pub device_description: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_service_type() -> String {
    "_lanscope._tcp".to_string()
}
fn default_domain() -> String {
    "local.".to_string()
}
fn default_discovery_port() -> u16 {
    43434
}
fn default_broadcast_address() -> String {
    "255.255.255.255".to_string()
}
fn default_announce_interval_ms() -> u64 {
    1000
}
fn default_peer_ttl_ms() -> u64 {
    5000
}
fn default_queue_capacity() -> usize {
    256
}
fn default_connect_timeout_ms() -> u64 {
    3000
}
fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}
fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}
fn default_true() -> bool {
    true
}
fn default_project_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown-project".to_string())
}
fn default_device_id() -> String {
    Uuid::new_v4().to_string()
}
fn default_device_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "unknown-device".to_string())
}
fn default_device_description() -> String {
    format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
            domain: default_domain(),
            discovery_port: default_discovery_port(),
            broadcast_address: default_broadcast_address(),
            announce_interval_ms: default_announce_interval_ms(),
            peer_ttl_ms: default_peer_ttl_ms(),
        }
    }
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            max_body_bytes: default_max_body_bytes(),
            enable_task_hooks: default_true(),
            enable_delegate_hooks: default_true(),
        }
    }
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
        }
    }
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            device_name: default_device_name(),
            device_description: default_device_description(),
        }
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

impl RelayConfig {
    /// Parses a config from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Checks settings that depend on each other.
    ///
    /// # Errors
    ///
    /// [`ConfigError::FrameLimitTooSmall`] if a record whose bodies both sit
    /// at `capture.max_body_bytes` would encode to more than
    /// `transport.max_frame_len` bytes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = frame_len_for_body_cap(self.capture.max_body_bytes);
        if self.transport.max_frame_len < required {
            return Err(ConfigError::FrameLimitTooSmall {
                max_frame_len: self.transport.max_frame_len,
                max_body_bytes: self.capture.max_body_bytes,
                required,
            });
        }
        Ok(())
    }

    /// Runtime settings for the discovery service.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidAddress`] if `broadcast_address` is not an IP.
    pub fn discovery_config(&self) -> Result<DiscoveryConfig, ConfigError> {
        let section = &self.discovery;
        let broadcast_addr: IpAddr =
            section
                .broadcast_address
                .parse()
                .map_err(|source| ConfigError::InvalidAddress {
                    value: section.broadcast_address.clone(),
                    source,
                })?;
        Ok(DiscoveryConfig {
            discovery_port: section.discovery_port,
            broadcast_addr,
            announce_interval: Duration::from_millis(section.announce_interval_ms),
            peer_ttl: Duration::from_millis(section.peer_ttl_ms),
        })
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            queue_capacity: self.transport.queue_capacity,
            connect_timeout: Duration::from_millis(self.transport.connect_timeout_ms),
            max_frame_len: self.transport.max_frame_len,
        }
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            max_body_bytes: self.capture.max_body_bytes,
        }
    }

    /// Environment metadata stamped into every packet.
    pub fn environment(&self, originating_address: impl Into<String>) -> Environment {
        Environment {
            project: ProjectDescriptor {
                project_name: self.project.project_name.clone(),
            },
            device: DeviceDescriptor {
                device_id: self.device.device_id.clone(),
                device_name: self.device.device_name.clone(),
                device_description: self.device.device_description.clone(),
            },
            protocol_version: INTERCEPTOR_VERSION.to_string(),
            originating_address: originating_address.into(),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Loads a [`RelayConfig`] from `path`, returning defaults if the file does
/// not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<RelayConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => RelayConfig::from_toml_str(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RelayConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &RelayConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
