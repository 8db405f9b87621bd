//! TOML-based configuration persistence for the node.
//!
//! Reads and writes [`AppConfig`] to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\AirClip\config.toml`
//! - Linux:    `~/.config/airclip/config.toml`
//! - macOS:    `~/Library/Application Support/AirClip/config.toml`
//!
//! Example:
//!
//! ```toml
//! [node]
//! name = "henry"
//! device_name = "windows"
//!
//! [discovery]
//! port = 9456
//! interval_secs = 60
//!
//! [transfer]
//! port = 9457
//! outbound_queue = 64
//! ```
//!
//! Every field carries a `#[serde(default = "...")]`, so a missing file, a
//! missing section, or a missing key all fall back to the built-in defaults.
//! The on-disk schema is converted into the runtime structs
//! ([`DiscoveryConfig`], [`TransferConfig`]) before any service is built.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::infrastructure::network::discovery::DiscoveryConfig;
use crate::infrastructure::network::guardian::GuardianConfig;
use crate::infrastructure::network::postman::TransferConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

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

    /// A field parsed as TOML but holds an unusable value.
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub transfer: TransferSection,
}

/// Local identity and logging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSection {
    /// Display name advertised to peers.
    #[serde(default = "default_name")]
    pub name: String,
    /// Device name advertised to peers; defaults to the host name.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// UDP presence protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoverySection {
    #[serde(default = "default_discovery_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: String,
    /// Seconds between periodic `online` broadcasts.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Delay before the first broadcast, so the receive loop is up first.
    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,
    /// Capacity of the discovery event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

/// TCP transfer settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferSection {
    #[serde(default = "default_transfer_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Per-peer outbound queue capacity.  Sends beyond it fail immediately.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Capacity of the merged inbound channel.
    #[serde(default = "default_inbound_queue")]
    pub inbound_queue: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Whether a stopping connection writes out messages it already accepted.
    #[serde(default = "default_true")]
    pub flush_on_stop: bool,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_name() -> String {
    "airclip".to_string()
}
fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_discovery_port() -> u16 {
    9456
}
fn default_transfer_port() -> u16 {
    9457
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_broadcast_address() -> String {
    "255.255.255.255".to_string()
}
fn default_interval_secs() -> u64 {
    60
}
fn default_warmup_ms() -> u64 {
    500
}
fn default_event_buffer() -> usize {
    64
}
fn default_outbound_queue() -> usize {
    64
}
fn default_inbound_queue() -> usize {
    1024
}
fn default_connect_timeout_ms() -> u64 {
    3000
}
fn default_handshake_timeout_ms() -> u64 {
    5000
}
fn default_true() -> bool {
    true
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            device_name: default_device_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            port: default_discovery_port(),
            bind_address: default_bind_address(),
            broadcast_address: default_broadcast_address(),
            interval_secs: default_interval_secs(),
            warmup_ms: default_warmup_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            port: default_transfer_port(),
            bind_address: default_bind_address(),
            outbound_queue: default_outbound_queue(),
            inbound_queue: default_inbound_queue(),
            connect_timeout_ms: default_connect_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            flush_on_stop: default_true(),
        }
    }
}

// ── Conversion to runtime config ──────────────────────────────────────────────

fn parse_ip(field: &'static str, value: &str) -> Result<IpAddr, ConfigError> {
    value.parse().map_err(|e| ConfigError::Invalid {
        field,
        reason: format!("{value:?}: {e}"),
    })
}

fn require_nonzero(field: &'static str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

impl AppConfig {
    /// Builds the runtime discovery settings.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if an address does not parse or a capacity or
    /// interval is zero.
    pub fn discovery_config(&self) -> Result<DiscoveryConfig, ConfigError> {
        let d = &self.discovery;
        if d.interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "discovery.interval_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(DiscoveryConfig {
            port: d.port,
            bind_address: parse_ip("discovery.bind_address", &d.bind_address)?,
            broadcast_address: parse_ip("discovery.broadcast_address", &d.broadcast_address)?,
            interval: Duration::from_secs(d.interval_secs),
            warmup: Duration::from_millis(d.warmup_ms),
            event_buffer: require_nonzero("discovery.event_buffer", d.event_buffer)?,
            ..DiscoveryConfig::default()
        })
    }

    /// Builds the runtime transfer settings.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if the bind address does not parse or a queue
    /// capacity is zero.
    pub fn transfer_config(&self) -> Result<TransferConfig, ConfigError> {
        let t = &self.transfer;
        Ok(TransferConfig {
            port: t.port,
            bind_address: parse_ip("transfer.bind_address", &t.bind_address)?,
            inbound_queue: require_nonzero("transfer.inbound_queue", t.inbound_queue)?,
            connect_timeout: Duration::from_millis(t.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(t.handshake_timeout_ms),
            guardian: GuardianConfig {
                outbound_queue: require_nonzero("transfer.outbound_queue", t.outbound_queue)?,
                flush_on_stop: t.flush_on_stop,
            },
        })
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the default config file.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads [`AppConfig`] from the default location, returning
/// `AppConfig::default()` if the file does not yet exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads [`AppConfig`] from an explicit path; a missing file yields defaults.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Persists `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
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

/// Resolves the platform config base directory including the `AirClip`
/// subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("AirClip"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("airclip"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("AirClip")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("airclip_test_{}", Uuid::new_v4()))
    }

    // ── Defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn test_app_config_default_has_expected_ports() {
        // Arrange / Act
        let cfg = AppConfig::default();

        // Assert
        assert_eq!(cfg.discovery.port, 9456);
        assert_eq!(cfg.transfer.port, 9457);
    }

    #[test]
    fn test_app_config_default_queues_and_interval() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.discovery.interval_secs, 60);
        assert_eq!(cfg.transfer.outbound_queue, 64);
        assert_eq!(cfg.transfer.inbound_queue, 1024);
        assert!(cfg.transfer.flush_on_stop);
    }

    #[test]
    fn test_default_device_name_is_not_empty() {
        assert!(!NodeSection::default().device_name.is_empty());
    }

    // ── TOML parsing ──────────────────────────────────────────────────────────

    #[test]
    fn test_empty_toml_uses_defaults() {
        let cfg: AppConfig = toml::from_str("").expect("empty document");
        assert_eq!(cfg.discovery, DiscoverySection::default());
        assert_eq!(cfg.transfer, TransferSection::default());
        assert_eq!(cfg.node.log_level, "info");
    }

    #[test]
    fn test_partial_section_overrides_only_given_keys() {
        // Arrange
        let toml_str = r#"
[transfer]
port = 7000
flush_on_stop = false
"#;

        // Act
        let cfg: AppConfig = toml::from_str(toml_str).expect("partial");

        // Assert
        assert_eq!(cfg.transfer.port, 7000);
        assert!(!cfg.transfer.flush_on_stop);
        assert_eq!(cfg.transfer.outbound_queue, 64);
        assert_eq!(cfg.discovery.port, 9456);
    }

    #[test]
    fn test_invalid_toml_returns_parse_error() {
        let dir = temp_dir();
        let path = dir.join("config.toml");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(&path, "[[[ not valid toml").unwrap();

        let result = load_config_from(&path);

        assert!(matches!(result, Err(ConfigError::Parse(_))));
        std::fs::remove_dir_all(&dir).ok();
    }

    // ── Repository ────────────────────────────────────────────────────────────

    #[test]
    fn test_load_config_from_missing_file_returns_default() {
        let path = temp_dir().join("config.toml");
        let cfg = load_config_from(&path).expect("missing file is not an error");
        assert_eq!(cfg.transfer, TransferSection::default());
    }

    #[test]
    fn test_save_and_load_round_trip_via_temp_dir() {
        // Arrange
        let dir = temp_dir();
        let path = dir.join("nested").join("config.toml");
        let mut cfg = AppConfig::default();
        cfg.node.name = "henry".to_string();
        cfg.discovery.interval_secs = 5;
        cfg.transfer.outbound_queue = 8;

        // Act
        save_config_to(&cfg, &path).expect("save");
        let loaded = load_config_from(&path).expect("load");

        // Assert
        assert_eq!(loaded, cfg);

        // Cleanup
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_config_file_path_ends_with_config_toml() {
        if let Ok(path) = config_file_path() {
            assert!(path.ends_with("config.toml"), "got {path:?}");
        }
    }

    // ── Conversion ────────────────────────────────────────────────────────────

    #[test]
    fn test_discovery_config_conversion() {
        // Arrange
        let mut cfg = AppConfig::default();
        cfg.discovery.interval_secs = 10;
        cfg.discovery.broadcast_address = "192.168.1.255".to_string();

        // Act
        let dc = cfg.discovery_config().expect("valid");

        // Assert
        assert_eq!(dc.interval, Duration::from_secs(10));
        assert_eq!(dc.broadcast_address, "192.168.1.255".parse::<IpAddr>().unwrap());
        assert_eq!(dc.port, 9456);
    }

    #[test]
    fn test_transfer_config_conversion_carries_guardian_settings() {
        let mut cfg = AppConfig::default();
        cfg.transfer.outbound_queue = 3;
        cfg.transfer.flush_on_stop = false;

        let tc = cfg.transfer_config().expect("valid");

        assert_eq!(tc.guardian.outbound_queue, 3);
        assert!(!tc.guardian.flush_on_stop);
        assert_eq!(tc.connect_timeout, Duration::from_millis(3000));
    }

    #[test]
    fn test_bad_bind_address_is_invalid() {
        let mut cfg = AppConfig::default();
        cfg.transfer.bind_address = "not-an-ip".to_string();

        let result = cfg.transfer_config();

        assert!(matches!(
            result,
            Err(ConfigError::Invalid { field: "transfer.bind_address", .. })
        ));
    }

    #[test]
    fn test_zero_outbound_queue_is_invalid() {
        let mut cfg = AppConfig::default();
        cfg.transfer.outbound_queue = 0;
        assert!(cfg.transfer_config().is_err());
    }

    #[test]
    fn test_zero_interval_is_invalid() {
        let mut cfg = AppConfig::default();
        cfg.discovery.interval_secs = 0;
        assert!(cfg.discovery_config().is_err());
    }
}
