//! Configuration for the replication relay.
//!
//! This module defines the configuration record passed to
//! [`Engine::new()`](crate::Engine::new). It can be constructed
//! programmatically or deserialized from YAML/JSON by the embedding daemon.
//!
//! # Quick Start
//!
//! ```rust
//! use resp_relay::config::RelayConfig;
//!
//! let mut config = RelayConfig::default();
//! config.source.address_list = vec!["127.0.0.1:6379".into()];
//! config.target.address_list = vec!["127.0.0.1:6380".into()];
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! RelayConfig
//! ├── source: SourceConfig      # replication sources + dispatch fan-out
//! ├── target: TargetConfig      # targets, db override, restorer pool size
//! ├── psync: bool               # partial vs classic handshake
//! ├── filter: FilterConfig      # key-prefix / slot / db inclusion filters
//! ├── sender: SenderConfig      # pipeline flush and delay-queue tuning
//! ├── swap: SwapConfig          # optional on-disk snapshot spill
//! ├── heartbeat: HeartbeatConfig # optional liveness beacon
//! ├── metric: bool              # latency sampling + counters
//! ├── rewrite: bool             # RESTORE ... REPLACE on existing keys
//! └── listening_port: u16       # port advertised to the source
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reader buffer size for the source replication link, and the default
/// in-memory snapshot pipe capacity.
pub const READER_BUFFER_SIZE: usize = 64 * 1024;

/// Writer buffer size for pipelined target writes.
pub const WRITER_BUFFER_SIZE: usize = 64 * 1024;

/// Deadline applied to target dials and target I/O.
pub const TARGET_IO_DEADLINE: Duration = Duration::from_secs(600);

/// The top-level config record passed to `Engine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Replication sources and per-source dispatch fan-out.
    pub source: SourceConfig,

    /// Targets, optional db override, restorer pool size per syncer.
    pub target: TargetConfig,

    /// Choose partial (`PSYNC`) vs classic (`SYNC`) handshake.
    #[serde(default = "default_true")]
    pub psync: bool,

    /// Inclusion filters applied to snapshot records and forwarded commands.
    #[serde(default)]
    pub filter: FilterConfig,

    /// Pipeline tuning for the command sender.
    #[serde(default)]
    pub sender: SenderConfig,

    /// Optional on-disk snapshot spill.
    #[serde(default)]
    pub swap: SwapConfig,

    /// Optional liveness beacon.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Enable latency sampling and counter exposure.
    #[serde(default = "default_true")]
    pub metric: bool,

    /// Append `REPLACE` to snapshot restores so existing keys are
    /// overwritten instead of rejected with a busy-key error.
    #[serde(default)]
    pub rewrite: bool,

    /// Port advertised to the source via `REPLCONF listening-port`.
    /// Also identifies this replica in the fake-slave offset probe.
    #[serde(default = "default_listening_port")]
    pub listening_port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            target: TargetConfig::default(),
            psync: true,
            filter: FilterConfig::default(),
            sender: SenderConfig::default(),
            swap: SwapConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metric: true,
            rewrite: false,
            listening_port: default_listening_port(),
        }
    }
}

impl RelayConfig {
    /// Create a single-pair config for testing, with fast-drain tuning.
    pub fn for_testing(source: &str, target: &str) -> Self {
        Self {
            source: SourceConfig {
                address_list: vec![source.to_string()],
                ..Default::default()
            },
            target: TargetConfig {
                address_list: vec![target.to_string()],
                parallel: 2,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Validate cross-field constraints. Called by `Engine::new()`.
    pub fn validate(&self) -> Result<(), String> {
        if self.source.address_list.is_empty() {
            return Err("source.address_list must not be empty".to_string());
        }
        if self.target.address_list.is_empty() {
            return Err("target.address_list must not be empty".to_string());
        }
        if self.source.parallel == 0 {
            return Err("source.parallel must be at least 1".to_string());
        }
        if self.target.parallel == 0 {
            return Err("target.parallel must be at least 1".to_string());
        }
        if self.sender.count == 0 {
            return Err("sender.count must be at least 1".to_string());
        }
        if self.sender.delay_channel_size == 0 {
            return Err("sender.delay_channel_size must be at least 1".to_string());
        }
        if self.swap.file_name.is_some() && self.swap.file_size == 0 {
            return Err("swap.file_size must be non-zero when swap.file_name is set".to_string());
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SourceConfig / TargetConfig: endpoints and credentials
// ═══════════════════════════════════════════════════════════════════════════════

/// Authentication command used against an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    /// Standard `AUTH` command.
    #[default]
    Auth,
    /// Proxy-style `ADMINAUTH` command.
    AdminAuth,
}

impl AuthType {
    /// The verb sent on the wire.
    pub fn verb(&self) -> &'static str {
        match self {
            AuthType::Auth => "auth",
            AuthType::AdminAuth => "adminauth",
        }
    }
}

/// Replication sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source addresses, one syncer per entry.
    #[serde(default)]
    pub address_list: Vec<String>,

    /// Authentication command for sources.
    #[serde(default)]
    pub auth_type: AuthType,

    /// Source password (empty = no auth).
    #[serde(default)]
    pub password_raw: String,

    /// How many syncers may run their full sync concurrently.
    #[serde(default = "default_source_parallel")]
    pub parallel: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            address_list: Vec::new(),
            auth_type: AuthType::Auth,
            password_raw: String::new(),
            parallel: default_source_parallel(),
        }
    }
}

/// Replication targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Target addresses; sources are paired to these round-robin,
    /// so targets may be reused.
    #[serde(default)]
    pub address_list: Vec<String>,

    /// Authentication command for targets.
    #[serde(default)]
    pub auth_type: AuthType,

    /// Target password (empty = no auth).
    #[serde(default)]
    pub password_raw: String,

    /// Destination db override. `None` keeps each record's own db.
    #[serde(default)]
    pub db: Option<u32>,

    /// Snapshot restorer pool size per syncer.
    #[serde(default = "default_target_parallel")]
    pub parallel: usize,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            address_list: Vec::new(),
            auth_type: AuthType::Auth,
            password_raw: String::new(),
            db: None,
            parallel: default_target_parallel(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FilterConfig: inclusion filters
// ═══════════════════════════════════════════════════════════════════════════════

/// Inclusion filters.
///
/// Priority order at apply time: key prefixes, then slots, then pass-through.
/// The db filter is independent and applies to `SELECT` routing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Keep only keys starting with one of these prefixes.
    #[serde(default)]
    pub key: Vec<String>,

    /// Keep only keys hashing to one of these cluster slots.
    /// Entries are decimal strings, validated when filters are compiled.
    #[serde(default)]
    pub slot: Vec<String>,

    /// Keep only this db. Decimal string; `None` accepts every db.
    #[serde(default)]
    pub db: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// SenderConfig: pipeline tuning
// ═══════════════════════════════════════════════════════════════════════════════

/// Pipeline tuning for the command sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Flush after this many unflushed commands. Also sizes the bounded
    /// command queue between parser and sender.
    #[serde(default = "default_sender_count")]
    pub count: usize,

    /// Flush after this many accumulated payload bytes.
    #[serde(default = "default_sender_size")]
    pub size: u64,

    /// Capacity of the delay-sample queue.
    #[serde(default = "default_delay_channel_size")]
    pub delay_channel_size: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            count: default_sender_count(),
            size: default_sender_size(),
            delay_channel_size: default_delay_channel_size(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SwapConfig: on-disk snapshot spill
// ═══════════════════════════════════════════════════════════════════════════════

/// Optional on-disk snapshot spill.
///
/// When `file_name` is set the snapshot flows through a fixed-size file ring
/// instead of living entirely in memory, so a dump larger than RAM can still
/// be taken while restorers lag behind the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapConfig {
    /// Path of the spill file. `None` disables the spill.
    #[serde(default)]
    pub file_name: Option<String>,

    /// Spill file size in bytes.
    #[serde(default = "default_swap_file_size")]
    pub file_size: u64,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            file_name: None,
            file_size: default_swap_file_size(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HeartbeatConfig: liveness beacon
// ═══════════════════════════════════════════════════════════════════════════════

/// Optional liveness beacon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// URL to POST liveness documents to. `None` disables the beacon.
    #[serde(default)]
    pub url: Option<String>,

    /// Beacon interval as a duration string (e.g. "3s").
    #[serde(default = "default_heartbeat_interval")]
    pub interval: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            url: None,
            interval: default_heartbeat_interval(),
        }
    }
}

impl HeartbeatConfig {
    /// Parse the interval string to a Duration.
    pub fn interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.interval).unwrap_or(Duration::from_secs(3))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Defaults
// ═══════════════════════════════════════════════════════════════════════════════

fn default_true() -> bool {
    true
}

fn default_source_parallel() -> usize {
    4
}

fn default_target_parallel() -> usize {
    4
}

fn default_sender_count() -> usize {
    4095
}

fn default_sender_size() -> u64 {
    100 * 1024 * 1024
}

fn default_delay_channel_size() -> usize {
    8192
}

fn default_swap_file_size() -> u64 {
    512 * 1024 * 1024
}

fn default_heartbeat_interval() -> String {
    "3s".to_string()
}

fn default_listening_port() -> u16 {
    21345
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates_with_endpoints() {
        let config = RelayConfig::for_testing("127.0.0.1:6379", "127.0.0.1:6380");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_config_rejects_empty_sources() {
        let config = RelayConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.contains("source.address_list"));
    }

    #[test]
    fn rejects_empty_targets() {
        let mut config = RelayConfig::default();
        config.source.address_list = vec!["127.0.0.1:6379".into()];
        let err = config.validate().unwrap_err();
        assert!(err.contains("target.address_list"));
    }

    #[test]
    fn rejects_zero_parallelism() {
        let mut config = RelayConfig::for_testing("s:1", "t:1");
        config.source.parallel = 0;
        assert!(config.validate().unwrap_err().contains("source.parallel"));

        let mut config = RelayConfig::for_testing("s:1", "t:1");
        config.target.parallel = 0;
        assert!(config.validate().unwrap_err().contains("target.parallel"));
    }

    #[test]
    fn rejects_zero_sender_tuning() {
        let mut config = RelayConfig::for_testing("s:1", "t:1");
        config.sender.count = 0;
        assert!(config.validate().unwrap_err().contains("sender.count"));

        let mut config = RelayConfig::for_testing("s:1", "t:1");
        config.sender.delay_channel_size = 0;
        assert!(config
            .validate()
            .unwrap_err()
            .contains("delay_channel_size"));
    }

    #[test]
    fn rejects_swap_file_without_size() {
        let mut config = RelayConfig::for_testing("s:1", "t:1");
        config.swap.file_name = Some("/tmp/relay.swap".to_string());
        config.swap.file_size = 0;
        assert!(config.validate().unwrap_err().contains("swap.file_size"));
    }

    #[test]
    fn auth_type_verbs() {
        assert_eq!(AuthType::Auth.verb(), "auth");
        assert_eq!(AuthType::AdminAuth.verb(), "adminauth");
    }

    #[test]
    fn auth_type_serde_lowercase() {
        let json = serde_json::to_string(&AuthType::AdminAuth).unwrap();
        assert_eq!(json, "\"adminauth\"");
        let parsed: AuthType = serde_json::from_str("\"auth\"").unwrap();
        assert_eq!(parsed, AuthType::Auth);
    }

    #[test]
    fn sender_defaults() {
        let sender = SenderConfig::default();
        assert_eq!(sender.count, 4095);
        assert_eq!(sender.size, 100 * 1024 * 1024);
        assert_eq!(sender.delay_channel_size, 8192);
    }

    #[test]
    fn heartbeat_interval_parsing() {
        let hb = HeartbeatConfig {
            url: Some("http://collector:8080/beat".to_string()),
            interval: "500ms".to_string(),
        };
        assert_eq!(hb.interval_duration(), Duration::from_millis(500));
    }

    #[test]
    fn heartbeat_interval_invalid_fallback() {
        let hb = HeartbeatConfig {
            url: None,
            interval: "not-a-duration".to_string(),
        };
        assert_eq!(hb.interval_duration(), Duration::from_secs(3));
    }

    #[test]
    fn config_json_roundtrip() {
        let mut config = RelayConfig::for_testing("10.0.0.1:6379", "10.0.0.2:6380");
        config.filter.key = vec!["user:".to_string()];
        config.filter.db = Some("0".to_string());
        config.target.db = Some(7);

        let json = serde_json::to_string(&config).unwrap();
        let parsed: RelayConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.source.address_list, vec!["10.0.0.1:6379"]);
        assert_eq!(parsed.filter.key, vec!["user:"]);
        assert_eq!(parsed.target.db, Some(7));
        assert!(parsed.psync);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let json = r#"{
            "source": { "address_list": ["s:6379"] },
            "target": { "address_list": ["t:6380"] }
        }"#;
        let parsed: RelayConfig = serde_json::from_str(json).unwrap();
        assert!(parsed.psync);
        assert!(parsed.metric);
        assert!(!parsed.rewrite);
        assert_eq!(parsed.sender.count, 4095);
        assert_eq!(parsed.source.parallel, 4);
        assert!(parsed.swap.file_name.is_none());
        assert!(parsed.validate().is_ok());
    }
}
