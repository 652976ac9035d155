// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::QoS;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorKind};
use crate::types::Priority;

/// Broker main config.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    general: General,

    #[serde(default = "Listener::default_listeners")]
    listeners: Vec<Listener>,

    #[serde(default)]
    security: Security,

    #[serde(default)]
    storage: Storage,

    #[serde(default)]
    log: Log,

    #[serde(default)]
    bridges: Vec<Bridge>,
}

impl Config {
    #[must_use]
    pub const fn general(&self) -> &General {
        &self.general
    }

    #[must_use]
    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    #[must_use]
    pub const fn security(&self) -> &Security {
        &self.security
    }

    #[must_use]
    pub const fn storage(&self) -> &Storage {
        &self.storage
    }

    #[must_use]
    pub const fn log(&self) -> &Log {
        &self.log
    }

    #[must_use]
    pub fn bridges(&self) -> &[Bridge] {
        &self.bridges
    }

    /// Check config values.
    ///
    /// # Errors
    ///
    /// Returns error if some config value is invalid.
    pub fn validate(&self) -> Result<(), Error> {
        if self.listeners.is_empty() {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "At least one listener is required",
            ));
        }
        for bridge in &self.bridges {
            bridge.validate()?;
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("Invalid default config")
    }
}

/// General section in config.
#[derive(Debug, Deserialize, Clone)]
pub struct General {
    /// Time interval to publish $SYS messages, in seconds.
    ///
    /// Set to 0 to disable $SYS messages.
    ///
    /// Default is 10.
    #[serde(default = "General::default_sys_interval")]
    pub sys_interval: u64,

    /// Write process id to a file.
    ///
    /// Default is `/var/run/veles.pid`.
    #[serde(default = "General::default_pid_file")]
    pub pid_file: PathBuf,

    /// Maximum number of QoS 1/2 messages simultaneously in flight per
    /// client. Further messages wait in the queue until the window frees up.
    ///
    /// Default is 20.
    #[serde(default = "General::default_max_inflight_messages")]
    pub max_inflight_messages: usize,

    /// Maximum number of messages held in the per-client queue, above the
    /// inflight window. When full, new QoS 0 messages push out the oldest
    /// queued QoS 0 message and new QoS 1/2 messages are refused.
    ///
    /// Set to 0 for no limit. Default is 1000.
    #[serde(default = "General::default_max_queued_messages")]
    pub max_queued_messages: usize,

    /// Seconds to wait before resending an unacknowledged QoS 1/2 message.
    ///
    /// Default is 20.
    #[serde(default = "General::default_retry_interval")]
    pub retry_interval: u64,

    /// Log bridge connection state changes.
    ///
    /// Default is true.
    #[serde(default = "General::default_connection_messages")]
    pub connection_messages: bool,

    /// Only client ids starting with one of these prefixes may connect.
    ///
    /// An empty list means any client id is allowed. Default is empty.
    #[serde(default)]
    pub clientid_prefixes: Vec<String>,

    /// Accept a zero byte client id from a clean session client and assign
    /// a random one [MQTT-3.1.3-6].
    ///
    /// Default is true.
    #[serde(default = "General::default_allow_empty_client_id")]
    pub allow_empty_client_id: bool,

    /// Seconds a new connection may stay idle before sending CONNECT.
    ///
    /// Default is 15.
    #[serde(default = "General::default_connect_timeout")]
    pub connect_timeout: u64,

    /// Maximum accepted publish payload size in bytes. 0 means no limit
    /// below the protocol maximum.
    ///
    /// Default is 0.
    #[serde(default)]
    pub message_size_limit: usize,
}

impl General {
    const fn default_sys_interval() -> u64 {
        10
    }

    fn default_pid_file() -> PathBuf {
        PathBuf::from("/var/run/veles.pid")
    }

    const fn default_max_inflight_messages() -> usize {
        20
    }

    const fn default_max_queued_messages() -> usize {
        1000
    }

    const fn default_retry_interval() -> u64 {
        20
    }

    const fn default_connection_messages() -> bool {
        true
    }

    const fn default_allow_empty_client_id() -> bool {
        true
    }

    const fn default_connect_timeout() -> u64 {
        15
    }
}

impl Default for General {
    fn default() -> Self {
        toml::from_str("").expect("Invalid default general config")
    }
}

/// Listener represents a unique address/port to accept client connections.
#[derive(Debug, Deserialize, Clone)]
pub struct Listener {
    /// Binding address, including port.
    ///
    /// Default is `0.0.0.0:1883`.
    #[serde(default = "Listener::default_address")]
    address: String,

    /// The maximum number of client connections to this listener allowed.
    ///
    /// Default is 0, which means unlimited connections.
    #[serde(default)]
    max_connections: usize,

    /// Keep alive seconds used before the client announces its own value
    /// in CONNECT.
    ///
    /// Default is 60.
    #[serde(default = "Listener::default_keep_alive")]
    keep_alive: u64,
}

impl Listener {
    fn default_address() -> String {
        "0.0.0.0:1883".to_string()
    }

    const fn default_keep_alive() -> u64 {
        60
    }

    fn default_listeners() -> Vec<Self> {
        vec![Self {
            address: Self::default_address(),
            max_connections: 0,
            keep_alive: Self::default_keep_alive(),
        }]
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub const fn max_connections(&self) -> usize {
        self.max_connections
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u64 {
        self.keep_alive
    }

    #[must_use]
    pub fn with_address(address: &str) -> Self {
        Self {
            address: address.to_string(),
            max_connections: 0,
            keep_alive: Self::default_keep_alive(),
        }
    }
}

/// Security section in config.
#[derive(Debug, Deserialize, Clone)]
pub struct Security {
    /// Allow clients connecting without a username.
    ///
    /// Default is true.
    #[serde(default = "Security::default_allow_anonymous")]
    allow_anonymous: bool,

    /// Path to the password file with `username:password` lines.
    ///
    /// Default is None.
    #[serde(default)]
    password_file: Option<PathBuf>,

    /// Path to the topic access control file.
    ///
    /// Default is None, which allows everything.
    #[serde(default)]
    acl_file: Option<PathBuf>,
}

impl Security {
    const fn default_allow_anonymous() -> bool {
        true
    }

    #[must_use]
    pub const fn allow_anonymous(&self) -> bool {
        self.allow_anonymous
    }

    #[must_use]
    pub const fn password_file(&self) -> Option<&PathBuf> {
        self.password_file.as_ref()
    }

    #[must_use]
    pub const fn acl_file(&self) -> Option<&PathBuf> {
        self.acl_file.as_ref()
    }
}

impl Default for Security {
    fn default() -> Self {
        toml::from_str("").expect("Invalid default security config")
    }
}

/// Storage section in config.
#[derive(Debug, Deserialize, Clone)]
pub struct Storage {
    /// Save retained messages and durable subscriptions to disk so they
    /// survive a restart.
    ///
    /// Default is false.
    #[serde(default)]
    persistence: bool,

    /// Directory the snapshot and FFDC files are written to.
    ///
    /// Default is `/var/lib/veles`.
    #[serde(default = "Storage::default_persistence_location")]
    persistence_location: PathBuf,

    /// Seconds between snapshots of changed retained state.
    ///
    /// Default is 1800.
    #[serde(default = "Storage::default_autosave_interval")]
    autosave_interval: u64,

    /// Snapshot on accumulated changes instead of elapsed time.
    ///
    /// Default is false.
    #[serde(default)]
    autosave_on_changes: bool,

    /// Number of retained-state changes that triggers a snapshot when
    /// `autosave_on_changes` is set.
    ///
    /// Default is 100.
    #[serde(default = "Storage::default_autosave_change_threshold")]
    autosave_change_threshold: u64,
}

impl Storage {
    fn default_persistence_location() -> PathBuf {
        PathBuf::from("/var/lib/veles")
    }

    const fn default_autosave_interval() -> u64 {
        1800
    }

    const fn default_autosave_change_threshold() -> u64 {
        100
    }

    #[must_use]
    pub const fn persistence(&self) -> bool {
        self.persistence
    }

    #[must_use]
    pub const fn persistence_location(&self) -> &PathBuf {
        &self.persistence_location
    }

    #[must_use]
    pub const fn autosave_interval(&self) -> u64 {
        self.autosave_interval
    }

    #[must_use]
    pub const fn autosave_on_changes(&self) -> bool {
        self.autosave_on_changes
    }

    #[must_use]
    pub const fn autosave_change_threshold(&self) -> u64 {
        self.autosave_change_threshold
    }

    pub fn set_persistence(&mut self, persistence: bool, location: &Path) {
        self.persistence = persistence;
        self.persistence_location = location.to_path_buf();
    }
}

impl Default for Storage {
    fn default() -> Self {
        toml::from_str("").expect("Invalid default storage config")
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    #[serde(alias = "off")]
    Off,

    #[serde(alias = "error")]
    Error,

    #[serde(alias = "warn")]
    Warn,

    #[serde(alias = "info")]
    Info,

    #[serde(alias = "debug")]
    Debug,

    #[serde(alias = "trace")]
    Trace,
}

/// Log section in config.
#[derive(Debug, Deserialize, Clone)]
pub struct Log {
    /// Path to log file.
    ///
    /// Default is `/var/log/veles/veles.log`.
    #[serde(default = "Log::default_log_file")]
    log_file: PathBuf,

    /// Default is `info`.
    #[serde(default = "Log::default_log_level")]
    log_level: LogLevel,
}

impl Log {
    fn default_log_file() -> PathBuf {
        PathBuf::from("/var/log/veles/veles.log")
    }

    const fn default_log_level() -> LogLevel {
        LogLevel::Info
    }

    #[must_use]
    pub const fn log_file(&self) -> &PathBuf {
        &self.log_file
    }

    #[must_use]
    pub const fn log_level(&self) -> LogLevel {
        self.log_level
    }
}

impl Default for Log {
    fn default() -> Self {
        toml::from_str("").expect("Invalid default log config")
    }
}

/// Direction of one bridge topic mapping.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum BridgeDirection {
    /// Remote publishes are injected locally.
    #[serde(alias = "in")]
    In,

    /// Local publishes are forwarded to the remote.
    #[serde(alias = "out")]
    Out,

    #[serde(alias = "both")]
    Both,
}

/// One topic mapping of a bridge.
#[derive(Debug, Deserialize, Clone)]
pub struct BridgeTopic {
    /// Topic filter, relative to the prefixes.
    pub pattern: String,

    #[serde(default = "BridgeTopic::default_direction")]
    pub direction: BridgeDirection,

    /// Prefix prepended to `pattern` in the local topic space.
    #[serde(default)]
    pub local_prefix: String,

    /// Prefix prepended to `pattern` in the remote topic space.
    #[serde(default)]
    pub remote_prefix: String,

    /// QoS used for the bridged subscription on either side.
    ///
    /// Default is 0.
    #[serde(default)]
    pub qos: QoS,

    /// Local delivery priority for outgoing mappings.
    #[serde(default)]
    pub priority: Priority,
}

impl BridgeTopic {
    const fn default_direction() -> BridgeDirection {
        BridgeDirection::Out
    }

    /// Topic filter in the local topic space.
    #[must_use]
    pub fn local_filter(&self) -> String {
        format!("{}{}", self.local_prefix, self.pattern)
    }

    /// Topic filter in the remote topic space.
    #[must_use]
    pub fn remote_filter(&self) -> String {
        format!("{}{}", self.remote_prefix, self.pattern)
    }
}

/// Bridge section in config, one outbound broker-to-broker connection.
#[derive(Debug, Deserialize, Clone)]
pub struct Bridge {
    /// Bridge name, used in logs and in the default client id.
    pub name: String,

    /// Remote `host:port` addresses, tried in order on failure.
    pub addresses: Vec<String>,

    /// Client id presented to the remote broker.
    ///
    /// Default is `veles.<name>`.
    #[serde(default)]
    pub client_id: Option<String>,

    /// Default is false, so remote QoS handshakes survive a reconnect.
    #[serde(default)]
    pub clean_session: bool,

    /// Keep alive seconds announced to the remote broker.
    ///
    /// Default is 60.
    #[serde(default = "Bridge::default_keep_alive")]
    pub keep_alive: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// First attempt the nonstandard bridge CONNECT variant, so the remote
    /// can suppress loops; fall back to a standard CONNECT when rejected.
    ///
    /// Default is true.
    #[serde(default = "Bridge::default_try_private")]
    pub try_private: bool,

    /// Base reconnect delay in seconds. The delay doubles on every failed
    /// attempt up to `restart_timeout_max`.
    ///
    /// Default is 5.
    #[serde(default = "Bridge::default_restart_timeout")]
    pub restart_timeout: u64,

    /// Default is 300.
    #[serde(default = "Bridge::default_restart_timeout_max")]
    pub restart_timeout_max: u64,

    pub topics: Vec<BridgeTopic>,
}

impl Bridge {
    const fn default_keep_alive() -> u16 {
        60
    }

    const fn default_try_private() -> bool {
        true
    }

    const fn default_restart_timeout() -> u64 {
        5
    }

    const fn default_restart_timeout_max() -> u64 {
        300
    }

    /// Client id presented to the remote broker.
    #[must_use]
    pub fn effective_client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("veles.{}", self.name))
    }

    fn validate(&self) -> Result<(), Error> {
        if self.addresses.is_empty() {
            return Err(Error::from_string(
                ErrorKind::ConfigError,
                format!("Bridge {} has no addresses", self.name),
            ));
        }
        if self.topics.is_empty() {
            return Err(Error::from_string(
                ErrorKind::ConfigError,
                format!("Bridge {} has no topics", self.name),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.general().max_inflight_messages, 20);
        assert_eq!(config.general().retry_interval, 20);
        assert_eq!(config.listeners().len(), 1);
        assert_eq!(config.listeners()[0].address(), "0.0.0.0:1883");
        assert!(config.security().allow_anonymous());
        assert!(!config.storage().persistence());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_bridge() {
        let content = r#"
[[bridges]]
name = "edge"
addresses = ["broker.example.com:1883", "10.0.0.2:1883"]
try_private = false

[[bridges.topics]]
pattern = "sensors/#"
direction = "both"
local_prefix = "local/"
remote_prefix = "remote/"
qos = "AtLeastOnce"
"#;
        let config: Config = toml::from_str(content).unwrap();
        assert!(config.validate().is_ok());
        let bridge = &config.bridges()[0];
        assert_eq!(bridge.effective_client_id(), "veles.edge");
        assert_eq!(bridge.addresses.len(), 2);
        assert!(!bridge.try_private);
        let topic = &bridge.topics[0];
        assert_eq!(topic.local_filter(), "local/sensors/#");
        assert_eq!(topic.remote_filter(), "remote/sensors/#");
        assert_eq!(topic.qos, QoS::AtLeastOnce);
    }

    #[test]
    fn test_bridge_without_address() {
        let content = r##"
[[bridges]]
name = "edge"
addresses = []

[[bridges.topics]]
pattern = "#"
"##;
        let config: Config = toml::from_str(content).unwrap();
        assert!(config.validate().is_err());
    }
}
