//! Configuration management for pairlink

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Negotiation and reconnection behaviour
    #[serde(default)]
    pub session: SessionConfig,

    /// Peer connection settings
    #[serde(default)]
    pub webrtc: WebRTCConfig,

    /// Signaling relay (server side and client URL)
    #[serde(default)]
    pub relay: RelayConfig,

    /// Call invitations
    #[serde(default)]
    pub invite: InviteConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Peer session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Connection losses recovered before a session gives up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Upper bound on ICE gathering before an offer is published
    #[serde(default = "default_ice_gathering_timeout_ms")]
    pub ice_gathering_timeout_ms: u64,

    /// Delay between a connection loss and the reconnect attempt
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// A reconnect attempt that has not connected after this long counts as
    /// another loss
    #[serde(default = "default_reconnect_timeout_ms")]
    pub reconnect_timeout_ms: u64,

    /// Label of the in-call control data channel
    #[serde(default = "default_control_channel_label")]
    pub control_channel_label: String,
}

impl SessionConfig {
    pub fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gathering_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            ice_gathering_timeout_ms: default_ice_gathering_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            reconnect_timeout_ms: default_reconnect_timeout_ms(),
            control_channel_label: default_control_channel_label(),
        }
    }
}

/// WebRTC peer connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRTCConfig {
    /// STUN/TURN server URLs
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,

    /// Pre-gathered candidate pool size
    #[serde(default = "default_ice_candidate_pool_size")]
    pub ice_candidate_pool_size: u8,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            ice_candidate_pool_size: default_ice_candidate_pool_size(),
        }
    }
}

/// Signaling relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Bind address for the relay server
    #[serde(default = "default_relay_host")]
    pub host: String,

    #[serde(default = "default_relay_port")]
    pub port: u16,

    /// WebSocket route served by the relay
    #[serde(default = "default_relay_path")]
    pub path: String,

    /// Relay URL used by peers; derived from host/port/path when unset
    #[serde(default)]
    pub url: Option<String>,
}

impl RelayConfig {
    pub fn client_url(&self) -> String {
        match self.url {
            Some(ref url) => url.clone(),
            None => {
                let host = if self.host == "0.0.0.0" { "127.0.0.1" } else { self.host.as_str() };
                format!("ws://{}:{}{}", host, self.port, self.path)
            }
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_relay_host(),
            port: default_relay_port(),
            path: default_relay_path(),
            url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteConfig {
    /// Seconds an outgoing invitation waits for an answer
    #[serde(default = "default_invite_timeout_secs")]
    pub timeout_secs: u64,
}

impl InviteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for InviteConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_invite_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.session.max_reconnect_attempts == 0 {
            return Err("Session max_reconnect_attempts must be non-zero".into());
        }

        if self.session.ice_gathering_timeout_ms == 0 {
            return Err("Session ice_gathering_timeout_ms must be non-zero".into());
        }

        if self.session.reconnect_timeout_ms == 0 {
            return Err("Session reconnect_timeout_ms must be non-zero".into());
        }

        if self.session.control_channel_label.trim().is_empty() {
            return Err("Session control_channel_label must not be empty".into());
        }

        if self.webrtc.ice_servers.iter().any(|url| url.trim().is_empty()) {
            return Err("WebRTC ice_servers must not contain empty URLs".into());
        }

        if !self.relay.path.starts_with('/') {
            return Err("Relay path must start with '/'".into());
        }

        if self.invite.timeout_secs == 0 {
            return Err("Invite timeout_secs must be non-zero".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.session.max_reconnect_attempts, 3);
        assert_eq!(cfg.session.control_channel_label, "control");
        assert_eq!(cfg.webrtc.ice_servers.len(), 2);
    }

    #[test]
    fn validate_rejects_zero_attempts() {
        let mut cfg = Config::default();
        cfg.session.max_reconnect_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_relative_relay_path() {
        let mut cfg = Config::default();
        cfg.relay.path = "relay".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg: Config = toml::from_str("[session]\nmax_reconnect_attempts = 5\n").unwrap();
        assert_eq!(cfg.session.max_reconnect_attempts, 5);
        assert_eq!(cfg.session.reconnect_delay_ms, 1000);
        assert_eq!(cfg.relay.port, 8787);
    }

    #[test]
    fn partial_relay_and_logging_sections_keep_defaults() {
        let cfg: Config = toml::from_str("[relay]\nurl = \"ws://relay.example:9000/relay\"\n\n[logging]\n").unwrap();
        assert_eq!(cfg.relay.host, "0.0.0.0");
        assert_eq!(cfg.relay.port, 8787);
        assert_eq!(cfg.relay.path, "/relay");
        assert_eq!(cfg.relay.client_url(), "ws://relay.example:9000/relay");
        assert_eq!(cfg.logging.level, "info");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn client_url_from_bind_address() {
        let cfg = Config::default();
        assert_eq!(cfg.relay.client_url(), "ws://127.0.0.1:8787/relay");
    }
}

fn default_max_reconnect_attempts() -> u32 { 3 }
fn default_ice_gathering_timeout_ms() -> u64 { 10_000 }
fn default_reconnect_delay_ms() -> u64 { 1000 }
fn default_reconnect_timeout_ms() -> u64 { 15_000 }
fn default_invite_timeout_secs() -> u64 { 30 }
fn default_ice_candidate_pool_size() -> u8 { 10 }
fn default_relay_port() -> u16 { 8787 }

fn default_relay_host() -> String {
    "0.0.0.0".to_string()
}

fn default_relay_path() -> String {
    "/relay".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_control_channel_label() -> String {
    "control".to_string()
}

fn default_ice_servers() -> Vec<String> {
    vec![
        "stun:stun1.l.google.com:19302".to_string(),
        "stun:stun2.l.google.com:19302".to_string(),
    ]
}
