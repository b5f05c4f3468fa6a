//! Configuration types for the signaling control plane

use crate::signal::ReconnectPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for a Control instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConnectConfig {
    /// Signaling server connection
    pub signal: SignalConfig,

    /// Per-peer data channel limits and timings
    pub peer: PeerConfig,

    /// Connection engine (ICE servers)
    pub engine: EngineConfig,
}

/// Signal channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// WebSocket signaling server URL (ws:// or wss://)
    pub url: String,

    /// Backoff applied after abnormal disconnection
    pub reconnect: ReconnectPolicy,
}

/// Per-peer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Send is refused once this many bytes are buffered (default: 16 MiB)
    pub max_buffered_bytes: u64,

    /// Upper bound for a blocking send to drain (default: 60000ms)
    pub sync_send_timeout_ms: u64,

    /// Grace period between both half-channels closing and reclaiming the peer (default: 1000ms)
    pub close_grace_ms: u64,

    /// Prefix of the local data channel label, followed by the remote id
    pub channel_label_prefix: String,
}

/// Connection engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Sign-in credentials carried by a flat settings document
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Credentials {
    /// Signaling user id
    pub user_id: String,

    /// Signaling password
    pub user_password: String,
}

/// Flat settings document: `{ "url", "user_id", "user_password" }`
#[derive(Debug, Deserialize)]
struct FlatSettings {
    url: String,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    user_password: String,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080".to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_buffered_bytes: 16 * 1024 * 1024,
            sync_send_timeout_ms: 60_000,
            close_grace_ms: 1000,
            channel_label_prefix: "pc_data_".to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
        }
    }
}

impl PeerConfig {
    /// Blocking send timeout as a Duration
    pub fn sync_send_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_send_timeout_ms)
    }

    /// Delayed-close grace period as a Duration
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    /// Label of the local data channel towards `remote_id`
    pub fn channel_label(&self, remote_id: &str) -> String {
        format!("{}{}", self.channel_label_prefix, remote_id)
    }
}

impl PeerConnectConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `signal.url` is not a WebSocket URL
    /// - `signal.reconnect` has a zero base delay, a max below the base, or a multiplier below 1
    /// - `peer.max_buffered_bytes` or `peer.sync_send_timeout_ms` is zero
    /// - a TURN server URL does not start with `turn:` or `turns:`
    pub fn validate(&self) -> Result<()> {
        let url = &self.signal.url;
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signal.url must start with ws:// or wss://, got {}",
                url
            )));
        }

        let reconnect = &self.signal.reconnect;
        if reconnect.base_delay_ms == 0 {
            return Err(Error::InvalidConfig(
                "signal.reconnect.base_delay_ms must be positive".to_string(),
            ));
        }
        if reconnect.max_delay_ms < reconnect.base_delay_ms {
            return Err(Error::InvalidConfig(format!(
                "signal.reconnect.max_delay_ms ({}) is below base_delay_ms ({})",
                reconnect.max_delay_ms, reconnect.base_delay_ms
            )));
        }
        if reconnect.multiplier.is_nan() || reconnect.multiplier < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "signal.reconnect.multiplier must be >= 1.0, got {}",
                reconnect.multiplier
            )));
        }

        if self.peer.max_buffered_bytes == 0 {
            return Err(Error::InvalidConfig(
                "peer.max_buffered_bytes must be positive".to_string(),
            ));
        }
        if self.peer.sync_send_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "peer.sync_send_timeout_ms must be positive".to_string(),
            ));
        }

        for turn in &self.engine.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN server URL must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        Ok(())
    }

    /// Deserialize and validate a full configuration document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a flat settings document into a configuration and credentials
    ///
    /// # Example
    ///
    /// ```
    /// use peerconnect::PeerConnectConfig;
    ///
    /// let (config, credentials) = PeerConnectConfig::from_settings_json(
    ///     r#"{"url": "wss://signal.example.com", "user_id": "alice", "user_password": "pw"}"#,
    /// ).unwrap();
    /// assert_eq!(config.signal.url, "wss://signal.example.com");
    /// assert_eq!(credentials.user_id, "alice");
    /// ```
    pub fn from_settings_json(json: &str) -> Result<(Self, Credentials)> {
        let settings: FlatSettings = serde_json::from_str(json)?;
        let config = Self::default().with_signal_url(&settings.url);
        config.validate()?;

        Ok((
            config,
            Credentials {
                user_id: settings.user_id,
                user_password: settings.user_password,
            },
        ))
    }

    /// Set the signaling server URL
    pub fn with_signal_url(mut self, url: &str) -> Self {
        self.signal.url = url.to_string();
        self
    }

    /// Replace the STUN server list
    pub fn with_stun_servers(mut self, stun_servers: Vec<String>) -> Self {
        self.engine.stun_servers = stun_servers;
        self
    }

    /// Replace the TURN server list
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.engine.turn_servers = turn_servers;
        self
    }

    /// Replace the reconnection policy
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.signal.reconnect = policy;
        self
    }

    /// Set the send backpressure cap
    pub fn with_max_buffered_bytes(mut self, max_buffered_bytes: u64) -> Self {
        self.peer.max_buffered_bytes = max_buffered_bytes;
        self
    }
}
