//! Configuration types for mesh sessions

use crate::signaling::ReconnectionPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for a mesh session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// WebSocket signaling relay URL (ws:// or wss://)
    pub signaling_url: String,

    /// ICE servers handed to every peer connection at construction
    pub ice_servers: Vec<IceServerConfig>,

    /// Room service base URL (room code lookup is skipped if None)
    pub api_base_url: Option<String>,

    /// Maximum remote peers in the mesh (default: 10)
    pub max_peers: usize,

    /// Remote candidates buffered per peer before a remote description lands
    pub max_pending_candidates: usize,

    /// Chat entries kept in memory (default: 500)
    pub chat_history_limit: usize,

    /// Seconds before the invalid-room view returns home (default: 30)
    pub return_home_countdown_secs: u32,

    /// Signaling reconnection behaviour
    pub reconnect: ReconnectionPolicy,
}

/// ICE server entry (STUN or TURN)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server URL (stun:, turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    #[serde(default)]
    pub username: String,

    /// Credential for TURN authentication
    #[serde(default)]
    pub credential: String,
}

impl IceServerConfig {
    /// Plain STUN endpoint
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: String::new(),
            credential: String::new(),
        }
    }

    /// STUN plus TURN over UDP, TCP and TLS-over-TCP on one domain
    ///
    /// # Example
    ///
    /// ```
    /// use vido_mesh::config::IceServerConfig;
    ///
    /// let servers = IceServerConfig::for_turn_domain("turn.example.com", "user", "pass");
    /// assert_eq!(servers.len(), 4);
    /// assert_eq!(servers[0].url, "stun:turn.example.com:3478");
    /// assert_eq!(servers[3].url, "turns:turn.example.com:5349?transport=tcp");
    /// ```
    pub fn for_turn_domain(domain: &str, username: &str, credential: &str) -> Vec<Self> {
        let turn = |url: String| Self {
            url,
            username: username.to_string(),
            credential: credential.to_string(),
        };

        vec![
            Self::stun(format!("stun:{}:3478", domain)),
            turn(format!("turn:{}:3478", domain)),
            turn(format!("turn:{}:3478?transport=tcp", domain)),
            turn(format!("turns:{}:5349?transport=tcp", domain)),
        ]
    }

    /// Whether this entry is a TURN relay
    pub fn is_turn(&self) -> bool {
        self.url.starts_with("turn:") || self.url.starts_with("turns:")
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:4000/signaling".to_string(),
            ice_servers: vec![IceServerConfig::stun("stun:stun.l.google.com:19302")],
            api_base_url: None,
            max_peers: 10,
            max_pending_candidates: 64,
            chat_history_limit: 500,
            return_home_countdown_secs: 30,
            reconnect: ReconnectionPolicy::default(),
        }
    }
}

impl MeshConfig {
    /// Preset for a relay running on the developer's machine
    ///
    /// Public STUN only, short reconnect backoff so a restarted relay is
    /// picked up quickly.
    ///
    /// # Example
    ///
    /// ```
    /// use vido_mesh::config::MeshConfig;
    ///
    /// let config = MeshConfig::local_dev_preset(4000);
    /// assert_eq!(config.signaling_url, "ws://localhost:4000/signaling");
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn local_dev_preset(port: u16) -> Self {
        Self {
            signaling_url: format!("ws://localhost:{}/signaling", port),
            api_base_url: Some(format!("http://localhost:{}/api", port)),
            reconnect: ReconnectionPolicy {
                max_attempts: 20,
                initial_delay_ms: 250,
                max_delay_ms: 2000,
                multiplier: 1.5,
                jitter: false,
            },
            ..Self::default()
        }
    }

    /// Preset for a deployed relay behind TLS with its own TURN server
    ///
    /// Media goes through STUN + TURN (UDP, TCP, TLS) on `turn_domain` so
    /// participants behind symmetric NATs still connect.
    ///
    /// # Example
    ///
    /// ```
    /// use vido_mesh::config::MeshConfig;
    ///
    /// let config = MeshConfig::production_preset(
    ///     "wss://meet.example.com/signaling",
    ///     "turn.example.com",
    ///     "videochat",
    ///     "secret",
    /// );
    /// assert_eq!(config.ice_servers.len(), 4);
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn production_preset(
        signaling_url: &str,
        turn_domain: &str,
        turn_user: &str,
        turn_pass: &str,
    ) -> Self {
        Self {
            signaling_url: signaling_url.to_string(),
            ice_servers: IceServerConfig::for_turn_domain(turn_domain, turn_user, turn_pass),
            reconnect: ReconnectionPolicy {
                max_attempts: 10,
                ..ReconnectionPolicy::default()
            },
            ..Self::default()
        }
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `ice_servers` is empty or an entry has an unknown scheme
    /// - a TURN entry lacks credentials
    /// - `max_peers` is 0
    /// - `max_pending_candidates` or `chat_history_limit` is 0
    /// - `signaling_url` is not a valid WebSocket URL
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.ice_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one ICE server is required".to_string(),
            ));
        }

        for server in &self.ice_servers {
            let known = server.url.starts_with("stun:") || server.is_turn();
            if !known {
                return Err(Error::InvalidConfig(format!(
                    "ICE server URL must start with stun:, turn: or turns:, got {}",
                    server.url
                )));
            }
            if server.is_turn() && server.username.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "TURN server {} requires a username",
                    server.url
                )));
            }
        }

        if self.max_peers == 0 {
            return Err(Error::InvalidConfig(
                "max_peers must be at least 1".to_string(),
            ));
        }

        if self.max_pending_candidates == 0 {
            return Err(Error::InvalidConfig(
                "max_pending_candidates must be at least 1".to_string(),
            ));
        }

        if self.chat_history_limit == 0 {
            return Err(Error::InvalidConfig(
                "chat_history_limit must be at least 1".to_string(),
            ));
        }

        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must start with ws:// or wss://, got {}",
                self.signaling_url
            )));
        }

        if let Some(api) = &self.api_base_url {
            url::Url::parse(api).map_err(|e| {
                Error::InvalidConfig(format!("api_base_url is not a valid URL ({}): {}", api, e))
            })?;
        }

        Ok(())
    }

    /// Build a configuration from `MESH_*` environment variables
    ///
    /// Unset variables keep their defaults. `MESH_TURN_DOMAIN` replaces the
    /// ICE server list with STUN + the three TURN variants on that domain.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("MESH_SIGNALING_URL") {
            config.signaling_url = url;
        }

        if let Ok(domain) = std::env::var("MESH_TURN_DOMAIN") {
            let user = std::env::var("MESH_TURN_USER").unwrap_or_else(|_| "videochat".to_string());
            let pass = std::env::var("MESH_TURN_PASS").unwrap_or_default();
            config.ice_servers = IceServerConfig::for_turn_domain(&domain, &user, &pass);
        }

        if let Ok(api) = std::env::var("MESH_API_URL") {
            config.api_base_url = Some(api);
        }

        config
    }

    /// Countdown before the invalid-room view navigates home
    pub fn return_home_countdown(&self) -> Duration {
        Duration::from_secs(u64::from(self.return_home_countdown_secs))
    }

    /// Replace the ICE server list
    pub fn with_ice_servers(mut self, ice_servers: Vec<IceServerConfig>) -> Self {
        self.ice_servers = ice_servers;
        self
    }

    /// Set the signaling relay URL
    pub fn with_signaling_url(mut self, url: &str) -> Self {
        self.signaling_url = url.to_string();
        self
    }

    /// Set the room service base URL
    pub fn with_api_base_url(mut self, url: &str) -> Self {
        self.api_base_url = Some(url.to_string());
        self
    }

    /// Set the maximum number of remote peers
    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    /// Set the relay reconnection policy
    pub fn with_reconnect(mut self, reconnect: ReconnectionPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set how many chat lines are kept
    pub fn with_chat_history_limit(mut self, limit: usize) -> Self {
        self.chat_history_limit = limit;
        self
    }
}
