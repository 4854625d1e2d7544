//! Proxy configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::proxy::relay::RELAY_BUFFER_SIZE;
use crate::proxy::Mode;

/// Default number of readiness events drained per poll.
pub const DEFAULT_MAX_EVENTS: usize = 1024;

/// Which side of the tunnel this instance runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Role {
    /// Accept applications and tunnel every connection to the peer agent
    Local {
        /// Peer agent host
        peer_host: String,
        /// Peer agent port
        peer_port: u16,
    },
    /// Accept tunnel connections and dial the requested targets
    Server,
}

impl Role {
    /// Connection mode for this role.
    pub fn mode(&self) -> Mode {
        match self {
            Role::Local { .. } => Mode::Local,
            Role::Server => Mode::Server,
        }
    }

    /// `host:port` of the peer agent, for the local role.
    pub fn peer_address(&self) -> Option<String> {
        match self {
            Role::Local {
                peer_host,
                peer_port,
            } => Some(format!("{}:{}", peer_host, peer_port)),
            Role::Server => None,
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listen address
    pub listen_addr: String,
    /// Listen port
    pub listen_port: u16,
    /// Local or server role
    pub role: Role,
    /// Bound on each synchronous dial; `None` waits for the OS
    pub dial_timeout: Option<Duration>,
    /// Tear down connections that have not reached relay in time
    pub handshake_timeout: Option<Duration>,
    /// Relay read chunk size
    pub relay_buffer_size: usize,
    /// Readiness events drained per poll
    pub max_events: usize,
}

impl ProxyConfig {
    /// Local-role configuration listening on all interfaces.
    pub fn local(listen_port: u16, peer_host: impl Into<String>, peer_port: u16) -> Self {
        Self::with_role(
            listen_port,
            Role::Local {
                peer_host: peer_host.into(),
                peer_port,
            },
        )
    }

    /// Server-role configuration listening on all interfaces.
    pub fn server(listen_port: u16) -> Self {
        Self::with_role(listen_port, Role::Server)
    }

    fn with_role(listen_port: u16, role: Role) -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port,
            role,
            dial_timeout: None,
            handshake_timeout: None,
            relay_buffer_size: RELAY_BUFFER_SIZE,
            max_events: DEFAULT_MAX_EVENTS,
        }
    }

    /// `host:port` the listener binds.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(Error::config("listen_addr cannot be empty"));
        }
        if let Role::Local {
            peer_host,
            peer_port,
        } = &self.role
        {
            if peer_host.is_empty() {
                return Err(Error::config("peer_host cannot be empty in local role"));
            }
            if *peer_port == 0 {
                return Err(Error::config("peer_port cannot be 0 in local role"));
            }
        }
        if self.relay_buffer_size == 0 {
            return Err(Error::config("relay_buffer_size must be positive"));
        }
        if self.max_events == 0 {
            return Err(Error::config("max_events must be positive"));
        }
        if self.handshake_timeout == Some(Duration::ZERO) {
            return Err(Error::config("handshake_timeout must be positive"));
        }
        if self.dial_timeout == Some(Duration::ZERO) {
            return Err(Error::config("dial_timeout must be positive"));
        }
        Ok(())
    }
}

/// Whole seconds, rounding any fraction up.
fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_relay_buffer_size() -> usize {
    RELAY_BUFFER_SIZE
}

fn default_max_events() -> usize {
    DEFAULT_MAX_EVENTS
}

/// Configuration file format for serialization.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProxyConfigFile {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Listen port
    pub listen_port: u16,
    /// Role and its parameters
    #[serde(flatten)]
    pub role: Role,
    /// Dial timeout (seconds)
    #[serde(default)]
    pub dial_timeout_secs: Option<u64>,
    /// Handshake timeout (seconds)
    #[serde(default)]
    pub handshake_timeout_secs: Option<u64>,
    /// Relay read chunk size
    #[serde(default = "default_relay_buffer_size")]
    pub relay_buffer_size: usize,
    /// Readiness events drained per poll
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

impl ProxyConfigFile {
    /// Read a TOML or JSON (by `.json` extension) configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;

        let is_json = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            serde_json::from_str(&content)
                .map_err(|e| Error::config(format!("invalid JSON in {}: {}", path.display(), e)))
        } else {
            toml::from_str(&content)
                .map_err(|e| Error::config(format!("invalid TOML in {}: {}", path.display(), e)))
        }
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))
    }

    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<ProxyConfig> {
        let config = ProxyConfig {
            listen_addr: self.listen_addr.clone(),
            listen_port: self.listen_port,
            role: self.role.clone(),
            dial_timeout: self.dial_timeout_secs.map(Duration::from_secs),
            handshake_timeout: self.handshake_timeout_secs.map(Duration::from_secs),
            relay_buffer_size: self.relay_buffer_size,
            max_events: self.max_events,
        };
        config.validate()?;
        Ok(config)
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            listen_addr: config.listen_addr.clone(),
            listen_port: config.listen_port,
            role: config.role.clone(),
            dial_timeout_secs: config.dial_timeout.map(ceil_secs),
            handshake_timeout_secs: config.handshake_timeout.map(ceil_secs),
            relay_buffer_size: config.relay_buffer_size,
            max_events: config.max_events,
        }
    }
}
