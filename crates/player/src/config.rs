//! Configuration for edge resolution and session negotiation
//!
//! Configuration can be loaded from a TOML file and/or environment variables.
//! Every field has a default, so a partial file is valid.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for the playback engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Load-balancer directory base URL (http:// or https://)
    #[serde(default = "default_directory_url")]
    pub directory_url: String,

    /// URL scheme used to reach edge hosts (default: https)
    #[serde(default = "default_edge_scheme")]
    pub edge_scheme: String,

    /// STUN server URLs handed to the local peer connection
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,

    /// Fixed delay between resolution attempts in milliseconds (default: 2000)
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Timeout for every directory and WHEP request in seconds (default: 10)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Upper bound on ICE candidate gathering before the offer is sent (default: 5000)
    #[serde(default = "default_ice_gathering_timeout_ms")]
    pub ice_gathering_timeout_ms: u64,
}

fn default_directory_url() -> String {
    "https://loadbalancer.stronk.rocks".to_string()
}

fn default_edge_scheme() -> String {
    "https".to_string()
}

fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn default_retry_interval_ms() -> u64 {
    2000
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_ice_gathering_timeout_ms() -> u64 {
    5000
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            directory_url: default_directory_url(),
            edge_scheme: default_edge_scheme(),
            stun_servers: default_stun_servers(),
            retry_interval_ms: default_retry_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            ice_gathering_timeout_ms: default_ice_gathering_timeout_ms(),
        }
    }
}

impl PlayerConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&content).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Load configuration from file if given, then apply environment overrides
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Override fields from `EDGEVIEW_*` environment variables
    ///
    /// Unparseable numeric values are ignored and the current value is kept.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("EDGEVIEW_DIRECTORY_URL") {
            self.directory_url = url;
        }
        if let Ok(scheme) = std::env::var("EDGEVIEW_EDGE_SCHEME") {
            self.edge_scheme = scheme;
        }
        if let Ok(servers) = std::env::var("EDGEVIEW_STUN_SERVERS") {
            self.stun_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(ms) = std::env::var("EDGEVIEW_RETRY_INTERVAL_MS") {
            if let Ok(ms) = ms.parse() {
                self.retry_interval_ms = ms;
            }
        }
        if let Ok(secs) = std::env::var("EDGEVIEW_REQUEST_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                self.request_timeout_secs = secs;
            }
        }
        if let Ok(ms) = std::env::var("EDGEVIEW_ICE_GATHERING_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                self.ice_gathering_timeout_ms = ms;
            }
        }
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if:
    /// - `directory_url` is not an absolute http(s) URL
    /// - `edge_scheme` is neither `http` nor `https`
    /// - a STUN/TURN URL has an unknown scheme
    /// - `retry_interval_ms` is not in range 50-60000
    /// - `request_timeout_secs` or `ice_gathering_timeout_ms` is zero
    pub fn validate(&self) -> Result<()> {
        let directory = url::Url::parse(&self.directory_url).map_err(|e| {
            Error::InvalidConfig(format!(
                "directory_url is not a valid URL ({}): {}",
                e, self.directory_url
            ))
        })?;
        if directory.scheme() != "http" && directory.scheme() != "https" {
            return Err(Error::InvalidConfig(format!(
                "directory_url must start with http:// or https://, got {}",
                self.directory_url
            )));
        }

        if self.edge_scheme != "http" && self.edge_scheme != "https" {
            return Err(Error::InvalidConfig(format!(
                "edge_scheme must be http or https, got {}",
                self.edge_scheme
            )));
        }

        if let Some(bad) = self.stun_servers.iter().find(|url| {
            !["stun:", "stuns:", "turn:", "turns:"]
                .iter()
                .any(|scheme| url.starts_with(scheme))
        }) {
            return Err(Error::InvalidConfig(format!(
                "ICE server URL must start with stun:, stuns:, turn: or turns:, got {}",
                bad
            )));
        }

        if self.retry_interval_ms < 50 || self.retry_interval_ms > 60_000 {
            return Err(Error::InvalidConfig(format!(
                "retry_interval_ms must be in range 50-60000, got {}",
                self.retry_interval_ms
            )));
        }

        if self.request_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "request_timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.ice_gathering_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "ice_gathering_timeout_ms must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Delay between resolution attempts
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Timeout for a single HTTP request
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Bound on ICE gathering before the offer goes out
    pub fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gathering_timeout_ms)
    }

    /// Build the shared HTTP client used for directory and WHEP requests
    pub fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.request_timeout())
            .build()
            .map_err(|e| Error::Transport(format!("Failed to create HTTP client: {}", e)))
    }
}
