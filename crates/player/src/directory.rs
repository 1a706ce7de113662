//! Load-balancer directory client
//!
//! The directory answers three plain-text/JSON GET queries:
//!
//! | Query | Path | Response |
//! |---|---|---|
//! | Edge host for viewers | `GET /{stream}` | `FULL` or hostname |
//! | Source presence | `GET /?source={stream}` | `FULL` or opaque token |
//! | Metadata | `GET /` | JSON |
//!
//! Calls are single-shot. Retrying is the
//! [`ResolutionController`](crate::resolution::ResolutionController)'s job.

use crate::config::PlayerConfig;
use crate::stream::StreamName;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Body the directory returns when it has nothing to offer
pub const FULL_SENTINEL: &str = "FULL";

/// Resolution status of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    /// Lookup in progress or not yet started
    Loading,
    /// No source published, or no edge has capacity
    NoStream,
    /// Directory unreachable or returned an error
    Error,
    /// An edge host is known
    Ready,
}

impl fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResolutionStatus::Loading => "loading",
            ResolutionStatus::NoStream => "no_stream",
            ResolutionStatus::Error => "error",
            ResolutionStatus::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// Outcome of a source presence query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceResult {
    /// A live source exists; the token is opaque
    Present(String),
    /// The directory reported no source
    Absent,
    /// The query failed; treated as absent with an error flag
    Unavailable(String),
}

impl SourceResult {
    /// Whether a source exists
    pub fn is_present(&self) -> bool {
        matches!(self, SourceResult::Present(_))
    }

    /// Whether the query itself failed
    pub fn is_error(&self) -> bool {
        matches!(self, SourceResult::Unavailable(_))
    }
}

/// Outcome of an edge host query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostResult {
    /// Edge hostname, empty unless `status` is `Ready`
    pub host: String,
    /// Resolution status
    pub status: ResolutionStatus,
}

impl HostResult {
    /// A resolved edge host
    pub fn ready(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            status: ResolutionStatus::Ready,
        }
    }

    /// No edge can serve the stream
    pub fn no_stream() -> Self {
        Self {
            host: String::new(),
            status: ResolutionStatus::NoStream,
        }
    }

    /// The query failed
    pub fn error() -> Self {
        Self {
            host: String::new(),
            status: ResolutionStatus::Error,
        }
    }
}

/// Directory queries needed to resolve an edge
#[async_trait]
pub trait Directory: Send + Sync {
    /// Check whether a live source exists for the stream
    async fn check_source(&self, stream: &StreamName) -> SourceResult;

    /// Ask which edge should serve viewers of the stream
    async fn resolve_host(&self, stream: &StreamName) -> HostResult;
}

/// HTTP client for the load-balancer directory
#[derive(Debug, Clone)]
pub struct DirectoryClient {
    /// Base URL without trailing slash
    base_url: String,

    /// Reqwest HTTP client
    client: reqwest::Client,
}

impl DirectoryClient {
    /// Create a directory client from configuration
    pub fn new(config: &PlayerConfig) -> Result<Self> {
        Ok(Self::with_client(&config.directory_url, config.http_client()?))
    }

    /// Create a directory client sharing an existing HTTP client
    pub fn with_client(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Directory base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch directory metadata
    ///
    /// The JSON document is passed through untouched.
    pub async fn fetch_metadata(&self) -> Result<serde_json::Value> {
        let url = format!("{}/", self.base_url);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!(
                "directory metadata request failed: HTTP {}",
                status.as_u16()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("invalid directory metadata: {}", e)))
    }

    /// GET a URL and return the body of a 2xx response
    async fn get_text(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!("HTTP {}", status.as_u16())));
        }

        Ok(response.text().await?)
    }
}

#[async_trait]
impl Directory for DirectoryClient {
    async fn check_source(&self, stream: &StreamName) -> SourceResult {
        let url = format!("{}/?source={}", self.base_url, stream.encoded());

        let result = match self.get_text(&url).await {
            Ok(body) if body.is_empty() || body == FULL_SENTINEL => SourceResult::Absent,
            Ok(body) => SourceResult::Present(body),
            Err(e) => {
                warn!(stream = %stream, error = %e, "Source check failed");
                SourceResult::Unavailable(e.to_string())
            }
        };

        debug!(stream = %stream, present = result.is_present(), "Source check complete");
        result
    }

    async fn resolve_host(&self, stream: &StreamName) -> HostResult {
        let url = format!("{}/{}", self.base_url, stream.encoded());

        let result = match self.get_text(&url).await {
            Ok(body) if body.is_empty() || body == FULL_SENTINEL => HostResult::no_stream(),
            Ok(body) => HostResult::ready(body),
            Err(e) => {
                warn!(stream = %stream, error = %e, "Host lookup failed");
                HostResult::error()
            }
        };

        debug!(
            stream = %stream,
            status = %result.status,
            host = %result.host,
            "Host lookup complete"
        );
        result
    }
}
