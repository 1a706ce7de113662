//! Stream names and the edge URIs derived from them

use crate::{Error, Result};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Characters escaped in a path or query component.
///
/// Everything except ASCII alphanumerics and `- _ . ! ~ * ' ( )`, the same
/// set browsers leave untouched in `encodeURIComponent`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Name of a live stream as published to the directory
///
/// Treated as untrusted: it is never interpolated into a URL without
/// [`StreamName::encoded`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamName(String);

impl StreamName {
    /// Create a stream name
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the name is empty or whitespace.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidConfig("stream name is empty".to_string()));
        }
        Ok(Self(name))
    }

    /// Raw name as given by the caller
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Percent-encoded form for a path segment or query value
    pub fn encoded(&self) -> String {
        utf8_percent_encode(&self.0, COMPONENT).to_string()
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StreamName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<StreamName> for String {
    fn from(name: StreamName) -> Self {
        name.0
    }
}

/// WHEP endpoint for a stream on an edge host
///
/// The host is used verbatim as returned by the directory.
pub fn whep_url(scheme: &str, host: &str, stream: &StreamName) -> String {
    format!("{}://{}/view/webrtc/{}", scheme, host, stream.encoded())
}

/// Every URI an embedded edge player needs for one stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerUris {
    /// `https://{host}/view/`
    pub view_base: String,
    /// Standalone HTML player page for the stream
    pub html: String,
    /// Player script served by the edge
    pub player_script: String,
    /// WHEP endpoint
    pub whep: String,
    /// WebSocket signaling endpoint
    pub websocket: String,
}

impl PlayerUris {
    /// Derive player URIs from a resolved host
    pub fn new(scheme: &str, host: &str, stream: &StreamName) -> Self {
        let view_base = format!("{}://{}/view/", scheme, host);
        let ws_scheme = if scheme == "http" { "ws" } else { "wss" };

        Self {
            html: format!("{}{}.html", view_base, stream.encoded()),
            player_script: format!("{}player.js", view_base),
            whep: whep_url(scheme, host, stream),
            websocket: format!("{}://{}/view/webrtc/{}", ws_scheme, host, stream.encoded()),
            view_base,
        }
    }
}
