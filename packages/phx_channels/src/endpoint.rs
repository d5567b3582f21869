//! Endpoint URL resolution.

use serde::{Deserialize, Serialize};

use crate::error::SocketError;

/// The "page" a relative endpoint is resolved against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    /// Whether the page was served over a secure scheme.
    #[serde(default)]
    pub secure: bool,
    /// `host[:port]` of the page.
    pub host: String,
}

impl Origin {
    pub fn new(host: impl Into<String>, secure: bool) -> Self {
        Self {
            secure,
            host: host.into(),
        }
    }

    fn ws_scheme(&self) -> &'static str {
        if self.secure { "wss" } else { "ws" }
    }
}

/// Resolve the endpoint a Socket was created with.
///
/// - not starting with `/`: used verbatim
/// - `//host/path`: the origin's scheme is prefixed
/// - `/path`: scheme and host of the origin are prefixed
pub fn expand_endpoint(endpoint: &str, origin: Option<&Origin>) -> Result<String, SocketError> {
    if !endpoint.starts_with('/') {
        return Ok(endpoint.to_string());
    }
    let origin = origin.ok_or_else(|| SocketError::RelativeEndpoint(endpoint.to_string()))?;
    if endpoint.starts_with("//") {
        return Ok(format!("{}:{}", origin.ws_scheme(), endpoint));
    }
    Ok(format!("{}://{}{}", origin.ws_scheme(), origin.host, endpoint))
}

/// HTTP(S) URL the long-poll fallback talks to for a socket endpoint.
pub fn poll_endpoint(endpoint: &str) -> String {
    let base = if let Some(rest) = endpoint.strip_prefix("ws://") {
        format!("http://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix("wss://") {
        format!("https://{rest}")
    } else {
        endpoint.to_string()
    };
    if base.ends_with('/') {
        format!("{base}poll")
    } else {
        format!("{base}/poll")
    }
}
