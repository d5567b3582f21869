//! Wire frames and the reserved protocol events.
//!
//! Every frame, in both directions and over every transport, is a JSON object
//! `{ "topic": .., "event": .., "payload": {..}, "ref": "12" | null }`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event sent to join a topic.
pub const JOIN: &str = "phx_join";
/// Event sent to leave a topic.
pub const LEAVE: &str = "phx_leave";
/// Server-initiated close of a channel.
pub const CLOSE: &str = "phx_close";
/// Channel crash signal (also synthesized locally on transport errors).
pub const ERROR: &str = "phx_error";
/// Server reply to a push, payload `{status, response}`.
pub const REPLY: &str = "phx_reply";
/// Heartbeat event, always on [`PHOENIX_TOPIC`].
pub const HEARTBEAT: &str = "heartbeat";
/// Reserved topic for socket-level frames.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// One wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub event: String,
    #[serde(default = "empty_payload")]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub msg_ref: Option<String>,
}

fn empty_payload() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Message {
    pub fn new(
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
        msg_ref: Option<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            msg_ref,
        }
    }

    pub fn heartbeat(msg_ref: String) -> Self {
        Self::new(PHOENIX_TOPIC, HEARTBEAT, empty_payload(), Some(msg_ref))
    }

    pub fn to_json(&self) -> String {
        // A struct of strings and a Value cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }

    /// The `{status, response}` envelope of a reply frame, if this is one.
    pub fn reply(&self) -> Option<Reply> {
        if self.event != REPLY {
            return None;
        }
        Reply::from_payload(&self.payload)
    }
}

/// Payload of a `phx_reply` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub status: String,
    #[serde(default = "empty_payload")]
    pub response: Value,
}

impl Reply {
    pub fn from_payload(payload: &Value) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }
}

/// Key of a channel's binding table.
///
/// The reserved events get their own variants; anything else is an
/// application event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelEvent {
    Join,
    Leave,
    Close,
    Error,
    Reply,
    Custom(String),
}

impl ChannelEvent {
    pub fn as_str(&self) -> &str {
        match self {
            ChannelEvent::Join => JOIN,
            ChannelEvent::Leave => LEAVE,
            ChannelEvent::Close => CLOSE,
            ChannelEvent::Error => ERROR,
            ChannelEvent::Reply => REPLY,
            ChannelEvent::Custom(event) => event,
        }
    }
}

impl From<&str> for ChannelEvent {
    fn from(event: &str) -> Self {
        match event {
            JOIN => ChannelEvent::Join,
            LEAVE => ChannelEvent::Leave,
            CLOSE => ChannelEvent::Close,
            ERROR => ChannelEvent::Error,
            REPLY => ChannelEvent::Reply,
            other => ChannelEvent::Custom(other.to_string()),
        }
    }
}

impl std::fmt::Display for ChannelEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Socket-wide correlation counter.
///
/// Starts at 0 and wraps back to 0 instead of overflowing.
#[derive(Debug, Default)]
pub struct RefCounter(u64);

impl RefCounter {
    pub fn next(&mut self) -> String {
        self.0 = self.0.checked_add(1).unwrap_or(0);
        self.0.to_string()
    }
}
