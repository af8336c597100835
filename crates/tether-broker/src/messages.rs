//! Real-time event frames
//!
//! Every WebSocket text frame is a JSON object `{"event": <kind>, "data": <payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events a session sends to the broker
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Bind an identity key to this session
    Register(String),

    /// Ask a peer to open a direct channel
    RequestConnection(Route),

    /// Accept a peer's connection request
    AcceptConnection(Route),

    /// Ring a peer
    CallRequest(CallRequest),

    CallAccepted(Route),

    CallRejected(Route),

    CallEnded(Route),

    /// Join a named group
    Join(String),

    /// Broadcast a payload to the rest of a room
    Signal(RoomMessage),

    /// Broadcast an auth payload to the rest of a room
    Auth(RoomMessage),
}

/// Events the broker delivers to a session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    IncomingRequest {
        from: String,
    },

    ConnectionAccepted {
        from: String,
    },

    IncomingCall {
        from: String,
        #[serde(rename = "callType")]
        call_type: String,
    },

    CallAccepted {
        from: String,
    },

    CallRejected {
        from: String,
    },

    CallEnded {
        from: String,
    },

    /// Room payload, passed through untouched
    Signal(Value),

    /// Room auth payload, passed through untouched
    Auth(Value),
}

/// Addressing for a point-to-point relay event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub to: String,
    pub from: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRequest {
    pub to: String,
    pub from: String,
    #[serde(rename = "callType")]
    pub call_type: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoomMessage {
    pub room: String,
    pub payload: Value,
}

impl ClientEvent {
    /// Wire name of the event
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::Register(_) => "register",
            ClientEvent::RequestConnection(_) => "request-connection",
            ClientEvent::AcceptConnection(_) => "accept-connection",
            ClientEvent::CallRequest(_) => "call-request",
            ClientEvent::CallAccepted(_) => "call-accepted",
            ClientEvent::CallRejected(_) => "call-rejected",
            ClientEvent::CallEnded(_) => "call-ended",
            ClientEvent::Join(_) => "join",
            ClientEvent::Signal(_) => "signal",
            ClientEvent::Auth(_) => "auth",
        }
    }

    /// Whether the event counts against the origin's rate budget
    ///
    /// Registration and connection requests are limited. Acceptance, call
    /// lifecycle, and room traffic are not.
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            ClientEvent::Register(_) | ClientEvent::RequestConnection(_)
        )
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl ServerEvent {
    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
