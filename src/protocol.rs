//! JSON envelope for the room signaling protocol.
//!
//! Wire shapes (one JSON object per text frame):
//! ```text
//! server → owner   {"role":"owner"}
//! server → peer    {"role":"peer","id":<peerId>}
//! server → owner   {"open":<peerId>}          peer attached
//! server → owner   {"close":<peerId>}         peer detached
//! server → sender  {"error":"bad payload"}    frame dropped
//! server → owner   {"from":<peerId>,"body":…} peer message, wrapped
//! owner  → server  {"to":"*" | <peerId>, …}   routed verbatim
//! peer   → server  any JSON                   always wrapped to owner
//! ```
//!
//! Every server-sent shape is a distinct variant of [`ServerNotice`] so a
//! malformed or mis-addressed frame is a decode error, not a missing-field
//! lookup at routing time.

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Role assigned to a room connection at join time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Peer,
}

/// A server-generated room frame.
///
/// Serializes to the exact field shapes of the wire protocol above.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerNotice {
    /// Role assignment sent to a connection right after it joins.
    Role {
        role: Role,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<Uuid>,
    },
    /// Owner-directed notice: a peer attached.
    PeerOpened { open: Uuid },
    /// Owner-directed notice: a peer detached.
    PeerClosed { close: Uuid },
    /// Sender-directed error notice.
    Error { error: String },
    /// Peer message wrapped for delivery to the owner.
    Forward { from: Uuid, body: Value },
}

impl ServerNotice {
    pub fn owner_role() -> Self {
        Self::Role {
            role: Role::Owner,
            id: None,
        }
    }

    pub fn peer_role(id: Uuid) -> Self {
        Self::Role {
            role: Role::Peer,
            id: Some(id),
        }
    }

    pub fn opened(id: Uuid) -> Self {
        Self::PeerOpened { open: id }
    }

    pub fn closed(id: Uuid) -> Self {
        Self::PeerClosed { close: id }
    }

    pub fn bad_payload() -> Self {
        Self::Error {
            error: "bad payload".to_string(),
        }
    }

    pub fn unknown_peer() -> Self {
        Self::Error {
            error: "unknown peer".to_string(),
        }
    }

    pub fn forward(from: Uuid, body: Value) -> Self {
        Self::Forward { from, body }
    }

    /// Serialize to a wire frame.
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Destination of an owner frame, taken from its `to` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// `"to": "*"` — every peer currently attached.
    Broadcast,
    /// `"to": <peerId>` — exactly one peer. The id is kept as the raw
    /// string; resolution against the peer table happens at routing time.
    Peer(String),
}

/// Parse an owner frame: a JSON object with a string `to` field.
///
/// The frame itself is relayed verbatim, so only the destination is
/// extracted here.
pub fn parse_owner_frame(text: &str) -> Result<Target, EnvelopeError> {
    let value: Value = serde_json::from_str(text).map_err(|_| EnvelopeError::BadPayload)?;
    let to = value
        .get("to")
        .and_then(Value::as_str)
        .ok_or(EnvelopeError::BadPayload)?;
    if to == "*" {
        Ok(Target::Broadcast)
    } else {
        Ok(Target::Peer(to.to_string()))
    }
}

/// Parse a peer frame: any well-formed JSON value. Peers cannot address
/// anyone, so a `to` field is carried along unchanged, not interpreted.
pub fn parse_peer_frame(text: &str) -> Result<Value, EnvelopeError> {
    serde_json::from_str(text).map_err(|_| EnvelopeError::BadPayload)
}

/// Envelope parse errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeError {
    BadPayload,
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadPayload => write!(f, "bad payload"),
        }
    }
}

impl std::error::Error for EnvelopeError {}
