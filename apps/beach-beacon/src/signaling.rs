use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Identifier of one live connection. Either a random UUID or the id the
/// caller asked for when it opened the socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a new random connection ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Role of a connection in the call-setup exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Unassigned,
    /// Call initiator
    Client,
    /// Call responder
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Unassigned => "unassigned",
            Role::Client => "client",
            Role::Admin => "admin",
        }
    }
}

/// Roles a connection may declare for itself in a `register` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclaredRole {
    Client,
    Admin,
}

impl From<DeclaredRole> for Role {
    fn from(role: DeclaredRole) -> Self {
        match role {
            DeclaredRole::Client => Role::Client,
            DeclaredRole::Admin => Role::Admin,
        }
    }
}

/// Messages sent from a connection to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Declare the sender's role and optionally claim an address that
    /// other connections can reach through `to`.
    Register {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<DeclaredRole>,
        #[serde(
            default,
            rename = "clientId",
            skip_serializing_if = "Option::is_none"
        )]
        client_id: Option<ConnectionId>,
    },
    /// Set or replace the sender's push token
    FcmToken { token: String },
    Offer {
        offer: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<ConnectionId>,
    },
    Answer {
        answer: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<ConnectionId>,
    },
    Ice {
        candidate: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<ConnectionId>,
    },
}

impl ClientMessage {
    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Register { .. } => "register",
            ClientMessage::FcmToken { .. } => "fcm-token",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::Ice { .. } => "ice",
        }
    }
}

/// Messages forwarded by the relay. Payloads are passed through untouched;
/// `from` names the connection that sent them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Offer { offer: Value, from: ConnectionId },
    Answer { answer: Value, from: ConnectionId },
    Ice { candidate: Value, from: ConnectionId },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Offer { .. } => "offer",
            ServerMessage::Answer { .. } => "answer",
            ServerMessage::Ice { .. } => "ice",
        }
    }
}

const KNOWN_TYPES: [&str; 5] = ["register", "fcm-token", "offer", "answer", "ice"];

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message has no string `type` field")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("invalid `{kind}` message: {source}")]
    InvalidFields {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode one inbound frame into a [`ClientMessage`].
pub fn decode(text: &str) -> Result<ClientMessage, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(DecodeError::InvalidJson)?;
    let object = value.as_object().ok_or(DecodeError::NotAnObject)?;
    let kind = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?;

    if !KNOWN_TYPES.contains(&kind) {
        return Err(DecodeError::UnknownType(kind.to_string()));
    }
    let kind = kind.to_string();

    serde_json::from_value(value).map_err(|source| DecodeError::InvalidFields { kind, source })
}
