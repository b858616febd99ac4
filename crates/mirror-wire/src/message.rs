//! Wire envelope types.
//!
//! Every message exchanged between peers is a JSON object
//! `{"type": <kind>, "payload": {...}}`. On TCP each message is prefixed with
//! a 4-byte big-endian length header.

use mirror_types::object::ObjectKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Envelope {
    /// Run a method on the receiver's canonical instance.
    #[serde(rename = "execute")]
    Execute(ExecuteRequest),
    /// Result of an earlier execute that carried a call id.
    #[serde(rename = "reply")]
    Reply(ReplyPayload),
    /// An event emitted by an object on the sender.
    #[serde(rename = "event")]
    Event(EventPayload),
    /// The sender released its checkout of an object hosted here.
    #[serde(rename = "free")]
    Free(FreeNotice),
    /// Credential submission.
    #[serde(rename = "auth")]
    Auth(AuthSubmit),
    /// The credential was accepted.
    #[serde(rename = "auth_success")]
    AuthSuccess,
    /// The credential was rejected.
    #[serde(rename = "auth_failed")]
    AuthFailed,
    /// The server expects a credential before anything else.
    #[serde(rename = "need_auth")]
    NeedAuth,
}

impl Envelope {
    /// Short name of the envelope kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Execute(_) => "execute",
            Envelope::Reply(_) => "reply",
            Envelope::Event(_) => "event",
            Envelope::Free(_) => "free",
            Envelope::Auth(_) => "auth",
            Envelope::AuthSuccess => "auth_success",
            Envelope::AuthFailed => "auth_failed",
            Envelope::NeedAuth => "need_auth",
        }
    }
}

/// Payload of an `execute` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Object type tag.
    #[serde(rename = "type")]
    pub object_type: String,
    /// Object id.
    pub id: String,
    /// Method name.
    pub method: String,
    /// Positional arguments.
    #[serde(default)]
    pub parameters: Vec<Value>,
    /// Present when the sender waits for a reply.
    #[serde(rename = "callId", default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<u64>,
}

impl ExecuteRequest {
    /// The key of the target object.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.object_type, &self.id)
    }
}

/// Payload of a `reply` message: `{callId, result}` or `{callId, error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    /// The call being answered.
    #[serde(rename = "callId")]
    pub call_id: u64,
    /// Method result (null on error).
    #[serde(default)]
    pub result: Value,
    /// Error message when the remote execution failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReplyPayload {
    /// A successful reply.
    pub fn ok(call_id: u64, result: Value) -> Self {
        Self {
            call_id,
            result,
            error: None,
        }
    }

    /// A failed reply.
    pub fn err(call_id: u64, error: impl Into<String>) -> Self {
        Self {
            call_id,
            result: Value::Null,
            error: Some(error.into()),
        }
    }

    /// Split into the result the caller sees.
    pub fn into_result(self) -> Result<Value, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result),
        }
    }
}

/// Payload of an `event` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    /// Object type tag.
    #[serde(rename = "type")]
    pub object_type: String,
    /// Object id.
    pub id: String,
    /// Event name.
    pub event: String,
    /// Event arguments.
    #[serde(default)]
    pub args: Vec<Value>,
}

impl EventPayload {
    /// The key of the emitting object.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.object_type, &self.id)
    }
}

/// Payload of a `free` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreeNotice {
    /// Object type tag.
    #[serde(rename = "type")]
    pub object_type: String,
    /// Object id.
    pub id: String,
}

impl FreeNotice {
    /// Notice for `key`.
    pub fn for_key(key: &ObjectKey) -> Self {
        Self {
            object_type: key.object_type.clone(),
            id: key.id.clone(),
        }
    }

    /// The key being released.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.object_type, &self.id)
    }
}

/// Payload of an `auth` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSubmit {
    /// The candidate credential.
    #[serde(alias = "password")]
    pub credential: String,
    /// Stable id of the submitting node. The accepting side adopts it as
    /// the session's peer id.
    #[serde(rename = "nodeId", default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

/// Maximum single message size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Encode an envelope to its JSON body.
pub fn encode_body(msg: &Envelope) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(msg)
}

/// Encode an envelope to bytes (4-byte big-endian length + JSON).
pub fn encode_message(msg: &Envelope) -> Result<Vec<u8>, serde_json::Error> {
    let json = encode_body(msg)?;
    Ok(frame(&json))
}

/// Prefix a body with its 4-byte big-endian length.
pub fn frame(body: &[u8]) -> Vec<u8> {
    let len = body.len() as u32;
    let mut bytes = Vec::with_capacity(4 + body.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(body);
    bytes
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into an Envelope.
pub fn decode_message(body: &[u8]) -> Result<Envelope, serde_json::Error> {
    serde_json::from_slice(body)
}
