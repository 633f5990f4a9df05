//! Wire protocol for the state-replication service
//!
//! Every frame on the wire is one UTF-8 JSON object tagged by a `type`
//! field. [`ClientMessage`] covers the two inbound shapes (`connect` and
//! `action`); [`ServerMessage`] covers everything the hub sends back:
//! connection outcomes, per-sender dispatch responses, and the fan-out
//! `action` broadcast. `resumeConnection` and `replaceState` are reserved
//! for a future replay protocol and are never emitted today.
//!
//! Action payloads are deliberately unstructured: the hub only requires that
//! `actionData` is a JSON object, and otherwise passes the value through the
//! filter and reducer untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages a client may send to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Handshake on an established socket.
    ///
    /// `last_seen` is a resume hint; the hub currently ignores non-empty
    /// values and always replies with a full state snapshot. `client_id` is
    /// an optional stable identity carried across reconnects. `uuid_params`
    /// lets a reconnecting client present the signed generation-parameter
    /// bundle it was issued earlier; an invalid bundle is silently replaced.
    #[serde(rename = "connect", rename_all = "camelCase")]
    Connect {
        #[serde(default)]
        last_seen: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uuid_params: Option<SignedGenParams>,
    },

    /// An action to apply to the connected context.
    ///
    /// `action_id` is the client-minted UUIDv7 in hyphenated form; the hub
    /// may override it. `action_data` must be a JSON object.
    #[serde(rename = "action", rename_all = "camelCase")]
    Action { action_id: String, action_data: Value },
}

/// Messages the hub sends to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// The requested context key does not exist; the socket is closed after
    /// this frame.
    InvalidStore,

    /// The action filter demanded authentication.
    #[serde(rename_all = "camelCase")]
    NeedAuthentication { action_id: String, message: String },

    /// The action filter rejected the caller's authorization.
    #[serde(rename_all = "camelCase")]
    BadAuthorization { action_id: String, message: String },

    /// Successful handshake: the current state snapshot, the id the client
    /// should use for itself, and the signed generation parameters in force
    /// for this session.
    #[serde(rename_all = "camelCase")]
    Connected {
        initial_state: Value,
        client_id: String,
        uuid_params: SignedGenParams,
    },

    /// Reserved for replay-on-reconnect.
    #[serde(rename_all = "camelCase")]
    ResumeConnection { actions: Vec<ResumedAction> },

    /// Reserved for whole-state resynchronization.
    #[serde(rename_all = "camelCase")]
    ReplaceState { state: Value },

    /// Fan-out of an accepted action to every peer of its sender.
    Action { action: Value, id: String },

    /// The sender's action was accepted under the id it supplied.
    AckAction { id: String },

    /// The sender's action was rewritten by the filter; peers saw `action`
    /// under `to_id`.
    #[serde(rename_all = "camelCase")]
    ReplaceAction {
        from_id: String,
        to_id: String,
        action: Value,
    },

    /// The sender's action was accepted unchanged but under a server-chosen
    /// id.
    #[serde(rename_all = "camelCase")]
    RenameId { from_id: String, to_id: String },

    /// The sender's action was rejected by the filter; state is unchanged.
    #[serde(rename_all = "camelCase")]
    RejectAction { message: String, action_id: String },
}

/// One replayed entry inside a (reserved) `resumeConnection` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumedAction {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces_id: Option<String>,
    pub action: Value,
}

/// Signed UUIDv7 generation-parameter bundle.
///
/// `init_bytes` is the 80-byte seed block (notBefore timestamp in the first
/// six bytes, random material after); `signature` is RSA-SHA256 over the
/// standard base-64 text of `init_bytes` under the server key. Both travel
/// base-64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedGenParams {
    #[serde(rename = "initBytesBase64", with = "base64_bytes")]
    pub init_bytes: Vec<u8>,
    #[serde(rename = "signatureBase64", with = "base64_bytes")]
    pub signature: Vec<u8>,
}

/// Serde adapter for byte fields carried as RFC 4648 §4 base-64 text.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
