//! Wire-envelope validation and dispatch.
//!
//! Every frame is a JSON object `{ "type", "version": 1, "timestamp", .. }`
//! of at most 64 KiB. Validation is strict and happens before any field
//! reaches the crypto layer; a frame that fails here is answered with
//! `INVALID_MESSAGE` and the channel continues.
//!
//! Relay boundary policy: a relay queues offline messages per recipient
//! and discards the queue if the recipient reconnects with a different
//! public key. The core never sees that queue.

use crate::crypto::decode_exact;
use crate::error::Error;
use crate::nonce::Nonce;
use crate::ratchet::RatchetMessage;
use crate::types::X25519PublicKey;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub const PROTOCOL_VERSION: u64 = 1;

/// Hard ceiling on a single frame, enforced by relay and client alike.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Relay-side send-rate ceiling, per session.
pub const MAX_MESSAGES_PER_SEC: u32 = 30;

/// Error codes a relay may attach to an `error` frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "NICKNAME_TAKEN")]
    NicknameTaken,
    #[serde(rename = "INVALID_MESSAGE")]
    InvalidMessage,
    #[serde(rename = "PEER_NOT_FOUND")]
    PeerNotFound,
    #[serde(rename = "RATE_LIMITED")]
    RateLimited,
    #[serde(rename = "PAYLOAD_TOO_LARGE")]
    PayloadTooLarge,
}

/// Roster entry carried by `join_ack` and `peer_joined`.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub session_id: String,
    pub nickname: String,
    pub public_key: X25519PublicKey,
}

/// The three decryption paths an `encrypted_message` can dispatch to.
#[derive(Clone)]
pub enum EncryptedPayload {
    Ratchet(RatchetMessage),
    Deniable { ciphertext: Vec<u8>, nonce: Nonce },
    Static { ciphertext: Vec<u8>, nonce: Nonce },
}

/// A validated wire frame.
#[derive(Clone)]
pub enum WireMessage {
    Join {
        nickname: String,
        public_key: X25519PublicKey,
    },
    JoinAck {
        session_id: String,
        peers: Vec<PeerInfo>,
        queued_count: Option<u64>,
        room: Option<String>,
    },
    PeerJoined(PeerInfo),
    PeerLeft {
        session_id: String,
    },
    PeerKeyUpdated {
        session_id: String,
        public_key: X25519PublicKey,
    },
    Encrypted {
        from: String,
        to: String,
        payload: EncryptedPayload,
    },
    KeyUpdate {
        public_key: X25519PublicKey,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Ping,
    Pong,
    ChangeRoom {
        room: String,
    },
    RoomChanged {
        room: String,
    },
    ListRooms,
    RoomList {
        rooms: Vec<String>,
    },
}

/// `[A-Za-z0-9_-]{1,20}`.
pub fn valid_nickname(nickname: &str) -> bool {
    (1..=20).contains(&nickname.len())
        && nickname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn require_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>, Error> {
    value
        .as_object()
        .ok_or_else(|| Error::Wire(format!("{what} must be an object")))
}

fn require_str<'a>(obj: &'a Map<String, Value>, field: &str) -> Result<&'a str, Error> {
    obj.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Wire(format!("missing string field: {field}")))
}

fn require_b64(obj: &Map<String, Value>, field: &str) -> Result<Vec<u8>, Error> {
    STANDARD
        .decode(require_str(obj, field)?)
        .map_err(|_| Error::Wire(format!("field is not valid base64: {field}")))
}

fn require_public_key(obj: &Map<String, Value>, field: &str) -> Result<X25519PublicKey, Error> {
    let bytes = require_b64(obj, field)?;
    Ok(X25519PublicKey::from(decode_exact::<32>(&bytes, field)?))
}

fn require_u32(obj: &Map<String, Value>, field: &str) -> Result<u32, Error> {
    let value = obj
        .get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::Wire(format!("field must be a non-negative integer: {field}")))?;
    u32::try_from(value).map_err(|_| Error::Wire(format!("field out of range: {field}")))
}

/// Validates a raw frame and dispatches it to a typed message.
pub fn validate(raw: &str) -> Result<WireMessage, Error> {
    if raw.len() > MAX_FRAME_BYTES {
        return Err(Error::Wire(format!("frame exceeds {MAX_FRAME_BYTES} bytes")));
    }

    let value: Value = serde_json::from_str(raw).map_err(|_| {
        Error::Wire("frame is not valid JSON".to_string())
    })?;
    validate_value(&value)
}

/// Validates an already-parsed frame.
pub fn validate_value(value: &Value) -> Result<WireMessage, Error> {
    let obj = require_object(value, "frame")?;

    let version = obj
        .get("version")
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::Wire("missing protocol version".to_string()))?;
    if version != PROTOCOL_VERSION {
        return Err(Error::Wire(format!("unsupported protocol version: {version}")));
    }

    let kind = require_str(obj, "type")?;

    let timestamp = obj
        .get("timestamp")
        .and_then(Value::as_f64)
        .ok_or_else(|| Error::Wire("missing timestamp".to_string()))?;
    if !timestamp.is_finite() {
        return Err(Error::Wire("timestamp must be finite".to_string()));
    }

    match kind {
        "join" => {
            let nickname = require_str(obj, "nickname")?;
            if !valid_nickname(nickname) {
                return Err(Error::Wire(format!("invalid nickname: {nickname}")));
            }
            Ok(WireMessage::Join {
                nickname: nickname.to_string(),
                public_key: require_public_key(obj, "publicKey")?,
            })
        }
        "join_ack" => {
            let peers = obj
                .get("peers")
                .and_then(Value::as_array)
                .ok_or_else(|| Error::Wire("missing peers array".to_string()))?
                .iter()
                .map(parse_peer_info)
                .collect::<Result<Vec<_>, _>>()?;

            Ok(WireMessage::JoinAck {
                session_id: require_str(obj, "sessionId")?.to_string(),
                peers,
                queued_count: obj.get("queuedCount").and_then(Value::as_u64),
                room: obj
                    .get("room")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        }
        "peer_joined" => Ok(WireMessage::PeerJoined(parse_peer_info(value)?)),
        "peer_left" => Ok(WireMessage::PeerLeft {
            session_id: require_str(obj, "sessionId")?.to_string(),
        }),
        "peer_key_updated" => Ok(WireMessage::PeerKeyUpdated {
            session_id: require_str(obj, "sessionId")?.to_string(),
            public_key: require_public_key(obj, "publicKey")?,
        }),
        "encrypted_message" => Ok(WireMessage::Encrypted {
            from: require_str(obj, "from")?.to_string(),
            to: require_str(obj, "to")?.to_string(),
            payload: parse_encrypted_payload(obj)?,
        }),
        "key_update" => Ok(WireMessage::KeyUpdate {
            public_key: require_public_key(obj, "publicKey")?,
        }),
        "error" => {
            let code = obj
                .get("code")
                .cloned()
                .ok_or_else(|| Error::Wire("missing error code".to_string()))?;
            let code: ErrorCode = serde_json::from_value(code)
                .map_err(|_| Error::Wire("unknown error code".to_string()))?;
            Ok(WireMessage::Error {
                code,
                message: require_str(obj, "message")?.to_string(),
            })
        }
        "ping" => Ok(WireMessage::Ping),
        "pong" => Ok(WireMessage::Pong),
        "change_room" => Ok(WireMessage::ChangeRoom {
            room: require_str(obj, "room")?.to_string(),
        }),
        "room_changed" => Ok(WireMessage::RoomChanged {
            room: require_str(obj, "room")?.to_string(),
        }),
        "list_rooms" => Ok(WireMessage::ListRooms),
        "room_list" => {
            let rooms = obj
                .get("rooms")
                .and_then(Value::as_array)
                .ok_or_else(|| Error::Wire("missing rooms array".to_string()))?
                .iter()
                .map(|room| {
                    room.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| Error::Wire("room names must be strings".to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(WireMessage::RoomList { rooms })
        }
        other => Err(Error::Wire(format!("unknown frame type: {other}"))),
    }
}

fn parse_peer_info(value: &Value) -> Result<PeerInfo, Error> {
    let obj = require_object(value, "peer entry")?;
    Ok(PeerInfo {
        session_id: require_str(obj, "sessionId")?.to_string(),
        nickname: require_str(obj, "nickname")?.to_string(),
        public_key: require_public_key(obj, "publicKey")?,
    })
}

/// Applies the dispatch rules: ratchet iff an ephemeral key rides along,
/// deniable iff the flag is literally `true`, static otherwise.
fn parse_encrypted_payload(obj: &Map<String, Value>) -> Result<EncryptedPayload, Error> {
    let payload = obj
        .get("payload")
        .ok_or_else(|| Error::Wire("missing payload".to_string()))?;
    let payload = require_object(payload, "payload")?;

    let ciphertext = require_b64(payload, "ciphertext")?;
    let nonce_bytes = require_b64(payload, "nonce")?;
    let nonce = Nonce::from_slice(&nonce_bytes)
        .ok_or_else(|| Error::Wire("nonce must decode to 24 bytes".to_string()))?;

    if payload.contains_key("ephemeralPublicKey") {
        return Ok(EncryptedPayload::Ratchet(RatchetMessage {
            ciphertext,
            nonce,
            ephemeral_public: require_public_key(payload, "ephemeralPublicKey")?,
            counter: require_u32(payload, "counter")?,
            previous_counter: require_u32(payload, "previousCounter")?,
        }));
    }

    if payload.get("deniable") == Some(&Value::Bool(true)) {
        return Ok(EncryptedPayload::Deniable { ciphertext, nonce });
    }

    Ok(EncryptedPayload::Static { ciphertext, nonce })
}

impl WireMessage {
    /// Serializes the frame with the given timestamp.
    pub fn encode(&self, timestamp_ms: u64) -> Value {
        let mut frame = match self {
            Self::Join {
                nickname,
                public_key,
            } => json!({
                "type": "join",
                "nickname": nickname,
                "publicKey": STANDARD.encode(public_key.as_bytes()),
            }),
            Self::JoinAck {
                session_id,
                peers,
                queued_count,
                room,
            } => {
                let mut frame = json!({
                    "type": "join_ack",
                    "sessionId": session_id,
                    "peers": peers.iter().map(encode_peer_info).collect::<Vec<_>>(),
                });
                if let Some(count) = queued_count {
                    frame["queuedCount"] = json!(count);
                }
                if let Some(room) = room {
                    frame["room"] = json!(room);
                }
                frame
            }
            Self::PeerJoined(info) => {
                let mut frame = encode_peer_info(info);
                frame["type"] = json!("peer_joined");
                frame
            }
            Self::PeerLeft { session_id } => json!({
                "type": "peer_left",
                "sessionId": session_id,
            }),
            Self::PeerKeyUpdated {
                session_id,
                public_key,
            } => json!({
                "type": "peer_key_updated",
                "sessionId": session_id,
                "publicKey": STANDARD.encode(public_key.as_bytes()),
            }),
            Self::Encrypted { from, to, payload } => json!({
                "type": "encrypted_message",
                "from": from,
                "to": to,
                "payload": encode_payload(payload),
            }),
            Self::KeyUpdate { public_key } => json!({
                "type": "key_update",
                "publicKey": STANDARD.encode(public_key.as_bytes()),
            }),
            Self::Error { code, message } => json!({
                "type": "error",
                "code": serde_json::to_value(code).expect("error codes serialize"),
                "message": message,
            }),
            Self::Ping => json!({ "type": "ping" }),
            Self::Pong => json!({ "type": "pong" }),
            Self::ChangeRoom { room } => json!({ "type": "change_room", "room": room }),
            Self::RoomChanged { room } => json!({ "type": "room_changed", "room": room }),
            Self::ListRooms => json!({ "type": "list_rooms" }),
            Self::RoomList { rooms } => json!({ "type": "room_list", "rooms": rooms }),
        };

        frame["version"] = json!(PROTOCOL_VERSION);
        frame["timestamp"] = json!(timestamp_ms);
        frame
    }
}

fn encode_peer_info(info: &PeerInfo) -> Value {
    json!({
        "sessionId": info.session_id,
        "nickname": info.nickname,
        "publicKey": STANDARD.encode(info.public_key.as_bytes()),
    })
}

fn encode_payload(payload: &EncryptedPayload) -> Value {
    match payload {
        EncryptedPayload::Ratchet(message) => json!({
            "ciphertext": STANDARD.encode(&message.ciphertext),
            "nonce": STANDARD.encode(message.nonce.as_bytes()),
            "ephemeralPublicKey": STANDARD.encode(message.ephemeral_public.as_bytes()),
            "counter": message.counter,
            "previousCounter": message.previous_counter,
        }),
        EncryptedPayload::Deniable { ciphertext, nonce } => json!({
            "ciphertext": STANDARD.encode(ciphertext),
            "nonce": STANDARD.encode(nonce.as_bytes()),
            "deniable": true,
        }),
        EncryptedPayload::Static { ciphertext, nonce } => json!({
            "ciphertext": STANDARD.encode(ciphertext),
            "nonce": STANDARD.encode(nonce.as_bytes()),
        }),
    }
}
