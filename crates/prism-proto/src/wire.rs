// SPDX-License-Identifier: Apache-2.0
//! Deterministic framing and CBOR helpers for the worker protocol.
//!
//! Packet layout:
//!
//! ``MAGIC(4) || VERSION(2) || FLAGS(2) || LENGTH(4) || PAYLOAD || CHECKSUM(32)``
//!
//! * PAYLOAD is a CBOR [`OpEnvelope`] with a closed op-name set
//! * CHECKSUM = blake3-256 over HEADER (first 12 bytes) || PAYLOAD
//!
//! All multi-byte header fields are big-endian.

use blake3::Hasher;
use ciborium::value::Value;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    CreatePluginPayload, Message, RemovePluginPayload, RendererStatePayload, SetAttrPayload,
};

/// Protocol magic constant "PRZ!".
pub const MAGIC: [u8; 4] = [0x50, 0x52, 0x5a, 0x21];
/// Wire protocol version (big-endian u16).
pub const VERSION: u16 = 0x0001;
/// Reserved flags (zero for v1).
pub const FLAGS: u16 = 0x0000;
/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 12;
/// blake3-256 checksum length in bytes.
pub const CHECKSUM_LEN: usize = 32;

/// Errors produced by packet encode/decode.
///
/// Every decode error is a hard protocol error for the session that
/// observed it; packets are never retried or resynchronized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Fewer bytes available than a complete packet requires.
    #[error("incomplete packet: need {need} bytes, have {have}")]
    Incomplete {
        /// Bytes a complete packet would occupy.
        need: usize,
        /// Bytes actually available.
        have: usize,
    },
    /// Leading magic bytes did not match [`MAGIC`].
    #[error("bad packet magic")]
    BadMagic,
    /// Header declared a wire version this build does not speak.
    #[error("unsupported wire version {0:#06x}")]
    UnsupportedVersion(u16),
    /// blake3 checksum over header+payload did not verify.
    #[error("packet checksum mismatch")]
    ChecksumMismatch,
    /// CBOR serialization failed.
    #[error("cbor encode: {0}")]
    Encode(String),
    /// CBOR payload was malformed for the declared op.
    #[error("cbor decode: {0}")]
    Decode(String),
    /// Envelope carried an op name outside the closed set.
    #[error("unknown op {0:?}")]
    UnknownOp(String),
}

/// Envelope carried as the CBOR payload of every packet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpEnvelope<P> {
    /// Operation name (see [`Message::op_name`]).
    pub op: String,
    /// Logical timestamp (monotonic per sender).
    pub ts: u64,
    /// Operation-specific body.
    pub payload: P,
}

/// A full packet (header + payload + checksum).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Raw header (12 bytes).
    pub header: [u8; HEADER_LEN],
    /// CBOR payload bytes.
    pub payload: Vec<u8>,
    /// blake3 checksum over header||payload.
    pub checksum: [u8; CHECKSUM_LEN],
}

impl Packet {
    /// Build a packet from CBOR payload bytes.
    pub fn from_payload(payload: Vec<u8>) -> Self {
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&MAGIC);
        header[4..6].copy_from_slice(&VERSION.to_be_bytes());
        header[6..8].copy_from_slice(&FLAGS.to_be_bytes());
        header[8..12].copy_from_slice(&(payload.len() as u32).to_be_bytes());

        let mut hasher = Hasher::new();
        hasher.update(&header);
        hasher.update(&payload);
        let checksum = *hasher.finalize().as_bytes();

        Packet {
            header,
            payload,
            checksum,
        }
    }

    /// Serialize this packet into one contiguous byte vector.
    pub fn into_bytes(self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(HEADER_LEN + self.payload.len() + CHECKSUM_LEN);
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.checksum);
        out
    }

    /// Validate framing and checksum, returning the payload slice and the
    /// total bytes consumed.
    pub fn check(bytes: &[u8]) -> Result<(&[u8], usize), WireError> {
        if bytes.len() < HEADER_LEN + CHECKSUM_LEN {
            return Err(WireError::Incomplete {
                need: HEADER_LEN + CHECKSUM_LEN,
                have: bytes.len(),
            });
        }
        if bytes[0..4] != MAGIC {
            return Err(WireError::BadMagic);
        }
        let version = u16::from_be_bytes([bytes[4], bytes[5]]);
        if version != VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        let len = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let total = HEADER_LEN + len + CHECKSUM_LEN;
        if bytes.len() < total {
            return Err(WireError::Incomplete {
                need: total,
                have: bytes.len(),
            });
        }
        let header = &bytes[0..HEADER_LEN];
        let payload = &bytes[HEADER_LEN..HEADER_LEN + len];
        let checksum = &bytes[HEADER_LEN + len..total];

        let mut hasher = Hasher::new();
        hasher.update(header);
        hasher.update(payload);
        if hasher.finalize().as_bytes() != checksum {
            return Err(WireError::ChecksumMismatch);
        }
        Ok((payload, total))
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, WireError> {
    Value::serialized(value).map_err(|e| WireError::Encode(e.to_string()))
}

fn from_value<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T, WireError> {
    value
        .deserialized()
        .map_err(|e| WireError::Decode(e.to_string()))
}

/// Encode a [`Message`] into a framed packet with the given logical
/// timestamp.
pub fn encode_message(msg: &Message, ts: u64) -> Result<Vec<u8>, WireError> {
    let payload = match msg {
        Message::CreatePlugin { plugin, type_id } => to_value(&CreatePluginPayload {
            plugin: plugin.clone(),
            type_id: type_id.clone(),
        })?,
        Message::SetAttr {
            plugin,
            attr,
            value,
        } => to_value(&SetAttrPayload {
            plugin: plugin.clone(),
            attr: attr.clone(),
            value: value.clone(),
        })?,
        Message::RemovePlugin { plugin } => to_value(&RemovePluginPayload {
            plugin: plugin.clone(),
        })?,
        Message::Renderer(cmd) => to_value(cmd)?,
        Message::Images(set) => to_value(set)?,
        Message::LogText(text) => to_value(text)?,
        Message::RendererState { status, frame } => to_value(&RendererStatePayload {
            status: *status,
            frame: *frame,
        })?,
    };

    let env = OpEnvelope {
        op: msg.op_name().to_string(),
        ts,
        payload,
    };
    let mut bytes = Vec::new();
    ciborium::into_writer(&env, &mut bytes).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(Packet::from_payload(bytes).into_bytes())
}

/// Decode bytes into `(Message, ts, bytes_consumed)`.
pub fn decode_message(bytes: &[u8]) -> Result<(Message, u64, usize), WireError> {
    let (payload, used) = Packet::check(bytes)?;
    let env: OpEnvelope<Value> =
        ciborium::from_reader(payload).map_err(|e| WireError::Decode(e.to_string()))?;
    let ts = env.ts;
    let msg = match env.op.as_str() {
        "create_plugin" => {
            let p: CreatePluginPayload = from_value(env.payload)?;
            Message::CreatePlugin {
                plugin: p.plugin,
                type_id: p.type_id,
            }
        }
        "set_attr" => {
            let p: SetAttrPayload = from_value(env.payload)?;
            Message::SetAttr {
                plugin: p.plugin,
                attr: p.attr,
                value: p.value,
            }
        }
        "remove_plugin" => {
            let p: RemovePluginPayload = from_value(env.payload)?;
            Message::RemovePlugin { plugin: p.plugin }
        }
        "renderer" => Message::Renderer(from_value(env.payload)?),
        "images" => Message::Images(from_value(env.payload)?),
        "log" => Message::LogText(from_value(env.payload)?),
        "renderer_state" => {
            let p: RendererStatePayload = from_value(env.payload)?;
            Message::RendererState {
                status: p.status,
                frame: p.frame,
            }
        }
        other => return Err(WireError::UnknownOp(other.to_string())),
    };
    Ok((msg, ts, used))
}

// --- Unit tests -----------------------------------------------------------
