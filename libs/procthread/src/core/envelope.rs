// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Envelope codec.
//!
//! An envelope is one self-describing JSON record:
//!
//! ```text
//! {"type":"message","data_type":"int","data":42,"from_pid":812,"parent_pid":790,"compressed":false}
//! ```
//!
//! `global_set` envelopes add a `data_name`. When the JSON form of `data`
//! reaches the compression threshold it is replaced by
//! `base64(zlib(json))` and `compressed` is set; the receiver reverses both
//! steps before interpreting `data` according to `data_type`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use super::error::CodecError;
use super::process::ThreadId;
use super::value::Value;

/// Substituted for values that cannot be represented on the wire.
pub const ENCODING_FAILED_SENTINEL: &str = "<ERROR: Encoding Failed>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// A freshly forked child announcing it is running.
    Liveness,
    /// Tree-wide global variable update.
    GlobalSet,
    /// A child's return value, sent just before it exits.
    Return,
    /// Application message.
    Message,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub value: Value,
    /// Variable name, only for [`EnvelopeKind::GlobalSet`].
    pub global_name: Option<String>,
    pub sender: ThreadId,
    /// `None` when the sender is the main process.
    pub sender_parent: Option<ThreadId>,
}

impl Envelope {
    pub fn new(
        kind: EnvelopeKind,
        value: Value,
        sender: ThreadId,
        sender_parent: Option<ThreadId>,
    ) -> Self {
        Self {
            kind,
            value,
            global_name: None,
            sender,
            sender_parent,
        }
    }

    pub fn global(
        name: impl Into<String>,
        value: Value,
        sender: ThreadId,
        sender_parent: Option<ThreadId>,
    ) -> Self {
        Self {
            global_name: Some(name.into()),
            ..Self::new(EnvelopeKind::GlobalSet, value, sender, sender_parent)
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: EnvelopeKind,
    data_type: String,
    data: serde_json::Value,
    from_pid: i32,
    parent_pid: i32,
    compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data_name: Option<String>,
}

/// Serialize an envelope. Values at or above `compression_threshold` bytes
/// of JSON are compressed.
pub fn encode(envelope: &Envelope, compression_threshold: usize) -> Result<Vec<u8>, CodecError> {
    let (data_type, data) = match envelope.value.to_json() {
        Some(json) => (envelope.value.type_tag(), json),
        None => {
            tracing::warn!(
                "Envelope value from {} is not representable, sending sentinel",
                envelope.sender
            );
            (
                "string",
                serde_json::Value::String(ENCODING_FAILED_SENTINEL.to_string()),
            )
        }
    };

    let mut compressed = false;
    let data_text = serde_json::to_string(&data)?;
    let data = if data_text.len() >= compression_threshold {
        compressed = true;
        let packed = compress(data_text.as_bytes()).map_err(CodecError::Zlib)?;
        tracing::debug!(
            "Compressed {} byte payload to {} bytes",
            data_text.len(),
            packed.len()
        );
        serde_json::Value::String(packed)
    } else {
        data
    };

    let wire = WireEnvelope {
        kind: envelope.kind,
        data_type: data_type.to_string(),
        data,
        from_pid: envelope.sender.get(),
        parent_pid: envelope.sender_parent.map_or(0, ThreadId::get),
        compressed,
        data_name: envelope.global_name.clone(),
    };
    Ok(serde_json::to_vec(&wire)?)
}

/// Parse and validate a received frame.
pub fn decode(frame: &[u8]) -> Result<Envelope, CodecError> {
    let wire: WireEnvelope = serde_json::from_slice(frame)?;

    let data = if wire.compressed {
        match wire.data {
            serde_json::Value::String(packed) => {
                let text = decompress(&packed)?;
                serde_json::from_str(&text)?
            }
            _ => return Err(CodecError::CompressedPayloadNotText),
        }
    } else {
        wire.data
    };

    let value = Value::from_tagged_json(&wire.data_type, data)?;
    let sender = ThreadId::new(wire.from_pid).ok_or(CodecError::InvalidSender(wire.from_pid))?;

    if wire.kind == EnvelopeKind::GlobalSet && wire.data_name.is_none() {
        return Err(CodecError::MissingGlobalName);
    }

    Ok(Envelope {
        kind: wire.kind,
        value,
        global_name: wire.data_name,
        sender,
        sender_parent: ThreadId::new(wire.parent_pid),
    })
}

fn compress(bytes: &[u8]) -> std::io::Result<String> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(BASE64.encode(encoder.finish()?))
}

fn decompress(packed: &str) -> Result<String, CodecError> {
    let bytes = BASE64.decode(packed)?;
    let mut text = String::new();
    ZlibDecoder::new(bytes.as_slice())
        .read_to_string(&mut text)
        .map_err(CodecError::Zlib)?;
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn pid(n: i32) -> ThreadId {
        ThreadId::new(n).unwrap()
    }

    #[test]
    fn test_wire_layout() {
        let env = Envelope::new(EnvelopeKind::Message, Value::Int(42), pid(812), Some(pid(790)));
        let bytes = encode(&env, 1_024_000).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["data_type"], "int");
        assert_eq!(json["data"], 42);
        assert_eq!(json["from_pid"], 812);
        assert_eq!(json["parent_pid"], 790);
        assert_eq!(json["compressed"], false);
        assert!(json.get("data_name").is_none());
    }

    #[test]
    fn test_main_process_sends_zero_parent() {
        let env = Envelope::new(EnvelopeKind::Return, Value::Bool(true), pid(5), None);
        let bytes = encode(&env, usize::MAX).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["parent_pid"], 0);
        assert_eq!(decode(&bytes).unwrap().sender_parent, None);
    }

    #[test]
    fn test_global_set_carries_name() {
        let env = Envelope::global("state", Value::from("ready"), pid(10), Some(pid(9)));
        let decoded = decode(&encode(&env, usize::MAX).unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_global_set_without_name_is_rejected() {
        let raw = br#"{"type":"global_set","data_type":"int","data":1,"from_pid":3,"parent_pid":0,"compressed":false}"#;
        assert!(matches!(decode(raw), Err(CodecError::MissingGlobalName)));
    }

    #[test]
    fn test_oversized_value_is_compressed_and_restored() {
        let mut map = BTreeMap::new();
        map.insert("blob".to_string(), Value::from("z".repeat(4096)));
        map.insert("n".to_string(), Value::Int(7));
        let env = Envelope::new(EnvelopeKind::Message, Value::Object(map), pid(2), Some(pid(1)));

        let bytes = encode(&env, 1024).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["compressed"], true);
        assert!(json["data"].is_string());
        assert!(bytes.len() < 4096);

        assert_eq!(decode(&bytes).unwrap(), env);
    }

    #[test]
    fn test_unrepresentable_value_becomes_sentinel() {
        let env = Envelope::new(EnvelopeKind::Message, Value::Float(f64::NAN), pid(2), None);
        let decoded = decode(&encode(&env, usize::MAX).unwrap()).unwrap();
        assert_eq!(decoded.value, Value::from(ENCODING_FAILED_SENTINEL));
    }

    #[test]
    fn test_malformed_frames_fail() {
        assert!(decode(b"not json").is_err());
        assert!(decode(b"{\"type\":\"message\"}").is_err());
        let bad_pid = br#"{"type":"message","data_type":"null","data":null,"from_pid":0,"parent_pid":0,"compressed":false}"#;
        assert!(matches!(decode(bad_pid), Err(CodecError::InvalidSender(0))));
        let bad_packed = br#"{"type":"message","data_type":"int","data":5,"from_pid":4,"parent_pid":0,"compressed":true}"#;
        assert!(matches!(
            decode(bad_packed),
            Err(CodecError::CompressedPayloadNotText)
        ));
    }
}
