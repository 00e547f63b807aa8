//! Structured control payloads
//!
//! One serde record per control kind. The relay stamps `user` onto each
//! before fan-out; binary fields travel as base64 text.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Raw file bytes per `file-chunk` frame
pub const FILE_CHUNK_SIZE: usize = 4096;

/// `chat`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub msg: String,
}

/// `file-notify`: announces a file before its chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileNotify {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub filename: String,
    pub size: u64,
}

/// `file-request`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub filename: String,
}

/// `file-chunk`. `data` is base64 text on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub filename: String,
    pub chunk_id: u64,
    pub data: String,
}

impl FileChunk {
    pub fn new(filename: &str, chunk_id: u64, bytes: &[u8]) -> Self {
        Self {
            user: None,
            filename: filename.to_string(),
            chunk_id,
            data: BASE64.encode(bytes),
        }
    }

    pub fn bytes(&self) -> Result<Vec<u8>> {
        Ok(BASE64.decode(&self.data)?)
    }
}

/// `screen-start` and `screen-stop`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScreenSignal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// `screen-image`. `image` is a base64 JPEG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenImage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub image: String,
}

impl ScreenImage {
    pub fn new(jpeg: &[u8]) -> Self {
        Self {
            user: None,
            image: BASE64.encode(jpeg),
        }
    }

    pub fn bytes(&self) -> Result<Vec<u8>> {
        Ok(BASE64.decode(&self.image)?)
    }
}

/// `user-join` and `user-leave`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub user: String,
}

/// `udp-register`: the peer's ephemeral media port.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UdpRegister {
    pub port: u16,
}

/// Parse a control payload as a JSON object.
pub fn parse_object(payload: &[u8]) -> Result<Map<String, Value>> {
    match serde_json::from_slice(payload)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::InvalidPayload(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

/// Parse a control payload into one of the typed records above.
pub fn parse<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload)
        .map_err(|e| Error::InvalidPayload(format!("{e}")))
}

/// Overwrite the `user` field with the relay-confirmed sender and re-encode.
///
/// Every other field passes through untouched.
pub fn stamp_user(payload: &[u8], identity: &str) -> Result<Vec<u8>> {
    let mut map = parse_object(payload)?;
    map.insert("user".to_string(), Value::String(identity.to_string()));
    Ok(serde_json::to_vec(&map)?)
}
