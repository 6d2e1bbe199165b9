//! Body packing: serializer, compressor, and content encoder
//!
//! A task body goes through three stages on its way to the wire:
//! serialize (JSON or YAML), optionally compress, then encode. Uncompressed
//! bodies travel as plain UTF-8; compressed bodies are base64-encoded.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};

use crate::{Result, TaskError};

/// Body serializer choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Serializer {
    #[default]
    Json,
    Yaml,
}

impl Serializer {
    /// MIME content type advertised in the task message.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Yaml => "application/x-yaml",
        }
    }

    fn serialize(&self, value: &serde_json::Value) -> Result<String> {
        match self {
            Self::Json => serde_json::to_string(value)
                .map_err(|e| TaskError::Serialization(format!("Failed to serialize body: {}", e))),
            Self::Yaml => serde_yaml::to_string(value)
                .map_err(|e| TaskError::Serialization(format!("Failed to serialize body: {}", e))),
        }
    }

    fn deserialize(&self, text: &str) -> Result<serde_json::Value> {
        match self {
            Self::Json => serde_json::from_str(text).map_err(|e| {
                TaskError::Deserialization(format!("Failed to deserialize body: {}", e))
            }),
            Self::Yaml => serde_yaml::from_str(text).map_err(|e| {
                TaskError::Deserialization(format!("Failed to deserialize body: {}", e))
            }),
        }
    }
}

/// Body compression choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Identity,
    Zlib,
    /// Labelled gzip on the wire but actually compressed with zlib; the
    /// reference Celery worker expects exactly this combination.
    Gzip,
}

impl Compression {
    /// MIME token placed in the `compression` header, absent for identity.
    pub fn mime(&self) -> Option<&'static str> {
        match self {
            Self::Identity => None,
            Self::Zlib | Self::Gzip => Some("application/x-gzip"),
        }
    }
}

/// Serializer + compressor + encoder bundle producing the task body.
#[derive(Debug, Clone, Copy, Default)]
pub struct Packer {
    pub serializer: Serializer,
    pub compression: Compression,
}

impl Packer {
    pub fn new(serializer: Serializer, compression: Compression) -> Self {
        Self {
            serializer,
            compression,
        }
    }

    /// Content type of the serialized payload.
    pub fn content_type(&self) -> &'static str {
        self.serializer.content_type()
    }

    /// MIME token for the `compression` header, if any.
    pub fn mime(&self) -> Option<&'static str> {
        self.compression.mime()
    }

    /// Body encoding advertised in the message properties.
    pub fn body_encoding(&self) -> &'static str {
        match self.compression {
            Compression::Identity => "utf-8",
            _ => "base64",
        }
    }

    /// Serialize, compress, and encode a value into a wire-ready body string.
    pub fn pack(&self, value: &serde_json::Value) -> Result<String> {
        let text = self.serializer.serialize(value)?;
        match self.compression {
            Compression::Identity => Ok(text),
            Compression::Zlib | Compression::Gzip => {
                let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(text.as_bytes()).map_err(|e| {
                    TaskError::Serialization(format!("Failed to compress body: {}", e))
                })?;
                let compressed = encoder.finish().map_err(|e| {
                    TaskError::Serialization(format!("Failed to compress body: {}", e))
                })?;
                Ok(BASE64.encode(compressed))
            }
        }
    }

    /// Reverse of [`Packer::pack`].
    pub fn unpack(&self, body: &str) -> Result<serde_json::Value> {
        let text = match self.compression {
            Compression::Identity => body.to_string(),
            Compression::Zlib | Compression::Gzip => {
                let compressed = BASE64.decode(body).map_err(|e| {
                    TaskError::Deserialization(format!("Failed to decode body: {}", e))
                })?;
                let mut decoder = ZlibDecoder::new(compressed.as_slice());
                let mut text = String::new();
                decoder.read_to_string(&mut text).map_err(|e| {
                    TaskError::Deserialization(format!("Failed to decompress body: {}", e))
                })?;
                text
            }
        };
        self.serializer.deserialize(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> serde_json::Value {
        serde_json::json!([
            [10, 15],
            {"retries": 0},
            {"callbacks": null, "chain": null, "chord": null, "errbacks": null}
        ])
    }

    #[test]
    fn test_json_identity_roundtrip() {
        let packer = Packer::new(Serializer::Json, Compression::Identity);
        let body = packer.pack(&payload()).unwrap();
        // Identity bodies are the serialized text itself.
        assert!(body.starts_with('['));
        assert_eq!(packer.unpack(&body).unwrap(), payload());
        assert_eq!(packer.body_encoding(), "utf-8");
        assert_eq!(packer.content_type(), "application/json");
        assert!(packer.mime().is_none());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let packer = Packer::new(Serializer::Yaml, Compression::Identity);
        let body = packer.pack(&payload()).unwrap();
        assert_eq!(packer.unpack(&body).unwrap(), payload());
        assert_eq!(packer.content_type(), "application/x-yaml");
    }

    #[test]
    fn test_zlib_roundtrip() {
        let packer = Packer::new(Serializer::Json, Compression::Zlib);
        let body = packer.pack(&payload()).unwrap();
        assert_ne!(body, serde_json::to_string(&payload()).unwrap());
        assert_eq!(packer.unpack(&body).unwrap(), payload());
        assert_eq!(packer.body_encoding(), "base64");
        assert_eq!(packer.mime(), Some("application/x-gzip"));
    }

    #[test]
    fn test_gzip_is_zlib_under_the_hood() {
        let zlib = Packer::new(Serializer::Json, Compression::Zlib);
        let gzip = Packer::new(Serializer::Json, Compression::Gzip);
        // Same bytes, same label; a zlib unpacker reads a "gzip" body.
        assert_eq!(
            gzip.pack(&payload()).unwrap(),
            zlib.pack(&payload()).unwrap()
        );
        assert_eq!(gzip.mime(), Some("application/x-gzip"));
        let body = gzip.pack(&payload()).unwrap();
        assert_eq!(zlib.unpack(&body).unwrap(), payload());
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        let packer = Packer::new(Serializer::Json, Compression::Zlib);
        assert!(packer.unpack("not base64 at all!").is_err());
        let identity = Packer::new(Serializer::Json, Compression::Identity);
        assert!(identity.unpack("{invalid").is_err());
    }
}
