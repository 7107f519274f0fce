//! # Serializer Capability
//!
//! Bytes <-> [`MatsTrace`] and payload <-> string codec. Pluggable via
//! [`SerializerKind`] enum dispatch - no trait objects on the hot path.
//!
//! The envelope serializer gzips large envelopes and stamps a versioned meta
//! tag on every serialization so a reader can reject or migrate foreign
//! formats. Raw/compressed sizes and timing are surfaced for interceptors.

use std::io::{Read, Write};
use std::time::Instant;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::trace::MatsTrace;

/// Envelopes below this size go on the wire uncompressed.
const COMPRESS_THRESHOLD_BYTES: usize = 1024;

/// Meta-tag compression markers.
const SCHEME_GZIP: &str = "gzip";
const SCHEME_PLAIN: &str = "plain";

#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("failed to serialize envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("failed to deserialize envelope: {0}")]
    EnvelopeDecode(#[source] serde_json::Error),

    #[error("failed to serialize payload of type {type_name}: {source}")]
    Payload {
        type_name: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to deserialize payload into {type_name}: {source}")]
    PayloadDecode {
        type_name: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("unrecognized serializer meta {meta:?}; this reader accepts {accepts:?}")]
    MetaMismatch { meta: String, accepts: String },

    #[error("envelope compression failed: {0}")]
    Compression(#[source] std::io::Error),
}

/// A serialized envelope plus the measurements interceptors record.
#[derive(Debug, Clone)]
pub struct SerializedEnvelope {
    pub bytes: Vec<u8>,
    /// Versioned meta tag, e.g. `json1;gzip;raw=5120;comp=1033`.
    pub meta: String,
    pub raw_size: usize,
    pub compressed_size: usize,
    pub serialization_micros: u64,
}

/// JSON envelope/payload codec, gzip above [`COMPRESS_THRESHOLD_BYTES`].
///
/// Serialization is deterministic: the envelope's maps are ordered
/// (`BTreeMap`) and serde_json emits fields in declaration order, so
/// identical envelopes serialize identically.
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    /// Identifier stamped into meta tags and stash headers. Exactly four
    /// ASCII characters: "json" + format version.
    pub const ID: &'static str = "jso1";

    fn serialize_envelope(&self, trace: &MatsTrace) -> Result<SerializedEnvelope, SerializeError> {
        let started = Instant::now();
        let raw = serde_json::to_vec(trace).map_err(SerializeError::Envelope)?;
        let raw_size = raw.len();

        let (bytes, scheme) = if raw_size >= COMPRESS_THRESHOLD_BYTES {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&raw).map_err(SerializeError::Compression)?;
            (
                encoder.finish().map_err(SerializeError::Compression)?,
                SCHEME_GZIP,
            )
        } else {
            (raw, SCHEME_PLAIN)
        };

        let compressed_size = bytes.len();
        Ok(SerializedEnvelope {
            meta: format!(
                "{};{};raw={};comp={}",
                Self::ID,
                scheme,
                raw_size,
                compressed_size
            ),
            bytes,
            raw_size,
            compressed_size,
            serialization_micros: started.elapsed().as_micros() as u64,
        })
    }

    fn deserialize_envelope(&self, bytes: &[u8], meta: &str) -> Result<MatsTrace, SerializeError> {
        let mut parts = meta.split(';');
        let id = parts.next().unwrap_or_default();
        if id != Self::ID {
            return Err(SerializeError::MetaMismatch {
                meta: meta.to_string(),
                accepts: Self::ID.to_string(),
            });
        }
        let scheme = parts.next().unwrap_or(SCHEME_PLAIN);

        let raw = if scheme == SCHEME_GZIP {
            let mut decoder = GzDecoder::new(bytes);
            let mut raw = Vec::new();
            decoder
                .read_to_end(&mut raw)
                .map_err(SerializeError::Compression)?;
            raw
        } else {
            bytes.to_vec()
        };

        serde_json::from_slice(&raw).map_err(SerializeError::EnvelopeDecode)
    }
}

/// Enum dispatch over the installed serializer. Mirrors the provider pattern
/// used for the broker: concrete types, no vtables.
#[derive(Debug, Clone)]
pub enum SerializerKind {
    Json(JsonSerializer),
}

impl Default for SerializerKind {
    fn default() -> Self {
        Self::Json(JsonSerializer)
    }
}

impl SerializerKind {
    /// Four-character codec tag, recorded in stash headers.
    pub fn id(&self) -> &'static str {
        match self {
            Self::Json(_) => JsonSerializer::ID,
        }
    }

    /// Whether this serializer can read an envelope with the given meta tag.
    pub fn accepts_meta(&self, meta: &str) -> bool {
        match self {
            Self::Json(_) => meta.split(';').next() == Some(JsonSerializer::ID),
        }
    }

    pub fn serialize_envelope(
        &self,
        trace: &MatsTrace,
    ) -> Result<SerializedEnvelope, SerializeError> {
        match self {
            Self::Json(s) => s.serialize_envelope(trace),
        }
    }

    pub fn deserialize_envelope(
        &self,
        bytes: &[u8],
        meta: &str,
    ) -> Result<MatsTrace, SerializeError> {
        match self {
            Self::Json(s) => s.deserialize_envelope(bytes, meta),
        }
    }

    /// Serialize a user payload or state object into the envelope's string
    /// representation.
    pub fn serialize_payload<T: Serialize>(&self, value: &T) -> Result<String, SerializeError> {
        match self {
            Self::Json(_) => {
                serde_json::to_string(value).map_err(|source| SerializeError::Payload {
                    type_name: std::any::type_name::<T>(),
                    source,
                })
            }
        }
    }

    /// Decode a payload/state string produced by [`Self::serialize_payload`].
    pub fn deserialize_payload<T: DeserializeOwned>(
        &self,
        serialized: &str,
    ) -> Result<T, SerializeError> {
        match self {
            Self::Json(_) => {
                serde_json::from_str(serialized).map_err(|source| SerializeError::PayloadDecode {
                    type_name: std::any::type_name::<T>(),
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::Channel;

    fn sample_trace() -> MatsTrace {
        let mut t = MatsTrace::new("flow-x", "trace-x", "App", "1.0", "init.id");
        t.set_trace_property("k", "\"v\"");
        t.add_request_call(
            "init.id",
            Channel::queue("Service"),
            Channel::queue("Terminator"),
            Some("{\"number\":42}".into()),
            Some("null".into()),
            None,
            None,
        );
        t
    }

    #[test]
    fn envelope_round_trips_exactly() {
        let serializer = SerializerKind::default();
        let trace = sample_trace();

        let env = serializer.serialize_envelope(&trace).unwrap();
        let back = serializer.deserialize_envelope(&env.bytes, &env.meta).unwrap();

        assert_eq!(back, trace);
    }

    #[test]
    fn small_envelope_stays_plain() {
        let serializer = SerializerKind::default();
        let env = serializer.serialize_envelope(&sample_trace()).unwrap();

        assert!(env.meta.contains(";plain;"));
        assert_eq!(env.raw_size, env.compressed_size);
    }

    #[test]
    fn large_envelope_is_gzipped() {
        let serializer = SerializerKind::default();
        let mut trace = sample_trace();
        let big = format!("\"{}\"", "x".repeat(4096));
        trace.set_trace_property("bulk", big);

        let env = serializer.serialize_envelope(&trace).unwrap();
        assert!(env.meta.contains(";gzip;"));
        assert!(env.compressed_size < env.raw_size);

        let back = serializer.deserialize_envelope(&env.bytes, &env.meta).unwrap();
        assert_eq!(back, trace);
    }

    #[test]
    fn meta_reports_sizes() {
        let serializer = SerializerKind::default();
        let env = serializer.serialize_envelope(&sample_trace()).unwrap();
        assert!(env.meta.contains(&format!("raw={}", env.raw_size)));
        assert!(env.meta.contains(&format!("comp={}", env.compressed_size)));
    }

    #[test]
    fn foreign_meta_is_rejected() {
        let serializer = SerializerKind::default();
        let env = serializer.serialize_envelope(&sample_trace()).unwrap();

        let err = serializer
            .deserialize_envelope(&env.bytes, "xml9;plain;raw=1;comp=1")
            .unwrap_err();
        assert!(matches!(err, SerializeError::MetaMismatch { .. }));
        assert!(!serializer.accepts_meta("xml9;plain"));
        assert!(serializer.accepts_meta(&env.meta));
    }

    #[test]
    fn payload_codec_round_trips() {
        let serializer = SerializerKind::default();

        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Dto {
            number: i64,
            string: String,
        }

        let dto = Dto {
            number: 42,
            string: "A".into(),
        };
        let s = serializer.serialize_payload(&dto).unwrap();
        let back: Dto = serializer.deserialize_payload(&s).unwrap();
        assert_eq!(back, dto);
    }

    #[test]
    fn payload_decode_error_names_target_type() {
        let serializer = SerializerKind::default();
        let err = serializer.deserialize_payload::<u32>("\"nope\"").unwrap_err();
        assert!(err.to_string().contains("u32"));
    }
}
