//! # Stash Codec
//!
//! Opaque freeze/thaw format for a stage's incoming execution point. The
//! bytes are persisted verbatim by the application (typically in the stage's
//! co-transactional store) and handed back to an initiator's `unstash` on an
//! unrelated thread or node.
//!
//! Layout:
//!
//! ```text
//! "MATS"            4 bytes  magic
//! codec tag         4 bytes  serializer id, e.g. "jso1"
//! version           1 byte   currently 1
//! field count       1 byte   currently 5
//! fields            N zero-terminated UTF-8 strings:
//!                   endpoint_id, stage_id, next_stage_id-or-"-",
//!                   serializer meta, system message id
//! envelope          remaining bytes, raw serialized MatsTrace
//! ```

pub const STASH_MAGIC: &[u8; 4] = b"MATS";
pub const STASH_VERSION: u8 = 1;
const STASH_FIELD_COUNT: u8 = 5;

#[derive(Debug, thiserror::Error)]
pub enum StashError {
    #[error("stash bytes too short ({0} bytes); not a stash")]
    Truncated(usize),

    #[error("bad stash magic {0:?}; expected \"MATS\"")]
    BadMagic(Vec<u8>),

    #[error("unsupported stash version {0}; this reader supports {STASH_VERSION}")]
    UnsupportedVersion(u8),

    #[error("stash declares {0} fields; this reader expects {STASH_FIELD_COUNT}")]
    FieldCount(u8),

    #[error("stash field {index} ({name}) is not valid UTF-8")]
    FieldEncoding { index: usize, name: &'static str },

    #[error("stash field {index} ({name}) missing terminator")]
    UnterminatedField { index: usize, name: &'static str },

    #[error(
        "stash was written by serializer {written_by:?} which the installed \
         serializer {installed:?} does not accept"
    )]
    SerializerMismatch {
        written_by: String,
        installed: String,
    },
}

const FIELD_NAMES: [&str; STASH_FIELD_COUNT as usize] = [
    "endpoint_id",
    "stage_id",
    "next_stage_id",
    "serializer_meta",
    "system_message_id",
];

/// A decoded stash: routing metadata plus the raw envelope bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stash {
    /// Serializer id the envelope bytes were written with.
    pub codec: String,
    pub endpoint_id: String,
    pub stage_id: String,
    pub next_stage_id: Option<String>,
    /// Full serializer meta tag for the envelope bytes.
    pub serializer_meta: String,
    /// Broker message id of the stashed delivery, for correlation.
    pub system_message_id: String,
    pub envelope: Vec<u8>,
}

impl Stash {
    /// Encode to the opaque wire form. Deterministic: equal stashes encode to
    /// equal bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.envelope.len());
        out.extend_from_slice(STASH_MAGIC);
        // Codec tags are always exactly four ASCII bytes; pad defensively is
        // not needed because serializer ids are constants.
        out.extend_from_slice(self.codec.as_bytes());
        out.push(STASH_VERSION);
        out.push(STASH_FIELD_COUNT);
        for field in [
            self.endpoint_id.as_str(),
            self.stage_id.as_str(),
            self.next_stage_id.as_deref().unwrap_or("-"),
            self.serializer_meta.as_str(),
            self.system_message_id.as_str(),
        ] {
            out.extend_from_slice(field.as_bytes());
            out.push(0);
        }
        out.extend_from_slice(&self.envelope);
        out
    }

    /// Decode stash bytes, validating magic, version and field count.
    pub fn decode(bytes: &[u8]) -> Result<Self, StashError> {
        if bytes.len() < 10 {
            return Err(StashError::Truncated(bytes.len()));
        }
        if &bytes[0..4] != STASH_MAGIC {
            return Err(StashError::BadMagic(bytes[0..4].to_vec()));
        }
        let codec = std::str::from_utf8(&bytes[4..8])
            .map_err(|_| StashError::FieldEncoding {
                index: 0,
                name: "codec",
            })?
            .to_string();
        let version = bytes[8];
        if version != STASH_VERSION {
            return Err(StashError::UnsupportedVersion(version));
        }
        let field_count = bytes[9];
        if field_count != STASH_FIELD_COUNT {
            return Err(StashError::FieldCount(field_count));
        }

        let mut cursor = 10;
        let mut fields = Vec::with_capacity(FIELD_NAMES.len());
        for (index, name) in FIELD_NAMES.into_iter().enumerate() {
            let rest = &bytes[cursor..];
            let end = rest
                .iter()
                .position(|b| *b == 0)
                .ok_or(StashError::UnterminatedField { index, name })?;
            let field = std::str::from_utf8(&rest[..end])
                .map_err(|_| StashError::FieldEncoding { index, name })?;
            fields.push(field.to_string());
            cursor += end + 1;
        }

        let mut fields = fields.into_iter();
        // Order per FIELD_NAMES.
        let endpoint_id = fields.next().unwrap_or_default();
        let stage_id = fields.next().unwrap_or_default();
        let next_stage_raw = fields.next().unwrap_or_default();
        let serializer_meta = fields.next().unwrap_or_default();
        let system_message_id = fields.next().unwrap_or_default();

        Ok(Self {
            codec,
            endpoint_id,
            stage_id,
            next_stage_id: (next_stage_raw != "-").then_some(next_stage_raw),
            serializer_meta,
            system_message_id,
            envelope: bytes[cursor..].to_vec(),
        })
    }
}
