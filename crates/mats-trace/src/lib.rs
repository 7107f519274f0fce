//! # mats-trace
//!
//! The wire-level heart of Mats: the [`MatsTrace`] envelope with its call
//! algebra, the pluggable serializer capability, and the stash codec for
//! freezing a stage's execution point.
//!
//! Everything here is pure data and codecs - no broker, no threads. The
//! engine crate (`mats-core`) drives these types.

pub mod serializer;
pub mod stash;
pub mod trace;

pub use serializer::{JsonSerializer, SerializeError, SerializedEnvelope, SerializerKind};
pub use stash::{Stash, StashError, STASH_MAGIC, STASH_VERSION};
pub use trace::{
    Call, CallDebugInfo, CallType, Channel, KeepTrace, MatsTrace, MessagingModel, StackState,
    MAX_STACK_HEIGHT, MAX_TOTAL_CALL_NUMBER,
};
