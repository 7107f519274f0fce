//! # Outgoing Message Buffer Entries
//!
//! User-facing operations build complete envelopes eagerly (cloning the
//! incoming trace and applying the call algebra), so state and payload are
//! snapshotted at the moment of the call. The entries sit in the context's
//! buffer until the message commits; interceptors get one editable look at
//! them at the outgoing point.

use mats_shared::{MatsResult, MessageType, Sideloads, WireHeaders, WireMessage};
use mats_trace::{CallType, Channel, MatsTrace, SerializerKind};

/// One buffered outgoing message: a finished envelope, its resolved broker
/// channel, and the sideloads that ride along.
#[derive(Debug, Clone)]
pub struct PreparedOutgoing {
    pub(crate) trace: MatsTrace,
    pub(crate) target: Channel,
    pub(crate) message_type: MessageType,
    pub(crate) sideloads: Sideloads,
    /// Flow continuations pick up trace properties set later in the stage;
    /// initiations snapshot them at the initiate call and stay frozen.
    pub(crate) merge_flow_props: bool,
}

impl PreparedOutgoing {
    pub fn target_id(&self) -> &str {
        &self.target.id
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn trace_id(&self) -> &str {
        &self.trace.trace_id
    }

    /// Attach a string sideload (interceptor editing point).
    pub fn add_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.sideloads.strings.insert(key.into(), value.into());
    }

    /// Attach a byte sideload (interceptor editing point).
    pub fn add_bytes(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.sideloads.bytes.insert(key.into(), value);
    }

    /// Piggyback a serialized value onto the state frame this message will
    /// restore on REPLY (requests) or hand over on NEXT. Returns false for
    /// message kinds without such a frame.
    pub fn set_extra_state(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let Some(call) = self.trace.current_call() else {
            return false;
        };
        let height = match call.call_type {
            // The caller frame waiting for the reply sits one below the
            // outgoing call's height.
            CallType::Request => call.stack_height().saturating_sub(1),
            CallType::Next => call.stack_height(),
            CallType::Reply | CallType::Send => return false,
        };
        self.trace.set_extra_state(height, key, value)
    }

    /// Compact per keep-trace, serialize, and assemble the wire message.
    pub(crate) fn into_wire(mut self, serializer: &SerializerKind) -> MatsResult<(Channel, WireMessage)> {
        self.trace.compact_for_keep_trace();
        let envelope = serializer.serialize_envelope(&self.trace)?;
        let headers = WireHeaders {
            trace_id: self.trace.trace_id.clone(),
            flow_id: self.trace.flow_id.clone(),
            message_type: self.message_type,
            non_persistent: self.trace.non_persistent,
            interactive: self.trace.interactive,
            ttl_millis: self.trace.ttl_millis,
        };
        Ok((
            self.target,
            WireMessage {
                envelope: envelope.bytes,
                serializer_meta: envelope.meta,
                headers,
                sideloads: self.sideloads,
            },
        ))
    }
}
