//! # Wire Types
//!
//! What actually travels on a broker message besides the envelope bytes:
//! typed headers for broker-side inspection and filtering, and sideloads -
//! named byte/string attachments that ride outside the envelope so bulky
//! content skips the envelope's compression path.

use std::collections::HashMap;

use mats_trace::{CallType, MessagingModel};

/// Wire-level message type, a function of the current call and its target's
/// messaging model. SEND to a topic becomes PUBLISH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum MessageType {
    #[display("REQUEST")]
    Request,
    #[display("REPLY")]
    Reply,
    #[display("NEXT")]
    Next,
    #[display("SEND")]
    Send,
    #[display("PUBLISH")]
    Publish,
}

impl MessageType {
    /// The mapping table: call type x target model -> wire type.
    pub fn for_call(call_type: CallType, target_model: MessagingModel) -> Self {
        match (call_type, target_model) {
            (CallType::Request, _) => Self::Request,
            (CallType::Reply, _) => Self::Reply,
            (CallType::Next, _) => Self::Next,
            (CallType::Send, MessagingModel::Queue) => Self::Send,
            (CallType::Send, MessagingModel::Topic) => Self::Publish,
        }
    }
}

/// Headers carried on the broker message, outside the envelope, so brokers
/// and inspection tooling can filter without deserializing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireHeaders {
    pub trace_id: String,
    pub flow_id: String,
    pub message_type: MessageType,
    pub non_persistent: bool,
    pub interactive: bool,
    /// Remaining time-to-live in milliseconds; 0 = no expiry.
    pub ttl_millis: u64,
}

/// Out-of-envelope attachments for the next outgoing message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sideloads {
    pub bytes: HashMap<String, Vec<u8>>,
    pub strings: HashMap<String, String>,
}

impl Sideloads {
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty() && self.strings.is_empty()
    }

    /// Move the accumulated attachments out, leaving this empty. Sideloads
    /// attach to exactly one outgoing message.
    pub fn take(&mut self) -> Sideloads {
        std::mem::take(self)
    }
}

/// A complete broker message: envelope bytes + serializer meta + headers +
/// sideloads.
#[derive(Debug, Clone)]
pub struct WireMessage {
    pub envelope: Vec<u8>,
    pub serializer_meta: String,
    pub headers: WireHeaders,
    pub sideloads: Sideloads,
}
