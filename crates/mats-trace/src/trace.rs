//! # MatsTrace Envelope
//!
//! The self-contained in-flight record of a message flow: identity, flags,
//! call stack, state stack and trace properties. Every hop between stages
//! carries the full envelope, so a stage can always be processed from the
//! message alone - no shared store is consulted.
//!
//! ## Call algebra
//!
//! The four `add_*_call` operations are pure in spirit: they mutate a cloned
//! envelope that becomes one outgoing message. A REQUEST pushes a reply
//! channel and up to two state frames, a REPLY pops the reply stack, a NEXT
//! keeps the stack height and hands state to the following stage, and a SEND
//! starts the target with an empty reply stack (fire-and-forget / publish).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum call-stack depth before an incoming message is refused.
pub const MAX_STACK_HEIGHT: usize = 25;

/// Maximum total calls in one flow before non-REPLY messages are refused.
/// Replies are always allowed through so that a deep flow can unwind.
pub const MAX_TOTAL_CALL_NUMBER: u32 = 100;

/// Whether a channel is competitively consumed or fanned out.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, derive_more::Display,
)]
pub enum MessagingModel {
    /// Competitive consumption: one consumer gets each message.
    #[display("QUEUE")]
    Queue,
    /// Fan-out: every subscribed process gets each message.
    #[display("TOPIC")]
    Topic,
}

/// A named destination plus its messaging model.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, derive_more::Display,
)]
#[display("{id}[{model}]")]
pub struct Channel {
    pub id: String,
    pub model: MessagingModel,
}

impl Channel {
    pub fn queue(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: MessagingModel::Queue,
        }
    }

    pub fn topic(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: MessagingModel::Topic,
        }
    }
}

/// The kind of hop a [`Call`] represents.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display,
)]
pub enum CallType {
    #[display("REQUEST")]
    Request,
    #[display("REPLY")]
    Reply,
    #[display("NEXT")]
    Next,
    #[display("SEND")]
    Send,
}

/// How much call history the envelope retains when it is sent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display, Default,
)]
pub enum KeepTrace {
    /// Keep every call with its data. The heaviest and most debuggable.
    #[display("FULL")]
    Full,
    /// Keep every call frame but null out the data of historic calls.
    #[default]
    #[display("COMPACT")]
    Compact,
    /// Keep only the current call (its reply stack included).
    #[display("MINIMAL")]
    Minimal,
}

/// Who produced a call, for DLQ forensics. Suppressed under
/// [`KeepTrace::Minimal`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallDebugInfo {
    pub calling_app_name: String,
    pub calling_app_version: String,
    pub calling_node: String,
    pub called_timestamp: DateTime<Utc>,
}

/// One hop of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub call_type: CallType,
    /// Stage id (or initiator id) that produced this call.
    pub from: String,
    pub to: Channel,
    /// Channels to return to; innermost (next to pop) last.
    pub reply_stack: Vec<Channel>,
    /// Serializer-produced payload, `None` when compacted away or void.
    pub data: Option<String>,
    /// Protocol-level message id, unique per produced call.
    pub mats_message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<CallDebugInfo>,
}

impl Call {
    /// The stack height a receiver of this call executes at.
    pub fn stack_height(&self) -> usize {
        self.reply_stack.len()
    }
}

/// Serialized state pinned to a stack height, restored when a call at that
/// height is received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackState {
    pub stack_height: usize,
    pub state: Option<String>,
    /// Side map for out-of-band additions to a waiting frame, keyed freely.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_state: BTreeMap<String, String>,
}

impl StackState {
    pub fn new(stack_height: usize, state: Option<String>) -> Self {
        Self {
            stack_height,
            state,
            extra_state: BTreeMap::new(),
        }
    }
}

/// The envelope. See the module docs; field meanings follow the data model
/// of the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatsTrace {
    /// Globally unique, generated at initiation.
    pub flow_id: String,
    /// Human-meaningful, caller-supplied (possibly modified at initiation).
    pub trace_id: String,
    pub initializing_app_name: String,
    pub initializing_app_version: String,
    /// The "from" of the initiation.
    pub initiator_id: String,
    pub initialized_timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub non_persistent: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub interactive: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_audit: bool,
    /// Milliseconds the flow's messages may live on the broker; 0 = forever.
    #[serde(default)]
    pub ttl_millis: u64,
    #[serde(default)]
    pub keep_trace: KeepTrace,

    /// Index of the current call within this flow segment. Resets on unstash.
    pub call_number: u32,
    /// Monotonic across the entire flow, stash/unstash included.
    pub total_call_number: u32,

    /// The current call is last. Older calls compacted per `keep_trace`.
    pub calls: Vec<Call>,
    /// State frames, oldest first.
    pub state_flow: Vec<StackState>,
    /// Sticky key/value pairs visible for the remainder of the flow.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub trace_properties: BTreeMap<String, String>,
}

impl MatsTrace {
    /// Start a fresh envelope for a new flow. No calls yet; the first
    /// `add_*_call` creates the initiation's outgoing call.
    pub fn new(
        flow_id: impl Into<String>,
        trace_id: impl Into<String>,
        initializing_app_name: impl Into<String>,
        initializing_app_version: impl Into<String>,
        initiator_id: impl Into<String>,
    ) -> Self {
        Self {
            flow_id: flow_id.into(),
            trace_id: trace_id.into(),
            initializing_app_name: initializing_app_name.into(),
            initializing_app_version: initializing_app_version.into(),
            initiator_id: initiator_id.into(),
            initialized_timestamp: Utc::now(),
            non_persistent: false,
            interactive: false,
            no_audit: false,
            ttl_millis: 0,
            keep_trace: KeepTrace::default(),
            call_number: 0,
            total_call_number: 0,
            calls: Vec::new(),
            state_flow: Vec::new(),
            trace_properties: BTreeMap::new(),
        }
    }

    /// The call this envelope is currently carrying, if any.
    pub fn current_call(&self) -> Option<&Call> {
        self.calls.last()
    }

    /// Stack height of the current call; 0 before any call exists.
    pub fn current_stack_height(&self) -> usize {
        self.current_call().map_or(0, Call::stack_height)
    }

    /// Resolve the incoming state for the current call: the most recently
    /// added frame whose height equals the current stack height. When a
    /// REQUEST added both the caller frame (height H) and an initial callee
    /// frame (height H+1), a receiver at H+1 sees the callee frame because
    /// it was added last.
    pub fn incoming_state(&self) -> Option<&StackState> {
        let height = self.current_stack_height();
        self.state_flow
            .iter()
            .rev()
            .find(|s| s.stack_height == height)
    }

    /// Sticky flow property, as serialized by the payload codec.
    pub fn trace_property(&self, key: &str) -> Option<&str> {
        self.trace_properties.get(key).map(String::as_str)
    }

    /// Set a sticky flow property (serialized value).
    pub fn set_trace_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.trace_properties.insert(key.into(), value.into());
    }

    /// Add an extra-state entry to the topmost frame at `stack_height`.
    /// Used by the editable-outgoing interception point to piggyback data
    /// onto a waiting REPLY/NEXT frame.
    pub fn set_extra_state(
        &mut self,
        stack_height: usize,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> bool {
        match self
            .state_flow
            .iter_mut()
            .rev()
            .find(|s| s.stack_height == stack_height)
        {
            Some(frame) => {
                frame.extra_state.insert(key.into(), value.into());
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Call algebra
    // =========================================================================

    /// REQUEST: push `reply_to` onto the reply stack and grow the height by
    /// one. Always records the caller's frame at the current height (restored
    /// on REPLY); optionally hands an initial frame to the callee at the new
    /// height.
    #[allow(clippy::too_many_arguments)]
    pub fn add_request_call(
        &mut self,
        from: impl Into<String>,
        to: Channel,
        reply_to: Channel,
        data: Option<String>,
        caller_state: Option<String>,
        initial_callee_state: Option<String>,
        debug: Option<CallDebugInfo>,
    ) {
        let mut reply_stack = self.current_reply_stack();
        let caller_height = reply_stack.len();
        reply_stack.push(reply_to);

        self.state_flow
            .push(StackState::new(caller_height, caller_state));
        if let Some(initial) = initial_callee_state {
            self.state_flow
                .push(StackState::new(caller_height + 1, Some(initial)));
        }
        self.push_call(CallType::Request, from.into(), to, reply_stack, data, debug);
    }

    /// REPLY: pop the innermost reply channel and target it. Frames above the
    /// shrunken height are dead and are dropped. Returns `None` without
    /// modifying the envelope when the reply stack is empty (a terminator
    /// "replying" into the void).
    pub fn add_reply_call(
        &mut self,
        from: impl Into<String>,
        data: Option<String>,
        debug: Option<CallDebugInfo>,
    ) -> Option<&Call> {
        let mut reply_stack = self.current_reply_stack();
        let to = reply_stack.pop()?;
        let height = reply_stack.len();
        self.state_flow.retain(|s| s.stack_height <= height);
        self.push_call(CallType::Reply, from.into(), to, reply_stack, data, debug);
        self.calls.last()
    }

    /// NEXT: pass to the following stage of the same endpoint. Stack height
    /// unchanged; exactly one frame is added, carrying the state the next
    /// stage resumes with.
    pub fn add_next_call(
        &mut self,
        from: impl Into<String>,
        next_stage: Channel,
        data: Option<String>,
        state: Option<String>,
        debug: Option<CallDebugInfo>,
    ) {
        let reply_stack = self.current_reply_stack();
        let height = reply_stack.len();
        self.state_flow.retain(|s| s.stack_height <= height);
        self.state_flow.push(StackState::new(height, state));
        self.push_call(CallType::Next, from.into(), next_stage, reply_stack, data, debug);
    }

    /// SEND: fire-and-forget (queue) or publish (topic). The target starts a
    /// fresh stack: empty reply stack, optional initial frame at height 0.
    pub fn add_send_call(
        &mut self,
        from: impl Into<String>,
        to: Channel,
        data: Option<String>,
        initial_target_state: Option<String>,
        debug: Option<CallDebugInfo>,
    ) {
        self.state_flow.retain(|s| s.stack_height == 0);
        if let Some(initial) = initial_target_state {
            self.state_flow.push(StackState::new(0, Some(initial)));
        }
        self.push_call(CallType::Send, from.into(), to, Vec::new(), data, debug);
    }

    fn current_reply_stack(&self) -> Vec<Channel> {
        self.current_call()
            .map(|c| c.reply_stack.clone())
            .unwrap_or_default()
    }

    fn push_call(
        &mut self,
        call_type: CallType,
        from: String,
        to: Channel,
        reply_stack: Vec<Channel>,
        data: Option<String>,
        debug: Option<CallDebugInfo>,
    ) {
        self.call_number += 1;
        self.total_call_number += 1;
        let mats_message_id = format!("{}_{}", self.flow_id, self.total_call_number);
        self.calls.push(Call {
            call_type,
            from,
            to,
            reply_stack,
            data,
            mats_message_id,
            debug,
        });
    }

    // =========================================================================
    // Compaction
    // =========================================================================

    /// Apply the configured `keep_trace` retention before the envelope goes
    /// on the wire. FULL keeps everything; COMPACT nulls historic call data;
    /// MINIMAL retains only the current call (with its reply stack) and
    /// strips debug info.
    pub fn compact_for_keep_trace(&mut self) {
        match self.keep_trace {
            KeepTrace::Full => {}
            KeepTrace::Compact => {
                let last = self.calls.len().saturating_sub(1);
                for call in &mut self.calls[..last] {
                    call.data = None;
                }
            }
            KeepTrace::Minimal => {
                if let Some(mut current) = self.calls.pop() {
                    current.debug = None;
                    self.calls.clear();
                    self.calls.push(current);
                }
            }
        }
    }
}
