//! # Process and Initiate Contexts
//!
//! The capability surface handed to user code. A [`ProcessContext`] wraps one
//! received message: typed state, the incoming payload's flow position, and
//! the buffered outgoing operations. An [`InitiateContext`] builds brand-new
//! flows, standalone or nested inside a stage.
//!
//! Outgoing messages are built eagerly - each operation clones the incoming
//! envelope and applies the call algebra - so state and payload are
//! snapshotted at the moment of the call, and two requests out of one stage
//! carry independent state. Nothing touches the broker until the surrounding
//! transaction commits.
//!
//! ## Legal flows
//!
//! | already issued      | may also issue              | may not issue        |
//! |---------------------|-----------------------------|----------------------|
//! | nothing             | request / next / reply / initiate | -              |
//! | request or next     | more request / next; initiate | reply              |
//! | reply               | initiate                    | request, next, reply |
//!
//! Violations are logged-and-allowed under `FlowViolation::Warn`, hard errors
//! under `Fail`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use mats_shared::{
    FlowViolation, MatsError, MatsResult, MessageType, Sideloads,
};
use mats_trace::{CallDebugInfo, Channel, MatsTrace, MessagingModel, Stash};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, info, info_span};
use uuid::Uuid;

use crate::factory::EngineShared;
use crate::message::PreparedOutgoing;
use crate::tx::TxAttributes;

/// Hook run after a successful commit. Errors are logged and swallowed.
pub(crate) type AfterCommitHook = Box<dyn FnOnce() -> MatsResult<()> + Send>;

/// The erased per-message machinery behind a [`ProcessContext`]. Owned by
/// value through the user lambda and handed back for dispatch.
pub(crate) struct StageExecution {
    pub(crate) engine: Arc<EngineShared>,
    pub(crate) endpoint_id: String,
    pub(crate) stage_id: String,
    pub(crate) next_stage_id: Option<String>,

    /// The incoming envelope, mutable for trace-property additions.
    pub(crate) trace: MatsTrace,
    /// Raw envelope bytes exactly as received; stash() returns these.
    pub(crate) incoming_envelope: Vec<u8>,
    pub(crate) incoming_meta: String,
    pub(crate) incoming_sideloads: Sideloads,
    pub(crate) system_message_id: String,
    pub(crate) delivery_count: u32,

    pub(crate) outgoing: Vec<PreparedOutgoing>,
    out_sideloads: Sideloads,
    reply_issued: Option<String>,
    request_or_next_issued: Option<String>,
    pub(crate) after_commit: Vec<AfterCommitHook>,
    pub(crate) attributes: Arc<TxAttributes>,
}

impl std::fmt::Debug for StageExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageExecution")
            .field("stage_id", &self.stage_id)
            .field("trace_id", &self.trace.trace_id)
            .field("outgoing", &self.outgoing.len())
            .finish()
    }
}

impl StageExecution {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        engine: Arc<EngineShared>,
        endpoint_id: String,
        stage_id: String,
        next_stage_id: Option<String>,
        trace: MatsTrace,
        incoming_envelope: Vec<u8>,
        incoming_meta: String,
        incoming_sideloads: Sideloads,
        system_message_id: String,
        delivery_count: u32,
        attributes: Arc<TxAttributes>,
    ) -> Self {
        Self {
            engine,
            endpoint_id,
            stage_id,
            next_stage_id,
            trace,
            incoming_envelope,
            incoming_meta,
            incoming_sideloads,
            system_message_id,
            delivery_count,
            outgoing: Vec::new(),
            out_sideloads: Sideloads::default(),
            reply_issued: None,
            request_or_next_issued: None,
            after_commit: Vec::new(),
            attributes,
        }
    }

    pub(crate) fn decode_incoming_state<S: DeserializeOwned + Default>(&self) -> MatsResult<S> {
        match self
            .trace
            .incoming_state()
            .and_then(|frame| frame.state.as_deref())
        {
            Some("null") | None => Ok(S::default()),
            Some(serialized) => Ok(self.engine.serializer.deserialize_payload(serialized)?),
        }
    }

    pub(crate) fn decode_incoming_payload<I: DeserializeOwned>(&self) -> MatsResult<I> {
        let data = self
            .trace
            .current_call()
            .and_then(|c| c.data.as_deref())
            .unwrap_or("null");
        Ok(self.engine.serializer.deserialize_payload(data)?)
    }

    fn debug_info(&self) -> Option<CallDebugInfo> {
        Some(CallDebugInfo {
            calling_app_name: self.engine.config.app_name.clone(),
            calling_app_version: self.engine.config.app_version.clone(),
            calling_node: self.engine.config.nodename.clone(),
            called_timestamp: Utc::now(),
        })
    }

    /// Enforce the legal-flow table for an operation about to be issued.
    fn check_flow(&mut self, op: &str, against_reply_only: bool) -> MatsResult<()> {
        let prior = if against_reply_only {
            self.reply_issued.as_deref()
        } else {
            self.reply_issued
                .as_deref()
                .or(self.request_or_next_issued.as_deref())
        };
        if let Some(prior) = prior {
            let message = format!(
                "stage {} issued {op} after already issuing {prior}",
                self.stage_id
            );
            match self.engine.config.flow_violation {
                FlowViolation::Warn => {
                    error!(stage_id = %self.stage_id, "illegal message flow (proceeding): {message}");
                }
                FlowViolation::Fail => return Err(MatsError::illegal_flow(message)),
            }
        }
        Ok(())
    }

    fn push_flow_message(&mut self, trace: MatsTrace) {
        let call = trace
            .current_call()
            .expect("flow message has a current call");
        let target = self.engine.resolver.channel(&call.to.id, call.to.model);
        let message_type = MessageType::for_call(call.call_type, call.to.model);
        self.outgoing.push(PreparedOutgoing {
            target,
            message_type,
            trace,
            sideloads: self.out_sideloads.take(),
            merge_flow_props: true,
        });
    }

    pub(crate) fn add_request(
        &mut self,
        to: &str,
        data: String,
        caller_state: String,
        initial_callee_state: Option<String>,
    ) -> MatsResult<()> {
        // Requests out of a stage reply to the *next* stage; the last stage
        // has nowhere to receive the reply.
        let next_stage = self.next_stage_id.clone().ok_or_else(|| {
            MatsError::illegal_flow(format!(
                "stage {} is the last stage of {}; request() needs a next stage to receive the reply",
                self.stage_id, self.endpoint_id
            ))
        })?;
        self.check_flow("request", true)?;

        let mut trace = self.trace.clone();
        trace.add_request_call(
            self.stage_id.clone(),
            Channel::queue(to),
            Channel::queue(next_stage),
            Some(data),
            Some(caller_state),
            initial_callee_state,
            self.debug_info(),
        );
        self.push_flow_message(trace);
        self.request_or_next_issued
            .get_or_insert_with(|| "request".to_string());
        Ok(())
    }

    pub(crate) fn add_reply(&mut self, data: String) -> MatsResult<()> {
        self.check_flow("reply", false)?;

        let mut trace = self.trace.clone();
        if trace
            .add_reply_call(self.stage_id.clone(), Some(data), self.debug_info())
            .is_none()
        {
            // A fire-and-forget target naturally "replies" into the void.
            info!(
                stage_id = %self.stage_id,
                trace_id = %self.trace.trace_id,
                "reply with empty reply stack; dropping (fire-and-forget flow terminates here)"
            );
            return Ok(());
        }
        self.push_flow_message(trace);
        self.reply_issued.get_or_insert_with(|| "reply".to_string());
        Ok(())
    }

    pub(crate) fn add_next(&mut self, data: String, state: String) -> MatsResult<()> {
        let next_stage = self.next_stage_id.clone().ok_or_else(|| {
            MatsError::illegal_flow(format!(
                "stage {} is the last stage of {}; next() has no stage to go to",
                self.stage_id, self.endpoint_id
            ))
        })?;
        self.check_flow("next", true)?;

        let mut trace = self.trace.clone();
        trace.add_next_call(
            self.stage_id.clone(),
            Channel::queue(next_stage),
            Some(data),
            Some(state),
            self.debug_info(),
        );
        self.push_flow_message(trace);
        self.request_or_next_issued
            .get_or_insert_with(|| "next".to_string());
        Ok(())
    }

    /// Merge late-set trace properties into flow continuations and stage
    /// everything into the session. Called by the processor after the
    /// outgoing interception point.
    pub(crate) fn dispatch(&mut self, tx: &mut crate::tx::TxContext) -> MatsResult<()> {
        for out in &mut self.outgoing {
            if out.merge_flow_props {
                for (key, value) in &self.trace.trace_properties {
                    out.trace
                        .trace_properties
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
            }
        }
        for out in self.outgoing.drain(..) {
            let (channel, wire) = out.into_wire(&self.engine.serializer)?;
            tx.session_mut().stage(channel, wire);
        }
        Ok(())
    }
}

/// The context a stage lambda runs with: typed state plus the full operation
/// surface. One instance per received message, never shared across threads.
pub struct ProcessContext<S> {
    pub(crate) exec: StageExecution,
    state: S,
}

impl<S> std::fmt::Debug for ProcessContext<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessContext")
            .field("stage_id", &self.exec.stage_id)
            .field("trace_id", &self.exec.trace.trace_id)
            .finish()
    }
}

impl<S: Serialize> ProcessContext<S> {
    pub(crate) fn new(exec: StageExecution, state: S) -> Self {
        Self { exec, state }
    }

    pub(crate) fn into_execution(self) -> StageExecution {
        self.exec
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    pub fn trace_id(&self) -> &str {
        &self.exec.trace.trace_id
    }

    pub fn flow_id(&self) -> &str {
        &self.exec.trace.flow_id
    }

    pub fn endpoint_id(&self) -> &str {
        &self.exec.endpoint_id
    }

    pub fn stage_id(&self) -> &str {
        &self.exec.stage_id
    }

    /// Broker-assigned id of the incoming message.
    pub fn system_message_id(&self) -> &str {
        &self.exec.system_message_id
    }

    /// How many times the incoming message has been delivered, this
    /// processing included.
    pub fn delivery_count(&self) -> u32 {
        self.exec.delivery_count
    }

    /// Total calls this flow has made so far, stash/unstash included.
    pub fn total_call_number(&self) -> u32 {
        self.exec.trace.total_call_number
    }

    /// Serialized trace-property map (flow-sticky values).
    pub fn trace_properties(&self) -> &BTreeMap<String, String> {
        &self.exec.trace.trace_properties
    }

    pub fn get_trace_property<T: DeserializeOwned>(&self, key: &str) -> MatsResult<Option<T>> {
        match self.exec.trace.trace_property(key) {
            Some(serialized) => Ok(Some(
                self.exec.serializer().deserialize_payload(serialized)?,
            )),
            None => Ok(None),
        }
    }

    /// Set a flow-sticky property: visible on this stage's outgoing calls,
    /// every downstream stage, and initiations made from here on.
    pub fn set_trace_property<T: Serialize>(&mut self, key: &str, value: &T) -> MatsResult<()> {
        let serialized = self.exec.serializer().serialize_payload(value)?;
        self.exec.trace.set_trace_property(key, serialized);
        Ok(())
    }

    /// Extra-state entry piggybacked onto the incoming frame, if any.
    pub fn incoming_extra_state<T: DeserializeOwned>(&self, key: &str) -> MatsResult<Option<T>> {
        match self
            .exec
            .trace
            .incoming_state()
            .and_then(|frame| frame.extra_state.get(key))
        {
            Some(serialized) => Ok(Some(
                self.exec.serializer().deserialize_payload(serialized)?,
            )),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Sideloads
    // =========================================================================

    /// All incoming sideloads.
    pub fn incoming_sideloads(&self) -> &Sideloads {
        &self.exec.incoming_sideloads
    }

    /// Incoming string sideload.
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.exec
            .incoming_sideloads
            .strings
            .get(key)
            .map(String::as_str)
    }

    /// Incoming byte sideload.
    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        self.exec
            .incoming_sideloads
            .bytes
            .get(key)
            .map(Vec::as_slice)
    }

    /// Attach a string sideload to the *next* outgoing message.
    pub fn add_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.exec
            .out_sideloads
            .strings
            .insert(key.into(), value.into());
    }

    /// Attach a byte sideload to the *next* outgoing message.
    pub fn add_bytes(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.exec.out_sideloads.bytes.insert(key.into(), value);
    }

    // =========================================================================
    // Transactional resources
    // =========================================================================

    /// Fetch a co-transactional attribute (e.g. the database handle the
    /// installed [`TransactionalResource`](crate::tx::TransactionalResource)
    /// registered).
    pub fn get_attribute<T: Send + Sync + 'static>(&self, name: Option<&str>) -> Option<Arc<T>> {
        self.exec.attributes.get::<T>(name)
    }

    /// Run after both commits succeeded. Errors (and panics) in the hook are
    /// logged and swallowed; the message is already committed.
    pub fn do_after_commit(
        &mut self,
        hook: impl FnOnce() -> MatsResult<()> + Send + 'static,
    ) {
        self.exec.after_commit.push(Box::new(hook));
    }

    // =========================================================================
    // Flow operations
    // =========================================================================

    /// Request another endpoint; its reply arrives at this endpoint's next
    /// stage, which resumes with the state as it is *right now*.
    pub fn request<T: Serialize>(&mut self, endpoint_id: &str, payload: &T) -> MatsResult<()> {
        let data = self.exec.serializer().serialize_payload(payload)?;
        let state = self.exec.serializer().serialize_payload(&self.state)?;
        self.exec.add_request(endpoint_id, data, state, None)
    }

    /// Like [`Self::request`], also handing the callee an initial state.
    pub fn request_with_initial_state<T: Serialize, C: Serialize>(
        &mut self,
        endpoint_id: &str,
        payload: &T,
        initial_callee_state: &C,
    ) -> MatsResult<()> {
        let data = self.exec.serializer().serialize_payload(payload)?;
        let state = self.exec.serializer().serialize_payload(&self.state)?;
        let initial = self
            .exec
            .serializer()
            .serialize_payload(initial_callee_state)?;
        self.exec.add_request(endpoint_id, data, state, Some(initial))
    }

    /// Reply up the stack. A no-op (logged at info) when nobody is waiting.
    pub fn reply<T: Serialize>(&mut self, payload: &T) -> MatsResult<()> {
        let data = self.exec.serializer().serialize_payload(payload)?;
        self.exec.add_reply(data)
    }

    /// Pass straight to the next stage of this endpoint, same stack height.
    pub fn next<T: Serialize>(&mut self, payload: &T) -> MatsResult<()> {
        let data = self.exec.serializer().serialize_payload(payload)?;
        let state = self.exec.serializer().serialize_payload(&self.state)?;
        self.exec.add_next(data, state)
    }

    /// Start new flows from within this stage. The messages join this
    /// message's commit batch; the trace id is inherited (extendable via
    /// [`InitiateContext::trace_id`]), trace properties are inherited as of
    /// now, and the factory's initiate-trace-id modifier is NOT applied.
    pub fn initiate(
        &mut self,
        f: impl FnOnce(&mut InitiateContext) -> MatsResult<()>,
    ) -> MatsResult<()> {
        let parent = ParentFlow {
            trace_id: self.exec.trace.trace_id.clone(),
            properties: self.exec.trace.trace_properties.clone(),
        };
        let mut init = InitiateContext::new(
            self.exec.engine.clone(),
            self.exec.stage_id.clone(),
            Some(parent),
            None,
        );
        // Child span: the stage's logging context is restored on return.
        let span = info_span!("mats.initiate", parent_stage = %self.exec.stage_id);
        span.in_scope(|| f(&mut init))?;
        self.exec.outgoing.append(&mut init.messages);
        Ok(())
    }

    /// Freeze this stage's incoming execution point into opaque bytes for
    /// later [`unstash`](crate::initiator::Initiator::unstash). Idempotent:
    /// repeated calls yield equal bytes. Does not suppress other outgoing
    /// operations; the typical pattern is stash, persist the bytes
    /// co-transactionally, and exit without replying.
    pub fn stash(&self) -> Vec<u8> {
        Stash {
            codec: self.exec.engine.serializer.id().to_string(),
            endpoint_id: self.exec.endpoint_id.clone(),
            stage_id: self.exec.stage_id.clone(),
            next_stage_id: self.exec.next_stage_id.clone(),
            serializer_meta: self.exec.incoming_meta.clone(),
            system_message_id: self.exec.system_message_id.clone(),
            envelope: self.exec.incoming_envelope.clone(),
        }
        .encode()
    }
}

impl StageExecution {
    fn serializer(&self) -> &mats_trace::SerializerKind {
        &self.engine.serializer
    }
}

// =============================================================================
// Initiations
// =============================================================================

pub(crate) struct ParentFlow {
    pub(crate) trace_id: String,
    pub(crate) properties: BTreeMap<String, String>,
}

/// Per-message draft reset after each terminal operation.
#[derive(Default)]
struct MessageDraft {
    to: Option<String>,
    reply_to: Option<ReplyTo>,
}

struct ReplyTo {
    endpoint_id: String,
    model: MessagingModel,
    state: String,
}

/// Builder-style context for injecting new flows. Obtained from an
/// [`Initiator`](crate::initiator::Initiator) or via
/// [`ProcessContext::initiate`]. Several messages may be pipelined within one
/// lambda; they commit atomically.
pub struct InitiateContext {
    engine: Arc<EngineShared>,
    default_from: String,
    parent: Option<ParentFlow>,
    /// Factory-installed trace-id modifier; only set for outermost
    /// initiations, and always fed the original caller-supplied id.
    modifier: Option<crate::factory::TraceIdModifier>,

    // Flow-level settings persist across pipelined messages.
    from: Option<String>,
    trace_id: Option<String>,
    keep_trace: mats_trace::KeepTrace,
    non_persistent: bool,
    interactive: bool,
    no_audit: bool,
    ttl_millis: u64,
    properties: BTreeMap<String, String>,

    draft: MessageDraft,
    sideloads: Sideloads,
    pub(crate) messages: Vec<PreparedOutgoing>,
}

impl std::fmt::Debug for InitiateContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitiateContext")
            .field("from", &self.from)
            .field("trace_id", &self.trace_id)
            .field("messages", &self.messages.len())
            .finish()
    }
}

impl InitiateContext {
    pub(crate) fn new(
        engine: Arc<EngineShared>,
        default_from: String,
        parent: Option<ParentFlow>,
        modifier: Option<crate::factory::TraceIdModifier>,
    ) -> Self {
        Self {
            engine,
            default_from,
            parent,
            modifier,
            from: None,
            trace_id: None,
            keep_trace: mats_trace::KeepTrace::default(),
            non_persistent: false,
            interactive: false,
            no_audit: false,
            ttl_millis: 0,
            properties: BTreeMap::new(),
            draft: MessageDraft::default(),
            sideloads: Sideloads::default(),
            messages: Vec::new(),
        }
    }

    // =========================================================================
    // Flow-level settings
    // =========================================================================

    /// The initiator id recorded as the flow's origin.
    pub fn from(&mut self, initiator_id: impl Into<String>) -> &mut Self {
        self.from = Some(initiator_id.into());
        self
    }

    /// Caller-supplied trace id. Required for standalone initiations. Inside
    /// a stage it *extends* the incoming trace id (`incoming|suffix`).
    pub fn trace_id(&mut self, trace_id: impl Into<String>) -> &mut Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn keep_trace(&mut self, keep_trace: mats_trace::KeepTrace) -> &mut Self {
        self.keep_trace = keep_trace;
        self
    }

    /// The broker may drop this flow's messages on crash.
    pub fn non_persistent(&mut self) -> &mut Self {
        self.non_persistent = true;
        self
    }

    /// Latency-sensitive: prioritized and eligible for the interactive
    /// processor carve-out.
    pub fn interactive(&mut self) -> &mut Self {
        self.interactive = true;
        self
    }

    /// Hint to observability that this flow need not be audited.
    pub fn no_audit(&mut self) -> &mut Self {
        self.no_audit = true;
        self
    }

    /// Time-to-live for the flow's messages; 0 = forever.
    pub fn ttl_millis(&mut self, ttl_millis: u64) -> &mut Self {
        self.ttl_millis = ttl_millis;
        self
    }

    /// Flow-sticky property on all subsequent messages of this initiation.
    pub fn set_trace_property<T: Serialize>(&mut self, key: &str, value: &T) -> MatsResult<()> {
        let serialized = self.engine.serializer.serialize_payload(value)?;
        self.properties.insert(key.to_string(), serialized);
        Ok(())
    }

    // =========================================================================
    // Per-message settings
    // =========================================================================

    /// Target endpoint for the next message.
    pub fn to(&mut self, endpoint_id: impl Into<String>) -> &mut Self {
        self.draft.to = Some(endpoint_id.into());
        self
    }

    /// Where the eventual reply goes (a terminator endpoint), with the state
    /// that terminator resumes with.
    pub fn reply_to<T: Serialize>(
        &mut self,
        endpoint_id: impl Into<String>,
        state: &T,
    ) -> MatsResult<&mut Self> {
        let state = self.engine.serializer.serialize_payload(state)?;
        self.draft.reply_to = Some(ReplyTo {
            endpoint_id: endpoint_id.into(),
            model: MessagingModel::Queue,
            state,
        });
        Ok(self)
    }

    /// Reply to a subscription terminator (topic) instead of a queue.
    pub fn reply_to_subscription<T: Serialize>(
        &mut self,
        endpoint_id: impl Into<String>,
        state: &T,
    ) -> MatsResult<&mut Self> {
        let state = self.engine.serializer.serialize_payload(state)?;
        self.draft.reply_to = Some(ReplyTo {
            endpoint_id: endpoint_id.into(),
            model: MessagingModel::Topic,
            state,
        });
        Ok(self)
    }

    /// String sideload on the next message.
    pub fn add_string(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.sideloads.strings.insert(key.into(), value.into());
        self
    }

    /// Byte sideload on the next message.
    pub fn add_bytes(&mut self, key: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.sideloads.bytes.insert(key.into(), value);
        self
    }

    // =========================================================================
    // Terminal operations
    // =========================================================================

    /// REQUEST the target, directing the reply to the configured `reply_to`.
    pub fn request<T: Serialize>(&mut self, payload: &T) -> MatsResult<()> {
        let to = self.take_to("request")?;
        let reply_to = self.draft.reply_to.take().ok_or_else(|| {
            MatsError::config("initiation request() needs reply_to(..) or reply_to_subscription(..)")
        })?;
        let data = self.engine.serializer.serialize_payload(payload)?;

        let mut trace = self.new_trace()?;
        let from = trace.initiator_id.clone();
        trace.add_request_call(
            from,
            Channel::queue(to),
            Channel {
                id: reply_to.endpoint_id,
                model: reply_to.model,
            },
            Some(data),
            Some(reply_to.state),
            None,
            self.debug_info(),
        );
        self.finish_message(trace);
        Ok(())
    }

    /// Fire-and-forget SEND to a queue endpoint.
    pub fn send<T: Serialize>(&mut self, payload: &T) -> MatsResult<()> {
        let to = self.take_to("send")?;
        let data = self.engine.serializer.serialize_payload(payload)?;

        let mut trace = self.new_trace()?;
        let from = trace.initiator_id.clone();
        trace.add_send_call(
            from,
            Channel::queue(to),
            Some(data),
            None,
            self.debug_info(),
        );
        self.finish_message(trace);
        Ok(())
    }

    /// PUBLISH to a topic: every subscription endpoint instance receives it.
    pub fn publish<T: Serialize>(&mut self, payload: &T) -> MatsResult<()> {
        let to = self.take_to("publish")?;
        let data = self.engine.serializer.serialize_payload(payload)?;

        let mut trace = self.new_trace()?;
        let from = trace.initiator_id.clone();
        trace.add_send_call(
            from,
            Channel::topic(to),
            Some(data),
            None,
            self.debug_info(),
        );
        self.finish_message(trace);
        Ok(())
    }

    fn take_to(&mut self, op: &str) -> MatsResult<String> {
        self.draft
            .to
            .take()
            .ok_or_else(|| MatsError::config(format!("initiation {op}() needs to(..) first")))
    }

    /// Resolve the trace id for one outgoing message. The modifier, when
    /// installed, always receives the *original* caller-supplied id, so
    /// pipelined messages all carry `f(t)`, never `f(f(t))`. Stage-nested
    /// initiations inherit the incoming id, optionally extended.
    fn resolved_trace_id(&self) -> MatsResult<String> {
        match (&self.parent, &self.trace_id) {
            (Some(parent), Some(suffix)) => Ok(format!("{}|{}", parent.trace_id, suffix)),
            (Some(parent), None) => Ok(parent.trace_id.clone()),
            (None, Some(original)) => Ok(match &self.modifier {
                Some(modify) => modify(original),
                None => original.clone(),
            }),
            (None, None) => Err(MatsError::config(
                "initiation needs trace_id(..) before its first message",
            )),
        }
    }

    fn new_trace(&self) -> MatsResult<MatsTrace> {
        let trace_id = self.resolved_trace_id()?;
        let from = self
            .from
            .clone()
            .unwrap_or_else(|| self.default_from.clone());
        let flow_id = Uuid::now_v7().to_string();

        let mut trace = MatsTrace::new(
            flow_id,
            trace_id,
            self.engine.config.app_name.clone(),
            self.engine.config.app_version.clone(),
            from,
        );
        trace.keep_trace = self.keep_trace;
        trace.non_persistent = self.non_persistent;
        trace.interactive = self.interactive;
        trace.no_audit = self.no_audit;
        trace.ttl_millis = self.ttl_millis;

        // Nested initiations inherit the stage's properties as of the
        // initiate() call; explicit ones overlay.
        if let Some(parent) = &self.parent {
            trace.trace_properties = parent.properties.clone();
        }
        for (key, value) in &self.properties {
            trace
                .trace_properties
                .insert(key.clone(), value.clone());
        }
        Ok(trace)
    }

    fn debug_info(&self) -> Option<CallDebugInfo> {
        Some(CallDebugInfo {
            calling_app_name: self.engine.config.app_name.clone(),
            calling_app_version: self.engine.config.app_version.clone(),
            calling_node: self.engine.config.nodename.clone(),
            called_timestamp: Utc::now(),
        })
    }

    fn finish_message(&mut self, trace: MatsTrace) {
        let call = trace
            .current_call()
            .expect("initiation message has a current call");
        let target = self.engine.resolver.channel(&call.to.id, call.to.model);
        let message_type = MessageType::for_call(call.call_type, call.to.model);
        self.messages.push(PreparedOutgoing {
            target,
            message_type,
            trace,
            sideloads: self.sideloads.take(),
            merge_flow_props: false,
        });
        self.draft = MessageDraft::default();
    }
}
