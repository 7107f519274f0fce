//! # Interceptors
//!
//! Ordered observer capabilities invoked at defined points of stage
//! processing. Interceptors are side-effect-only - metrics, audit, wire
//! logging - except at the outgoing point, where the buffered messages may be
//! edited through [`PreparedOutgoing`]'s editing methods (sideloads, extra
//! state). The envelope itself is never handed out mutably.

use std::fmt;

use mats_shared::MatsError;

use crate::message::PreparedOutgoing;

/// Read-only facts about the processing in progress, shared by all points.
#[derive(Debug, Clone)]
pub struct InterceptContext {
    pub stage_id: String,
    pub trace_id: String,
    pub flow_id: String,
    pub system_message_id: String,
    pub delivery_count: u32,
}

/// Observer of stage processing. All hooks default to no-ops; implement the
/// points you care about. Hooks run on the processor task and should return
/// quickly.
#[allow(unused_variables)]
pub trait MatsInterceptor: Send + Sync + fmt::Debug {
    /// A message has been received and its envelope deserialized.
    fn message_received(&self, ctx: &InterceptContext) {}

    /// About to invoke the user lambda.
    fn user_lambda_entered(&self, ctx: &InterceptContext) {}

    /// The user lambda returned (successfully).
    fn user_lambda_exited(&self, ctx: &InterceptContext) {}

    /// The single editable point: the buffered outgoing messages, after the
    /// lambda ran and before they are serialized and staged.
    fn intercept_outgoing(&self, ctx: &InterceptContext, outgoing: &mut [PreparedOutgoing]) {}

    /// Everything committed.
    fn completed(&self, ctx: &InterceptContext) {}

    /// Processing failed; the message rolled back (redelivery/DLQ path).
    fn failed(&self, ctx: &InterceptContext, error: &MatsError) {}
}
