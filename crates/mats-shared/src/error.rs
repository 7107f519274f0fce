//! # Error Taxonomy
//!
//! Two layers: [`BrokerError`] for the transport capability (with
//! retriable/permanent classification, so callers know whether redelivery is
//! worth anything), and [`MatsError`] for everything user code and the engine
//! surface. Stage lambdas return `Result<(), MatsError>`; any error rolls the
//! message back and the broker's redelivery/DLQ pipeline takes over.

use mats_trace::{SerializeError, StashError};

/// Result alias used across the framework.
pub type MatsResult<T> = Result<T, MatsError>;

/// Errors raised by the broker capability.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The broker (or this session/consumer) has been closed.
    #[error("broker is closed: {0}")]
    Closed(String),

    /// A transient condition; retrying / redelivery may succeed.
    #[error("transient broker failure: {0}")]
    Transient(String),

    /// Receipt did not match an in-flight message (double ack, or the
    /// message was already returned to the queue).
    #[error("unknown receipt {0}; message is not in flight")]
    UnknownReceipt(String),

    #[error("internal broker error: {0}")]
    Internal(String),
}

impl BrokerError {
    pub fn closed(msg: impl Into<String>) -> Self {
        Self::Closed(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether redelivery has a chance of succeeding.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// The framework-level error taxonomy. Kinds map to the documented failure
/// modes: refusal, overflow, transport, serialization, user code, flow
/// violations and setup errors.
#[derive(Debug, thiserror::Error)]
pub enum MatsError {
    /// The stage lambda explicitly asked for this message to go the DLQ
    /// route: rollback now, let redelivery exhaust.
    #[error("message refused by stage: {0}")]
    RefuseMessage(String),

    /// Incoming call stack exceeded the configured depth; the incoming
    /// message is refused so the flow cannot grow further.
    #[error("call stack height {height} exceeds maximum {max}")]
    StackOverflow { height: usize, max: usize },

    /// Non-REPLY call count exceeded the configured total; replies are
    /// always allowed so the flow can unwind.
    #[error("total call number {total} exceeds maximum {max}")]
    CallOverflow { total: u32, max: u32 },

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Serialization(#[from] SerializeError),

    #[error(transparent)]
    Stash(#[from] StashError),

    /// A legal-flow violation under `FlowViolation::Fail` strictness,
    /// e.g. a second reply from one stage.
    #[error("illegal message flow: {0}")]
    IllegalFlow(String),

    /// Setup-time misconfiguration; surfaced synchronously at registration.
    #[error("configuration error: {0}")]
    Config(String),

    /// No endpoint/stage registered under the given id (lookup during
    /// unstash or initiation validation).
    #[error("unknown endpoint or stage: {0}")]
    UnknownEndpoint(String),

    /// The factory/endpoint is in the wrong lifecycle state for the call.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// Anything user code propagates out of a stage or initiate lambda.
    #[error("handler error: {0}")]
    Handler(#[from] anyhow::Error),
}

impl MatsError {
    pub fn refuse(msg: impl Into<String>) -> Self {
        Self::RefuseMessage(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn lifecycle(msg: impl Into<String>) -> Self {
        Self::Lifecycle(msg.into())
    }

    pub fn illegal_flow(msg: impl Into<String>) -> Self {
        Self::IllegalFlow(msg.into())
    }

    /// Whether rollback + broker redelivery may eventually succeed, or the
    /// message is poison and will ride redelivery straight to the DLQ.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Broker(e) => e.is_retriable(),
            Self::Handler(_) => true,
            Self::RefuseMessage(_)
            | Self::StackOverflow { .. }
            | Self::CallOverflow { .. }
            | Self::Serialization(_)
            | Self::Stash(_)
            | Self::IllegalFlow(_)
            | Self::Config(_)
            | Self::UnknownEndpoint(_)
            | Self::Lifecycle(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_retriability() {
        assert!(BrokerError::transient("pause").is_retriable());
        assert!(!BrokerError::closed("gone").is_retriable());
        assert!(!BrokerError::internal("bug").is_retriable());
    }

    #[test]
    fn mats_retriability_follows_kind() {
        assert!(MatsError::from(BrokerError::transient("x")).is_retriable());
        assert!(MatsError::Handler(anyhow::anyhow!("user boom")).is_retriable());
        assert!(!MatsError::refuse("poison").is_retriable());
        assert!(!MatsError::StackOverflow { height: 26, max: 25 }.is_retriable());
    }

    #[test]
    fn display_includes_detail() {
        let err = MatsError::CallOverflow { total: 101, max: 100 };
        assert!(err.to_string().contains("101"));
        let err = MatsError::config("duplicate endpointId 'A'");
        assert!(err.to_string().contains("duplicate endpointId"));
    }
}
