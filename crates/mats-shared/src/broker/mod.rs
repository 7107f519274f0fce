//! # Broker Capability
//!
//! Transactional send/receive on named queues and topics, with dead-lettering
//! on redelivery exhaustion. The engine consumes exactly this surface; which
//! transport backs it is a deployment concern.
//!
//! Dispatch is by enum ([`BrokerKind`]), not trait objects - concrete types
//! on the hot path, new transports as new variants.
//!
//! ## Transaction model
//!
//! A [`BrokerSession`] stages outgoing messages in memory. `commit` makes the
//! ack of the in-flight incoming message and the publication of every staged
//! message atomic; `rollback` drops the staged messages and returns the
//! incoming message for redelivery (or straight to the DLQ when requeue is
//! declined). Redelivery past the configured limit dead-letters the message
//! with its full envelope intact.

pub mod in_memory;

use mats_trace::{Channel, MessagingModel};

use crate::error::BrokerError;
use crate::wire::WireMessage;

pub use in_memory::InMemoryBroker;

/// Which messages a consumer is willing to take from a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveSelector {
    /// Anything, interactive-flagged messages first.
    Any,
    /// Only interactive-flagged messages (the carve-out pool).
    InteractiveOnly,
}

/// Opaque handle to one in-flight delivery; required for ack/nack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub(crate) channel_id: String,
    pub(crate) model: MessagingModel,
    pub(crate) delivery_id: uuid::Uuid,
}

impl Receipt {
    /// The channel this delivery came from.
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Topic deliveries are fire-and-forget; ack/nack are no-ops on them.
    pub fn is_topic(&self) -> bool {
        self.model == MessagingModel::Topic
    }
}

/// One delivery handed to a consumer.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub wire: WireMessage,
    /// Broker-assigned id of this message, stable across redeliveries.
    pub system_message_id: String,
    /// How many times this message has been delivered, this one included.
    pub delivery_count: u32,
    pub receipt: Receipt,
}

/// Queue observability snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub depth: usize,
    pub in_flight: usize,
    pub dlq_depth: usize,
    /// Messages dropped because their time-to-live ran out.
    pub expired: u64,
}

/// A dead-lettered message, with the reason it was parked.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub wire: WireMessage,
    pub system_message_id: String,
    pub delivery_count: u32,
}

/// Enum dispatch over the installed broker transport.
#[derive(Debug, Clone)]
pub enum BrokerKind {
    InMemory(InMemoryBroker),
    // Other transports (AMQP, JMS bridges) plug in as variants.
}

impl BrokerKind {
    pub fn in_memory(max_redeliveries: u32) -> Self {
        Self::InMemory(InMemoryBroker::new(max_redeliveries))
    }

    pub fn transport_name(&self) -> &'static str {
        match self {
            Self::InMemory(_) => "in_memory",
        }
    }

    /// Make sure the channel exists. Queues are also created implicitly on
    /// first send or receive; this is for startup determinism.
    pub fn ensure_channel(&self, channel: &Channel) {
        match self {
            Self::InMemory(b) => b.ensure_channel(channel),
        }
    }

    /// Create a consumer on the channel. For topics this registers the
    /// subscription immediately: messages published after this call returns
    /// are guaranteed to reach the consumer.
    pub fn consumer(
        &self,
        channel: &Channel,
        selector: ReceiveSelector,
    ) -> Result<BrokerConsumer, BrokerError> {
        match self {
            Self::InMemory(b) => Ok(BrokerConsumer {
                inner: ConsumerInner::InMemory(b.consumer(channel, selector)?),
            }),
        }
    }

    /// Open a transactional session for one receive/process/send cycle (or
    /// one initiation).
    pub fn session(&self) -> BrokerSession {
        BrokerSession {
            broker: self.clone(),
            staged: Vec::new(),
        }
    }

    pub fn queue_stats(&self, channel_id: &str) -> QueueStats {
        match self {
            Self::InMemory(b) => b.queue_stats(channel_id),
        }
    }

    /// Inspect a queue's dead letters without consuming them.
    pub fn dlq_peek(&self, channel_id: &str) -> Vec<DeadLetter> {
        match self {
            Self::InMemory(b) => b.dlq_peek(channel_id),
        }
    }

    /// Consume the oldest dead letter of a queue.
    pub fn dlq_pop(&self, channel_id: &str) -> Option<DeadLetter> {
        match self {
            Self::InMemory(b) => b.dlq_pop(channel_id),
        }
    }

    pub fn health_check(&self) -> bool {
        match self {
            Self::InMemory(b) => b.health_check(),
        }
    }

    /// Close the broker: wake all consumers with [`BrokerError::Closed`] and
    /// drop topic subscriptions.
    pub fn close(&self) {
        match self {
            Self::InMemory(b) => b.close(),
        }
    }

    fn commit(
        &self,
        ack: Option<&Receipt>,
        staged: Vec<(Channel, WireMessage)>,
    ) -> Result<(), BrokerError> {
        match self {
            Self::InMemory(b) => b.commit(ack, staged),
        }
    }

    fn nack(&self, receipt: &Receipt, requeue: bool) -> Result<(), BrokerError> {
        match self {
            Self::InMemory(b) => b.nack(receipt, requeue),
        }
    }
}

/// Blocking-iterator-style consumer handle. One per processor.
#[derive(Debug)]
pub struct BrokerConsumer {
    inner: ConsumerInner,
}

#[derive(Debug)]
enum ConsumerInner {
    InMemory(in_memory::InMemoryConsumer),
}

impl BrokerConsumer {
    /// Wait for the next delivery. Cancel-safe: dropping the future between
    /// polls never loses a claimed message.
    pub async fn next(&mut self) -> Result<ReceivedMessage, BrokerError> {
        match &mut self.inner {
            ConsumerInner::InMemory(c) => c.next().await,
        }
    }
}

/// Stages outgoing messages until commit. See the module docs.
#[derive(Debug)]
pub struct BrokerSession {
    broker: BrokerKind,
    staged: Vec<(Channel, WireMessage)>,
}

impl BrokerSession {
    /// Buffer a message for atomic publication at commit.
    pub fn stage(&mut self, channel: Channel, message: WireMessage) {
        self.staged.push((channel, message));
    }

    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    /// Atomically ack the in-flight message (if any) and publish everything
    /// staged. On error nothing has been published.
    pub fn commit(self, ack: Option<&Receipt>) -> Result<(), BrokerError> {
        self.broker.commit(ack, self.staged)
    }

    /// Drop all staged messages. The in-flight message (if any) goes back to
    /// its queue for redelivery when `requeue` is set, otherwise straight to
    /// the DLQ. Redelivery past the broker's limit dead-letters regardless.
    pub fn rollback(self, nack: Option<&Receipt>, requeue: bool) -> Result<(), BrokerError> {
        drop(self.staged);
        match nack {
            Some(receipt) if !receipt.is_topic() => self.broker.nack(receipt, requeue),
            _ => Ok(()),
        }
    }
}
