//! # mats-shared
//!
//! Shared building blocks for the Mats engine: the error taxonomy, factory
//! configuration, wire-level types, destination naming and the broker
//! capability with its in-memory provider.

pub mod broker;
pub mod config;
pub mod destination;
pub mod error;
pub mod wire;

pub use broker::{
    BrokerConsumer, BrokerKind, BrokerSession, DeadLetter, InMemoryBroker, QueueStats,
    ReceiveSelector, ReceivedMessage, Receipt,
};
pub use config::{FactoryConfig, FlowViolation};
pub use destination::DestinationResolver;
pub use error::{BrokerError, MatsError, MatsResult};
pub use wire::{MessageType, Sideloads, WireHeaders, WireMessage};
