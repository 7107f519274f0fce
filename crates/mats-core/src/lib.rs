//! # mats-core
//!
//! The Mats engine: a multi-stage, message-oriented RPC layer that runs a
//! stateful, stack-aware call protocol over a transactional broker. Services
//! decompose into *endpoints* of one or more *stages*; every stage is an
//! independent, competitively consumed unit of work, and flows between them
//! survive crashes and node hops because each message carries its complete
//! execution state.
//!
//! ```no_run
//! use mats_core::MatsFactory;
//! use mats_shared::{BrokerKind, FactoryConfig, MatsResult};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Dto {
//!     number: i64,
//! }
//!
//! # async fn example() -> MatsResult<()> {
//! let factory = MatsFactory::create(
//!     FactoryConfig::new("OrderService", "1.0.0"),
//!     BrokerKind::in_memory(5),
//! );
//!
//! factory.single::<Dto, Dto, _>("Order.double", |_ctx, incoming| {
//!     Ok(Dto { number: incoming.number * 2 })
//! })?;
//!
//! factory
//!     .initiator("demo")
//!     .initiate(|init| {
//!         init.trace_id("demo-1").to("Order.double");
//!         init.reply_to("Order.terminator", &())?;
//!         init.request(&Dto { number: 21 })
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod endpoint;
pub mod factory;
pub mod initiator;
pub mod interceptor;
pub mod message;
mod processor;
mod stage;
pub mod tx;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use context::{InitiateContext, ProcessContext};
pub use endpoint::{EndpointHandle, EndpointState, EndpointStatus};
pub use factory::MatsFactory;
pub use initiator::Initiator;
pub use interceptor::{InterceptContext, MatsInterceptor};
pub use message::PreparedOutgoing;
pub use tx::{ResourceTransaction, TransactionalResource, TxAttributes, TxContext};

// The shared surface applications always touch alongside the engine.
pub use mats_shared::{BrokerKind, FactoryConfig, FlowViolation, MatsError, MatsResult};
