//! # Transactional Context
//!
//! A [`TxContext`] brackets the receive+process+send cycle of one message (or
//! one initiation). It owns the broker session with its staged sends, an
//! optional external resource transaction (a database handle, typically), and
//! the attribute map through which user code reaches that resource.
//!
//! Commit order: external resource first, then broker. If the external commit
//! fails, the broker session rolls back and the message is redelivered. If
//! the broker commit fails after the external resource committed, that window
//! is logged loudly - the classic best-effort-1PC anomaly - and surfaces as
//! an error so the caller still sees a failed processing.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use mats_shared::{BrokerKind, BrokerSession, MatsError, MatsResult, Receipt};
use tracing::{error, warn};

/// Typed attribute map exposing co-transactional resources to user code.
#[derive(Default)]
pub struct TxAttributes {
    map: HashMap<(TypeId, Option<String>), Arc<dyn Any + Send + Sync>>,
}

impl TxAttributes {
    /// Register an attribute, optionally named (several attributes of one
    /// type are distinguished by name).
    pub fn put<T: Any + Send + Sync>(&mut self, name: Option<&str>, value: Arc<T>) {
        self.map
            .insert((TypeId::of::<T>(), name.map(str::to_string)), value);
    }

    pub fn get<T: Any + Send + Sync>(&self, name: Option<&str>) -> Option<Arc<T>> {
        self.map
            .get(&(TypeId::of::<T>(), name.map(str::to_string)))
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for TxAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxAttributes")
            .field("len", &self.map.len())
            .finish()
    }
}

/// An external resource that wants to commit/roll back together with the
/// broker, e.g. a database pool. `begin` runs once per message and may
/// populate the attribute map with whatever user code needs (a connection,
/// a transaction handle).
pub trait TransactionalResource: Send + Sync + fmt::Debug {
    fn begin(&self, attributes: &mut TxAttributes) -> MatsResult<Box<dyn ResourceTransaction>>;
}

/// One open external transaction.
pub trait ResourceTransaction: Send {
    fn commit(self: Box<Self>) -> MatsResult<()>;
    fn rollback(self: Box<Self>);
}

/// The transaction bracket around one message. See the module docs.
pub struct TxContext {
    session: BrokerSession,
    external: Option<Box<dyn ResourceTransaction>>,
    attributes: Arc<TxAttributes>,
}

impl fmt::Debug for TxContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxContext")
            .field("staged", &self.session.staged_count())
            .field("external", &self.external.is_some())
            .finish()
    }
}

impl TxContext {
    /// Open the bracket: broker session plus external resource, if one is
    /// installed on the factory.
    pub(crate) fn open(
        broker: &BrokerKind,
        resource: Option<&Arc<dyn TransactionalResource>>,
    ) -> MatsResult<Self> {
        let mut attributes = TxAttributes::default();
        let external = match resource {
            Some(r) => Some(r.begin(&mut attributes)?),
            None => None,
        };
        Ok(Self {
            session: broker.session(),
            external,
            attributes: Arc::new(attributes),
        })
    }

    /// Shared view of the attribute map; contexts hold their own handle for
    /// the lambda's lifetime.
    pub(crate) fn attributes(&self) -> Arc<TxAttributes> {
        self.attributes.clone()
    }

    pub(crate) fn session_mut(&mut self) -> &mut BrokerSession {
        &mut self.session
    }

    /// Commit external resource then broker; see module docs for ordering
    /// rationale and the failure window.
    pub(crate) fn commit(self, ack: Option<&Receipt>) -> MatsResult<()> {
        if let Some(external) = self.external {
            if let Err(e) = external.commit() {
                warn!(error = %e, "external resource commit failed; rolling back broker session");
                self.session
                    .rollback(ack, true)
                    .map_err(MatsError::Broker)?;
                return Err(e);
            }
        }
        match self.session.commit(ack) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(
                    error = %e,
                    "broker commit failed AFTER external resource committed; \
                     the external side-effects are durable but the message will redeliver"
                );
                Err(MatsError::Broker(e))
            }
        }
    }

    /// Roll both back. `requeue` controls whether the incoming message goes
    /// back for redelivery or straight to the DLQ.
    pub(crate) fn rollback(self, nack: Option<&Receipt>, requeue: bool) {
        if let Some(external) = self.external {
            external.rollback();
        }
        if let Err(e) = self.session.rollback(nack, requeue) {
            error!(error = %e, "broker rollback failed; message will redeliver via visibility");
        }
    }
}
