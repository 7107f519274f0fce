//! # Initiator
//!
//! The entry point for injecting new flows, and for resuming stashed
//! execution points. Same transactional discipline as a stage processor -
//! everything a lambda produces commits atomically - minus the incoming
//! message.

use std::sync::Arc;

use dashmap::DashMap;
use mats_shared::{MatsError, MatsResult, Sideloads};
use mats_trace::{Stash, StashError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info_span;

use crate::context::{InitiateContext, ProcessContext, StageExecution};
use crate::endpoint::EndpointInner;
use crate::factory::EngineShared;
use crate::processor::run_after_commit;
use crate::tx::TxContext;

/// Injects new flows under its own transactional context. Cheap to clone;
/// obtain via [`MatsFactory::initiator`](crate::factory::MatsFactory::initiator).
#[derive(Clone)]
pub struct Initiator {
    pub(crate) name: String,
    pub(crate) engine: Arc<EngineShared>,
    pub(crate) endpoints: Arc<DashMap<String, Arc<EndpointInner>>>,
}

impl std::fmt::Debug for Initiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Initiator").field("name", &self.name).finish()
    }
}

impl Initiator {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run an initiation lambda. Every message it pipelines commits
    /// atomically; on error nothing is sent. The factory's trace-id modifier
    /// is applied here - once per message, always on the original
    /// caller-supplied trace id.
    pub async fn initiate(
        &self,
        f: impl FnOnce(&mut InitiateContext) -> MatsResult<()>,
    ) -> MatsResult<()> {
        let external = self.engine.external();
        let mut tx = TxContext::open(&self.engine.broker, external.as_ref())?;

        let modifier = self.engine.trace_id_modifier();
        let mut ctx = InitiateContext::new(
            self.engine.clone(),
            self.name.clone(),
            None,
            modifier,
        );

        let span = info_span!("mats.initiate", initiator = %self.name);
        if let Err(e) = span.in_scope(|| f(&mut ctx)) {
            tx.rollback(None, true);
            return Err(e);
        }

        for message in ctx.messages.drain(..) {
            match message.into_wire(&self.engine.serializer) {
                Ok((channel, wire)) => tx.session_mut().stage(channel, wire),
                Err(e) => {
                    tx.rollback(None, true);
                    return Err(e);
                }
            }
        }
        tx.commit(None)
    }

    /// Thaw a [`ProcessContext::stash`] and resume the frozen execution
    /// point: the lambda runs as if the stage had just received the original
    /// message, on whatever thread and node this initiator lives on.
    ///
    /// Sideloads are not part of a stash; whatever the continuation needs
    /// must travel with the caller. Unstashing the same bytes twice is not
    /// prevented - downstream stages may observe duplicates.
    pub async fn unstash<S, I, F>(&self, stash_bytes: &[u8], f: F) -> MatsResult<()>
    where
        S: Serialize + DeserializeOwned + Default + 'static,
        I: DeserializeOwned + 'static,
        F: FnOnce(&mut ProcessContext<S>, I) -> MatsResult<()>,
    {
        let stash = Stash::decode(stash_bytes)?;
        if !self.engine.serializer.accepts_meta(&stash.serializer_meta) {
            return Err(MatsError::Stash(StashError::SerializerMismatch {
                written_by: stash.codec.clone(),
                installed: self.engine.serializer.id().to_string(),
            }));
        }

        // The stage must still exist here; the stash carries ids, not code.
        let endpoint = self
            .endpoints
            .get(&stash.endpoint_id)
            .ok_or_else(|| MatsError::UnknownEndpoint(stash.endpoint_id.clone()))?;
        if !endpoint
            .stages()
            .iter()
            .any(|s| s.stage_id == stash.stage_id)
        {
            return Err(MatsError::UnknownEndpoint(format!(
                "{} (endpoint {} has no such stage)",
                stash.stage_id, stash.endpoint_id
            )));
        }
        drop(endpoint);

        let mut trace = self
            .engine
            .serializer
            .deserialize_envelope(&stash.envelope, &stash.serializer_meta)?;
        // A fresh flow leg; the total count keeps running.
        trace.call_number = 0;

        let external = self.engine.external();
        let mut tx = TxContext::open(&self.engine.broker, external.as_ref())?;

        let span = info_span!(
            "mats.unstash",
            stage_id = %stash.stage_id,
            trace_id = %trace.trace_id,
            flow_id = %trace.flow_id,
        );
        let _guard = span.enter();

        let exec = StageExecution::new(
            self.engine.clone(),
            stash.endpoint_id.clone(),
            stash.stage_id.clone(),
            stash.next_stage_id.clone(),
            trace,
            stash.envelope.clone(),
            stash.serializer_meta.clone(),
            Sideloads::default(),
            stash.system_message_id.clone(),
            0,
            tx.attributes(),
        );
        let decoded = exec
            .decode_incoming_state::<S>()
            .and_then(|state| Ok((state, exec.decode_incoming_payload::<I>()?)));
        let (state, incoming) = match decoded {
            Ok(pair) => pair,
            Err(e) => {
                tx.rollback(None, true);
                return Err(e);
            }
        };
        let mut ctx = ProcessContext::new(exec, state);

        if let Err(e) = f(&mut ctx, incoming) {
            tx.rollback(None, true);
            return Err(e);
        }
        let mut exec = ctx.into_execution();
        if let Err(e) = exec.dispatch(&mut tx) {
            tx.rollback(None, true);
            return Err(e);
        }
        tx.commit(None)?;
        run_after_commit(exec.after_commit);
        Ok(())
    }
}
