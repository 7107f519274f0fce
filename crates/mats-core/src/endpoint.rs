//! # Endpoints
//!
//! An endpoint is an ordered list of stages sharing a state type. Stages are
//! appended in declaration order - each gets a generated stage id, and the
//! previous stage learns its `next_stage_id` when the list is sealed at
//! `finish_setup`. After sealing the metadata is immutable, so the runtime
//! reads it without locks.
//!
//! Lifecycle: declared -> finished -> started -> stopped (-> removed via the
//! factory). A factory-wide hold flag defers starting until the factory
//! itself starts (cache warm-up scenarios).

use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, OnceLock};

use mats_shared::{DestinationResolver, MatsError, MatsResult};
use mats_trace::MessagingModel;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::{ProcessContext, StageExecution};
use crate::factory::{EngineShared, FactoryInner};
use crate::stage::StageRuntime;

/// Erased stage lambda: takes the per-message execution record by value,
/// hands it back for dispatch.
pub(crate) type ErasedStageFn =
    Arc<dyn Fn(StageExecution) -> MatsResult<StageExecution> + Send + Sync>;

/// Bound every endpoint state type satisfies.
pub trait EndpointState: Serialize + DeserializeOwned + Default + 'static {}
impl<T: Serialize + DeserializeOwned + Default + 'static> EndpointState for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStatus {
    /// Declared on the factory; stages may still be added.
    Declared,
    /// Sealed; stage list immutable, not yet consuming.
    Finished,
    /// Processors running.
    Started,
    Stopped,
}

/// A stage registered but not yet sealed.
struct PendingStage {
    incoming_type: &'static str,
    lambda: ErasedStageFn,
    concurrency: Option<usize>,
}

impl std::fmt::Debug for PendingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingStage")
            .field("incoming_type", &self.incoming_type)
            .finish()
    }
}

/// Factory-owned endpoint record. Shared with handles and the registry.
#[derive(Debug)]
pub(crate) struct EndpointInner {
    pub(crate) id: String,
    pub(crate) subscription: bool,
    pub(crate) state_type: &'static str,
    pub(crate) reply_type: &'static str,
    pub(crate) engine: Arc<EngineShared>,
    pending: Mutex<Vec<PendingStage>>,
    stages: OnceLock<Vec<Arc<StageRuntime>>>,
    status: Mutex<EndpointStatus>,
}

impl EndpointInner {
    pub(crate) fn new(
        id: String,
        subscription: bool,
        state_type: &'static str,
        reply_type: &'static str,
        engine: Arc<EngineShared>,
    ) -> Self {
        Self {
            id,
            subscription,
            state_type,
            reply_type,
            engine,
            pending: Mutex::new(Vec::new()),
            stages: OnceLock::new(),
            status: Mutex::new(EndpointStatus::Declared),
        }
    }

    pub(crate) fn status(&self) -> EndpointStatus {
        *lock(&self.status)
    }

    fn set_status(&self, status: EndpointStatus) {
        *lock(&self.status) = status;
    }

    /// Sealed stage list; empty slice until `finish_setup`.
    pub(crate) fn stages(&self) -> &[Arc<StageRuntime>] {
        self.stages.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// The stage id for position `index`: the endpoint id itself for stage 0,
    /// `<endpointId>.stageN` after that.
    fn stage_id_for(&self, index: usize) -> String {
        if index == 0 {
            self.id.clone()
        } else {
            format!("{}.stage{}", self.id, index)
        }
    }

    fn add_stage(&self, stage: PendingStage) -> MatsResult<()> {
        if self.stages.get().is_some() {
            return Err(MatsError::config(format!(
                "endpoint {} is sealed; stages cannot be added after finish_setup",
                self.id
            )));
        }
        if self.subscription && !lock(&self.pending).is_empty() {
            return Err(MatsError::config(format!(
                "subscription endpoint {} allows exactly one stage",
                self.id
            )));
        }
        lock(&self.pending).push(stage);
        Ok(())
    }

    /// Seal the stage list. Computes stage ids, back-pointers and channels;
    /// starts the stages right away when the factory is running (and not
    /// holding).
    pub(crate) fn finish_setup(&self, factory: &FactoryInner) -> MatsResult<()> {
        if self.stages.get().is_some() {
            return Err(MatsError::lifecycle(format!(
                "endpoint {} already finished",
                self.id
            )));
        }
        let pending = std::mem::take(&mut *lock(&self.pending));
        if pending.is_empty() {
            return Err(MatsError::config(format!(
                "endpoint {} finished setup without any stages",
                self.id
            )));
        }

        let model = if self.subscription {
            MessagingModel::Topic
        } else {
            MessagingModel::Queue
        };
        let resolver: &DestinationResolver = &self.engine.resolver;
        let count = pending.len();

        let mut stages = Vec::with_capacity(count);
        for (index, stage) in pending.into_iter().enumerate() {
            let stage_id = self.stage_id_for(index);
            let next_stage_id = (index + 1 < count).then(|| self.stage_id_for(index + 1));
            let concurrency = if self.subscription {
                // Topic fan-out would duplicate work within one process.
                1
            } else {
                stage.concurrency.unwrap_or(self.engine.config.concurrency)
            };
            stages.push(Arc::new(StageRuntime::new(
                self.id.clone(),
                stage_id.clone(),
                next_stage_id,
                stage.incoming_type,
                stage.lambda,
                resolver.channel(&stage_id, model),
                concurrency,
            )));
        }

        self.stages
            .set(stages)
            .map_err(|_| MatsError::lifecycle(format!("endpoint {} already finished", self.id)))?;
        self.set_status(EndpointStatus::Finished);

        // Endpoints go live as soon as they are finished, unless the factory
        // is holding them back for a coordinated start.
        if !factory.hold.load(Ordering::SeqCst) {
            self.start()?;
        }
        Ok(())
    }

    /// Spawn every stage's processors. Must run inside the tokio runtime.
    pub(crate) fn start(&self) -> MatsResult<()> {
        match self.status() {
            EndpointStatus::Finished | EndpointStatus::Stopped => {}
            EndpointStatus::Started => return Ok(()),
            EndpointStatus::Declared => {
                return Err(MatsError::lifecycle(format!(
                    "endpoint {} cannot start before finish_setup",
                    self.id
                )))
            }
        }
        for stage in self.stages() {
            stage.start(self.engine.clone());
        }
        self.set_status(EndpointStatus::Started);
        Ok(())
    }

    /// Stop all stages, waiting up to `graceful_millis` for in-flight work.
    /// Returns whether every processor exited within the deadline.
    pub(crate) async fn stop(&self, graceful_millis: u64) -> bool {
        let mut clean = true;
        for stage in self.stages() {
            clean &= stage.stop(graceful_millis).await;
        }
        self.set_status(EndpointStatus::Stopped);
        clean
    }

    /// True once every processor of every stage has a live consumer; for
    /// subscription endpoints this is the no-missed-messages guarantee.
    pub(crate) async fn wait_for_receiving(&self, timeout_millis: u64) -> bool {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_millis);
        loop {
            if self.stages().iter().all(|s| s.is_receiving()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Typed handle for building and controlling one endpoint. `S` is the state
/// shared across the endpoint's stages, `R` the reply type of the last stage.
pub struct EndpointHandle<S, R> {
    pub(crate) inner: Arc<EndpointInner>,
    pub(crate) factory: Arc<FactoryInner>,
    pub(crate) _types: PhantomData<fn() -> (S, R)>,
}

impl<S, R> std::fmt::Debug for EndpointHandle<S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("id", &self.inner.id)
            .field("status", &self.inner.status())
            .finish()
    }
}

impl<S: EndpointState, R: Serialize + 'static> EndpointHandle<S, R> {
    /// Append a stage. Stages run in declaration order; each consumes from
    /// its own channel.
    pub fn stage<I, F>(&self, f: F) -> MatsResult<()>
    where
        I: DeserializeOwned + 'static,
        F: Fn(&mut ProcessContext<S>, I) -> MatsResult<()> + Send + Sync + 'static,
    {
        self.inner.add_stage(PendingStage {
            incoming_type: std::any::type_name::<I>(),
            lambda: erase::<S, I, F>(f),
            concurrency: None,
        })
    }

    /// Append a stage with a per-stage concurrency override.
    pub fn stage_with_concurrency<I, F>(&self, concurrency: usize, f: F) -> MatsResult<()>
    where
        I: DeserializeOwned + 'static,
        F: Fn(&mut ProcessContext<S>, I) -> MatsResult<()> + Send + Sync + 'static,
    {
        self.inner.add_stage(PendingStage {
            incoming_type: std::any::type_name::<I>(),
            lambda: erase::<S, I, F>(f),
            concurrency: Some(concurrency),
        })
    }

    /// Append the final stage: the lambda's return value becomes the reply,
    /// and the endpoint is sealed.
    pub fn last_stage<I, F>(&self, f: F) -> MatsResult<()>
    where
        I: DeserializeOwned + 'static,
        F: Fn(&mut ProcessContext<S>, I) -> MatsResult<R> + Send + Sync + 'static,
    {
        self.stage::<I, _>(move |ctx, incoming| {
            let reply = f(ctx, incoming)?;
            ctx.reply(&reply)
        })?;
        self.finish_setup()
    }

    /// Seal the stage list; starts consuming immediately unless the factory
    /// is holding endpoints for a coordinated start.
    pub fn finish_setup(&self) -> MatsResult<()> {
        self.inner.finish_setup(&self.factory)
    }

    pub fn endpoint_id(&self) -> &str {
        &self.inner.id
    }

    pub fn status(&self) -> EndpointStatus {
        self.inner.status()
    }

    pub fn start(&self) -> MatsResult<()> {
        self.inner.start()
    }

    /// Stop, waiting up to `graceful_millis` for in-flight messages.
    pub async fn stop(&self, graceful_millis: u64) -> bool {
        self.inner.stop(graceful_millis).await
    }

    /// Wait until every processor is actually receiving. For subscription
    /// endpoints, publishes after this returns true cannot be missed.
    pub async fn wait_for_receiving(&self, timeout_millis: u64) -> bool {
        self.inner.wait_for_receiving(timeout_millis).await
    }
}

/// Wrap a typed stage lambda into the erased runtime form: decode state and
/// payload, run, hand the execution record back.
fn erase<S, I, F>(f: F) -> ErasedStageFn
where
    S: EndpointState,
    I: DeserializeOwned + 'static,
    F: Fn(&mut ProcessContext<S>, I) -> MatsResult<()> + Send + Sync + 'static,
{
    Arc::new(move |exec: StageExecution| {
        let state: S = exec.decode_incoming_state()?;
        let incoming: I = exec.decode_incoming_payload()?;
        let mut ctx = ProcessContext::new(exec, state);
        f(&mut ctx, incoming)?;
        Ok(ctx.into_execution())
    })
}
