//! # MatsFactory
//!
//! The root object: owns the endpoint registry, the broker and serializer
//! capabilities, factory-wide configuration, and the programmatic hooks
//! (interceptors, external transactional resource, initiate-trace-id
//! modifier). Endpoints and initiators are created here and nowhere else.
//!
//! Configuration is read often and written rarely: the hot path reads
//! `EngineShared` fields directly, and the rarely-written hooks sit behind
//! `RwLock`s that are cloned out per message.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use mats_shared::{
    BrokerKind, DestinationResolver, FactoryConfig, MatsError, MatsResult,
};
use mats_trace::SerializerKind;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::context::ProcessContext;
use crate::endpoint::{EndpointHandle, EndpointInner, EndpointState};
use crate::initiator::Initiator;
use crate::interceptor::MatsInterceptor;
use crate::tx::TransactionalResource;

/// Factory-installed trace-id modifier for outermost initiations.
pub(crate) type TraceIdModifier = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Everything the runtime needs per message, shared by endpoints, stages,
/// processors and initiators. Navigation is child-to-shared only, so there
/// are no ownership cycles with the registry.
pub(crate) struct EngineShared {
    pub(crate) config: FactoryConfig,
    pub(crate) broker: BrokerKind,
    pub(crate) serializer: SerializerKind,
    pub(crate) resolver: DestinationResolver,
    interceptors: RwLock<Vec<Arc<dyn MatsInterceptor>>>,
    external: RwLock<Option<Arc<dyn TransactionalResource>>>,
    trace_id_modifier: RwLock<Option<TraceIdModifier>>,
}

impl std::fmt::Debug for EngineShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineShared")
            .field("app_name", &self.config.app_name)
            .field("transport", &self.broker.transport_name())
            .finish()
    }
}

impl EngineShared {
    pub(crate) fn interceptors(&self) -> Vec<Arc<dyn MatsInterceptor>> {
        self.interceptors
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn external(&self) -> Option<Arc<dyn TransactionalResource>> {
        self.external
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn trace_id_modifier(&self) -> Option<TraceIdModifier> {
        self.trace_id_modifier
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug)]
pub(crate) struct FactoryInner {
    pub(crate) engine: Arc<EngineShared>,
    pub(crate) endpoints: Arc<DashMap<String, Arc<EndpointInner>>>,
    pub(crate) hold: AtomicBool,
    pub(crate) started: AtomicBool,
}

/// The factory. Cheap to clone; all clones share one registry.
#[derive(Debug, Clone)]
pub struct MatsFactory {
    inner: Arc<FactoryInner>,
}

impl MatsFactory {
    /// Create a factory on the given broker with the default (JSON)
    /// serializer.
    pub fn create(config: FactoryConfig, broker: BrokerKind) -> Self {
        Self::create_with_serializer(config, broker, SerializerKind::default())
    }

    pub fn create_with_serializer(
        config: FactoryConfig,
        broker: BrokerKind,
        serializer: SerializerKind,
    ) -> Self {
        let resolver = DestinationResolver::new(config.destination_prefix.clone());
        info!(
            app_name = %config.app_name,
            app_version = %config.app_version,
            nodename = %config.nodename,
            transport = broker.transport_name(),
            "creating MatsFactory"
        );
        Self {
            inner: Arc::new(FactoryInner {
                engine: Arc::new(EngineShared {
                    config,
                    broker,
                    serializer,
                    resolver,
                    interceptors: RwLock::new(Vec::new()),
                    external: RwLock::new(None),
                    trace_id_modifier: RwLock::new(None),
                }),
                endpoints: Arc::new(DashMap::new()),
                hold: AtomicBool::new(false),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.inner.engine.config
    }

    /// The underlying broker, e.g. for queue stats and DLQ inspection.
    pub fn broker(&self) -> &BrokerKind {
        &self.inner.engine.broker
    }

    // =========================================================================
    // Programmatic hooks
    // =========================================================================

    /// Append an interceptor; invocation order is installation order.
    pub fn add_interceptor(&self, interceptor: Arc<dyn MatsInterceptor>) {
        self.inner
            .engine
            .interceptors
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(interceptor);
    }

    /// Install the external transactional resource (e.g. a database pool)
    /// co-committed with every message.
    pub fn set_transactional_resource(&self, resource: Arc<dyn TransactionalResource>) {
        *self
            .inner
            .engine
            .external
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(resource);
    }

    /// Install the initiate-trace-id modifier, applied exactly once per
    /// outermost initiation (per message, on the original caller-supplied
    /// id). Stage-nested initiations are never passed through it.
    pub fn set_initiate_trace_id_modifier(
        &self,
        f: impl Fn(&str) -> String + Send + Sync + 'static,
    ) {
        *self
            .inner
            .engine
            .trace_id_modifier
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Arc::new(f));
    }

    // =========================================================================
    // Endpoint registration
    // =========================================================================

    /// Declare a multi-stage endpoint with state `S` and reply type `R`.
    pub fn staged<S: EndpointState, R: Serialize + 'static>(
        &self,
        endpoint_id: &str,
    ) -> MatsResult<EndpointHandle<S, R>> {
        self.register::<S, R>(endpoint_id, false)
    }

    /// Single-stage, stateless service endpoint: the lambda's return value
    /// is the reply.
    pub fn single<I, R, F>(&self, endpoint_id: &str, f: F) -> MatsResult<EndpointHandle<(), R>>
    where
        I: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(&mut ProcessContext<()>, I) -> MatsResult<R> + Send + Sync + 'static,
    {
        let handle = self.register::<(), R>(endpoint_id, false)?;
        handle.last_stage::<I, _>(f)?;
        Ok(handle)
    }

    /// Flow-terminating endpoint: receives sends and replies, produces
    /// nothing (unless it initiates new flows).
    pub fn terminator<I, S, F>(&self, endpoint_id: &str, f: F) -> MatsResult<EndpointHandle<S, ()>>
    where
        I: DeserializeOwned + 'static,
        S: EndpointState,
        F: Fn(&mut ProcessContext<S>, I) -> MatsResult<()> + Send + Sync + 'static,
    {
        let handle = self.register::<S, ()>(endpoint_id, false)?;
        handle.stage::<I, _>(f)?;
        handle.finish_setup()?;
        Ok(handle)
    }

    /// Topic-consuming terminator: every running instance receives every
    /// published message. Exactly one processor per process.
    pub fn subscription_terminator<I, S, F>(
        &self,
        endpoint_id: &str,
        f: F,
    ) -> MatsResult<EndpointHandle<S, ()>>
    where
        I: DeserializeOwned + 'static,
        S: EndpointState,
        F: Fn(&mut ProcessContext<S>, I) -> MatsResult<()> + Send + Sync + 'static,
    {
        let handle = self.register::<S, ()>(endpoint_id, true)?;
        handle.stage::<I, _>(f)?;
        handle.finish_setup()?;
        Ok(handle)
    }

    fn register<S: EndpointState, R: Serialize + 'static>(
        &self,
        endpoint_id: &str,
        subscription: bool,
    ) -> MatsResult<EndpointHandle<S, R>> {
        DestinationResolver::validate_endpoint_id(endpoint_id)?;

        let inner = Arc::new(EndpointInner::new(
            endpoint_id.to_string(),
            subscription,
            std::any::type_name::<S>(),
            std::any::type_name::<R>(),
            self.inner.engine.clone(),
        ));
        match self.inner.endpoints.entry(endpoint_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(MatsError::config(format!(
                    "duplicate endpointId {endpoint_id:?}"
                )))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(inner.clone());
            }
        }
        info!(
            endpoint_id,
            subscription,
            state_type = inner.state_type,
            reply_type = inner.reply_type,
            "endpoint declared"
        );
        Ok(EndpointHandle {
            inner,
            factory: self.inner.clone(),
            _types: PhantomData,
        })
    }

    /// An initiator bound to this factory. The name becomes the flows'
    /// default `from`.
    pub fn initiator(&self, name: impl Into<String>) -> Initiator {
        Initiator {
            name: name.into(),
            engine: self.inner.engine.clone(),
            endpoints: self.inner.endpoints.clone(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Defer starting finished endpoints until [`Self::start`] - for
    /// applications that must warm caches before consuming.
    pub fn hold_endpoints_until_factory_is_started(&self) {
        self.inner.hold.store(true, Ordering::SeqCst);
    }

    /// Start the factory: all finished endpoints begin consuming. Endpoints
    /// finishing setup after this point start immediately.
    pub fn start(&self) -> MatsResult<()> {
        self.inner.started.store(true, Ordering::SeqCst);
        self.inner.hold.store(false, Ordering::SeqCst);
        for entry in self.inner.endpoints.iter() {
            match entry.value().status() {
                crate::endpoint::EndpointStatus::Finished => entry.value().start()?,
                _ => {}
            }
        }
        info!(endpoints = self.inner.endpoints.len(), "MatsFactory started");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Wait until every started endpoint's processors are receiving.
    pub async fn wait_for_receiving(&self, timeout_millis: u64) -> bool {
        let endpoints: Vec<_> = self
            .inner
            .endpoints
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for endpoint in endpoints {
            if endpoint.status() == crate::endpoint::EndpointStatus::Started
                && !endpoint.wait_for_receiving(timeout_millis).await
            {
                return false;
            }
        }
        true
    }

    /// Stop everything: endpoints drain gracefully, then the broker closes.
    /// The factory holds no live state once this returns true.
    pub async fn stop(&self, graceful_millis: u64) -> bool {
        self.inner.started.store(false, Ordering::SeqCst);
        let endpoints: Vec<_> = self
            .inner
            .endpoints
            .iter()
            .map(|e| e.value().clone())
            .collect();

        let mut clean = true;
        for endpoint in endpoints {
            clean &= endpoint.stop(graceful_millis).await;
        }
        self.inner.engine.broker.close();
        self.inner.endpoints.clear();
        info!(clean, "MatsFactory stopped");
        clean
    }

    /// Stop (if needed) and unregister one endpoint, freeing its id for
    /// re-registration. Removal requires the endpoint to be stopped; the
    /// graceful period applies when it is still running.
    pub async fn remove(&self, endpoint_id: &str, graceful_millis: u64) -> bool {
        let Some(endpoint) = self
            .inner
            .endpoints
            .get(endpoint_id)
            .map(|e| e.value().clone())
        else {
            return false;
        };
        let clean = match endpoint.status() {
            crate::endpoint::EndpointStatus::Started => endpoint.stop(graceful_millis).await,
            _ => true,
        };
        self.inner.endpoints.remove(endpoint_id);
        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> MatsFactory {
        MatsFactory::create(
            FactoryConfig::new("TestApp", "0.1.0"),
            BrokerKind::in_memory(3),
        )
    }

    #[tokio::test]
    async fn duplicate_endpoint_id_fails_fast() {
        let factory = factory();
        factory
            .terminator::<String, (), _>("Dup", |_, _| Ok(()))
            .unwrap();
        let err = factory
            .terminator::<String, (), _>("Dup", |_, _| Ok(()))
            .unwrap_err();
        assert!(matches!(err, MatsError::Config(_)));
    }

    #[tokio::test]
    async fn invalid_endpoint_id_fails_fast() {
        let factory = factory();
        assert!(factory
            .terminator::<String, (), _>("has space", |_, _| Ok(()))
            .is_err());
    }

    #[tokio::test]
    async fn stage_after_finish_is_rejected() {
        let factory = factory();
        let handle = factory.staged::<(), String>("Sealed").unwrap();
        handle.stage::<String, _>(|_, _| Ok(())).unwrap();
        handle.finish_setup().unwrap();
        let err = handle.stage::<String, _>(|_, _| Ok(())).unwrap_err();
        assert!(matches!(err, MatsError::Config(_)));
    }

    #[tokio::test]
    async fn finish_without_stages_is_rejected() {
        let factory = factory();
        let handle = factory.staged::<(), String>("Empty").unwrap();
        assert!(matches!(
            handle.finish_setup().unwrap_err(),
            MatsError::Config(_)
        ));
    }

    #[tokio::test]
    async fn hold_defers_start_until_factory_starts() {
        let factory = factory();
        factory.hold_endpoints_until_factory_is_started();
        let handle = factory
            .terminator::<String, (), _>("Held", |_, _| Ok(()))
            .unwrap();
        assert_eq!(handle.status(), crate::endpoint::EndpointStatus::Finished);

        factory.start().unwrap();
        assert_eq!(handle.status(), crate::endpoint::EndpointStatus::Started);
        factory.stop(500).await;
    }

    #[tokio::test]
    async fn endpoints_start_at_finish_setup_without_hold() {
        let factory = factory();
        let handle = factory
            .terminator::<String, (), _>("Eager", |_, _| Ok(()))
            .unwrap();
        assert_eq!(handle.status(), crate::endpoint::EndpointStatus::Started);
        assert!(handle.wait_for_receiving(1000).await);
        factory.stop(500).await;
    }

    #[tokio::test]
    async fn remove_frees_the_id() {
        let factory = factory();
        factory
            .terminator::<String, (), _>("Gone", |_, _| Ok(()))
            .unwrap();
        assert!(factory.remove("Gone", 200).await);
        assert!(factory
            .terminator::<String, (), _>("Gone", |_, _| Ok(()))
            .is_ok());
        factory.stop(500).await;
    }

    #[tokio::test]
    async fn stop_clears_registry_and_closes_broker() {
        let factory = factory();
        factory
            .terminator::<String, (), _>("T", |_, _| Ok(()))
            .unwrap();
        factory.start().unwrap();
        assert!(factory.wait_for_receiving(1000).await);
        assert!(factory.stop(1000).await);
        assert!(!factory.broker().health_check());
    }
}
