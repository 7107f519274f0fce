//! # Test Utilities
//!
//! Latches and fixtures for integration-testing Mats applications against
//! the in-memory broker. Feature-gated behind `test-utils` so production
//! builds never carry them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use mats_shared::{BrokerKind, FactoryConfig, MatsResult, Sideloads};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::context::ProcessContext;
use crate::factory::MatsFactory;

/// Everything a latched terminator invocation captured.
#[derive(Debug, Clone)]
pub struct LatchedMessage<I, S> {
    pub payload: I,
    pub state: S,
    pub trace_id: String,
    pub flow_id: String,
    pub total_call_number: u32,
    /// Serialized trace-property map as it arrived.
    pub trace_properties: BTreeMap<String, String>,
    pub sideloads: Sideloads,
}

/// A latch to park a test on until a terminator has been invoked N times.
/// Create one, register its [`handler`](Self::handler) as the terminator
/// lambda, and await the invocations.
#[derive(Debug)]
pub struct TestLatch<I, S> {
    tx: mpsc::UnboundedSender<LatchedMessage<I, S>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<LatchedMessage<I, S>>>,
}

impl<I, S> TestLatch<I, S>
where
    I: Send + 'static,
    S: Clone + Serialize + Send + 'static,
{
    #[allow(clippy::new_without_default)]
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    /// A terminator lambda that records each invocation on this latch.
    pub fn handler(
        self: &Arc<Self>,
    ) -> impl Fn(&mut ProcessContext<S>, I) -> MatsResult<()> + Send + Sync + 'static {
        let latch = self.clone();
        move |ctx, payload| {
            // The receiver may be gone when the test already finished.
            let _ = latch.tx.send(LatchedMessage {
                payload,
                state: ctx.state().clone(),
                trace_id: ctx.trace_id().to_string(),
                flow_id: ctx.flow_id().to_string(),
                total_call_number: ctx.total_call_number(),
                trace_properties: ctx.trace_properties().clone(),
                sideloads: ctx.incoming_sideloads().clone(),
            });
            Ok(())
        }
    }

    /// Wait for the next invocation, `None` on timeout.
    pub async fn await_one(&self, timeout: Duration) -> Option<LatchedMessage<I, S>> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Wait for `n` invocations; returns what arrived within the timeout
    /// (shorter than `n` on timeout).
    pub async fn await_n(&self, n: usize, timeout: Duration) -> Vec<LatchedMessage<I, S>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut messages = Vec::with_capacity(n);
        let mut rx = self.rx.lock().await;
        while messages.len() < n {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(message)) => messages.push(message),
                _ => break,
            }
        }
        messages
    }

    /// Assert nothing (more) arrives within the window.
    pub async fn assert_quiet(&self, window: Duration) {
        let mut rx = self.rx.lock().await;
        if let Ok(Some(_)) = tokio::time::timeout(window, rx.recv()).await {
            panic!("latch received a message while expecting silence");
        }
    }
}

/// A factory on a fresh in-memory broker, redelivery limit taken from the
/// config. The standard fixture for integration tests.
pub fn test_factory(app_name: &str) -> MatsFactory {
    let config = FactoryConfig::new(app_name, "test");
    let broker = BrokerKind::in_memory(config.max_redeliveries);
    MatsFactory::create(config, broker)
}

/// Same, with a config-tweaking hook (strictness, limits, concurrency).
pub fn test_factory_with(app_name: &str, tweak: impl FnOnce(&mut FactoryConfig)) -> MatsFactory {
    let mut config = FactoryConfig::new(app_name, "test");
    tweak(&mut config);
    let broker = BrokerKind::in_memory(config.max_redeliveries);
    MatsFactory::create(config, broker)
}

/// Unique id for endpoints/trace ids so parallel tests never collide.
pub fn unique_id(prefix: &str) -> String {
    format!("{}.{}", prefix, Uuid::new_v4().simple())
}
