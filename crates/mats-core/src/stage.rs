//! # Stage Runtime
//!
//! One stage owns its processor pool. Queue stages run two pools: ordinary
//! processors (stage concurrency) and an interactive carve-out
//! (max(1, concurrency/2)) consuming only interactive-flagged messages, so
//! latency-sensitive flows are not starved behind a saturated ordinary pool.
//! Topic stages run exactly one processor per process - more would duplicate
//! fan-out deliveries within the node.
//!
//! Stopping is cooperative: processors finish (commit or roll back) the
//! message in flight, then exit; stragglers are aborted after the graceful
//! deadline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mats_shared::ReceiveSelector;
use mats_trace::{Channel, MessagingModel};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::endpoint::ErasedStageFn;
use crate::factory::EngineShared;
use crate::processor;

pub(crate) struct StageRuntime {
    pub(crate) endpoint_id: String,
    pub(crate) stage_id: String,
    pub(crate) next_stage_id: Option<String>,
    pub(crate) incoming_type: &'static str,
    pub(crate) lambda: ErasedStageFn,
    /// Resolved broker channel this stage consumes from.
    pub(crate) channel: Channel,
    pub(crate) concurrency: usize,
    running: Mutex<Option<RunningStage>>,
    /// Processors with a live consumer. Compared against the expected pool
    /// size by `wait_for_receiving`.
    receiving: Arc<AtomicUsize>,
}

struct RunningStage {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    expected: usize,
}

impl std::fmt::Debug for StageRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRuntime")
            .field("stage_id", &self.stage_id)
            .field("channel", &self.channel)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl StageRuntime {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        endpoint_id: String,
        stage_id: String,
        next_stage_id: Option<String>,
        incoming_type: &'static str,
        lambda: ErasedStageFn,
        channel: Channel,
        concurrency: usize,
    ) -> Self {
        Self {
            endpoint_id,
            stage_id,
            next_stage_id,
            incoming_type,
            lambda,
            channel,
            concurrency,
            running: Mutex::new(None),
            receiving: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Pool sizes: (ordinary, interactive carve-out).
    fn pool_sizes(&self) -> (usize, usize) {
        match self.channel.model {
            MessagingModel::Topic => (1, 0),
            MessagingModel::Queue => (
                self.concurrency,
                mats_shared::FactoryConfig::interactive_concurrency(self.concurrency),
            ),
        }
    }

    pub(crate) fn start(self: &Arc<Self>, engine: Arc<EngineShared>) {
        let mut running = lock(&self.running);
        if running.is_some() {
            return;
        }
        let (ordinary, interactive) = self.pool_sizes();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(ordinary + interactive);

        for _ in 0..ordinary {
            handles.push(tokio::spawn(processor::run(
                engine.clone(),
                self.clone(),
                ReceiveSelector::Any,
                shutdown_rx.clone(),
            )));
        }
        for _ in 0..interactive {
            handles.push(tokio::spawn(processor::run(
                engine.clone(),
                self.clone(),
                ReceiveSelector::InteractiveOnly,
                shutdown_rx.clone(),
            )));
        }

        info!(
            stage_id = %self.stage_id,
            channel = %self.channel,
            incoming_type = self.incoming_type,
            ordinary,
            interactive,
            "stage started"
        );
        *running = Some(RunningStage {
            shutdown: shutdown_tx,
            handles,
            expected: ordinary + interactive,
        });
    }

    /// Signal stop, wait up to the graceful deadline for processors to wind
    /// down, abort the rest. Returns whether everything exited in time.
    pub(crate) async fn stop(&self, graceful_millis: u64) -> bool {
        let Some(running) = lock(&self.running).take() else {
            return true;
        };
        // Processors see the change on their next select; the in-flight
        // message (if any) finishes normally first.
        let _ = running.shutdown.send(true);

        // Borrowed waits keep the handles available for abort() after the
        // timeout.
        let drain = futures::future::join_all(running.handles.iter().map(wait_handle));
        let clean = tokio::time::timeout(Duration::from_millis(graceful_millis), drain)
            .await
            .is_ok();
        if !clean {
            warn!(stage_id = %self.stage_id, "graceful stop timed out; aborting processors");
            for handle in &running.handles {
                handle.abort();
            }
        }
        self.receiving.store(0, Ordering::SeqCst);
        info!(stage_id = %self.stage_id, clean, "stage stopped");
        clean
    }

    pub(crate) fn is_receiving(&self) -> bool {
        let expected = lock(&self.running).as_ref().map_or(0, |r| r.expected);
        expected > 0 && self.receiving.load(Ordering::SeqCst) >= expected
    }

    pub(crate) fn mark_receiving(&self) {
        self.receiving.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn unmark_receiving(&self) {
        // Saturating: stop() may have already reset the counter.
        let _ = self
            .receiving
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }
}

/// Await a borrowed join handle's completion without consuming it.
async fn wait_handle(handle: &JoinHandle<()>) {
    while !handle.is_finished() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
