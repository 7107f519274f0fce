//! # In-Memory Broker
//!
//! Complete single-process implementation of the broker capability: queues
//! with competitive consumption, interactive-first priority, visibility of
//! delivery counts, redelivery with per-queue dead-lettering, topic fan-out,
//! and TTL expiry.
//!
//! Consumers wake on a [`Notify`] when work arrives and additionally poll on
//! a short fallback interval, so a lost wakeup race costs one tick instead of
//! a hang.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mats_trace::{Channel, MessagingModel};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{DeadLetter, QueueStats, ReceiveSelector, ReceivedMessage, Receipt};
use crate::error::BrokerError;
use crate::wire::WireMessage;

/// Fallback poll interval for queue consumers.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    max_redeliveries: u32,
    state: Mutex<State>,
    /// Wakes queue consumers on publish, requeue and close.
    wakeup: Notify,
    closed: AtomicBool,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, QueueState>,
    topics: HashMap<String, Vec<mpsc::UnboundedSender<ReceivedMessage>>>,
    in_flight: HashMap<Uuid, InFlight>,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Delivery>,
    dlq: VecDeque<DeadLetter>,
    expired: u64,
}

#[derive(Debug, Clone)]
struct Delivery {
    wire: WireMessage,
    system_message_id: String,
    delivery_count: u32,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
struct InFlight {
    queue: String,
    delivery: Delivery,
}

impl QueueState {
    fn drop_expired(&mut self, now: Instant) {
        let before = self.ready.len();
        self.ready
            .retain(|d| d.expires_at.is_none_or(|deadline| deadline > now));
        let dropped = before - self.ready.len();
        if dropped > 0 {
            self.expired += dropped as u64;
            debug!(dropped, "dropped expired messages");
        }
    }

    fn take_matching(&mut self, selector: ReceiveSelector) -> Option<Delivery> {
        // Interactive messages jump the line even for ordinary consumers.
        let interactive_pos = self.ready.iter().position(|d| d.wire.headers.interactive);
        let pos = match selector {
            ReceiveSelector::InteractiveOnly => interactive_pos,
            ReceiveSelector::Any => {
                interactive_pos.or_else(|| (!self.ready.is_empty()).then_some(0))
            }
        };
        pos.and_then(|p| self.ready.remove(p))
    }
}

impl InMemoryBroker {
    pub fn new(max_redeliveries: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                max_redeliveries,
                state: Mutex::new(State::default()),
                wakeup: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub(super) fn ensure_channel(&self, channel: &Channel) {
        let mut state = self.lock_state();
        match channel.model {
            MessagingModel::Queue => {
                state.queues.entry(channel.id.clone()).or_default();
            }
            MessagingModel::Topic => {
                state.topics.entry(channel.id.clone()).or_default();
            }
        }
    }

    pub(super) fn consumer(
        &self,
        channel: &Channel,
        selector: ReceiveSelector,
    ) -> Result<InMemoryConsumer, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::closed("broker is shut down"));
        }
        match channel.model {
            MessagingModel::Queue => {
                self.ensure_channel(channel);
                Ok(InMemoryConsumer {
                    inner: ConsumerImpl::Queue {
                        shared: self.shared.clone(),
                        queue_id: channel.id.clone(),
                        selector,
                    },
                })
            }
            MessagingModel::Topic => {
                // Subscription is live once the sender is registered; a
                // publish after this point cannot be missed.
                let (tx, rx) = mpsc::unbounded_channel();
                self.lock_state()
                    .topics
                    .entry(channel.id.clone())
                    .or_default()
                    .push(tx);
                Ok(InMemoryConsumer {
                    inner: ConsumerImpl::Topic { rx },
                })
            }
        }
    }

    pub(super) fn commit(
        &self,
        ack: Option<&Receipt>,
        staged: Vec<(Channel, WireMessage)>,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock_state();
        // Validate the ack before anything becomes visible.
        if let Some(receipt) = ack {
            if !receipt.is_topic() {
                state
                    .in_flight
                    .remove(&receipt.delivery_id)
                    .ok_or_else(|| BrokerError::UnknownReceipt(receipt.delivery_id.to_string()))?;
            }
        }

        for (channel, wire) in staged {
            match channel.model {
                MessagingModel::Queue => {
                    let delivery = Delivery::fresh(wire);
                    state
                        .queues
                        .entry(channel.id)
                        .or_default()
                        .ready
                        .push_back(delivery);
                }
                MessagingModel::Topic => {
                    if let Some(subscribers) = state.topics.get_mut(&channel.id) {
                        subscribers.retain(|tx| !tx.is_closed());
                        for tx in subscribers.iter() {
                            let received = ReceivedMessage {
                                wire: wire.clone(),
                                system_message_id: Uuid::now_v7().to_string(),
                                delivery_count: 1,
                                receipt: Receipt {
                                    channel_id: channel.id.clone(),
                                    model: MessagingModel::Topic,
                                    delivery_id: Uuid::new_v4(),
                                },
                            };
                            // A dropped subscriber is not a send failure.
                            let _ = tx.send(received);
                        }
                    }
                }
            }
        }
        drop(state);
        self.shared.wakeup.notify_waiters();
        Ok(())
    }

    pub(super) fn nack(&self, receipt: &Receipt, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.lock_state();
        let entry = state
            .in_flight
            .remove(&receipt.delivery_id)
            .ok_or_else(|| BrokerError::UnknownReceipt(receipt.delivery_id.to_string()))?;

        let max_redeliveries = self.shared.max_redeliveries;
        let queue = state.queues.entry(entry.queue).or_default();
        if requeue && entry.delivery.delivery_count <= max_redeliveries {
            // Redeliver promptly, ahead of newer messages.
            queue.ready.push_front(entry.delivery);
            drop(state);
            self.shared.wakeup.notify_waiters();
        } else {
            warn!(
                system_message_id = %entry.delivery.system_message_id,
                delivery_count = entry.delivery.delivery_count,
                "dead-lettering message"
            );
            queue.dlq.push_back(DeadLetter {
                wire: entry.delivery.wire,
                system_message_id: entry.delivery.system_message_id,
                delivery_count: entry.delivery.delivery_count,
            });
        }
        Ok(())
    }

    pub(super) fn queue_stats(&self, channel_id: &str) -> QueueStats {
        let state = self.lock_state();
        let in_flight = state
            .in_flight
            .values()
            .filter(|f| f.queue == channel_id)
            .count();
        match state.queues.get(channel_id) {
            Some(q) => QueueStats {
                depth: q.ready.len(),
                in_flight,
                dlq_depth: q.dlq.len(),
                expired: q.expired,
            },
            None => QueueStats::default(),
        }
    }

    pub(super) fn dlq_peek(&self, channel_id: &str) -> Vec<DeadLetter> {
        self.lock_state()
            .queues
            .get(channel_id)
            .map(|q| q.dlq.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(super) fn dlq_pop(&self, channel_id: &str) -> Option<DeadLetter> {
        self.lock_state()
            .queues
            .get_mut(channel_id)
            .and_then(|q| q.dlq.pop_front())
    }

    pub(super) fn health_check(&self) -> bool {
        !self.is_closed()
    }

    pub(super) fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        // Dropping topic senders ends topic consumers; the notify ends
        // queue consumers.
        self.lock_state().topics.clear();
        self.shared.wakeup.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Delivery {
    fn fresh(wire: WireMessage) -> Self {
        let expires_at = (wire.headers.ttl_millis > 0)
            .then(|| Instant::now() + Duration::from_millis(wire.headers.ttl_millis));
        Self {
            wire,
            system_message_id: Uuid::now_v7().to_string(),
            delivery_count: 0,
            expires_at,
        }
    }
}

/// Consumer handle; queue consumers compete, topic consumers each see every
/// published message.
#[derive(Debug)]
pub struct InMemoryConsumer {
    inner: ConsumerImpl,
}

#[derive(Debug)]
enum ConsumerImpl {
    Queue {
        shared: Arc<Shared>,
        queue_id: String,
        selector: ReceiveSelector,
    },
    Topic {
        rx: mpsc::UnboundedReceiver<ReceivedMessage>,
    },
}

impl InMemoryConsumer {
    pub(super) async fn next(&mut self) -> Result<ReceivedMessage, BrokerError> {
        match &mut self.inner {
            ConsumerImpl::Topic { rx } => rx
                .recv()
                .await
                .ok_or_else(|| BrokerError::closed("topic subscription ended")),
            ConsumerImpl::Queue {
                shared,
                queue_id,
                selector,
            } => loop {
                if shared.closed.load(Ordering::SeqCst) {
                    return Err(BrokerError::closed("broker is shut down"));
                }
                let claimed = {
                    let mut state = shared
                        .state
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    let queue = state.queues.entry(queue_id.clone()).or_default();
                    queue.drop_expired(Instant::now());
                    match queue.take_matching(*selector) {
                        Some(mut delivery) => {
                            delivery.delivery_count += 1;
                            let delivery_id = Uuid::new_v4();
                            let received = ReceivedMessage {
                                wire: delivery.wire.clone(),
                                system_message_id: delivery.system_message_id.clone(),
                                delivery_count: delivery.delivery_count,
                                receipt: Receipt {
                                    channel_id: queue_id.clone(),
                                    model: MessagingModel::Queue,
                                    delivery_id,
                                },
                            };
                            state.in_flight.insert(
                                delivery_id,
                                InFlight {
                                    queue: queue_id.clone(),
                                    delivery,
                                },
                            );
                            Some(received)
                        }
                        None => None,
                    }
                };
                if let Some(received) = claimed {
                    return Ok(received);
                }
                tokio::select! {
                    _ = shared.wakeup.notified() => {}
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            },
        }
    }
}
