use crate::protocol::{BusMessage, Delivery, Envelope, MessageBus};
use async_trait::async_trait;
use chrono::Utc;
use delegor_core::DelegorResult;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace};
use uuid::Uuid;

/// How often a blocked consumer re-checks for expired in-flight messages.
const SWEEP_TICK: Duration = Duration::from_millis(20);

struct InFlight {
    envelope: Envelope,
    redeliver_at: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Envelope>,
    in_flight: HashMap<Uuid, InFlight>,
}

struct BusInner {
    queues: Mutex<HashMap<String, QueueState>>,
    notify: Notify,
    visibility: Duration,
    shutdown: AtomicBool,
}

/// In-memory broker with at-least-once semantics.
///
/// Each queue is a FIFO of ready envelopes plus an in-flight map. A consumed
/// envelope stays in flight until acked; if the visibility timeout elapses
/// first it moves back to the ready queue with a bumped attempt counter.
/// Redelivery is swept lazily on consume, so no background task is needed.
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<BusInner>,
}

impl InMemoryBus {
    /// Create a bus with the default 30s visibility timeout.
    pub fn new() -> Self {
        Self::with_visibility_timeout(Duration::from_secs(30))
    }

    /// Create a bus redelivering unacked messages after `visibility`.
    pub fn with_visibility_timeout(visibility: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                queues: Mutex::new(HashMap::new()),
                notify: Notify::new(),
                visibility,
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Messages currently ready (not in flight) on `queue`.
    pub async fn ready_len(&self, queue: &str) -> usize {
        let queues = self.inner.queues.lock().await;
        queues.get(queue).map_or(0, |s| s.ready.len())
    }

    /// Messages currently in flight (consumed, unacked) on `queue`.
    pub async fn in_flight_len(&self, queue: &str) -> usize {
        let queues = self.inner.queues.lock().await;
        queues.get(queue).map_or(0, |s| s.in_flight.len())
    }

    fn sweep_expired(state: &mut QueueState, now: Instant) {
        let expired: Vec<Uuid> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.redeliver_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(mut flight) = state.in_flight.remove(&id) {
                flight.envelope.attempt += 1;
                trace!(envelope = %id, attempt = flight.envelope.attempt, "redelivering unacked message");
                state.ready.push_back(flight.envelope);
            }
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, queue: &str, message: BusMessage) -> DelegorResult<()> {
        let envelope = Envelope {
            id: Uuid::new_v4(),
            queue: queue.to_string(),
            attempt: 1,
            enqueued_at: Utc::now(),
            message,
        };
        {
            let mut queues = self.inner.queues.lock().await;
            queues
                .entry(queue.to_string())
                .or_default()
                .ready
                .push_back(envelope);
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn publish_delayed(
        &self,
        queue: &str,
        message: BusMessage,
        delay: Duration,
    ) -> DelegorResult<()> {
        let bus = self.clone();
        let queue = queue.to_string();
        debug!(queue = %queue, delay_ms = delay.as_millis() as u64, "scheduling delayed publish");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !bus.inner.shutdown.load(Ordering::SeqCst) {
                let _ = bus.publish(&queue, message).await;
            }
        });
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Option<Delivery> {
        loop {
            if self.inner.shutdown.load(Ordering::SeqCst) {
                return None;
            }
            {
                let mut queues = self.inner.queues.lock().await;
                let state = queues.entry(queue.to_string()).or_default();
                let now = Instant::now();
                Self::sweep_expired(state, now);
                if let Some(envelope) = state.ready.pop_front() {
                    state.in_flight.insert(
                        envelope.id,
                        InFlight {
                            envelope: envelope.clone(),
                            redeliver_at: now + self.inner.visibility,
                        },
                    );
                    return Some(Delivery { envelope });
                }
            }
            // Wake on publish, or tick to sweep visibility expiries.
            let _ = tokio::time::timeout(SWEEP_TICK, self.inner.notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> DelegorResult<()> {
        let mut queues = self.inner.queues.lock().await;
        if let Some(state) = queues.get_mut(&delivery.envelope.queue) {
            // A late ack after redelivery finds nothing; at-least-once permits it.
            state.in_flight.remove(&delivery.envelope.id);
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }
}
