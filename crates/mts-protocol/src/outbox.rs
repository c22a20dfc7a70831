/// OutBox: the bounded outbound queue shared by all deliverer workers.
///
/// Messages are kept per receiver. A receiver whose box is being served is
/// *busy*: no other worker picks it up until the serving worker calls
/// [`OutBox::handle_served`]. That keeps per-receiver FIFO order intact
/// with any number of workers while distinct receivers are served in
/// parallel.
///
/// With multiple delivery enabled, a worker takes the longest run of
/// queued messages for its receiver that share the same channel and gets
/// them as one [`Message::Batch`].
///
/// Back-pressure is byte based:
/// - above the warning size a warning is logged once per crossing, and
///   producers sleep in proportion to the excess (if a sleep factor is set);
/// - above the maximum size new messages are rejected with `QueueFull`.
///
/// Queued bytes cover messages still in the queue plus those handed to a
/// worker and not yet served.
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use mts_metrics::Counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::channel::Channel;
use crate::config::{DeliveryConfig, QueueLimits};
use crate::error::DeliveryError;
use crate::message::{Deliverable, Message, SingleMessage};
use crate::types::AgentId;

const MIB: f64 = 1024.0 * 1024.0;

/// Upper bound on one producer throttle pause.
pub const MAX_THROTTLE: Duration = Duration::from_secs(10);

/// Work handed to a deliverer.
pub struct Delivery {
    pub message: Message,
    pub receiver: AgentId,
    /// Channel the constituents were enqueued with.
    pub channel: Arc<dyn Channel>,
    /// Earliest deadline among the constituents.
    pub deadline: Option<Instant>,
}

/// What [`OutBox::get`] returns: work, or the order to stop.
pub enum PendingDelivery {
    Deliver(Delivery),
    Shutdown,
}

impl fmt::Debug for PendingDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingDelivery::Deliver(d) => f
                .debug_struct("Deliver")
                .field("receiver", &d.receiver.name())
                .field("message", &d.message.describe())
                .field("deadline", &d.deadline)
                .finish(),
            PendingDelivery::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutBoxStats {
    pub queued_bytes: usize,
    pub queued_messages: usize,
    pub peak_bytes: usize,
    pub receivers: usize,
    pub busy_receivers: usize,
    pub enqueued: u64,
    pub served: u64,
    pub rejected: u64,
}

struct Queued {
    message: SingleMessage,
    size: usize,
    channel: Arc<dyn Channel>,
}

#[derive(Default)]
struct ReceiverBox {
    queue: VecDeque<Queued>,
    busy: bool,
    in_flight_bytes: usize,
    in_flight_count: usize,
}

/// Invariant: a box is in `ready` exactly when it is not busy and not empty.
/// Boxes that are neither busy nor non-empty are removed.
#[derive(Default)]
struct State {
    boxes: HashMap<AgentId, ReceiverBox>,
    ready: VecDeque<AgentId>,
    queued_bytes: usize,
    queued_messages: usize,
    peak_bytes: usize,
    above_warning: bool,
    shutting_down: bool,
    /// Shutdown orders not yet handed to a worker.
    poison: usize,
}

pub struct OutBox {
    state: Mutex<State>,
    available: Notify,
    limits: QueueLimits,
    multiple_delivery: bool,
    enqueued: Counter,
    served: Counter,
    rejected: Counter,
}

impl OutBox {
    pub fn new(limits: QueueLimits, multiple_delivery: bool) -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: Notify::new(),
            limits,
            multiple_delivery,
            enqueued: Counter::new(),
            served: Counter::new(),
            rejected: Counter::new(),
        }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(config.queue_limits(), config.multiple_delivery)
    }

    /// Append `message` to `receiver`'s box.
    ///
    /// Rejects with `QueueFull` when accepting it would exceed the maximum
    /// size and with `ShutDown` once shutdown has begun. When above the
    /// warning size the caller is put to sleep after the message is
    /// accepted.
    pub async fn add_last(
        &self,
        receiver: AgentId,
        message: SingleMessage,
        channel: Arc<dyn Channel>,
    ) -> Result<(), DeliveryError> {
        if let Some(pause) = self.enqueue(receiver, message, channel, false)? {
            tracing::debug!("outbox: throttling producer for {} ms", pause.as_millis());
            tokio::time::sleep(pause).await;
        }
        Ok(())
    }

    /// Admission only, never sleeps. For producers that are themselves
    /// draining the queue (deliverers enqueuing failure notifications).
    ///
    /// Still accepted while shutdown drains the queue: the worker that
    /// enqueues asks for more work afterwards, and ready boxes are handed
    /// out before any shutdown order.
    pub fn try_add_last(
        &self,
        receiver: AgentId,
        message: SingleMessage,
        channel: Arc<dyn Channel>,
    ) -> Result<(), DeliveryError> {
        self.enqueue(receiver, message, channel, true).map(|_| ())
    }

    /// Like [`add_last`](Self::add_last), failing the message with
    /// `Expired` if it is still queued at `deadline`.
    pub async fn add_last_with_deadline(
        &self,
        receiver: AgentId,
        message: SingleMessage,
        channel: Arc<dyn Channel>,
        deadline: Instant,
    ) -> Result<(), DeliveryError> {
        self.add_last(receiver, message.with_deadline(deadline), channel)
            .await
    }

    /// Wait for the next piece of work.
    ///
    /// Returns [`PendingDelivery::Shutdown`] once shutdown was requested and
    /// nothing is left to hand out; each order is returned exactly once.
    pub async fn get(&self) -> PendingDelivery {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before looking so a wake-up between the look and the
            // wait is not lost.
            notified.as_mut().enable();

            if let Some(pending) = self.try_next() {
                return pending;
            }
            notified.await;
        }
    }

    /// Mark `receiver`'s in-flight work as served.
    ///
    /// Releases the box (re-queuing it if more messages arrived meanwhile)
    /// and frees the bytes of the `count` messages that were handed out.
    pub fn handle_served(&self, receiver: &AgentId, count: usize) {
        let requeued = {
            let mut state = self.state.lock();
            let st = &mut *state;
            let Some(bx) = st.boxes.get_mut(receiver) else {
                tracing::warn!("outbox: served unknown receiver {receiver}");
                return;
            };
            if !bx.busy {
                tracing::warn!("outbox: served receiver {receiver} that was not in flight");
                return;
            }
            if count != bx.in_flight_count {
                tracing::debug!(
                    "outbox: {receiver} served {count} messages, {} were in flight",
                    bx.in_flight_count
                );
            }

            st.queued_bytes = st.queued_bytes.saturating_sub(bx.in_flight_bytes);
            st.queued_messages = st.queued_messages.saturating_sub(bx.in_flight_count);
            self.served.inc_by(bx.in_flight_count as u64);
            bx.busy = false;
            bx.in_flight_bytes = 0;
            bx.in_flight_count = 0;

            let requeued = !bx.queue.is_empty();
            if requeued {
                st.ready.push_back(receiver.clone());
            } else {
                st.boxes.remove(receiver);
            }
            if st.queued_bytes <= self.limits.warning_bytes {
                st.above_warning = false;
            }
            requeued
        };
        if requeued {
            self.available.notify_one();
        }
    }

    /// Stop accepting messages and queue one shutdown order per worker.
    ///
    /// Messages already queued are still handed out before the orders.
    pub fn shutdown(&self, workers: usize) {
        {
            let mut state = self.state.lock();
            state.shutting_down = true;
            state.poison += workers;
        }
        self.available.notify_waiters();
        self.available.notify_one();
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Bytes currently accounted to the queue.
    pub fn size(&self) -> usize {
        self.state.lock().queued_bytes
    }

    /// Messages queued or in flight.
    pub fn len(&self) -> usize {
        self.state.lock().queued_messages
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> OutBoxStats {
        let state = self.state.lock();
        OutBoxStats {
            queued_bytes: state.queued_bytes,
            queued_messages: state.queued_messages,
            peak_bytes: state.peak_bytes,
            receivers: state.boxes.len(),
            busy_receivers: state.boxes.values().filter(|b| b.busy).count(),
            enqueued: self.enqueued.get(),
            served: self.served.get(),
            rejected: self.rejected.get(),
        }
    }

    // ── Internal ───────────────────────────────────────────────────────

    /// Admission under the lock; returns the producer pause, if any.
    fn enqueue(
        &self,
        receiver: AgentId,
        mut message: SingleMessage,
        channel: Arc<dyn Channel>,
        while_draining: bool,
    ) -> Result<Option<Duration>, DeliveryError> {
        let size = message.payload_size();
        let pause = {
            let mut state = self.state.lock();
            let st = &mut *state;
            if st.shutting_down && !while_draining {
                return Err(DeliveryError::ShutDown);
            }

            let queued = st.queued_bytes.saturating_add(size);
            if queued > self.limits.max_bytes {
                self.rejected.inc();
                tracing::warn!(
                    "outbox: rejecting {} for {receiver}: {} bytes queued, max {}",
                    message.describe(),
                    st.queued_bytes,
                    self.limits.max_bytes
                );
                return Err(DeliveryError::QueueFull {
                    size: st.queued_bytes,
                    max: self.limits.max_bytes,
                });
            }

            message.mark_enqueued();
            let bx = match st.boxes.entry(receiver) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => {
                    st.ready.push_back(e.key().clone());
                    e.insert(ReceiverBox::default())
                }
            };
            bx.queue.push_back(Queued {
                message,
                size,
                channel,
            });

            st.queued_bytes = queued;
            st.queued_messages += 1;
            st.peak_bytes = st.peak_bytes.max(queued);
            self.enqueued.inc();

            if queued > self.limits.warning_bytes {
                if !st.above_warning {
                    st.above_warning = true;
                    tracing::warn!(
                        "outbox: {queued} bytes queued, above warning size {}",
                        self.limits.warning_bytes
                    );
                }
            } else {
                st.above_warning = false;
            }
            self.throttle(queued)
        };
        self.available.notify_one();
        Ok(pause)
    }

    /// `factor` ms per MiB above the warning size, capped at [`MAX_THROTTLE`].
    fn throttle(&self, queued: usize) -> Option<Duration> {
        let factor = self.limits.sleep_time_factor;
        if factor <= 0.0 || queued <= self.limits.warning_bytes {
            return None;
        }
        let excess = (queued - self.limits.warning_bytes) as f64 / MIB;
        let pause = Duration::from_secs_f64(factor * excess / 1000.0).min(MAX_THROTTLE);
        (!pause.is_zero()).then_some(pause)
    }

    fn try_next(&self) -> Option<PendingDelivery> {
        let mut state = self.state.lock();
        let st = &mut *state;

        while let Some(receiver) = st.ready.pop_front() {
            let Some(bx) = st.boxes.get_mut(&receiver) else {
                continue;
            };
            let Some(first) = bx.queue.pop_front() else {
                continue;
            };

            let channel = first.channel;
            let mut bytes = first.size;
            let mut taken = vec![first.message];
            if self.multiple_delivery {
                let run = bx
                    .queue
                    .iter()
                    .take_while(|q| Arc::ptr_eq(&q.channel, &channel))
                    .count();
                for next in bx.queue.drain(..run) {
                    bytes += next.size;
                    taken.push(next.message);
                }
            }
            bx.busy = true;
            bx.in_flight_bytes = bytes;
            bx.in_flight_count = taken.len();

            let Some(message) = Message::from_messages(taken) else {
                continue;
            };
            let more = !st.ready.is_empty();
            drop(state);
            if more {
                // Chain the wake-up so idle workers pick up other receivers.
                self.available.notify_one();
            }
            return Some(PendingDelivery::Deliver(Delivery {
                deadline: message.earliest_deadline(),
                message,
                receiver,
                channel,
            }));
        }

        if st.poison > 0 {
            st.poison -= 1;
            return Some(PendingDelivery::Shutdown);
        }
        None
    }
}
