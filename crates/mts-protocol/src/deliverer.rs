/// Deliverer pool: a fixed set of workers draining the [`OutBox`].
///
/// Each worker loops: take the next delivery, fail constituents whose
/// deadline passed, hand the rest to the channel they were enqueued with,
/// tell the outbox the receiver was served. A [`PendingDelivery::Shutdown`]
/// order ends the loop.
///
/// The channel runs in its own task so that a panicking or stuck channel
/// never takes the worker down with it. A watchdog task checks every
/// worker's start/end timestamps; a worker busy on one delivery for longer
/// than the stuck threshold has that delivery interrupted. Its messages not
/// yet settled fail with `Interrupted` and the worker moves on, so the pool
/// keeps its size. A panicking channel fails its unsettled messages with
/// `Aborted` the same way.
use std::sync::Arc;
use std::time::Duration;

use mts_metrics::{Counter, Gauge, LatencySnapshot, LatencyStats};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::channel::{DeliveryProgress, DeliveryReport};
use crate::config::DeliveryConfig;
use crate::error::DeliveryError;
use crate::message::{Deliverable, Message};
use crate::outbox::{Delivery, OutBox, PendingDelivery};
use crate::types::AgentId;

/// How long a delivery took relative to the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverySpeed {
    Normal,
    Slow,
    VerySlow,
}

/// Classify `elapsed` for a delivery of `items` messages.
///
/// Thresholds are per message: a batch of n gets n times the budget.
pub fn classify(
    elapsed: Duration,
    items: usize,
    slow: Duration,
    very_slow: Duration,
) -> DeliverySpeed {
    let scale = u32::try_from(items.max(1)).unwrap_or(u32::MAX);
    if elapsed > very_slow.saturating_mul(scale) {
        DeliverySpeed::VerySlow
    } else if elapsed > slow.saturating_mul(scale) {
        DeliverySpeed::Slow
    } else {
        DeliverySpeed::Normal
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub busy_workers: i64,
    pub delivered: u64,
    pub failed: u64,
    pub expired: u64,
    pub slow: u64,
    pub very_slow: u64,
    pub interrupted: u64,
    pub panicked: u64,
    /// Messages served by each worker, by worker index.
    pub served_per_worker: Vec<u64>,
    pub latency: LatencySnapshot,
}

// ── Worker bookkeeping ─────────────────────────────────────────────────

#[derive(Default)]
struct Clock {
    started: Option<Instant>,
    /// `None` while a delivery is in progress.
    ended: Option<Instant>,
    receiver: Option<AgentId>,
    interrupt: Option<oneshot::Sender<()>>,
}

struct Worker {
    id: usize,
    clock: Mutex<Clock>,
    served: Counter,
}

impl Worker {
    fn new(id: usize) -> Self {
        Self {
            id,
            clock: Mutex::new(Clock::default()),
            served: Counter::new(),
        }
    }

    fn begin(&self, receiver: &AgentId) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut clock = self.clock.lock();
        clock.started = Some(Instant::now());
        clock.ended = None;
        clock.receiver = Some(receiver.clone());
        clock.interrupt = Some(tx);
        rx
    }

    fn end(&self) {
        let mut clock = self.clock.lock();
        clock.ended = Some(Instant::now());
        clock.receiver = None;
        clock.interrupt = None;
    }
}

struct Shared {
    workers: Vec<Worker>,
    slow: Duration,
    very_slow: Duration,
    stuck: Duration,
    busy: Gauge,
    delivered: Counter,
    failed: Counter,
    expired: Counter,
    slow_count: Counter,
    very_slow_count: Counter,
    interrupted: Counter,
    panicked: Counter,
    latency: LatencyStats,
}

impl Shared {
    /// Interrupt every delivery running for longer than the stuck threshold.
    ///
    /// Each delivery is interrupted at most once. Returns the worker indexes.
    fn check_stuck(&self) -> Vec<usize> {
        let now = Instant::now();
        let mut interrupted = Vec::new();
        for worker in &self.workers {
            let mut clock = worker.clock.lock();
            let (Some(started), None) = (clock.started, clock.ended) else {
                continue;
            };
            let busy_for = now.saturating_duration_since(started);
            if busy_for <= self.stuck {
                continue;
            }
            if let Some(tx) = clock.interrupt.take() {
                tracing::warn!(
                    "deliverer {}: stuck for {} ms delivering to {}, interrupting",
                    worker.id,
                    busy_for.as_millis(),
                    clock
                        .receiver
                        .as_ref()
                        .map_or_else(|| "?".to_string(), |r| r.to_string()),
                );
                let _ = tx.send(());
                interrupted.push(worker.id);
            }
        }
        interrupted
    }

    async fn serve(&self, worker: &Worker, delivery: Delivery) {
        let Delivery {
            message,
            receiver,
            channel,
            deadline,
        } = delivery;

        let now = Instant::now();
        let message = if deadline.is_some_and(|d| now >= d) {
            let (live, expired): (Vec<_>, Vec<_>) = message
                .into_messages()
                .into_iter()
                .partition(|m| !m.is_expired(now));
            for m in &expired {
                tracing::debug!(
                    "deliverer {}: {} for {receiver} expired in queue",
                    worker.id,
                    m.describe()
                );
                self.expired.inc();
                channel
                    .notify_failure_to_sender(m, &receiver, &DeliveryError::Expired)
                    .await;
            }
            match Message::from_messages(live) {
                Some(message) => message,
                None => return,
            }
        } else {
            message
        };

        let items = message.item_count();
        let interrupt = worker.begin(&receiver);
        self.busy.add(1);
        let started = Instant::now();

        let progress = Arc::new(DeliveryProgress::new());
        let mut task = tokio::spawn({
            let channel = channel.clone();
            let message = message.clone();
            let receiver = receiver.clone();
            let progress = progress.clone();
            async move { channel.deliver_now(&message, &receiver, &progress).await }
        });
        let outcome = tokio::select! {
            joined = &mut task => Some(joined),
            _ = interrupt => None,
        };
        if outcome.is_none() {
            task.abort();
            // Wait for the abort to land so `progress` stops moving.
            if tokio::time::timeout(self.stuck, &mut task).await.is_err() {
                tracing::error!(
                    "deliverer {}: delivery to {receiver} ignored its interruption",
                    worker.id
                );
            }
        }

        let elapsed = started.elapsed();
        worker.end();
        self.busy.sub(1);
        worker.served.inc_by(items as u64);
        self.latency.record(elapsed);

        let error = match outcome {
            Some(Ok(())) => None,
            Some(Err(e)) => {
                self.panicked.inc();
                tracing::error!(
                    "deliverer {}: delivery of {} to {receiver} died: {e}",
                    worker.id,
                    message.describe()
                );
                Some(DeliveryError::Aborted {
                    reason: "delivery task panicked".to_string(),
                })
            }
            None => {
                self.interrupted.inc();
                tracing::warn!(
                    "deliverer {}: delivery of {} to {receiver} interrupted",
                    worker.id,
                    message.describe()
                );
                Some(DeliveryError::Interrupted {
                    elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                })
            }
        };

        let mut report = progress.report();
        if let Some(error) = error {
            // Settled constituents were delivered or already reported.
            let owed = &message.messages()[report.settled().min(items)..];
            for m in owed {
                channel.notify_failure_to_sender(m, &receiver, &error).await;
            }
            report.merge(DeliveryReport::failed(owed.len()));
        }
        self.record(report);

        match classify(elapsed, items, self.slow, self.very_slow) {
            DeliverySpeed::Normal => {}
            DeliverySpeed::Slow => {
                self.slow_count.inc();
                tracing::warn!(
                    "deliverer {}: slow delivery of {} to {receiver}: {} ms",
                    worker.id,
                    message.describe(),
                    elapsed.as_millis()
                );
            }
            DeliverySpeed::VerySlow => {
                self.very_slow_count.inc();
                tracing::error!(
                    "deliverer {}: very slow delivery of {} to {receiver}: {} ms",
                    worker.id,
                    message.describe(),
                    elapsed.as_millis()
                );
            }
        }
    }

    fn record(&self, report: DeliveryReport) {
        self.delivered.inc_by(report.delivered as u64);
        self.failed.inc_by(report.failed as u64);
    }
}

// ── Pool ───────────────────────────────────────────────────────────────

pub struct DelivererPool {
    outbox: Arc<OutBox>,
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl DelivererPool {
    /// Spawn the workers and the watchdog on the current tokio runtime.
    pub fn start(outbox: Arc<OutBox>, config: &DeliveryConfig) -> Self {
        let workers = config.pool_size.max(1);
        let shared = Arc::new(Shared {
            workers: (0..workers).map(Worker::new).collect(),
            slow: config.slow_threshold,
            very_slow: config.very_slow_threshold,
            stuck: config.stuck_threshold,
            busy: Gauge::new(),
            delivered: Counter::new(),
            failed: Counter::new(),
            expired: Counter::new(),
            slow_count: Counter::new(),
            very_slow_count: Counter::new(),
            interrupted: Counter::new(),
            panicked: Counter::new(),
            latency: LatencyStats::new(),
        });

        let handles = (0..workers)
            .map(|id| tokio::spawn(run_worker(id, shared.clone(), outbox.clone())))
            .collect();
        let watchdog = tokio::spawn(run_watchdog(
            shared.clone(),
            config.stuck_check_interval,
        ));
        tracing::info!("deliverer pool started with {workers} workers");

        Self {
            outbox,
            shared,
            handles: Mutex::new(handles),
            watchdog: Mutex::new(Some(watchdog)),
        }
    }

    pub fn outbox(&self) -> &Arc<OutBox> {
        &self.outbox
    }

    pub fn workers(&self) -> usize {
        self.shared.workers.len()
    }

    /// Run one stuck check now. Returns the interrupted worker indexes.
    pub fn check_stuck(&self) -> Vec<usize> {
        self.shared.check_stuck()
    }

    /// Stop the pool: queued messages are still delivered, then every
    /// worker exits. Returns once all of them have.
    pub async fn shutdown(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return;
        }
        self.outbox.shutdown(handles.len());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("deliverer exited abnormally: {e}");
            }
        }
        if let Some(watchdog) = self.watchdog.lock().take() {
            watchdog.abort();
        }
        tracing::info!("deliverer pool stopped");
    }

    pub fn stats(&self) -> PoolStats {
        let s = &self.shared;
        PoolStats {
            workers: s.workers.len(),
            busy_workers: s.busy.get(),
            delivered: s.delivered.get(),
            failed: s.failed.get(),
            expired: s.expired.get(),
            slow: s.slow_count.get(),
            very_slow: s.very_slow_count.get(),
            interrupted: s.interrupted.get(),
            panicked: s.panicked.get(),
            served_per_worker: s.workers.iter().map(|w| w.served.get()).collect(),
            latency: s.latency.snapshot(),
        }
    }
}

impl Drop for DelivererPool {
    fn drop(&mut self) {
        for handle in self.handles.get_mut().drain(..) {
            handle.abort();
        }
        if let Some(watchdog) = self.watchdog.get_mut().take() {
            watchdog.abort();
        }
    }
}

async fn run_worker(id: usize, shared: Arc<Shared>, outbox: Arc<OutBox>) {
    tracing::debug!("deliverer {id}: started");
    let worker = &shared.workers[id];
    loop {
        match outbox.get().await {
            PendingDelivery::Shutdown => break,
            PendingDelivery::Deliver(delivery) => {
                let receiver = delivery.receiver.clone();
                let count = delivery.message.item_count();
                shared.serve(worker, delivery).await;
                outbox.handle_served(&receiver, count);
            }
        }
    }
    tracing::debug!("deliverer {id}: stopped");
}

async fn run_watchdog(shared: Arc<Shared>, every: Duration) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        shared.check_stuck();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::config::QueueLimits;
    use crate::message::{AclMessage, Performative, SingleMessage};
    use tokio::sync::mpsc;

    #[derive(Debug, PartialEq)]
    enum Event {
        Delivered(String, Vec<String>),
        Failed(String, String, DeliveryError),
    }

    /// Records what it is asked to do, one event per constituent. Receiver
    /// "stuck" and content "stall" never return, receiver "boom" panics.
    struct TestChannel {
        events: mpsc::UnboundedSender<Event>,
    }

    #[async_trait::async_trait]
    impl Channel for TestChannel {
        async fn deliver_now(
            &self,
            message: &Message,
            receiver: &AgentId,
            progress: &DeliveryProgress,
        ) {
            for m in message.messages() {
                let content = m.acl().content.clone();
                match (receiver.local_name(), content.as_str()) {
                    ("stuck", _) | (_, "stall") => {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    }
                    ("boom", _) => panic!("channel blew up"),
                    _ => {}
                }
                progress.delivered_one();
                let _ = self.events.send(Event::Delivered(
                    receiver.local_name().to_string(),
                    vec![content],
                ));
            }
        }

        async fn notify_failure_to_sender(
            &self,
            message: &SingleMessage,
            receiver: &AgentId,
            error: &DeliveryError,
        ) {
            let _ = self.events.send(Event::Failed(
                receiver.local_name().to_string(),
                message.acl().content.clone(),
                error.clone(),
            ));
        }
    }

    fn agent(name: &str) -> AgentId {
        AgentId::new(format!("{name}@home"))
    }

    fn msg(content: &str) -> SingleMessage {
        SingleMessage::new(
            AclMessage::new(Performative::Inform, agent("sender")).with_content(content),
        )
    }

    fn setup(config: &DeliveryConfig) -> (Arc<OutBox>, Arc<dyn Channel>, mpsc::UnboundedReceiver<Event>) {
        let outbox = Arc::new(OutBox::new(QueueLimits::default(), config.multiple_delivery));
        let (tx, rx) = mpsc::unbounded_channel();
        let channel: Arc<dyn Channel> = Arc::new(TestChannel { events: tx });
        (outbox, channel, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event expected")
            .expect("channel open")
    }

    #[test]
    fn classify_scales_with_batch_size() {
        let slow = Duration::from_millis(100);
        let very = Duration::from_millis(1000);
        assert_eq!(
            classify(Duration::from_millis(50), 1, slow, very),
            DeliverySpeed::Normal
        );
        assert_eq!(
            classify(Duration::from_millis(150), 1, slow, very),
            DeliverySpeed::Slow
        );
        assert_eq!(
            classify(Duration::from_millis(150), 2, slow, very),
            DeliverySpeed::Normal
        );
        assert_eq!(
            classify(Duration::from_millis(1500), 1, slow, very),
            DeliverySpeed::VerySlow
        );
        assert_eq!(
            classify(Duration::from_millis(1500), 0, slow, very),
            DeliverySpeed::VerySlow,
            "zero items count as one"
        );
    }

    #[tokio::test]
    async fn delivers_in_order_then_stops() {
        let config = DeliveryConfig::default().pool_size(3).multiple_delivery(false);
        let (outbox, channel, mut rx) = setup(&config);
        let pool = DelivererPool::start(outbox.clone(), &config);

        for i in 0..5 {
            outbox
                .add_last(agent("r"), msg(&i.to_string()), channel.clone())
                .await
                .unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..5 {
            match next(&mut rx).await {
                Event::Delivered(r, contents) => {
                    assert_eq!(r, "r");
                    seen.extend(contents);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(seen, vec!["0", "1", "2", "3", "4"]);

        pool.shutdown().await;
        let stats = pool.stats();
        assert_eq!(stats.delivered, 5);
        assert_eq!(stats.served_per_worker.iter().sum::<u64>(), 5);
        assert!(outbox.is_empty());
    }

    #[tokio::test]
    async fn shutdown_drains_queued_messages() {
        let config = DeliveryConfig::default().pool_size(2);
        let (outbox, channel, mut rx) = setup(&config);
        for i in 0..4 {
            outbox
                .add_last(agent(&format!("r{i}")), msg("x"), channel.clone())
                .await
                .unwrap();
        }
        let pool = DelivererPool::start(outbox.clone(), &config);
        pool.shutdown().await;

        let mut delivered = 0;
        while let Ok(event) = rx.try_recv() {
            assert!(matches!(event, Event::Delivered(..)));
            delivered += 1;
        }
        assert_eq!(delivered, 4);
        assert!(outbox.is_shut_down());
    }

    #[tokio::test]
    async fn expired_messages_fail_without_delivery() {
        let config = DeliveryConfig::default().pool_size(1);
        let (outbox, channel, mut rx) = setup(&config);
        outbox
            .add_last_with_deadline(agent("r"), msg("late"), channel.clone(), Instant::now())
            .await
            .unwrap();
        let pool = DelivererPool::start(outbox.clone(), &config);

        assert_eq!(
            next(&mut rx).await,
            Event::Failed("r".into(), "late".into(), DeliveryError::Expired)
        );
        pool.shutdown().await;
        assert_eq!(pool.stats().expired, 1);
        assert_eq!(pool.stats().delivered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_delivery_is_interrupted_and_worker_continues() {
        let config = DeliveryConfig::default()
            .pool_size(1)
            .stuck_threshold(Duration::from_millis(200))
            .stuck_check_interval(Duration::from_millis(50));
        let (outbox, channel, mut rx) = setup(&config);
        let pool = DelivererPool::start(outbox.clone(), &config);

        outbox
            .add_last(agent("stuck"), msg("m1"), channel.clone())
            .await
            .unwrap();
        outbox
            .add_last(agent("fine"), msg("m2"), channel.clone())
            .await
            .unwrap();

        match next(&mut rx).await {
            Event::Failed(r, content, DeliveryError::Interrupted { elapsed_ms }) => {
                assert_eq!(r, "stuck");
                assert_eq!(content, "m1");
                assert!(elapsed_ms >= 200);
            }
            other => panic!("unexpected {other:?}"),
        }
        // The single worker is still alive.
        assert_eq!(
            next(&mut rx).await,
            Event::Delivered("fine".into(), vec!["m2".into()])
        );

        pool.shutdown().await;
        let stats = pool.stats();
        assert_eq!(stats.interrupted, 1);
        assert_eq!(stats.workers, 1);
        assert_eq!(stats.busy_workers, 0);
    }

    #[tokio::test]
    async fn panicking_channel_does_not_kill_the_worker() {
        let config = DeliveryConfig::default().pool_size(1);
        let (outbox, channel, mut rx) = setup(&config);
        let pool = DelivererPool::start(outbox.clone(), &config);

        outbox
            .add_last(agent("boom"), msg("m1"), channel.clone())
            .await
            .unwrap();
        outbox
            .add_last(agent("ok"), msg("m2"), channel.clone())
            .await
            .unwrap();

        match next(&mut rx).await {
            Event::Failed(r, content, DeliveryError::Aborted { .. }) => {
                assert_eq!(r, "boom");
                assert_eq!(content, "m1");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            next(&mut rx).await,
            Event::Delivered("ok".into(), vec!["m2".into()])
        );
        pool.shutdown().await;
        let stats = pool.stats();
        assert_eq!(stats.panicked, 1);
        assert_eq!(stats.failed, 1);
        assert!(outbox.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_batch_reports_only_the_undelivered_tail() {
        let config = DeliveryConfig::default()
            .pool_size(1)
            .stuck_threshold(Duration::from_millis(200))
            .stuck_check_interval(Duration::from_millis(50));
        let (outbox, channel, mut rx) = setup(&config);
        for c in ["ok", "stall", "after"] {
            outbox
                .add_last(agent("r"), msg(c), channel.clone())
                .await
                .unwrap();
        }
        let pool = DelivererPool::start(outbox.clone(), &config);

        assert_eq!(
            next(&mut rx).await,
            Event::Delivered("r".into(), vec!["ok".into()])
        );
        let mut failed = Vec::new();
        for _ in 0..2 {
            match next(&mut rx).await {
                Event::Failed(r, content, DeliveryError::Interrupted { .. }) => {
                    assert_eq!(r, "r");
                    failed.push(content);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(failed, vec!["stall", "after"]);

        pool.shutdown().await;
        assert!(rx.try_recv().is_err(), "delivered message must not be reported");
        let stats = pool.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.interrupted, 1);
        assert!(outbox.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_ignores_idle_and_fast_workers() {
        let config = DeliveryConfig::default()
            .pool_size(2)
            .stuck_threshold(Duration::from_millis(100));
        let (outbox, _channel, _rx) = setup(&config);
        let pool = DelivererPool::start(outbox, &config);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(pool.check_stuck().is_empty());
        pool.shutdown().await;
    }
}
