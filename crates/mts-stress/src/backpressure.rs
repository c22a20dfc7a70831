use crate::common::{content, elapsed_s, Testbed, PLATFORM};
use crate::events::*;
use mts_metrics::{Counter, LatencyStats};
use mts_protocol::{
    AgentId, ContainerId, DeliveryError, InProcessContainer, NodeSlice, SingleMessage,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct BackpressureConfig {
    pub producers: u32,
    pub per_producer: u32,
    pub payload_size: usize,
    /// Time the slow node takes per dispatch.
    pub dispatch_delay_ms: u64,
    pub settle_timeout: Duration,
}

/// A node that takes its time accepting each message.
struct SlowNode {
    inner: InProcessContainer,
    delay: Duration,
}

#[async_trait::async_trait]
impl NodeSlice for SlowNode {
    fn node(&self) -> &ContainerId {
        self.inner.id()
    }

    async fn dispatch_locally(
        &self,
        sender: &AgentId,
        message: &SingleMessage,
        receiver: &AgentId,
    ) -> Result<(), DeliveryError> {
        tokio::time::sleep(self.delay).await;
        self.inner.dispatch_locally(sender, message, receiver).await
    }

    async fn route_out(
        &self,
        message: &SingleMessage,
        receiver: &AgentId,
        address: &str,
    ) -> Result<(), DeliveryError> {
        self.inner.route_out(message, receiver, address).await
    }
}

#[derive(Default)]
struct SendStats {
    attempted: Counter,
    accepted: Counter,
    rejected: Counter,
    /// Time spent inside `send`, throttle sleep included.
    send_time: LatencyStats,
}

/// Flood one slow receiver from several producers and watch the queue
/// throttle and then reject.
pub async fn run(bed: &Testbed, config: BackpressureConfig, start: Instant) -> anyhow::Result<()> {
    let slow = Arc::new(SlowNode {
        inner: InProcessContainer::new("slow"),
        delay: Duration::from_millis(config.dispatch_delay_ms),
    });
    bed.platform.add_node(slow.clone());

    let target = AgentId::local("bottleneck", PLATFORM);
    let mut inbox = slow.inner.register(target.clone());
    bed.svc
        .register_agent(target.clone(), slow.inner.id().clone())
        .await;
    let sinks = bed.sinks.clone();
    tokio::spawn(async move {
        while inbox.recv().await.is_some() {
            sinks.delivered.inc();
        }
    });

    let limits = bed.svc.config().queue_limits();
    eprintln!(
        "Back-pressure: {} producers x {} msgs of {} bytes, {}ms per dispatch, queue warn {} / max {} bytes",
        config.producers,
        config.per_producer,
        config.payload_size,
        config.dispatch_delay_ms,
        limits.warning_bytes,
        limits.max_bytes
    );

    let base = bed.accounted();
    let stats = Arc::new(SendStats::default());
    let mut producers = Vec::new();
    for p in 0..config.producers.max(1) {
        let svc = bed.svc.clone();
        let stats = stats.clone();
        let messages: Vec<SingleMessage> = (0..config.per_producer)
            .map(|i| {
                let seq = (u64::from(p) << 32) | u64::from(i);
                bed.message(&target, content(config.payload_size, seq))
            })
            .collect();
        producers.push(tokio::spawn(async move {
            for message in messages {
                stats.attempted.inc();
                let t = Instant::now();
                match svc.send(message).await {
                    Ok(()) => stats.accepted.inc(),
                    Err(DeliveryError::QueueFull { .. }) => stats.rejected.inc(),
                    Err(e) => {
                        tracing::warn!("producer {p}: {e}");
                        break;
                    }
                }
                stats.send_time.record(t.elapsed());
            }
        }));
    }
    for producer in producers {
        producer.await?;
    }

    let accepted = stats.accepted.get();
    let settled = bed.settle(base + accepted, config.settle_timeout).await;
    let send_time = stats.send_time.snapshot();

    emit(&EventBackpressureResult {
        event: "backpressure_result",
        producers: config.producers,
        attempted: stats.attempted.get(),
        accepted,
        rejected: stats.rejected.get(),
        delivered: bed.sinks.delivered.get(),
        peak_queued_bytes: bed.svc.outbox().stats().peak_bytes,
        max_queue_bytes: limits.max_bytes,
        max_send_ms: send_time.max_ms,
        mean_send_ms: send_time.mean_ms,
        settled,
        elapsed_s: elapsed_s(start),
    });
    eprintln!(
        "  {accepted} accepted, {} rejected, slowest send {:.1}ms",
        stats.rejected.get(),
        send_time.max_ms
    );
    Ok(())
}
