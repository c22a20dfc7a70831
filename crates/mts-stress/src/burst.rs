use crate::common::{content, elapsed_s, Testbed};
use crate::events::*;
use mts_protocol::DeliveryError;
use std::time::{Duration, Instant};

pub struct BurstConfig {
    pub agents: usize,
    pub count: u32,
    pub payload_size: usize,
    pub rounds: u32,
    pub round_delay_ms: u64,
    pub settle_timeout: Duration,
}

/// Send `count` messages per round, round-robin over the agents, and wait
/// for every one of them to be delivered or reported failed.
pub async fn run(bed: &Testbed, config: BurstConfig, start: Instant) -> anyhow::Result<()> {
    let agents = bed.host_many("sink", config.agents.max(1)).await;
    eprintln!(
        "Burst: {} agents on {} nodes, {} msgs x {} bytes, {} rounds",
        agents.len(),
        bed.nodes.len(),
        config.count,
        config.payload_size,
        config.rounds
    );

    let mut seq = 0u64;
    for round in 1..=config.rounds {
        let base = bed.accounted();
        let burst_start = Instant::now();
        let mut sent = 0u64;
        let mut rejected = 0u64;

        for i in 0..config.count as usize {
            let receiver = &agents[i % agents.len()];
            seq += 1;
            match bed
                .svc
                .send(bed.message(receiver, content(config.payload_size, seq)))
                .await
            {
                Ok(()) => sent += 1,
                Err(DeliveryError::QueueFull { .. }) => rejected += 1,
                Err(e) => return Err(e.into()),
            }
        }

        let settled = bed.settle(base + sent, config.settle_timeout).await;
        let elapsed_ms = burst_start.elapsed().as_secs_f64() * 1000.0;
        let delivered = bed.sinks.delivered.get();
        let failed = bed.sinks.failures.get();
        let messages_per_sec = if elapsed_ms > 0.0 {
            sent as f64 / (elapsed_ms / 1000.0)
        } else {
            0.0
        };

        emit(&EventBurstResult {
            event: "burst_result",
            round,
            agents: agents.len(),
            messages_sent: sent,
            delivered,
            failed,
            rejected,
            payload_size: config.payload_size,
            elapsed_ms,
            messages_per_sec,
            latency: bed.sinks.latency.snapshot(),
            settled,
            elapsed_s: elapsed_s(start),
        });
        eprintln!(
            "  round {round}: {sent} sent, {rejected} rejected, {messages_per_sec:.0} msg/s{}",
            if settled { "" } else { " (not settled)" }
        );

        if round < config.rounds && config.round_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(config.round_delay_ms)).await;
        }
    }
    Ok(())
}
