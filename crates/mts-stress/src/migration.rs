use crate::common::{content, elapsed_s, Testbed};
use crate::events::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

pub struct MigrationConfig {
    pub agents: usize,
    pub count: u32,
    pub migrations: u32,
    pub interval_ms: u64,
    /// Time an agent spends hosted nowhere while moving.
    pub gap_ms: u64,
    pub seed: u64,
    pub settle_timeout: Duration,
}

/// Keep sending to a set of agents while they hop between nodes.
///
/// Deliveries racing a migration see `NotFound` and go through the
/// resolution retries; a gap longer than the retry budget turns into
/// FAILURE notifications.
pub async fn run(bed: &Testbed, config: MigrationConfig, start: Instant) -> anyhow::Result<()> {
    if bed.nodes.len() < 2 {
        anyhow::bail!("migration storm needs at least 2 containers");
    }
    let agents = bed.host_many("nomad", config.agents.max(1)).await;
    let mut home: Vec<usize> = (0..agents.len()).map(|i| i % bed.nodes.len()).collect();
    eprintln!(
        "Migration storm: {} agents, {} migrations every {}ms (gap {}ms), {} msgs",
        agents.len(),
        config.migrations,
        config.interval_ms,
        config.gap_ms,
        config.count
    );

    let base = bed.accounted();
    let sender = {
        let svc = bed.svc.clone();
        let messages: Vec<_> = (0..config.count as usize)
            .map(|i| bed.message(&agents[i % agents.len()], content(64, i as u64)))
            .collect();
        tokio::spawn(async move {
            let mut sent = 0u64;
            for message in messages {
                if svc.send(message).await.is_ok() {
                    sent += 1;
                }
                tokio::task::yield_now().await;
            }
            sent
        })
    };

    let mut rng = StdRng::seed_from_u64(config.seed);
    let gap = Duration::from_millis(config.gap_ms);
    for _ in 0..config.migrations {
        let i = rng.random_range(0..agents.len());
        let from = home[i];
        let to = (from + rng.random_range(1..bed.nodes.len())) % bed.nodes.len();
        bed.migrate(&agents[i], from, to, gap).await;
        home[i] = to;

        emit(&EventMigration {
            event: "migration",
            agent: agents[i].to_string(),
            from: bed.node_name(from),
            to: bed.node_name(to),
            elapsed_s: elapsed_s(start),
        });
        tokio::time::sleep(Duration::from_millis(config.interval_ms)).await;
    }

    let sent = sender.await?;
    let settled = bed.settle(base + sent, config.settle_timeout).await;
    let stats = bed.svc.stats();

    emit(&EventMigrationResult {
        event: "migration_result",
        migrations: config.migrations,
        messages_sent: sent,
        delivered: bed.sinks.delivered.get(),
        failed: bed.sinks.failures.get(),
        retries: stats.retries,
        cache_evictions: stats.cache_evictions,
        settled,
        elapsed_s: elapsed_s(start),
    });
    eprintln!(
        "  {sent} sent, {} retries, {} cache evictions, {} failures",
        stats.retries,
        stats.cache_evictions,
        bed.sinks.failures.get()
    );
    Ok(())
}
