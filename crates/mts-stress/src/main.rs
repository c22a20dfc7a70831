mod backpressure;
mod burst;
mod common;
mod events;
mod foreign;
mod migration;
mod output;

use clap::{Args, Parser, Subcommand};
use common::{elapsed_s, Testbed, PLATFORM};
use events::{emit, EventEngineStats, EventStarted};
use mts_protocol::DeliveryConfig;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "mts-stress", about = "Load scenarios for the MTS delivery engine")]
struct Cli {
    /// Number of in-process containers, `main` included.
    #[arg(long, default_value = "3", global = true)]
    containers: usize,

    /// Give up waiting for deliveries after this many seconds.
    #[arg(long, default_value = "30", global = true)]
    settle_timeout: u64,

    /// Also write JSONL events to a file in this directory.
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    #[command(flatten)]
    engine: EngineArgs,

    #[command(subcommand)]
    command: Command,
}

/// Engine knobs. Unset flags keep the `MTS_*` environment value or the default.
#[derive(Args)]
struct EngineArgs {
    /// Deliverer workers.
    #[arg(long, global = true)]
    pool_size: Option<usize>,
    /// Slow-delivery threshold in ms.
    #[arg(long, global = true)]
    slow_ms: Option<u64>,
    /// Very-slow-delivery threshold in ms.
    #[arg(long, global = true)]
    very_slow_ms: Option<u64>,
    /// Stuck-worker threshold in ms.
    #[arg(long, global = true)]
    stuck_ms: Option<u64>,
    /// Watchdog polling period in ms.
    #[arg(long, global = true)]
    stuck_check_ms: Option<u64>,
    /// Queued bytes above which senders are throttled.
    #[arg(long, global = true)]
    queue_warning_bytes: Option<usize>,
    /// Queued bytes above which sends are rejected.
    #[arg(long, global = true)]
    queue_max_bytes: Option<usize>,
    /// Throttle, in ms per MiB queued above the warning size.
    #[arg(long, global = true)]
    sleep_factor: Option<f64>,
    /// Resolution attempts before a receiver is declared not found.
    #[arg(long, global = true)]
    max_attempts: Option<u32>,
    /// Pause between resolution attempts in ms.
    #[arg(long, global = true)]
    retry_ms: Option<u64>,
    /// Deliver queued messages one by one instead of coalescing them.
    #[arg(long, global = true)]
    no_coalesce: bool,
    /// Slice location cache capacity.
    #[arg(long, global = true)]
    cache_size: Option<usize>,
}

impl EngineArgs {
    fn apply(&self, mut config: DeliveryConfig) -> DeliveryConfig {
        let ms = Duration::from_millis;
        if let Some(v) = self.pool_size {
            config = config.pool_size(v);
        }
        if let Some(v) = self.slow_ms {
            config = config.slow_threshold(ms(v));
        }
        if let Some(v) = self.very_slow_ms {
            config = config.very_slow_threshold(ms(v));
        }
        if let Some(v) = self.stuck_ms {
            config = config.stuck_threshold(ms(v));
        }
        if let Some(v) = self.stuck_check_ms {
            config = config.stuck_check_interval(ms(v));
        }
        if let Some(v) = self.queue_warning_bytes {
            config = config.warning_queue_bytes(v);
        }
        if let Some(v) = self.queue_max_bytes {
            config = config.max_queue_bytes(v);
        }
        if let Some(v) = self.sleep_factor {
            config = config.sleep_time_factor(v);
        }
        if let Some(v) = self.max_attempts {
            config = config.max_resolution_attempts(v);
        }
        if let Some(v) = self.retry_ms {
            config = config.resolution_retry_delay(ms(v));
        }
        if self.no_coalesce {
            config = config.multiple_delivery(false);
        }
        if let Some(v) = self.cache_size {
            config = config.location_cache_size(v);
        }
        config
    }
}

#[derive(Subcommand)]
enum Command {
    /// Send N messages as fast as possible to agents spread over the nodes.
    Burst {
        /// Receiving agents.
        #[arg(long, default_value = "50")]
        agents: usize,
        /// Messages per round.
        #[arg(long, default_value = "10000")]
        count: u32,
        /// Content size in bytes.
        #[arg(long, default_value = "256")]
        payload_size: usize,
        /// Number of rounds.
        #[arg(long, default_value = "1")]
        rounds: u32,
        /// Delay between rounds in ms.
        #[arg(long, default_value = "1000")]
        round_delay: u64,
    },

    /// Keep sending while agents migrate between nodes.
    Migration {
        /// Migrating agents.
        #[arg(long, default_value = "20")]
        agents: usize,
        /// Messages to send during the storm.
        #[arg(long, default_value = "5000")]
        count: u32,
        /// Number of migrations.
        #[arg(long, default_value = "200")]
        migrations: u32,
        /// Delay between migrations in ms.
        #[arg(long, default_value = "5")]
        interval: u64,
        /// Time a migrating agent is hosted nowhere, in ms.
        #[arg(long, default_value = "20")]
        gap: u64,
        /// RNG seed.
        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Send to agents of a foreign platform through a simulated gateway.
    Foreign {
        /// Foreign receivers.
        #[arg(long, default_value = "10")]
        receivers: usize,
        /// Messages to send.
        #[arg(long, default_value = "1000")]
        count: u32,
        /// Give every other receiver a dead first address.
        #[arg(long)]
        dead_first: bool,
        /// Route through a gateway announced by node c1.
        #[arg(long)]
        via_node: bool,
    },

    /// Flood one slow receiver to exercise throttling and rejection.
    Backpressure {
        /// Concurrent producers.
        #[arg(long, default_value = "4")]
        producers: u32,
        /// Messages per producer.
        #[arg(long, default_value = "2000")]
        per_producer: u32,
        /// Content size in bytes.
        #[arg(long, default_value = "4096")]
        payload_size: usize,
        /// Time the slow node spends per dispatch, in ms.
        #[arg(long, default_value = "2")]
        dispatch_delay: u64,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Burst { .. } => "burst",
            Command::Migration { .. } => "migration",
            Command::Foreign { .. } => "foreign",
            Command::Backpressure { .. } => "backpressure",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let start = Instant::now();
    let scenario = cli.command.name();

    if let Some(dir) = &cli.output_dir {
        let path = output::results_path(dir, scenario)?;
        output::open_results(&path)?;
        eprintln!("Writing results to {}", path.display());
    }

    let config = cli.engine.apply(DeliveryConfig::new());
    let workers = config.workers();
    let bed = Testbed::start(config, cli.containers).await;
    let settle_timeout = Duration::from_secs(cli.settle_timeout);

    eprintln!("mts-stress v{}", env!("CARGO_PKG_VERSION"));
    emit(&EventStarted::new(
        scenario,
        PLATFORM,
        bed.nodes.len(),
        workers,
    ));

    match cli.command {
        Command::Burst {
            agents,
            count,
            payload_size,
            rounds,
            round_delay,
        } => {
            burst::run(
                &bed,
                burst::BurstConfig {
                    agents,
                    count,
                    payload_size,
                    rounds,
                    round_delay_ms: round_delay,
                    settle_timeout,
                },
                start,
            )
            .await?;
        }

        Command::Migration {
            agents,
            count,
            migrations,
            interval,
            gap,
            seed,
        } => {
            migration::run(
                &bed,
                migration::MigrationConfig {
                    agents,
                    count,
                    migrations,
                    interval_ms: interval,
                    gap_ms: gap,
                    seed,
                    settle_timeout,
                },
                start,
            )
            .await?;
        }

        Command::Foreign {
            receivers,
            count,
            dead_first,
            via_node,
        } => {
            foreign::run(
                &bed,
                foreign::ForeignConfig {
                    receivers,
                    count,
                    dead_first,
                    via_node,
                    settle_timeout,
                },
                start,
            )
            .await?;
        }

        Command::Backpressure {
            producers,
            per_producer,
            payload_size,
            dispatch_delay,
        } => {
            backpressure::run(
                &bed,
                backpressure::BackpressureConfig {
                    producers,
                    per_producer,
                    payload_size,
                    dispatch_delay_ms: dispatch_delay,
                    settle_timeout,
                },
                start,
            )
            .await?;
        }
    }

    bed.svc.shutdown().await;
    emit(&EventEngineStats {
        event: "engine_stats",
        scenario: scenario.to_string(),
        stats: bed.svc.stats(),
        elapsed_s: elapsed_s(start),
    });
    Ok(())
}
