use crate::output;
use mts_metrics::LatencySnapshot;
use mts_protocol::MessagingStats;
use serde::Serialize;
use std::io::Write;

/// Print a JSONL event on stdout and mirror it to the result file.
pub fn emit<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{json}");
        let _ = lock.flush();

        output::write_line(&json);
    }
}

pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ── Session ─────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventStarted {
    pub event: &'static str,
    pub scenario: String,
    pub platform: String,
    pub containers: usize,
    pub workers: usize,
    pub timestamp: String,
}

impl EventStarted {
    pub fn new(scenario: &str, platform: &str, containers: usize, workers: usize) -> Self {
        Self {
            event: "started",
            scenario: scenario.to_string(),
            platform: platform.to_string(),
            containers,
            workers,
            timestamp: now_iso(),
        }
    }
}

/// Engine counters at the end of a scenario.
#[derive(Serialize)]
pub struct EventEngineStats {
    pub event: &'static str,
    pub scenario: String,
    pub stats: MessagingStats,
    pub elapsed_s: f64,
}

// ── Burst ───────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventBurstResult {
    pub event: &'static str,
    pub round: u32,
    pub agents: usize,
    pub messages_sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub rejected: u64,
    pub payload_size: usize,
    pub elapsed_ms: f64,
    pub messages_per_sec: f64,
    pub latency: LatencySnapshot,
    pub settled: bool,
    pub elapsed_s: f64,
}

// ── Migration storm ─────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventMigration {
    pub event: &'static str,
    pub agent: String,
    pub from: String,
    pub to: String,
    pub elapsed_s: f64,
}

#[derive(Serialize)]
pub struct EventMigrationResult {
    pub event: &'static str,
    pub migrations: u32,
    pub messages_sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub retries: u64,
    pub cache_evictions: u64,
    pub settled: bool,
    pub elapsed_s: f64,
}

// ── Foreign routing ─────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventForeignResult {
    pub event: &'static str,
    pub messages_sent: u64,
    pub accepted_by_gateway: u64,
    pub gateway_refusals: u64,
    pub failed: u64,
    pub via_node: Option<String>,
    pub settled: bool,
    pub elapsed_s: f64,
}

// ── Back-pressure ───────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventBackpressureResult {
    pub event: &'static str,
    pub producers: u32,
    pub attempted: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub delivered: u64,
    pub peak_queued_bytes: usize,
    pub max_queue_bytes: usize,
    pub max_send_ms: f64,
    pub mean_send_ms: f64,
    pub settled: bool,
    pub elapsed_s: f64,
}
