/// In-process platform every scenario runs against.
///
/// Node `main` holds the location directory and runs the engine; nodes
/// `c1..cN` are further in-process containers reached through their
/// `NodeSlice`. Every hosted agent's mailbox is drained by a sink task
/// feeding shared counters.
use std::sync::Arc;
use std::time::{Duration, Instant};

use mts_metrics::{Counter, LatencyStats};
use mts_protocol::{
    now_ms, AclMessage, AgentId, DeliveryConfig, InProcessContainer, LocationDirectory, Mailbox,
    MessagingService, Performative, SingleMessage, StaticPlatform,
};

pub const PLATFORM: &str = "stress";

/// What the mailboxes observed.
#[derive(Default)]
pub struct Sinks {
    pub delivered: Counter,
    /// FAILURE notifications received by the driver agent.
    pub failures: Counter,
    /// Enqueue to mailbox.
    pub latency: LatencyStats,
}

pub struct Testbed {
    pub svc: Arc<MessagingService>,
    pub platform: Arc<StaticPlatform>,
    pub nodes: Vec<Arc<InProcessContainer>>,
    pub driver: AgentId,
    pub sinks: Arc<Sinks>,
}

impl Testbed {
    /// Build the platform with `containers` nodes (at least one) and start the engine.
    pub async fn start(config: DeliveryConfig, containers: usize) -> Self {
        let directory = Arc::new(LocationDirectory::new());
        let platform = Arc::new(StaticPlatform::with_directory(directory.clone()));
        let main = Arc::new(InProcessContainer::new("main"));
        let mut nodes = vec![main.clone()];
        for i in 1..containers.max(1) {
            nodes.push(Arc::new(InProcessContainer::new(format!("c{i}"))));
        }
        for node in &nodes {
            platform.add_node(node.clone());
        }

        let svc = MessagingService::builder(PLATFORM, "main", platform.clone(), main.clone())
            .config(config)
            .directory(directory)
            .build();

        let sinks = Arc::new(Sinks::default());
        let driver = AgentId::local("driver", PLATFORM);
        let inbox = main.register(driver.clone());
        svc.register_agent(driver.clone(), main.id().clone()).await;
        spawn_failure_sink(inbox, sinks.clone());

        svc.start();
        Self {
            svc,
            platform,
            nodes,
            driver,
            sinks,
        }
    }

    /// Host a new agent on node `index` (modulo the node count).
    pub async fn host(&self, name: &str, index: usize) -> AgentId {
        let container = &self.nodes[index % self.nodes.len()];
        let id = AgentId::local(name, PLATFORM);
        let inbox = container.register(id.clone());
        self.svc
            .register_agent(id.clone(), container.id().clone())
            .await;
        spawn_sink(inbox, self.sinks.clone());
        id
    }

    /// Host `count` agents spread round-robin over the nodes.
    pub async fn host_many(&self, prefix: &str, count: usize) -> Vec<AgentId> {
        let mut agents = Vec::with_capacity(count);
        for i in 0..count {
            agents.push(self.host(&format!("{prefix}{i}"), i).await);
        }
        agents
    }

    /// Move `agent` from node `from` to node `to`, leaving it unhosted for `gap`.
    pub async fn migrate(&self, agent: &AgentId, from: usize, to: usize, gap: Duration) {
        let from = &self.nodes[from % self.nodes.len()];
        let to = &self.nodes[to % self.nodes.len()];
        from.deregister(agent);
        if !gap.is_zero() {
            tokio::time::sleep(gap).await;
        }
        let inbox = to.register(agent.clone());
        spawn_sink(inbox, self.sinks.clone());
        self.svc.register_agent(agent.clone(), to.id().clone()).await;
    }

    pub fn message(&self, receiver: &AgentId, content: String) -> SingleMessage {
        SingleMessage::new(
            AclMessage::new(Performative::Inform, self.driver.clone())
                .with_receiver(receiver.clone())
                .with_content(content),
        )
    }

    /// Messages accounted for so far (delivered or reported failed).
    pub fn accounted(&self) -> u64 {
        self.sinks.delivered.get() + self.sinks.failures.get()
    }

    /// Wait until `expected` messages are accounted for. `false` on timeout.
    pub async fn settle(&self, expected: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.accounted() < expected {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    pub fn node_name(&self, index: usize) -> String {
        self.nodes[index % self.nodes.len()].id().to_string()
    }
}

fn spawn_sink(mut inbox: Mailbox, sinks: Arc<Sinks>) {
    tokio::spawn(async move {
        while let Some(message) = inbox.recv().await {
            if let Some(at) = message.enqueued_at() {
                sinks
                    .latency
                    .record(Duration::from_millis(now_ms().saturating_sub(at)));
            }
            sinks.delivered.inc();
        }
    });
}

fn spawn_failure_sink(mut inbox: Mailbox, sinks: Arc<Sinks>) {
    tokio::spawn(async move {
        while let Some(message) = inbox.recv().await {
            if message.acl().performative == Performative::Failure {
                tracing::debug!("failure: {}", message.acl().content);
                sinks.failures.inc();
            }
        }
    });
}

/// Content of roughly `size` bytes tagged with `seq`.
pub fn content(size: usize, seq: u64) -> String {
    let tag = format!("#{seq}:");
    let fill = size.saturating_sub(tag.len());
    format!("{tag}{}", "x".repeat(fill))
}

pub fn elapsed_s(start: Instant) -> f64 {
    start.elapsed().as_secs_f64()
}
