use crate::common::{content, elapsed_s, Testbed};
use crate::events::*;
use mts_metrics::Counter;
use mts_protocol::{AgentId, ContainerId, Mtp, MtpDescriptor, MtpError, SingleMessage};
use std::sync::Arc;
use std::time::{Duration, Instant};

const GATEWAY_CLASS: &str = "stress.sim";

pub struct ForeignConfig {
    pub receivers: usize,
    pub count: u32,
    /// Give every other receiver a dead first address.
    pub dead_first: bool,
    /// Install the gateway on `c1` and route through it instead of locally.
    pub via_node: bool,
    pub settle_timeout: Duration,
}

/// Simulated gateway to the foreign platform `far`: accepts anything sent
/// to a `sim://` address, except hosts named `down`.
#[derive(Default)]
struct SimGateway {
    accepted: Counter,
    refused: Counter,
}

#[async_trait::async_trait]
impl Mtp for SimGateway {
    fn name(&self) -> &str {
        "sim-gateway"
    }

    fn protocols(&self) -> Vec<String> {
        vec!["sim".to_string()]
    }

    async fn deliver(&self, address: &str, _message: &SingleMessage) -> Result<(), MtpError> {
        if address.starts_with("sim://down") {
            self.refused.inc();
            return Err(MtpError::Send {
                address: address.to_string(),
                reason: "host down".to_string(),
            });
        }
        self.accepted.inc();
        Ok(())
    }
}

fn install_gateway(
    bed: &Testbed,
    gateway: &Arc<SimGateway>,
    via_node: bool,
) -> anyhow::Result<Option<ContainerId>> {
    if via_node && bed.nodes.len() > 1 {
        let node = &bed.nodes[1];
        let address = format!("sim://{}:9000/acc", node.id());
        node.attach_transport(address.clone(), gateway.clone());
        let descriptor = MtpDescriptor {
            name: "sim-gateway".to_string(),
            class_name: GATEWAY_CLASS.to_string(),
            addresses: vec![address],
            protocols: vec!["sim".to_string()],
        };
        bed.svc.announce_route(&descriptor, node.id())?;
        return Ok(Some(node.id().clone()));
    }

    let shared = gateway.clone();
    bed.svc.register_transport_class(GATEWAY_CLASS, move |_address| {
        Ok(shared.clone() as Arc<dyn Mtp>)
    });
    bed.svc.install_transport("sim://main:9000/acc", GATEWAY_CLASS)?;
    Ok(None)
}

/// Send to agents of a foreign platform through a simulated gateway.
pub async fn run(bed: &Testbed, config: ForeignConfig, start: Instant) -> anyhow::Result<()> {
    let gateway = Arc::new(SimGateway::default());
    let via = install_gateway(bed, &gateway, config.via_node)?;

    let receivers: Vec<AgentId> = (0..config.receivers.max(1))
        .map(|i| {
            let id = AgentId::new(format!("remote{i}@far"));
            if config.dead_first && i % 2 == 1 {
                id.with_address("sim://down:9000/acc")
                    .with_address("sim://far:9000/acc")
            } else {
                id.with_address("sim://far:9000/acc")
            }
        })
        .collect();
    eprintln!(
        "Foreign routing: {} receivers on far, {} msgs, gateway {}",
        receivers.len(),
        config.count,
        via.as_ref()
            .map(|n| format!("on {n}"))
            .unwrap_or_else(|| "local".to_string())
    );

    let mut sent = 0u64;
    for i in 0..config.count as usize {
        let message = bed.message(&receivers[i % receivers.len()], content(128, i as u64));
        if bed.svc.send(message).await.is_ok() {
            sent += 1;
        }
    }

    // Foreign deliveries never reach a local mailbox: count them at the gateway.
    let deadline = Instant::now() + config.settle_timeout;
    let mut settled = false;
    while Instant::now() < deadline {
        if gateway.accepted.get() + bed.sinks.failures.get() >= sent {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    emit(&EventForeignResult {
        event: "foreign_result",
        messages_sent: sent,
        accepted_by_gateway: gateway.accepted.get(),
        gateway_refusals: gateway.refused.get(),
        failed: bed.sinks.failures.get(),
        via_node: via.map(|n| n.to_string()),
        settled,
        elapsed_s: elapsed_s(start),
    });
    eprintln!(
        "  {sent} sent, {} accepted, {} refused first tries",
        gateway.accepted.get(),
        gateway.refused.get()
    );
    Ok(())
}
