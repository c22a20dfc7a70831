/// In-process node implementations.
///
/// `InProcessContainer` hosts agents as `mpsc` mailboxes. It serves as the
/// local-agents collaborator of a node and, through its [`NodeSlice`]
/// impl, as that node seen from the rest of a same-process platform.
/// `StaticPlatform` is a map of such nodes plus the shared location
/// directory, for nodes that do not hold one.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use mts_metrics::Counter;
use tokio::sync::mpsc;

use crate::directory::LocationDirectory;
use crate::error::DeliveryError;
use crate::message::SingleMessage;
use crate::node::{LocalAgents, NodeSlice, Platform};
use crate::routing::{protocol_of, Mtp};
use crate::types::{AgentId, ContainerId};

/// Receiving end of an agent's mailbox.
pub type Mailbox = mpsc::UnboundedReceiver<SingleMessage>;

pub struct InProcessContainer {
    node: ContainerId,
    mailboxes: DashMap<AgentId, mpsc::UnboundedSender<SingleMessage>>,
    /// Transports this node can route out through, by address.
    transports: DashMap<String, Arc<dyn Mtp>>,
    reachable: AtomicBool,
    posted: Counter,
}

impl InProcessContainer {
    pub fn new(node: impl Into<ContainerId>) -> Self {
        Self {
            node: node.into(),
            mailboxes: DashMap::new(),
            transports: DashMap::new(),
            reachable: AtomicBool::new(true),
            posted: Counter::new(),
        }
    }

    pub fn id(&self) -> &ContainerId {
        &self.node
    }

    /// Host `agent` here and return its mailbox. Replaces an existing one.
    pub fn register(&self, agent: AgentId) -> Mailbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.mailboxes.insert(agent, tx);
        rx
    }

    /// Stop hosting `agent`. Returns `false` if it was not here.
    pub fn deregister(&self, agent: &AgentId) -> bool {
        self.mailboxes.remove(agent).is_some()
    }

    pub fn hosts(&self, agent: &AgentId) -> bool {
        self.mailboxes.contains_key(agent)
    }

    pub fn agents(&self) -> Vec<AgentId> {
        self.mailboxes.iter().map(|e| e.key().clone()).collect()
    }

    /// Make `mtp` available for `route_out` requests on `address`.
    pub fn attach_transport(&self, address: impl Into<String>, mtp: Arc<dyn Mtp>) {
        self.transports.insert(address.into(), mtp);
    }

    pub fn detach_transport(&self, address: &str) -> bool {
        self.transports.remove(address).is_some()
    }

    /// Simulate the node going down (`false`) or coming back.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Relaxed);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Relaxed)
    }

    /// Messages posted into mailboxes so far.
    pub fn posted(&self) -> u64 {
        self.posted.get()
    }

    fn ensure_reachable(&self) -> Result<(), DeliveryError> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(DeliveryError::unreachable(&self.node, "node is down"))
        }
    }
}

impl LocalAgents for InProcessContainer {
    fn post_to_local_agent(&self, message: &SingleMessage, receiver: &AgentId) -> bool {
        let Some(mailbox) = self.mailboxes.get(receiver).map(|e| e.value().clone()) else {
            return false;
        };
        if mailbox.send(message.clone()).is_err() {
            // Mailbox dropped: the agent is gone.
            self.mailboxes.remove(receiver);
            return false;
        }
        self.posted.inc();
        true
    }
}

#[async_trait::async_trait]
impl NodeSlice for InProcessContainer {
    fn node(&self) -> &ContainerId {
        &self.node
    }

    async fn dispatch_locally(
        &self,
        _sender: &AgentId,
        message: &SingleMessage,
        receiver: &AgentId,
    ) -> Result<(), DeliveryError> {
        self.ensure_reachable()?;
        if self.post_to_local_agent(message, receiver) {
            Ok(())
        } else {
            Err(DeliveryError::not_found(receiver))
        }
    }

    async fn route_out(
        &self,
        message: &SingleMessage,
        receiver: &AgentId,
        address: &str,
    ) -> Result<(), DeliveryError> {
        self.ensure_reachable()?;
        let protocol = protocol_of(address);
        let mtp = self
            .transports
            .iter()
            .find(|e| protocol.is_some() && protocol_of(e.key()) == protocol)
            .map(|e| e.value().clone())
            .ok_or_else(|| DeliveryError::NoRoute {
                agent: receiver.to_string(),
                reason: format!("node {} has no transport for {address}", self.node),
            })?;
        mtp.deliver(address, message)
            .await
            .map_err(|e| DeliveryError::unreachable(address, e))
    }
}

/// Same-process platform: nodes by name plus the shared location directory.
#[derive(Default)]
pub struct StaticPlatform {
    nodes: DashMap<ContainerId, Arc<dyn NodeSlice>>,
    directory: Option<Arc<LocationDirectory<ContainerId>>>,
}

impl StaticPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `owning_node` from `directory` (the main node's).
    pub fn with_directory(directory: Arc<LocationDirectory<ContainerId>>) -> Self {
        Self {
            nodes: DashMap::new(),
            directory: Some(directory),
        }
    }

    pub fn add_node(&self, slice: Arc<dyn NodeSlice>) {
        self.nodes.insert(slice.node().clone(), slice);
    }

    pub fn remove_node(&self, node: &ContainerId) -> bool {
        self.nodes.remove(node).is_some()
    }

    pub fn nodes(&self) -> Vec<ContainerId> {
        let mut nodes: Vec<ContainerId> = self.nodes.iter().map(|e| e.key().clone()).collect();
        nodes.sort();
        nodes
    }
}

#[async_trait::async_trait]
impl Platform for StaticPlatform {
    fn slice(&self, node: &ContainerId) -> Option<Arc<dyn NodeSlice>> {
        self.nodes.get(node).map(|e| e.value().clone())
    }

    async fn owning_node(&self, agent: &AgentId) -> Result<ContainerId, DeliveryError> {
        let Some(directory) = &self.directory else {
            return Err(DeliveryError::not_found(agent));
        };
        directory
            .get(agent)
            .await
            .ok_or_else(|| DeliveryError::not_found(agent))
    }
}
