/// Collaborator interfaces consumed by the delivery engine.
///
/// The engine never talks to containers, agents or the network directly;
/// the hosting framework plugs these in:
/// - `NodeSlice`: a handle on one node of the platform (local or remote).
/// - `Platform`: how to reach a node by name, and where an agent lives
///   when this node keeps no location directory of its own.
/// - `LocalAgents`: post into the mailbox of an agent living here.
/// - `Authority`: optional security veto on a delivery.
use std::sync::Arc;

use crate::error::DeliveryError;
use crate::message::SingleMessage;
use crate::types::{AgentId, ContainerId};

/// Handle through which one node of the platform is invoked.
#[async_trait::async_trait]
pub trait NodeSlice: Send + Sync {
    /// Name of the node behind this handle.
    fn node(&self) -> &ContainerId;

    /// Hand `message` to `receiver`, which is expected to live on this node.
    ///
    /// `NotFound` if the receiver is not (or no longer) there,
    /// `Unreachable` if the node cannot be contacted.
    async fn dispatch_locally(
        &self,
        sender: &AgentId,
        message: &SingleMessage,
        receiver: &AgentId,
    ) -> Result<(), DeliveryError>;

    /// Ask this node to send `message` out through one of its transports.
    async fn route_out(
        &self,
        message: &SingleMessage,
        receiver: &AgentId,
        address: &str,
    ) -> Result<(), DeliveryError>;
}

/// Access to the other nodes of the platform.
#[async_trait::async_trait]
pub trait Platform: Send + Sync {
    /// Handle on `node`, or `None` if the node is no longer part of the platform.
    fn slice(&self, node: &ContainerId) -> Option<Arc<dyn NodeSlice>>;

    /// Ask the node holding the location directory where `agent` lives.
    ///
    /// Used by nodes without a directory of their own. `NotFound` if the
    /// agent is not registered anywhere.
    async fn owning_node(&self, agent: &AgentId) -> Result<ContainerId, DeliveryError>;
}

/// Agents hosted by this process.
pub trait LocalAgents: Send + Sync {
    /// Post into `receiver`'s mailbox. Returns `false` if no such agent lives here.
    fn post_to_local_agent(&self, message: &SingleMessage, receiver: &AgentId) -> bool;
}

/// Security collaborator: may veto a delivery before it is attempted.
pub trait Authority: Send + Sync {
    fn authorize(&self, sender: &AgentId, receiver: &AgentId) -> Result<(), DeliveryError>;
}
