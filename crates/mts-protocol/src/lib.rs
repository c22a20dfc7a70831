//! MTS delivery engine.
//!
//! Decouples sending a message from delivering it: sends go into a
//! bounded, coalescing outbound queue drained by a pool of deliverers,
//! which route each message to a mailbox in this process, to another node
//! of the platform, or out through a transport to a foreign platform.
//! Undeliverable messages come back to their sender as FAILURE replies.
//!
//! Payload encoding for out-of-process hops: MessagePack.

pub mod cache;
pub mod channel;
pub mod config;
pub mod deliverer;
pub mod directory;
pub mod error;
pub mod failure;
pub mod local;
pub mod message;
pub mod messaging;
pub mod node;
pub mod outbox;
pub mod routing;
pub mod types;

pub use cache::LocationCache;
pub use channel::{Channel, DeliveryProgress, DeliveryReport};
pub use config::{DeliveryConfig, QueueLimits};
pub use deliverer::{classify, DelivererPool, DeliverySpeed, PoolStats};
pub use directory::{EntryGuard, LocationDirectory};
pub use error::{DeliveryError, MtpError};
pub use local::{InProcessContainer, Mailbox, StaticPlatform};
pub use message::{
    AclMessage, Deliverable, Message, MessageBatch, Performative, SingleMessage,
    IGNORE_FAILURE_PARAM,
};
pub use messaging::{
    DeliveryOutcome, MessagingService, MessagingServiceBuilder, MessagingStats, TransportFactory,
};
pub use node::{Authority, LocalAgents, NodeSlice, Platform};
pub use outbox::{Delivery, OutBox, OutBoxStats, PendingDelivery};
pub use routing::{protocol_of, Mtp, MtpDescriptor, OutPort, RoutingTable};
pub use types::{now_ms, AgentId, ContainerId, SYSTEM_AGENT_NAME};
