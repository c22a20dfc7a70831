/// Messaging service: the send API and the routing decision.
///
/// `send` stamps each copy of a message for one receiver and puts it in the
/// [`OutBox`]. The deliverer pool hands it back here (this service is the
/// [`Channel`]), and `deliver` decides where it goes:
///
/// 1. Foreign receiver: try its transport addresses in order through the
///    routing table; the first success wins.
/// 2. Cached location: dispatch to the cached node; a `NotFound` or
///    `Unreachable` evicts the entry and falls through.
/// 3. Resolve the owning node (own location directory, or ask the
///    platform) and dispatch there. `NotFound` is retried with a pause, up
///    to the configured number of attempts; success is cached.
///
/// A message that fails terminally is reported to its sender with a
/// FAILURE notification, queued through the same outbox.
use std::borrow::Cow;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use mts_metrics::Counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::cache::LocationCache;
use crate::channel::{Channel, DeliveryProgress};
use crate::config::DeliveryConfig;
use crate::deliverer::{DelivererPool, PoolStats};
use crate::directory::LocationDirectory;
use crate::error::{DeliveryError, MtpError};
use crate::failure;
use crate::message::{Deliverable, Message, SingleMessage};
use crate::node::{Authority, LocalAgents, Platform};
use crate::outbox::{OutBox, OutBoxStats};
use crate::routing::{Mtp, MtpDescriptor, OutPort, RoutingTable};
use crate::types::{AgentId, ContainerId};

/// Builds a transport bound to the given address.
pub type TransportFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn Mtp>, MtpError> + Send + Sync>;

/// How a message reached its receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Posted into a mailbox on this node.
    Local,
    /// Handed to another node of the platform.
    Forwarded(ContainerId),
    /// Sent out of the platform on this address.
    Foreign { address: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagingStats {
    pub delivered_local: u64,
    pub forwarded: u64,
    pub foreign: u64,
    pub failed: u64,
    pub retries: u64,
    pub cache_evictions: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_entries: usize,
    pub notifications_sent: u64,
    pub notifications_dropped: u64,
    pub outbox: OutBoxStats,
    pub pool: Option<PoolStats>,
}

// ── Builder ────────────────────────────────────────────────────────────

pub struct MessagingServiceBuilder {
    platform_name: String,
    node: ContainerId,
    platform: Arc<dyn Platform>,
    local: Arc<dyn LocalAgents>,
    config: DeliveryConfig,
    directory: Option<Arc<LocationDirectory<ContainerId>>>,
    authority: Option<Arc<dyn Authority>>,
}

impl MessagingServiceBuilder {
    pub fn config(mut self, config: DeliveryConfig) -> Self {
        self.config = config;
        self
    }

    /// Hold the platform's location directory on this node.
    ///
    /// Nodes without one resolve agents through [`Platform::owning_node`].
    pub fn directory(mut self, directory: Arc<LocationDirectory<ContainerId>>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn authority(mut self, authority: Arc<dyn Authority>) -> Self {
        self.authority = Some(authority);
        self
    }

    /// Build the service. Deliveries start once [`MessagingService::start`]
    /// is called; until then sends only queue.
    pub fn build(self) -> Arc<MessagingService> {
        let outbox = Arc::new(OutBox::from_config(&self.config));
        let cache = LocationCache::new(self.config.location_cache_size);
        Arc::new_cyclic(|me| MessagingService {
            me: me.clone(),
            platform_name: self.platform_name,
            node: self.node,
            platform: self.platform,
            local: self.local,
            directory: self.directory,
            authority: self.authority,
            config: self.config,
            outbox,
            pool: Mutex::new(None),
            cache,
            routing: RoutingTable::new(),
            transport_classes: DashMap::new(),
            platform_addresses: Mutex::new(Vec::new()),
            delivered_local: Counter::new(),
            forwarded: Counter::new(),
            foreign: Counter::new(),
            failed: Counter::new(),
            retries: Counter::new(),
            cache_evictions: Counter::new(),
            notifications_sent: Counter::new(),
            notifications_dropped: Counter::new(),
        })
    }
}

// ── Service ────────────────────────────────────────────────────────────

pub struct MessagingService {
    me: Weak<MessagingService>,
    platform_name: String,
    node: ContainerId,
    platform: Arc<dyn Platform>,
    local: Arc<dyn LocalAgents>,
    directory: Option<Arc<LocationDirectory<ContainerId>>>,
    authority: Option<Arc<dyn Authority>>,
    config: DeliveryConfig,
    outbox: Arc<OutBox>,
    pool: Mutex<Option<Arc<DelivererPool>>>,
    cache: LocationCache,
    routing: RoutingTable,
    transport_classes: DashMap<String, TransportFactory>,
    /// Addresses the platform can be reached on, in the order they appeared.
    platform_addresses: Mutex<Vec<String>>,
    delivered_local: Counter,
    forwarded: Counter,
    foreign: Counter,
    failed: Counter,
    retries: Counter,
    cache_evictions: Counter,
    notifications_sent: Counter,
    notifications_dropped: Counter,
}

impl MessagingService {
    pub fn builder(
        platform_name: impl Into<String>,
        node: impl Into<ContainerId>,
        platform: Arc<dyn Platform>,
        local: Arc<dyn LocalAgents>,
    ) -> MessagingServiceBuilder {
        MessagingServiceBuilder {
            platform_name: platform_name.into(),
            node: node.into(),
            platform,
            local,
            config: DeliveryConfig::default(),
            directory: None,
            authority: None,
        }
    }

    pub fn platform_name(&self) -> &str {
        &self.platform_name
    }

    pub fn node(&self) -> &ContainerId {
        &self.node
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub fn outbox(&self) -> &Arc<OutBox> {
        &self.outbox
    }

    pub fn cache(&self) -> &LocationCache {
        &self.cache
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn directory(&self) -> Option<&Arc<LocationDirectory<ContainerId>>> {
        self.directory.as_ref()
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Spawn the deliverer pool. Must run inside a tokio runtime.
    pub fn start(&self) {
        let mut pool = self.pool.lock();
        if pool.is_some() {
            tracing::warn!("mts {}: already started", self.node);
            return;
        }
        *pool = Some(Arc::new(DelivererPool::start(
            self.outbox.clone(),
            &self.config,
        )));
        tracing::info!(
            "mts {}: started, platform {}",
            self.node,
            self.platform_name
        );
    }

    /// Refuse new sends, deliver what is queued, stop the workers.
    pub async fn shutdown(&self) {
        let pool = self.pool.lock().clone();
        match pool {
            Some(pool) => pool.shutdown().await,
            None => self.outbox.shutdown(0),
        }
    }

    // ── Send API ───────────────────────────────────────────────────────

    /// Queue one copy of `message` per intended receiver.
    ///
    /// Stops at the first rejection; copies for earlier receivers stay queued.
    pub async fn send(&self, message: SingleMessage) -> Result<(), DeliveryError> {
        let receivers = message.intended_receivers().to_vec();
        for receiver in receivers {
            self.send_to(message.clone(), receiver).await?;
        }
        Ok(())
    }

    /// Queue `message` for `receiver`.
    pub async fn send_to(
        &self,
        mut message: SingleMessage,
        receiver: AgentId,
    ) -> Result<(), DeliveryError> {
        message.set_foreign_receiver(receiver.is_foreign_to(&self.platform_name));
        let channel = self.channel()?;
        self.outbox.add_last(receiver, message, channel).await
    }

    /// Queue `message` for `receiver`, failing it with `Expired` if it is
    /// still undelivered at `deadline`.
    pub async fn send_with_deadline(
        &self,
        mut message: SingleMessage,
        receiver: AgentId,
        deadline: Instant,
    ) -> Result<(), DeliveryError> {
        message.set_foreign_receiver(receiver.is_foreign_to(&self.platform_name));
        let channel = self.channel()?;
        self.outbox
            .add_last_with_deadline(receiver, message, channel, deadline)
            .await
    }

    // ── Agent registry ─────────────────────────────────────────────────

    /// Record that `agent` now lives on `node`. Returns the previous node.
    ///
    /// Only meaningful on the node holding the location directory.
    pub async fn register_agent(&self, agent: AgentId, node: ContainerId) -> Option<ContainerId> {
        let Some(directory) = &self.directory else {
            tracing::warn!(
                "mts {}: cannot register {agent}: no location directory on this node",
                self.node
            );
            return None;
        };
        let previous = directory.put(agent.clone(), node.clone()).await;
        if previous.as_ref().is_some_and(|p| p != &node) {
            self.cache.remove(&agent);
        }
        tracing::debug!("mts {}: {agent} registered at {node}", self.node);
        previous
    }

    /// Forget `agent`. Returns the node it was registered at.
    pub async fn deregister_agent(&self, agent: &AgentId) -> Option<ContainerId> {
        let removed = match &self.directory {
            Some(directory) => directory.remove(agent).await,
            None => None,
        };
        self.cache.remove(agent);
        removed
    }

    /// Node currently owning `agent`.
    pub async fn owning_node(&self, agent: &AgentId) -> Result<ContainerId, DeliveryError> {
        match &self.directory {
            Some(directory) => directory
                .get(agent)
                .await
                .ok_or_else(|| DeliveryError::not_found(agent)),
            None => self.platform.owning_node(agent).await,
        }
    }

    /// Identifier of local agent `name`, carrying the platform addresses.
    pub fn local_agent_id(&self, name: &str) -> AgentId {
        let mut id = AgentId::local(name, &self.platform_name);
        for address in self.platform_addresses.lock().iter() {
            id.add_address(address.clone());
        }
        id
    }

    pub fn platform_addresses(&self) -> Vec<String> {
        self.platform_addresses.lock().clone()
    }

    // ── Transports ─────────────────────────────────────────────────────

    /// Make transport class `class_name` available to `install_transport`.
    pub fn register_transport_class<F>(&self, class_name: impl Into<String>, factory: F)
    where
        F: Fn(&str) -> Result<Arc<dyn Mtp>, MtpError> + Send + Sync + 'static,
    {
        self.transport_classes
            .insert(class_name.into(), Arc::new(factory));
    }

    /// Activate a transport of class `class_name` on `address`.
    pub fn install_transport(
        &self,
        address: &str,
        class_name: &str,
    ) -> Result<MtpDescriptor, DeliveryError> {
        let factory = self
            .transport_classes
            .get(class_name)
            .map(|e| e.value().clone())
            .ok_or_else(|| DeliveryError::NoRoute {
                agent: address.to_string(),
                reason: MtpError::UnknownClass(class_name.to_string()).to_string(),
            })?;
        let mtp = factory(address).map_err(|e| DeliveryError::unreachable(address, e))?;

        let descriptor = MtpDescriptor {
            name: mtp.name().to_string(),
            class_name: class_name.to_string(),
            addresses: vec![address.to_string()],
            protocols: mtp.protocols(),
        };
        self.routing.add_local(address, mtp, descriptor.clone());
        self.add_platform_addresses(&descriptor.addresses);
        tracing::info!(
            "mts {}: transport {} installed on {address}",
            self.node,
            descriptor.name
        );
        Ok(descriptor)
    }

    /// Deactivate the transport on `address`.
    pub fn uninstall_transport(&self, address: &str) -> Option<MtpDescriptor> {
        let descriptor = self.routing.remove_local(address)?;
        if !self.routing.has_address(address) {
            self.remove_platform_addresses(&[address.to_string()]);
        }
        tracing::info!("mts {}: transport on {address} uninstalled", self.node);
        Some(descriptor)
    }

    /// `owner` announces a transport it activated.
    ///
    /// Returns `Ok(false)` for a repeated announcement, which changes nothing.
    pub fn announce_route(
        &self,
        descriptor: &MtpDescriptor,
        owner: &ContainerId,
    ) -> Result<bool, DeliveryError> {
        let slice = self
            .platform
            .slice(owner)
            .ok_or_else(|| DeliveryError::unreachable(owner, "node is not part of the platform"))?;
        let added = self.routing.add_remote(descriptor, owner, slice);
        if added {
            self.add_platform_addresses(&descriptor.addresses);
            tracing::debug!(
                "mts {}: route {:?} announced by {owner}",
                self.node,
                descriptor.addresses
            );
        }
        Ok(added)
    }

    /// `owner` withdraws a transport. Returns the addresses no longer routable.
    pub fn withdraw_route(&self, descriptor: &MtpDescriptor, owner: &ContainerId) -> Vec<String> {
        let gone = self.routing.remove_remote(descriptor, owner);
        self.drop_unrouted(&gone);
        gone
    }

    /// `node` left the platform: drop its routes and cached locations.
    pub fn node_left(&self, node: &ContainerId) {
        let gone = self.routing.remove_node(node);
        self.drop_unrouted(&gone);
        let evicted = self.cache.remove_node(node);
        tracing::info!(
            "mts {}: node {node} left ({} routes, {evicted} cached locations dropped)",
            self.node,
            gone.len()
        );
    }

    // ── Routing decision ───────────────────────────────────────────────

    /// Deliver one message to `receiver` now, without queueing.
    pub async fn deliver(
        &self,
        message: &SingleMessage,
        receiver: &AgentId,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        if let Some(authority) = &self.authority {
            authority.authorize(message.sender(), receiver)?;
        }

        let mut message = Cow::Borrowed(message);
        if message.is_foreign_receiver() {
            return self.deliver_foreign(&mut message, receiver).await;
        }

        if let Some(node) = self.cache.get(receiver) {
            match self.dispatch(&node, &mut message, receiver).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.evicts_cache() => {
                    tracing::debug!(
                        "mts {}: cached location {node} of {receiver} is stale: {e}",
                        self.node
                    );
                    self.cache.remove(receiver);
                    self.cache_evictions.inc();
                }
                Err(e) => return Err(e),
            }
        }

        self.deliver_until_resolved(&mut message, receiver).await
    }

    async fn deliver_until_resolved(
        &self,
        message: &mut Cow<'_, SingleMessage>,
        receiver: &AgentId,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let max = self.config.max_resolution_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match self.owning_node(receiver).await {
                Ok(node) => match self.dispatch(&node, message, receiver).await {
                    Ok(outcome) => Ok((node, outcome)),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            match result {
                Ok((node, outcome)) => {
                    self.cache.put(receiver.clone(), node);
                    return Ok(outcome);
                }
                Err(e) if e.is_retryable() && attempt < max => {
                    self.retries.inc();
                    tracing::debug!(
                        "mts {}: {receiver} not found (attempt {attempt}/{max}), retrying",
                        self.node
                    );
                    tokio::time::sleep(self.config.resolution_retry_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dispatch(
        &self,
        node: &ContainerId,
        message: &mut Cow<'_, SingleMessage>,
        receiver: &AgentId,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        if node == &self.node {
            return if self.local.post_to_local_agent(message, receiver) {
                self.delivered_local.inc();
                Ok(DeliveryOutcome::Local)
            } else {
                Err(DeliveryError::not_found(receiver))
            };
        }

        let slice = self
            .platform
            .slice(node)
            .ok_or_else(|| DeliveryError::unreachable(node, "node is not part of the platform"))?;
        let outgoing = encoded(message)?;
        slice
            .dispatch_locally(outgoing.sender(), outgoing, receiver)
            .await?;
        self.forwarded.inc();
        Ok(DeliveryOutcome::Forwarded(node.clone()))
    }

    async fn deliver_foreign(
        &self,
        message: &mut Cow<'_, SingleMessage>,
        receiver: &AgentId,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let addresses = receiver.addresses();
        if addresses.is_empty() {
            return Err(DeliveryError::NoAddress {
                agent: receiver.to_string(),
            });
        }
        let outgoing = encoded(message)?;

        let mut failed: Vec<&str> = Vec::new();
        for address in addresses {
            let result = match self.routing.lookup(address) {
                None => {
                    tracing::debug!("mts {}: no transport for {address}", self.node);
                    continue;
                }
                Some(OutPort::Local { mtp }) => mtp
                    .deliver(address, outgoing)
                    .await
                    .map_err(|e| DeliveryError::unreachable(address, e)),
                Some(OutPort::Remote { slice, .. }) => {
                    slice.route_out(outgoing, receiver, address).await
                }
            };
            match result {
                Ok(()) => {
                    self.foreign.inc();
                    return Ok(DeliveryOutcome::Foreign {
                        address: address.clone(),
                    });
                }
                Err(e) => {
                    tracing::warn!("mts {}: sending to {address} failed: {e}", self.node);
                    failed.push(address);
                }
            }
        }

        if failed.is_empty() {
            Err(DeliveryError::NoRoute {
                agent: receiver.to_string(),
                reason: "no transport for any of its addresses".to_string(),
            })
        } else {
            Err(DeliveryError::unreachable(
                receiver,
                format!("all addresses unreachable: {}", failed.join(", ")),
            ))
        }
    }

    // ── Statistics ─────────────────────────────────────────────────────

    pub fn stats(&self) -> MessagingStats {
        let (cache_hits, cache_misses) = self.cache.hit_stats();
        MessagingStats {
            delivered_local: self.delivered_local.get(),
            forwarded: self.forwarded.get(),
            foreign: self.foreign.get(),
            failed: self.failed.get(),
            retries: self.retries.get(),
            cache_evictions: self.cache_evictions.get(),
            cache_hits,
            cache_misses,
            cache_entries: self.cache.len(),
            notifications_sent: self.notifications_sent.get(),
            notifications_dropped: self.notifications_dropped.get(),
            outbox: self.outbox.stats(),
            pool: self.pool.lock().as_ref().map(|p| p.stats()),
        }
    }

    // ── Internal ───────────────────────────────────────────────────────

    fn channel(&self) -> Result<Arc<dyn Channel>, DeliveryError> {
        let me = self.me.upgrade().ok_or(DeliveryError::ShutDown)?;
        Ok(me as Arc<dyn Channel>)
    }

    fn add_platform_addresses(&self, addresses: &[String]) {
        let mut known = self.platform_addresses.lock();
        for address in addresses {
            if !known.contains(address) {
                known.push(address.clone());
            }
        }
    }

    fn remove_platform_addresses(&self, addresses: &[String]) {
        self.platform_addresses
            .lock()
            .retain(|a| !addresses.contains(a));
    }

    /// Drop platform addresses that lost their route, unless still routed locally.
    fn drop_unrouted(&self, gone: &[String]) {
        let unrouted: Vec<String> = gone
            .iter()
            .filter(|a| !self.routing.has_address(a))
            .cloned()
            .collect();
        self.remove_platform_addresses(&unrouted);
    }
}

/// The message with its payload encoded, ready to leave the process.
/// Encodes at most once per delivery.
fn encoded<'a>(message: &'a mut Cow<'_, SingleMessage>) -> Result<&'a SingleMessage, DeliveryError> {
    if message.encoded().is_none() {
        message.to_mut().encode()?;
    }
    Ok(&**message)
}

#[async_trait::async_trait]
impl Channel for MessagingService {
    async fn deliver_now(
        &self,
        message: &Message,
        receiver: &AgentId,
        progress: &DeliveryProgress,
    ) {
        for single in message.messages() {
            match self.deliver(single, receiver).await {
                Ok(outcome) => {
                    progress.delivered_one();
                    tracing::debug!(
                        "mts {}: {} delivered to {receiver}: {outcome:?}",
                        self.node,
                        single.describe()
                    );
                }
                Err(e) => {
                    progress.failed_one();
                    self.failed.inc();
                    tracing::debug!(
                        "mts {}: {} to {receiver} failed: {e}",
                        self.node,
                        single.describe()
                    );
                    self.notify_failure_to_sender(single, receiver, &e).await;
                }
            }
        }
    }

    async fn notify_failure_to_sender(
        &self,
        message: &SingleMessage,
        receiver: &AgentId,
        error: &DeliveryError,
    ) {
        if failure::is_suppressed(message, &self.platform_name) {
            tracing::debug!(
                "mts {}: failure of {} to {receiver} not reported: {error}",
                self.node,
                message.describe()
            );
            return;
        }

        let mut notification =
            failure::failure_notification(message, receiver, error, &self.platform_name);
        let sender = message.sender().clone();
        notification.set_foreign_receiver(sender.is_foreign_to(&self.platform_name));

        let queued = self
            .channel()
            .and_then(|channel| self.outbox.try_add_last(sender.clone(), notification, channel));
        match queued {
            Ok(()) => self.notifications_sent.inc(),
            Err(e) => {
                self.notifications_dropped.inc();
                tracing::warn!(
                    "mts {}: failure notification to {sender} dropped: {e}",
                    self.node
                );
            }
        }
    }
}
