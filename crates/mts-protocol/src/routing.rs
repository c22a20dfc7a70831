/// Routing table: which transport can reach a given address.
///
/// Two kinds of routes:
/// - local: a transport (MTP) activated in this process;
/// - remote: a transport activated on another node of the platform and
///   announced to us, reached by forwarding through that node's slice.
///
/// Lookup goes by address scheme (`http://...` → `http`): any transport
/// speaking the protocol can send to any address of that protocol. Local
/// transports win over remote ones; among equals, the earliest installed
/// or announced wins.
///
/// Remote routes keep the set of nodes announcing them. Duplicate
/// announcements from the same node are no-ops; the route disappears when
/// its last announcer withdraws.
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::MtpError;
use crate::message::SingleMessage;
use crate::node::NodeSlice;
use crate::types::ContainerId;

/// A message transport protocol implementation.
#[async_trait::async_trait]
pub trait Mtp: Send + Sync {
    /// Implementation name, e.g. `http-mtp`.
    fn name(&self) -> &str;

    /// Address schemes this transport can send to.
    fn protocols(&self) -> Vec<String>;

    /// Send `message` to the foreign endpoint at `address`.
    async fn deliver(&self, address: &str, message: &SingleMessage) -> Result<(), MtpError>;
}

/// Description of an installed or announced transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MtpDescriptor {
    pub name: String,
    pub class_name: String,
    /// Addresses this transport receives on.
    pub addresses: Vec<String>,
    /// Schemes it can send to.
    pub protocols: Vec<String>,
}

impl MtpDescriptor {
    fn speaks(&self, protocol: &str) -> bool {
        self.protocols.iter().any(|p| p.eq_ignore_ascii_case(protocol))
    }
}

/// Scheme of a transport address (`http` for `http://host:7778/acc`).
pub fn protocol_of(address: &str) -> Option<&str> {
    address
        .split_once(':')
        .map(|(scheme, _)| scheme)
        .filter(|scheme| !scheme.is_empty())
}

/// Where to hand a message for a given address.
#[derive(Clone)]
pub enum OutPort {
    /// A transport activated in this process.
    Local { mtp: Arc<dyn Mtp> },
    /// Forward to another node that has a suitable transport.
    Remote {
        node: ContainerId,
        slice: Arc<dyn NodeSlice>,
    },
}

impl fmt::Debug for OutPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutPort::Local { mtp } => write!(f, "Local({})", mtp.name()),
            OutPort::Remote { node, .. } => write!(f, "Remote({node})"),
        }
    }
}

// ── Routing table ──────────────────────────────────────────────────────

struct LocalRoute {
    address: String,
    descriptor: MtpDescriptor,
    mtp: Arc<dyn Mtp>,
}

struct RemoteRoute {
    address: String,
    descriptor: MtpDescriptor,
    /// Nodes currently announcing this address, in announcement order.
    owners: Vec<(ContainerId, Arc<dyn NodeSlice>)>,
}

#[derive(Default)]
struct Routes {
    local: Vec<LocalRoute>,
    remote: Vec<RemoteRoute>,
}

/// Address → transport routing, guarded by a single short-held lock.
#[derive(Default)]
pub struct RoutingTable {
    routes: Mutex<Routes>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport activated in this process on `address`.
    ///
    /// Replaces any local route previously bound to the same address.
    pub fn add_local(&self, address: &str, mtp: Arc<dyn Mtp>, descriptor: MtpDescriptor) {
        let mut routes = self.routes.lock();
        routes.local.retain(|r| r.address != address);
        routes.local.push(LocalRoute {
            address: address.to_string(),
            descriptor,
            mtp,
        });
    }

    /// Remove the local transport bound to `address`.
    pub fn remove_local(&self, address: &str) -> Option<MtpDescriptor> {
        let mut routes = self.routes.lock();
        let pos = routes.local.iter().position(|r| r.address == address)?;
        Some(routes.local.remove(pos).descriptor)
    }

    /// Record that `owner` announces the transport described by `descriptor`.
    ///
    /// Returns `true` if at least one (address, owner) pair was new. A
    /// repeated announcement returns `false` and changes nothing.
    pub fn add_remote(
        &self,
        descriptor: &MtpDescriptor,
        owner: &ContainerId,
        slice: Arc<dyn NodeSlice>,
    ) -> bool {
        let mut routes = self.routes.lock();
        let mut added = false;
        for address in &descriptor.addresses {
            let route = match routes.remote.iter().position(|r| &r.address == address) {
                Some(pos) => &mut routes.remote[pos],
                None => {
                    routes.remote.push(RemoteRoute {
                        address: address.clone(),
                        descriptor: descriptor.clone(),
                        owners: Vec::new(),
                    });
                    let last = routes.remote.len() - 1;
                    &mut routes.remote[last]
                }
            };
            if !route.owners.iter().any(|(n, _)| n == owner) {
                route.owners.push((owner.clone(), slice.clone()));
                added = true;
            }
        }
        added
    }

    /// Record that `owner` no longer announces `descriptor`.
    ///
    /// Returns the addresses that lost their last announcer.
    pub fn remove_remote(&self, descriptor: &MtpDescriptor, owner: &ContainerId) -> Vec<String> {
        let mut routes = self.routes.lock();
        for route in routes
            .remote
            .iter_mut()
            .filter(|r| descriptor.addresses.contains(&r.address))
        {
            route.owners.retain(|(n, _)| n != owner);
        }
        Self::prune(&mut routes)
    }

    /// Forget every route announced by `node` (it left the platform).
    ///
    /// Returns the addresses that lost their last announcer.
    pub fn remove_node(&self, node: &ContainerId) -> Vec<String> {
        let mut routes = self.routes.lock();
        for route in routes.remote.iter_mut() {
            route.owners.retain(|(n, _)| n != node);
        }
        Self::prune(&mut routes)
    }

    /// Find the out port able to send to `address`.
    pub fn lookup(&self, address: &str) -> Option<OutPort> {
        let protocol = protocol_of(address)?;
        let routes = self.routes.lock();

        if let Some(route) = routes.local.iter().find(|r| r.descriptor.speaks(protocol)) {
            return Some(OutPort::Local {
                mtp: route.mtp.clone(),
            });
        }

        routes
            .remote
            .iter()
            .filter(|r| r.descriptor.speaks(protocol))
            .find_map(|r| r.owners.first())
            .map(|(node, slice)| OutPort::Remote {
                node: node.clone(),
                slice: slice.clone(),
            })
    }

    /// Every address routable from here, local first, without duplicates.
    pub fn all_addresses(&self) -> Vec<String> {
        let routes = self.routes.lock();
        let mut addresses: Vec<String> = Vec::new();
        let all = routes
            .local
            .iter()
            .map(|r| &r.address)
            .chain(routes.remote.iter().map(|r| &r.address));
        for address in all {
            if !addresses.contains(address) {
                addresses.push(address.clone());
            }
        }
        addresses
    }

    /// Descriptors of the transports activated in this process.
    pub fn local_mtps(&self) -> Vec<MtpDescriptor> {
        self.routes
            .lock()
            .local
            .iter()
            .map(|r| r.descriptor.clone())
            .collect()
    }

    /// Whether any route (local or remote) is bound to exactly `address`.
    pub fn has_address(&self, address: &str) -> bool {
        let routes = self.routes.lock();
        routes.local.iter().any(|r| r.address == address)
            || routes.remote.iter().any(|r| r.address == address)
    }

    fn prune(routes: &mut Routes) -> Vec<String> {
        let mut gone = Vec::new();
        routes.remote.retain(|r| {
            if r.owners.is_empty() {
                gone.push(r.address.clone());
                false
            } else {
                true
            }
        });
        gone
    }
}
