use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Local name of the platform's system agent.
///
/// Failure notifications are sent on its behalf, and failures of messages
/// it sent are never reported back (that would loop).
pub const SYSTEM_AGENT_NAME: &str = "ams";

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── AgentId ────────────────────────────────────────────────────────────

/// Globally unique agent identifier.
///
/// The name has the form `local@platform`. Identity (equality, hashing)
/// is the name compared case-insensitively; transport addresses and
/// resolvers are routing hints and never affect identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentId {
    name: String,
    /// Transport addresses, unique, in the order they were added.
    addresses: Vec<String>,
    /// Name resolvers that may know further addresses for this agent.
    resolvers: Vec<AgentId>,
}

impl AgentId {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addresses: Vec::new(),
            resolvers: Vec::new(),
        }
    }

    /// Build `local@platform`.
    pub fn local(local_name: &str, platform: &str) -> Self {
        Self::new(format!("{local_name}@{platform}"))
    }

    /// The system agent of `platform`.
    pub fn system(platform: &str) -> Self {
        Self::local(SYSTEM_AGENT_NAME, platform)
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.add_address(address);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Part of the name before the last `@` (the whole name if there is none).
    pub fn local_name(&self) -> &str {
        self.name
            .rsplit_once('@')
            .map(|(local, _)| local)
            .unwrap_or(&self.name)
    }

    /// Platform part of the name, if any.
    pub fn platform(&self) -> Option<&str> {
        self.name.rsplit_once('@').map(|(_, platform)| platform)
    }

    /// True when the name names a platform other than `platform`.
    ///
    /// Names without a platform part are considered local.
    pub fn is_foreign_to(&self, platform: &str) -> bool {
        self.platform()
            .is_some_and(|p| !p.eq_ignore_ascii_case(platform))
    }

    /// True if this is the system agent (of any platform).
    pub fn is_system_agent(&self) -> bool {
        self.local_name().eq_ignore_ascii_case(SYSTEM_AGENT_NAME)
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Add a transport address. Returns `false` if it was already present.
    pub fn add_address(&mut self, address: impl Into<String>) -> bool {
        let address = address.into();
        if self.addresses.contains(&address) {
            return false;
        }
        self.addresses.push(address);
        true
    }

    /// Remove a transport address. Returns `false` if it was not present.
    pub fn remove_address(&mut self, address: &str) -> bool {
        let before = self.addresses.len();
        self.addresses.retain(|a| a != address);
        self.addresses.len() != before
    }

    pub fn clear_addresses(&mut self) {
        self.addresses.clear();
    }

    pub fn resolvers(&self) -> &[AgentId] {
        &self.resolvers
    }

    /// Add a resolver. Returns `false` if an equal resolver was already present.
    pub fn add_resolver(&mut self, resolver: AgentId) -> bool {
        if self.resolvers.contains(&resolver) {
            return false;
        }
        self.resolvers.push(resolver);
        true
    }
}

fn folded(name: &str) -> impl Iterator<Item = char> + '_ {
    name.chars().flat_map(char::to_lowercase)
}

impl PartialEq for AgentId {
    fn eq(&self, other: &Self) -> bool {
        folded(&self.name).eq(folded(&other.name))
    }
}

impl Eq for AgentId {}

impl Hash for AgentId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for c in folded(&self.name) {
            c.hash(state);
        }
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// ── ContainerId ────────────────────────────────────────────────────────

/// Name of a node (container) of the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ContainerId {
    fn from(name: String) -> Self {
        Self(name)
    }
}
