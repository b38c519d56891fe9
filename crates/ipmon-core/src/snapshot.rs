// # Interface Snapshot
//
// Canonical per-interface address state.
//
// A snapshot is rebuilt from scratch on every refresh and published through
// `SnapshotStore::replace`, so readers always hold either the complete old
// snapshot or the complete new one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Placeholder for an absent IPv4 address or network
pub const IPV4_SENTINEL: &str = "0.0.0.0";

/// Placeholder for an absent IPv6 address
pub const IPV6_SENTINEL: &str = "::";

/// Addresses configured on one interface
///
/// Every list keeps insertion order and holds no duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSet {
    ipv4: Vec<String>,
    ipv6: Vec<String>,
    ipv4_networks: Vec<String>,
}

impl AddressSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set carried by an interface without any configured address
    pub fn unconfigured() -> Self {
        Self {
            ipv4: vec![IPV4_SENTINEL.to_string()],
            ipv6: vec![IPV6_SENTINEL.to_string()],
            ipv4_networks: vec![IPV4_SENTINEL.to_string()],
        }
    }

    /// Record an IPv4 address together with its network in CIDR notation
    pub fn push_ipv4(&mut self, address: impl Into<String>, network: impl Into<String>) {
        push_unique(&mut self.ipv4, address.into());
        push_unique(&mut self.ipv4_networks, network.into());
    }

    /// Record an IPv6 address
    pub fn push_ipv6(&mut self, address: impl Into<String>) {
        push_unique(&mut self.ipv6, address.into());
    }

    pub fn ipv4(&self) -> &[String] {
        &self.ipv4
    }

    pub fn ipv6(&self) -> &[String] {
        &self.ipv6
    }

    pub fn ipv4_networks(&self) -> &[String] {
        &self.ipv4_networks
    }

    /// True when no family holds an entry
    pub fn is_empty(&self) -> bool {
        self.ipv4.is_empty() && self.ipv6.is_empty() && self.ipv4_networks.is_empty()
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

/// Mapping from interface name to its addresses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceSnapshot {
    interfaces: BTreeMap<String, AddressSet>,
    collected_at: chrono::DateTime<chrono::Utc>,
}

impl InterfaceSnapshot {
    /// Build a snapshot from a complete interface map
    pub fn new(interfaces: BTreeMap<String, AddressSet>) -> Self {
        Self {
            interfaces,
            collected_at: chrono::Utc::now(),
        }
    }

    /// Snapshot with no interfaces, used before the first refresh
    pub fn empty() -> Self {
        Self::new(BTreeMap::new())
    }

    /// Addresses of one interface
    pub fn get(&self, interface: &str) -> Option<&AddressSet> {
        self.interfaces.get(interface)
    }

    /// Interfaces in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AddressSet)> {
        self.interfaces.iter().map(|(name, set)| (name.as_str(), set))
    }

    pub fn interfaces(&self) -> &BTreeMap<String, AddressSet> {
        &self.interfaces
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    /// When the enumeration behind this snapshot ran
    pub fn collected_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.collected_at
    }

    /// One human-readable status line per interface
    pub fn status_lines(&self) -> Vec<String> {
        self.iter()
            .map(|(name, set)| {
                format!(
                    "Interface: {} IPv4: {} IPv4_networks: {} IPv6: {}",
                    name,
                    set.ipv4().join(" "),
                    set.ipv4_networks().join(" "),
                    set.ipv6().join(" ")
                )
            })
            .collect()
    }
}

/// Shared holder of the current snapshot
///
/// The whole snapshot is swapped behind one lock so a reader never sees a
/// mix of entries from two refreshes.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    current: Arc<RwLock<Arc<InterfaceSnapshot>>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(InterfaceSnapshot::empty()))),
        }
    }

    /// The most recently published snapshot
    pub async fn current(&self) -> Arc<InterfaceSnapshot> {
        Arc::clone(&*self.current.read().await)
    }

    /// Publish a new snapshot, returning the previous one
    pub async fn replace(&self, snapshot: InterfaceSnapshot) -> Arc<InterfaceSnapshot> {
        let mut guard = self.current.write().await;
        std::mem::replace(&mut *guard, Arc::new(snapshot))
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}
