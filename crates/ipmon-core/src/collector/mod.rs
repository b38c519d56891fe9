//! Snapshot collection
//!
//! Turns a full interface enumeration into an [`InterfaceSnapshot`]. Every
//! refresh rescans all interfaces; netlink deltas are never applied
//! incrementally.

#[cfg(unix)]
pub mod system;

#[cfg(unix)]
pub use system::SystemInterfaces;

use crate::error::Result;
use crate::snapshot::{AddressSet, InterfaceSnapshot};
use crate::traits::{InterfaceAddr, InterfaceEntry, InterfaceSource};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Builds snapshots from an [`InterfaceSource`]
pub struct SnapshotCollector<'a> {
    source: &'a dyn InterfaceSource,
}

impl<'a> SnapshotCollector<'a> {
    pub fn new(source: &'a dyn InterfaceSource) -> Self {
        Self { source }
    }

    /// Enumerate the source and build a fresh snapshot
    pub fn collect(&self) -> Result<InterfaceSnapshot> {
        let entries = self.source.enumerate()?;
        Ok(build_snapshot(entries))
    }
}

/// Build a snapshot from enumeration rows
///
/// Interfaces that end up without any address get the sentinel set.
pub fn build_snapshot(entries: impl IntoIterator<Item = InterfaceEntry>) -> InterfaceSnapshot {
    let mut interfaces: BTreeMap<String, AddressSet> = BTreeMap::new();

    for entry in entries {
        let set = interfaces.entry(entry.name).or_default();
        match entry.addr {
            Some(InterfaceAddr::V4 { address, netmask }) => {
                let netmask = netmask.unwrap_or(Ipv4Addr::BROADCAST);
                set.push_ipv4(address.to_string(), network_cidr(address, netmask));
            }
            Some(InterfaceAddr::V6(address)) => set.push_ipv6(address.to_string()),
            None => {}
        }
    }

    for set in interfaces.values_mut() {
        if set.is_empty() {
            *set = AddressSet::unconfigured();
        }
    }

    InterfaceSnapshot::new(interfaces)
}

/// Network of `address` under `netmask` in CIDR notation
///
/// The prefix length is the number of set bits in the mask.
pub fn network_cidr(address: Ipv4Addr, netmask: Ipv4Addr) -> String {
    let mask = u32::from(netmask);
    let network = Ipv4Addr::from(u32::from(address) & mask);
    format!("{}/{}", network, mask.count_ones())
}
