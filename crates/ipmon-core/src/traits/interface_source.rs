// # Interface Source Trait
//
// Defines the interface for enumerating network interfaces and their
// addresses. The system implementation lives in `collector::system`.

use std::net::{Ipv4Addr, Ipv6Addr};

/// An address attached to an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceAddr {
    /// IPv4 address with its netmask, if the system reported one
    V4 {
        address: Ipv4Addr,
        netmask: Option<Ipv4Addr>,
    },
    /// IPv6 address
    V6(Ipv6Addr),
}

/// One row of an interface enumeration
///
/// An interface appears once per address, and at least once without an
/// address (link-layer entries), so interfaces without IP configuration are
/// still visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceEntry {
    /// Interface name
    pub name: String,
    /// IP address of this row, `None` for non-IP rows
    pub addr: Option<InterfaceAddr>,
}

impl InterfaceEntry {
    /// Row for an interface without an IP address
    pub fn link(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: None,
        }
    }

    /// Row for an IPv4 address
    pub fn v4(name: impl Into<String>, address: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            addr: Some(InterfaceAddr::V4 {
                address,
                netmask: Some(netmask),
            }),
        }
    }

    /// Row for an IPv6 address
    pub fn v6(name: impl Into<String>, address: Ipv6Addr) -> Self {
        Self {
            name: name.into(),
            addr: Some(InterfaceAddr::V6(address)),
        }
    }
}

/// Trait for interface enumeration
///
/// Enumeration is synchronous and complete: each call returns the full
/// current state, never a delta.
pub trait InterfaceSource: Send + Sync {
    /// Enumerate every interface and address
    fn enumerate(&self) -> Result<Vec<InterfaceEntry>, crate::Error>;
}
