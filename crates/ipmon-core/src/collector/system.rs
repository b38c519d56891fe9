//! Interface enumeration backed by `getifaddrs(3)`

use crate::traits::{InterfaceAddr, InterfaceEntry, InterfaceSource};
use nix::ifaddrs::getifaddrs;
use std::net::{SocketAddrV4, SocketAddrV6};

/// Enumerates the host's interfaces
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl SystemInterfaces {
    pub fn new() -> Self {
        Self
    }
}

impl InterfaceSource for SystemInterfaces {
    fn enumerate(&self) -> Result<Vec<InterfaceEntry>, crate::Error> {
        let addrs = getifaddrs()
            .map_err(|e| crate::Error::enumeration(format!("getifaddrs failed: {}", e)))?;

        let entries = addrs
            .map(|ifa| {
                let addr = ifa.address.as_ref().and_then(|storage| {
                    if let Some(sin) = storage.as_sockaddr_in() {
                        let netmask = ifa
                            .netmask
                            .as_ref()
                            .and_then(|m| m.as_sockaddr_in())
                            .map(|m| *SocketAddrV4::from(*m).ip());
                        Some(InterfaceAddr::V4 {
                            address: *SocketAddrV4::from(*sin).ip(),
                            netmask,
                        })
                    } else {
                        storage
                            .as_sockaddr_in6()
                            .map(|sin6| InterfaceAddr::V6(*SocketAddrV6::from(*sin6).ip()))
                    }
                });

                InterfaceEntry {
                    name: ifa.interface_name,
                    addr,
                }
            })
            .collect::<Vec<_>>();

        tracing::trace!(rows = entries.len(), "Enumerated interface addresses");
        Ok(entries)
    }
}
