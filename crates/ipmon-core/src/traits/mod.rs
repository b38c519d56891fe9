//! Core traits for ipmon
//!
//! This module defines the seams between the refresh pipeline and the
//! operating system.
//!
//! - [`AddressEventSource`]: Kernel address-change notifications
//! - [`InterfaceSource`]: Full enumeration of interfaces and addresses
//! - [`FirewallEngine`]: Dry-run, apply and reload against the firewall

pub mod event_source;
pub mod firewall;
pub mod interface_source;

pub use event_source::{AddressEvent, AddressEventKind, AddressEventSource, AddressFamily, MonitorEvent};
pub use firewall::FirewallEngine;
pub use interface_source::{InterfaceAddr, InterfaceEntry, InterfaceSource};
