// # Address Event Source Trait
//
// Defines the interface for receiving address-change notifications.
//
// ## Implementations
//
// - Netlink-based (Linux): `ipmon-netlink` crate
//
// Events are only a trigger. The refresh pipeline never patches the snapshot
// from an event; it always rescans every interface.

use std::fmt;
use std::net::IpAddr;
use std::pin::Pin;
use tokio_stream::Stream;

/// Whether an address appeared or disappeared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressEventKind {
    /// `RTM_NEWADDR`
    NewAddr,
    /// `RTM_DELADDR`
    DelAddr,
}

/// Address family of a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

/// One decoded address-change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEvent {
    /// Added or removed
    pub kind: AddressEventKind,
    /// Kernel interface index
    pub interface_index: u32,
    /// Interface name resolved from the index
    pub interface: String,
    /// Address family
    pub family: AddressFamily,
    /// The address itself
    pub address: IpAddr,
}

impl AddressEvent {
    /// Create a new address event; the family follows the address
    pub fn new(
        kind: AddressEventKind,
        interface_index: u32,
        interface: impl Into<String>,
        address: IpAddr,
    ) -> Self {
        let family = match address {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        };

        Self {
            kind,
            interface_index,
            interface: interface.into(),
            family,
            address,
        }
    }
}

impl fmt::Display for AddressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            AddressEventKind::NewAddr => write!(
                f,
                "New address assigned to interface {}: {}",
                self.interface, self.address
            ),
            AddressEventKind::DelAddr => write!(
                f,
                "Address was removed from interface {}: {}",
                self.interface, self.address
            ),
        }
    }
}

/// Item produced by an [`AddressEventSource`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// A decoded notification
    Address(AddressEvent),
    /// The kernel dropped notifications; the current state is unknown
    Overrun,
}

/// Trait for address-change notification sources
///
/// Implementations must be thread-safe. The stream should run until the
/// source is dropped; transient socket failures are the source's business
/// and must not end the stream.
pub trait AddressEventSource: Send + Sync {
    /// Stream of notifications
    ///
    /// Called once by the refresh worker.
    fn watch(&self) -> Pin<Box<dyn Stream<Item = MonitorEvent> + Send + 'static>>;
}
