//! Address notification decoding
//!
//! Decodes `RTM_NEWADDR` / `RTM_DELADDR` datagrams received on an
//! `NETLINK_ROUTE` socket with `netlink-packet-route`. A datagram may carry
//! several messages; each one is framed through `NetlinkBuffer`, which checks
//! its length against the bytes actually received, and then deserialized on
//! its own so a bad record costs only itself.

use ipmon_core::traits::{AddressEvent, AddressEventKind};
use netlink_packet_core::{NetlinkBuffer, NetlinkMessage, NetlinkPayload};
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use std::net::IpAddr;
use thiserror::Error;
use tracing::{error, trace, warn};

const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const RTM_NEWADDR: u16 = 20;
const RTM_DELADDR: u16 = 21;

/// Multicast group for IPv4 address changes
pub const RTMGRP_IPV4_IFADDR: u32 = 0x10;
/// Multicast group for IPv6 address changes
pub const RTMGRP_IPV6_IFADDR: u32 = 0x100;

/// Malformed notification
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("bad message frame at offset {offset}: {reason}")]
    BadFrame { offset: usize, reason: String },

    #[error("malformed address message: {0}")]
    Malformed(String),

    #[error("no {0} address attribute")]
    MissingAddress(&'static str),

    #[error("cannot resolve interface index {index}: {reason}")]
    UnknownInterface { index: u32, reason: String },
}

/// Maps kernel interface indices to names
pub trait InterfaceResolver: Send + Sync {
    fn resolve(&self, index: u32) -> Result<String, DecodeError>;
}

/// Resolver backed by `if_indextoname(3)`
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[cfg(target_os = "linux")]
impl InterfaceResolver for SystemResolver {
    fn resolve(&self, index: u32) -> Result<String, DecodeError> {
        nix::net::if_::if_indextoname(index)
            .map(|name| name.to_string_lossy().into_owned())
            .map_err(|e| DecodeError::UnknownInterface {
                index,
                reason: e.to_string(),
            })
    }
}

/// Address carried by one notification, before name resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawAddress {
    pub kind: AddressEventKind,
    pub index: u32,
    pub address: IpAddr,
}

/// Decode a whole datagram into events
///
/// Malformed records and unresolvable indices are logged and skipped. A
/// broken frame length makes the rest of the datagram unreadable, so
/// decoding stops there.
pub fn decode_datagram(buf: &[u8], resolver: &dyn InterfaceResolver) -> Vec<AddressEvent> {
    let mut events = Vec::new();
    let mut offset = 0;

    while offset < buf.len() {
        let frame = &buf[offset..];
        let (length, msg_type) = match NetlinkBuffer::new_checked(frame) {
            Ok(nl_buf) => (nl_buf.length() as usize, nl_buf.message_type()),
            Err(e) => {
                error!(
                    "{}",
                    DecodeError::BadFrame {
                        offset,
                        reason: e.to_string()
                    }
                );
                break;
            }
        };

        match msg_type {
            NLMSG_DONE => break,
            NLMSG_ERROR => warn!("Kernel reported a netlink error message"),
            RTM_NEWADDR | RTM_DELADDR => match decode_message(&frame[..length]) {
                Ok(Some(raw)) => match resolver.resolve(raw.index) {
                    Ok(name) => {
                        events.push(AddressEvent::new(raw.kind, raw.index, name, raw.address))
                    }
                    Err(e) => error!("{}", e),
                },
                Ok(None) => {}
                Err(e) => warn!("Skipping address notification: {}", e),
            },
            other => trace!(msg_type = other, "Ignoring netlink message"),
        }

        // NLMSG_ALIGN
        offset = offset.saturating_add((length + 3) & !3);
    }

    events
}

/// Decode one `RTM_NEWADDR` / `RTM_DELADDR` message
///
/// `message` spans exactly one netlink message, header included. Returns
/// `Ok(None)` for other message types and for families other than IPv4
/// and IPv6.
pub fn decode_message(message: &[u8]) -> Result<Option<RawAddress>, DecodeError> {
    let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(message)
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let (kind, address_msg) = match &msg.payload {
        NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewAddress(m)) => {
            (AddressEventKind::NewAddr, m)
        }
        NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelAddress(m)) => {
            (AddressEventKind::DelAddr, m)
        }
        _ => return Ok(None),
    };

    let Some(address) = notified_address(address_msg)? else {
        return Ok(None);
    };

    Ok(Some(RawAddress {
        kind,
        index: address_msg.header.index,
        address,
    }))
}

/// IPv4 takes `IFA_ADDRESS`, falling back to `IFA_LOCAL`; IPv6 needs `IFA_ADDRESS`
fn notified_address(msg: &AddressMessage) -> Result<Option<IpAddr>, DecodeError> {
    let find = |local: bool, want_v4: bool| {
        msg.attributes.iter().find_map(|attr| match attr {
            AddressAttribute::Address(ip) if !local && ip.is_ipv4() == want_v4 => Some(*ip),
            AddressAttribute::Local(ip) if local && ip.is_ipv4() == want_v4 => Some(*ip),
            _ => None,
        })
    };

    match msg.header.family {
        AddressFamily::Inet => find(false, true)
            .or_else(|| find(true, true))
            .map(Some)
            .ok_or(DecodeError::MissingAddress("IPv4")),
        AddressFamily::Inet6 => find(false, false)
            .map(Some)
            .ok_or(DecodeError::MissingAddress("IPv6")),
        other => {
            trace!(family = ?other, "Ignoring address message");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::Ipv6Addr;

    const NLMSG_HDRLEN: usize = 16;
    const IFA_ADDRESS: u16 = 1;
    const IFA_LOCAL: u16 = 2;
    const AF_INET: u8 = 2;
    const AF_INET6: u8 = 10;

    struct MapResolver(HashMap<u32, &'static str>);

    impl InterfaceResolver for MapResolver {
        fn resolve(&self, index: u32) -> Result<String, DecodeError> {
            self.0
                .get(&index)
                .map(|n| n.to_string())
                .ok_or(DecodeError::UnknownInterface {
                    index,
                    reason: "no such device".into(),
                })
        }
    }

    fn resolver() -> MapResolver {
        MapResolver(HashMap::from([(2, "eth0"), (3, "wlan0")]))
    }

    fn attr(kind: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((4 + payload.len()) as u16).to_ne_bytes());
        out.extend_from_slice(&kind.to_ne_bytes());
        out.extend_from_slice(payload);
        out.resize((out.len() + 3) & !3, 0);
        out
    }

    fn message(msg_type: u16, family: u8, index: u32, attrs: &[Vec<u8>]) -> Vec<u8> {
        let body: Vec<u8> = attrs.concat();
        let length = NLMSG_HDRLEN + 8 + body.len();

        let mut out = Vec::new();
        out.extend_from_slice(&(length as u32).to_ne_bytes());
        out.extend_from_slice(&msg_type.to_ne_bytes());
        out.extend_from_slice(&0u16.to_ne_bytes());
        out.extend_from_slice(&0u32.to_ne_bytes());
        out.extend_from_slice(&0u32.to_ne_bytes());
        out.extend_from_slice(&[family, 24, 0, 0]);
        out.extend_from_slice(&index.to_ne_bytes());
        out.extend_from_slice(&body);
        out
    }

    fn v4(index: u32, octets: [u8; 4]) -> Vec<u8> {
        message(RTM_NEWADDR, AF_INET, index, &[attr(IFA_ADDRESS, &octets)])
    }

    #[test]
    fn new_ipv4_address() {
        let buf = v4(2, [10, 0, 0, 1]);
        let events = decode_datagram(&buf, &resolver());

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AddressEventKind::NewAddr);
        assert_eq!(events[0].interface, "eth0");
        assert_eq!(events[0].address, IpAddr::from([10, 0, 0, 1]));
        assert_eq!(
            events[0].to_string(),
            "New address assigned to interface eth0: 10.0.0.1"
        );
    }

    #[test]
    fn ipv4_falls_back_to_local() {
        let buf = message(RTM_DELADDR, AF_INET, 3, &[attr(IFA_LOCAL, &[192, 168, 0, 7])]);
        let raw = decode_message(&buf).unwrap().unwrap();

        assert_eq!(raw.kind, AddressEventKind::DelAddr);
        assert_eq!(raw.index, 3);
        assert_eq!(raw.address, IpAddr::from([192, 168, 0, 7]));
    }

    #[test]
    fn ipv4_prefers_address_over_local() {
        let buf = message(
            RTM_NEWADDR,
            AF_INET,
            2,
            &[attr(IFA_LOCAL, &[10, 0, 0, 2]), attr(IFA_ADDRESS, &[10, 0, 0, 1])],
        );
        let raw = decode_message(&buf).unwrap().unwrap();
        assert_eq!(raw.address, IpAddr::from([10, 0, 0, 1]));
    }

    #[test]
    fn ipv6_requires_address_attribute() {
        let v6: [u8; 16] = "fe80::1".parse::<Ipv6Addr>().unwrap().octets();

        let ok = message(RTM_NEWADDR, AF_INET6, 2, &[attr(IFA_ADDRESS, &v6)]);
        assert_eq!(
            decode_message(&ok).unwrap().unwrap().address,
            "fe80::1".parse::<IpAddr>().unwrap()
        );

        let local_only = message(RTM_NEWADDR, AF_INET6, 2, &[attr(IFA_LOCAL, &v6)]);
        assert_eq!(
            decode_message(&local_only),
            Err(DecodeError::MissingAddress("IPv6"))
        );
    }

    #[test]
    fn wrong_address_size_skips_only_that_record() {
        let mut buf = message(RTM_NEWADDR, AF_INET, 2, &[attr(IFA_ADDRESS, &[10, 0, 0])]);
        assert!(decode_message(&buf).is_err());

        buf.extend(v4(3, [10, 0, 0, 3]));
        let events = decode_datagram(&buf, &resolver());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].interface, "wlan0");
    }

    #[test]
    fn attribute_overrunning_message_skips_only_that_record() {
        let mut bad = attr(IFA_ADDRESS, &[10, 0, 0, 1]);
        bad[0..2].copy_from_slice(&64u16.to_ne_bytes());
        let mut buf = message(RTM_NEWADDR, AF_INET, 2, &[bad]);
        assert!(decode_message(&buf).is_err());

        buf.extend(v4(3, [10, 0, 0, 3]));
        let events = decode_datagram(&buf, &resolver());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].address, IpAddr::from([10, 0, 0, 3]));
    }

    #[test]
    fn other_families_are_ignored() {
        let mut buf = message(RTM_NEWADDR, 7, 2, &[attr(IFA_ADDRESS, &[1, 2, 3, 4])]);
        buf.extend(v4(3, [10, 0, 0, 3]));

        let events = decode_datagram(&buf, &resolver());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].interface, "wlan0");
    }

    #[test]
    fn several_messages_in_one_datagram() {
        let mut buf = v4(2, [10, 0, 0, 1]);
        buf.extend(message(RTM_DELADDR, AF_INET, 3, &[attr(IFA_ADDRESS, &[10, 0, 0, 2])]));

        let events = decode_datagram(&buf, &resolver());
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].interface, "wlan0");
        assert_eq!(events[1].kind, AddressEventKind::DelAddr);
    }

    #[test]
    fn unresolvable_index_drops_only_that_record() {
        let mut buf = v4(99, [10, 0, 0, 1]);
        buf.extend(v4(2, [10, 0, 0, 2]));

        let events = decode_datagram(&buf, &resolver());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].interface, "eth0");
    }

    #[test]
    fn bad_message_length_stops_decoding() {
        let mut buf = v4(2, [10, 0, 0, 1]);
        let mut broken = v4(2, [10, 0, 0, 2]);
        broken[0..4].copy_from_slice(&4096u32.to_ne_bytes());
        buf.extend(broken);
        buf.extend(v4(3, [10, 0, 0, 3]));

        let events = decode_datagram(&buf, &resolver());
        assert_eq!(events.len(), 1, "records after the broken one are unreachable");
    }

    #[test]
    fn zero_length_frame_stops_decoding() {
        let mut buf = v4(2, [10, 0, 0, 1]);
        buf.extend([0u8; NLMSG_HDRLEN]);
        buf.extend(v4(3, [10, 0, 0, 3]));

        assert_eq!(decode_datagram(&buf, &resolver()).len(), 1);
    }

    #[test]
    fn missing_attribute_skips_record() {
        let mut buf = message(RTM_NEWADDR, AF_INET, 2, &[]);
        assert_eq!(decode_message(&buf), Err(DecodeError::MissingAddress("IPv4")));

        buf.extend(v4(3, [10, 0, 0, 3]));
        let events = decode_datagram(&buf, &resolver());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].interface, "wlan0");
    }

    #[test]
    fn done_ends_the_datagram() {
        let mut done = vec![0u8; NLMSG_HDRLEN];
        done[0..4].copy_from_slice(&(NLMSG_HDRLEN as u32).to_ne_bytes());
        done[4..6].copy_from_slice(&NLMSG_DONE.to_ne_bytes());

        let mut buf = done;
        buf.extend(v4(2, [10, 0, 0, 1]));

        assert!(decode_datagram(&buf, &resolver()).is_empty());
    }

    #[test]
    fn short_datagram_yields_nothing() {
        assert!(decode_datagram(&[0u8; 7], &resolver()).is_empty());
        assert!(decode_datagram(&[], &resolver()).is_empty());
    }
}
