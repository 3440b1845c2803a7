// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use bitfield_struct::bitfield;
use std::{fmt::Debug, net::Ipv6Addr};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, big_endian};

use super::{IpNextProtocol, util::size_must_be};

/// A bitfield struct containing the IPv6 fields `flow_label`, `traffic_class` and `version`.
#[bitfield(u32, repr = big_endian::U32, from = big_endian::U32::new, into = big_endian::U32::get)]
#[derive(FromBytes, IntoBytes, KnownLayout, Unaligned, Immutable, PartialEq, Eq)]
pub struct Ipv6VersionTrafficFlow {
    /// IPv6 flow label.
    #[bits(20)]
    pub flow_label: u32,
    /// IPv6 traffic class.
    #[bits(8)]
    pub traffic_class: u8,
    /// IPv6 version. This must be `6`.
    #[bits(4)]
    pub version: u8,
}

/// An IPv6 header, as synthesized in front of every relayed datagram.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Unaligned, Immutable, PartialEq, Eq)]
pub struct Ipv6Header {
    /// IPv6 `version`, `traffic_class` and `flow_label` fields.
    pub version_traffic_flow: Ipv6VersionTrafficFlow,
    /// Length of the IPv6 payload, excluding the header.
    pub payload_length: big_endian::U16,
    /// Protocol of the IPv6 payload.
    pub next_header: IpNextProtocol,
    /// Maximum number of hops for the IPv6 packet.
    pub hop_limit: u8,
    /// IPv6 source address.
    pub source_address: big_endian::U128,
    /// IPv6 destination address.
    pub destination_address: big_endian::U128,
}

impl Ipv6Header {
    /// Length, in bytes, of an [`Ipv6Header`].
    pub const LEN: usize = size_must_be::<Ipv6Header>(40);

    /// Get [`version`](Ipv6VersionTrafficFlow::version). This is expected to be `6`.
    pub const fn version(&self) -> u8 {
        self.version_traffic_flow.version()
    }

    /// Get [`traffic_class`](Ipv6VersionTrafficFlow::traffic_class).
    pub const fn traffic_class(&self) -> u8 {
        self.version_traffic_flow.traffic_class()
    }

    /// Get [`flow_label`](Ipv6VersionTrafficFlow::flow_label).
    pub const fn flow_label(&self) -> u32 {
        self.version_traffic_flow.flow_label()
    }

    /// Get [next header protocol](Ipv6Header::next_header).
    pub const fn next_protocol(&self) -> IpNextProtocol {
        self.next_header
    }

    /// Get source address.
    pub const fn source(&self) -> Ipv6Addr {
        Ipv6Addr::from_bits(self.source_address.get())
    }

    /// Get destination address.
    pub const fn destination(&self) -> Ipv6Addr {
        Ipv6Addr::from_bits(self.destination_address.get())
    }
}

impl Debug for Ipv6Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ipv6Header")
            .field("version", &self.version())
            .field("traffic_class", &self.traffic_class())
            .field("flow_label", &self.flow_label())
            .field("payload_length", &self.payload_length.get())
            .field("next_header", &self.next_header)
            .field("hop_limit", &self.hop_limit)
            .field("source_address", &self.source())
            .field("destination_address", &self.destination())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromBytes;

    #[test]
    fn ipv6_header_construction() {
        let header = Ipv6Header {
            version_traffic_flow: Ipv6VersionTrafficFlow::new()
                .with_version(6)
                .with_flow_label(0xabcde),
            payload_length: big_endian::U16::new(16),
            next_header: IpNextProtocol::Udp,
            hop_limit: 64,
            source_address: big_endian::U128::new(u128::from(Ipv6Addr::LOCALHOST)),
            destination_address: big_endian::U128::new(u128::from(Ipv6Addr::LOCALHOST)),
        };

        assert_eq!(header.version(), 6);
        assert_eq!(header.traffic_class(), 0);
        assert_eq!(header.flow_label(), 0xabcde);

        let bytes = header.as_bytes();
        assert_eq!(bytes.len(), Ipv6Header::LEN);
        // version nibble in the top bits, flow label in the bottom 20
        assert_eq!(&bytes[..4], &[0x60, 0x0a, 0xbc, 0xde]);
        assert_eq!(bytes[6], 17); // UDP
        assert_eq!(bytes[7], 64); // hop limit
    }

    #[test]
    fn ipv6_header_parse() {
        let mut bytes = [0u8; 48];
        bytes[0] = 0x60;
        bytes[4..6].copy_from_slice(&8u16.to_be_bytes());
        bytes[6] = 17;
        bytes[7] = 64;

        let (header, payload) = Ipv6Header::ref_from_prefix(&bytes).unwrap();
        assert_eq!(header.version(), 6);
        assert_eq!(header.payload_length.get(), 8);
        assert_eq!(header.next_protocol(), IpNextProtocol::Udp);
        assert_eq!(payload.len(), 8);
    }
}
