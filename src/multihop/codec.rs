// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    ops::Range,
    sync::atomic::{AtomicU16, Ordering},
};

use pnet_packet::ip::IpNextHeaderProtocols;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, big_endian};

use super::Error;
use crate::packet::{IpNextProtocol, Ipv4Header, Ipv6Header, Ipv6VersionTrafficFlow, util};

/// A UDP header, as synthesized behind the IP header of every relayed datagram.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Unaligned, Immutable)]
pub(crate) struct UdpHeader {
    /// UDP source port.
    pub source_port: big_endian::U16,
    /// UDP destination port.
    pub destination_port: big_endian::U16,
    /// Length of the UDP packet (header included) in bytes.
    pub length: big_endian::U16,
    /// Checksum over the pseudo header, this header, and the payload.
    pub checksum: big_endian::U16,
}

impl UdpHeader {
    /// Length of a [`UdpHeader`], in bytes.
    pub const LEN: usize = util::size_must_be::<UdpHeader>(8);

    /// Byte range of the checksum field, for patching it after the fact.
    const CHECKSUM: Range<usize> = 6..8;
}

/// Builds and parses UDP-in-IP datagrams between two fixed endpoints.
///
/// The address family is fixed at construction; both endpoints must belong to it.
/// `local_port` is set later, when the bind view is opened.
pub(crate) struct IpUdpCodec {
    endpoints: Endpoints,
    local_port: AtomicU16,
    remote_port: u16,
    connection_id: u16,
}

enum Endpoints {
    V4 { local: Ipv4Addr, remote: Ipv4Addr },
    V6 { local: Ipv6Addr, remote: Ipv6Addr },
}

impl IpUdpCodec {
    pub fn new(
        local: IpAddr,
        remote: IpAddr,
        remote_port: u16,
        connection_id: u16,
    ) -> Result<Self, Error> {
        let endpoints = match (local, remote) {
            (IpAddr::V4(local), IpAddr::V4(remote)) => Endpoints::V4 { local, remote },
            (IpAddr::V6(local), IpAddr::V6(remote)) => Endpoints::V6 { local, remote },
            _ => return Err(Error::AddressFamilyMismatch),
        };

        Ok(Self {
            endpoints,
            local_port: AtomicU16::new(0),
            remote_port,
            connection_id,
        })
    }

    /// Set the UDP source port used by [`IpUdpCodec::encode`].
    ///
    /// The bind protocol of the host device guarantees that the port is set before
    /// any datagram is encoded.
    pub fn set_local_port(&self, port: u16) {
        self.local_port.store(port, Ordering::Relaxed);
    }

    /// Combined size of the IP and UDP headers for this codec's address family.
    pub fn header_size(&self) -> usize {
        match self.endpoints {
            Endpoints::V4 { .. } => Ipv4Header::LEN + UdpHeader::LEN,
            Endpoints::V6 { .. } => Ipv6Header::LEN + UdpHeader::LEN,
        }
    }

    /// Write a complete IP + UDP datagram carrying `payload` into `target`.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BufferTooSmall`] if `target` cannot hold the headers and
    /// the payload.
    pub fn encode(&self, target: &mut [u8], payload: &[u8]) -> Result<usize, Error> {
        let total = self.header_size() + payload.len();
        if target.len() < total {
            return Err(Error::BufferTooSmall {
                needed: total,
                got: target.len(),
            });
        }

        let target = &mut target[..total];
        match self.endpoints {
            Endpoints::V4 { local, remote } => self.encode_v4(target, payload, local, remote),
            Endpoints::V6 { local, remote } => self.encode_v6(target, payload, local, remote),
        }
        Ok(total)
    }

    fn encode_v4(&self, target: &mut [u8], payload: &[u8], source: Ipv4Addr, destination: Ipv4Addr) {
        let udp_len = u16::try_from(UdpHeader::LEN + payload.len()).expect("datagram fits a u16");

        let mut ip = Ipv4Header::new_for_length(source, destination, IpNextProtocol::Udp, udp_len);
        ip.identification = self.connection_id.into();
        ip.header_checksum = pnet_packet::util::checksum(ip.as_bytes(), 5).into();

        let (ip_bytes, udp) = target.split_at_mut(Ipv4Header::LEN);
        ip_bytes.copy_from_slice(ip.as_bytes());
        self.write_udp(udp, payload);

        // A zero UDP checksum would be legal on IPv4, but fill it in anyway so both
        // address families take the same path.
        let checksum = pnet_packet::util::ipv4_checksum(
            udp,
            3,
            &[],
            &source,
            &destination,
            IpNextHeaderProtocols::Udp,
        );
        udp[UdpHeader::CHECKSUM].copy_from_slice(&checksum.to_be_bytes());
    }

    fn encode_v6(&self, target: &mut [u8], payload: &[u8], source: Ipv6Addr, destination: Ipv6Addr) {
        let udp_len = u16::try_from(UdpHeader::LEN + payload.len()).expect("datagram fits a u16");

        let ip = Ipv6Header {
            version_traffic_flow: Ipv6VersionTrafficFlow::new()
                .with_version(6)
                .with_flow_label(u32::from(self.connection_id)),
            payload_length: udp_len.into(),
            next_header: IpNextProtocol::Udp,
            hop_limit: 64,
            source_address: source.to_bits().into(),
            destination_address: destination.to_bits().into(),
        };

        let (ip_bytes, udp) = target.split_at_mut(Ipv6Header::LEN);
        ip_bytes.copy_from_slice(ip.as_bytes());
        self.write_udp(udp, payload);

        // Unlike IPv4, the UDP checksum is mandatory on IPv6 (RFC 2460, section 8.1).
        let checksum = pnet_packet::util::ipv6_checksum(
            udp,
            3,
            &[],
            &source,
            &destination,
            IpNextHeaderProtocols::Udp,
        );
        udp[UdpHeader::CHECKSUM].copy_from_slice(&checksum.to_be_bytes());
    }

    /// Fill `udp` (sized exactly header + payload) with a UDP header and `payload`.
    /// The checksum is left zero for the caller to patch.
    fn write_udp(&self, udp: &mut [u8], payload: &[u8]) {
        let header = UdpHeader {
            source_port: self.local_port.load(Ordering::Relaxed).into(),
            destination_port: self.remote_port.into(),
            length: u16::try_from(udp.len()).expect("datagram fits a u16").into(),
            checksum: big_endian::U16::ZERO,
        };

        let (header_bytes, payload_bytes) = udp.split_at_mut(UdpHeader::LEN);
        header_bytes.copy_from_slice(header.as_bytes());
        payload_bytes.copy_from_slice(payload);
    }

    /// Strip the IP and UDP headers off `datagram` and return the UDP payload.
    ///
    /// Checksums are not validated; the datagram never left the process.
    pub fn decode<'p>(&self, datagram: &'p [u8]) -> Result<&'p [u8], Error> {
        let first = *datagram.first().ok_or(Error::Truncated(0))?;

        let header_len = match first >> 4 {
            4 => Ipv4Header::LEN + UdpHeader::LEN,
            6 => Ipv6Header::LEN + UdpHeader::LEN,
            version => return Err(Error::BadIpVersion(version)),
        };

        datagram
            .get(header_len..)
            .ok_or(Error::Truncated(datagram.len()))
    }
}
