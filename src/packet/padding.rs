// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use zerocopy::{Immutable, IntoBytes, KnownLayout, TryFromBytes, Unaligned, big_endian};

use super::util::size_must_be;

/// First byte of a DAITA padding packet.
///
/// The value overlays the IP version nibble: `0xF` is not a valid IP version, so a
/// single byte is enough to tell a padding packet apart from an IP packet.
pub const PADDING_MARKER: u8 = 0xff;

/// The marker byte of a [`PaddingHeader`].
///
/// A single-variant enum, so that zerocopy-parsing any packet whose first byte is
/// not [`PADDING_MARKER`] as a [`PaddingPacket`] fails.
#[repr(u8)]
#[derive(Clone, Copy, Debug, TryFromBytes, IntoBytes, KnownLayout, Unaligned, Immutable)]
pub enum PaddingMarker {
    Padding = PADDING_MARKER,
}

/// The 4-byte header of a DAITA padding packet.
///
/// Wire layout:
///
/// ```text
/// offset 0:    0xff        marker (overlays the IP version nibble)
/// offset 1:    0x00        reserved
/// offset 2..4: u16, BE     total packet length, header included
/// ```
#[repr(C)]
#[derive(Clone, Copy, Debug, TryFromBytes, IntoBytes, KnownLayout, Unaligned, Immutable)]
pub struct PaddingHeader {
    /// Marker byte distinguishing padding from IP traffic.
    pub marker: PaddingMarker,
    reserved: u8,
    /// Total length of the padding packet in bytes, including this header.
    pub total_len: big_endian::U16,
}

/// A complete DAITA padding packet: a [`PaddingHeader`] followed by filler bytes
/// whose contents are unspecified.
#[repr(C)]
#[derive(Debug, TryFromBytes, IntoBytes, KnownLayout, Unaligned, Immutable)]
pub struct PaddingPacket {
    /// Padding packet header.
    pub header: PaddingHeader,
    /// Filler. Never interpreted by receivers.
    pub payload: [u8],
}

impl PaddingHeader {
    /// Length, in bytes, of a [`PaddingHeader`].
    pub const LEN: usize = size_must_be::<PaddingHeader>(4);

    /// Construct a header for a padding packet of `total_len` bytes (header included).
    ///
    /// `total_len` must be at least [`PaddingHeader::LEN`].
    pub fn new(total_len: u16) -> Self {
        debug_assert!(usize::from(total_len) >= Self::LEN);
        Self {
            marker: PaddingMarker::Padding,
            reserved: 0,
            total_len: big_endian::U16::new(total_len),
        }
    }

    /// Whether `first_byte` marks the start of a padding packet.
    pub const fn is_padding(first_byte: u8) -> bool {
        first_byte == PADDING_MARKER
    }
}
