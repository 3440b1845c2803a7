// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Packet buffers and wire-format definitions.
//!
//! [`Packet`] is an owned, optionally pooled byte buffer. The header definitions
//! ([`Ipv4Header`], [`Ipv6Header`], [`PaddingHeader`]) are plain zerocopy structs
//! used to synthesize and inspect datagrams in place.
//!
//! There is deliberately no whole-packet type state here: this crate shuttles
//! opaque datagrams between two fixed endpoints and demultiplexes on nothing but
//! the first byte, so the buffers stay untyped and the headers stay standalone.

use std::fmt::{self, Debug};
use std::ops::{Deref, DerefMut};

use bytes::BytesMut;

mod ipv4;
mod ipv6;
mod padding;
mod pool;

pub(crate) mod util;

pub use ipv4::*;
pub use ipv6::*;
pub use padding::*;
pub use pool::*;

/// An owned packet buffer.
///
/// The contents are opaque bytes; what they mean is decided by whoever holds the
/// packet (an IP datagram on the tunnel side, a padding packet on the outbound
/// queue, and so on). Buffers handed out by a [`PacketBufPool`] find their way
/// back to it when the packet is dropped.
pub struct Packet {
    buf: BytesMut,

    // Set iff the buffer was allocated by a [PacketBufPool].
    return_to_pool: Option<ReturnToPool>,
}

impl Packet {
    /// Create a packet whose buffer is returned to a pool on drop.
    pub(crate) fn new_from_pool(return_to_pool: ReturnToPool, buf: BytesMut) -> Self {
        Self {
            buf,
            return_to_pool: Some(return_to_pool),
        }
    }

    /// Wrap a [`BytesMut`] in a packet that owns its allocation outright.
    pub fn from_bytes(buf: BytesMut) -> Self {
        Self {
            buf,
            return_to_pool: None,
        }
    }

    /// See [`BytesMut::truncate`].
    pub fn truncate(&mut self, new_len: usize) {
        self.buf.truncate(new_len);
    }

    /// Get direct mutable access to the backing buffer.
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let Some(pool) = self.return_to_pool.take() {
            // A full or disconnected pool means the buffer is simply freed.
            let _ = pool.try_send(std::mem::take(&mut self.buf));
        }
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::from_bytes(BytesMut::default())
    }
}

impl Deref for Packet {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for Packet {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.buf.len())
            .field("pooled", &self.return_to_pool.is_some())
            .finish()
    }
}
