// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use bytes::BytesMut;

use crate::packet::Packet;

/// Size, in bytes, of each buffer handed out by [`PacketBufPool`].
///
/// Large enough for a padding packet or a synthesized IP/UDP datagram at any
/// reasonable tunnel MTU.
pub const PACKET_BUF_SIZE: usize = 4096;

/// Used to send a previously allocated [`BytesMut`] back to a [`PacketBufPool`] on drop.
pub type ReturnToPool = crossbeam_channel::Sender<BytesMut>;
type GetFromPool = crossbeam_channel::Receiver<BytesMut>;

/// A recycling pool of packet buffers.
///
/// Buffers are pre-allocated up front; [`PacketBufPool::get`] re-uses a returned
/// buffer when one is available and allocates otherwise. Dropping a [`Packet`]
/// obtained from the pool returns its buffer.
#[derive(Clone)]
pub struct PacketBufPool {
    rx: GetFromPool,
    _tx: ReturnToPool,
}

impl PacketBufPool {
    /// Create a new [`PacketBufPool`] with space for `capacity` packets of
    /// [`PACKET_BUF_SIZE`] bytes each.
    pub fn new(capacity: usize) -> Self {
        let (_tx, rx) = crossbeam_channel::bounded(capacity);

        let mut contiguous_buf = BytesMut::zeroed(PACKET_BUF_SIZE * capacity);
        for _ in 0..capacity {
            _tx.send(contiguous_buf.split_to(PACKET_BUF_SIZE))
                .expect("chan has space for 'capacity' bufs");
        }
        debug_assert!(contiguous_buf.is_empty());

        PacketBufPool { rx, _tx }
    }

    fn re_use(&self) -> Option<Packet> {
        let mut buf = self.rx.try_recv().ok()?;
        buf.clear();
        if !buf.try_reclaim(PACKET_BUF_SIZE) {
            // The buffer no longer spans its full window. Let it go and allocate fresh.
            return None;
        }
        // Safety: the buffer was created with BytesMut::zeroed(PACKET_BUF_SIZE), so all
        // PACKET_BUF_SIZE bytes of the reclaimed allocation have been initialized.
        unsafe { buf.set_len(PACKET_BUF_SIZE) };

        Some(Packet::new_from_pool(self._tx.clone(), buf))
    }

    /// Get a [`Packet`] of [`PACKET_BUF_SIZE`] bytes from the pool.
    ///
    /// Re-uses an already allocated buffer if possible, and allocates otherwise.
    pub fn get(&self) -> Packet {
        if let Some(packet) = self.re_use() {
            return packet;
        }

        Packet::new_from_pool(self._tx.clone(), BytesMut::zeroed(PACKET_BUF_SIZE))
    }
}
