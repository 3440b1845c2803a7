// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! A synthetic tunnel device for chaining two in-process VPN devices.
//!
//! [`MultihopTun`] exposes a tunnel-device surface (read/write of whole IP packets)
//! and, through [`MultihopTun::binder`], a UDP-bind surface. Raw UDP payloads sent
//! on the bind side come out of the tunnel side wrapped in synthesized IPv4/IPv6 +
//! UDP headers, and vice versa, so the encrypted datagrams of an outer device can
//! feed the tunnel input of an inner device without a round-trip through the kernel.
//!
//! Both directions are unbuffered rendezvous channels: a tunnel read only completes
//! when a bind send supplies a datagram, and a tunnel write only completes when a
//! bind receive consumes it. This gives lockstep backpressure for free.

mod bind;
mod codec;
mod rendezvous;

#[cfg(test)]
mod tests;

use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use tokio::sync::mpsc;

use crate::{
    packet::{Packet, PacketBufPool},
    tun::{MtuWatcher, TunEvent},
};
use codec::IpUdpCodec;
use rendezvous::{Rendezvous, ShutdownLatch};

pub use bind::{MultihopBind, MultihopUdpReceiver};

/// Number of packet buffers kept around for tunnel reads.
const PACKET_POOL_CAPACITY: usize = 32;

/// Error of multihop tunnel operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The tunnel (or the bind view) has been closed. This is terminal: the
    /// operation will never succeed again on this handle.
    #[error("multihop tunnel is closed")]
    Closed,

    /// The target buffer cannot hold the encoded datagram.
    #[error("target buffer too small: need {needed} bytes, got {got}")]
    BufferTooSmall { needed: usize, got: usize },

    /// The datagram's version nibble is neither 4 nor 6.
    #[error("bad IP version: {0}")]
    BadIpVersion(u8),

    /// The datagram is too short to carry IP and UDP headers.
    #[error("datagram too short: {0} bytes")]
    Truncated(usize),

    /// The local and remote addresses belong to different address families.
    #[error("local and remote addresses have mismatching address families")]
    AddressFamilyMismatch,
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            // Deliberately not `WouldBlock` or similar: the host device must treat
            // a closed multihop tunnel as permanently down.
            Error::Closed => io::Error::new(io::ErrorKind::ConnectionAborted, err),
            other => io::Error::other(other),
        }
    }
}

/// State shared between the tunnel-device view, the bind views, and the receivers.
pub(crate) struct TunShared {
    /// Tunnel reads rendezvous here with bind sends.
    pub(crate) read_ch: Rendezvous<Packet>,
    /// Tunnel writes rendezvous here with bind receives.
    pub(crate) write_ch: Rendezvous<Packet>,
    pub(crate) codec: IpUdpCodec,
    /// The fixed remote endpoint reported for every received datagram.
    pub(crate) endpoint: SocketAddr,
    pub(crate) shutdown: ShutdownLatch,
    mtu: u16,
    pool: PacketBufPool,
    /// Keeps the dormant event channel open.
    _event_tx: mpsc::Sender<TunEvent>,
}

/// A synthetic tunnel device bridging a UDP bind to a tunnel-packet stream.
///
/// Created with a fixed local/remote address pair; the UDP source port is filled in
/// when the bind view is opened. Closing the tun makes every pending and future
/// operation on it, and on its bind views, fail with [`Error::Closed`].
pub struct MultihopTun {
    shared: Arc<TunShared>,
    events: mpsc::Receiver<TunEvent>,
}

impl MultihopTun {
    /// Create a new multihop tunnel between `local` and `remote`.
    ///
    /// `mtu` is what [`MultihopTun::mtu`] reports to the host device. The IP
    /// connection id (IPv4 identification / IPv6 flow label) is drawn randomly
    /// here, with the lowest bit forced to 1 so it is never zero.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressFamilyMismatch`] if `local` and `remote` do not
    /// belong to the same address family.
    pub fn new(local: IpAddr, remote: IpAddr, remote_port: u16, mtu: u16) -> Result<Self, Error> {
        let connection_id = rand::random::<u16>() | 1;
        let codec = IpUdpCodec::new(local, remote, remote_port, connection_id)?;

        let shutdown = ShutdownLatch::new();
        let (event_tx, events) = mpsc::channel(1);

        Ok(Self {
            shared: Arc::new(TunShared {
                read_ch: Rendezvous::new(shutdown.clone()),
                write_ch: Rendezvous::new(shutdown.clone()),
                codec,
                endpoint: SocketAddr::new(remote, remote_port),
                shutdown,
                mtu,
                pool: PacketBufPool::new(PACKET_POOL_CAPACITY),
                _event_tx: event_tx,
            }),
            events,
        })
    }

    /// The name of this device.
    pub fn name(&self) -> &'static str {
        "stun"
    }

    /// The configured MTU of this device.
    pub fn mtu(&self) -> MtuWatcher {
        MtuWatcher::new(self.shared.mtu)
    }

    /// Lifecycle events of this device. The channel is valid but never fires.
    pub fn events(&mut self) -> &mut mpsc::Receiver<TunEvent> {
        &mut self.events
    }

    /// Create a UDP-bind view of this tunnel.
    ///
    /// The bind holds a non-owning reference: it does not keep the tunnel alive,
    /// and its operations fail with [`Error::Closed`] once the tunnel is gone.
    pub fn binder(&self) -> MultihopBind {
        MultihopBind::new(Arc::downgrade(&self.shared))
    }

    /// Write an IP datagram to the tunnel, to be consumed by a bind receive.
    ///
    /// Returns the number of bytes the receiver consumed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] once the tunnel is shut down.
    pub async fn send(&self, packet: Packet) -> Result<usize, Error> {
        let (_buf, size) = self.shared.write_ch.offer(packet).await?;
        Ok(size)
    }

    /// Read an IP datagram from the tunnel, produced by a bind send.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] once the tunnel is shut down.
    pub async fn recv(&self) -> Result<Packet, Error> {
        loop {
            let buf = self.shared.pool.get();
            let (mut buf, size) = self.shared.read_ch.offer(buf).await?;
            if size == 0 {
                // The bind side failed to encode into our buffer and delivered
                // nothing. Offer a fresh buffer instead of surfacing an error the
                // device could do nothing about.
                continue;
            }
            buf.truncate(size);
            return Ok(buf);
        }
    }

    /// Shut the tunnel down. Idempotent.
    ///
    /// All blocked and future reads, writes, and bind operations return
    /// [`Error::Closed`].
    pub fn close(&self) {
        self.shared.shutdown.shutdown();
    }
}
