// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use std::{
    net::{AddrParseError, SocketAddr},
    sync::Weak,
};

use super::{Error, TunShared, rendezvous::ShutdownLatch};

/// The UDP-bind view of a [`MultihopTun`](super::MultihopTun).
///
/// Datagrams sent here surface as tunnel reads on the paired tun, and tunnel writes
/// surface as received datagrams. Closing the bind only affects the bind view; the
/// tunnel stays usable and the bind can be opened again.
pub struct MultihopBind {
    tun: Weak<TunShared>,
    socket_shutdown: ShutdownLatch,
}

impl MultihopBind {
    pub(crate) fn new(tun: Weak<TunShared>) -> Self {
        Self {
            tun,
            socket_shutdown: ShutdownLatch::new(),
        }
    }

    /// Open the bind on `port`, or on a random nonzero port if `port == 0`.
    ///
    /// Returns the single receive handle together with the actual port. Opening
    /// arms a fresh socket-shutdown latch, so a bind may be closed and re-opened
    /// any number of times.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the tunnel no longer exists.
    pub fn open(&mut self, port: u16) -> Result<(MultihopUdpReceiver, u16), Error> {
        let shared = self.tun.upgrade().ok_or(Error::Closed)?;

        let port = if port == 0 {
            rand::random::<u16>() | 1
        } else {
            port
        };
        shared.codec.set_local_port(port);

        // The host device closes existing sockets before rebinding, so the previous
        // latch (if any) is already tripped. Receivers handed out earlier keep it.
        self.socket_shutdown = ShutdownLatch::new();

        let receiver = MultihopUdpReceiver {
            tun: self.tun.clone(),
            socket_shutdown: self.socket_shutdown.clone(),
        };
        Ok((receiver, port))
    }

    /// Send a UDP payload to the fixed remote endpoint.
    ///
    /// Waits for the paired tunnel read, then encodes `payload` into the reader's
    /// buffer with full IP + UDP headers.
    ///
    /// # Errors
    ///
    /// - [`Error::Closed`] if the tunnel or this bind has been shut down.
    /// - [`Error::BufferTooSmall`] if the reader's buffer cannot hold the datagram.
    pub async fn send(&self, payload: &[u8], _destination: SocketAddr) -> Result<(), Error> {
        let shared = self.tun.upgrade().ok_or(Error::Closed)?;

        let mut batch = tokio::select! {
            biased;
            () = self.socket_shutdown.wait() => return Err(Error::Closed),
            batch = shared.read_ch.take() => batch?,
        };

        let target: &mut [u8] = batch.buf_mut();
        match shared.codec.encode(target, payload) {
            Ok(size) => {
                batch.complete(size);
                Ok(())
            }
            Err(err) => {
                // Return the buffer empty-handed; the reader will retry with a
                // fresh buffer while we surface the error to the sender.
                batch.complete(0);
                Err(err)
            }
        }
    }

    /// Parse an endpoint string such as `"10.0.0.1:51820"`.
    pub fn parse_endpoint(endpoint: &str) -> Result<SocketAddr, AddrParseError> {
        endpoint.parse()
    }

    /// Setting a firewall mark is meaningless for an in-process tunnel.
    pub fn set_mark(&self, _mark: u32) {}

    /// Close this bind view. Idempotent. The tunnel itself stays up.
    pub fn close(&self) {
        self.socket_shutdown.shutdown();
    }
}

/// Receive handle returned by [`MultihopBind::open`].
pub struct MultihopUdpReceiver {
    tun: Weak<TunShared>,
    socket_shutdown: ShutdownLatch,
}

impl MultihopUdpReceiver {
    /// Receive one UDP payload, written by the paired tunnel write.
    ///
    /// The IP and UDP headers are stripped and the payload copied into `out`
    /// (truncating if `out` is too short). Returns the payload length and the
    /// fixed remote endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the tunnel or the bind has been shut down.
    pub async fn recv(&mut self, out: &mut [u8]) -> Result<(usize, SocketAddr), Error> {
        let shared = self.tun.upgrade().ok_or(Error::Closed)?;

        let batch = tokio::select! {
            biased;
            () = self.socket_shutdown.wait() => return Err(Error::Closed),
            batch = shared.write_ch.take() => batch?,
        };

        let size = match shared.codec.decode(batch.buf()) {
            Ok(payload) => {
                let size = payload.len().min(out.len());
                out[..size].copy_from_slice(&payload[..size]);
                size
            }
            Err(err) => {
                log::debug!("discarding malformed tunnel datagram: {err}");
                0
            }
        };
        batch.complete(size);

        Ok((size, shared.endpoint))
    }
}
