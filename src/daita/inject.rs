// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use std::sync::{
    Arc,
    atomic::{self, AtomicUsize},
};

use tokio::sync::mpsc;
use typed_builder::TypedBuilder;
use zerocopy::IntoBytes;

use super::scheduler::FiredPadding;
use crate::{
    packet::{PacketBufPool, PaddingHeader},
    peer::StagedPacket,
    tun::MtuWatcher,
};

/// Builds padding packets for fired timers and stages them on the peer's outbound
/// queue.
#[derive(TypedBuilder)]
pub(crate) struct PaddingInjector {
    pool: PacketBufPool,
    outbound: mpsc::Sender<StagedPacket>,
    mtu: MtuWatcher,
    /// When set, every padding packet is padded up to the MTU regardless of the
    /// byte count the engine asked for.
    constant_packet_size: bool,
    tx_padding_packet_bytes: Arc<AtomicUsize>,
}

impl PaddingInjector {
    /// Consume fired padding orders until the channel closes.
    pub(crate) async fn run(mut self, mut fired_rx: mpsc::UnboundedReceiver<FiredPadding>) {
        while let Some(order) = fired_rx.recv().await {
            self.inject(order);
        }
        log::debug!("padding order channel closed, stopping injector");
    }

    fn inject(&mut self, order: FiredPadding) {
        let size = if self.constant_packet_size {
            self.mtu.get()
        } else {
            let Some(size) = order
                .padding
                .byte_count
                .checked_add(PaddingHeader::LEN as u16)
            else {
                log::error!("padding packet size overflow, dropping");
                return;
            };
            size
        };
        if usize::from(size) < PaddingHeader::LEN {
            log::error!("padding action contained invalid size {size}, dropping");
            return;
        }

        let mut packet = self.pool.get();
        let buf = packet.buf_mut();
        buf.clear();
        buf.extend_from_slice(PaddingHeader::new(size).as_bytes());
        // Bytes past the header are arbitrary; they are encrypted on the wire.
        buf.resize(size.into(), 0);

        self.tx_padding_packet_bytes
            .fetch_add(size.into(), atomic::Ordering::SeqCst);

        let staged = StagedPacket {
            packet,
            padding: Some(order.machine),
        };
        if let Err(err) = self.outbound.try_send(staged) {
            // Best effort: a congested or closed outbound queue just loses padding.
            log::debug!(
                "failed to stage padding packet for machine {}: {err}",
                order.machine
            );
        }
    }
}
