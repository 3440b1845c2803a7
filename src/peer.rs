// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Peer-side integration of DAITA.
//!
//! The host data plane owns the real peer (crypto session, endpoint, queues); this
//! module only carries the slice of peer state DAITA needs: the identity, the
//! outbound staging queue, and the DAITA lifecycle.

use std::sync::{Arc, atomic::AtomicUsize};

use tokio::sync::mpsc;
use zerocopy::TryFromBytes;

use crate::daita::{Daita, DaitaSettings, Engine, MaybenotEngine, PaddingInjector};
use crate::packet::{Packet, PacketBufPool, PaddingPacket};
use crate::tun::MtuWatcher;

/// The static public-key identity of a remote peer.
pub type PeerKey = x25519_dalek::PublicKey;

/// A packet staged on a peer's outbound queue, to be encrypted and sent by the
/// host data plane.
pub struct StagedPacket {
    /// The plaintext packet.
    pub packet: Packet,
    /// `Some(machine)` if this is a padding packet generated by that machine.
    /// The data plane reports it back through [`Peer::padding_sent`] when sent.
    pub padding: Option<u64>,
}

/// Error enabling DAITA on a peer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The peer is not running.
    #[error("peer is not running")]
    NotRunning,

    /// DAITA is already enabled for this peer.
    #[error("DAITA is already active")]
    AlreadyEnabled,

    /// The tunnel MTU could not be determined.
    #[error("tunnel MTU is not available")]
    MtuUnavailable,

    /// The engine rejected the machine spec or configuration.
    #[error(transparent)]
    Engine(#[from] crate::daita::Error),
}

/// Traffic overhead induced by DAITA, in bytes.
#[derive(Default)]
pub struct DaitaOverhead {
    /// Bytes of padding packets staged for transmission.
    // Atomic because the injector task updates it.
    pub tx_padding_packet_bytes: Arc<AtomicUsize>,
    /// Bytes of padding packets received and swallowed.
    pub rx_padding_packet_bytes: usize,
}

/// The DAITA-facing view of a peer.
pub struct Peer {
    public_key: PeerKey,
    outbound: mpsc::Sender<StagedPacket>,
    mtu: MtuWatcher,
    pool: PacketBufPool,
    constant_packet_size: bool,
    running: bool,
    overhead: DaitaOverhead,
    daita: Option<Daita>,
}

impl Peer {
    /// Create the peer view.
    ///
    /// `outbound` is the peer's outbound staging queue; `mtu` watches the tunnel
    /// device the peer's traffic enters through.
    pub fn new(
        public_key: PeerKey,
        outbound: mpsc::Sender<StagedPacket>,
        mtu: MtuWatcher,
        pool: PacketBufPool,
    ) -> Self {
        Self {
            public_key,
            outbound,
            mtu,
            pool,
            constant_packet_size: false,
            running: false,
            overhead: DaitaOverhead::default(),
            daita: None,
        }
    }

    /// Pad every padding packet up to the MTU, instead of using the engine's size.
    pub fn with_constant_packet_size(mut self, constant_packet_size: bool) -> Self {
        self.constant_packet_size = constant_packet_size;
        self
    }

    /// The peer's public key.
    pub fn public_key(&self) -> &PeerKey {
        &self.public_key
    }

    /// Mark the peer as running or stopped. DAITA can only be enabled on a
    /// running peer.
    pub fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    /// Whether DAITA is active for this peer.
    pub fn daita_enabled(&self) -> bool {
        self.daita.is_some()
    }

    /// DAITA overhead counters for this peer.
    pub fn daita_overhead(&self) -> &DaitaOverhead {
        &self.overhead
    }

    /// Enable DAITA for this peer using the production engine.
    ///
    /// Starts the engine from `settings` and spawns the event worker and padding
    /// injector. On error, the peer is left exactly as it was.
    ///
    /// # Errors
    ///
    /// - [`Error::NotRunning`] if the peer has not been started.
    /// - [`Error::AlreadyEnabled`] if DAITA is already active.
    /// - [`Error::MtuUnavailable`] if the tunnel MTU cannot be read.
    /// - [`Error::Engine`] if the machine spec is invalid or the engine fails to
    ///   start.
    pub fn enable_daita(&mut self, settings: DaitaSettings) -> Result<(), Error> {
        let mtu = self.check_enable()?;

        let engine = MaybenotEngine::start(
            &settings.machines,
            settings.max_padding_frac,
            settings.max_blocking_frac,
            mtu,
        )?;
        self.install_daita(engine, settings.events_capacity);
        Ok(())
    }

    /// Enable DAITA with a caller-provided engine. See [`Peer::enable_daita`].
    pub fn enable_daita_with_engine<E: Engine>(
        &mut self,
        engine: E,
        events_capacity: usize,
    ) -> Result<(), Error> {
        self.check_enable()?;
        self.install_daita(engine, events_capacity);
        Ok(())
    }

    fn check_enable(&self) -> Result<u16, Error> {
        if !self.running {
            return Err(Error::NotRunning);
        }
        if self.daita.is_some() {
            log::error!("failed to activate DAITA as it is already active");
            return Err(Error::AlreadyEnabled);
        }

        let mtu = self.mtu.clone().get();
        if mtu == 0 {
            return Err(Error::MtuUnavailable);
        }
        Ok(mtu)
    }

    fn install_daita<E: Engine>(&mut self, engine: E, events_capacity: usize) {
        log::info!("enabling DAITA for peer");

        let injector = PaddingInjector::builder()
            .pool(self.pool.clone())
            .outbound(self.outbound.clone())
            .mtu(self.mtu.clone())
            .constant_packet_size(self.constant_packet_size)
            .tx_padding_packet_bytes(Arc::clone(&self.overhead.tx_padding_packet_bytes))
            .build();

        self.daita = Some(Daita::start(
            engine,
            self.public_key,
            events_capacity,
            injector,
        ));
    }

    /// Disable DAITA for this peer, tearing down its worker and timers. Idempotent.
    pub async fn disable_daita(&mut self) {
        if let Some(mut daita) = self.daita.take() {
            daita.close().await;
        }
    }

    /// Report a data packet queued for sending. No-op while DAITA is disabled.
    pub fn normal_sent(&self, packet_len: usize) {
        if let Some(daita) = &self.daita {
            daita.normal_sent(packet_len);
        }
    }

    /// Report a sent padding packet generated by `machine`. No-op while DAITA is
    /// disabled.
    pub fn padding_sent(&self, packet_len: usize, machine: u64) {
        if let Some(daita) = &self.daita {
            daita.padding_sent(packet_len, machine);
        }
    }

    /// Inspect a decrypted inbound tunnel packet.
    ///
    /// Padding packets are recognized by their marker byte, counted, reported to
    /// the engine, and swallowed (`None`). Anything else is reported as a received
    /// data packet and handed back for normal processing.
    pub fn inspect_inbound(&mut self, packet: Packet) -> Option<Packet> {
        if PaddingPacket::try_ref_from_bytes(&packet).is_ok() {
            self.overhead.rx_padding_packet_bytes += packet.len();
            if let Some(daita) = &self.daita {
                daita.padding_recv(packet.len());
            }
            return None;
        }

        if let Some(daita) = &self.daita {
            daita.normal_recv(packet.len());
        }
        Some(packet)
    }

    /// The running DAITA instance, if enabled.
    pub fn daita(&self) -> Option<&Daita> {
        self.daita.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daita::{Event, RawAction};
    use bytes::BytesMut;

    /// An engine that never produces actions.
    struct NullEngine;

    impl Engine for NullEngine {
        fn num_machines(&self) -> usize {
            0
        }

        fn on_event(&mut self, _event: &Event, _actions: &mut Vec<RawAction>) {}
    }

    fn test_peer() -> (Peer, mpsc::Receiver<StagedPacket>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(8);
        let peer = Peer::new(
            PeerKey::from([1u8; 32]),
            outbound_tx,
            MtuWatcher::new(1280),
            PacketBufPool::new(8),
        );
        (peer, outbound_rx)
    }

    #[tokio::test]
    async fn enable_requires_running_peer() {
        let (mut peer, _outbound_rx) = test_peer();

        assert!(matches!(
            peer.enable_daita_with_engine(NullEngine, 16),
            Err(Error::NotRunning)
        ));
        assert!(!peer.daita_enabled());

        peer.set_running(true);
        peer.enable_daita_with_engine(NullEngine, 16).unwrap();
        assert!(peer.daita_enabled());

        peer.disable_daita().await;
    }

    #[tokio::test]
    async fn double_enable_fails_cleanly() {
        let (mut peer, _outbound_rx) = test_peer();
        peer.set_running(true);

        peer.enable_daita_with_engine(NullEngine, 16).unwrap();
        assert!(matches!(
            peer.enable_daita_with_engine(NullEngine, 16),
            Err(Error::AlreadyEnabled)
        ));
        assert!(peer.daita_enabled());

        peer.disable_daita().await;
        peer.disable_daita().await; // idempotent
        assert!(!peer.daita_enabled());

        // After disabling, DAITA can be enabled again.
        peer.enable_daita_with_engine(NullEngine, 16).unwrap();
        peer.disable_daita().await;
    }

    #[tokio::test]
    async fn enable_requires_mtu() {
        let (outbound_tx, _outbound_rx) = mpsc::channel(8);
        let mut peer = Peer::new(
            PeerKey::from([1u8; 32]),
            outbound_tx,
            MtuWatcher::new(0),
            PacketBufPool::new(8),
        );
        peer.set_running(true);

        assert!(matches!(
            peer.enable_daita(DaitaSettings::default()),
            Err(Error::MtuUnavailable)
        ));
    }

    #[tokio::test]
    async fn bad_machine_spec_is_rejected() {
        let (mut peer, _outbound_rx) = test_peer();
        peer.set_running(true);

        let settings = DaitaSettings {
            machines: "not a machine".into(),
            ..DaitaSettings::default()
        };
        assert!(matches!(
            peer.enable_daita(settings),
            Err(Error::Engine(_))
        ));
        assert!(!peer.daita_enabled());
    }

    #[tokio::test]
    async fn inbound_padding_is_swallowed() {
        let (mut peer, _outbound_rx) = test_peer();

        let padding = Packet::from_bytes(BytesMut::from(&[0xff, 0x00, 0x00, 0x08, 0, 0, 0, 0][..]));
        assert!(peer.inspect_inbound(padding).is_none());
        assert_eq!(peer.daita_overhead().rx_padding_packet_bytes, 8);

        let data = Packet::from_bytes(BytesMut::from(&[0x45u8; 20][..]));
        assert!(peer.inspect_inbound(data).is_some());
        assert_eq!(peer.daita_overhead().rx_padding_packet_bytes, 8);
    }
}
