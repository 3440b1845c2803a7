// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! DAITA (Defense Against AI-guided Traffic Analysis).
//!
//! A per-peer pipeline that feeds traffic events into a state-machine [`Engine`]
//! and injects cover-traffic padding packets at the times the engine decides:
//!
//! ```text
//! data plane ── events ──> worker ── engine actions ──> scheduler ── timers ──>
//!     injector ── padding packets ──> peer outbound queue
//! ```
//!
//! Event submission never blocks the data plane: the event queue is bounded, and
//! events that do not fit are dropped (and counted).

mod engine;
mod inject;
mod scheduler;
mod types;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tokio::sync::mpsc;
use tokio::time::Instant;

pub use engine::{Engine, Error, MaybenotEngine};
pub use types::{Action, ActionKind, Event, EventKind, Padding, RawAction};

pub(crate) use inject::PaddingInjector;

use crate::peer::PeerKey;
use crate::task::Task;
use scheduler::ActionScheduler;

/// Configuration for enabling DAITA on a peer.
#[derive(Clone, Debug)]
pub struct DaitaSettings {
    /// The machines to run, one serialized machine per line.
    pub machines: String,
    /// Maximum fraction of bandwidth that may be used for padding packets.
    pub max_padding_frac: f64,
    /// Maximum fraction of bandwidth that may be blocked.
    pub max_blocking_frac: f64,
    /// Capacity of the bounded event queue. Events beyond it are dropped.
    pub events_capacity: usize,
}

impl Default for DaitaSettings {
    fn default() -> Self {
        Self {
            machines: String::new(),
            max_padding_frac: 0.0,
            max_blocking_frac: 0.0,
            events_capacity: 1024,
        }
    }
}

/// A running DAITA instance for one peer.
///
/// Owns the engine (inside its worker task) and the timer scheduler. Created by
/// [`Peer::enable_daita`](crate::peer::Peer::enable_daita); torn down by
/// [`Daita::close`] or by dropping.
pub struct Daita {
    event_tx: Option<mpsc::Sender<Event>>,
    peer: PeerKey,
    dropped_events: Arc<AtomicUsize>,
    scheduler: ActionScheduler,
    event_task: Option<Task>,
    inject_task: Option<Task>,
}

impl Daita {
    /// Spawn the event worker and the padding injector around `engine`.
    pub(crate) fn start<E: Engine>(
        engine: E,
        peer: PeerKey,
        events_capacity: usize,
        injector: PaddingInjector,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(events_capacity.max(1));
        let (scheduler, fired_rx) = ActionScheduler::new();

        let event_task = Task::spawn(
            "Daita::handle_events",
            handle_events(engine, event_rx, scheduler.clone()),
        );
        let inject_task = Task::spawn("Daita::inject_padding", injector.run(fired_rx));

        Self {
            event_tx: Some(event_tx),
            peer,
            dropped_events: Arc::new(AtomicUsize::new(0)),
            scheduler,
            event_task: Some(event_task),
            inject_task: Some(inject_task),
        }
    }

    /// A data packet was queued for sending to the peer.
    pub fn normal_sent(&self, packet_len: usize) {
        self.emit(EventKind::NormalSent, 0, packet_len);
    }

    /// A data packet arrived from the peer.
    pub fn normal_recv(&self, packet_len: usize) {
        self.emit(EventKind::NormalRecv, 0, packet_len);
    }

    /// A padding packet generated by `machine` was sent to the peer.
    pub fn padding_sent(&self, packet_len: usize, machine: u64) {
        self.emit(EventKind::PaddingSent, machine, packet_len);
    }

    /// A padding packet arrived from the peer.
    pub fn padding_recv(&self, packet_len: usize) {
        self.emit(EventKind::PaddingRecv, 0, packet_len);
    }

    fn emit(&self, kind: EventKind, machine: u64, packet_len: usize) {
        let Some(event_tx) = &self.event_tx else {
            return;
        };
        let event = Event {
            machine,
            peer: self.peer,
            kind,
            xmit_bytes: u16::try_from(packet_len).unwrap_or(u16::MAX),
        };

        if event_tx.try_send(event).is_err() {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
            log::debug!("dropped DAITA event {kind:?} due to full buffer");
        }
    }

    /// Number of events dropped because the event queue was full.
    pub fn dropped_events(&self) -> usize {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Number of armed padding timers.
    pub fn armed_timers(&self) -> usize {
        self.scheduler.armed()
    }

    /// Tear the pipeline down. Idempotent.
    ///
    /// Closes the event queue, waits for the worker to drain it (stopping the
    /// engine), disarms all timers, and waits for the injector to finish.
    pub async fn close(&mut self) {
        let Some(event_tx) = self.event_tx.take() else {
            return;
        };
        drop(event_tx);

        if let Some(task) = self.event_task.take() {
            let _ = task.await;
        }
        self.scheduler.close().await;
        if let Some(task) = self.inject_task.take() {
            let _ = task.await;
        }

        log::debug!("DAITA pipeline stopped");
    }
}

/// The single event-handler worker. Owns the engine: the only point of engine
/// mutation. Exits when the event queue closes.
async fn handle_events<E: Engine>(
    mut engine: E,
    mut event_rx: mpsc::Receiver<Event>,
    scheduler: ActionScheduler,
) {
    let mut actions = Vec::with_capacity(engine.num_machines());

    while let Some(event) = event_rx.recv().await {
        engine.on_event(&event, &mut actions);

        let now = Instant::now();
        for action in actions.drain(..) {
            scheduler.submit(action.schedule_at(now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::packet::{PacketBufPool, PaddingHeader};
    use crate::peer::StagedPacket;
    use crate::tun::MtuWatcher;

    /// An [`Engine`] that replays a fixed set of actions on every event.
    struct ScriptedEngine {
        script: Vec<RawAction>,
        seen: Arc<Mutex<Vec<Event>>>,
    }

    impl Engine for ScriptedEngine {
        fn num_machines(&self) -> usize {
            1
        }

        fn on_event(&mut self, event: &Event, actions: &mut Vec<RawAction>) {
            self.seen.lock().unwrap().push(*event);
            actions.extend_from_slice(&self.script);
        }
    }

    struct TestDaita {
        daita: Daita,
        seen: Arc<Mutex<Vec<Event>>>,
        outbound_rx: mpsc::Receiver<StagedPacket>,
    }

    fn daita_with_script(
        script: Vec<RawAction>,
        events_capacity: usize,
        constant_packet_size: bool,
        mtu: u16,
    ) -> TestDaita {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let engine = ScriptedEngine {
            script,
            seen: Arc::clone(&seen),
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(8);
        let injector = PaddingInjector::builder()
            .pool(PacketBufPool::new(8))
            .outbound(outbound_tx)
            .mtu(MtuWatcher::new(mtu))
            .constant_packet_size(constant_packet_size)
            .tx_padding_packet_bytes(Arc::new(AtomicUsize::new(0)))
            .build();

        let daita = Daita::start(engine, PeerKey::from([7u8; 32]), events_capacity, injector);
        TestDaita {
            daita,
            seen,
            outbound_rx,
        }
    }

    fn inject_after(timeout: Duration, byte_count: u16) -> RawAction {
        RawAction {
            machine: 3,
            timeout,
            kind: ActionKind::InjectPadding(Padding {
                byte_count,
                replace: false,
            }),
        }
    }

    /// An engine-scheduled injection turns into a correctly framed padding packet
    /// on the outbound queue.
    #[tokio::test(start_paused = true)]
    async fn padding_packet_is_staged() {
        let mut test = daita_with_script(
            vec![inject_after(Duration::from_millis(10), 100)],
            16,
            false,
            1280,
        );

        test.daita.normal_sent(1000);
        let staged = test.outbound_rx.recv().await.unwrap();

        assert_eq!(staged.padding, Some(3));
        let packet = &staged.packet;
        assert_eq!(packet.len(), 104);
        assert_eq!(packet[0], 0xff);
        assert_eq!(packet[1], 0x00);
        assert_eq!(&packet[2..4], &[0x00, 0x68]);
        assert!(PaddingHeader::is_padding(packet[0]));

        test.daita.close().await;
    }

    /// With constant packet size, padding is always MTU-sized.
    #[tokio::test(start_paused = true)]
    async fn constant_packet_size_uses_mtu() {
        let mut test = daita_with_script(
            vec![inject_after(Duration::from_millis(10), 100)],
            16,
            true,
            1280,
        );

        test.daita.normal_sent(1000);
        let staged = test.outbound_rx.recv().await.unwrap();

        assert_eq!(staged.packet.len(), 1280);
        assert_eq!(&staged.packet[..4], &[0xff, 0x00, 0x05, 0x00]);

        test.daita.close().await;
    }

    /// Events carry their kind, length, and the peer's key to the engine, in order.
    #[tokio::test(start_paused = true)]
    async fn events_reach_engine_in_order() {
        let mut test = daita_with_script(vec![], 16, false, 1280);

        test.daita.normal_sent(100);
        test.daita.normal_recv(200);
        test.daita.padding_sent(300, 9);
        test.daita.padding_recv(400);
        while test.seen.lock().unwrap().len() < 4 {
            tokio::task::yield_now().await;
        }

        let seen = test.seen.lock().unwrap().clone();
        let kinds: Vec<_> = seen.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            [
                EventKind::NormalSent,
                EventKind::NormalRecv,
                EventKind::PaddingSent,
                EventKind::PaddingRecv,
            ]
        );
        assert_eq!(seen[0].xmit_bytes, 100);
        assert_eq!(seen[2].machine, 9);
        assert!(seen.iter().all(|e| e.peer == PeerKey::from([7u8; 32])));

        test.daita.close().await;
    }

    /// A full event queue drops events instead of blocking the emitter.
    #[tokio::test(start_paused = true)]
    async fn full_queue_drops_events() {
        let mut test = daita_with_script(vec![], 1, false, 1280);

        // The worker has not run yet, so only one event fits.
        test.daita.normal_sent(1);
        test.daita.normal_sent(2);
        assert_eq!(test.daita.dropped_events(), 1);

        while test.seen.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(test.seen.lock().unwrap().len(), 1);

        test.daita.close().await;
    }

    /// Close is idempotent and disarms pending timers without firing them.
    #[tokio::test(start_paused = true)]
    async fn close_disarms_timers() {
        let mut test = daita_with_script(
            vec![inject_after(Duration::from_secs(3600), 100)],
            16,
            false,
            1280,
        );

        test.daita.normal_sent(1000);
        // Let the worker arm the timer before closing.
        while test.daita.armed_timers() == 0 {
            tokio::task::yield_now().await;
        }

        test.daita.close().await;
        test.daita.close().await;

        assert_eq!(test.daita.armed_timers(), 0);
        assert!(test.outbound_rx.try_recv().is_err());
    }
}
