// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! The pluggable state-machine engine behind DAITA.
//!
//! [`Engine`] is the seam the rest of the pipeline is written against;
//! [`MaybenotEngine`] is the production implementation, backed by the [`maybenot`]
//! crate.

use std::str::FromStr;
use std::time::Duration;

use maybenot::{Framework, Machine, MachineId, TriggerAction, TriggerEvent};
use rand::rngs::{OsRng, ReseedingRng};

use super::types::{ActionKind, Event, EventKind, Padding, RawAction};

/// RNG used to drive the maybenot framework.
///
/// [`OsRng`] is the entropy source, extrapolated through ChaCha12 and reseeded
/// every [`RNG_RESEED_THRESHOLD`] bytes. This is the same construction
/// [`rand::rng`] uses internally, but unlike the thread-local rng it is `Send`.
type Rng = ReseedingRng<rand_chacha::ChaCha12Core, OsRng>;
const RNG_RESEED_THRESHOLD: u64 = 1024 * 64; // 64 KiB

/// Error starting a [`MaybenotEngine`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A machine in the spec string failed to parse.
    #[error("invalid maybenot machine: {0}")]
    ParseMachine(#[source] maybenot::Error),

    /// The maybenot framework rejected the configuration.
    #[error("failed to start maybenot framework: {0}")]
    Framework(#[source] maybenot::Error),
}

/// A DAITA state-machine engine.
///
/// Implementations consume one traffic [`Event`] at a time and produce zero or
/// more scheduled [`RawAction`]s. The engine instance is owned and driven by a
/// single worker; stopping it is dropping it.
pub trait Engine: Send + 'static {
    /// Number of machines running inside the engine.
    ///
    /// An `on_event` call appends at most this many actions.
    fn num_machines(&self) -> usize;

    /// Feed one event to the engine, appending the resulting actions to `actions`.
    fn on_event(&mut self, event: &Event, actions: &mut Vec<RawAction>);
}

/// The production [`Engine`], wrapping a [`maybenot::Framework`].
pub struct MaybenotEngine {
    framework: Framework<Vec<Machine>, Rng>,
    num_machines: usize,
    /// Padding packets are always full-size; this is the byte count handed to the
    /// injector, excluding the DAITA header.
    padding_bytes: u16,
}

impl MaybenotEngine {
    /// Parse `machines_spec` (one serialized machine per line) and start the
    /// framework.
    pub fn start(
        machines_spec: &str,
        max_padding_frac: f64,
        max_blocking_frac: f64,
        mtu: u16,
    ) -> Result<Self, Error> {
        let machines = machines_spec
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(Machine::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Error::ParseMachine)?;

        let num_machines = machines.len();
        let framework = Framework::new(
            machines,
            max_padding_frac,
            max_blocking_frac,
            std::time::Instant::now(),
            Rng::new(RNG_RESEED_THRESHOLD, OsRng).unwrap(),
        )
        .map_err(Error::Framework)?;

        Ok(Self {
            framework,
            num_machines,
            padding_bytes: mtu,
        })
    }
}

impl Engine for MaybenotEngine {
    fn num_machines(&self) -> usize {
        self.num_machines
    }

    fn on_event(&mut self, event: &Event, actions: &mut Vec<RawAction>) {
        let machine = MachineId::from_raw(usize::try_from(event.machine).unwrap_or_default());
        let trigger = match event.kind {
            EventKind::NormalRecv => TriggerEvent::NormalRecv,
            EventKind::PaddingRecv => TriggerEvent::PaddingRecv,
            EventKind::TunnelRecv => TriggerEvent::TunnelRecv,
            EventKind::NormalSent => TriggerEvent::NormalSent,
            EventKind::PaddingSent => TriggerEvent::PaddingSent { machine },
            EventKind::TunnelSent => TriggerEvent::TunnelSent,
            EventKind::BlockingBegin => TriggerEvent::BlockingBegin { machine },
            EventKind::BlockingEnd => TriggerEvent::BlockingEnd,
            EventKind::TimerBegin => TriggerEvent::TimerBegin { machine },
            EventKind::TimerEnd => TriggerEvent::TimerEnd { machine },
        };

        let padding_bytes = self.padding_bytes;
        for action in self
            .framework
            .trigger_events(&[trigger], std::time::Instant::now())
        {
            let raw = match action {
                TriggerAction::Cancel { machine, .. } => RawAction {
                    machine: machine.into_raw() as u64,
                    timeout: Duration::ZERO,
                    kind: ActionKind::Cancel,
                },
                TriggerAction::SendPadding {
                    timeout,
                    replace,
                    machine,
                    ..
                } => RawAction {
                    machine: machine.into_raw() as u64,
                    timeout: *timeout,
                    kind: ActionKind::InjectPadding(Padding {
                        byte_count: padding_bytes,
                        replace: *replace,
                    }),
                },
                TriggerAction::BlockOutgoing {
                    timeout, machine, ..
                } => RawAction {
                    machine: machine.into_raw() as u64,
                    timeout: *timeout,
                    kind: ActionKind::BlockOutgoing,
                },
                // Internal machine timers are not part of the action contract.
                TriggerAction::UpdateTimer { .. } => {
                    log::trace!("ignoring maybenot timer update");
                    continue;
                }
            };
            actions.push(raw);
        }
    }
}
