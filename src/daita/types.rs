// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use std::time::Duration;

use tokio::time::Instant;

use crate::peer::PeerKey;

/// A traffic event observed by the data plane and fed to the DAITA engine.
#[derive(Clone, Copy, Debug)]
pub struct Event {
    /// The machine that generated the action that caused this event, if any.
    pub machine: u64,
    /// The peer this event was observed on.
    pub peer: PeerKey,
    /// What happened.
    pub kind: EventKind,
    /// Number of bytes sent or received.
    pub xmit_bytes: u16,
}

/// The kind of a traffic [`Event`].
///
/// NOTE: the discriminants are part of the engine contract and must match the
/// trigger-event set of the engine build in use.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// A data packet was received from the tunnel.
    NormalRecv = 0,
    /// A padding packet was received from the tunnel.
    PaddingRecv = 1,
    /// Any packet was received from the tunnel.
    TunnelRecv = 2,
    /// A data packet was queued for sending.
    NormalSent = 3,
    /// A padding packet was queued for sending.
    PaddingSent = 4,
    /// Any packet was sent into the tunnel.
    TunnelSent = 5,
    /// A machine started blocking outgoing traffic.
    BlockingBegin = 6,
    /// Blocking of outgoing traffic ended.
    BlockingEnd = 7,
    /// A machine's internal timer started.
    TimerBegin = 8,
    /// A machine's internal timer ended.
    TimerEnd = 9,
}

/// An action produced by the engine, relative to the moment the triggering event
/// was processed.
#[derive(Clone, Copy, Debug)]
pub struct RawAction {
    /// The machine that generated this action.
    pub machine: u64,
    /// How long after event processing the action should be performed.
    pub timeout: Duration,
    /// What to do.
    pub kind: ActionKind,
}

impl RawAction {
    /// Anchor this action to a wall-clock deadline.
    pub fn schedule_at(self, now: Instant) -> Action {
        Action {
            machine: self.machine,
            due: now + self.timeout,
            kind: self.kind,
        }
    }
}

/// A [`RawAction`] anchored to a wall-clock deadline.
#[derive(Clone, Copy, Debug)]
pub struct Action {
    /// The machine that generated this action.
    pub machine: u64,
    /// When the action should be performed.
    pub due: Instant,
    /// What to do.
    pub kind: ActionKind,
}

/// What an [`Action`] does.
#[derive(Clone, Copy, Debug)]
pub enum ActionKind {
    /// Cancel the pending action of the machine, if any.
    Cancel,
    /// Replace the pending action of the machine with a padding injection.
    InjectPadding(Padding),
    /// Block outgoing traffic. Accepted but not implemented.
    BlockOutgoing,
}

/// Parameters of a padding injection.
#[derive(Clone, Copy, Debug)]
pub struct Padding {
    /// Size of the padding packet in bytes, NOT including the DAITA header.
    pub byte_count: u16,
    /// Whether the padding may be replaced by queued data. Carried through for the
    /// engine's bookkeeping; the injector does not act on it.
    pub replace: bool,
}
