// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Per-peer timer set for scheduled DAITA actions.
//!
//! Each machine holds at most one armed timer. Scheduling a new padding injection
//! for a machine supersedes its pending one, and cancelling disarms it. When a
//! timer fires, the padding order is handed to the injector task over a channel, so
//! that all injection happens on one task and all map surgery under one lock.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use tokio::sync::mpsc;

use super::types::{Action, ActionKind, Padding};
use crate::task::Task;

/// A padding order emitted when a timer fires.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FiredPadding {
    pub machine: u64,
    pub padding: Padding,
}

/// Set of pending timers, keyed by machine id.
#[derive(Clone)]
pub(crate) struct ActionScheduler {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    timers: HashMap<u64, ArmedTimer>,
    /// Distinguishes a timer from its replacement, so a superseded timer that
    /// already woke up cannot fire.
    next_generation: u64,
    fire_tx: Option<mpsc::UnboundedSender<FiredPadding>>,
    closed: bool,
}

struct ArmedTimer {
    generation: u64,
    /// Aborts the sleep when dropped.
    _task: Task,
}

impl ActionScheduler {
    /// Create a scheduler and the channel its fired padding orders arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FiredPadding>) {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            inner: Arc::new(Mutex::new(Inner {
                timers: HashMap::new(),
                next_generation: 0,
                fire_tx: Some(fire_tx),
                closed: false,
            })),
        };
        (scheduler, fire_rx)
    }

    /// Apply one action to the timer set.
    ///
    /// `Cancel` disarms the machine's pending timer. `InjectPadding` replaces it
    /// with a new one. `BlockOutgoing` is accepted and ignored. Submitting to a
    /// closed scheduler is a no-op.
    pub fn submit(&self, action: Action) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }

        match action.kind {
            ActionKind::Cancel => {
                inner.timers.remove(&action.machine);
            }
            ActionKind::BlockOutgoing => {
                log::warn!(
                    "ignoring blocking action for machine {}, unimplemented",
                    action.machine
                );
            }
            ActionKind::InjectPadding(padding) => {
                let Some(fire_tx) = inner.fire_tx.clone() else {
                    return;
                };
                let generation = inner.next_generation;
                inner.next_generation += 1;

                let machine = action.machine;
                let due = action.due;
                let weak_inner = Arc::downgrade(&self.inner);
                let task = Task::spawn("ActionScheduler::timer", async move {
                    tokio::time::sleep_until(due).await;
                    fire(&weak_inner, &fire_tx, machine, generation, padding);
                });

                // Dropping a superseded timer aborts its sleep.
                inner.timers.insert(
                    machine,
                    ArmedTimer {
                        generation,
                        _task: task,
                    },
                );
            }
        }
    }

    /// Number of currently armed timers.
    pub fn armed(&self) -> usize {
        self.inner.lock().unwrap().timers.len()
    }

    /// Disarm all timers and drop the fire channel.
    ///
    /// A timer that is mid-fire completes before this returns. Idempotent.
    pub async fn close(&self) {
        let timers: Vec<ArmedTimer> = {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
            inner.fire_tx = None;
            inner.timers.drain().map(|(_, timer)| timer).collect()
        };

        // Stop outside the lock; a firing timer needs it to finish.
        for timer in timers {
            timer._task.stop().await;
        }
    }
}

/// Fire a timer: disarm it and emit the padding order, unless it was superseded,
/// cancelled, or the scheduler is gone.
fn fire(
    inner: &Weak<Mutex<Inner>>,
    fire_tx: &mpsc::UnboundedSender<FiredPadding>,
    machine: u64,
    generation: u64,
    padding: Padding,
) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut inner = inner.lock().unwrap();

    match inner.timers.get(&machine) {
        Some(timer) if timer.generation == generation => {
            inner.timers.remove(&machine);
        }
        // A newer timer owns this machine now, or we were cancelled.
        _ => return,
    }

    let _ = fire_tx.send(FiredPadding { machine, padding });
}
