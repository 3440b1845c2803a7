// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Tunnel-device facing types: the MTU watcher and tun lifecycle events.

use std::future::pending;

use tokio::sync::watch;

/// Lifecycle event of a tunnel device.
///
/// Devices are not required to ever emit these; a dormant event channel is valid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunEvent {
    /// The device came up.
    Up,
    /// The device went down.
    Down,
}

/// Watches the MTU of a tunnel device.
///
/// The MTU is the max size of packets read from the device. Since the MTU may change
/// at any time, a value read from this watcher is inherently racy.
#[derive(Clone)]
pub struct MtuWatcher {
    mtu_source: MtuSource,
}

#[derive(Clone)]
enum MtuSource {
    Constant(u16),
    Watch(watch::Receiver<u16>),
}

impl MtuWatcher {
    /// Create an MTU watcher which always returns `mtu`.
    pub const fn new(mtu: u16) -> Self {
        Self {
            mtu_source: MtuSource::Constant(mtu),
        }
    }

    /// Get the current MTU.
    pub fn get(&mut self) -> u16 {
        match &mut self.mtu_source {
            MtuSource::Constant(mtu) => *mtu,
            MtuSource::Watch(mtu_rx) => *mtu_rx.borrow_and_update(),
        }
    }

    /// Wait for the MTU to change and return the new value.
    pub async fn wait(&mut self) -> u16 {
        match &mut self.mtu_source {
            MtuSource::Constant(_) => return pending().await,
            MtuSource::Watch(mtu_rx) => {
                if mtu_rx.changed().await.is_err() {
                    return pending().await;
                }
            }
        }

        self.get()
    }
}

impl From<watch::Receiver<u16>> for MtuWatcher {
    fn from(mtu_rx: watch::Receiver<u16>) -> Self {
        Self {
            mtu_source: MtuSource::Watch(mtu_rx),
        }
    }
}
