// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! A synchronous buffer handoff between two tasks.
//!
//! [`Rendezvous::offer`] publishes a caller-owned buffer and suspends until the
//! consumer has processed it and handed it back through [`BatchGuard::complete`].
//! There is no queueing: per channel, at most one batch is in flight at a time.
//!
//! Termination is signalled exclusively through a [`ShutdownLatch`]; neither side
//! ever closes the data-carrying channel out from under the other.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot, watch};

use super::Error;

/// A one-way, sticky shutdown signal.
///
/// Cloning yields a handle to the same latch. Tripping it is idempotent.
#[derive(Clone)]
pub(crate) struct ShutdownLatch {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownLatch {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Trip the latch, waking all current and future waiters.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    /// Wait until the latch is tripped. Returns immediately if it already was.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|closed| *closed).await.is_err() {
            // All senders are gone, so the latch can never trip.
            std::future::pending::<()>().await;
        }
    }
}

struct Batch<T> {
    buf: T,
    done: oneshot::Sender<(T, usize)>,
}

/// A consumer-side handle to an offered buffer.
///
/// Dropping the guard without calling [`BatchGuard::complete`] resolves the
/// producer's [`Rendezvous::offer`] with [`Error::Closed`].
pub(crate) struct BatchGuard<T> {
    buf: T,
    done: oneshot::Sender<(T, usize)>,
}

impl<T> BatchGuard<T> {
    pub fn buf(&self) -> &T {
        &self.buf
    }

    pub fn buf_mut(&mut self) -> &mut T {
        &mut self.buf
    }

    /// Hand the buffer back to the producer together with a result size.
    pub fn complete(self, size: usize) {
        let _ = self.done.send((self.buf, size));
    }
}

/// A synchronous handoff of owned buffers, with a shared shutdown latch.
pub(crate) struct Rendezvous<T> {
    tx: mpsc::Sender<Batch<T>>,
    rx: Arc<Mutex<mpsc::Receiver<Batch<T>>>>,
    latch: ShutdownLatch,
}

impl<T: Send> Rendezvous<T> {
    /// Create a rendezvous channel tied to `latch`.
    pub fn new(latch: ShutdownLatch) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            latch,
        }
    }

    /// Publish `buf` and wait until the consumer hands it back.
    ///
    /// On success, returns the buffer together with the size set by the consumer.
    /// Returns [`Error::Closed`] if the latch trips first, or if the consumer drops
    /// the batch without completing it.
    pub async fn offer(&self, buf: T) -> Result<(T, usize), Error> {
        let (done_tx, done_rx) = oneshot::channel();
        let batch = Batch { buf, done: done_tx };

        tokio::select! {
            biased;
            () = self.latch.wait() => return Err(Error::Closed),
            sent = self.tx.send(batch) => {
                if sent.is_err() {
                    return Err(Error::Closed);
                }
            }
        }

        // Prefer the completion so that a consumer racing against shutdown still
        // gets its result through.
        tokio::select! {
            biased;
            done = done_rx => done.map_err(|_| Error::Closed),
            () = self.latch.wait() => Err(Error::Closed),
        }
    }

    /// Wait for a published batch.
    ///
    /// Returns [`Error::Closed`] if the latch trips first.
    pub async fn take(&self) -> Result<BatchGuard<T>, Error> {
        tokio::select! {
            biased;
            () = self.latch.wait() => Err(Error::Closed),
            batch = async {
                let mut rx = self.rx.lock().await;
                rx.recv().await
            } => {
                // `recv` yields `None` only when all senders are dropped, which
                // cannot outlive `self`. Treat it as shutdown regardless.
                let Batch { buf, done } = batch.ok_or(Error::Closed)?;
                Ok(BatchGuard { buf, done })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Offer and take must meet in lockstep and transfer the buffer both ways.
    #[tokio::test]
    async fn offer_take_lockstep() {
        let channel = Arc::new(Rendezvous::<Vec<u8>>::new(ShutdownLatch::new()));

        let consumer = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move {
                let mut batch = channel.take().await.unwrap();
                batch.buf_mut().extend_from_slice(b"pong");
                batch.complete(4);
            }
        });

        let (buf, size) = channel.offer(Vec::new()).await.unwrap();
        assert_eq!(size, 4);
        assert_eq!(buf, b"pong");
        consumer.await.unwrap();
    }

    /// Shutdown must release both a blocked producer and a blocked consumer.
    #[tokio::test]
    async fn shutdown_releases_blocked_sides() {
        let latch = ShutdownLatch::new();
        let read_ch = Arc::new(Rendezvous::<Vec<u8>>::new(latch.clone()));
        let write_ch = Arc::new(Rendezvous::<Vec<u8>>::new(latch.clone()));

        // A take with no producer, and an offer with no consumer.
        let blocked_take = tokio::spawn({
            let read_ch = Arc::clone(&read_ch);
            async move { read_ch.take().await.map(|_| ()) }
        });
        let blocked_offer = tokio::spawn({
            let write_ch = Arc::clone(&write_ch);
            async move { write_ch.offer(vec![1, 2, 3]).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        latch.shutdown();

        assert!(matches!(blocked_take.await.unwrap(), Err(Error::Closed)));
        assert!(matches!(blocked_offer.await.unwrap(), Err(Error::Closed)));

        // After shutdown, both operations fail immediately.
        assert!(matches!(read_ch.take().await, Err(Error::Closed)));
        assert!(matches!(write_ch.offer(Vec::new()).await, Err(Error::Closed)));
    }

    /// Dropping the guard without completing must not strand the producer.
    #[tokio::test]
    async fn dropped_guard_fails_offer() {
        let channel = Arc::new(Rendezvous::<Vec<u8>>::new(ShutdownLatch::new()));

        let consumer = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move {
                let batch = channel.take().await.unwrap();
                drop(batch);
            }
        });

        assert!(matches!(
            channel.offer(Vec::new()).await,
            Err(Error::Closed)
        ));
        consumer.await.unwrap();
    }
}
