// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use std::pin::Pin;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// A wrapper around [`JoinHandle`] that aborts the task when dropped.
pub(crate) struct Task {
    name: &'static str,

    /// [`JoinHandle`] for the tokio task.
    ///
    /// INVARIANT: This is `Some` until either of:
    /// - Self is dropped.
    /// - [`Self::stop`] is called.
    handle: Option<JoinHandle<()>>,
    span: tracing::Span,
}

impl Task {
    #[track_caller]
    pub fn spawn<Fut>(name: &'static str, fut: Fut) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        // Set task parent to None to avoid nesting tracing spans
        let span = tracing::info_span!(parent: None, "Task", name = name);
        let handle = tokio::spawn(
            async move {
                tracing::debug!("task started");
                fut.await;
                tracing::debug!("task exited");
            }
            .instrument(span.clone()),
        );

        Task {
            name,
            handle: Some(handle),
            span,
        }
    }

    /// Abort the task and wait for it to finish.
    pub async fn stop(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            match handle.await {
                Err(e) if e.is_panic() => {
                    tracing::error!(parent: &self.span, "task {} panicked: {e:#?}", self.name);
                }
                _ => {
                    tracing::debug!(parent: &self.span, "stopped task {}", self.name);
                }
            }
        }
    }
}

impl Future for Task {
    type Output = <JoinHandle<()> as Future>::Output;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        self.handle
            .as_mut()
            .map(Pin::new)
            .expect("Handle is Some until task is stopped or dropped")
            .poll(cx)
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            tracing::debug!(parent: &self.span, "dropped task {}", self.name);

            // Note that the task future isn't dropped when calling abort.
            // It is dropped by the tokio runtime at some point in the future.
            // Prefer calling `Task::stop` for tasks that need to be promptly cleaned up.
            handle.abort();
        }
    }
}
