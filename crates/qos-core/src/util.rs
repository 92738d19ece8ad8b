// Copyright (c) 2023-2024 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

use std::{future::Future, pin::Pin, task::Poll};

use tokio::sync::oneshot::{self, error::TryRecvError};

/// Create a oneshot channel with a custom implementation to make `Result`
/// handling more ergonomic.
pub fn oneshot_result<T>() -> (oneshot::Sender<crate::Result<T>>, OneshotResult<T>) {
    let (tx, rx) = oneshot::channel();

    (tx, OneshotResult { inner: rx })
}

/// An abstraction over a [`oneshot::Receiver`] of a result.
///
/// It can be awaited, or checked without blocking with
/// [`OneshotResult::try_take`] from synchronous code such as an update loop.
#[derive(Debug)]
pub struct OneshotResult<T> {
    inner: oneshot::Receiver<crate::Result<T>>,
}

impl<T> OneshotResult<T> {
    /// Returns the result if the sender has completed, `None` while it is
    /// still pending. A dropped sender is reported as an error.
    pub fn try_take(&mut self) -> Option<crate::Result<T>> {
        match self.inner.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(anyhow::anyhow!("result sender dropped"))),
        }
    }
}

impl<T> Future for OneshotResult<T> {
    type Output = crate::Result<T>;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().inner).poll(cx) {
            Poll::Ready(Ok(t)) => Poll::Ready(t),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}
