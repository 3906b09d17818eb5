//! Helpers for working with asynchronous tasks.
use std::future::Future;

use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::Instrument as _;

/// Spawns a new asynchronous task, returning a [`JoinHandle`] for it.
///
/// Thin wrapper over [`tokio::spawn`] that attaches the task to the current `tracing` span.
pub fn spawn_traced<F, T>(f: F) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(f.in_current_span())
}

/// Traced spawning for [`JoinSet`].
pub trait JoinSetExt<T> {
    /// Spawns a new asynchronous task attached to the current `tracing` span, returning an [`AbortHandle`] for it.
    fn spawn_traced<F>(&mut self, f: F) -> AbortHandle
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static;
}

impl<T> JoinSetExt<T> for JoinSet<T> {
    fn spawn_traced<F>(&mut self, f: F) -> AbortHandle
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.spawn(f.in_current_span())
    }
}
