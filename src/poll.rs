//! Readiness multiplexing for the tarpit loop.
//!
//! [`wait`] suspends the single loop task until at least one listener or
//! tracked connection has something to read, or until the timeout passes.
//! It only observes readiness. Clearing it is left to the accept or read that
//! runs into "would block", so a socket reported ready stays ready until it
//! has actually been serviced.

use std::{
    future::poll_fn,
    io,
    task::{Context, Poll},
    time::Duration,
};

use thiserror::Error;

use crate::table::ConnectionTable;

/// Something whose read readiness can be watched.
pub trait Watch {
    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

/// Indices of the listeners and occupied slots that have work pending.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub listeners: Vec<usize>,
    pub connections: Vec<usize>,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty() && self.connections.is_empty()
    }
}

/// `Interrupted` is worth retrying straight away; `Fatal` is not.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("readiness wait interrupted")]
    Interrupted,
    #[error("readiness wait failed")]
    Fatal(#[source] io::Error),
}

impl From<io::Error> for WaitError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::Interrupted => WaitError::Interrupted,
            _ => WaitError::Fatal(err),
        }
    }
}

/// Waits up to `timeout` for any of `listeners` or the occupied slots of
/// `connections` to become readable. An elapsed timeout yields an empty
/// [`Readiness`].
pub async fn wait<L, C>(
    listeners: &[L],
    connections: &ConnectionTable<C>,
    timeout: Duration,
) -> Result<Readiness, WaitError>
where
    L: Watch,
    C: Watch,
{
    let ready = poll_fn(|cx| poll_ready(listeners, connections, cx));
    match tokio::time::timeout(timeout, ready).await {
        Ok(result) => result,
        Err(_elapsed) => Ok(Readiness::default()),
    }
}

fn poll_ready<L, C>(
    listeners: &[L],
    connections: &ConnectionTable<C>,
    cx: &mut Context<'_>,
) -> Poll<Result<Readiness, WaitError>>
where
    L: Watch,
    C: Watch,
{
    let mut ready = Readiness::default();
    for (index, listener) in listeners.iter().enumerate() {
        match listener.poll_read_ready(cx) {
            Poll::Ready(Ok(())) => ready.listeners.push(index),
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err.into())),
            Poll::Pending => {}
        }
    }
    for (slot, conn) in connections.iter() {
        // A connection-level error is reported by the read that follows.
        if conn.poll_read_ready(cx).is_ready() {
            ready.connections.push(slot);
        }
    }
    if ready.is_empty() {
        Poll::Pending
    } else {
        Poll::Ready(Ok(ready))
    }
}
