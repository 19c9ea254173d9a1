use std::{
    convert::Infallible,
    io::{self, Write},
    net::{self, SocketAddr},
    num::NonZeroUsize,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

use crate::{
    config::Endpoint,
    error::{Error, Result},
    listener::ListenerSet,
    poll::{self, WaitError, Watch},
    table::ConnectionTable,
};

pub const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Size of the buffer incoming bytes are read into and thrown away.
pub const SCRATCH_LEN: usize = 2048;

/// Full-buffer reads allowed per connection per turn. A peer that still has
/// data after that stays ready and is drained again next turn. Reads cut
/// short by a signal are not counted.
pub const MAX_READS_PER_TURN: usize = 16;

/// How long a listener sits out of the watch set after a failed accept.
pub const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// A peer that has been sent its banner and is now being held.
#[derive(Debug)]
struct Trapped {
    stream: TcpStream,
    peer: SocketAddr,
    port: u16,
    since: Instant,
}

impl Watch for Trapped {
    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.stream.poll_read_ready(cx)
    }
}

/// What one turn of the loop did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Turn {
    /// Connections sent a banner and admitted.
    pub accepted: usize,
    /// Connections dropped before admission (accept, setup or banner failure).
    pub rejected: usize,
    /// Tracked connections closed to make room.
    pub evicted: usize,
    /// Tracked connections closed after disconnect or read error.
    pub closed: usize,
}

enum Drained {
    Open,
    Closed(Option<io::Error>),
}

pub struct Tarpit {
    listeners: ListenerSet,
    table: ConnectionTable<Trapped>,
    scratch: Box<[u8]>,
    poll_timeout: Duration,
}

impl Tarpit {
    pub fn new(listeners: ListenerSet, capacity: NonZeroUsize) -> Self {
        Self {
            listeners,
            table: ConnectionTable::new(capacity),
            scratch: vec![0; SCRATCH_LEN].into_boxed_slice(),
            poll_timeout: POLL_TIMEOUT,
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn listeners(&self) -> &ListenerSet {
        &self.listeners
    }

    /// Number of connections currently held.
    pub fn tracked(&self) -> usize {
        self.table.len()
    }

    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Turns the loop until the readiness wait fails.
    pub async fn run(mut self) -> Result<Infallible> {
        info!(
            sockets = self.listeners.len(),
            capacity = self.capacity(),
            "tarpit running"
        );
        loop {
            let turn = self.turn().await?;
            if turn != Turn::default() {
                debug!(?turn, tracked = self.tracked(), "turn finished");
            }
        }
    }

    /// One iteration: wait, then accept on every ready listener, then drain
    /// every ready connection that was already tracked before this turn.
    pub async fn turn(&mut self) -> Result<Turn> {
        // A paused listener is not watched, so wake up when it comes back.
        let timeout = match self.listeners.next_resume() {
            Some(at) => self.poll_timeout.min(at.saturating_duration_since(Instant::now())),
            None => self.poll_timeout,
        };
        let ready = loop {
            match poll::wait(self.listeners.as_slice(), &self.table, timeout).await {
                Ok(ready) => break ready,
                Err(WaitError::Interrupted) => continue,
                Err(WaitError::Fatal(err)) => return Err(Error::Poll(err)),
            }
        };

        let mut turn = Turn::default();
        if ready.is_empty() {
            trace!(tracked = self.tracked(), "idle tick");
            return Ok(turn);
        }

        let mut admitted = Vec::new();
        for &index in &ready.listeners {
            if let Some(slot) = self.accept(index, &mut turn).await {
                admitted.push(slot);
            }
        }
        for &slot in &ready.connections {
            if !admitted.contains(&slot) {
                self.drain(slot, &mut turn);
            }
        }
        Ok(turn)
    }

    async fn accept(&mut self, index: usize, turn: &mut Turn) -> Option<usize> {
        let accepted = self.listeners.get(index)?.accept().await;
        let (stream, peer) = match accepted {
            Ok(Some(accepted)) => accepted,
            Ok(None) => return None,
            Err(err) => {
                let listener = self.listeners.get_mut(index)?;
                listener.pause(ACCEPT_BACKOFF);
                warn!(
                    addr = %listener.local_addr(),
                    error = %err,
                    backoff = ?ACCEPT_BACKOFF,
                    "accept failed"
                );
                turn.rejected += 1;
                return None;
            }
        };
        let endpoint = self.listeners.get(index)?.endpoint();
        let stream = match send_banner(stream, endpoint) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%peer, port = endpoint.port, error = %err, "writing banner failed");
                turn.rejected += 1;
                return None;
            }
        };

        let port = endpoint.port;
        let (slot, evicted) = self.table.admit(Trapped {
            stream,
            peer,
            port,
            since: Instant::now(),
        });
        info!(%peer, port, slot, "connection trapped");
        turn.accepted += 1;
        if let Some(old) = evicted {
            info!(
                peer = %old.peer,
                port = old.port,
                held = ?old.since.elapsed(),
                "evicted oldest connection"
            );
            turn.evicted += 1;
        }
        Some(slot)
    }

    fn drain(&mut self, slot: usize, turn: &mut Turn) {
        let Some(conn) = self.table.get(slot) else {
            return;
        };
        if let Drained::Closed(err) = drain(|buf| conn.stream.try_read(buf), &mut self.scratch) {
            if let Some(conn) = self.table.remove(slot) {
                let held = conn.since.elapsed();
                match err {
                    None => info!(peer = %conn.peer, port = conn.port, ?held, "peer disconnected"),
                    Some(err) => warn!(
                        peer = %conn.peer,
                        port = conn.port,
                        ?held,
                        error = %err,
                        "read failed, dropping connection"
                    ),
                }
                turn.closed += 1;
            }
        }
    }
}

/// Puts a fresh connection in non-blocking mode and writes the whole banner
/// in one call. Nothing else is ever written to it.
fn send_banner(stream: net::TcpStream, endpoint: &Endpoint) -> io::Result<TcpStream> {
    stream.set_nonblocking(true)?;
    let banner = endpoint.banner();
    let written = (&stream).write(banner)?;
    if written < banner.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short banner write ({written} of {} bytes)", banner.len()),
        ));
    }
    TcpStream::from_std(stream)
}

fn drain(mut read: impl FnMut(&mut [u8]) -> io::Result<usize>, scratch: &mut [u8]) -> Drained {
    let mut full_reads = 0;
    while full_reads < MAX_READS_PER_TURN {
        match read(scratch) {
            Ok(0) => return Drained::Closed(None),
            Ok(n) if n == scratch.len() => full_reads += 1,
            Ok(_) => return Drained::Open,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Drained::Open,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Drained::Closed(Some(err)),
        }
    }
    Drained::Open
}
