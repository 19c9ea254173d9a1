//! The listener set: every configured endpoint bound on every bind address.
//!
//! Binding happens in two steps. [`bind`] opens plain sockets so it can run
//! before privileges are dropped and before any runtime exists, and
//! [`BoundListeners::register`] hands them to the reactor from inside the
//! runtime. Each socket keeps the [`Endpoint`] it was bound for, so the banner
//! follows the configured port whichever address family took the connection.

use std::{
    io,
    net::{self, IpAddr, SocketAddr},
    task::{Context, Poll},
    time::{Duration, Instant},
};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{Interest, unix::AsyncFd};
use tracing::debug;

use crate::{
    config::{Config, Endpoint},
    error::{Error, Result},
    poll::Watch,
};

const LISTEN_BACKLOG: i32 = 20;

#[derive(Debug)]
struct BoundListener {
    socket: net::TcpListener,
    addr: SocketAddr,
    endpoint: Endpoint,
}

/// Bound and listening sockets not yet registered with a reactor.
#[derive(Debug)]
pub struct BoundListeners {
    listeners: Vec<BoundListener>,
}

/// Binds one socket per endpoint and bind address.
///
/// An IPv6 wildcard address on its own becomes a dual-stack socket. As soon as
/// any IPv4 address is configured too, IPv6 sockets are made v6-only so both
/// can hold the same port.
pub fn bind(config: &Config) -> Result<BoundListeners> {
    let v6_only = config.bind_addrs.iter().any(IpAddr::is_ipv4);
    let mut listeners = Vec::with_capacity(config.socket_count());
    for endpoint in &config.endpoints {
        for &ip in &config.bind_addrs {
            let requested = SocketAddr::new(ip, endpoint.port);
            let socket = bind_one(requested, v6_only)?;
            let addr = socket
                .local_addr()
                .map_err(Error::socket("getsockname", requested))?;
            debug!(%addr, port = endpoint.port, "bound listener");
            listeners.push(BoundListener {
                socket,
                addr,
                endpoint: endpoint.clone(),
            });
        }
    }
    Ok(BoundListeners { listeners })
}

fn bind_one(addr: SocketAddr, v6_only: bool) -> Result<net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(Error::socket("socket", addr))?;
    if addr.is_ipv6() {
        socket
            .set_only_v6(v6_only)
            .map_err(Error::socket("setsockopt(IPV6_V6ONLY)", addr))?;
    }
    socket
        .set_reuse_address(true)
        .map_err(Error::socket("setsockopt(SO_REUSEADDR)", addr))?;
    socket
        .set_nonblocking(true)
        .map_err(Error::socket("fcntl(O_NONBLOCK)", addr))?;
    socket
        .bind(&addr.into())
        .map_err(Error::socket("bind", addr))?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(Error::socket("listen", addr))?;
    Ok(socket.into())
}

impl BoundListeners {
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|l| l.addr).collect()
    }

    /// Registers every socket with the current tokio reactor.
    pub fn register(self) -> Result<ListenerSet> {
        let listeners = self
            .listeners
            .into_iter()
            .map(|bound| {
                let fd = AsyncFd::with_interest(bound.socket, Interest::READABLE)
                    .map_err(Error::socket("register", bound.addr))?;
                Ok(Listener {
                    fd,
                    addr: bound.addr,
                    endpoint: bound.endpoint,
                    resume_at: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ListenerSet { listeners })
    }
}

#[derive(Debug)]
pub struct Listener {
    fd: AsyncFd<net::TcpListener>,
    addr: SocketAddr,
    endpoint: Endpoint,
    resume_at: Option<Instant>,
}

impl Listener {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Accepts one pending connection. `Ok(None)` means the readiness that got
    /// us here was stale and has now been cleared.
    pub async fn accept(&self) -> io::Result<Option<(net::TcpStream, SocketAddr)>> {
        let mut guard = self.fd.readable().await?;
        match guard.try_io(|fd| fd.get_ref().accept()) {
            Ok(accepted) => accepted.map(Some),
            Err(_would_block) => Ok(None),
        }
    }

    /// Leaves the listener out of the watch set for `backoff`. A failed
    /// accept keeps the connection queued, so watching straight away would
    /// report the same readiness again.
    pub fn pause(&mut self, backoff: Duration) {
        self.resume_at = Some(Instant::now() + backoff);
    }

    pub fn is_paused(&self) -> bool {
        self.paused_until().is_some()
    }

    fn paused_until(&self) -> Option<Instant> {
        self.resume_at.filter(|&at| at > Instant::now())
    }
}

impl Watch for Listener {
    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.is_paused() {
            return Poll::Pending;
        }
        // Dropping the guard without clearing it leaves the readiness in place
        // for the accept that follows.
        self.fd.poll_read_ready(cx).map_ok(drop)
    }
}

#[derive(Debug)]
pub struct ListenerSet {
    listeners: Vec<Listener>,
}

impl ListenerSet {
    pub fn as_slice(&self) -> &[Listener] {
        &self.listeners
    }

    pub fn get(&self, index: usize) -> Option<&Listener> {
        self.listeners.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Listener> {
        self.listeners.get_mut(index)
    }

    /// Earliest moment a paused listener rejoins the watch set.
    pub fn next_resume(&self) -> Option<Instant> {
        self.listeners.iter().filter_map(Listener::paused_until).min()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(Listener::local_addr).collect()
    }
}
