use std::{io, net::SocketAddr};

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Conditions that end the process. Per-connection failures never show up
/// here; they are logged and the connection is dropped.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{op}() failed for {addr}")]
    Socket {
        op: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("waiting for socket readiness failed")]
    Poll(#[source] io::Error),

    #[error("need {needed} file descriptors but the hard limit is {hard}")]
    DescriptorLimit { needed: u64, hard: u64 },

    #[error("unknown {kind} `{name}`")]
    UnknownIdentity { kind: &'static str, name: String },

    #[error("{step} failed")]
    System {
        step: &'static str,
        #[source]
        source: nix::Error,
    },
}

impl Error {
    pub(crate) fn socket(op: &'static str, addr: SocketAddr) -> impl FnOnce(io::Error) -> Self {
        move |source| Error::Socket { op, addr, source }
    }

    pub(crate) fn system(step: &'static str) -> impl FnOnce(nix::Error) -> Self {
        move |source| Error::System { step, source }
    }
}
