use std::{
    collections::HashSet,
    fmt,
    net::{IpAddr, Ipv6Addr},
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    sync::Arc,
};

use crate::error::{Error, Result};

pub const DEFAULT_MAX_CLIENTS: NonZeroUsize = NonZeroUsize::new(100).unwrap();

/// Longest identification line RFC 4253 allows, terminator included.
const MAX_SSH_IDENT_LEN: usize = 255;

const DEFAULT_ENDPOINTS: [(u16, &str); 3] = [
    (22, "SSH-2.0-OpenSSH_4.5p1 FreeBSD-20061110\n"),
    (222, "SSH-2.0-OpenSSH_5.4p1 Debian-5\n"),
    (2222, "SSH-2.0-OpenSSH_5.3\n"),
];

/// A configured port and the exact bytes sent to every peer accepted on it.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub port: u16,
    banner: Arc<[u8]>,
}

impl Endpoint {
    pub fn new(port: u16, banner: impl AsRef<[u8]>) -> Self {
        Self {
            port,
            banner: Arc::from(banner.as_ref()),
        }
    }

    pub fn banner(&self) -> &[u8] {
        &self.banner
    }

    /// Whether the banner would pass for an SSH identification line: `SSH-`
    /// prefix, at most 255 bytes and a trailing `\n`.
    pub fn looks_like_ssh(&self) -> bool {
        self.banner.starts_with(b"SSH-")
            && self.banner.len() <= MAX_SSH_IDENT_LEN
            && self.banner.ends_with(b"\n")
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("port", &self.port)
            .field("banner", &String::from_utf8_lossy(&self.banner))
            .finish()
    }
}

/// Parses `PORT=BANNER`. Escapes `\r`, `\n`, `\t` and `\\` are decoded, and a
/// banner without a line terminator gets `\r\n`.
impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (port, banner) = s
            .split_once('=')
            .ok_or_else(|| format!("expected PORT=BANNER, got `{s}`"))?;
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|e| format!("invalid port `{port}`: {e}"))?;
        let mut banner = unescape(banner)?;
        if banner.is_empty() {
            return Err(format!("banner for port {port} is empty"));
        }
        if !banner.ends_with(b"\n") {
            banner.extend_from_slice(b"\r\n");
        }
        Ok(Endpoint::new(port, banner))
    }
}

fn unescape(s: &str) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(s.len() + 2);
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('r') => out.push(b'\r'),
            Some('n') => out.push(b'\n'),
            Some('t') => out.push(b'\t'),
            Some('\\') => out.push(b'\\'),
            Some(other) => return Err(format!("unknown escape `\\{other}` in banner")),
            None => return Err("banner ends with a lone `\\`".to_string()),
        }
    }
    Ok(out)
}

/// Identity and filesystem view to assume once the listeners are bound.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Privileges {
    pub user: Option<String>,
    pub group: Option<String>,
    pub chroot: Option<PathBuf>,
}

impl Privileges {
    pub fn is_empty(&self) -> bool {
        self.user.is_none() && self.group.is_none() && self.chroot.is_none()
    }
}

/// Everything the daemon reads at startup. Never changes afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    pub endpoints: Vec<Endpoint>,
    pub bind_addrs: Vec<IpAddr>,
    pub max_clients: NonZeroUsize,
    pub privileges: Privileges,
    pub daemonize: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            bind_addrs: vec![IpAddr::V6(Ipv6Addr::UNSPECIFIED)],
            max_clients: DEFAULT_MAX_CLIENTS,
            privileges: Privileges::default(),
            daemonize: false,
        }
    }
}

pub fn default_endpoints() -> Vec<Endpoint> {
    DEFAULT_ENDPOINTS
        .iter()
        .map(|&(port, banner)| Endpoint::new(port, banner))
        .collect()
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(Error::Config("no listen endpoints configured".into()));
        }
        if self.bind_addrs.is_empty() {
            return Err(Error::Config("no bind addresses configured".into()));
        }
        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.banner().is_empty() {
                return Err(Error::Config(format!(
                    "banner for port {} is empty",
                    endpoint.port
                )));
            }
            // Port 0 asks the OS for an ephemeral port, so repeats are fine.
            if endpoint.port != 0 && !seen.insert(endpoint.port) {
                return Err(Error::Config(format!(
                    "port {} is configured more than once",
                    endpoint.port
                )));
            }
        }
        let mut addrs = HashSet::new();
        for addr in &self.bind_addrs {
            if !addrs.insert(addr) {
                return Err(Error::Config(format!(
                    "bind address {addr} is configured more than once"
                )));
            }
        }
        Ok(())
    }

    /// Number of concrete sockets the listener set will open.
    pub fn socket_count(&self) -> usize {
        self.endpoints.len() * self.bind_addrs.len()
    }
}
