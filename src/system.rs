//! One-shot process setup performed before the loop starts: descriptor budget,
//! privilege drop and daemonization.

use nix::{
    libc::rlim_t,
    sys::resource::{Resource, getrlimit, setrlimit},
    unistd::{ForkResult, Gid, Group, Pid, Uid, User, chdir, chroot, fork, setgid, setsid, setuid},
};
use tracing::info;

use crate::{
    config::Privileges,
    error::{Error, Result},
};

/// Descriptors kept free for stdio, the reactor and the logger.
const RESERVED_FDS: usize = 16;

/// Makes sure the open-file limit covers every socket the daemon may hold at
/// once: all listeners, a full table, and the connection being admitted.
/// Raises the soft limit toward the hard limit when needed.
pub fn ensure_descriptor_budget(listeners: usize, max_clients: usize) -> Result<()> {
    let needed = (listeners + max_clients + 1 + RESERVED_FDS) as rlim_t;
    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE).map_err(Error::system("getrlimit"))?;
    if needed <= soft {
        return Ok(());
    }
    if needed > hard {
        return Err(Error::DescriptorLimit {
            needed: needed as u64,
            hard: hard as u64,
        });
    }
    setrlimit(Resource::RLIMIT_NOFILE, needed, hard).map_err(Error::system("setrlimit"))?;
    info!(from = soft as u64, to = needed as u64, "raised open file limit");
    Ok(())
}

/// Resolves names before confining the filesystem view, then switches root
/// directory, group and user in that order.
pub fn drop_privileges(privileges: &Privileges) -> Result<()> {
    let user = privileges.user.as_deref().map(resolve_user).transpose()?;
    let gid = match privileges.group.as_deref() {
        Some(group) => Some(resolve_group(group)?),
        None => user.as_ref().map(|&(_, gid)| gid),
    };

    if let Some(root) = &privileges.chroot {
        chroot(root.as_path()).map_err(Error::system("chroot"))?;
        chdir("/").map_err(Error::system("chdir"))?;
        info!(root = %root.display(), "changed root directory");
    }
    if let Some(gid) = gid {
        if Uid::effective().is_root() {
            #[cfg(not(target_os = "macos"))]
            nix::unistd::setgroups(&[gid]).map_err(Error::system("setgroups"))?;
        }
        setgid(gid).map_err(Error::system("setgid"))?;
        info!(gid = gid.as_raw(), "dropped group privileges");
    }
    if let Some((uid, _)) = user {
        setuid(uid).map_err(Error::system("setuid"))?;
        if Uid::effective() != uid {
            return Err(Error::System {
                step: "setuid",
                source: nix::Error::EPERM,
            });
        }
        info!(uid = uid.as_raw(), "dropped user privileges");
    }
    Ok(())
}

/// Accepts a user name or a numeric uid. A uid without a passwd entry uses
/// the same number as its gid.
fn resolve_user(name: &str) -> Result<(Uid, Gid)> {
    if let Ok(raw) = name.parse::<u32>() {
        let uid = Uid::from_raw(raw);
        let gid = User::from_uid(uid)
            .map_err(Error::system("getpwuid"))?
            .map_or(Gid::from_raw(raw), |user| user.gid);
        return Ok((uid, gid));
    }
    let user = User::from_name(name)
        .map_err(Error::system("getpwnam"))?
        .ok_or_else(|| Error::UnknownIdentity {
            kind: "user",
            name: name.to_string(),
        })?;
    Ok((user.uid, user.gid))
}

fn resolve_group(name: &str) -> Result<Gid> {
    if let Ok(raw) = name.parse::<u32>() {
        return Ok(Gid::from_raw(raw));
    }
    let group = Group::from_name(name)
        .map_err(Error::system("getgrnam"))?
        .ok_or_else(|| Error::UnknownIdentity {
            kind: "group",
            name: name.to_string(),
        })?;
    Ok(group.gid)
}

pub enum Forked {
    Parent(Pid),
    Child,
}

/// Forks into the background. The child starts a new session.
///
/// Must run before any thread (including the async runtime) exists.
pub fn daemonize() -> Result<Forked> {
    // SAFETY: the process is still single-threaded at this point.
    match unsafe { fork() }.map_err(Error::system("fork"))? {
        ForkResult::Parent { child } => Ok(Forked::Parent(child)),
        ForkResult::Child => {
            setsid().map_err(Error::system("setsid"))?;
            Ok(Forked::Child)
        }
    }
}
