//! Privileged startup helpers: daemonization, the pidfile, rlimit
//! enforcement, and privilege dropping.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    process,
};

use fs2::FileExt;
use nix::{
    sys::resource::{Resource, getrlimit, setrlimit},
    sys::stat::Mode,
    unistd::{ForkResult, Gid, Group, Uid, User, chown, dup2, fork, setgid, setsid, setuid},
};

use crate::{config::ServerConfig, error::ResourceError};

/// Verifies `minfds`/`minprocs`, raising soft limits toward the hard limit
/// when possible. A hard limit below the requirement is fatal.
pub fn check_rlimits(config: &ServerConfig) -> Result<(), ResourceError> {
    enforce_limit(
        Resource::RLIMIT_NOFILE,
        config.minfds,
        |required, available| ResourceError::InsufficientFds {
            required,
            available,
        },
    )?;
    enforce_limit(
        Resource::RLIMIT_NPROC,
        config.minprocs,
        |required, available| ResourceError::InsufficientProcs {
            required,
            available,
        },
    )
}

fn enforce_limit(
    resource: Resource,
    required: u64,
    err: impl Fn(u64, u64) -> ResourceError,
) -> Result<(), ResourceError> {
    let (soft, hard) = match getrlimit(resource) {
        Ok(limits) => limits,
        // A platform without this limit cannot be below it.
        Err(_) => return Ok(()),
    };
    if soft >= required {
        return Ok(());
    }
    if hard < required {
        return Err(err(required, hard));
    }
    setrlimit(resource, required, hard).map_err(|_| err(required, hard))
}

/// Detaches from the terminal: double fork, new session, std streams onto
/// `/dev/null`. The caller's working directory and umask are handled by the
/// supervisor bootstrap.
pub fn daemonize() -> io::Result<()> {
    match unsafe { fork() }.map_err(io::Error::from)? {
        ForkResult::Parent { .. } => process::exit(0),
        ForkResult::Child => {}
    }
    setsid().map_err(io::Error::from)?;
    match unsafe { fork() }.map_err(io::Error::from)? {
        ForkResult::Parent { .. } => process::exit(0),
        ForkResult::Child => {}
    }

    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for target in 0..=2 {
        dup2(devnull.as_raw_fd(), target).map_err(io::Error::from)?;
    }
    Ok(())
}

/// Installs the configured umask.
pub fn apply_umask(bits: u32) {
    nix::sys::stat::umask(Mode::from_bits_truncate(bits));
}

/// An exclusively locked pidfile holding one decimal pid line.
#[derive(Debug)]
pub struct Pidfile {
    path: PathBuf,
    // The lock lives exactly as long as this handle.
    _file: File,
}

impl Pidfile {
    /// Creates (or takes over) the pidfile, locks it exclusively, and writes
    /// the current pid. Fails if another live supervisor holds the lock.
    pub fn acquire(path: &Path) -> Result<Self, ResourceError> {
        let resource = |source: io::Error| ResourceError::Pidfile {
            path: path.display().to_string(),
            source,
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(resource)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(resource)?;
        file.try_lock_exclusive().map_err(resource)?;
        file.set_len(0).map_err(resource)?;
        writeln!(file, "{}", process::id()).map_err(resource)?;
        file.flush().map_err(resource)?;

        Ok(Pidfile {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    /// Removes the pidfile from disk and releases the lock.
    pub fn remove(self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Parses a `user` or `user.group` ownership spec into ids.
pub fn resolve_account_spec(spec: &str) -> Result<(Uid, Gid), ResourceError> {
    let (user_name, group_name) = match spec.split_once('.') {
        Some((user, group)) => (user, Some(group)),
        None => (spec, None),
    };

    let user = User::from_name(user_name)
        .ok()
        .flatten()
        .ok_or_else(|| ResourceError::UnknownAccount(user_name.to_string()))?;

    let gid = match group_name {
        Some(name) => {
            Group::from_name(name)
                .ok()
                .flatten()
                .ok_or_else(|| ResourceError::UnknownAccount(name.to_string()))?
                .gid
        }
        None => user.gid,
    };

    Ok((user.uid, gid))
}

/// Applies `sockchown`/`sockchmod` to a freshly bound UNIX socket.
pub fn apply_socket_access(
    path: &Path,
    mode: u32,
    owner: Option<&str>,
) -> Result<(), ResourceError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|source| {
        ResourceError::Bind {
            address: path.display().to_string(),
            source,
        }
    })?;

    if let Some(spec) = owner {
        let (uid, gid) = resolve_account_spec(spec)?;
        chown(path, Some(uid), Some(gid)).map_err(|errno| ResourceError::Bind {
            address: path.display().to_string(),
            source: io::Error::from(errno),
        })?;
    }
    Ok(())
}

/// Drops to the configured account: primary group first, then the uid. Only
/// meaningful (and only attempted) when running as root.
pub fn drop_privileges(user_name: &str) -> Result<(), ResourceError> {
    let user = User::from_name(user_name)
        .ok()
        .flatten()
        .ok_or_else(|| ResourceError::UnknownAccount(user_name.to_string()))?;

    setgid(user.gid).map_err(|errno| ResourceError::PrivilegeDrop {
        user: user_name.to_string(),
        errno,
    })?;
    setuid(user.uid).map_err(|errno| ResourceError::PrivilegeDrop {
        user: user_name.to_string(),
        errno,
    })?;
    Ok(())
}
