//! systemd socket activation.
//!
//! The supervisor passes `LISTEN_FDS` descriptors starting at
//! [`SD_LISTEN_FDS_START`] and names the intended process in `LISTEN_PID`.
//! See `sd_listen_fds(3)`.

use std::env::{self, VarError};
use std::io;
use std::ops::Range;
use std::os::fd::{FromRawFd as _, RawFd};
use std::os::unix::net::UnixListener as StdUnixListener;

use tokio::net::UnixListener;
use tracing::debug;

use crate::error::ListenError;
use crate::listen::Endpoint;

const LISTEN_PID: &str = "LISTEN_PID";
const LISTEN_FDS: &str = "LISTEN_FDS";

/// First descriptor passed by systemd.
pub const SD_LISTEN_FDS_START: RawFd = 3;

/// Descriptor range described by the activation variables.
pub fn parse_activation(
    pid: Option<&str>,
    fds: Option<&str>,
    own_pid: u32,
) -> Result<Range<RawFd>, ListenError> {
    let pid = pid.ok_or(ListenError::MissingVar(LISTEN_PID))?;
    let fds = fds.ok_or(ListenError::MissingVar(LISTEN_FDS))?;

    let expected: u32 = pid.trim().parse().map_err(|_| ListenError::InvalidVar {
        name: LISTEN_PID,
        value: pid.to_string(),
    })?;
    if expected != own_pid {
        return Err(ListenError::PidMismatch {
            expected,
            actual: own_pid,
        });
    }

    let invalid_fds = || ListenError::InvalidVar {
        name: LISTEN_FDS,
        value: fds.to_string(),
    };
    let count: RawFd = fds
        .trim()
        .parse()
        .ok()
        .filter(|n| *n >= 0)
        .ok_or_else(invalid_fds)?;
    if count == 0 {
        return Err(ListenError::NoDescriptors);
    }
    let end = SD_LISTEN_FDS_START.checked_add(count).ok_or_else(invalid_fds)?;

    Ok(SD_LISTEN_FDS_START..end)
}

fn var(name: &'static str) -> Result<Option<String>, ListenError> {
    match env::var(name) {
        Ok(value) => Ok(Some(value)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(value)) => Err(ListenError::InvalidVar {
            name,
            value: value.to_string_lossy().into_owned(),
        }),
    }
}

/// Take over the listening sockets passed by the supervisor.
///
/// Must run inside a tokio runtime.  Descriptors are claimed by marking
/// them close-on-exec; ones already marked are skipped.
pub fn listen_fds() -> Result<Vec<Endpoint>, ListenError> {
    let fds = parse_activation(
        var(LISTEN_PID)?.as_deref(),
        var(LISTEN_FDS)?.as_deref(),
        std::process::id(),
    )?;
    debug!(first = fds.start, count = fds.len(), "socket activation");

    let mut endpoints = Vec::new();
    for fd in fds {
        let io_err = |source| ListenError::Io {
            endpoint: format!("fd {fd}"),
            source,
        };
        ensure_socket(fd).map_err(io_err)?;
        if !claim(fd).map_err(io_err)? {
            debug!(fd, "descriptor already close-on-exec, skipping");
            continue;
        }

        // SAFETY: the supervisor handed this descriptor to us and nothing
        // else in the process has claimed it.
        let listener = unsafe { StdUnixListener::from_raw_fd(fd) };
        listener.set_nonblocking(true).map_err(io_err)?;
        let listener = UnixListener::from_std(listener).map_err(io_err)?;
        endpoints.push(Endpoint::inherited(listener, fd));
    }

    if endpoints.is_empty() {
        return Err(ListenError::NoDescriptors);
    }
    Ok(endpoints)
}

fn ensure_socket(fd: RawFd) -> io::Result<()> {
    // SAFETY: fstat only writes into the zeroed buffer we provide.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if stat.st_mode & libc::S_IFMT != libc::S_IFSOCK {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "inherited descriptor is not a socket",
        ));
    }
    Ok(())
}

/// Mark `fd` close-on-exec so helper processes we spawn do not inherit it.
///
/// A descriptor that already carries the flag has been taken by someone
/// else in this process; `Ok(false)` is returned and it is left alone.
fn claim(fd: RawFd) -> io::Result<bool> {
    // SAFETY: F_GETFD / F_SETFD only touch the descriptor flags.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::FD_CLOEXEC != 0 {
        return Ok(false);
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(true)
}
