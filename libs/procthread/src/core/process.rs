// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Thin wrappers over the libc process primitives the runtime relies on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;

/// Signal telling a process that a connection is waiting on its endpoint.
pub const SIG_DATA: libc::c_int = libc::SIGUSR1;
/// Signal used for the liveness/authorization handshake.
pub const SIG_BEGIN: libc::c_int = libc::SIGUSR2;
/// Child termination.
pub const SIG_CHILD: libc::c_int = libc::SIGCHLD;

/// OS process id of a thread. Doubles as its transport address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(i32);

impl ThreadId {
    /// Wrap a raw pid. Non-positive values are not valid thread ids.
    pub fn new(pid: i32) -> Option<Self> {
        (pid > 0).then_some(Self(pid))
    }

    pub fn get(self) -> i32 {
        self.0
    }

    /// Id of the calling process.
    pub fn current() -> Self {
        // SAFETY: getpid has no preconditions and cannot fail.
        Self(unsafe { libc::getpid() })
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How a reaped child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

impl ExitStatus {
    fn from_wait_status(status: libc::c_int) -> Self {
        if libc::WIFSIGNALED(status) {
            Self::Signaled(libc::WTERMSIG(status))
        } else {
            Self::Exited(libc::WEXITSTATUS(status))
        }
    }

    pub fn success(self) -> bool {
        self == Self::Exited(0)
    }
}

/// Outcome of `fork()` from the caller's point of view.
pub(crate) enum Fork {
    Parent(ThreadId),
    Child,
}

pub(crate) fn fork() -> std::io::Result<Fork> {
    // SAFETY: the caller holds the registry lock across the fork so the child
    // inherits a consistent snapshot; the child only touches state it owns.
    match unsafe { libc::fork() } {
        -1 => Err(std::io::Error::last_os_error()),
        0 => Ok(Fork::Child),
        pid => Ok(Fork::Parent(ThreadId(pid))),
    }
}

/// Deliver `signal` to `target`. Returns false if the process is gone.
pub(crate) fn send_signal(target: ThreadId, signal: libc::c_int) -> bool {
    // SAFETY: kill only inspects its integer arguments.
    unsafe { libc::kill(target.0, signal) == 0 }
}

/// Check if a process is alive using kill(pid, 0).
pub(crate) fn is_process_alive(target: ThreadId) -> bool {
    send_signal(target, 0)
}

/// Reap one terminated child without blocking.
pub(crate) fn try_reap() -> Option<(ThreadId, ExitStatus)> {
    let mut status: libc::c_int = 0;
    // SAFETY: status points to a valid c_int for the duration of the call.
    let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
    if pid > 0 {
        Some((ThreadId(pid), ExitStatus::from_wait_status(status)))
    } else {
        None
    }
}

/// Exit status of a child whose endpoint could not be bound (sysexits
/// `EX_OSERR`). The parent reports it as [`SpawnError::SocketFailed`].
///
/// [`SpawnError::SocketFailed`]: super::error::SpawnError::SocketFailed
pub(crate) const EXIT_SOCKET_FAILED: i32 = 71;

/// Terminate the calling process immediately, skipping atexit handlers that
/// belong to the process we were forked from.
pub(crate) fn exit_now(code: i32) -> ! {
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    // SAFETY: _exit never returns and has no preconditions.
    unsafe { libc::_exit(code) }
}

/// Print a diagnostic and terminate. Used for setup failures the process
/// cannot recover from (no endpoint means no IPC).
pub fn fatal(message: &str) -> ! {
    let message = message.trim();
    tracing::error!("procthread - FATAL ERROR: {}", message);
    let _ = writeln!(
        std::io::stderr(),
        "\nprocthread - FATAL ERROR: {}\n",
        message
    );
    exit_now(-1)
}
