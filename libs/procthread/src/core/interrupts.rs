// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Signal intake.
//!
//! The signal handlers only write the signal number into a socket pair. A
//! dedicated `procthread-interrupts` thread reads that pair, coalesces
//! whatever arrived into a [`Pending`] set and processes it in a fixed
//! order: drain the endpoint, then the begin handshake, then reaping. Since
//! one thread consumes everything, handling never re-enters itself.

use std::cell::Cell;
use std::io::Read;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Weak;
use std::thread::JoinHandle;

use signal_hook::SigId;

use super::envelope;
use super::process::{self, SIG_BEGIN, SIG_CHILD, SIG_DATA};
use super::router::{self, Dispatch};
use super::runtime::{Runtime, RuntimeInner};
use super::transport::Endpoint;

thread_local! {
    static IN_INTERRUPT: Cell<bool> = const { Cell::new(false) };
}

/// True on the thread that runs message and exit callbacks. Spawning is
/// refused there and joins do not block.
pub fn in_interrupt_context() -> bool {
    IN_INTERRUPT.with(Cell::get)
}

/// Signals received since the last wakeup. Repeats collapse.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pending {
    pub data: bool,
    pub begin: bool,
    pub child: bool,
}

impl Pending {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut pending = Self::default();
        for byte in bytes {
            match libc::c_int::from(*byte) {
                SIG_DATA => pending.data = true,
                SIG_BEGIN => pending.begin = true,
                SIG_CHILD => pending.child = true,
                other => tracing::trace!("Ignoring unexpected signal byte {}", other),
            }
        }
        pending
    }

    pub fn is_empty(&self) -> bool {
        !(self.data || self.begin || self.child)
    }
}

/// Everything needed to stop (or, in a forked child, disown) the interrupt
/// machinery of one process.
pub(crate) struct InterruptHandle {
    sig_ids: Vec<SigId>,
    writer: UnixStream,
    reader_fd: RawFd,
    endpoint_fd: RawFd,
    endpoint_path: PathBuf,
    thread: Option<JoinHandle<()>>,
}

impl InterruptHandle {
    pub fn endpoint_path(&self) -> &Path {
        &self.endpoint_path
    }

    /// Stop signal intake and let the interrupt thread exit. The thread
    /// drops the endpoint, which removes its socket file.
    pub fn shutdown(mut self) {
        for id in self.sig_ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
        // Closing the only writer hands the reader an EOF.
        drop(self.writer);
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                tracing::error!("Interrupt thread panicked");
            }
        }
    }

    /// Stop signal intake without waiting for the interrupt thread, for a
    /// process that is about to `_exit`.
    pub fn detach(mut self) {
        for id in self.sig_ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
        drop(self.writer);
        drop(self.thread.take());
    }

    /// In a freshly forked child: the interrupt thread does not exist here,
    /// but its descriptors and signal actions were inherited. Release them
    /// without touching the parent's socket file.
    pub fn abandon_after_fork(mut self) {
        // Actions go first so no handler writes to a descriptor being closed.
        for id in self.sig_ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
        // SAFETY: both descriptors are owned by objects on the parent's
        // interrupt-thread stack, which never runs (or drops) in this process.
        unsafe {
            libc::close(self.reader_fd);
            libc::close(self.endpoint_fd);
        }
        drop(self.writer);
        // Detaching a thread that was never started in this process is not
        // meaningful; just forget the handle.
        std::mem::forget(self.thread.take());
    }
}

/// Start the interrupt thread for `endpoint` and route the runtime's signals
/// to it.
pub(crate) fn install(
    inner: Weak<RuntimeInner>,
    endpoint: Endpoint,
) -> std::io::Result<InterruptHandle> {
    let (reader, writer) = UnixStream::pair()?;
    writer.set_nonblocking(true)?;

    let reader_fd = reader.as_raw_fd();
    let endpoint_fd = endpoint.as_raw_fd();
    let endpoint_path = endpoint.path().to_path_buf();
    let owner = endpoint.owner();

    let thread = std::thread::Builder::new()
        .name("procthread-interrupts".to_string())
        .spawn(move || run(reader, endpoint, inner))?;

    let writer_fd = writer.as_raw_fd();
    let mut sig_ids = Vec::with_capacity(3);
    for signal in [SIG_DATA, SIG_BEGIN, SIG_CHILD] {
        match register(signal, writer_fd) {
            Ok(id) => sig_ids.push(id),
            Err(e) => {
                for id in sig_ids {
                    signal_hook::low_level::unregister(id);
                }
                // Dropping the writer stops the thread we just started.
                return Err(e);
            }
        }
    }

    tracing::debug!("[{}] Signal handlers installed (SIGUSR1, SIGUSR2, SIGCHLD)", owner);
    Ok(InterruptHandle {
        sig_ids,
        writer,
        reader_fd,
        endpoint_fd,
        endpoint_path,
        thread: Some(thread),
    })
}

fn register(signal: libc::c_int, pipe_fd: RawFd) -> std::io::Result<SigId> {
    let byte = signal as u8;
    let action = move || {
        // A full pipe drops the byte; pending wakeups already cover it.
        // SAFETY: `byte` outlives the call and send(2) is async-signal-safe.
        unsafe {
            libc::send(
                pipe_fd,
                (&byte as *const u8).cast::<libc::c_void>(),
                1,
                libc::MSG_DONTWAIT,
            );
        }
    };
    // SAFETY: the action performs a single send(2) and nothing else.
    unsafe { signal_hook::low_level::register(signal, action) }
}

fn run(mut reader: UnixStream, endpoint: Endpoint, inner: Weak<RuntimeInner>) {
    IN_INTERRUPT.with(|flag| flag.set(true));
    tracing::debug!("Interrupt thread started for {}", endpoint.owner());

    let mut buf = [0u8; 64];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                tracing::debug!("Interrupt pipe closed, exiting thread");
                break;
            }
            Ok(n) => {
                let pending = Pending::from_bytes(&buf[..n]);
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                Runtime::from_inner(inner).handle_interrupts(&endpoint, pending);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!("Interrupt thread error: {}", e);
                break;
            }
        }
    }
}

impl Runtime {
    pub(crate) fn handle_interrupts(&self, endpoint: &Endpoint, pending: Pending) {
        if pending.is_empty() {
            return;
        }
        // Always drain first: a child's return value must be recorded before
        // its exit is processed.
        for frame in endpoint.drain(self.inner.config.read_stall) {
            match envelope::decode(&frame) {
                Ok(envelope) => {
                    let dispatch = {
                        let mut state = self.inner.state.lock();
                        router::route(&mut state, envelope)
                    };
                    self.run_dispatch(dispatch);
                }
                Err(e) => tracing::warn!("Discarding malformed frame: {}", e),
            }
        }

        if pending.begin {
            self.on_begin();
        }
        if pending.child {
            self.reap_children();
        }
    }

    /// `SIG_BEGIN` means liveness from a starting child, or authorization
    /// from our parent.
    fn on_begin(&self) {
        let mut state = self.inner.state.lock();
        if state.promote_starting(None).is_some() {
            return;
        }
        if !state.me.authorized {
            state.me.authorized = true;
            tracing::debug!("[{}] Authorized by parent", state.me.id);
        }
    }

    pub(crate) fn reap_children(&self) {
        while let Some((id, status)) = process::try_reap() {
            let reaped = self.inner.state.lock().reap(id, status);
            remove_stale_endpoint(&self.inner.config.socket_path(id));

            let Some(reaped) = reaped else {
                tracing::debug!("Reaped untracked process {} ({:?})", id, status);
                continue;
            };
            tracing::debug!("Thread {} exited ({:?})", id, status);
            if let Some(on_exit) = reaped.on_exit {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    on_exit(self, &reaped.info, reaped.return_value.as_ref())
                }));
                if outcome.is_err() {
                    tracing::error!("Exit callback for thread {} panicked", id);
                }
            }
        }
    }

    fn run_dispatch(&self, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Nothing => {}
            Dispatch::Deliver {
                handler,
                sender,
                message,
            } => {
                let outcome = catch_unwind(AssertUnwindSafe(|| handler(self, &sender, message)));
                if outcome.is_err() {
                    tracing::error!("Message handler panicked");
                }
            }
            Dispatch::Forward {
                name,
                value,
                targets,
            } => {
                if let Err(e) = self.forward_global(&name, value, targets) {
                    tracing::warn!("Failed to forward global '{}': {}", name, e);
                }
            }
        }
    }
}

fn remove_stale_endpoint(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!("Removed endpoint {} of exited thread", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Could not remove {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_bytes_coalesce() {
        let bytes = [SIG_DATA as u8, SIG_DATA as u8, SIG_CHILD as u8, SIG_DATA as u8];
        let pending = Pending::from_bytes(&bytes);
        assert_eq!(
            pending,
            Pending {
                data: true,
                begin: false,
                child: true
            }
        );
    }

    #[test]
    fn test_unknown_bytes_are_ignored() {
        let pending = Pending::from_bytes(&[1, 2, 3]);
        assert_eq!(pending, Pending::default());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_ordinary_threads_are_not_interrupt_context() {
        assert!(!in_interrupt_context());
        std::thread::spawn(|| assert!(!in_interrupt_context()))
            .join()
            .unwrap();
    }
}
