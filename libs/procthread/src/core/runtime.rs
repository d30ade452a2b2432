// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The per-process runtime handle.
//!
//! Exactly one runtime exists per OS process. The main process creates it
//! with [`Runtime::init`]; a spawned thread gets a copy rebuilt for its own
//! identity right after the fork. [`Runtime`] is a cheap clone of a shared
//! handle, so callbacks and worker threads can all hold one.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::config::{RuntimeConfig, ensure_socket_dir};
use super::envelope::{self, Envelope, EnvelopeKind};
use super::error::{Result, RuntimeError, SpawnError, TransportError};
use super::identity::{ExecutionContext, Relation, Sender, ThreadInfo};
use super::interrupts::{self, InterruptHandle, in_interrupt_context};
use super::poll::{Timeout, poll_until};
use super::process::{self, ThreadId};
use super::registry::{Mail, ProcessState, SelfRecord};
use super::spawn::EntryFn;
use super::transport::{Endpoint, Transport};
use super::value::Value;

static ACTIVE: AtomicBool = AtomicBool::new(false);

pub(crate) struct RuntimeInner {
    pub(crate) config: RuntimeConfig,
    pub(crate) state: Mutex<ProcessState>,
    /// Locked before `state` whenever both are needed.
    pub(crate) interrupts: Mutex<Option<InterruptHandle>>,
    pub(crate) entries: Mutex<HashMap<String, EntryFn>>,
    /// Serializes spawns: one child in flight per process.
    pub(crate) spawn_lock: Mutex<()>,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        if let Some(handle) = self.interrupts.get_mut().take() {
            handle.shutdown();
            ACTIVE.store(false, Ordering::SeqCst);
        }
    }
}

/// Handle to this process's runtime.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Runtime")
            .field("thread_id", &state.me.id)
            .field("parent_id", &state.me.parent_id)
            .field("children", &state.child_count())
            .finish()
    }
}

impl Runtime {
    /// Initialize the runtime in the main process.
    ///
    /// Binds this process's endpoint, installs the signal handlers and starts
    /// the interrupt thread. Fails if a runtime is already active here.
    pub fn init(config: RuntimeConfig) -> Result<Self> {
        config.validate().map_err(RuntimeError::Configuration)?;
        if ACTIVE.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::AlreadyInitialized);
        }

        match Self::start_main(config) {
            Ok(runtime) => Ok(runtime),
            Err(e) => {
                ACTIVE.store(false, Ordering::SeqCst);
                tracing::error!("Failed to initialize procthread runtime: {}", e);
                Err(e)
            }
        }
    }

    /// [`Runtime::init`] with [`RuntimeConfig::default`].
    pub fn init_default() -> Result<Self> {
        Self::init(RuntimeConfig::default())
    }

    fn start_main(config: RuntimeConfig) -> Result<Self> {
        ensure_socket_dir(&config.socket_dir)?;
        let me = ThreadId::current();
        let endpoint = Endpoint::bind(&config.socket_dir, me)?;

        let state = ProcessState::new(
            SelfRecord::main(me),
            HashMap::new(),
            Transport::new(&config, me),
            config.exited_capacity,
        );
        let inner = Arc::new(RuntimeInner {
            config,
            state: Mutex::new(state),
            interrupts: Mutex::new(None),
            entries: Mutex::new(HashMap::new()),
            spawn_lock: Mutex::new(()),
        });

        let handle = interrupts::install(Arc::downgrade(&inner), endpoint)?;
        *inner.interrupts.lock() = Some(handle);

        tracing::info!(
            "procthread runtime initialized for main process {} (sockets in {})",
            me,
            inner.config.socket_dir.display()
        );
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<RuntimeInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// False once [`Runtime::shutdown`] has run.
    pub fn is_active(&self) -> bool {
        self.inner.interrupts.lock().is_some()
    }

    pub fn thread_id(&self) -> ThreadId {
        self.inner.state.lock().me.id
    }

    /// `None` in the main process.
    pub fn parent_id(&self) -> Option<ThreadId> {
        self.inner.state.lock().me.parent_id
    }

    pub fn main_id(&self) -> ThreadId {
        self.inner.state.lock().me.main_id
    }

    pub fn is_main_process(&self) -> bool {
        self.inner.state.lock().is_main()
    }

    pub fn context(&self) -> ExecutionContext {
        if self.is_main_process() {
            ExecutionContext::Main
        } else {
            ExecutionContext::Thread
        }
    }

    pub fn relation(&self, id: ThreadId) -> Relation {
        self.inner.state.lock().relation(id)
    }

    /// Snapshot of the calling process's own record.
    pub fn this_thread(&self) -> ThreadInfo {
        self.inner.state.lock().self_info()
    }

    /// Starting and live children.
    pub fn child_count(&self) -> usize {
        self.inner.state.lock().child_count()
    }

    pub fn children(&self) -> Vec<ThreadInfo> {
        self.inner.state.lock().children()
    }

    /// The payload this thread was spawned with.
    pub fn payload(&self) -> Option<Value> {
        self.inner.state.lock().me.payload.clone()
    }

    /// Error of the most recent failed spawn, cleared by a successful one.
    pub fn last_error(&self) -> Option<SpawnError> {
        self.inner.state.lock().last_error
    }

    /// Exits whose records were discarded because too many children were
    /// waiting to be joined.
    pub fn overflow_count(&self) -> u64 {
        self.inner.state.lock().exited.dropped()
    }

    /// Install the default handler for inbound messages. Replaces any
    /// previous handler; queued messages stay queued.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&Runtime, &Sender, Value) + Send + Sync + 'static,
    {
        self.inner.state.lock().me.on_message = Some(Arc::new(handler));
    }

    /// Remove the default message handler; later messages queue again.
    pub fn clear_on_message(&self) {
        self.inner.state.lock().me.on_message = None;
    }

    pub fn send_message(&self, target: ThreadId, message: impl Into<Value>) -> Result<()> {
        self.send_envelope(target, EnvelopeKind::Message, message.into())
    }

    pub fn send_to_parent(&self, message: impl Into<Value>) -> Result<()> {
        let parent = self.parent_id().ok_or(TransportError::NoParent)?;
        self.send_message(parent, message)
    }

    pub fn send_to_main(&self, message: impl Into<Value>) -> Result<()> {
        let main = self.main_id();
        self.send_message(main, message)
    }

    pub(crate) fn send_envelope(&self, target: ThreadId, kind: EnvelopeKind, value: Value) -> Result<()> {
        let (transport, me, parent) = {
            let state = self.inner.state.lock();
            (state.transport.clone(), state.me.id, state.me.parent_id)
        };
        let frame = envelope::encode(
            &Envelope::new(kind, value, me, parent),
            self.inner.config.compression_threshold,
        )?;
        transport.send(target, &frame)?;
        Ok(())
    }

    /// Take the oldest queued message, waiting up to `timeout` for one.
    ///
    /// Inside a callback the wait is skipped: new messages cannot arrive
    /// while the interrupt thread is busy running it.
    pub fn get_message(&self, timeout: Timeout) -> Option<Mail> {
        let timeout = if in_interrupt_context() {
            Timeout::NoWait
        } else {
            timeout
        };
        poll_until(timeout, self.inner.config.poll_interval, || {
            match self.inner.state.lock().mailbox.pop_front() {
                Some(mail) => ControlFlow::Break(mail),
                None => ControlFlow::Continue(()),
            }
        })
    }

    /// Messages waiting in the mailbox.
    pub fn pending_messages(&self) -> usize {
        self.inner.state.lock().mailbox.len()
    }

    /// Forcefully terminate a child. Only tracked children can be killed.
    pub fn kill(&self, id: ThreadId) -> bool {
        if !self.inner.state.lock().is_tracked_child(id) {
            tracing::warn!("Refusing to kill {}: not a child of this process", id);
            return false;
        }
        process::send_signal(id, libc::SIGKILL)
    }

    /// End the calling thread with `value` as its return value.
    ///
    /// In a spawned thread this does not return. In the main process it logs
    /// and does nothing.
    pub fn exit(&self, value: impl Into<Value>) {
        if self.is_main_process() {
            tracing::warn!("exit() called in the main process; ignoring");
            return;
        }
        self.finish_thread(value.into())
    }

    /// Tear down the runtime. The main process kills and reaps its
    /// remaining children first. Idempotent.
    pub fn shutdown(&self) {
        let Some(handle) = self.inner.interrupts.lock().take() else {
            return;
        };

        let (me, is_main, children) = {
            let state = self.inner.state.lock();
            (state.me.id, state.is_main(), state.child_ids())
        };
        if is_main && !children.is_empty() {
            tracing::info!("Killing {} remaining thread(s)", children.len());
            for id in &children {
                process::send_signal(*id, libc::SIGKILL);
            }
        }

        handle.shutdown();

        if is_main && !children.is_empty() {
            let reaped = poll_until(
                Timeout::After(self.inner.config.handshake_timeout),
                self.inner.config.poll_interval,
                || {
                    self.reap_children();
                    if self.child_count() == 0 {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                },
            );
            if reaped.is_none() {
                tracing::warn!("{} thread(s) not reaped during shutdown", self.child_count());
            }
        }

        ACTIVE.store(false, Ordering::SeqCst);
        tracing::info!("procthread runtime for {} shut down", me);
    }

    /// Send our return value, release the endpoint and terminate.
    pub(crate) fn finish_thread(&self, value: Value) -> ! {
        let parent = self.parent_id();
        if let Some(parent) = parent {
            if let Err(e) = self.send_envelope(parent, EnvelopeKind::Return, value) {
                tracing::warn!("Return value not delivered to {}: {}", parent, e);
            }
        }
        self.teardown_thread();
        process::exit_now(0)
    }

    /// Stop signal intake in a spawned thread ahead of `_exit`. The
    /// interrupt thread is not joined; it may be mid-callback and dies with
    /// the process.
    pub(crate) fn teardown_thread(&self) {
        let handle = self.inner.interrupts.lock().take();
        if let Some(handle) = handle {
            let path = handle.endpoint_path().to_path_buf();
            handle.detach();
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!("Endpoint {} already gone: {}", path.display(), e);
            }
        }
    }
}
