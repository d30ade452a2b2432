// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Spawning threads.
//!
//! A spawn forks the calling process and runs a two-way handshake:
//!
//! ```text
//! parent                                child
//!   fork ------------------------------>  rebuild runtime for new pid
//!   (child in starting slot)              bind endpoint, install handlers
//!        <------------------- SIG_BEGIN   "I am alive"
//!   promote to live
//!   SIG_BEGIN ------------------------->  authorized
//!                                         run entry point
//!        <--------------- Return envelope
//!   SIGCHLD: move to exited               _exit(0)
//! ```
//!
//! Each half waits at most `handshake_timeout`. Lifecycle failures retry
//! the whole sequence up to `spawn_attempts` times.

use std::collections::HashMap;
use std::fmt;
use std::ops::ControlFlow;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use super::error::SpawnError;
use super::identity::{Sender, ThreadInfo};
use super::interrupts::{self, in_interrupt_context};
use super::poll::{Timeout, poll_until};
use super::process::{self, EXIT_SOCKET_FAILED, ExitStatus, Fork, SIG_BEGIN, ThreadId};
use super::registry::{ExitCallback, MessageCallback, ProcessState, SelfRecord, ThreadRecord};
use super::runtime::Runtime;
use super::transport::{Endpoint, Transport};
use super::value::Value;

/// A resolved entry point.
pub type EntryFn = Arc<dyn Fn(&Runtime, Vec<Value>) -> Value + Send + Sync>;

/// What a spawned thread runs.
#[derive(Clone)]
pub enum EntryPoint {
    Function(EntryFn),
    /// Looked up in the runtime's registry at spawn time.
    Named(String),
}

impl EntryPoint {
    pub fn new<F, R>(f: F) -> Self
    where
        F: Fn(&Runtime, Vec<Value>) -> R + Send + Sync + 'static,
        R: Into<Value>,
    {
        EntryPoint::Function(Arc::new(move |runtime: &Runtime, args: Vec<Value>| {
            f(runtime, args).into()
        }))
    }

    pub fn named(name: impl Into<String>) -> Self {
        EntryPoint::Named(name.into())
    }
}

impl fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryPoint::Function(_) => f.write_str("EntryPoint::Function"),
            EntryPoint::Named(name) => write!(f, "EntryPoint::Named({:?})", name),
        }
    }
}

/// Callbacks attached to a spawned thread.
#[derive(Clone, Default)]
pub struct ThreadAttributes {
    /// Runs on the parent after the child is reaped.
    pub(crate) on_exit: Option<ExitCallback>,
    /// Runs on the parent for messages from this child.
    pub(crate) on_thread_message: Option<MessageCallback>,
    /// Becomes the child's own default message handler.
    pub(crate) on_message: Option<MessageCallback>,
}

impl ThreadAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_exit<F>(mut self, f: F) -> Self
    where
        F: Fn(&Runtime, &ThreadInfo, Option<&Value>) + Send + Sync + 'static,
    {
        self.on_exit = Some(Arc::new(f));
        self
    }

    pub fn on_thread_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&Runtime, &Sender, Value) + Send + Sync + 'static,
    {
        self.on_thread_message = Some(Arc::new(f));
        self
    }

    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&Runtime, &Sender, Value) + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(f));
        self
    }
}

/// Spawn configuration.
///
/// ```ignore
/// let id = ThreadBuilder::new(EntryPoint::named("worker"))
///     .arg(7)
///     .payload("batch-12")
///     .on_exit(|_, info, value| tracing::info!("{} returned {:?}", info.id, value))
///     .spawn(&runtime)?;
/// ```
#[derive(Clone)]
pub struct ThreadBuilder {
    entry: EntryPoint,
    attributes: ThreadAttributes,
    args: Vec<Value>,
    payload: Option<Value>,
}

impl ThreadBuilder {
    pub fn new(entry: EntryPoint) -> Self {
        Self {
            entry,
            attributes: ThreadAttributes::default(),
            args: Vec::new(),
            payload: None,
        }
    }

    pub fn attributes(mut self, attributes: ThreadAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn on_exit<F>(mut self, f: F) -> Self
    where
        F: Fn(&Runtime, &ThreadInfo, Option<&Value>) + Send + Sync + 'static,
    {
        self.attributes = self.attributes.on_exit(f);
        self
    }

    pub fn on_thread_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&Runtime, &Sender, Value) + Send + Sync + 'static,
    {
        self.attributes = self.attributes.on_thread_message(f);
        self
    }

    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&Runtime, &Sender, Value) + Send + Sync + 'static,
    {
        self.attributes = self.attributes.on_message(f);
        self
    }

    pub fn arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, V>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Value readable in the child through [`Runtime::payload`].
    pub fn payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn spawn(self, runtime: &Runtime) -> Result<ThreadId, SpawnError> {
        runtime.create(self)
    }
}

impl Runtime {
    /// Make `f` spawnable as [`EntryPoint::named`]`(name)`.
    pub fn register_entry<F, R>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&Runtime, Vec<Value>) -> R + Send + Sync + 'static,
        R: Into<Value>,
    {
        let entry: EntryFn =
            Arc::new(move |runtime: &Runtime, args: Vec<Value>| f(runtime, args).into());
        self.inner.entries.lock().insert(name.into(), entry);
    }

    /// Spawn with no arguments and no callbacks.
    pub fn spawn(&self, entry: EntryPoint) -> Result<ThreadId, SpawnError> {
        ThreadBuilder::new(entry).spawn(self)
    }

    pub(crate) fn create(&self, builder: ThreadBuilder) -> Result<ThreadId, SpawnError> {
        let result = self.try_create(&builder);
        self.inner.state.lock().last_error = result.err();
        result
    }

    fn try_create(&self, builder: &ThreadBuilder) -> Result<ThreadId, SpawnError> {
        if in_interrupt_context() {
            tracing::warn!("Refusing to spawn from a message or exit callback");
            return Err(SpawnError::InterruptContext);
        }
        if !self.is_active() {
            return Err(SpawnError::NotInitialized);
        }
        let Some(entry) = self.resolve_entry(&builder.entry) else {
            tracing::warn!("Cannot resolve entry point {:?}", builder.entry);
            return Err(SpawnError::BadEntryPoint);
        };

        let attempts = self.inner.config.spawn_attempts;
        let mut attempt = 1;
        loop {
            match self.spawn_once(&entry, builder) {
                Ok(id) => return Ok(id),
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::warn!("Spawn attempt {}/{} failed: {}", attempt, attempts, e);
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!("Spawn failed after {} attempt(s): {}", attempt, e);
                    return Err(e);
                }
            }
        }
    }

    fn resolve_entry(&self, entry: &EntryPoint) -> Option<EntryFn> {
        match entry {
            EntryPoint::Function(f) => Some(f.clone()),
            EntryPoint::Named(name) => self.inner.entries.lock().get(name).cloned(),
        }
    }

    fn spawn_once(&self, entry: &EntryFn, builder: &ThreadBuilder) -> Result<ThreadId, SpawnError> {
        let spawn_guard = self.inner.spawn_lock.lock();
        // Both locks are held across the fork so the child starts from a
        // consistent snapshot and nobody else's guard is copied into it.
        let mut intake = self.inner.interrupts.lock();
        let mut state = self.inner.state.lock();
        let parent = state.me.id;
        let main = state.me.main_id;

        match process::fork() {
            Err(e) => {
                tracing::error!("fork() failed: {}", e);
                Err(SpawnError::ForkError)
            }

            Ok(Fork::Child) => {
                let config = &self.inner.config;
                let me = ThreadId::current();
                let globals: HashMap<String, Value> = std::mem::take(&mut state.globals);
                *state = ProcessState::new(
                    SelfRecord {
                        id: me,
                        parent_id: Some(parent),
                        main_id: main,
                        authorized: false,
                        on_message: builder.attributes.on_message.clone(),
                        payload: builder.payload.clone(),
                    },
                    globals,
                    Transport::new(config, me),
                    config.exited_capacity,
                );
                drop(state);

                if let Some(inherited) = intake.take() {
                    inherited.abandon_after_fork();
                }
                if self.inner.entries.is_locked() {
                    // SAFETY: the holder was another thread of the parent; it
                    // does not exist in this process.
                    unsafe { self.inner.entries.force_unlock() };
                }

                let endpoint = match Endpoint::bind(&config.socket_dir, me) {
                    Ok(endpoint) => endpoint,
                    Err(e) => {
                        tracing::error!("[{}] Failed to create IPC listener socket: {}", me, e);
                        process::exit_now(EXIT_SOCKET_FAILED);
                    }
                };
                match interrupts::install(Arc::downgrade(&self.inner), endpoint) {
                    Ok(handle) => *intake = Some(handle),
                    Err(e) => process::fatal(&format!("Failed to install signal handlers: {}", e)),
                }
                drop(intake);
                drop(spawn_guard);

                self.run_thread(entry.clone(), builder.args.clone())
            }

            Ok(Fork::Parent(child)) => {
                state.starting = Some(ThreadRecord::starting(
                    child,
                    parent,
                    main,
                    builder.attributes.clone(),
                    builder.payload.clone(),
                ));
                drop(state);
                drop(intake);

                let result = self.await_liveness(child);
                drop(spawn_guard);
                result
            }
        }
    }

    /// Parent half of the handshake.
    fn await_liveness(&self, child: ThreadId) -> Result<ThreadId, SpawnError> {
        let config = &self.inner.config;
        let outcome = poll_until(
            Timeout::After(config.handshake_timeout),
            config.poll_interval,
            || {
                let state = self.inner.state.lock();
                if state.live.contains_key(&child) {
                    ControlFlow::Break(true)
                } else if state.starting.as_ref().is_some_and(|r| r.id == child) {
                    ControlFlow::Continue(())
                } else {
                    // Reaped before it ever confirmed liveness.
                    ControlFlow::Break(false)
                }
            },
        );

        match outcome {
            Some(true) => {
                if process::send_signal(child, SIG_BEGIN) {
                    tracing::debug!("Thread {} authorized", child);
                    Ok(child)
                } else {
                    tracing::warn!("Thread {} vanished before authorization", child);
                    self.forget_child(child);
                    Err(SpawnError::ThreadGone)
                }
            }
            Some(false) => {
                let status = self.forget_child(child);
                tracing::warn!("Thread {} exited during startup ({:?})", child, status);
                if status == Some(ExitStatus::Exited(EXIT_SOCKET_FAILED)) {
                    Err(SpawnError::SocketFailed)
                } else {
                    Err(SpawnError::ThreadGone)
                }
            }
            None => {
                {
                    let mut state = self.inner.state.lock();
                    if state.starting.as_ref().is_some_and(|r| r.id == child) {
                        state.starting = None;
                    }
                }
                let killed = process::send_signal(child, libc::SIGKILL);
                // Liveness may have landed after the last check; the spawn is
                // reported failed either way, so no record may survive it.
                self.forget_child(child);
                if !killed {
                    return Err(SpawnError::ThreadGone);
                }
                tracing::warn!(
                    "Thread {} did not confirm liveness within {:?}; killed",
                    child,
                    config.handshake_timeout
                );
                Err(SpawnError::StartTimeout)
            }
        }
    }

    /// Drop every record of `child`, returning its exit status if it was
    /// already reaped.
    fn forget_child(&self, child: ThreadId) -> Option<ExitStatus> {
        let mut state = self.inner.state.lock();
        state.live.remove(&child);
        state.exited.take(child).and_then(|record| record.exit_status)
    }

    /// Child half of the handshake, then the entry point. Never returns.
    fn run_thread(&self, entry: EntryFn, args: Vec<Value>) -> ! {
        let (me, parent) = {
            let state = self.inner.state.lock();
            (state.me.id, state.me.parent_id)
        };
        let Some(parent) = parent else {
            process::fatal("Spawned thread has no parent");
        };

        if !process::send_signal(parent, SIG_BEGIN) {
            tracing::error!("[{}] Parent {} is gone; exiting", me, parent);
            self.teardown_thread();
            process::exit_now(1);
        }

        let config = &self.inner.config;
        let authorized = poll_until(
            Timeout::After(config.handshake_timeout),
            config.poll_interval,
            || {
                if self.inner.state.lock().me.authorized {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
        );
        if authorized.is_none() {
            tracing::warn!(
                "[{}] Not authorized by {} within {:?}; exiting",
                me,
                parent,
                config.handshake_timeout
            );
            self.teardown_thread();
            process::exit_now(1);
        }

        tracing::debug!("[{}] Running entry point", me);
        match catch_unwind(AssertUnwindSafe(|| entry(self, args))) {
            Ok(value) => self.finish_thread(value),
            Err(_) => {
                tracing::error!("[{}] Entry point panicked", me);
                self.teardown_thread();
                process::exit_now(101)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_point_debug_names_target() {
        assert_eq!(
            format!("{:?}", EntryPoint::named("worker")),
            "EntryPoint::Named(\"worker\")"
        );
        let f = EntryPoint::new(|_, args: Vec<Value>| args.len() as i64);
        assert_eq!(format!("{:?}", f), "EntryPoint::Function");
    }

    #[test]
    fn test_builder_collects_args_and_payload() {
        let builder = ThreadBuilder::new(EntryPoint::named("work"))
            .arg(1)
            .args(["a", "b"])
            .payload(true);
        assert_eq!(
            builder.args,
            vec![Value::Int(1), Value::from("a"), Value::from("b")]
        );
        assert_eq!(builder.payload, Some(Value::Bool(true)));
        assert!(matches!(builder.entry, EntryPoint::Named(ref n) if n == "work"));
    }

    #[test]
    fn test_attributes_are_optional() {
        let attrs = ThreadAttributes::new().on_exit(|_, _, _| {});
        assert!(attrs.on_exit.is_some());
        assert!(attrs.on_thread_message.is_none());
        assert!(attrs.on_message.is_none());
    }
}
