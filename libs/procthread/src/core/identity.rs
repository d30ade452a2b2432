// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Who sent a message.
//!
//! Callbacks receive a [`Sender`]: a snapshot of a tracked relative when the
//! sender is this process's parent or one of its children, or a
//! [`PseudoThread`] carrying only the ids from the envelope otherwise.

use super::process::{self, ExitStatus, ThreadId};

/// Lifecycle of a spawned thread as seen by its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Forked, liveness not yet confirmed.
    Starting,
    /// Authorized and running.
    Live,
    /// Reaped, value not yet collected by a join.
    Exited,
    /// Value handed out by a join.
    Collected,
}

/// Identity queries shared by tracked records and stand-ins.
pub trait ThreadIdentity {
    fn id(&self) -> ThreadId;

    /// `None` for the main process.
    fn parent_id(&self) -> Option<ThreadId>;

    /// Lifecycle state, `None` when the receiver does not track the thread.
    fn state(&self) -> Option<ThreadState>;

    fn is_tracked(&self) -> bool {
        self.state().is_some()
    }
}

/// Snapshot of a thread record.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub parent_id: Option<ThreadId>,
    pub main_id: ThreadId,
    pub state: ThreadState,
    pub exit_status: Option<ExitStatus>,
}

impl ThreadIdentity for ThreadInfo {
    fn id(&self) -> ThreadId {
        self.id
    }

    fn parent_id(&self) -> Option<ThreadId> {
        self.parent_id
    }

    fn state(&self) -> Option<ThreadState> {
        Some(self.state)
    }
}

/// Minimal stand-in for a sender that is neither parent nor child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PseudoThread {
    pub id: ThreadId,
    pub parent_id: Option<ThreadId>,
}

impl PseudoThread {
    /// Child count of an untracked thread is unknown.
    pub fn child_count(&self) -> Option<usize> {
        None
    }

    /// Existence probe; says nothing about whether it is a procthread.
    pub fn is_alive(&self) -> bool {
        process::is_process_alive(self.id)
    }
}

impl ThreadIdentity for PseudoThread {
    fn id(&self) -> ThreadId {
        self.id
    }

    fn parent_id(&self) -> Option<ThreadId> {
        self.parent_id
    }

    fn state(&self) -> Option<ThreadState> {
        None
    }
}

/// The sender of an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Sender {
    Child(ThreadInfo),
    Parent(ThreadInfo),
    Unrelated(PseudoThread),
}

impl Sender {
    /// The tracked record, if the sender is a relative.
    pub fn info(&self) -> Option<&ThreadInfo> {
        match self {
            Sender::Child(info) | Sender::Parent(info) => Some(info),
            Sender::Unrelated(_) => None,
        }
    }

    pub fn is_child(&self) -> bool {
        matches!(self, Sender::Child(_))
    }

    pub fn is_parent(&self) -> bool {
        matches!(self, Sender::Parent(_))
    }
}

impl ThreadIdentity for Sender {
    fn id(&self) -> ThreadId {
        match self {
            Sender::Child(info) | Sender::Parent(info) => info.id,
            Sender::Unrelated(pseudo) => pseudo.id,
        }
    }

    fn parent_id(&self) -> Option<ThreadId> {
        match self {
            Sender::Child(info) | Sender::Parent(info) => info.parent_id,
            Sender::Unrelated(pseudo) => pseudo.parent_id,
        }
    }

    fn state(&self) -> Option<ThreadState> {
        self.info().map(|info| info.state)
    }
}

/// How another thread relates to the calling process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Myself,
    Parent,
    Child,
    Unrelated,
}

/// Which side of the tree the calling process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionContext {
    /// The process that initialized the runtime.
    Main,
    /// A process created by a spawn.
    Thread,
}
