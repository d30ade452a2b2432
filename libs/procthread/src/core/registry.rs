// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Per-process bookkeeping: who we are, which children we have in which
//! state, the mailbox and the globals. One [`ProcessState`] lives behind the
//! runtime's mutex; it is only ever touched with that lock held.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use super::error::SpawnError;
use super::identity::{PseudoThread, Relation, Sender, ThreadInfo, ThreadState};
use super::process::{ExitStatus, ThreadId};
use super::runtime::Runtime;
use super::spawn::ThreadAttributes;
use super::transport::Transport;
use super::value::Value;

/// Called on the parent after a child has been reaped, with the child's
/// return value if one arrived.
pub type ExitCallback = Arc<dyn Fn(&Runtime, &ThreadInfo, Option<&Value>) + Send + Sync>;

/// Called for an inbound application message instead of queueing it.
pub type MessageCallback = Arc<dyn Fn(&Runtime, &Sender, Value) + Send + Sync>;

/// A queued inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Mail {
    pub sender: Sender,
    pub message: Value,
}

/// The calling process's own record.
pub(crate) struct SelfRecord {
    pub id: ThreadId,
    pub parent_id: Option<ThreadId>,
    pub main_id: ThreadId,
    /// Set once the parent has authorized us to run.
    pub authorized: bool,
    /// Default handler for inbound messages.
    pub on_message: Option<MessageCallback>,
    pub payload: Option<Value>,
}

impl SelfRecord {
    pub fn main(id: ThreadId) -> Self {
        Self {
            id,
            parent_id: None,
            main_id: id,
            authorized: true,
            on_message: None,
            payload: None,
        }
    }
}

/// A child as tracked by its parent.
pub(crate) struct ThreadRecord {
    pub id: ThreadId,
    pub parent_id: ThreadId,
    pub main_id: ThreadId,
    pub state: ThreadState,
    pub attributes: ThreadAttributes,
    pub payload: Option<Value>,
    pub return_value: Option<Value>,
    pub exit_status: Option<ExitStatus>,
}

impl ThreadRecord {
    pub fn starting(
        id: ThreadId,
        parent_id: ThreadId,
        main_id: ThreadId,
        attributes: ThreadAttributes,
        payload: Option<Value>,
    ) -> Self {
        Self {
            id,
            parent_id,
            main_id,
            state: ThreadState::Starting,
            attributes,
            payload,
            return_value: None,
            exit_status: None,
        }
    }

    pub fn info(&self) -> ThreadInfo {
        ThreadInfo {
            id: self.id,
            parent_id: Some(self.parent_id),
            main_id: self.main_id,
            state: self.state,
            exit_status: self.exit_status,
        }
    }
}

/// Reaped children waiting to be joined, bounded by `capacity`.
pub(crate) struct ExitedChildren {
    records: BTreeMap<ThreadId, ThreadRecord>,
    capacity: usize,
    dropped: u64,
}

impl ExitedChildren {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: BTreeMap::new(),
            capacity,
            dropped: 0,
        }
    }

    /// Store a reaped child. Returns false when the map is full and the
    /// record was discarded.
    pub fn insert(&mut self, record: ThreadRecord) -> bool {
        if self.records.len() >= self.capacity && !self.records.contains_key(&record.id) {
            self.dropped += 1;
            return false;
        }
        self.records.insert(record.id, record);
        true
    }

    /// Hand out a record to a joiner.
    pub fn take(&mut self, id: ThreadId) -> Option<ThreadRecord> {
        self.records.remove(&id).map(|mut record| {
            record.state = ThreadState::Collected;
            record
        })
    }

    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut ThreadRecord> {
        self.records.get_mut(&id)
    }

    pub fn get(&self, id: ThreadId) -> Option<&ThreadRecord> {
        self.records.get(&id)
    }

    pub fn contains(&self, id: ThreadId) -> bool {
        self.records.contains_key(&id)
    }

    /// Hand out every record, in pid order.
    pub fn take_all(&mut self) -> Vec<ThreadRecord> {
        std::mem::take(&mut self.records)
            .into_values()
            .map(|mut record| {
                record.state = ThreadState::Collected;
                record
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Exits whose records were discarded because the map was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// What the interrupt thread needs after a reap, once the lock is released.
pub(crate) struct Reaped {
    pub info: ThreadInfo,
    pub return_value: Option<Value>,
    pub on_exit: Option<ExitCallback>,
    /// False when the exited map was full.
    pub retained: bool,
}

pub(crate) struct ProcessState {
    pub me: SelfRecord,
    /// At most one child between fork and liveness confirmation.
    pub starting: Option<ThreadRecord>,
    pub live: BTreeMap<ThreadId, ThreadRecord>,
    pub exited: ExitedChildren,
    pub mailbox: VecDeque<Mail>,
    pub globals: HashMap<String, Value>,
    pub last_error: Option<SpawnError>,
    pub transport: Transport,
}

impl ProcessState {
    pub fn new(
        me: SelfRecord,
        globals: HashMap<String, Value>,
        transport: Transport,
        exited_capacity: usize,
    ) -> Self {
        Self {
            me,
            starting: None,
            live: BTreeMap::new(),
            exited: ExitedChildren::new(exited_capacity),
            mailbox: VecDeque::new(),
            globals,
            last_error: None,
            transport,
        }
    }

    pub fn is_main(&self) -> bool {
        self.me.parent_id.is_none()
    }

    /// Move the starting child to the live set. With `expected`, only a
    /// child with that id is promoted.
    pub fn promote_starting(&mut self, expected: Option<ThreadId>) -> Option<ThreadId> {
        let matches = match (&self.starting, expected) {
            (Some(record), Some(id)) => record.id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return None;
        }
        let mut record = self.starting.take()?;
        record.state = ThreadState::Live;
        let id = record.id;
        self.live.insert(id, record);
        tracing::debug!("[{}] Child {} is live", self.me.id, id);
        Some(id)
    }

    /// Record the termination of a tracked child. Untracked pids are ignored.
    pub fn reap(&mut self, id: ThreadId, status: ExitStatus) -> Option<Reaped> {
        let mut record = match self.live.remove(&id) {
            Some(record) => record,
            None if self.starting.as_ref().is_some_and(|r| r.id == id) => self.starting.take()?,
            None => return None,
        };
        record.state = ThreadState::Exited;
        record.exit_status = Some(status);

        let reaped = Reaped {
            info: record.info(),
            return_value: record.return_value.clone(),
            on_exit: record.attributes.on_exit.clone(),
            retained: false,
        };
        let retained = self.exited.insert(record);
        if !retained {
            tracing::warn!(
                "[{}] Exited-children map is full ({} records); dropping record for {}",
                self.me.id,
                self.exited.len(),
                id
            );
        }
        Some(Reaped { retained, ..reaped })
    }

    pub fn is_tracked_child(&self, id: ThreadId) -> bool {
        self.live.contains_key(&id) || self.starting.as_ref().is_some_and(|r| r.id == id)
    }

    /// Starting and live children.
    pub fn child_ids(&self) -> Vec<ThreadId> {
        self.starting
            .iter()
            .map(|r| r.id)
            .chain(self.live.keys().copied())
            .collect()
    }

    pub fn children(&self) -> Vec<ThreadInfo> {
        self.starting
            .iter()
            .chain(self.live.values())
            .map(ThreadRecord::info)
            .collect()
    }

    pub fn child_count(&self) -> usize {
        self.live.len() + usize::from(self.starting.is_some())
    }

    pub fn relation(&self, id: ThreadId) -> Relation {
        if id == self.me.id {
            Relation::Myself
        } else if Some(id) == self.me.parent_id {
            Relation::Parent
        } else if self.is_tracked_child(id) || self.exited.contains(id) {
            Relation::Child
        } else {
            Relation::Unrelated
        }
    }

    /// Classify the sender of an envelope.
    pub fn sender(&self, id: ThreadId, sender_parent: Option<ThreadId>) -> Sender {
        if Some(id) == self.me.parent_id {
            return Sender::Parent(ThreadInfo {
                id,
                parent_id: sender_parent,
                main_id: self.me.main_id,
                state: ThreadState::Live,
                exit_status: None,
            });
        }
        let record = self
            .live
            .get(&id)
            .or_else(|| self.starting.as_ref().filter(|r| r.id == id))
            .or_else(|| self.exited.get(id));
        match record {
            Some(record) => Sender::Child(record.info()),
            None => Sender::Unrelated(PseudoThread {
                id,
                parent_id: sender_parent,
            }),
        }
    }

    pub fn self_info(&self) -> ThreadInfo {
        ThreadInfo {
            id: self.me.id,
            parent_id: self.me.parent_id,
            main_id: self.me.main_id,
            state: ThreadState::Live,
            exit_status: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RuntimeConfig;

    fn pid(n: i32) -> ThreadId {
        ThreadId::new(n).unwrap()
    }

    fn state(capacity: usize) -> ProcessState {
        let me = pid(100);
        let transport = Transport::new(&RuntimeConfig::new().with_socket_dir("/tmp/pt-test"), me);
        ProcessState::new(SelfRecord::main(me), HashMap::new(), transport, capacity)
    }

    fn start(state: &mut ProcessState, id: i32) {
        state.starting = Some(ThreadRecord::starting(
            pid(id),
            state.me.id,
            state.me.main_id,
            ThreadAttributes::default(),
            None,
        ));
    }

    #[test]
    fn test_promotion_requires_matching_id() {
        let mut s = state(10);
        start(&mut s, 200);
        assert_eq!(s.promote_starting(Some(pid(201))), None);
        assert!(s.starting.is_some());
        assert_eq!(s.promote_starting(Some(pid(200))), Some(pid(200)));
        assert!(s.starting.is_none());
        assert_eq!(s.live[&pid(200)].state, ThreadState::Live);
        assert_eq!(s.promote_starting(None), None);
    }

    #[test]
    fn test_reap_moves_live_child_to_exited() {
        let mut s = state(10);
        start(&mut s, 200);
        s.promote_starting(None);
        s.live.get_mut(&pid(200)).unwrap().return_value = Some(Value::Int(42));

        let reaped = s.reap(pid(200), ExitStatus::Exited(0)).unwrap();
        assert!(reaped.retained);
        assert_eq!(reaped.return_value, Some(Value::Int(42)));
        assert_eq!(reaped.info.state, ThreadState::Exited);
        assert!(s.live.is_empty());

        let record = s.exited.take(pid(200)).unwrap();
        assert_eq!(record.state, ThreadState::Collected);
        assert!(s.exited.take(pid(200)).is_none());
    }

    #[test]
    fn test_reap_of_starting_child_clears_slot() {
        let mut s = state(10);
        start(&mut s, 300);
        assert!(s.reap(pid(300), ExitStatus::Signaled(9)).is_some());
        assert!(s.starting.is_none());
        assert!(s.exited.contains(pid(300)));
    }

    #[test]
    fn test_unknown_pid_is_not_reaped() {
        let mut s = state(10);
        assert!(s.reap(pid(999), ExitStatus::Exited(0)).is_none());
        assert_eq!(s.exited.len(), 0);
    }

    #[test]
    fn test_exited_capacity_counts_drops() {
        let mut s = state(2);
        for id in [201, 202, 203] {
            start(&mut s, id);
            s.promote_starting(None);
        }
        assert!(s.reap(pid(201), ExitStatus::Exited(0)).unwrap().retained);
        assert!(s.reap(pid(202), ExitStatus::Exited(0)).unwrap().retained);
        assert!(!s.reap(pid(203), ExitStatus::Exited(0)).unwrap().retained);
        assert_eq!(s.exited.len(), 2);
        assert_eq!(s.exited.dropped(), 1);
    }

    #[test]
    fn test_sender_classification() {
        let mut s = state(10);
        s.me.parent_id = Some(pid(50));
        start(&mut s, 200);
        s.promote_starting(None);

        assert!(s.sender(pid(50), None).is_parent());
        assert!(s.sender(pid(200), Some(pid(100))).is_child());
        assert!(matches!(
            s.sender(pid(7), Some(pid(50))),
            Sender::Unrelated(PseudoThread { .. })
        ));

        assert_eq!(s.relation(pid(100)), Relation::Myself);
        assert_eq!(s.relation(pid(50)), Relation::Parent);
        assert_eq!(s.relation(pid(200)), Relation::Child);
        assert_eq!(s.relation(pid(7)), Relation::Unrelated);
    }

    #[test]
    fn test_child_listing_includes_starting() {
        let mut s = state(10);
        start(&mut s, 200);
        s.promote_starting(None);
        start(&mut s, 201);
        assert_eq!(s.child_count(), 2);
        assert_eq!(s.child_ids(), vec![pid(201), pid(200)]);
    }
}
