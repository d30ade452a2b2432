// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Collecting children's return values.

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::time::Instant;

use super::interrupts::in_interrupt_context;
use super::poll::{Timeout, poll_until};
use super::process::ThreadId;
use super::runtime::Runtime;
use super::value::Value;

/// Result of [`Runtime::join`].
#[derive(Debug, Clone, PartialEq)]
pub enum JoinStatus {
    /// The child exited; carries its return value if one arrived.
    Success(Option<Value>),
    /// Not a child of this process, or already joined.
    ThreadNotFound,
    /// Still running when the wait expired.
    Timeout,
}

impl JoinStatus {
    /// Numeric form: 0 success, 1 not found, 2 timeout.
    pub fn code(&self) -> i32 {
        match self {
            JoinStatus::Success(_) => 0,
            JoinStatus::ThreadNotFound => 1,
            JoinStatus::Timeout => 2,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JoinStatus::Success(_))
    }

    /// The return value, if the join succeeded and one was sent.
    pub fn into_value(self) -> Option<Value> {
        match self {
            JoinStatus::Success(value) => value,
            _ => None,
        }
    }
}

impl Runtime {
    /// Wait for child `id` to exit and take its return value.
    ///
    /// Each exited child can be joined once. Inside a callback the call
    /// never blocks.
    pub fn join(&self, id: ThreadId, timeout: Timeout) -> JoinStatus {
        let timeout = if in_interrupt_context() {
            Timeout::NoWait
        } else {
            timeout
        };

        poll_until(timeout, self.inner.config.poll_interval, || {
            let mut state = self.inner.state.lock();
            if let Some(record) = state.exited.take(id) {
                ControlFlow::Break(JoinStatus::Success(record.return_value))
            } else if state.is_tracked_child(id) {
                ControlFlow::Continue(())
            } else {
                ControlFlow::Break(JoinStatus::ThreadNotFound)
            }
        })
        .unwrap_or(JoinStatus::Timeout)
    }

    /// Wait for every child and collect all return values, including those
    /// of children that had already exited.
    pub fn join_all(&self) -> BTreeMap<ThreadId, Option<Value>> {
        let (mut results, waiting) = {
            let mut state = self.inner.state.lock();
            let collected: BTreeMap<_, _> = state
                .exited
                .take_all()
                .into_iter()
                .map(|record| (record.id, record.return_value))
                .collect();
            (collected, state.child_ids())
        };

        for id in waiting {
            match self.join(id, Timeout::Infinite) {
                JoinStatus::Success(value) => {
                    results.insert(id, value);
                }
                // Exited but its record was dropped on overflow.
                JoinStatus::ThreadNotFound => {
                    results.insert(id, None);
                }
                JoinStatus::Timeout => {}
            }
        }
        results
    }

    /// Join the ids in `ids` in order under one shared time budget.
    ///
    /// Joined and unknown ids are removed from `ids`; whatever is still in
    /// it afterwards was not collected before the budget ran out.
    pub fn join_many(
        &self,
        ids: &mut Vec<ThreadId>,
        timeout: Timeout,
    ) -> BTreeMap<ThreadId, Option<Value>> {
        let started = Instant::now();
        let mut results = BTreeMap::new();

        while let Some(&id) = ids.first() {
            match self.join(id, timeout.remaining(started)) {
                JoinStatus::Success(value) => {
                    results.insert(id, value);
                    ids.remove(0);
                }
                JoinStatus::ThreadNotFound => {
                    tracing::debug!("join_many: {} is not a child, skipping", id);
                    ids.remove(0);
                }
                JoinStatus::Timeout => break,
            }
        }
        results
    }
}
