// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Tree-wide global variables.
//!
//! A set applies locally and is then flooded to every direct relative except
//! the one it came from. Each hop repeats that, so an update reaches the
//! whole tree without cycles. Arrival order across concurrent setters is not
//! coordinated; the last envelope processed wins locally.

use std::collections::HashMap;

use super::envelope::{self, Envelope};
use super::error::Result;
use super::process::ThreadId;
use super::registry::ProcessState;
use super::runtime::Runtime;
use super::value::Value;

/// Store `value` locally and return the relatives that must hear about it.
pub(crate) fn apply(
    state: &mut ProcessState,
    name: &str,
    value: Value,
    exclude: Option<ThreadId>,
) -> Vec<ThreadId> {
    state.globals.insert(name.to_string(), value);
    state
        .me
        .parent_id
        .into_iter()
        .chain(state.live.keys().copied())
        .filter(|id| Some(*id) != exclude)
        .collect()
}

impl Runtime {
    /// Set a global on every process in the tree.
    ///
    /// Returns how many direct relatives the update was handed to; delivery
    /// to each is best effort.
    pub fn set_global(&self, name: &str, value: impl Into<Value>) -> Result<usize> {
        self.broadcast_global(name, value.into(), None)
    }

    /// Like [`set_global`](Self::set_global), but `exclude` (a parent or
    /// child of this process) is not sent the update, and neither is the
    /// part of the tree reached only through it.
    pub fn set_global_excluding(
        &self,
        name: &str,
        value: impl Into<Value>,
        exclude: ThreadId,
    ) -> Result<usize> {
        self.broadcast_global(name, value.into(), Some(exclude))
    }

    fn broadcast_global(&self, name: &str, value: Value, exclude: Option<ThreadId>) -> Result<usize> {
        let targets = {
            let mut state = self.inner.state.lock();
            apply(&mut state, name, value.clone(), exclude)
        };
        self.forward_global(name, value, targets)
    }

    /// Current local value of a global.
    pub fn global(&self, name: &str) -> Option<Value> {
        self.inner.state.lock().globals.get(name).cloned()
    }

    /// Snapshot of every global known to this process.
    pub fn globals(&self) -> HashMap<String, Value> {
        self.inner.state.lock().globals.clone()
    }

    pub(crate) fn forward_global(
        &self,
        name: &str,
        value: Value,
        targets: Vec<ThreadId>,
    ) -> Result<usize> {
        if targets.is_empty() {
            return Ok(0);
        }
        let (transport, me, parent) = {
            let state = self.inner.state.lock();
            (state.transport.clone(), state.me.id, state.me.parent_id)
        };
        let frame = envelope::encode(
            &Envelope::global(name, value, me, parent),
            self.inner.config.compression_threshold,
        )?;

        let mut delivered = 0;
        for target in targets {
            match transport.send(target, &frame) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!("[{}] Global '{}' not delivered to {}: {}", me, name, target, e),
            }
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RuntimeConfig;
    use crate::core::registry::{SelfRecord, ThreadRecord};
    use crate::core::spawn::ThreadAttributes;
    use crate::core::transport::Transport;

    fn pid(n: i32) -> ThreadId {
        ThreadId::new(n).unwrap()
    }

    fn tree() -> ProcessState {
        let me = pid(20);
        let transport = Transport::new(&RuntimeConfig::new().with_socket_dir("/tmp/pt-test"), me);
        let mut record = SelfRecord::main(me);
        record.parent_id = Some(pid(10));
        record.main_id = pid(10);
        let mut state = ProcessState::new(record, HashMap::new(), transport, 10);
        for child in [30, 31] {
            state.live.insert(
                pid(child),
                ThreadRecord::starting(pid(child), me, pid(10), ThreadAttributes::default(), None),
            );
        }
        state
    }

    #[test]
    fn test_local_set_floods_parent_and_children() {
        let mut state = tree();
        let targets = apply(&mut state, "mode", Value::from("fast"), None);
        assert_eq!(targets, vec![pid(10), pid(30), pid(31)]);
        assert_eq!(state.globals["mode"], Value::from("fast"));
    }

    #[test]
    fn test_forwarded_set_skips_origin() {
        let mut state = tree();
        let targets = apply(&mut state, "mode", Value::Int(1), Some(pid(30)));
        assert_eq!(targets, vec![pid(10), pid(31)]);

        let targets = apply(&mut state, "mode", Value::Int(2), Some(pid(10)));
        assert_eq!(targets, vec![pid(30), pid(31)]);
        assert_eq!(state.globals["mode"], Value::Int(2));
    }
}
