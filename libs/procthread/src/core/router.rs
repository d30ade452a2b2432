// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Dispatch of decoded envelopes.
//!
//! [`route`] runs with the registry lock held and only mutates state. Work
//! that must happen without the lock (user callbacks, forwarding a global)
//! comes back as a [`Dispatch`] for the caller to carry out.

use super::envelope::{Envelope, EnvelopeKind};
use super::globals;
use super::identity::Sender;
use super::process::ThreadId;
use super::registry::{Mail, MessageCallback, ProcessState};
use super::value::Value;

pub(crate) enum Dispatch {
    Nothing,
    /// Invoke a message handler.
    Deliver {
        handler: MessageCallback,
        sender: Sender,
        message: Value,
    },
    /// Pass a global update on to the rest of the tree.
    Forward {
        name: String,
        value: Value,
        targets: Vec<ThreadId>,
    },
}

pub(crate) fn route(state: &mut ProcessState, envelope: Envelope) -> Dispatch {
    let from = envelope.sender;
    match envelope.kind {
        EnvelopeKind::GlobalSet => {
            let Some(name) = envelope.global_name else {
                return Dispatch::Nothing;
            };
            tracing::debug!("[{}] Global '{}' updated by {}", state.me.id, name, from);
            let targets = globals::apply(state, &name, envelope.value.clone(), Some(from));
            Dispatch::Forward {
                name,
                value: envelope.value,
                targets,
            }
        }

        EnvelopeKind::Return => {
            // The return normally lands while the child is still live. If the
            // exit was processed first, attach it to the exited record.
            if let Some(record) = state.live.get_mut(&from) {
                record.return_value = Some(envelope.value);
            } else if let Some(record) = state.exited.get_mut(from) {
                record.return_value = Some(envelope.value);
            } else {
                tracing::debug!(
                    "[{}] Discarding return value from untracked thread {}",
                    state.me.id,
                    from
                );
            }
            Dispatch::Nothing
        }

        EnvelopeKind::Message => {
            let sender = state.sender(from, envelope.sender_parent);
            let handler = match &sender {
                Sender::Child(_) => state
                    .live
                    .get(&from)
                    .or_else(|| state.exited.get(from))
                    .and_then(|record| record.attributes.on_thread_message.clone()),
                _ => None,
            }
            .or_else(|| state.me.on_message.clone());

            match handler {
                Some(handler) => Dispatch::Deliver {
                    handler,
                    sender,
                    message: envelope.value,
                },
                None => {
                    state.mailbox.push_back(Mail {
                        sender,
                        message: envelope.value,
                    });
                    Dispatch::Nothing
                }
            }
        }

        EnvelopeKind::Liveness => {
            if state.promote_starting(Some(from)).is_none() {
                tracing::debug!(
                    "[{}] Ignoring liveness notice from {} (not starting)",
                    state.me.id,
                    from
                );
            }
            Dispatch::Nothing
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RuntimeConfig;
    use crate::core::identity::ThreadState;
    use crate::core::process::ExitStatus;
    use crate::core::registry::{SelfRecord, ThreadRecord};
    use crate::core::spawn::ThreadAttributes;
    use crate::core::transport::Transport;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn pid(n: i32) -> ThreadId {
        ThreadId::new(n).unwrap()
    }

    fn main_state() -> ProcessState {
        let me = pid(1);
        let transport = Transport::new(&RuntimeConfig::new().with_socket_dir("/tmp/pt-test"), me);
        ProcessState::new(SelfRecord::main(me), HashMap::new(), transport, 10)
    }

    fn add_live(state: &mut ProcessState, id: i32, attributes: ThreadAttributes) {
        let mut record = ThreadRecord::starting(pid(id), pid(1), pid(1), attributes, None);
        record.state = ThreadState::Live;
        state.live.insert(pid(id), record);
    }

    fn message(from: i32, value: impl Into<Value>) -> Envelope {
        Envelope::new(EnvelopeKind::Message, value.into(), pid(from), Some(pid(1)))
    }

    #[test]
    fn test_unhandled_messages_queue_in_order() {
        let mut state = main_state();
        add_live(&mut state, 5, ThreadAttributes::default());
        for i in 0..3 {
            assert!(matches!(route(&mut state, message(5, i)), Dispatch::Nothing));
        }
        let got: Vec<_> = state.mailbox.iter().map(|m| m.message.clone()).collect();
        assert_eq!(got, vec![Value::Int(0), Value::Int(1), Value::Int(2)]);
        assert!(state.mailbox[0].sender.is_child());
    }

    #[test]
    fn test_thread_handler_beats_default_handler() {
        let mut state = main_state();
        let per_thread: MessageCallback = Arc::new(|_, _, _| {});
        let default: MessageCallback = Arc::new(|_, _, _| {});
        add_live(
            &mut state,
            5,
            ThreadAttributes {
                on_thread_message: Some(per_thread.clone()),
                ..Default::default()
            },
        );
        add_live(&mut state, 6, ThreadAttributes::default());
        state.me.on_message = Some(default.clone());

        match route(&mut state, message(5, "a")) {
            Dispatch::Deliver { handler, .. } => assert!(Arc::ptr_eq(&handler, &per_thread)),
            _ => panic!("expected delivery"),
        }
        match route(&mut state, message(6, "b")) {
            Dispatch::Deliver { handler, .. } => assert!(Arc::ptr_eq(&handler, &default)),
            _ => panic!("expected delivery"),
        }
        // Unrelated senders never reach a per-thread handler.
        match route(&mut state, message(77, "c")) {
            Dispatch::Deliver { handler, sender, .. } => {
                assert!(Arc::ptr_eq(&handler, &default));
                assert!(matches!(sender, Sender::Unrelated(_)));
            }
            _ => panic!("expected delivery"),
        }
        assert!(state.mailbox.is_empty());
    }

    #[test]
    fn test_return_value_lands_on_live_or_exited_record() {
        let mut state = main_state();
        add_live(&mut state, 5, ThreadAttributes::default());
        add_live(&mut state, 6, ThreadAttributes::default());

        route(
            &mut state,
            Envelope::new(EnvelopeKind::Return, Value::Int(42), pid(5), Some(pid(1))),
        );
        assert_eq!(state.live[&pid(5)].return_value, Some(Value::Int(42)));

        state.reap(pid(6), ExitStatus::Exited(0));
        route(
            &mut state,
            Envelope::new(EnvelopeKind::Return, Value::from("late"), pid(6), Some(pid(1))),
        );
        assert_eq!(
            state.exited.take(pid(6)).unwrap().return_value,
            Some(Value::from("late"))
        );
    }

    #[test]
    fn test_global_set_applies_and_forwards() {
        let mut state = main_state();
        add_live(&mut state, 5, ThreadAttributes::default());
        add_live(&mut state, 6, ThreadAttributes::default());

        let env = Envelope::global("ready", Value::Bool(true), pid(5), Some(pid(1)));
        match route(&mut state, env) {
            Dispatch::Forward { name, targets, .. } => {
                assert_eq!(name, "ready");
                assert_eq!(targets, vec![pid(6)]);
            }
            _ => panic!("expected forward"),
        }
        assert_eq!(state.globals["ready"], Value::Bool(true));
    }

    #[test]
    fn test_liveness_promotes_matching_child_only() {
        let mut state = main_state();
        state.starting = Some(ThreadRecord::starting(
            pid(9),
            pid(1),
            pid(1),
            ThreadAttributes::default(),
            None,
        ));
        route(
            &mut state,
            Envelope::new(EnvelopeKind::Liveness, Value::Null, pid(8), Some(pid(1))),
        );
        assert!(state.starting.is_some());
        route(
            &mut state,
            Envelope::new(EnvelopeKind::Liveness, Value::Null, pid(9), Some(pid(1))),
        );
        assert!(state.live.contains_key(&pid(9)));
    }
}
