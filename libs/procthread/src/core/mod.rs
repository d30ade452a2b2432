// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

pub mod config;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod interrupts;
pub mod join;
pub mod logging;
pub mod poll;
pub mod process;
pub mod registry;
pub mod runtime;
pub mod spawn;
pub mod transport;
pub mod value;

mod globals;
mod router;

pub use config::{RuntimeConfig, SOCKET_DIR_ENV, default_socket_dir};
pub use error::*;
pub use identity::*;
pub use interrupts::in_interrupt_context;
pub use join::JoinStatus;
pub use logging::init_logging;
pub use poll::Timeout;
pub use process::{ExitStatus, ThreadId, fatal};
pub use registry::{ExitCallback, Mail, MessageCallback};
pub use runtime::Runtime;
pub use spawn::{EntryFn, EntryPoint, ThreadAttributes, ThreadBuilder};
pub use value::Value;
