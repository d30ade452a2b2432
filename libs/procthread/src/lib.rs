// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Thread-like concurrency built from OS processes.
//!
//! Each "thread" is a forked process with its own address space. Threads
//! talk over per-process Unix sockets, woken by signals, and share a small
//! set of tree-wide globals.
//!
//! ```ignore
//! use procthread::{EntryPoint, Runtime, RuntimeConfig, Timeout};
//!
//! let runtime = Runtime::init(RuntimeConfig::default())?;
//! let id = runtime.spawn(EntryPoint::new(|_, _| 42))?;
//! let value = runtime.join(id, Timeout::Infinite).into_value();
//! runtime.shutdown();
//! ```

#![cfg(unix)]
#![allow(clippy::type_complexity)] // Callback aliases are clear in context

pub mod core;

pub use self::core::*;
