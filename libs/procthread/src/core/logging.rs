// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Logging setup for binaries built on procthread.
//!
//! The library itself only emits `tracing` events. Applications that do not
//! install their own subscriber can call [`init_logging`] once in the main
//! process; forked threads inherit the subscriber.

use tracing_subscriber::EnvFilter;

/// Filter directive variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "PROCTHREAD_LOG";

/// Install a fmt subscriber filtered by `PROCTHREAD_LOG`, then `RUST_LOG`,
/// defaulting to `info`. Does nothing if a global subscriber already exists.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging();
        init_logging();
        tracing::info!("still logging");
    }
}
