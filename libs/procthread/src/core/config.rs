// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Runtime configuration.
//!
//! All timing constants of the handshake, transport and join machinery live
//! here so tests (and unusual deployments) can tighten or relax them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use super::process::ThreadId;

/// Environment override for the socket directory.
pub const SOCKET_DIR_ENV: &str = "PROCTHREAD_SOCKET_DIR";

/// Payloads whose encoded value reaches this size are compressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1_024_000;

/// Exited-but-uncollected children kept per process.
pub const DEFAULT_EXITED_CAPACITY: usize = 100;

/// Configuration for a process runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directory holding one `<pid>.sock` endpoint per live process.
    pub socket_dir: PathBuf,
    /// Exited children retained until joined; extra exits lose their value.
    pub exited_capacity: usize,
    /// Bound on each half of the liveness/authorization handshake.
    pub handshake_timeout: Duration,
    /// A send fails once this long passes without forward progress.
    pub send_grace: Duration,
    /// A receive gives up after this long without new bytes.
    pub read_stall: Duration,
    /// Sleep between checks in every bounded wait.
    pub poll_interval: Duration,
    /// Encoded value size at which envelopes switch to compression.
    pub compression_threshold: usize,
    /// How many times a spawn is attempted before the error surfaces.
    pub spawn_attempts: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            socket_dir: default_socket_dir(),
            exited_capacity: DEFAULT_EXITED_CAPACITY,
            handshake_timeout: Duration::from_millis(500),
            send_grace: Duration::from_millis(750),
            read_stall: Duration::from_secs(5),
            poll_interval: Duration::from_micros(50),
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            spawn_attempts: 3,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the socket directory.
    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    /// Set the exited-children capacity.
    pub fn with_exited_capacity(mut self, capacity: usize) -> Self {
        self.exited_capacity = capacity;
        self
    }

    /// Set the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the send grace window.
    pub fn with_send_grace(mut self, grace: Duration) -> Self {
        self.send_grace = grace;
        self
    }

    /// Set the receive stall timeout.
    pub fn with_read_stall(mut self, stall: Duration) -> Self {
        self.read_stall = stall;
        self
    }

    /// Set the polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the compression threshold.
    pub fn with_compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = bytes;
        self
    }

    /// Set the number of spawn attempts.
    pub fn with_spawn_attempts(mut self, attempts: u32) -> Self {
        self.spawn_attempts = attempts;
        self
    }

    /// Endpoint path for a given process.
    pub fn socket_path(&self, id: ThreadId) -> PathBuf {
        socket_path_in(&self.socket_dir, id)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.spawn_attempts == 0 {
            return Err("spawn_attempts must be at least 1".to_string());
        }
        if self.poll_interval.is_zero() {
            return Err("poll_interval must be non-zero".to_string());
        }
        if self.socket_dir.as_os_str().is_empty() {
            return Err("socket_dir must not be empty".to_string());
        }
        Ok(())
    }
}

pub(crate) fn socket_path_in(dir: &Path, id: ThreadId) -> PathBuf {
    dir.join(format!("{}.sock", id))
}

/// Resolve the default socket directory.
///
/// Resolution order:
/// 1. `PROCTHREAD_SOCKET_DIR` environment variable (explicit override)
/// 2. `XDG_RUNTIME_DIR/procthread`
/// 3. `<temp dir>/procthread`
pub fn default_socket_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(SOCKET_DIR_ENV) {
        return PathBuf::from(dir);
    }

    if let Some(runtime) = dirs::runtime_dir() {
        return runtime.join("procthread");
    }

    std::env::temp_dir().join("procthread")
}

/// Create the socket directory, world accessible so processes that changed
/// credentials can still reach each other.
pub(crate) fn ensure_socket_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = RuntimeConfig::default();
        assert_eq!(config.exited_capacity, 100);
        assert_eq!(config.handshake_timeout, Duration::from_millis(500));
        assert_eq!(config.send_grace, Duration::from_millis(750));
        assert_eq!(config.read_stall, Duration::from_secs(5));
        assert_eq!(config.compression_threshold, 1_024_000);
        assert_eq!(config.spawn_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_socket_path_is_named_by_pid() {
        let config = RuntimeConfig::new().with_socket_dir("/run/pt");
        let id = ThreadId::new(4242).unwrap();
        assert_eq!(config.socket_path(id), PathBuf::from("/run/pt/4242.sock"));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let config = RuntimeConfig::new().with_spawn_attempts(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ensure_socket_dir_creates_nested() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("a/b");
        ensure_socket_dir(&dir).unwrap();
        assert!(dir.is_dir());
        // Second call is a no-op.
        ensure_socket_dir(&dir).unwrap();
    }
}
