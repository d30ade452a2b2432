// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use thiserror::Error;

use super::process::ThreadId;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Envelope codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Spawn failed: {0}")]
    Spawn(#[from] SpawnError),

    #[error("A runtime is already initialized in this process")]
    AlreadyInitialized,

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Reasons a spawn can fail. Each variant has a stable negative code so
/// callers that speak the numeric protocol can keep doing so.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    #[error("NOT_INITIALIZED: the runtime for this process is not initialized")]
    NotInitialized,

    #[error("SOCKET_FAILED: the IPC listener socket could not be created")]
    SocketFailed,

    #[error("BAD_ENTRY_POINT: the thread entry point cannot be resolved")]
    BadEntryPoint,

    #[error("FORK_ERROR: fork() failed")]
    ForkError,

    #[error("START_TIMEOUT: the child did not confirm liveness in time")]
    StartTimeout,

    #[error("THREAD_GONE: the child terminated before it could be authorized")]
    ThreadGone,

    #[error("INTERRUPT_CONTEXT: threads cannot be spawned from a message or exit callback")]
    InterruptContext,
}

impl SpawnError {
    pub const SUCCESS: i32 = 0;

    pub fn code(self) -> i32 {
        match self {
            Self::NotInitialized => -1,
            Self::SocketFailed => -2,
            Self::BadEntryPoint => -3,
            Self::ForkError => -4,
            Self::StartTimeout => -5,
            Self::ThreadGone => -6,
            Self::InterruptContext => -7,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -1 => Self::NotInitialized,
            -2 => Self::SocketFailed,
            -3 => Self::BadEntryPoint,
            -4 => Self::ForkError,
            -5 => Self::StartTimeout,
            -6 => Self::ThreadGone,
            -7 => Self::InterruptContext,
            _ => return None,
        })
    }

    /// Human readable name for a numeric spawn result.
    pub fn describe(code: i32) -> String {
        if code == Self::SUCCESS {
            return "SUCCESS".to_string();
        }
        match Self::from_code(code) {
            Some(err) => err.to_string(),
            None => "UNKNOWN ERROR CODE".to_string(),
        }
    }

    /// Whether retrying the whole spawn sequence can help.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::ForkError | Self::StartTimeout | Self::ThreadGone)
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Cannot send a message to one's self")]
    SelfSend,

    #[error("The main process has no parent")]
    NoParent,

    #[error("Failed to connect to thread {target}: {source}")]
    Connect {
        target: ThreadId,
        #[source]
        source: std::io::Error,
    },

    #[error("BROKEN PIPE: {sent} bytes sent, {remaining} bytes remaining")]
    BrokenPipe { sent: usize, remaining: usize },

    #[error("Socket IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Compressed payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("zlib stream failed: {0}")]
    Zlib(std::io::Error),

    #[error("Compressed payload must be carried as text")]
    CompressedPayloadNotText,

    #[error("Declared data type '{declared}' does not match the payload")]
    TypeMismatch { declared: String },

    #[error("Global-set envelope is missing its variable name")]
    MissingGlobalName,

    #[error("Envelope names an invalid sender pid {0}")]
    InvalidSender(i32),
}
