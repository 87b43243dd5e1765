//! Error types for jobherd.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for jobherd.
#[derive(Error, Debug)]
pub enum HerdError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Already running on PID:{pid} (or pid={} is stale)", path.display())]
    PidConflict { pid: i32, path: PathBuf },

    #[error("Settings file error: {0}")]
    ConfigFile(String),

    #[error("Hook {hook} failed: {message}")]
    Hook { hook: &'static str, message: String },

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Unknown user or group: {0}")]
    UnknownUser(String),
}

impl HerdError {
    /// Wrap an error returned by an application hook.
    pub fn hook(hook: &'static str, err: &anyhow::Error) -> Self {
        Self::Hook {
            hook,
            message: format!("{:#}", err),
        }
    }

    /// Whether this error is an interrupted system call that should be retried.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Self::Sys(errno) => *errno == nix::errno::Errno::EINTR,
            Self::Io(e) => e.kind() == std::io::ErrorKind::Interrupted,
            _ => false,
        }
    }
}

/// Result type alias for jobherd operations.
pub type Result<T> = std::result::Result<T, HerdError>;
