//! Error types for fpool.

use nix::errno::Errno;
use thiserror::Error;

/// Main error type for fpool.
#[derive(Error, Debug)]
pub enum FpoolError {
    #[error("system call failed: {0}")]
    Sys(#[from] Errno),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel closed by peer")]
    ChannelClosed,

    #[error("IO step timed out")]
    TimedOut,

    #[error("cancelled by shutdown")]
    Cancelled,

    #[error("worker is not running")]
    NotRunning,

    #[error("worker error: {0}")]
    Worker(String),
}

impl FpoolError {
    /// Negative errno carried in the `status` field of a header-only
    /// failure reply.
    pub fn status(&self) -> i32 {
        match self {
            Self::Sys(errno) => -(*errno as i32),
            Self::Io(err) => -err.raw_os_error().unwrap_or(Errno::EIO as i32),
            Self::ChannelClosed => -(Errno::EPIPE as i32),
            Self::TimedOut => -(Errno::ETIMEDOUT as i32),
            Self::Cancelled => -(Errno::ECANCELED as i32),
            Self::NotRunning => -(Errno::ENOENT as i32),
            Self::Worker(_) => -(Errno::EIO as i32),
        }
    }
}

/// Result type alias for fpool operations.
pub type Result<T> = std::result::Result<T, FpoolError>;
