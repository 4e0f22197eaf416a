//! Multiplexer Error Types

use std::io;
use std::os::unix::io::RawFd;
use thiserror::Error;

/// Errors that can occur while operating the descriptor table or dispatch loop
#[derive(Error, Debug)]
pub enum PollError {
    /// The OS readiness call failed
    #[error("poll system call failed: {0}")]
    Sys(#[from] io::Error),

    /// A descriptor was registered twice
    #[error("fd {0} is already registered")]
    Duplicate(RawFd),

    /// Malformed argument
    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    /// A table index that no longer names a live entry
    #[error("stale table index {0}")]
    StaleIndex(usize),
}

pub type PollResult<T> = Result<T, PollError>;
