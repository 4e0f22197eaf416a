//! I/O status codes
//!
//! Shared result vocabulary for the buffered read and write paths. A status
//! converts to and from its integer sentinel so hosts that keep plain return
//! codes can round-trip it.

use std::fmt;

/// Status code constants
pub const STATUS_OK: i32 = 0;
pub const STATUS_ERROR: i32 = -1;
pub const STATUS_WAIT: i32 = -2;
pub const STATUS_EOF: i32 = -3;
pub const STATUS_INVALID: i32 = -4;

/// Outcome of one buffered I/O operation
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// Completed: the requested bytes were moved or the buffer drained.
    Ok = 0,
    /// Unrecoverable descriptor error, already logged.
    Error = -1,
    /// The descriptor would block; retry after the next readiness cycle.
    Wait = -2,
    /// The peer closed its sending half.
    Eof = -3,
    /// Malformed argument (negative descriptor).
    Invalid = -4,
}

impl From<i32> for IoStatus {
    fn from(code: i32) -> Self {
        match code {
            0 => IoStatus::Ok,
            -2 => IoStatus::Wait,
            -3 => IoStatus::Eof,
            -4 => IoStatus::Invalid,
            _ => IoStatus::Error,
        }
    }
}

impl From<IoStatus> for i32 {
    fn from(status: IoStatus) -> Self {
        status as i32
    }
}

impl IoStatus {
    pub fn is_ok(&self) -> bool {
        *self == IoStatus::Ok
    }

    pub fn is_error(&self) -> bool {
        *self == IoStatus::Error
    }

    pub fn is_wait(&self) -> bool {
        *self == IoStatus::Wait
    }

    pub fn is_eof(&self) -> bool {
        *self == IoStatus::Eof
    }

    pub fn is_invalid(&self) -> bool {
        *self == IoStatus::Invalid
    }
}

impl Default for IoStatus {
    fn default() -> Self {
        IoStatus::Ok
    }
}

impl fmt::Display for IoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IoStatus::Ok => "ok",
            IoStatus::Error => "error",
            IoStatus::Wait => "wait",
            IoStatus::Eof => "eof",
            IoStatus::Invalid => "invalid",
        };
        write!(f, "{}", name)
    }
}
