//! sockmux core library
//!
//! This crate provides a single-threaded, poll(2)-based socket multiplexer:
//! a descriptor table with per-group readiness partitions, granularity-grown
//! byte buffers, buffered non-blocking connections with half-close tracking,
//! and a dispatch loop that feeds inbound bytes to an application callback.

pub mod buf;      // Growable byte buffer
pub mod config;   // Dispatch loop tunables
pub mod conn;     // Connection state and buffered I/O
pub mod dispatch; // Poll / accept / read / write dispatch loop
pub mod error;    // Multiplexer error type
pub mod log;      // Logger initialization
pub mod poll;     // Descriptor table and readiness partitions
pub mod sock;     // Socket plumbing
pub mod status;   // I/O status codes

// Re-export commonly used types
pub use buf::{GrowBuf, DEFAULT_GRANULARITY};
pub use config::DispatchConfig;
pub use conn::{buffered_read, buffered_write, Conn, ConnState};
pub use dispatch::{Dispatcher, Handler, GROUP_CLIENT, GROUP_LISTENER};
pub use error::{PollError, PollResult};
pub use poll::{FdEntry, FdTable, DEFAULT_TIMEOUT_MS, EV_READ, EV_WRITE};
pub use sock::{set_nonblocking, tcp_listen, Sock, INVALID_FD};
pub use status::{IoStatus, STATUS_EOF, STATUS_ERROR, STATUS_INVALID, STATUS_OK, STATUS_WAIT};
