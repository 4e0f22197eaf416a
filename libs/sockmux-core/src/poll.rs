//! Descriptor table and readiness partitions
//!
//! One table owns every descriptor the multiplexer watches. Each entry keeps
//! its interest mask, the readiness reported by the most recent poll, a group
//! id and an opaque token. A poll cycle rebuilds the flat pollfd array, issues
//! one poll(2) call, and partitions the results per group into readable,
//! writable and error index sequences that callers consume in order.
//!
//! Registration is bookkeeping only. A descriptor is first handed to the OS
//! inside `poll`, so entries with never-polled descriptors are harmless.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;

use crate::error::{PollError, PollResult};
use crate::sock::Sock;

/// Interest bit: descriptor has bytes to read
pub const EV_READ: i16 = libc::POLLIN;
/// Interest bit: descriptor can accept bytes
pub const EV_WRITE: i16 = libc::POLLOUT;

/// Readiness bits that signal a dead or invalid descriptor. Reported by the
/// OS regardless of the registered interest.
const EV_ERR_MASK: i16 = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;

/// Poll timeout applied when the caller passes a negative value
pub const DEFAULT_TIMEOUT_MS: i32 = 100;

/// One watched descriptor
#[derive(Debug)]
pub struct FdEntry {
    pub fd: RawFd,
    /// Interest mask (EV_READ | EV_WRITE)
    pub events: i16,
    /// Raw readiness reported by the most recent poll
    pub revents: i16,
    /// Partition group this entry reports into
    pub group: usize,
    /// Opaque caller payload
    pub token: u64,
    /// Owned descriptor, closed when the entry is removed
    sock: Option<Sock>,
}

/// Per-group readiness partition, rebuilt on every poll
#[derive(Debug, Default)]
struct Partition {
    readable: VecDeque<usize>,
    writable: VecDeque<usize>,
    error: VecDeque<usize>,
}

impl Partition {
    fn clear(&mut self) {
        self.readable.clear();
        self.writable.clear();
        self.error.clear();
    }

    /// Drop references to a removed entry and remap the index of the entry
    /// that swap-remove moved into its slot.
    fn repair(&mut self, removed: usize, moved_from: usize) {
        for queue in [&mut self.readable, &mut self.writable, &mut self.error] {
            queue.retain(|&idx| idx != removed);
            if moved_from != removed {
                for idx in queue.iter_mut() {
                    if *idx == moved_from {
                        *idx = removed;
                    }
                }
            }
        }
    }

    fn sizes(&self) -> (usize, usize, usize) {
        (self.readable.len(), self.writable.len(), self.error.len())
    }
}

/// Descriptor table with per-group readiness partitions
pub struct FdTable {
    entries: Vec<FdEntry>,
    parts: Vec<Partition>,
    poll_fds: Vec<libc::pollfd>,
}

impl FdTable {
    /// Create a table with `groups` readiness partitions
    pub fn new(groups: usize) -> Self {
        assert!(groups > 0, "at least one partition group is required");
        FdTable {
            entries: Vec::new(),
            parts: (0..groups).map(|_| Partition::default()).collect(),
            poll_fds: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register a borrowed descriptor. The caller keeps ownership and must
    /// remove the entry before closing the descriptor. The duplicate guard
    /// scans the table, so registration cost is linear in its size.
    pub fn register(&mut self, fd: RawFd, events: i16, group: usize, token: u64) -> PollResult<usize> {
        self.register_entry(fd, events, group, token, None)
    }

    /// Register an owned socket. The table closes it when the entry is
    /// removed and dropped. On error the socket is dropped, which closes it.
    pub fn register_owned(&mut self, sock: Sock, events: i16, group: usize, token: u64) -> PollResult<usize> {
        let fd = sock.fd();
        self.register_entry(fd, events, group, token, Some(sock))
    }

    fn register_entry(
        &mut self,
        fd: RawFd,
        events: i16,
        group: usize,
        token: u64,
        sock: Option<Sock>,
    ) -> PollResult<usize> {
        if fd < 0 {
            return Err(PollError::Invalid("negative fd"));
        }
        if group >= self.parts.len() {
            return Err(PollError::Invalid("unknown partition group"));
        }
        if self.find(fd).is_some() {
            return Err(PollError::Duplicate(fd));
        }

        self.entries.push(FdEntry {
            fd,
            events,
            revents: 0,
            group,
            token,
            sock,
        });
        Ok(self.entries.len() - 1)
    }

    /// Index of the entry watching `fd`
    pub fn find(&self, fd: RawFd) -> Option<usize> {
        self.entries.iter().position(|e| e.fd == fd)
    }

    pub fn entry(&self, idx: usize) -> Option<&FdEntry> {
        self.entries.get(idx)
    }

    pub fn fd_at(&self, idx: usize) -> Option<RawFd> {
        self.entries.get(idx).map(|e| e.fd)
    }

    /// Remove an entry by index. The last entry is swapped into the vacated
    /// slot and every partition is repaired, so indices already handed out
    /// for other entries stay valid within the current cycle. Returns the
    /// owned socket if the entry held one.
    pub fn remove(&mut self, idx: usize) -> PollResult<Option<Sock>> {
        if idx >= self.entries.len() {
            return Err(PollError::StaleIndex(idx));
        }

        let entry = self.entries.swap_remove(idx);
        let moved_from = self.entries.len();
        for part in &mut self.parts {
            part.repair(idx, moved_from);
        }
        Ok(entry.sock)
    }

    /// Replace the interest mask. Setting an already-set mask is a no-op.
    pub fn set_interest(&mut self, idx: usize, events: i16) -> PollResult<()> {
        let entry = self
            .entries
            .get_mut(idx)
            .ok_or(PollError::StaleIndex(idx))?;
        entry.events = events;
        Ok(())
    }

    /// Add interest bits to an entry
    pub fn add_interest(&mut self, idx: usize, bits: i16) -> PollResult<()> {
        let entry = self
            .entries
            .get_mut(idx)
            .ok_or(PollError::StaleIndex(idx))?;
        entry.events |= bits;
        Ok(())
    }

    /// Clear interest bits on an entry
    pub fn clear_interest(&mut self, idx: usize, bits: i16) -> PollResult<()> {
        let entry = self
            .entries
            .get_mut(idx)
            .ok_or(PollError::StaleIndex(idx))?;
        entry.events &= !bits;
        Ok(())
    }

    pub fn has_interest(&self, idx: usize, bits: i16) -> bool {
        self.entries
            .get(idx)
            .map(|e| e.events & bits == bits)
            .unwrap_or(false)
    }

    /// Run one readiness cycle.
    ///
    /// A negative timeout selects `DEFAULT_TIMEOUT_MS`, zero returns
    /// immediately, positive waits up to that many milliseconds. All
    /// partitions are reset before the OS call. An interrupted call counts
    /// as an empty cycle. Returns the number of entries that reported any
    /// readiness.
    pub fn poll(&mut self, timeout_ms: i32) -> PollResult<usize> {
        let timeout = if timeout_ms < 0 {
            DEFAULT_TIMEOUT_MS
        } else {
            timeout_ms
        };

        let FdTable {
            entries,
            parts,
            poll_fds,
        } = self;

        for part in parts.iter_mut() {
            part.clear();
        }

        poll_fds.clear();
        for entry in entries.iter() {
            poll_fds.push(libc::pollfd {
                fd: entry.fd,
                events: entry.events,
                revents: 0,
            });
        }

        let nfds = unsafe {
            libc::poll(
                poll_fds.as_mut_ptr(),
                poll_fds.len() as libc::nfds_t,
                timeout,
            )
        };

        if nfds < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            log::error!("poll: {}", err);
            return Err(PollError::Sys(err));
        }

        let mut ready = 0usize;
        for (idx, pfd) in poll_fds.iter().enumerate() {
            let entry = &mut entries[idx];
            entry.revents = pfd.revents;
            if pfd.revents == 0 {
                continue;
            }
            ready += 1;

            let part = &mut parts[entry.group];
            if (pfd.revents & EV_ERR_MASK) != 0 {
                part.error.push_back(idx);
            }
            if (entry.events & EV_READ) != 0 && (pfd.revents & libc::POLLIN) != 0 {
                part.readable.push_back(idx);
            }
            if (entry.events & EV_WRITE) != 0 && (pfd.revents & libc::POLLOUT) != 0 {
                part.writable.push_back(idx);
            }
        }

        Ok(ready)
    }

    /// Next readable entry index in `group`, in poll order
    pub fn pop_readable(&mut self, group: usize) -> Option<usize> {
        self.parts.get_mut(group)?.readable.pop_front()
    }

    /// Next writable entry index in `group`, in poll order
    pub fn pop_writable(&mut self, group: usize) -> Option<usize> {
        self.parts.get_mut(group)?.writable.pop_front()
    }

    /// Next errored entry index in `group`, in poll order
    pub fn pop_error(&mut self, group: usize) -> Option<usize> {
        self.parts.get_mut(group)?.error.pop_front()
    }

    /// Pending (readable, writable, error) counts for `group`
    pub fn partition_sizes(&self, group: usize) -> Option<(usize, usize, usize)> {
        self.parts.get(group).map(|p| p.sizes())
    }
}
