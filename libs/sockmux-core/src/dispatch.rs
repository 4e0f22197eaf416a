//! Poll / accept / read / write dispatch loop
//!
//! One dispatcher drives every watched descriptor through a fixed cycle:
//! poll once, drain the listener accept queues, run the budgeted read pass
//! and hand buffered bytes to the application handler, arm write interest
//! for connections that queued output, flush writable connections, tear down
//! errored descriptors, then sweep out connections whose lifecycle finished.
//!
//! The handler receives each connection after new inbound bytes land. Its
//! return value is the number of inbound bytes to consume; a negative value
//! shuts the connection's read half. Unconsumed bytes stay buffered and are
//! offered again after the next read, which is the backpressure mechanism:
//! a slow handler makes the inbound buffer grow instead of losing bytes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::DispatchConfig;
use crate::conn::{buffered_read, buffered_write, Conn};
use crate::error::{PollError, PollResult};
use crate::poll::{FdTable, EV_READ, EV_WRITE};
use crate::sock::{accept_on, set_nonblocking, tcp_listen, Sock};
use crate::status::IoStatus;

/// Partition group for listener sockets
pub const GROUP_LISTENER: usize = 0;
/// Partition group for accepted client connections
pub const GROUP_CLIENT: usize = 1;

const GROUP_COUNT: usize = 2;

/// Application callback: inspects a connection's inbound buffer, queues any
/// response into the outbound buffer, and returns how many inbound bytes to
/// consume. A negative return shuts the read half of the connection.
pub type Handler = Box<dyn FnMut(&mut Conn) -> i64>;

/// Single-threaded socket multiplexer
pub struct Dispatcher {
    table: FdTable,
    conns: HashMap<RawFd, Conn>,
    handler: Handler,
    config: DispatchConfig,
    next_token: u64,
}

impl Dispatcher {
    /// Create a dispatcher. The configuration is validated up front.
    pub fn new(config: DispatchConfig, handler: Handler) -> PollResult<Self> {
        if let Err(e) = config.validate() {
            log::error!("dispatch configuration rejected: {}", e);
            return Err(PollError::Invalid("configuration failed validation"));
        }

        Ok(Dispatcher {
            table: FdTable::new(GROUP_COUNT),
            conns: HashMap::new(),
            handler,
            config,
            next_token: 1,
        })
    }

    /// Bind a TCP listener on `addr` and register it. Returns the bound
    /// address, which carries the actual port when `addr` asked for port 0.
    pub fn listen_on(&mut self, addr: SocketAddr) -> PollResult<SocketAddr> {
        let sock = tcp_listen(addr, self.config.accept_backlog)?;
        let bound = sock.local_addr()?;
        self.add_listener(sock)?;
        log::info!("listening on {}", bound);
        Ok(bound)
    }

    /// Register an already-bound listener socket
    pub fn add_listener(&mut self, sock: Sock) -> PollResult<usize> {
        set_nonblocking(sock.fd())?;
        self.table.register_owned(sock, EV_READ, GROUP_LISTENER, 0)
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    pub fn conn(&self, fd: RawFd) -> Option<&Conn> {
        self.conns.get(&fd)
    }

    pub fn conn_mut(&mut self, fd: RawFd) -> Option<&mut Conn> {
        self.conns.get_mut(&fd)
    }

    /// Descriptors of all live connections, in no particular order
    pub fn conn_fds(&self) -> Vec<RawFd> {
        self.conns.keys().copied().collect()
    }

    pub fn table(&self) -> &FdTable {
        &self.table
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Remove a connection immediately, closing its descriptor and
    /// discarding both buffers. Returns whether the connection existed.
    pub fn drop_conn(&mut self, fd: RawFd) -> bool {
        self.remove_conn(fd)
    }

    /// Run one full dispatch cycle. Returns the number of descriptors that
    /// reported readiness.
    pub fn run_once(&mut self, timeout_ms: i32) -> PollResult<usize> {
        let ready = self.table.poll(timeout_ms)?;

        self.accept_pass();
        self.read_pass();
        self.arm_writes();
        self.write_pass();
        self.error_pass();
        self.sweep();

        Ok(ready)
    }

    /// Run dispatch cycles until `shutdown` is set
    pub fn run(&mut self, shutdown: &AtomicBool) -> PollResult<()> {
        log::info!("dispatch loop running");
        while !shutdown.load(Ordering::SeqCst) {
            self.run_once(self.config.poll_timeout_ms)?;
        }
        log::info!(
            "dispatch loop stopped, {} connections still open",
            self.conns.len()
        );
        Ok(())
    }

    /// Drain every listener's accept queue and register new connections
    fn accept_pass(&mut self) {
        while let Some(idx) = self.table.pop_readable(GROUP_LISTENER) {
            let lfd = match self.table.fd_at(idx) {
                Some(fd) => fd,
                None => continue,
            };

            loop {
                match accept_on(lfd) {
                    Ok(Some((sock, peer))) => {
                        let fd = sock.fd();
                        let token = self.next_token;
                        match self.table.register_owned(sock, EV_READ, GROUP_CLIENT, token) {
                            Ok(_) => {
                                self.next_token += 1;
                                self.conns
                                    .insert(fd, Conn::new(fd, self.config.granularity));
                                log::debug!("conn#{} accepted from {} (fd={})", token, peer, fd);
                            }
                            Err(e) => {
                                log::error!("connection from {} dropped: {}", peer, e);
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::error!("accept on fd={}: {}", lfd, e);
                        break;
                    }
                }
            }
        }
    }

    /// Budgeted read pass over readable client connections.
    ///
    /// The handler runs before any end-of-stream transition so it can
    /// consume the final bytes a closing peer sent.
    fn read_pass(&mut self) {
        while let Some(idx) = self.table.pop_readable(GROUP_CLIENT) {
            let fd = match self.table.fd_at(idx) {
                Some(fd) => fd,
                None => continue,
            };
            let conn = match self.conns.get_mut(&fd) {
                Some(conn) => conn,
                None => continue,
            };

            let status = buffered_read(fd, &mut conn.inbuf, self.config.read_budget);
            if self.config.log_io {
                log::trace!(
                    "read pass fd={} status={} buffered={}",
                    fd,
                    status,
                    conn.inbuf.len()
                );
            }

            if !conn.inbuf.is_empty() {
                let rc = (self.handler)(conn);
                if rc < 0 {
                    log::debug!("fd={}: handler requested read shutdown", fd);
                    self.shut_read(fd);
                    continue;
                }
                conn.consume_inbound(rc as usize);
            }

            match status {
                IoStatus::Eof => {
                    log::debug!("fd={}: peer closed its sending half", fd);
                    self.shut_read(fd);
                }
                IoStatus::Error => {
                    self.shut_read(fd);
                }
                _ => {}
            }
        }
    }

    /// Arm write interest for connections that queued outbound bytes.
    /// An already-armed entry is never re-armed.
    fn arm_writes(&mut self) {
        for idx in 0..self.table.len() {
            let (fd, armed) = match self.table.entry(idx) {
                Some(e) if e.group == GROUP_CLIENT => (e.fd, e.events & EV_WRITE != 0),
                _ => continue,
            };
            if armed {
                continue;
            }

            let wants = self
                .conns
                .get(&fd)
                .map_or(false, |c| !c.outbuf.is_empty() && !c.is_write_closed());
            if !wants {
                continue;
            }

            if let Err(e) = self.table.add_interest(idx, EV_WRITE) {
                log::error!("arm write interest fd={}: {}", fd, e);
            } else if self.config.log_io {
                log::trace!("fd={} write interest armed", fd);
            }
        }
    }

    /// Flush writable client connections and disarm the drained ones
    fn write_pass(&mut self) {
        while let Some(idx) = self.table.pop_writable(GROUP_CLIENT) {
            let fd = match self.table.fd_at(idx) {
                Some(fd) => fd,
                None => continue,
            };
            let conn = match self.conns.get_mut(&fd) {
                Some(conn) => conn,
                None => continue,
            };

            let status = buffered_write(fd, &mut conn.outbuf);
            if self.config.log_io {
                log::trace!(
                    "write pass fd={} status={} queued={}",
                    fd,
                    status,
                    conn.outbuf.len()
                );
            }

            match status {
                IoStatus::Ok => {
                    if let Err(e) = self.table.clear_interest(idx, EV_WRITE) {
                        log::error!("disarm write interest fd={}: {}", fd, e);
                    }
                }
                IoStatus::Wait => {}
                _ => {
                    conn.close_write();
                    conn.outbuf.clear();
                    if let Err(e) = self.table.clear_interest(idx, EV_WRITE) {
                        log::error!("disarm write interest fd={}: {}", fd, e);
                    }
                }
            }
        }
    }

    /// Tear down descriptors the OS flagged as errored, hung up or invalid.
    /// Runs after the read pass, so final readable bytes were delivered.
    fn error_pass(&mut self) {
        while let Some(idx) = self.table.pop_error(GROUP_LISTENER) {
            let fd = self.table.fd_at(idx).unwrap_or(-1);
            let revents = self.table.entry(idx).map(|e| e.revents).unwrap_or(0);
            log::error!("listener fd={} reported error readiness {:#06x}", fd, revents);
        }

        while let Some(idx) = self.table.pop_error(GROUP_CLIENT) {
            let fd = match self.table.fd_at(idx) {
                Some(fd) => fd,
                None => continue,
            };
            if let Some(conn) = self.conns.get_mut(&fd) {
                let dropped = conn.outbuf.len();
                conn.mark_closed();
                conn.outbuf.clear();
                if dropped > 0 {
                    log::warn!(
                        "fd={}: error readiness, {} undelivered bytes discarded",
                        fd,
                        dropped
                    );
                } else {
                    log::debug!("fd={}: error readiness, tearing down", fd);
                }
            }
        }
    }

    /// Remove connections whose lifecycle finished: both halves closed, or
    /// the read half closed with nothing left to flush.
    fn sweep(&mut self) {
        let mut dead: Vec<RawFd> = Vec::new();
        for (fd, conn) in &self.conns {
            if !conn.is_read_closed() {
                continue;
            }
            if conn.is_write_closed() || (conn.outbuf.is_empty() && !self.write_armed(*fd)) {
                dead.push(*fd);
            }
        }
        for fd in dead {
            self.remove_conn(fd);
        }
    }

    fn write_armed(&self, fd: RawFd) -> bool {
        match self.table.find(fd) {
            Some(idx) => self.table.has_interest(idx, EV_WRITE),
            None => false,
        }
    }

    fn shut_read(&mut self, fd: RawFd) {
        if let Some(idx) = self.table.find(fd) {
            if let Err(e) = self.table.clear_interest(idx, EV_READ) {
                log::error!("clear read interest fd={}: {}", fd, e);
            }
        }
        if let Some(conn) = self.conns.get_mut(&fd) {
            conn.close_read();
        }
    }

    fn remove_conn(&mut self, fd: RawFd) -> bool {
        let mut existed = false;

        if let Some(idx) = self.table.find(fd) {
            match self.table.remove(idx) {
                Ok(sock) => {
                    existed = true;
                    drop(sock);
                }
                Err(e) => log::error!("remove table entry fd={}: {}", fd, e),
            }
        }

        if let Some(mut conn) = self.conns.remove(&fd) {
            existed = true;
            conn.mark_closed();
            log::debug!(
                "fd={} closed, {} bytes consumed over its lifetime",
                fd,
                conn.consumed_total()
            );
        }

        existed
    }
}
