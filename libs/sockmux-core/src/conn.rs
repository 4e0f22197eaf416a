//! Connection state and buffered I/O
//!
//! A connection couples one non-blocking stream descriptor with two
//! granularity-grown byte buffers and a pair of half-close flags. The
//! buffered read and write primitives move bytes between the descriptor and
//! a buffer, classify every syscall outcome into an `IoStatus`, and log
//! descriptor errors once at the point of failure.

use std::any::Any;
use std::io;
use std::os::unix::io::RawFd;

use crate::buf::GrowBuf;
use crate::sock::{sock_read, sock_write};
use crate::status::IoStatus;

/// Connection lifecycle, derived from the two half-close flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Both directions open
    Active,
    /// Inbound direction shut: no further reads are attempted
    ReadHalfClosed,
    /// Outbound direction shut: queued bytes were discarded
    WriteHalfClosed,
    /// Both directions shut, eligible for removal
    Closed,
}

/// One buffered, half-close-aware connection
pub struct Conn {
    fd: RawFd,
    read_closed: bool,
    write_closed: bool,
    /// Bytes received and not yet consumed by the handler
    pub inbuf: GrowBuf,
    /// Bytes queued for delivery to the peer
    pub outbuf: GrowBuf,
    /// Running total of handler-consumed inbound bytes
    consumed_total: u64,
    /// Opaque per-connection payload for the host application
    pub user_data: Option<Box<dyn Any>>,
}

impl Conn {
    pub fn new(fd: RawFd, granularity: usize) -> Self {
        Conn {
            fd,
            read_closed: false,
            write_closed: false,
            inbuf: GrowBuf::new(granularity),
            outbuf: GrowBuf::new(granularity),
            consumed_total: 0,
            user_data: None,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn state(&self) -> ConnState {
        match (self.read_closed, self.write_closed) {
            (false, false) => ConnState::Active,
            (true, false) => ConnState::ReadHalfClosed,
            (false, true) => ConnState::WriteHalfClosed,
            (true, true) => ConnState::Closed,
        }
    }

    pub fn is_read_closed(&self) -> bool {
        self.read_closed
    }

    pub fn is_write_closed(&self) -> bool {
        self.write_closed
    }

    /// Shut the inbound direction. The descriptor stays open so queued
    /// outbound bytes can still drain.
    pub fn close_read(&mut self) {
        self.read_closed = true;
    }

    /// Shut the outbound direction
    pub fn close_write(&mut self) {
        self.write_closed = true;
    }

    /// Shut both directions
    pub fn mark_closed(&mut self) {
        self.read_closed = true;
        self.write_closed = true;
    }

    pub fn consumed_total(&self) -> u64 {
        self.consumed_total
    }

    /// Drop a consumed prefix from the inbound buffer and account for it.
    /// Requests beyond the buffered length are clamped.
    pub fn consume_inbound(&mut self, n: usize) -> usize {
        let taken = self.inbuf.consume(n);
        if taken < n {
            log::debug!(
                "fd={}: consume of {} clamped to {} buffered bytes",
                self.fd,
                n,
                taken
            );
        }
        self.consumed_total += taken as u64;
        taken
    }
}

/// Read from `fd` into `buf` until `max_bytes` new bytes arrive, the
/// descriptor runs dry, or the stream ends.
///
/// Short reads are re-issued, so a single call drains everything the kernel
/// has buffered up to the cap. Bytes already appended are always retained,
/// whatever the final status:
///
/// - `Ok`: the cap was reached, more may be pending
/// - `Wait`: the descriptor would block
/// - `Eof`: the peer shut its sending half
/// - `Error`: descriptor failure, already logged
/// - `Invalid`: negative descriptor
pub fn buffered_read(fd: RawFd, buf: &mut GrowBuf, max_bytes: usize) -> IoStatus {
    if fd < 0 {
        log::error!("buffered read on invalid fd {}", fd);
        return IoStatus::Invalid;
    }
    if max_bytes == 0 {
        return IoStatus::Ok;
    }

    let mut appended = 0usize;
    loop {
        let want = max_bytes - appended;
        let space = buf.reserve_tail(1);
        let cap = space.len().min(want);
        let n = sock_read(fd, &mut space[..cap]);

        if n == 0 {
            return IoStatus::Eof;
        }
        if n < 0 {
            let err = io::Error::last_os_error();
            let errno = err.raw_os_error().unwrap_or(0);
            if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                return IoStatus::Wait;
            }
            if errno == libc::EINTR {
                continue;
            }
            log::error!("read fd={}: {}", fd, err);
            return IoStatus::Error;
        }

        buf.advance_tail(n as usize);
        appended += n as usize;
        if appended >= max_bytes {
            return IoStatus::Ok;
        }
    }
}

/// Write the unconsumed contents of `buf` to `fd`, consuming exactly the
/// prefix the kernel accepted.
///
/// - `Ok`: the buffer drained completely
/// - `Wait`: the descriptor stopped accepting bytes, remainder kept
/// - `Error`: descriptor failure, already logged
/// - `Invalid`: negative descriptor
pub fn buffered_write(fd: RawFd, buf: &mut GrowBuf) -> IoStatus {
    if fd < 0 {
        log::error!("buffered write on invalid fd {}", fd);
        return IoStatus::Invalid;
    }

    loop {
        if buf.is_empty() {
            return IoStatus::Ok;
        }

        let n = sock_write(fd, buf.data());
        if n < 0 {
            let err = io::Error::last_os_error();
            let errno = err.raw_os_error().unwrap_or(0);
            if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                return IoStatus::Wait;
            }
            if errno == libc::EINTR {
                continue;
            }
            log::error!("write fd={}: {}", fd, err);
            return IoStatus::Error;
        }
        if n == 0 {
            return IoStatus::Wait;
        }

        buf.consume(n as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sock::{set_nonblocking, Sock};

    fn nonblocking_pipe() -> (RawFd, RawFd) {
        let mut fds: [RawFd; 2] = [-1, -1];
        let rv = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rv, 0);
        set_nonblocking(fds[0]).unwrap();
        set_nonblocking(fds[1]).unwrap();
        (fds[0], fds[1])
    }

    fn nonblocking_socketpair() -> (Sock, Sock) {
        let mut fds: [RawFd; 2] = [-1, -1];
        let rv = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rv, 0);
        set_nonblocking(fds[0]).unwrap();
        set_nonblocking(fds[1]).unwrap();
        (Sock::from_raw(fds[0]), Sock::from_raw(fds[1]))
    }

    fn close_fd(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_state_from_half_close_flags() {
        let mut conn = Conn::new(5, 64);
        assert_eq!(conn.state(), ConnState::Active);

        conn.close_read();
        assert_eq!(conn.state(), ConnState::ReadHalfClosed);

        conn.close_write();
        assert_eq!(conn.state(), ConnState::Closed);

        let mut conn = Conn::new(6, 64);
        conn.close_write();
        assert_eq!(conn.state(), ConnState::WriteHalfClosed);

        let mut conn = Conn::new(7, 64);
        conn.mark_closed();
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[test]
    fn test_consume_inbound_accounting() {
        let mut conn = Conn::new(5, 64);
        conn.inbuf.append(b"hello\n");
        assert_eq!(conn.consume_inbound(6), 6);
        assert_eq!(conn.consumed_total(), 6);

        conn.inbuf.append(b"hi");
        // Over-consumption is clamped to what is buffered
        assert_eq!(conn.consume_inbound(50), 2);
        assert_eq!(conn.consumed_total(), 8);
    }

    #[test]
    fn test_user_data_round_trip() {
        let mut conn = Conn::new(5, 64);
        assert!(conn.user_data.is_none());
        conn.user_data = Some(Box::new(String::from("session-9")));
        let s = conn
            .user_data
            .as_ref()
            .and_then(|d| d.downcast_ref::<String>())
            .unwrap();
        assert_eq!(s, "session-9");
    }

    #[test]
    fn test_buffered_read_rejects_invalid_fd() {
        let mut buf = GrowBuf::new(64);
        assert_eq!(buffered_read(-1, &mut buf, 100), IoStatus::Invalid);
    }

    #[test]
    fn test_buffered_write_rejects_invalid_fd() {
        let mut buf = GrowBuf::new(64);
        buf.append(b"data");
        assert_eq!(buffered_write(-1, &mut buf), IoStatus::Invalid);
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_buffered_read_zero_budget_is_ok() {
        let (rd, wr) = nonblocking_pipe();
        let mut buf = GrowBuf::new(64);
        assert_eq!(buffered_read(rd, &mut buf, 0), IoStatus::Ok);
        assert!(buf.is_empty());
        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn test_buffered_read_drains_then_waits() {
        let (rd, wr) = nonblocking_pipe();
        let n = unsafe { libc::write(wr, b"hello".as_ptr() as *const _, 5) };
        assert_eq!(n, 5);

        let mut buf = GrowBuf::new(64);
        let status = buffered_read(rd, &mut buf, 100);
        assert_eq!(status, IoStatus::Wait);
        assert_eq!(buf.data(), b"hello");

        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn test_buffered_read_respects_budget() {
        let (rd, wr) = nonblocking_pipe();
        let n = unsafe { libc::write(wr, b"0123456789".as_ptr() as *const _, 10) };
        assert_eq!(n, 10);

        let mut buf = GrowBuf::new(64);
        assert_eq!(buffered_read(rd, &mut buf, 4), IoStatus::Ok);
        assert_eq!(buf.data(), b"0123");

        // The remainder is still in the kernel for the next call
        assert_eq!(buffered_read(rd, &mut buf, 100), IoStatus::Wait);
        assert_eq!(buf.data(), b"0123456789");

        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn test_buffered_read_reports_eof_and_keeps_bytes() {
        let (rd, wr) = nonblocking_pipe();
        let n = unsafe { libc::write(wr, b"bye".as_ptr() as *const _, 3) };
        assert_eq!(n, 3);
        close_fd(wr);

        let mut buf = GrowBuf::new(64);
        let status = buffered_read(rd, &mut buf, 100);
        assert_eq!(status, IoStatus::Eof);
        assert_eq!(buf.data(), b"bye");

        close_fd(rd);
    }

    #[test]
    fn test_buffered_write_empty_is_ok() {
        let (a, _b) = nonblocking_socketpair();
        let mut buf = GrowBuf::new(64);
        assert_eq!(buffered_write(a.fd(), &mut buf), IoStatus::Ok);
    }

    #[test]
    fn test_buffered_write_consumes_sent_prefix() {
        let (a, b) = nonblocking_socketpair();
        let mut buf = GrowBuf::new(64);
        buf.append(b"ping");
        assert_eq!(buffered_write(a.fd(), &mut buf), IoStatus::Ok);
        assert!(buf.is_empty());

        let mut recv = [0u8; 16];
        let n = sock_read(b.fd(), &mut recv);
        assert_eq!(n, 4);
        assert_eq!(&recv[..4], b"ping");
    }

    #[test]
    fn test_buffered_write_backpressure_round_trips_all_bytes() {
        let (a, b) = nonblocking_socketpair();
        crate::sock::set_send_buf(a.fd(), 4096).unwrap();

        let payload = vec![0xabu8; 200_000];
        let mut buf = GrowBuf::new(1024);
        buf.append(&payload);

        let mut received = 0usize;
        let mut waits = 0usize;
        let mut chunk = [0u8; 8192];
        for _ in 0..100_000 {
            match buffered_write(a.fd(), &mut buf) {
                IoStatus::Ok => {
                    if buf.is_empty() {
                        break;
                    }
                }
                IoStatus::Wait => waits += 1,
                other => panic!("unexpected write status {:?}", other),
            }
            loop {
                let n = sock_read(b.fd(), &mut chunk);
                if n <= 0 {
                    break;
                }
                received += n as usize;
            }
        }
        // Drain whatever is still in flight after the final Ok
        loop {
            let n = sock_read(b.fd(), &mut chunk);
            if n <= 0 {
                break;
            }
            received += n as usize;
        }

        assert!(buf.is_empty());
        assert!(waits > 0, "expected at least one would-block cycle");
        assert_eq!(received, payload.len());
    }

    #[test]
    fn test_buffered_write_error_on_closed_peer() {
        let (a, b) = nonblocking_socketpair();
        drop(b);

        let mut buf = GrowBuf::new(64);
        buf.append(b"doomed");
        assert_eq!(buffered_write(a.fd(), &mut buf), IoStatus::Error);
    }
}
