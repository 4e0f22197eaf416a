//! Socket plumbing
//!
//! Owning descriptor wrapper plus the small set of raw socket operations the
//! multiplexer needs: non-blocking mode, listener setup, non-blocking accept,
//! and thin read/write wrappers that surface the raw syscall result.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;

/// Invalid descriptor constant
pub const INVALID_FD: RawFd = -1;

/// Owning socket handle. Closes the descriptor on drop.
#[derive(Debug)]
pub struct Sock {
    fd: RawFd,
}

impl Sock {
    /// Take ownership of an already-open descriptor
    pub fn from_raw(fd: RawFd) -> Self {
        Sock { fd }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_valid(&self) -> bool {
        self.fd != INVALID_FD
    }

    /// Accept one pending connection, if any. Returns `Ok(None)` when the
    /// accept queue is empty. The accepted descriptor is switched to
    /// non-blocking close-on-exec before it is returned.
    pub fn accept(&self) -> io::Result<Option<(Sock, SocketAddr)>> {
        accept_on(self.fd)
    }

    /// Locally bound address, from getsockname
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut addrlen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        let rv = unsafe {
            libc::getsockname(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut addrlen,
            )
        };
        if rv != 0 {
            return Err(io::Error::last_os_error());
        }

        raw_to_sockaddr(&storage).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "unsupported address family")
        })
    }
}

impl Drop for Sock {
    fn drop(&mut self) {
        if self.fd != INVALID_FD {
            unsafe { libc::close(self.fd) };
            self.fd = INVALID_FD;
        }
    }
}

/// Set O_NONBLOCK, leaving the flag untouched if already present
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    use libc::{fcntl, F_GETFL, F_SETFL, O_NONBLOCK};

    unsafe {
        let flags = fcntl(fd, F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }

        if (flags & O_NONBLOCK) == 0 {
            let rv = fcntl(fd, F_SETFL, flags | O_NONBLOCK);
            if rv != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }

    Ok(())
}

/// Set FD_CLOEXEC, leaving the flag untouched if already present
pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    use libc::{fcntl, FD_CLOEXEC, F_GETFD, F_SETFD};

    unsafe {
        let flags = fcntl(fd, F_GETFD);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }

        if (flags & FD_CLOEXEC) == 0 {
            let rv = fcntl(fd, F_SETFD, flags | FD_CLOEXEC);
            if rv != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }

    Ok(())
}

fn set_sockopt_i32(fd: RawFd, level: i32, name: i32, value: i32) -> io::Result<()> {
    let rv = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };

    if rv != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Set SO_REUSEADDR
pub fn set_reuseaddr(fd: RawFd, on: bool) -> io::Result<()> {
    set_sockopt_i32(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on as i32)
}

/// Set TCP_NODELAY
pub fn set_nodelay(fd: RawFd, on: bool) -> io::Result<()> {
    set_sockopt_i32(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as i32)
}

/// Set SO_SNDBUF
pub fn set_send_buf(fd: RawFd, bytes: i32) -> io::Result<()> {
    set_sockopt_i32(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, bytes)
}

/// Create a non-blocking TCP listener bound to `addr`
pub fn tcp_listen(addr: SocketAddr, backlog: i32) -> io::Result<Sock> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let sock = Sock::from_raw(fd);

    set_reuseaddr(sock.fd(), true)?;
    set_nodelay(sock.fd(), true)?;

    let (storage, addrlen) = sockaddr_to_raw(&addr);
    let rv = unsafe {
        libc::bind(
            sock.fd(),
            &storage as *const _ as *const libc::sockaddr,
            addrlen,
        )
    };
    if rv != 0 {
        return Err(io::Error::last_os_error());
    }

    let rv = unsafe { libc::listen(sock.fd(), backlog) };
    if rv < 0 {
        return Err(io::Error::last_os_error());
    }

    set_nonblocking(sock.fd())?;
    set_cloexec(sock.fd())?;

    Ok(sock)
}

/// Accept one pending connection on `fd`. `Ok(None)` when the queue is empty.
pub fn accept_on(fd: RawFd) -> io::Result<Option<(Sock, SocketAddr)>> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut addrlen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let new_fd = unsafe {
        libc::accept(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut addrlen,
        )
    };

    if new_fd < 0 {
        let err = io::Error::last_os_error();
        let errno = err.raw_os_error().unwrap_or(0);
        if errno == libc::EAGAIN
            || errno == libc::EWOULDBLOCK
            || errno == libc::EINTR
            || errno == libc::ECONNABORTED
        {
            return Ok(None);
        }
        return Err(err);
    }

    let sock = Sock::from_raw(new_fd);
    set_nonblocking(sock.fd())?;
    set_cloexec(sock.fd())?;

    let peer = raw_to_sockaddr(&storage)
        .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));

    Ok(Some((sock, peer)))
}

/// Read from a descriptor, surfacing the raw syscall result
pub fn sock_read(fd: RawFd, buf: &mut [u8]) -> isize {
    unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) }
}

/// Write to a descriptor, surfacing the raw syscall result
pub fn sock_write(fd: RawFd, buf: &[u8]) -> isize {
    unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) }
}

/// Convert a socket address into zeroed sockaddr storage plus its length
fn sockaddr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };

    match addr {
        SocketAddr::V4(v4) => {
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
            let sin: libc::sockaddr_in = libc::sockaddr_in {
                sin_len: std::mem::size_of::<libc::sockaddr_in>() as u8,
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            #[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd")))]
            let sin: libc::sockaddr_in = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin as *const libc::sockaddr_in as *const u8,
                    &mut storage as *mut libc::sockaddr_storage as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in>(),
                );
            }
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
            let sin6: libc::sockaddr_in6 = libc::sockaddr_in6 {
                sin6_len: std::mem::size_of::<libc::sockaddr_in6>() as u8,
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            #[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd")))]
            let sin6: libc::sockaddr_in6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin6 as *const libc::sockaddr_in6 as *const u8,
                    &mut storage as *mut libc::sockaddr_storage as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in6>(),
                );
            }
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// Convert raw sockaddr storage back to a socket address
fn raw_to_sockaddr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            let port = u16::from_be(sin.sin_port);
            Some(SocketAddr::from((ip, port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            let port = u16::from_be(sin6.sin6_port);
            Some(SocketAddr::from((ip, port)))
        }
        _ => None,
    }
}
