// src/syscalls.rs
use crate::error::EtudeResult;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::ptr;

pub use libc::epoll_event;

// ---- Socket Operations ----

/// Create a non-blocking TCP listening socket with SO_REUSEADDR.
pub fn create_listen_socket(addr: &SocketAddr, backlog: c_int) -> EtudeResult<OwnedFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        // 1. Atomic non-blocking, close-on-exec socket
        let fd = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // From here on the fd is closed on every early return.
        let owned = OwnedFd::from_raw_fd(fd);

        // 2. Port reuse across restarts
        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error().into());
        }

        // 3. Bind
        bind_addr(fd, addr)?;

        // 4. Listen
        if libc::listen(fd, backlog) < 0 {
            return Err(io::Error::last_os_error().into());
        }

        Ok(owned)
    }
}

/// Bind a socket to an address.
fn bind_addr(fd: c_int, addr: &SocketAddr) -> EtudeResult<()> {
    let res = unsafe {
        match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                )
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                )
            }
        }
    };
    if res < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

// ---- Epoll Operations ----

/// Interest set for a connection waiting to read: edge-triggered, one-shot.
pub const CONN_READ: u32 =
    (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLET | libc::EPOLLONESHOT) as u32;
/// Interest set for a connection waiting to write: edge-triggered, one-shot.
pub const CONN_WRITE: u32 =
    (libc::EPOLLOUT | libc::EPOLLRDHUP | libc::EPOLLET | libc::EPOLLONESHOT) as u32;
/// Level-triggered readability, for the listener and the wake pipe.
pub const LEVEL_READ: u32 = libc::EPOLLIN as u32;

pub const EV_READ: u32 = libc::EPOLLIN as u32;
pub const EV_WRITE: u32 = libc::EPOLLOUT as u32;
/// Peer hang-up or socket error.
pub const EV_CLOSED: u32 = (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32;

pub struct Epoll {
    pub fd: c_int,
}

impl Epoll {
    pub fn new() -> EtudeResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    fn ctl(&self, op: c_int, fd: RawFd, token: u64, events: u32) -> EtudeResult<()> {
        let mut event = epoll_event { events, u64: token };
        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn add(&self, fd: RawFd, token: u64, events: u32) -> EtudeResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, events)
    }

    /// Re-arms a one-shot registration with a new interest set.
    pub fn modify(&self, fd: RawFd, token: u64, events: u32) -> EtudeResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, events)
    }

    pub fn delete(&self, fd: RawFd) -> EtudeResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Interrupted waits report zero events.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> EtudeResult<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len().min(c_int::MAX as usize) as c_int,
                timeout_ms,
            );

            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }

            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Wake Pipe ----

/// Self-pipe used by workers to wake the readiness loop.
///
/// Both ends are non-blocking: a full pipe already guarantees a pending wakeup.
pub struct Waker {
    read_fd: c_int,
    write_fd: c_int,
}

impl Waker {
    pub fn new() -> EtudeResult<Self> {
        let mut fds = [0 as c_int; 2];
        unsafe {
            if libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    pub fn wake(&self) {
        let byte = [1u8];
        unsafe {
            // EAGAIN means the loop has unread wakeups already.
            libc::write(self.write_fd, byte.as_ptr() as *const c_void, 1);
        }
    }

    /// Empties the pipe so level-triggered readiness clears.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waker_wakes_epoll() {
        let epoll = Epoll::new().unwrap();
        let waker = Waker::new().unwrap();
        epoll.add(waker.read_fd(), 42, LEVEL_READ).unwrap();

        let mut events = vec![epoll_event { events: 0, u64: 0 }; 8];
        assert_eq!(epoll.wait(&mut events, 0).unwrap(), 0);

        waker.wake();
        waker.wake();
        assert_eq!(epoll.wait(&mut events, 1000).unwrap(), 1);
        let token = events[0].u64;
        assert_eq!(token, 42);

        waker.drain();
        assert_eq!(epoll.wait(&mut events, 0).unwrap(), 0);
    }

    #[test]
    fn test_listen_socket_binds_ephemeral_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let fd = create_listen_socket(&addr, 16).unwrap();
        let listener = std::net::TcpListener::from(fd);
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
