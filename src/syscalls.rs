// src/syscalls.rs
use crate::error::VaranResult;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::RawFd;
use std::ptr;
use std::time::{SystemTime, UNIX_EPOCH};

// ---- Socket Operations ----

/// Create a TCP listener bound to `host:port` with SO_REUSEADDR.
///
/// `nonblocking` selects SOCK_NONBLOCK on the listener itself; accepted
/// sockets choose their own mode in [`accept_connection`].
pub fn create_listen_socket(host: &str, port: u16, nonblocking: bool) -> VaranResult<RawFd> {
    let addr_str = format!("{}:{}", host, port);
    let addr: SocketAddr = addr_str
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let sock_type = if nonblocking {
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK
    } else {
        libc::SOCK_STREAM
    };

    unsafe {
        let fd = libc::socket(domain, sock_type, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        bind_addr(fd, &addr)?;

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> VaranResult<()> {
    unsafe {
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
                if libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                ) < 0
                {
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err.into());
                }
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
                if libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                ) < 0
                {
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }
}

fn storage_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

/// Address a bound socket actually listens on (resolves port 0 binds).
pub fn local_addr(fd: RawFd) -> VaranResult<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    unsafe {
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    storage_to_addr(&storage)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown address family").into())
}

/// Accept one pending connection, returning the new descriptor and the
/// peer address. `Ok(None)` means no connection was pending (or the
/// listener's receive timeout elapsed).
pub fn accept_connection(listen_fd: RawFd, nonblocking: bool) -> VaranResult<Option<(RawFd, IpAddr)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

    let flags = if nonblocking { libc::SOCK_NONBLOCK } else { 0 };

    unsafe {
        let fd = libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            flags,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::Interrupted {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            let ip = storage_to_addr(&storage)
                .map(|a| a.ip())
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
            Ok(Some((fd, ip)))
        }
    }
}

pub fn set_nonblocking(fd: RawFd) -> VaranResult<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Apply SO_RCVTIMEO / SO_SNDTIMEO (microseconds) to a blocking socket.
pub fn set_socket_timeout(fd: RawFd, timeout_us: i64) -> VaranResult<()> {
    let tv = libc::timeval {
        tv_sec: timeout_us / 1_000_000,
        tv_usec: timeout_us % 1_000_000,
    };
    unsafe {
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const _ as *const c_void,
            mem::size_of_val(&tv) as socklen_t,
        ) < 0
            || libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDTIMEO,
                &tv as *const _ as *const c_void,
                mem::size_of_val(&tv) as socklen_t,
            ) < 0
        {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

pub fn shutdown_fd(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_RDWR);
    }
}

/// Writing to a peer that already went away must surface as EPIPE, not
/// kill the process.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

// ---- Raw I/O ----

/// One read attempt. `Ok(0)` means the peer closed; WouldBlock and
/// Interrupted come back as errors for the caller to interpret.
pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

/// One write attempt, same error convention as [`read_fd`].
pub fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    unsafe {
        let res = libc::write(fd, buf.as_ptr() as *const c_void, buf.len());
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

// ---- Epoll Operations ----

pub struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub fn new() -> VaranResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(0);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    /// Register a descriptor. The caller picks the trigger mode by
    /// including EPOLLET in `interests` or not; the token is the fd.
    pub fn add(&self, fd: RawFd, interests: u32) -> VaranResult<()> {
        let mut event = libc::epoll_event {
            events: interests,
            u64: fd as u64,
        };

        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> VaranResult<()> {
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

    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> VaranResult<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
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

// ---- Wakeup Pipe ----

/// Self-pipe registered in the multiplexer so queue producers can break
/// the I/O thread out of its wait.
pub struct WakePipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakePipe {
    pub fn new() -> VaranResult<Self> {
        let mut fds = [0 as c_int; 2];
        unsafe {
            if libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) < 0 {
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

    /// Wake the I/O thread. A full pipe already holds a pending wakeup,
    /// so EAGAIN is success.
    pub fn notify(&self) {
        let b = [b'w'];
        loop {
            match write_fd(self.write_fd, &b) {
                Ok(_) => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    tracing::error!("wakeup pipe write failed: {}", e);
                    return;
                }
            }
        }
    }

    /// Drain all pending wakeup bytes; the payload itself carries no
    /// information.
    pub fn drain(&self) {
        let mut buf = [0u8; 1024];
        loop {
            match read_fd(self.read_fd, &mut buf) {
                Ok(n) if n == buf.len() => continue,
                Ok(_) => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    tracing::error!("wakeup pipe read failed: {}", e);
                    return;
                }
            }
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

// ---- Clocks & Process Accounting ----

/// Microsecond wall clock used for connection lifetime stamps.
pub fn fine_clock_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Seconds of user and system CPU time consumed by this process.
pub fn rusage_self() -> (i64, i64) {
    let mut usage: libc::rusage = unsafe { mem::zeroed() };
    unsafe {
        libc::getrusage(libc::RUSAGE_SELF, &mut usage);
    }
    (usage.ru_utime.tv_sec, usage.ru_stime.tv_sec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_binds_ephemeral_port() {
        let fd = create_listen_socket("127.0.0.1", 0, true).unwrap();
        let addr = local_addr(fd).unwrap();
        assert!(addr.port() != 0);
        assert!(addr.ip().is_loopback());
        close_fd(fd);
    }

    #[test]
    fn wake_pipe_round_trip() {
        let pipe = WakePipe::new().unwrap();
        pipe.notify();
        pipe.notify();
        let mut buf = [0u8; 8];
        let n = read_fd(pipe.read_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ww");
        pipe.drain();
    }
}
