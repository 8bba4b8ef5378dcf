// src/syscalls.rs
use crate::error::{EtudeError, EtudeResult};
use libc::{c_int, c_void, socklen_t};
use std::fs::File;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, RawFd};
use std::ptr;

#[cfg(not(target_os = "linux"))]
compile_error!("etude drives epoll directly and only builds on Linux");

/// Pending-connection queue length for the listening socket.
pub const LISTEN_BACKLOG: c_int = 64;

// ---- Owned descriptors ----

/// An owned file descriptor, closed on drop.
#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
}

impl Socket {
    /// Take ownership of `fd`. The caller must not close it afterwards.
    pub fn from_raw(fd: RawFd) -> Self {
        Self { fd }
    }

    #[inline(always)]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Shut down both directions without releasing the descriptor, so that
    /// a thread still holding it sees errors instead of a recycled fd.
    pub fn shutdown(&self) {
        unsafe {
            libc::shutdown(self.fd, libc::SHUT_RDWR);
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Socket Operations ----

/// Create the non-blocking IPv4 listening socket on `0.0.0.0:port`.
///
/// `SO_REUSEADDR` is always set. With `graceful_linger` the socket lingers up
/// to one second on close so queued data drains; otherwise close is abrupt.
/// Port 0 lets the kernel pick; privileged ports are refused.
pub fn create_listen_socket(port: u16, graceful_linger: bool) -> EtudeResult<Socket> {
    if port != 0 && port < 1024 {
        return Err(EtudeError::InvalidPort(port));
    }

    unsafe {
        let fd = libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let sock = Socket::from_raw(fd);

        let linger = libc::linger {
            l_onoff: graceful_linger as c_int,
            l_linger: if graceful_linger { 1 } else { 0 },
        };
        setsockopt(fd, libc::SOL_SOCKET, libc::SO_LINGER, &linger)?;

        let one: c_int = 1;
        setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, &one)?;

        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from(Ipv4Addr::UNSPECIFIED).to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of_val(&sin) as socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error().into());
        }

        if libc::listen(fd, LISTEN_BACKLOG) < 0 {
            return Err(io::Error::last_os_error().into());
        }

        Ok(sock)
    }
}

fn setsockopt<T>(fd: RawFd, level: c_int, name: c_int, value: &T) -> io::Result<()> {
    let res = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const c_void,
            mem::size_of::<T>() as socklen_t,
        )
    };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn to_socket_addr(sin: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
        u16::from_be(sin.sin_port),
    )
}

/// Address a bound socket is listening on.
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddrV4> {
    unsafe {
        let mut sin: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        if libc::getsockname(fd, &mut sin as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(to_socket_addr(&sin))
    }
}

/// Accept one pending connection as a non-blocking socket.
/// Returns `Ok(None)` once the backlog is empty.
pub fn accept_connection(listen_fd: RawFd) -> io::Result<Option<(Socket, SocketAddrV4)>> {
    unsafe {
        let mut sin: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        let fd = libc::accept4(
            listen_fd,
            &mut sin as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            }
        } else {
            Ok(Some((Socket::from_raw(fd), to_socket_addr(&sin))))
        }
    }
}

// ---- Readiness multiplexer ----

pub const EPOLLIN: u32 = libc::EPOLLIN as u32;
pub const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
pub const EPOLLET: u32 = libc::EPOLLET as u32;
pub const EPOLLONESHOT: u32 = libc::EPOLLONESHOT as u32;
pub const EPOLLRDHUP: u32 = libc::EPOLLRDHUP as u32;
pub const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
pub const EPOLLERR: u32 = libc::EPOLLERR as u32;

/// Thin wrapper over an epoll instance.
///
/// Interest masks are passed through untouched, so callers choose edge or
/// level triggering and one-shot per descriptor. Every registration carries a
/// caller-chosen `u64` token that comes back with its events.
pub struct Epoll {
    fd: c_int,
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

    pub fn register(&self, fd: RawFd, token: u64, interest: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
    }

    /// Replace the interest set. This is also how a one-shot descriptor is
    /// re-armed.
    pub fn modify(&self, fd: RawFd, token: u64, interest: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    pub fn unregister(&self, fd: RawFd) -> io::Result<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn ctl(&self, op: c_int, fd: RawFd, token: u64, interest: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest,
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Block until at least one registered descriptor is ready or
    /// `timeout_ms` elapses (`-1` waits forever). Interrupted waits report
    /// zero events.
    pub fn wait(&self, events: &mut Events, timeout_ms: i32) -> io::Result<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.buf.as_mut_ptr(),
                events.buf.len() as c_int,
                timeout_ms,
            );

            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    events.len = 0;
                    return Ok(0);
                }
                return Err(err);
            }

            events.len = res as usize;
            Ok(events.len)
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

/// Batch of ready descriptors filled by [`Epoll::wait`].
pub struct Events {
    buf: Vec<libc::epoll_event>,
    len: usize,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// `(token, event mask)` for every ready descriptor of the last wait.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u32)> + '_ {
        self.buf[..self.len].iter().map(|ev| {
            let ev = *ev;
            (ev.u64, ev.events)
        })
    }
}

// ---- Plain and vectored I/O ----

/// Scatter read into `bufs` with a single `readv`.
pub fn readv_nonblocking(fd: RawFd, bufs: &mut [&mut [u8]]) -> io::Result<usize> {
    let mut iovecs: [libc::iovec; 4] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(4);
    for i in 0..iov_count {
        iovecs[i] = libc::iovec {
            iov_base: bufs[i].as_mut_ptr() as *mut c_void,
            iov_len: bufs[i].len(),
        };
    }

    let res = unsafe { libc::readv(fd, iovecs.as_ptr(), iov_count as c_int) };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

/// One `write` of `buf`. Would-block surfaces as `ErrorKind::WouldBlock`.
pub fn write_nonblocking(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let res = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

/// Gather write of `bufs` to a socket in one `sendmsg`, with `MSG_NOSIGNAL`
/// so a reset peer yields `EPIPE` instead of killing the process.
pub fn send_vectored(fd: RawFd, bufs: &[&[u8]]) -> io::Result<usize> {
    let mut iovecs: [libc::iovec; 4] = unsafe { mem::zeroed() };
    let mut iov_count = 0;
    for buf in bufs.iter().filter(|b| !b.is_empty()).take(4) {
        iovecs[iov_count] = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
        iov_count += 1;
    }
    if iov_count == 0 {
        return Ok(0);
    }

    unsafe {
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = iovecs.as_mut_ptr();
        msg.msg_iovlen = iov_count as _;
        let res = libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL);
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

// ---- Wake pipe ----

/// Create a non-blocking, close-on-exec pipe. Returns (read end, write end).
pub fn create_pipe() -> EtudeResult<(Socket, Socket)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok((Socket::from_raw(fds[0]), Socket::from_raw(fds[1])))
}

/// Post one byte to a wake pipe. A full pipe already guarantees a wakeup.
pub fn notify_pipe(write_fd: RawFd) {
    let _ = write_nonblocking(write_fd, &[1u8]);
}

/// Empty a wake pipe so level-triggered interest stops firing.
pub fn drain_pipe(read_fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        let res = unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if res <= 0 || (res as usize) < buf.len() {
            break;
        }
    }
}

// ---- File mapping ----

/// A read-only private memory mapping of a whole file, unmapped on drop.
pub struct MappedFile {
    ptr: *mut c_void,
    len: usize,
}

// The mapping is read-only and owned exclusively by this value.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    /// Map the first `len` bytes of `file`. `len` must be non-zero.
    pub fn map(file: &File, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty file",
            ));
        }
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}
