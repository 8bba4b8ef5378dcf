// src/conn.rs
use crate::buffer::NetBuffer;
use crate::credentials::CredentialStore;
use crate::parser::{ParseOutcome, Request};
use crate::response::Response;
use crate::syscalls::{self, Socket};
use std::io;
use std::net::SocketAddrV4;
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Level-triggered writes keep looping while more than this many bytes
/// remain; below it they yield back to the event loop.
pub const WRITE_LOOP_THRESHOLD: usize = 10 * 1024;

/// Buffered bytes an unfinished request may hold before it is refused.
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 64 * 1024;

/// One gather-write region. `offset` counts bytes of the region already
/// sent, `len` what remains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoSegment {
    pub offset: usize,
    pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Both segments are fully sent.
    Drained,
    /// Bytes remain but the level-triggered loop yielded.
    Pending,
}

/// Protocol state of one client: buffers, the request being parsed and the
/// response being sent. Only the thread holding the connection's dispatch
/// touches it.
pub struct Connection {
    fd: RawFd,
    edge_triggered: bool,
    max_request_bytes: usize,
    read_buf: NetBuffer,
    write_buf: NetBuffer,
    /// [0]: status line and headers in `write_buf`; [1]: mapped file body.
    iov: [IoSegment; 2],
    request: Request,
    response: Response,
    keep_alive: bool,
}

impl Connection {
    pub fn new(fd: RawFd, edge_triggered: bool) -> Self {
        Self {
            fd,
            edge_triggered,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            read_buf: NetBuffer::default(),
            write_buf: NetBuffer::default(),
            iov: [IoSegment::default(); 2],
            request: Request::new(),
            response: Response::new(),
            keep_alive: false,
        }
    }

    pub fn with_request_limit(mut self, max_request_bytes: usize) -> Self {
        self.max_request_bytes = max_request_bytes;
        self
    }

    /// Pull bytes from the socket into the read buffer. Edge-triggered
    /// connections read until the socket would block or the buffer passes
    /// the request limit.
    ///
    /// `Ok(0)` means the peer closed. Would-block with nothing read is
    /// returned as an error for the caller to re-arm on.
    pub fn read(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            match self.read_buf.fill_from_fd(self.fd) {
                Ok(0) => return Ok(0),
                Ok(n) => {
                    total += n;
                    if !self.edge_triggered || self.over_limit() {
                        return Ok(total);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && total > 0 => {
                    return Ok(total);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Parse the next buffered request and stage its response.
    ///
    /// Returns false when there is nothing complete to answer yet. A
    /// malformed request line, or an unfinished request past the size limit,
    /// discards the buffered input and stages a 400 that closes the
    /// connection.
    pub fn process(&mut self, root: &Path, store: &dyn CredentialStore) -> bool {
        if self.read_buf.readable_bytes() == 0 {
            return false;
        }

        match self.request.parse(self.read_buf.peek(), store) {
            ParseOutcome::Complete(consumed) => {
                self.read_buf.retrieve(consumed);
                self.keep_alive = self.request.is_keep_alive();
                self.response
                    .init(root, self.request.path(), self.keep_alive, None);
            }
            ParseOutcome::Incomplete if self.over_limit() => {
                tracing::debug!(
                    fd = self.fd,
                    buffered = self.read_buf.readable_bytes(),
                    limit = self.max_request_bytes,
                    "request too large"
                );
                self.reject(root);
            }
            ParseOutcome::Incomplete => return false,
            ParseOutcome::Malformed => self.reject(root),
        }

        self.response.make_response(&mut self.write_buf);
        self.iov[0] = IoSegment {
            offset: 0,
            len: self.write_buf.readable_bytes(),
        };
        self.iov[1] = IoSegment {
            offset: 0,
            len: self.response.file_len(),
        };
        tracing::debug!(
            fd = self.fd,
            status = self.response.status().unwrap_or_default(),
            path = %self.response.path(),
            bytes = self.to_write_bytes(),
            "response staged"
        );
        true
    }

    fn over_limit(&self) -> bool {
        self.read_buf.readable_bytes() > self.max_request_bytes
    }

    /// Drop whatever is buffered and answer 400 without keep-alive.
    fn reject(&mut self, root: &Path) {
        self.read_buf.retrieve_all();
        self.keep_alive = false;
        self.response
            .init(root, self.request.path(), false, Some(400));
    }

    /// Gather-write the staged response.
    ///
    /// Loops while edge-triggered or while more than
    /// [`WRITE_LOOP_THRESHOLD`] bytes remain. Would-block is returned as an
    /// error; the caller re-arms for write and resumes later from the
    /// recorded segment offsets.
    pub fn write(&mut self) -> io::Result<WriteStatus> {
        loop {
            if self.to_write_bytes() == 0 {
                self.response.unmap_file();
                return Ok(WriteStatus::Drained);
            }

            let n = {
                let head = &self.write_buf.peek()[..self.iov[0].len];
                let body = &self.response.file()
                    [self.iov[1].offset..self.iov[1].offset + self.iov[1].len];
                match syscalls::send_vectored(self.fd, &[head, body]) {
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            };
            self.advance(n);

            if self.to_write_bytes() == 0 {
                self.response.unmap_file();
                return Ok(WriteStatus::Drained);
            }
            if !self.edge_triggered && self.to_write_bytes() <= WRITE_LOOP_THRESHOLD {
                return Ok(WriteStatus::Pending);
            }
        }
    }

    fn advance(&mut self, n: usize) {
        let head = n.min(self.iov[0].len);
        if head > 0 {
            self.write_buf.retrieve(head);
            self.iov[0].offset += head;
            self.iov[0].len -= head;
        }
        let body = n - head;
        debug_assert!(body <= self.iov[1].len);
        self.iov[1].offset += body;
        self.iov[1].len -= body;
    }

    pub fn to_write_bytes(&self) -> usize {
        self.iov[0].len + self.iov[1].len
    }

    pub fn segments(&self) -> [IoSegment; 2] {
        self.iov
    }

    /// Keep-alive decision of the most recent request.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn has_buffered_input(&self) -> bool {
        self.read_buf.readable_bytes() > 0
    }

    /// Drop buffered data and the mapped body.
    pub fn release(&mut self) {
        self.response.unmap_file();
        self.read_buf.retrieve_all();
        self.write_buf.retrieve_all();
        self.iov = [IoSegment::default(); 2];
    }
}

/// A live connection as shared between the event loop and workers.
///
/// The socket closes when the last reference drops, so a worker still
/// holding the slot can never write to a recycled descriptor.
pub struct ConnSlot {
    token: u64,
    peer: SocketAddrV4,
    socket: Socket,
    closed: AtomicBool,
    busy: AtomicBool,
    conn: Mutex<Connection>,
}

impl ConnSlot {
    pub fn new(
        token: u64,
        socket: Socket,
        peer: SocketAddrV4,
        edge_triggered: bool,
        max_request_bytes: usize,
    ) -> Self {
        let conn =
            Connection::new(socket.fd(), edge_triggered).with_request_limit(max_request_bytes);
        Self {
            token,
            peer,
            socket,
            closed: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            conn: Mutex::new(conn),
        }
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn fd(&self) -> RawFd {
        self.socket.fd()
    }

    pub fn peer(&self) -> SocketAddrV4 {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flag the slot closed and shut the socket down. True only for the
    /// first caller.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.socket.shutdown();
        true
    }

    /// Claim the connection for one dispatched task. False if another task
    /// already holds it.
    pub fn begin_dispatch(&self) -> bool {
        !self.busy.swap(true, Ordering::AcqRel)
    }

    pub fn end_dispatch(&self) {
        self.busy.store(false, Ordering::Release);
    }

    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, Connection>> {
        match self.conn.try_lock() {
            Ok(guard) => Some(guard),
            Err(std::sync::TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(std::sync::TryLockError::WouldBlock) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;
    use std::fs;
    use std::io::{Read, Write};
    use std::net::Ipv4Addr;
    use std::os::fd::{AsRawFd, IntoRawFd};
    use std::os::unix::net::UnixStream;

    fn site() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "hello etude").unwrap();
        fs::write(dir.path().join("400.html"), "bad request").unwrap();
        dir
    }

    fn read_available(stream: &mut UnixStream, out: &mut Vec<u8>) {
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("client read failed: {}", e),
            }
        }
    }

    #[test]
    fn serves_a_keep_alive_request() {
        let dir = site();
        let store = MemoryCredentialStore::new();
        let (server, mut client) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        let mut conn = Connection::new(server.as_raw_fd(), true);

        client
            .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        assert!(conn.read().unwrap() > 0);
        assert!(conn.process(dir.path(), &store));
        assert!(conn.is_keep_alive());
        assert_eq!(conn.write().unwrap(), WriteStatus::Drained);
        assert_eq!(conn.to_write_bytes(), 0);

        client.set_nonblocking(true).unwrap();
        let mut out = Vec::new();
        read_available(&mut client, &mut out);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\nhello etude"));

        // Nothing buffered: nothing to answer.
        assert!(!conn.process(dir.path(), &store));
    }

    #[test]
    fn read_reports_would_block_and_eof() {
        let (server, client) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        let mut conn = Connection::new(server.as_raw_fd(), true);

        let err = conn.read().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        drop(client);
        assert_eq!(conn.read().unwrap(), 0);
    }

    #[test]
    fn incomplete_request_waits_for_more_input() {
        let dir = site();
        let store = MemoryCredentialStore::new();
        let (server, mut client) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        let mut conn = Connection::new(server.as_raw_fd(), false);

        client.write_all(b"GET / HTTP/1.1\r\nHo").unwrap();
        conn.read().unwrap();
        assert!(!conn.process(dir.path(), &store));
        assert!(conn.has_buffered_input());

        client.write_all(b"st: x\r\n\r\n").unwrap();
        conn.read().unwrap();
        assert!(conn.process(dir.path(), &store));
        assert!(!conn.has_buffered_input());
    }

    #[test]
    fn malformed_request_stages_400_and_close() {
        let dir = site();
        let store = MemoryCredentialStore::new();
        let (server, mut client) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        let mut conn = Connection::new(server.as_raw_fd(), true);

        client
            .write_all(b"NONSENSE\r\nGET / HTTP/1.1\r\n\r\n")
            .unwrap();
        conn.read().unwrap();
        assert!(conn.process(dir.path(), &store));
        assert!(!conn.is_keep_alive());
        assert!(!conn.has_buffered_input());
        assert_eq!(conn.write().unwrap(), WriteStatus::Drained);

        client.set_nonblocking(true).unwrap();
        let mut out = Vec::new();
        read_available(&mut client, &mut out);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("bad request"));
    }

    #[test]
    fn oversized_unfinished_request_stages_400_and_close() {
        let dir = site();
        let store = MemoryCredentialStore::new();
        let (server, mut client) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        let mut conn = Connection::new(server.as_raw_fd(), true).with_request_limit(1024);

        // A header line that never ends.
        client.write_all(b"GET / HTTP/1.1\r\nX-Filler: ").unwrap();
        client.write_all(&[b'a'; 600]).unwrap();
        conn.read().unwrap();
        assert!(!conn.process(dir.path(), &store));
        assert!(conn.has_buffered_input());

        client.write_all(&[b'a'; 600]).unwrap();
        conn.read().unwrap();
        assert!(conn.process(dir.path(), &store));
        assert!(!conn.is_keep_alive());
        assert!(!conn.has_buffered_input());
        assert_eq!(conn.write().unwrap(), WriteStatus::Drained);

        client.set_nonblocking(true).unwrap();
        let mut out = Vec::new();
        read_available(&mut client, &mut out);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }

    #[test]
    fn declared_body_beyond_limit_is_refused() {
        let dir = site();
        let store = MemoryCredentialStore::new();
        let (server, mut client) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        let mut conn = Connection::new(server.as_raw_fd(), false).with_request_limit(256);

        client
            .write_all(b"POST /login HTTP/1.1\r\nContent-Length: 10000000000\r\n\r\n")
            .unwrap();
        client.write_all(&[b'u'; 300]).unwrap();
        conn.read().unwrap();
        assert!(conn.process(dir.path(), &store));
        assert!(!conn.is_keep_alive());
        assert!(!conn.has_buffered_input());
    }

    #[test]
    fn large_body_resumes_across_partial_writes() {
        let dir = site();
        let body: Vec<u8> = (0..2 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        fs::write(dir.path().join("big.bin"), &body).unwrap();
        let store = MemoryCredentialStore::new();

        let (server, mut client) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        client.set_nonblocking(true).unwrap();
        let sndbuf: libc::c_int = 16 * 1024;
        unsafe {
            libc::setsockopt(
                server.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &sndbuf as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        let mut conn = Connection::new(server.as_raw_fd(), false);
        client.write_all(b"GET /big.bin HTTP/1.1\r\n\r\n").unwrap();
        conn.read().unwrap();
        assert!(conn.process(dir.path(), &store));
        let header_len = conn.segments()[0].len;
        let total = header_len + body.len();
        assert_eq!(conn.to_write_bytes(), total);

        let mut out = Vec::new();
        let mut calls = 0;
        let mut last_offset = 0;
        loop {
            calls += 1;
            let status = match conn.write() {
                Ok(status) => Some(status),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
                Err(e) => panic!("write failed: {}", e),
            };
            let [head, file] = conn.segments();
            assert!(file.offset >= last_offset);
            assert_eq!(head.offset + head.len, header_len);
            last_offset = file.offset;
            if status == Some(WriteStatus::Drained) {
                break;
            }
            read_available(&mut client, &mut out);
        }
        read_available(&mut client, &mut out);

        assert!(calls >= 2, "expected a partial write, got {} call(s)", calls);
        assert_eq!(out.len(), total);
        assert_eq!(&out[header_len..], &body[..]);
        assert_eq!(conn.segments()[1].offset, body.len());
    }

    #[test]
    fn slot_close_and_dispatch_flags() {
        let (server, _client) = UnixStream::pair().unwrap();
        let socket = Socket::from_raw(server.into_raw_fd());
        let slot = ConnSlot::new(
            7,
            socket,
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9),
            true,
            DEFAULT_MAX_REQUEST_BYTES,
        );

        assert_eq!(slot.token(), 7);
        assert!(slot.begin_dispatch());
        assert!(!slot.begin_dispatch(), "second concurrent dispatch must be refused");
        slot.end_dispatch();
        assert!(slot.begin_dispatch());
        slot.end_dispatch();

        assert!(slot.close());
        assert!(!slot.close());
        assert!(slot.is_closed());

        let guard = slot.lock();
        assert!(slot.try_lock().is_none());
        drop(guard);
        assert!(slot.try_lock().is_some());
    }
}
