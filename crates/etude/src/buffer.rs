// src/buffer.rs
use crate::syscalls;
use std::io;
use std::os::fd::RawFd;

pub const INITIAL_BUF_SIZE: usize = 1024;

/// Size of the on-stack overflow region used by [`NetBuffer::fill_from_fd`].
pub const SPARE_READ_SIZE: usize = 64 * 1024;

/// Growable byte buffer with independent read and write cursors.
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// |   (consumed)      |    (content)     |                  |
/// +-------------------+------------------+------------------+
/// 0      <=       read_pos     <=     write_pos    <=     capacity
/// ```
pub struct NetBuffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl NetBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    #[inline(always)]
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    #[inline(always)]
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    #[inline(always)]
    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// The readable region.
    #[inline(always)]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    /// Offset of the first `\r\n` in the readable region.
    pub fn find_crlf(&self) -> Option<usize> {
        memchr::memmem::find(self.peek(), b"\r\n")
    }

    /// Consume `len` readable bytes.
    ///
    /// # Panics
    /// If `len` exceeds [`readable_bytes`](Self::readable_bytes).
    pub fn retrieve(&mut self, len: usize) {
        assert!(
            len <= self.readable_bytes(),
            "retrieve({}) past {} readable bytes",
            len,
            self.readable_bytes()
        );
        self.read_pos += len;
    }

    /// Consume everything before `end`, an offset into [`peek`](Self::peek).
    pub fn retrieve_until(&mut self, end: usize) {
        self.retrieve(end);
    }

    /// Drop all content and zero the backing store.
    pub fn retrieve_all(&mut self) {
        self.buf.fill(0);
        self.read_pos = 0;
        self.write_pos = 0;
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Mark `len` bytes past the write cursor as written.
    pub fn has_written(&mut self, len: usize) {
        debug_assert!(len <= self.writable_bytes());
        self.write_pos += len;
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    pub fn append_str(&mut self, s: &str) {
        self.append(s.as_bytes());
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len {
            self.buf.resize(self.write_pos + len + 1, 0);
        } else {
            // Slide the readable region back to offset 0.
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        }
    }

    /// Read whatever `fd` has available with a single `readv` into the
    /// writable tail plus a 64 KiB stack region; any overflow is appended,
    /// growing the buffer only as far as the burst requires.
    ///
    /// Returns the byte count (0 on EOF). Would-block is reported as an
    /// error and never retried here.
    pub fn fill_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut spare = [0u8; SPARE_READ_SIZE];
        let writable = self.writable_bytes();
        let write_pos = self.write_pos;

        let n = {
            let tail = &mut self.buf[write_pos..];
            syscalls::readv_nonblocking(fd, &mut [tail, &mut spare[..]])?
        };

        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.buf.len();
            self.append(&spare[..n - writable]);
        }
        Ok(n)
    }

    /// One `write` of the whole readable region; advances the read cursor by
    /// what the descriptor accepted.
    pub fn drain_to_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let n = syscalls::write_nonblocking(fd, self.peek())?;
        self.read_pos += n;
        Ok(n)
    }
}

impl Default for NetBuffer {
    fn default() -> Self {
        Self::new(INITIAL_BUF_SIZE)
    }
}
