// src/buffer.rs
use crate::syscalls;
use std::io::ErrorKind;
use std::os::fd::RawFd;

/// Per-direction readiness and half-close flags for one descriptor.
///
/// The multiplexer raises `can_read` / `can_write`; the buffers clear
/// them when a non-blocking attempt comes up short. `want_read` /
/// `want_write` express the state machine's interest; `read_eof` /
/// `write_eof` latch a half-close and never reset within one request.
#[derive(Debug, Default, Clone, Copy)]
pub struct IoState {
    pub can_read: bool,
    pub want_read: bool,
    pub can_write: bool,
    pub want_write: bool,
    pub read_eof: bool,
    pub write_eof: bool,
}

impl IoState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn set_read_eof(&mut self) {
        self.read_eof = true;
    }

    pub fn set_write_eof(&mut self) {
        self.write_eof = true;
        self.can_write = false;
    }
}

/// Paged byte buffer: a fixed-size page that optionally chains further
/// same-sized pages when expansion is enabled. Partial writes resume at
/// an internal cursor; partial reads accumulate at the data end.
pub struct PagedBuf<const N: usize> {
    pages: Vec<Box<[u8; N]>>,
    len: usize,
    marker: usize,
    expand: bool,
}

impl<const N: usize> PagedBuf<N> {
    pub fn new() -> Self {
        Self {
            pages: vec![Box::new([0u8; N])],
            len: 0,
            marker: 0,
            expand: false,
        }
    }

    pub fn set_expand(&mut self, expand: bool) {
        self.expand = expand;
    }

    pub fn page_size(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes not yet consumed by the cursor.
    pub fn pending(&self) -> usize {
        self.len - self.marker
    }

    pub fn marker(&self) -> usize {
        self.marker
    }

    pub fn set_marker(&mut self, marker: usize) {
        self.marker = marker.min(self.len);
    }

    /// Valid bytes of the first page. Callers that parse in place keep
    /// the buffer single-paged by never enabling expansion.
    pub fn data(&self) -> &[u8] {
        &self.pages[0][..self.len.min(N)]
    }

    pub fn reset(&mut self) {
        self.pages.truncate(1);
        self.len = 0;
        self.marker = 0;
    }

    /// Copy bytes in, chaining pages as needed. Returns how many bytes
    /// were stored; without expansion the remainder is refused.
    pub fn append(&mut self, data: &[u8]) -> usize {
        let mut copied = 0;
        while copied < data.len() {
            if self.len == self.pages.len() * N {
                if !self.expand {
                    break;
                }
                self.pages.push(Box::new([0u8; N]));
            }
            let page = self.len / N;
            let off = self.len % N;
            let take = (N - off).min(data.len() - copied);
            self.pages[page][off..off + take].copy_from_slice(&data[copied..copied + take]);
            self.len += take;
            copied += take;
        }
        copied
    }

    /// Fill the current page from the descriptor with one read attempt.
    ///
    /// Flag outcome: `can_read` drops on a short read, EOF, or a read
    /// error other than EINTR; `want_read` drops on EINTR or when the
    /// page is full and cannot grow; `read_eof` latches when the peer
    /// closed. Returns `false` only when there is no room left and the
    /// buffer may not expand.
    pub fn read_from_fd(&mut self, fd: RawFd, io: &mut IoState) -> bool {
        if self.len == self.pages.len() * N {
            if !self.expand {
                io.want_read = false;
                return false;
            }
            self.pages.push(Box::new([0u8; N]));
        }

        let page = self.len / N;
        let off = self.len % N;
        let space = N - off;

        match syscalls::read_fd(fd, &mut self.pages[page][off..off + space]) {
            Ok(0) => {
                io.set_read_eof();
                io.can_read = false;
            }
            Ok(n) => {
                self.len += n;
                if n < space {
                    io.can_read = false;
                } else if !self.expand && self.len == self.pages.len() * N {
                    io.want_read = false;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {
                io.want_read = false;
            }
            Err(_) => {
                io.can_read = false;
            }
        }
        true
    }

    /// Drain as much buffered data as the socket accepts, advancing the
    /// cursor. `can_write` drops when the socket would block;
    /// `want_write` drops once everything is out; a hard write error
    /// latches `write_eof` and returns `false`.
    pub fn write_to_fd(&mut self, fd: RawFd, io: &mut IoState) -> bool {
        while self.marker < self.len {
            let page = self.marker / N;
            let off = self.marker % N;
            let page_end = ((page + 1) * N).min(self.len);
            let chunk = page_end - self.marker;

            match syscalls::write_fd(fd, &self.pages[page][off..off + chunk]) {
                Ok(0) => {
                    io.can_write = false;
                    return true;
                }
                Ok(n) => {
                    self.marker += n;
                    if n < chunk {
                        io.can_write = false;
                        return true;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    io.can_write = false;
                    return true;
                }
                Err(_) => {
                    io.set_write_eof();
                    return false;
                }
            }
        }
        io.want_write = false;
        true
    }
}

impl<const N: usize> Default for PagedBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Single resizable block, sized exactly once the expected length is
/// known. Used for request bodies.
pub struct BlockBuf {
    data: Vec<u8>,
    capacity: usize,
}

impl BlockBuf {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            capacity: 0,
        }
    }

    /// Discard contents and fix the capacity for the next fill.
    pub fn resize(&mut self, capacity: usize) {
        self.data.clear();
        self.data.reserve_exact(capacity);
        self.capacity = capacity;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn reset(&mut self) {
        self.data.clear();
        self.data.shrink_to_fit();
        self.capacity = 0;
    }

    /// Copy bytes in up to the fixed capacity; the overrun is refused.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let take = (self.capacity - self.data.len()).min(bytes.len());
        self.data.extend_from_slice(&bytes[..take]);
        take
    }

    /// One read attempt toward the fixed capacity, same flag contract as
    /// [`PagedBuf::read_from_fd`]. A full block cannot grow.
    pub fn read_from_fd(&mut self, fd: RawFd, io: &mut IoState) -> bool {
        let space = self.capacity - self.data.len();
        if space == 0 {
            io.want_read = false;
            return false;
        }

        let old = self.data.len();
        self.data.resize(old + space, 0);

        match syscalls::read_fd(fd, &mut self.data[old..]) {
            Ok(0) => {
                self.data.truncate(old);
                io.set_read_eof();
                io.can_read = false;
            }
            Ok(n) => {
                self.data.truncate(old + n);
                if n < space {
                    io.can_read = false;
                } else {
                    io.want_read = false;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {
                self.data.truncate(old);
                io.want_read = false;
            }
            Err(_) => {
                self.data.truncate(old);
                io.can_read = false;
            }
        }
        true
    }
}

impl Default for BlockBuf {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nonblocking_pair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        syscalls::set_nonblocking(fds[0]).unwrap();
        syscalls::set_nonblocking(fds[1]).unwrap();
        (fds[0], fds[1])
    }

    #[test]
    fn append_refuses_overrun_without_expand() {
        let mut buf = PagedBuf::<8>::new();
        assert_eq!(buf.append(b"0123456789"), 8);
        assert_eq!(buf.len(), 8);
        assert_eq!(buf.data(), b"01234567");
    }

    #[test]
    fn append_chains_pages_when_expanding() {
        let mut buf = PagedBuf::<8>::new();
        buf.set_expand(true);
        assert_eq!(buf.append(b"0123456789abcdefgh"), 18);
        assert_eq!(buf.len(), 18);
        // first page view stays bounded by the page size
        assert_eq!(buf.data(), b"01234567");
    }

    #[test]
    fn read_accumulates_and_reports_eof() {
        let (a, b) = nonblocking_pair();
        let mut buf = PagedBuf::<64>::new();
        let mut io = IoState {
            can_read: true,
            want_read: true,
            ..Default::default()
        };

        syscalls::write_fd(b, b"hello").unwrap();
        assert!(buf.read_from_fd(a, &mut io));
        assert_eq!(buf.data(), b"hello");
        assert!(!io.can_read); // short read drained the socket

        unsafe { libc::shutdown(b, libc::SHUT_WR) };
        io.can_read = true;
        assert!(buf.read_from_fd(a, &mut io));
        assert!(io.read_eof);

        syscalls::close_fd(a);
        syscalls::close_fd(b);
    }

    #[test]
    fn full_page_without_expand_fails_the_read() {
        let (a, b) = nonblocking_pair();
        let mut buf = PagedBuf::<4>::new();
        let mut io = IoState {
            can_read: true,
            want_read: true,
            ..Default::default()
        };

        syscalls::write_fd(b, b"abcdef").unwrap();
        assert!(buf.read_from_fd(a, &mut io));
        assert_eq!(buf.len(), 4);
        assert!(!buf.read_from_fd(a, &mut io));
        assert!(!io.want_read);

        syscalls::close_fd(a);
        syscalls::close_fd(b);
    }

    #[test]
    fn write_drains_across_pages_and_resumes_at_cursor() {
        let (a, b) = nonblocking_pair();
        let mut buf = PagedBuf::<8>::new();
        buf.set_expand(true);
        buf.append(b"0123456789abcdef");

        let mut io = IoState {
            can_write: true,
            want_write: true,
            ..Default::default()
        };
        assert!(buf.write_to_fd(a, &mut io));
        assert_eq!(buf.pending(), 0);
        assert!(!io.want_write);

        let mut out = [0u8; 32];
        let n = syscalls::read_fd(b, &mut out).unwrap();
        assert_eq!(&out[..n], b"0123456789abcdef");

        syscalls::close_fd(a);
        syscalls::close_fd(b);
    }

    #[test]
    fn write_to_closed_peer_latches_write_eof() {
        syscalls::ignore_sigpipe();
        let (a, b) = nonblocking_pair();
        syscalls::close_fd(b);

        let mut buf = PagedBuf::<8>::new();
        buf.append(b"data");
        let mut io = IoState {
            can_write: true,
            want_write: true,
            ..Default::default()
        };
        assert!(!buf.write_to_fd(a, &mut io));
        assert!(io.write_eof);

        syscalls::close_fd(a);
    }

    #[test]
    fn block_fills_to_capacity_exactly() {
        let (a, b) = nonblocking_pair();
        let mut buf = BlockBuf::new();
        buf.resize(6);
        assert_eq!(buf.append(b"ab"), 2);

        let mut io = IoState {
            can_read: true,
            want_read: true,
            ..Default::default()
        };
        syscalls::write_fd(b, b"cdefgh").unwrap();
        assert!(buf.read_from_fd(a, &mut io));
        assert_eq!(buf.data(), b"abcdef");
        assert_eq!(buf.len(), buf.capacity());
        // at capacity the block refuses further reads
        assert!(!buf.read_from_fd(a, &mut io));

        syscalls::close_fd(a);
        syscalls::close_fd(b);
    }
}
