// src/conn.rs
use crate::buffer::{BlockBuf, IoState, PagedBuf};
use crate::handler::{Method, Task};
use crate::syscalls;
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::RawFd;
use std::time::SystemTime;

pub const MAX_HEADER_ITEMS: usize = 16;

pub const READ_HEADERS_SZ: usize = 8192;
pub const WRITE_TITLE_SZ: usize = 8192;
pub const WRITE_HEADERS_SZ: usize = 4096;
pub const WRITE_BODY_SZ: usize = 32768;

/// Connection lifecycle. Advances monotonically; the only way back to
/// `Undefined` is an explicit re-init on slot reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpState {
    Undefined,
    ReadingHead,
    ReadingHeaders,
    ReadingPost,
    ReadyToHandle,
    Writing,
    Done,
}

/// Outcome of one parsing step inside `process()`.
enum Step {
    /// Made progress; run the state switch again.
    Continue,
    /// Cannot advance without more socket readiness.
    Block,
    /// Protocol violation carrying the HTTP status to answer with.
    Error(u16),
}

/// One client socket's request/response lifecycle: owns the buffers on
/// both directions, parses the request incrementally, and serializes the
/// response. Never blocks; every socket touch is a single non-blocking
/// attempt gated by the readiness flags in [`IoState`].
pub struct Connection {
    fd: RawFd,
    io: IoState,
    state: HttpState,

    in_headers: PagedBuf<READ_HEADERS_SZ>,
    in_post: BlockBuf,

    out_title: PagedBuf<WRITE_TITLE_SZ>,
    out_headers: PagedBuf<WRITE_HEADERS_SZ>,
    out_post: PagedBuf<WRITE_BODY_SZ>,

    method: Method,
    protocol_major: i32,
    protocol_minor: i32,
    keep_alive: bool,
    cache: bool,
    peer: IpAddr,
    uri_path: String,
    uri_params: String,
    headers: Vec<(String, String)>,
    response_status: u16,
}

impl Connection {
    pub fn empty() -> Self {
        let mut out_post = PagedBuf::new();
        out_post.set_expand(true);
        Self {
            fd: -1,
            io: IoState::default(),
            state: HttpState::Undefined,
            in_headers: PagedBuf::new(),
            in_post: BlockBuf::new(),
            out_title: PagedBuf::new(),
            out_headers: PagedBuf::new(),
            out_post,
            method: Method::Undefined,
            protocol_major: 0,
            protocol_minor: 0,
            keep_alive: false,
            cache: false,
            peer: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            uri_path: String::new(),
            uri_params: String::new(),
            headers: Vec::with_capacity(MAX_HEADER_ITEMS),
            response_status: 0,
        }
    }

    /// Reinitialize for a fresh descriptor. Reuses the buffers in place;
    /// nothing is reallocated on the hot path.
    pub fn init(&mut self, fd: RawFd, peer: IpAddr) {
        if self.fd == -1 {
            self.fd = fd;
        } else {
            tracing::warn!("connection [{}] tried to double-init on {}", self.fd, fd);
        }

        self.peer = peer;
        self.io.reset();
        self.state = HttpState::Undefined;
        self.method = Method::Undefined;
        self.protocol_major = 0;
        self.protocol_minor = 0;
        self.keep_alive = false;
        self.cache = false;
        self.uri_path.clear();
        self.uri_params.clear();
        self.headers.clear();
        self.response_status = 0;

        self.in_headers.reset();
        self.in_post.reset();
        self.out_title.reset();
        self.out_headers.reset();
        self.out_post.reset();
        self.out_post.set_expand(true);
    }

    /// Tear down the OS resources and park the object for reuse.
    pub fn destroy(&mut self) {
        if self.fd != -1 {
            syscalls::shutdown_fd(self.fd);
            syscalls::close_fd(self.fd);
            self.fd = -1;
        }

        self.in_headers.reset();
        self.in_post.reset();
        self.out_title.reset();
        self.out_headers.reset();
        self.out_post.reset();

        self.state = HttpState::Undefined;
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn state(&self) -> HttpState {
        self.state
    }

    pub fn allow_read(&mut self) {
        self.io.can_read = true;
    }

    pub fn allow_write(&mut self) {
        self.io.can_write = true;
    }

    pub fn rdeof(&self) -> bool {
        self.io.read_eof
    }

    pub fn set_rdeof(&mut self) {
        self.io.set_read_eof();
    }

    pub fn wreof(&self) -> bool {
        self.io.write_eof
    }

    pub fn set_wreof(&mut self) {
        self.io.set_write_eof();
    }

    pub fn response_status(&self) -> u16 {
        self.response_status
    }

    /// Drive the state machine as far as socket readiness allows. Never
    /// blocks; returns once a step needs more readiness or the terminal
    /// state is reached.
    pub fn process(&mut self) {
        loop {
            match self.state {
                HttpState::Undefined => {
                    self.io.want_read = true;
                    self.io.want_write = false;
                    self.state = HttpState::ReadingHead;
                }

                HttpState::ReadingHead => match self.parse_title() {
                    Step::Continue => {}
                    Step::Block => break,
                    Step::Error(status) => self.fail(status),
                },

                HttpState::ReadingHeaders => {
                    match self.parse_header_line() {
                        Step::Continue => {}
                        Step::Block => break,
                        Step::Error(status) => self.fail(status),
                    }
                    if self.state == HttpState::ReadyToHandle {
                        break;
                    }
                }

                HttpState::ReadingPost => {
                    self.parse_post();
                    if self.state == HttpState::ReadingPost
                        || self.state == HttpState::ReadyToHandle
                    {
                        break;
                    }
                }

                HttpState::ReadyToHandle => {
                    self.commit();
                    self.state = HttpState::Writing;
                }

                HttpState::Writing => {
                    self.io.want_write = true;
                    if !self.write_data() {
                        break;
                    }
                }

                HttpState::Done => break,
            }
        }
    }

    /// Answer a protocol violation with a well-formed error response
    /// before the connection closes.
    fn fail(&mut self, status: u16) {
        self.response_status = status;
        self.commit();
        self.state = HttpState::Writing;
    }

    /// Pull header bytes until the socket runs dry. `Err` means the head
    /// exceeded its fixed page.
    fn fill_headers(&mut self) -> Result<(), u16> {
        if self.fd == -1 {
            return Ok(());
        }
        while self.io.can_read && !self.io.read_eof {
            if !self.in_headers.read_from_fd(self.fd, &mut self.io) {
                return Err(400);
            }
        }
        Ok(())
    }

    /// Extract the next CRLF-terminated line from the header buffer, or
    /// `None` when more data is needed.
    fn read_header_line(&mut self) -> Result<Option<String>, u16> {
        self.io.want_read = true;
        self.fill_headers()?;

        let data = self.in_headers.data();
        let start = self.in_headers.marker();

        match data[start..].iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let nl = start + pos;
                let mut end = nl;
                if end > start && data[end - 1] == b'\r' {
                    end -= 1;
                }
                let line = std::str::from_utf8(&data[start..end])
                    .map_err(|_| 400u16)?
                    .to_owned();
                self.in_headers.set_marker(nl + 1);
                Ok(Some(line))
            }
            None => Ok(None),
        }
    }

    fn parse_title(&mut self) -> Step {
        let line = match self.read_header_line() {
            Err(status) => return Step::Error(status),
            Ok(None) => return Step::Block,
            Ok(Some(line)) => line,
        };

        let mut tokens = line.split(' ').filter(|t| !t.is_empty());
        let (Some(method), Some(url), Some(version)) =
            (tokens.next(), tokens.next(), tokens.next())
        else {
            return Step::Error(400);
        };

        let Some(proto) = version.get(..5) else {
            return Step::Error(400);
        };
        if !proto.eq_ignore_ascii_case("HTTP/") {
            return Step::Error(400);
        }
        let version = &version[5..];
        let Some((major, minor)) = version.split_once('.') else {
            return Step::Error(400);
        };

        self.method = if method.eq_ignore_ascii_case("GET") {
            Method::Get
        } else if method.eq_ignore_ascii_case("POST") {
            Method::Post
        } else if method.eq_ignore_ascii_case("HEAD") {
            Method::Head
        } else {
            return Step::Error(501);
        };

        self.protocol_major = leading_int(major);
        self.protocol_minor = leading_int(minor);

        match url.split_once('?') {
            Some((path, params)) => {
                self.uri_path = path.to_owned();
                self.uri_params = params.to_owned();
            }
            None => {
                self.uri_path = url.to_owned();
                self.uri_params.clear();
            }
        }

        self.state = HttpState::ReadingHeaders;
        Step::Continue
    }

    fn parse_header_line(&mut self) -> Step {
        let line = match self.read_header_line() {
            Err(status) => return Step::Error(status),
            Ok(None) => return Step::Block,
            Ok(Some(line)) => line,
        };

        if line.is_empty() {
            if self.method == Method::Post {
                self.state = HttpState::ReadingPost;
                // any body bytes that arrived with the head seed the block
                let head = self.in_headers.data();
                let overrun = &head[self.in_headers.marker()..];
                self.in_post.append(overrun);
            } else {
                self.state = HttpState::ReadyToHandle;
            }
            return Step::Continue;
        }

        let trimmed = line.trim_start_matches(' ');
        let Some((key, rest)) = trimmed.split_once(':') else {
            return Step::Error(400);
        };
        let value = rest.trim_start_matches(' ');

        if !key.is_empty() {
            if self.headers.len() >= MAX_HEADER_ITEMS {
                return Step::Error(400);
            }
            self.headers.push((key.to_owned(), value.to_owned()));
        }

        if key.eq_ignore_ascii_case("connection") && value == "keep-alive" {
            self.keep_alive = false;
        } else if key.get(..11).is_some_and(|p| p.eq_ignore_ascii_case("content-len")) {
            let len = leading_int(value).max(0) as usize;
            self.in_post.resize(len);
        } else if key.eq_ignore_ascii_case("expect") && value.eq_ignore_ascii_case("100-continue")
        {
            self.write_continue();
        }

        Step::Continue
    }

    /// Inline answer to `Expect: 100-continue`, written synchronously
    /// while header parsing is still in progress.
    fn write_continue(&mut self) {
        let line = b"HTTP/1.1 100 Continue\r\n\r\n";
        match syscalls::write_fd(self.fd, line) {
            Ok(n) if n == line.len() => {}
            _ => tracing::warn!("client [{}] didn't receive '100 Continue'", self.fd),
        }
    }

    fn parse_post(&mut self) {
        if self.fd != -1 {
            self.in_post.read_from_fd(self.fd, &mut self.io);
        }

        if self.in_post.len() == self.in_post.capacity() {
            self.state = HttpState::ReadyToHandle;
        }

        if self.io.read_eof && self.state != HttpState::ReadyToHandle {
            self.response_status = 400;
            self.state = HttpState::Done;
        }
    }

    /// Build the response preamble: status line, fixed headers, then the
    /// accumulated handler headers, merged into one write stream.
    fn commit(&mut self) {
        if self.response_status == 0 || self.response_status > MAX_KNOWN_STATUS {
            self.response_status = 404;
        }

        let (major, minor) = if self.protocol_major == 0 {
            (1, 0)
        } else {
            (self.protocol_major, self.protocol_minor)
        };

        let title = format!(
            "HTTP/{}.{} {} {}\r\nServer: {}/{}\r\nDate: {}\r\n",
            major,
            minor,
            self.response_status,
            status_text(self.response_status),
            crate::SERVER_NAME,
            crate::VERSION,
            httpdate::fmt_http_date(SystemTime::now()),
        );
        self.out_title.append(title.as_bytes());

        if !self.cache {
            self.out_headers
                .append(b"Pragma: no-cache\r\nCache-control: no-cache\r\n");
        }

        if self.keep_alive {
            self.push_response_header("Connection", "keep-alive");
        } else {
            self.push_response_header("Connection", "close");
        }

        if !self.out_post.is_empty() {
            self.push_response_header("Accept-Ranges", "bytes");
            let cl = format!("Content-Length: {}\r\n", self.out_post.len());
            self.out_headers.append(cl.as_bytes());
        }

        self.out_headers.append(b"\r\n");
        self.out_title.append(self.out_headers.data());
    }

    fn push_response_header(&mut self, name: &str, value: &str) {
        self.out_headers.append(name.as_bytes());
        self.out_headers.append(b": ");
        self.out_headers.append(value.as_bytes());
        self.out_headers.append(b"\r\n");
    }

    /// Flush the head then the body. Returns `true` once write-EOF is
    /// reached and the state moved to `Done`.
    fn write_data(&mut self) -> bool {
        while self.io.can_write && !self.io.write_eof {
            self.try_write();
        }

        if self.io.write_eof {
            self.state = HttpState::Done;
            true
        } else {
            false
        }
    }

    fn try_write(&mut self) {
        if self.fd == -1 {
            self.io.set_write_eof();
            return;
        }

        if self.out_title.pending() > 0 {
            if !self.out_title.write_to_fd(self.fd, &mut self.io) {
                return;
            }
            if self.out_title.pending() > 0 {
                return;
            }
        }

        if self.out_post.pending() > 0 {
            if !self.out_post.write_to_fd(self.fd, &mut self.io) {
                return;
            }
            if self.out_post.pending() > 0 {
                return;
            }
        }

        self.io.set_write_eof();
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::empty()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl Task for Connection {
    fn method(&self) -> Method {
        self.method
    }

    fn version(&self) -> (i32, i32) {
        (self.protocol_major, self.protocol_minor)
    }

    fn keepalive(&self) -> bool {
        self.keep_alive
    }

    fn cache(&self) -> bool {
        self.cache
    }

    fn peer(&self) -> IpAddr {
        self.peer
    }

    fn uri_path(&self) -> &str {
        &self.uri_path
    }

    fn uri_params(&self) -> &str {
        &self.uri_params
    }

    fn body(&self) -> &[u8] {
        self.in_post.data()
    }

    fn body_len(&self) -> usize {
        self.in_post.len()
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn headers_num(&self) -> usize {
        self.headers.len()
    }

    fn header_at(&self, index: usize) -> Option<(&str, &str)> {
        self.headers
            .get(index)
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn set_response_status(&mut self, status: u16) {
        self.response_status = status;
    }

    fn set_keepalive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    fn set_cache(&mut self, cache: bool) {
        self.cache = cache;
    }

    fn set_response_header(&mut self, name: &str, value: &str) {
        self.push_response_header(name, value);
    }

    fn append_response_body(&mut self, data: &[u8]) {
        self.out_post.append(data);
    }
}

const MAX_KNOWN_STATUS: u16 = 505;

/// RFC status text; in-range codes without an assignment render as
/// "Unknown".
fn status_text(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Moved Temporarily",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Long",
        415 => "Unsupported Media Type",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// Numeric prefix of a string, `atoi`-style: parse digits until the
/// first non-digit, zero when there are none.
fn leading_int(s: &str) -> i32 {
    let digits: String = s
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(0)
}
