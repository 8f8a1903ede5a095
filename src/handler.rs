// src/handler.rs
use std::net::IpAddr;

/// Request methods the front end understands. Anything else is answered
/// with 501 before a handler ever sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Undefined,
    Get,
    Post,
    Head,
}

impl Default for Method {
    fn default() -> Self {
        Method::Undefined
    }
}

/// Three-valued handler verdict routing a connection after handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Response is complete; hand the connection back for write-out.
    Success,
    /// The request needs the heavier pool; escalate to a hard worker.
    Hard,
    /// Handling failed; the engine synthesizes a 503.
    Error,
}

/// Capability surface a parsed connection exposes to handlers.
///
/// Read accessors cover the request; write accessors shape the response.
/// Handlers never touch the socket.
pub trait Task {
    fn method(&self) -> Method;
    fn version(&self) -> (i32, i32);
    fn keepalive(&self) -> bool;
    fn cache(&self) -> bool;
    fn peer(&self) -> IpAddr;

    fn uri_path(&self) -> &str;
    fn uri_params(&self) -> &str;

    fn body(&self) -> &[u8];
    fn body_len(&self) -> usize;

    /// Case-insensitive lookup of a request header value.
    fn header(&self, name: &str) -> Option<&str>;
    fn headers_num(&self) -> usize;
    fn header_at(&self, index: usize) -> Option<(&str, &str)>;

    fn set_response_status(&mut self, status: u16);
    fn set_keepalive(&mut self, keep_alive: bool);
    fn set_cache(&mut self, cache: bool);
    fn set_response_header(&mut self, name: &str, value: &str);
    fn append_response_body(&mut self, data: &[u8]);
}

/// A statically linked request handler driving both worker pools.
pub trait Handler: Send + Sync {
    /// Receives the configuration's opaque parameter blob at startup,
    /// before any listener opens.
    fn configure(&self, _params: &str) -> Result<(), String> {
        Ok(())
    }

    fn handle_easy(&self, task: &mut dyn Task) -> Outcome;
    fn handle_hard(&self, task: &mut dyn Task) -> Outcome;

    /// Invoked periodically from the idle thread.
    fn idle(&self) {}

    fn version_string(&self) -> &str;
}
