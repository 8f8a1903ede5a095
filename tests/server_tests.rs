use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;
use varan::{Handler, Outcome, Server, ServerConfig, Task};
use varan::config::ListenAddr;

fn test_config() -> ServerConfig {
    ServerConfig {
        listen: ListenAddr {
            ip: "127.0.0.1".to_string(),
            port: 0,
        },
        stats: ListenAddr {
            ip: "127.0.0.1".to_string(),
            port: 0,
        },
        connection_timeout_ms: 10_000,
        idle_timeout_ms: 0,
        easy_threads: 2,
        hard_threads: 1,
        easy_queue_limit: 0,
        hard_queue_limit: 0,
        handler_params: String::new(),
        log_level: "error".to_string(),
        log_file: None,
    }
}

fn start(config: ServerConfig, handler: Arc<dyn Handler>) -> (ServerUnderTest, std::net::SocketAddr) {
    let server = Server::new(config, handler).expect("server setup");
    let addr = server.local_addr();
    let stats_addr = server.stats_addr();
    let shutdown = server.shutdown_handle();
    let join = thread::spawn(move || server.serve());
    (
        ServerUnderTest {
            shutdown,
            join: Some(join),
            stats_addr,
        },
        addr,
    )
}

struct ServerUnderTest {
    shutdown: varan::ShutdownHandle,
    join: Option<thread::JoinHandle<varan::VaranResult<()>>>,
    stats_addr: std::net::SocketAddr,
}

impl Drop for ServerUnderTest {
    fn drop(&mut self) {
        self.shutdown.shutdown();
        if let Some(join) = self.join.take() {
            join.join().expect("server thread").expect("serve result");
        }
    }
}

fn exchange(addr: std::net::SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("read timeout");
    stream.write_all(request).expect("send request");
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).expect("read reply");
    String::from_utf8_lossy(&reply).into_owned()
}

struct HelloHandler;

impl Handler for HelloHandler {
    fn handle_easy(&self, task: &mut dyn Task) -> Outcome {
        task.set_response_status(200);
        task.set_response_header("Content-type", "text/plain");
        task.append_response_body(b"Hello, world!\n");
        Outcome::Success
    }

    fn handle_hard(&self, _task: &mut dyn Task) -> Outcome {
        Outcome::Error
    }

    fn version_string(&self) -> &str {
        "hello/1.0"
    }
}

#[test]
fn serves_a_simple_get() {
    let (server, addr) = start(test_config(), Arc::new(HelloHandler));

    let reply = exchange(addr, b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "reply: {reply}");
    assert!(reply.contains("Content-Length: 14\r\n"));
    assert!(reply.ends_with("Hello, world!\n"));

    drop(server);
}

struct EchoHandler;

impl Handler for EchoHandler {
    fn handle_easy(&self, task: &mut dyn Task) -> Outcome {
        let body = task.body().to_vec();
        task.set_response_status(200);
        task.set_response_header("Content-type", "application/octet-stream");
        task.append_response_body(&body);
        Outcome::Success
    }

    fn handle_hard(&self, _task: &mut dyn Task) -> Outcome {
        Outcome::Error
    }

    fn version_string(&self) -> &str {
        "echo/1.0"
    }
}

#[test]
fn echoes_a_post_body() {
    let (server, addr) = start(test_config(), Arc::new(EchoHandler));

    let body = b"0123456789abcdef";
    let request = format!(
        "POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    let mut wire = request.into_bytes();
    wire.extend_from_slice(body);

    let reply = exchange(addr, &wire);
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "reply: {reply}");
    assert!(reply.contains(&format!("Content-Length: {}\r\n", body.len())));
    assert!(reply.ends_with("0123456789abcdef"));

    drop(server);
}

struct EscalatingHandler;

impl Handler for EscalatingHandler {
    fn handle_easy(&self, _task: &mut dyn Task) -> Outcome {
        Outcome::Hard
    }

    fn handle_hard(&self, task: &mut dyn Task) -> Outcome {
        task.set_response_status(200);
        task.set_response_header("Content-type", "text/plain");
        task.append_response_body(b"handled on the hard pool\n");
        Outcome::Success
    }

    fn version_string(&self) -> &str {
        "escalating/1.0"
    }
}

#[test]
fn escalated_requests_finish_on_the_hard_pool() {
    let (server, addr) = start(test_config(), Arc::new(EscalatingHandler));

    let reply = exchange(addr, b"GET /work HTTP/1.1\r\n\r\n");
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "reply: {reply}");
    assert!(reply.ends_with("handled on the hard pool\n"));

    drop(server);
}

#[test]
fn escalation_without_hard_pool_yields_503() {
    let mut config = test_config();
    config.hard_threads = 0;
    let (server, addr) = start(config, Arc::new(EscalatingHandler));

    let reply = exchange(addr, b"GET /work HTTP/1.1\r\n\r\n");
    assert!(
        reply.starts_with("HTTP/1.1 503 Service Unavailable\r\n"),
        "reply: {reply}"
    );

    drop(server);
}

/// Handler that parks every easy invocation on a gate until the test
/// opens it, so the easy queue can be observed while full.
struct GatedHandler {
    started: Arc<(Mutex<usize>, Condvar)>,
    gate: Arc<(Mutex<bool>, Condvar)>,
}

impl Handler for GatedHandler {
    fn handle_easy(&self, task: &mut dyn Task) -> Outcome {
        {
            let (lock, cond) = &*self.started;
            let mut count = lock.lock().unwrap();
            *count += 1;
            cond.notify_all();
        }
        {
            let (lock, cond) = &*self.gate;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = cond.wait(open).unwrap();
            }
        }
        task.set_response_status(200);
        task.append_response_body(b"ok\n");
        Outcome::Success
    }

    fn handle_hard(&self, _task: &mut dyn Task) -> Outcome {
        Outcome::Error
    }

    fn version_string(&self) -> &str {
        "gated/1.0"
    }
}

#[test]
fn full_easy_queue_answers_503() {
    let started = Arc::new((Mutex::new(0usize), Condvar::new()));
    let gate = Arc::new((Mutex::new(false), Condvar::new()));
    let handler = Arc::new(GatedHandler {
        started: started.clone(),
        gate: gate.clone(),
    });

    let mut config = test_config();
    config.easy_threads = 1;
    config.hard_threads = 0;
    config.easy_queue_limit = 1;
    let (server, addr) = start(config, handler);

    let spawn_client = |path: &'static str| {
        thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).expect("connect");
            stream
                .set_read_timeout(Some(Duration::from_secs(10)))
                .expect("read timeout");
            stream
                .write_all(format!("GET {} HTTP/1.1\r\n\r\n", path).as_bytes())
                .expect("send");
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).expect("read");
            String::from_utf8_lossy(&reply).into_owned()
        })
    };

    // first request is popped by the lone worker and parks on the gate
    let first = spawn_client("/one");
    {
        let (lock, cond) = &*started;
        let mut count = lock.lock().unwrap();
        while *count == 0 {
            count = cond.wait(count).unwrap();
        }
    }

    // second request fills the queue (capacity 1)
    let second = spawn_client("/two");
    thread::sleep(Duration::from_millis(300));

    // third request cannot be queued and is refused with 503
    let third = spawn_client("/three");
    let third_reply = third.join().expect("third client");
    assert!(
        third_reply.starts_with("HTTP/1.1 503 Service Unavailable\r\n"),
        "reply: {third_reply}"
    );
    assert!(third_reply.contains("easy queue filled!"));

    // open the gate; the two accepted requests complete normally
    {
        let (lock, cond) = &*gate;
        *lock.lock().unwrap() = true;
        cond.notify_all();
    }
    for client in [first, second] {
        let reply = client.join().expect("client");
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "reply: {reply}");
    }

    drop(server);
}

#[test]
fn stats_endpoint_reports_engine_state() {
    let (server, addr) = start(test_config(), Arc::new(HelloHandler));

    // generate a little traffic first
    let reply = exchange(addr, b"GET /hello HTTP/1.1\r\n\r\n");
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));

    let report = exchange(server.stats_addr, b"GET /stats HTTP/1.1\r\n\r\n");
    assert!(report.starts_with("HTTP/1.1 200 OK\r\n"), "report: {report}");
    assert!(report.contains("<varan_stats>"));
    assert!(report.contains("<handler_version>hello/1.0</handler_version>"));
    assert!(report.contains("<uptime>"));
    assert!(report.contains("<rps>"));
    assert!(report.contains("<queues>"));
    assert!(report.contains("<mem_allocator>"));

    drop(server);
}

#[test]
fn malformed_request_line_gets_a_400() {
    let (server, addr) = start(test_config(), Arc::new(HelloHandler));

    let reply = exchange(addr, b"GET /broken\r\n\r\n");
    assert!(
        reply.starts_with("HTTP/1.0 400 Bad Request\r\n"),
        "reply: {reply}"
    );

    drop(server);
}
