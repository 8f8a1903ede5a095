// src/stats.rs
use crate::conn::{Connection, HttpState};
use crate::control::Control;
use crate::handler::{Handler, Task};
use crate::queue::Queues;
use crate::syscalls;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const TIME_DELTA: Duration = Duration::from_secs(4);
const STATS_SOCKET_TIMEOUT_US: i64 = 50_000;

struct Window {
    opened: Instant,
    requests: u64,
    total_us: u64,
    min_us: u64,
    max_us: u64,
}

impl Window {
    fn clear(&mut self, now: Instant) {
        self.opened = now;
        self.requests = 0;
        self.total_us = 0;
        self.min_us = u64::MAX;
        self.max_us = 0;
    }
}

/// Rolling server statistics. Response times and request counts
/// accumulate in a window that the I/O thread folds into the published
/// figures every few seconds; gauges (descriptors, pool size) are
/// plain atomics written by their owners and read by the reporter.
pub struct Stats {
    started: SystemTime,
    window: Mutex<Window>,

    rps_bits: AtomicU64,
    min_us: AtomicU64,
    avg_us: AtomicU64,
    max_us: AtomicU64,

    fd_count: AtomicUsize,
    pool_pages: AtomicUsize,
    pool_objects: AtomicUsize,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started: SystemTime::now(),
            window: Mutex::new(Window {
                opened: Instant::now(),
                requests: 0,
                total_us: 0,
                min_us: u64::MAX,
                max_us: 0,
            }),
            rps_bits: AtomicU64::new(0f64.to_bits()),
            min_us: AtomicU64::new(0),
            avg_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
            fd_count: AtomicUsize::new(0),
            pool_pages: AtomicUsize::new(0),
            pool_objects: AtomicUsize::new(0),
        }
    }

    /// Record one finished connection's lifetime in microseconds.
    pub fn report_response_time(&self, lifetime_us: u64) {
        let mut w = match self.window.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        w.requests += 1;
        w.total_us += lifetime_us;
        w.min_us = w.min_us.min(lifetime_us);
        w.max_us = w.max_us.max(lifetime_us);
    }

    /// Fold the current window into the published figures once it has
    /// been open long enough.
    pub fn process(&self) {
        let mut w = match self.window.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        let elapsed = now.duration_since(w.opened);
        if elapsed < TIME_DELTA {
            return;
        }

        let rps = w.requests as f64 / elapsed.as_secs_f64();
        self.rps_bits.store(rps.to_bits(), Ordering::Relaxed);
        self.min_us.store(
            if w.requests > 0 { w.min_us } else { 0 },
            Ordering::Relaxed,
        );
        self.avg_us.store(
            if w.requests > 0 {
                w.total_us / w.requests
            } else {
                0
            },
            Ordering::Relaxed,
        );
        self.max_us.store(w.max_us, Ordering::Relaxed);

        w.clear(now);
    }

    pub fn rps(&self) -> f64 {
        f64::from_bits(self.rps_bits.load(Ordering::Relaxed))
    }

    pub fn lifetime_min_ms(&self) -> f64 {
        self.min_us.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn lifetime_avg_ms(&self) -> f64 {
        self.avg_us.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn lifetime_max_ms(&self) -> f64 {
        self.max_us.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn set_fd_count(&self, count: usize) {
        self.fd_count.store(count, Ordering::Relaxed);
    }

    pub fn fd_count(&self) -> usize {
        self.fd_count.load(Ordering::Relaxed)
    }

    pub fn set_pool_gauges(&self, pages: usize, objects: usize) {
        self.pool_pages.store(pages, Ordering::Relaxed);
        self.pool_objects.store(objects, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let started = self
            .started
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        now.as_secs().saturating_sub(started.as_secs())
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-structure status document served by the stats listener.
pub fn build_report(stats: &Stats, queues: &Queues, handler_version: &str) -> String {
    let (utime, stime) = syscalls::rusage_self();

    let mut resp = String::with_capacity(1024);
    resp.push_str("<varan_stats>\n");
    resp.push_str(&format!(
        "\t<varan_version>{}</varan_version>\n",
        crate::VERSION
    ));
    resp.push_str(&format!(
        "\t<handler_version>{}</handler_version>\n",
        handler_version
    ));
    resp.push_str(&format!("\t<uptime>{}</uptime>\n", stats.uptime_secs()));
    resp.push_str(&format!("\t<rps>{:.4}</rps>\n", stats.rps()));
    resp.push_str(&format!("\t<fd_count>{}</fd_count>\n", stats.fd_count()));
    resp.push_str(&format!(
        "\t<queues>\n\t\t<easy>{}</easy>\n\t\t<max_easy>{}</max_easy>\n\t\t<hard>{}</hard>\n\t\t<max_hard>{}</max_hard>\n\t\t<done>{}</done>\n\t\t<max_done>{}</max_done>\n\t</queues>\n",
        queues.easy.len(),
        queues.easy.high_water(),
        queues.hard.len(),
        queues.hard.high_water(),
        queues.done.len(),
        queues.done.high_water(),
    ));
    resp.push_str(&format!(
        "\t<conn_time>\n\t\t<min>{:.4}</min>\n\t\t<avg>{:.4}</avg>\n\t\t<max>{:.4}</max>\n\t</conn_time>\n",
        stats.lifetime_min_ms(),
        stats.lifetime_avg_ms(),
        stats.lifetime_max_ms(),
    ));
    resp.push_str(&format!(
        "\t<mem_allocator>\n\t\t<pages>{}</pages>\n\t\t<objects>{}</objects>\n\t</mem_allocator>\n",
        stats.pool_pages.load(Ordering::Relaxed),
        stats.pool_objects.load(Ordering::Relaxed),
    ));
    resp.push_str(&format!(
        "\t<rusage>\n\t\t<utime>{}</utime>\n\t\t<stime>{}</stime>\n\t</rusage>\n",
        utime, stime
    ));
    resp.push_str("</varan_stats>\n");
    resp
}

pub struct StatsCtx {
    pub listener: RawFd,
    pub stats: Arc<Stats>,
    pub queues: Arc<Queues>,
    pub handler: Arc<dyn Handler>,
    pub control: Arc<Control>,
}

/// Secondary listener answering any HTTP request with the status
/// report. Uses one locally reused connection object over blocking
/// sockets with short timeouts; never touches the main engine.
pub fn stats_loop(ctx: StatsCtx) {
    let mut parser = Connection::empty();

    while !ctx.control.is_shutdown() {
        match syscalls::accept_connection(ctx.listener, false) {
            Ok(Some((fd, ip))) => {
                if let Err(e) = syscalls::set_socket_timeout(fd, STATS_SOCKET_TIMEOUT_US) {
                    tracing::error!("stats: socket timeout setup failed: {}", e);
                    syscalls::close_fd(fd);
                    continue;
                }

                tracing::debug!("stats: accepted {} from {}", fd, ip);
                parser.init(fd, ip);

                loop {
                    if ctx.control.is_shutdown() {
                        break;
                    }

                    parser.allow_read();
                    parser.allow_write();
                    parser.process();

                    if parser.state() == HttpState::ReadyToHandle {
                        tracing::info!(
                            target: "access",
                            "{}|{}?{}|stats",
                            parser.peer(),
                            parser.uri_path(),
                            parser.uri_params()
                        );

                        parser.set_response_status(200);
                        parser.set_response_header("Content-type", "text/plain");
                        let report =
                            build_report(&ctx.stats, &ctx.queues, ctx.handler.version_string());
                        parser.append_response_body(report.as_bytes());
                    } else if parser.state() == HttpState::Done {
                        break;
                    } else if parser.rdeof() {
                        break;
                    }
                }

                parser.destroy();
                ctx.stats.process();
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!("stats: accept failed: {}", e);
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_publishes_after_delta() {
        let stats = Stats::new();
        stats.report_response_time(1_000);
        stats.report_response_time(3_000);

        // window still open: published figures unchanged
        stats.process();
        assert_eq!(stats.rps(), 0.0);

        // force the window open long enough
        {
            let mut w = stats.window.lock().unwrap();
            w.opened = Instant::now() - Duration::from_secs(5);
        }
        stats.process();
        assert!(stats.rps() > 0.0);
        assert_eq!(stats.lifetime_min_ms(), 1.0);
        assert_eq!(stats.lifetime_avg_ms(), 2.0);
        assert_eq!(stats.lifetime_max_ms(), 3.0);
    }

    #[test]
    fn report_carries_queue_gauges() {
        let stats = Stats::new();
        stats.set_fd_count(7);
        stats.set_pool_gauges(2, 1000);
        let queues = Queues::new(0, 0).unwrap();

        let report = build_report(&stats, &queues, "test/1.0");
        assert!(report.starts_with("<varan_stats>\n"));
        assert!(report.contains("<handler_version>test/1.0</handler_version>"));
        assert!(report.contains("<fd_count>7</fd_count>"));
        assert!(report.contains("<pages>2</pages>"));
        assert!(report.contains("<objects>1000</objects>"));
        assert!(report.ends_with("</varan_stats>\n"));
    }
}
