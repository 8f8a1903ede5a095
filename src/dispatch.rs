// src/dispatch.rs
use crate::conn::HttpState;
use crate::control::Control;
use crate::error::VaranResult;
use crate::handler::Task;
use crate::logging::RotatingFile;
use crate::queue::Queues;
use crate::registry::Registry;
use crate::stats::Stats;
use crate::syscalls::{self, Epoll};
use crate::workers;
use std::os::fd::RawFd;
use std::sync::Arc;

const EPOLL_EVENTS: usize = 1024;

const EPOLLIN: u32 = libc::EPOLLIN as u32;
const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
const EPOLLET: u32 = libc::EPOLLET as u32;
const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
const EPOLLERR: u32 = libc::EPOLLERR as u32;

/// The single I/O-multiplexing thread: accepts connections, drives each
/// one's state machine on readiness, hands completed requests to the
/// easy queue, and resumes write-out for connections the workers are
/// finished with. Never blocks on a connection's socket — only in the
/// bounded epoll wait.
pub struct Dispatcher {
    epoll: Epoll,
    listener: RawFd,
    registry: Registry,
    queues: Arc<Queues>,
    stats: Arc<Stats>,
    control: Arc<Control>,
    connection_timeout_ms: u64,
    log_file: Option<RotatingFile>,
    events: Vec<libc::epoll_event>,
}

impl Dispatcher {
    pub fn new(
        listener: RawFd,
        queues: Arc<Queues>,
        stats: Arc<Stats>,
        control: Arc<Control>,
        connection_timeout_ms: u64,
        log_file: Option<RotatingFile>,
    ) -> VaranResult<Self> {
        let epoll = Epoll::new()?;
        epoll.add(listener, EPOLLIN)?;
        epoll.add(queues.wake.read_fd(), EPOLLIN | EPOLLET)?;

        Ok(Self {
            epoll,
            listener,
            registry: Registry::new(stats.clone()),
            queues,
            stats,
            control,
            connection_timeout_ms,
            log_file,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; EPOLL_EVENTS],
        })
    }

    /// Loop until shutdown. A multiplexer-level failure propagates out
    /// and is fatal to the whole process; per-descriptor failures are
    /// contained inside one iteration.
    pub fn run(&mut self) -> VaranResult<()> {
        while !self.control.is_shutdown() {
            self.tick()?;
        }
        tracing::info!("i/o dispatcher exiting");
        Ok(())
    }

    fn tick(&mut self) -> VaranResult<()> {
        self.drain_done();

        let nfds = self
            .epoll
            .wait(&mut self.events, Registry::min_timeout())?;

        for i in 0..nfds {
            let event = self.events[i];
            let fd = event.u64 as RawFd;
            let flags = event.events;

            if fd == self.queues.wake.read_fd() {
                self.queues.wake.drain();
            } else if fd == self.listener {
                self.accept_one();
            } else if flags & (EPOLLHUP | EPOLLERR) != 0 {
                tracing::debug!("closing {}: hangup/error event", fd);
                self.hangup(fd);
            } else {
                let readable = flags & EPOLLIN != 0;
                let writable = flags & EPOLLOUT != 0;
                if self.registry.allow_io(fd, readable, writable) {
                    self.drive(fd);
                } else {
                    tracing::error!("event for unregistered descriptor {}", fd);
                }
            }
        }

        self.registry.kill_oldest(self.connection_timeout_ms);
        self.stats.process();

        if self.control.take_rotate() {
            if let Some(file) = &self.log_file {
                match file.reopen() {
                    Ok(()) => tracing::info!("log file reopened"),
                    Err(e) => tracing::error!("log rotation failed: {}", e),
                }
            }
        }

        Ok(())
    }

    /// Resume connections the workers finished with. Entries whose
    /// descriptor was closed while queued are released instead.
    fn drain_done(&mut self) {
        while let Some(conn) = self.queues.done.try_pop() {
            if let Some(fd) = self.registry.hand_back(conn) {
                tracing::debug!("{} is still alive", fd);
                self.drive(fd);
            }
        }
    }

    fn accept_one(&mut self) {
        match syscalls::accept_connection(self.listener, true) {
            Ok(Some((fd, ip))) => {
                tracing::debug!("accepted {} from {}", fd, ip);

                if !self.registry.create(fd, ip) {
                    tracing::error!("descriptor {} is still registered", fd);
                    syscalls::close_fd(fd);
                    return;
                }
                if let Err(e) = self.epoll.add(fd, EPOLLIN | EPOLLOUT | EPOLLET) {
                    tracing::error!("epoll registration for {} failed: {}", fd, e);
                    self.registry.del(fd);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::error!("accept failed: {}", e),
        }
    }

    fn hangup(&mut self, fd: RawFd) {
        if let Some(conn) = self.registry.get_mut(fd) {
            conn.set_rdeof();
            conn.set_wreof();
        }
        self.epoll.delete(fd).ok();
        self.registry.del(fd);
    }

    /// Advance one resident connection and act on the state it lands
    /// in: a parsed request is locked out to the easy queue (or refused
    /// with a 503 when the queue is full); a finished connection is
    /// released.
    fn drive(&mut self, fd: RawFd) {
        let state = match self.registry.get_mut(fd) {
            Some(conn) => {
                conn.process();
                if conn.state() == HttpState::ReadyToHandle {
                    tracing::info!(
                        target: "access",
                        "{}|{}?{}|",
                        conn.peer(),
                        conn.uri_path(),
                        conn.uri_params()
                    );
                }
                conn.state()
            }
            None => return,
        };

        match state {
            HttpState::ReadyToHandle => {
                if let Some(conn) = self.registry.check_out(fd) {
                    if let Err(mut conn) = self.queues.easy.push(conn) {
                        tracing::debug!(
                            "easy queue full at limit {}",
                            self.queues.easy.limit()
                        );
                        workers::reject_overload(&mut conn, "easy queue filled!");
                        self.queues.push_done(conn);
                    }
                }
            }
            HttpState::Done | HttpState::Undefined => {
                tracing::debug!("{} is done, releasing", fd);
                self.epoll.delete(fd).ok();
                self.registry.del(fd);
            }
            _ => {}
        }
    }
}
