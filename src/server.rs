// src/server.rs
use crate::config::ServerConfig;
use crate::control::Control;
use crate::dispatch::Dispatcher;
use crate::error::{VaranError, VaranResult};
use crate::handler::Handler;
use crate::logging::RotatingFile;
use crate::queue::Queues;
use crate::stats::{self, Stats, StatsCtx};
use crate::syscalls;
use crate::workers::{self, IdleCtx, WorkerCtx};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::thread;

const STATS_LISTENER_TIMEOUT_US: i64 = 50_000;

/// Owns the listeners and the fixed thread topology: one I/O
/// dispatcher, the easy and hard worker pools, the idle thread, and the
/// stats listener thread. Sockets are opened (and the configuration
/// validated) in [`Server::new`], before any thread starts.
pub struct Server {
    config: ServerConfig,
    handler: Arc<dyn Handler>,
    control: Arc<Control>,
    queues: Arc<Queues>,
    stats: Arc<Stats>,
    listener: RawFd,
    stats_listener: RawFd,
    local: SocketAddr,
    stats_local: SocketAddr,
    log_file: Option<RotatingFile>,
}

/// Cheap clone handed to signal wiring and tests; flips the control
/// flags and wakes every parked thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    control: Arc<Control>,
    queues: Arc<Queues>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.control.request_shutdown();
        self.queues.wake_all();
    }

    pub fn rotate_logs(&self) {
        self.control.request_rotate();
        self.queues.wake.notify();
    }
}

impl Server {
    pub fn new(config: ServerConfig, handler: Arc<dyn Handler>) -> VaranResult<Self> {
        config.validate()?;
        syscalls::ignore_sigpipe();

        if !config.handler_params.is_empty() {
            handler
                .configure(&config.handler_params)
                .map_err(VaranError::Handler)?;
        }

        let listener = syscalls::create_listen_socket(&config.listen.ip, config.listen.port, true)?;
        let local = syscalls::local_addr(listener)?;
        tracing::info!("{} is bound to {}", crate::SERVER_NAME, local);

        let stats_listener =
            match syscalls::create_listen_socket(&config.stats.ip, config.stats.port, false) {
                Ok(fd) => fd,
                Err(e) => {
                    syscalls::close_fd(listener);
                    return Err(e);
                }
            };
        if let Err(e) = syscalls::set_socket_timeout(stats_listener, STATS_LISTENER_TIMEOUT_US) {
            syscalls::close_fd(listener);
            syscalls::close_fd(stats_listener);
            return Err(e);
        }
        let stats_local = syscalls::local_addr(stats_listener)?;
        tracing::info!("statistics endpoint is bound to {}", stats_local);

        let queues = Arc::new(Queues::new(
            config.easy_queue_limit,
            config.hard_queue_limit,
        )?);

        Ok(Self {
            config,
            handler,
            control: Arc::new(Control::default()),
            queues,
            stats: Arc::new(Stats::new()),
            listener,
            stats_listener,
            local,
            stats_local,
            log_file: None,
        })
    }

    /// Attach the log sink the dispatcher should reopen on rotate
    /// requests.
    pub fn with_log_file(mut self, file: RotatingFile) -> Self {
        self.log_file = Some(file);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn stats_addr(&self) -> SocketAddr {
        self.stats_local
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            control: self.control.clone(),
            queues: self.queues.clone(),
        }
    }

    /// Spawn the whole topology and block until shutdown.
    pub fn serve(self) -> VaranResult<()> {
        let Server {
            config,
            handler,
            control,
            queues,
            stats,
            listener,
            stats_listener,
            log_file,
            ..
        } = self;

        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let mut handles = Vec::with_capacity(config.easy_threads + config.hard_threads + 3);

        tracing::info!(
            "starting workers {{easy: {}, hard: {}}}",
            config.easy_threads,
            config.hard_threads
        );

        let mut dispatcher = Dispatcher::new(
            listener,
            queues.clone(),
            stats.clone(),
            control.clone(),
            config.connection_timeout_ms,
            log_file,
        )?;
        {
            let control = control.clone();
            let queues = queues.clone();
            handles.push(
                thread::Builder::new()
                    .name("varan-io".to_string())
                    .spawn(move || {
                        if let Err(e) = dispatcher.run() {
                            tracing::error!("i/o dispatcher failed: {}", e);
                        }
                        // nothing feeds the pools once the dispatcher exits
                        control.request_shutdown();
                        queues.wake_all();
                    })?,
            );
        }

        let worker_ctx = WorkerCtx {
            queues: queues.clone(),
            handler: handler.clone(),
            control: control.clone(),
            hard_threads: config.hard_threads,
        };

        for i in 0..config.easy_threads {
            let ctx = worker_ctx.clone();
            let core = pick_core(&core_ids, i);
            handles.push(
                thread::Builder::new()
                    .name(format!("varan-easy-{}", i))
                    .spawn(move || {
                        if let Some(id) = core {
                            core_affinity::set_for_current(id);
                        }
                        workers::easy_loop(&ctx);
                    })?,
            );
        }

        for i in 0..config.hard_threads {
            let ctx = worker_ctx.clone();
            let core = pick_core(&core_ids, config.easy_threads + i);
            handles.push(
                thread::Builder::new()
                    .name(format!("varan-hard-{}", i))
                    .spawn(move || {
                        if let Some(id) = core {
                            core_affinity::set_for_current(id);
                        }
                        workers::hard_loop(&ctx);
                    })?,
            );
        }

        {
            let ctx = IdleCtx {
                handler: handler.clone(),
                control: control.clone(),
                idle_timeout_ms: config.idle_timeout_ms,
            };
            handles.push(
                thread::Builder::new()
                    .name("varan-idle".to_string())
                    .spawn(move || workers::idle_loop(ctx))?,
            );
        }

        {
            let ctx = StatsCtx {
                listener: stats_listener,
                stats: stats.clone(),
                queues: queues.clone(),
                handler: handler.clone(),
                control: control.clone(),
            };
            handles.push(
                thread::Builder::new()
                    .name("varan-stats".to_string())
                    .spawn(move || stats::stats_loop(ctx))?,
            );
        }

        for handle in handles {
            let _ = handle.join();
        }

        syscalls::close_fd(listener);
        syscalls::close_fd(stats_listener);

        tracing::info!("{} shut down", crate::SERVER_NAME);
        Ok(())
    }
}

fn pick_core(core_ids: &[core_affinity::CoreId], index: usize) -> Option<core_affinity::CoreId> {
    if core_ids.is_empty() {
        None
    } else {
        core_ids.get(index % core_ids.len()).copied()
    }
}
