// src/workers.rs
use crate::conn::Connection;
use crate::control::Control;
use crate::handler::{Handler, Outcome, Task};
use crate::queue::Queues;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct WorkerCtx {
    pub queues: Arc<Queues>,
    pub handler: Arc<dyn Handler>,
    pub control: Arc<Control>,
    pub hard_threads: usize,
}

/// Stamp a 503 onto a connection the engine refuses to hand to (or
/// failed in) a handler.
pub(crate) fn reject_overload(conn: &mut Connection, message: &str) {
    conn.set_response_status(503);
    conn.set_response_header("Content-type", "text/plain");
    conn.append_response_body(message.as_bytes());
}

/// Easy pool loop: pop one connection, run the handler, route on its
/// verdict. Escalation moves the connection to the hard queue; a full
/// hard queue or a missing hard pool degrades to a local 503. The
/// worker never blocks pushing — only `pop` parks it.
pub fn easy_loop(ctx: &WorkerCtx) {
    while let Some(mut conn) = ctx.queues.easy.pop(&ctx.control) {
        tracing::debug!("easy worker picked up {}", conn.fd());

        match ctx.handler.handle_easy(&mut *conn) {
            Outcome::Success => ctx.queues.push_done(conn),
            Outcome::Hard => {
                if ctx.hard_threads > 0 {
                    if let Err(mut conn) = ctx.queues.hard.push(conn) {
                        tracing::debug!(
                            "hard queue full at limit {}",
                            ctx.queues.hard.limit()
                        );
                        reject_overload(&mut conn, "hard queue filled!");
                        ctx.queues.push_done(conn);
                    }
                } else {
                    tracing::error!(
                        "easy worker escalated but no hard workers are configured"
                    );
                    reject_overload(&mut conn, "easy loop error");
                    ctx.queues.push_done(conn);
                }
            }
            Outcome::Error => {
                tracing::error!("easy handler reports error");
                reject_overload(&mut conn, "easy loop error");
                ctx.queues.push_done(conn);
            }
        }
    }
}

/// Hard pool loop. Escalating from here has nowhere to go, so it is an
/// error like any other.
pub fn hard_loop(ctx: &WorkerCtx) {
    while let Some(mut conn) = ctx.queues.hard.pop(&ctx.control) {
        tracing::debug!("hard worker picked up {}", conn.fd());

        match ctx.handler.handle_hard(&mut *conn) {
            Outcome::Success => ctx.queues.push_done(conn),
            Outcome::Hard | Outcome::Error => {
                tracing::error!("hard handler reports error");
                reject_overload(&mut conn, "hard loop error");
                ctx.queues.push_done(conn);
            }
        }
    }
}

pub struct IdleCtx {
    pub handler: Arc<dyn Handler>,
    pub control: Arc<Control>,
    pub idle_timeout_ms: u64,
}

/// Periodic idle hook. A zero interval means "run once, then just wait
/// for shutdown".
pub fn idle_loop(ctx: IdleCtx) {
    if ctx.idle_timeout_ms == 0 {
        tracing::debug!("idle loop: running once");
        ctx.handler.idle();
        while !ctx.control.is_shutdown() {
            std::thread::sleep(Duration::from_secs(1));
        }
    } else {
        tracing::debug!("idle loop: running every {} ms", ctx.idle_timeout_ms);
        while !ctx.control.is_shutdown() {
            ctx.handler.idle();
            std::thread::sleep(Duration::from_millis(ctx.idle_timeout_ms));
        }
    }
}
