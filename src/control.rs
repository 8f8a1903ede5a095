// src/control.rs
use std::sync::atomic::{AtomicBool, Ordering};

/// Process-lifecycle token shared by every thread's loop condition.
///
/// The outside world (signal wiring, operators, tests) only ever talks
/// to the engine through these two flags: `shutdown` ends every loop
/// after its current unit of work, `rotate` asks the I/O thread to
/// reopen the log sink on its next iteration.
#[derive(Debug, Default)]
pub struct Control {
    shutdown: AtomicBool,
    rotate: AtomicBool,
}

impl Control {
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn request_rotate(&self) {
        self.rotate.store(true, Ordering::SeqCst);
    }

    /// Consume a pending rotate request.
    pub fn take_rotate(&self) -> bool {
        self.rotate.swap(false, Ordering::AcqRel)
    }
}
