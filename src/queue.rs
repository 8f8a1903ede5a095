// src/queue.rs
use crate::conn::Connection;
use crate::control::Control;
use crate::error::VaranResult;
use crate::syscalls::WakePipe;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

struct Inner<T> {
    items: VecDeque<T>,
    high_water: usize,
}

/// Bounded FIFO hand-off queue guarded by one mutex and one condition
/// variable. `push` refuses work at the capacity limit instead of
/// blocking; `pop` parks the consumer until an item arrives or shutdown
/// is requested.
pub struct WorkQueue<T> {
    name: &'static str,
    limit: usize,
    inner: Mutex<Inner<T>>,
    ready: Condvar,
    len_gauge: AtomicUsize,
    high_gauge: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl<T> WorkQueue<T> {
    /// `limit` of zero means unbounded.
    pub fn new(name: &'static str, limit: usize) -> Self {
        Self {
            name,
            limit,
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                high_water: 0,
            }),
            ready: Condvar::new(),
            len_gauge: AtomicUsize::new(0),
            high_gauge: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Enqueue an item, waking one consumer. At the capacity limit the
    /// item is handed back to the producer untouched.
    pub fn push(&self, item: T) -> Result<(), T> {
        {
            let mut inner = lock(&self.inner);
            if self.limit != 0 && inner.items.len() >= self.limit {
                return Err(item);
            }
            inner.items.push_back(item);

            let len = inner.items.len();
            self.len_gauge.store(len, Ordering::Relaxed);
            if len > inner.high_water {
                inner.high_water = len;
                self.high_gauge.store(len, Ordering::Relaxed);
            }
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Block until an item is available or shutdown is flagged.
    pub fn pop(&self, control: &Control) -> Option<T> {
        let mut inner = lock(&self.inner);
        loop {
            if let Some(item) = inner.items.pop_front() {
                self.len_gauge.store(inner.items.len(), Ordering::Relaxed);
                return Some(item);
            }
            if control.is_shutdown() {
                return None;
            }
            inner = match self.ready.wait(inner) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Non-blocking variant used by the I/O thread.
    pub fn try_pop(&self) -> Option<T> {
        let mut inner = lock(&self.inner);
        let item = inner.items.pop_front();
        if item.is_some() {
            self.len_gauge.store(inner.items.len(), Ordering::Relaxed);
        }
        item
    }

    /// Release every parked consumer, e.g. at shutdown.
    pub fn wake_all(&self) {
        drop(lock(&self.inner));
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.len_gauge.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn high_water(&self) -> usize {
        self.high_gauge.load(Ordering::Relaxed)
    }
}

/// The three hand-off stages between the I/O thread and the worker
/// pools, plus the self-pipe that breaks the multiplexer out of its
/// wait when completed work lands on `done`.
pub struct Queues {
    pub easy: WorkQueue<Box<Connection>>,
    pub hard: WorkQueue<Box<Connection>>,
    pub done: WorkQueue<Box<Connection>>,
    pub wake: WakePipe,
}

impl Queues {
    pub fn new(easy_limit: usize, hard_limit: usize) -> VaranResult<Self> {
        Ok(Self {
            easy: WorkQueue::new("easy", easy_limit),
            hard: WorkQueue::new("hard", hard_limit),
            done: WorkQueue::new("done", 0),
            wake: WakePipe::new()?,
        })
    }

    /// Done is unbounded, so this cannot refuse; every push wakes the
    /// I/O thread immediately.
    pub fn push_done(&self, conn: Box<Connection>) {
        tracing::debug!("push_done {}", conn.fd());
        let _ = self.done.push(conn);
        self.wake.notify();
    }

    pub fn wake_all(&self) {
        self.easy.wake_all();
        self.hard.wake_all();
        self.wake.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn bounded_push_fails_past_the_limit() {
        let q: WorkQueue<u32> = WorkQueue::new("test", 2);
        assert!(q.push(1).is_ok());
        assert!(q.push(2).is_ok());
        assert_eq!(q.push(3), Err(3));
        assert_eq!(q.push(4), Err(4));
        assert_eq!(q.len(), 2);

        // accepted items come out in order
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn zero_limit_is_unbounded() {
        let q: WorkQueue<u32> = WorkQueue::new("test", 0);
        for i in 0..1000 {
            assert!(q.push(i).is_ok());
        }
        assert_eq!(q.len(), 1000);
        assert_eq!(q.high_water(), 1000);
    }

    #[test]
    fn pop_blocks_until_pushed() {
        let q: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new("test", 0));
        let control = Arc::new(Control::default());
        let popped = Arc::new(AtomicBool::new(false));

        let (q2, c2, p2) = (q.clone(), control.clone(), popped.clone());
        let th = std::thread::spawn(move || {
            let item = q2.pop(&c2);
            p2.store(item.is_some(), Ordering::SeqCst);
            item
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!popped.load(Ordering::SeqCst));

        q.push(7).unwrap();
        assert_eq!(th.join().unwrap(), Some(7));
    }

    #[test]
    fn shutdown_releases_blocked_consumers() {
        let q: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new("test", 0));
        let control = Arc::new(Control::default());

        let (q2, c2) = (q.clone(), control.clone());
        let th = std::thread::spawn(move || q2.pop(&c2));

        std::thread::sleep(std::time::Duration::from_millis(50));
        control.request_shutdown();
        q.wake_all();
        assert_eq!(th.join().unwrap(), None);
    }

    #[test]
    fn high_water_tracks_peak_length() {
        let q: WorkQueue<u32> = WorkQueue::new("test", 0);
        q.push(1).unwrap();
        q.push(2).unwrap();
        q.try_pop();
        q.push(3).unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.high_water(), 2);
    }
}
