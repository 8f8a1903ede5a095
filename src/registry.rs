// src/registry.rs
use crate::conn::Connection;
use crate::pool::Pool;
use crate::stats::Stats;
use crate::syscalls;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::os::fd::RawFd;
use std::sync::Arc;

const EPOLL_TIMEOUT_MS: i32 = 100;

/// Ordered association from last-access stamp to descriptor, so idle
/// entries can be enumerated without a full scan. Re-registering a
/// descriptor moves it to the most-recent position.
struct TimeIndex {
    by_time: BTreeMap<(u64, RawFd), ()>,
    stamps: HashMap<RawFd, u64>,
}

impl TimeIndex {
    fn new() -> Self {
        Self {
            by_time: BTreeMap::new(),
            stamps: HashMap::new(),
        }
    }

    fn reg(&mut self, fd: RawFd, now: u64) {
        if let Some(old) = self.stamps.insert(fd, now) {
            self.by_time.remove(&(old, fd));
        }
        self.by_time.insert((now, fd), ());
    }

    fn del(&mut self, fd: RawFd) {
        if let Some(stamp) = self.stamps.remove(&fd) {
            self.by_time.remove(&(stamp, fd));
        }
    }

    /// Descriptors whose last touch predates `threshold`.
    fn expired(&self, threshold: u64) -> Vec<RawFd> {
        self.by_time
            .range(..(threshold, RawFd::MIN))
            .map(|((_, fd), _)| *fd)
            .collect()
    }
}

/// Where a registered connection currently lives.
enum Slot {
    /// Owned by the registry; the I/O thread may drive it.
    Resident(Box<Connection>),
    /// Moved onto a queue or into a worker. The tombstone remembers an
    /// eviction request and any readiness edges that arrived meanwhile.
    CheckedOut {
        evicted: bool,
        pending_read: bool,
        pending_write: bool,
    },
}

struct Entry {
    slot: Slot,
    first_access: u64,
    last_access: u64,
}

/// Registry of live connections keyed by descriptor, backed by the
/// object pool and the timeout index. Only the I/O thread touches it;
/// cross-thread hand-off happens by moving the boxed connection through
/// the queues and back via [`Registry::hand_back`].
pub struct Registry {
    slots: HashMap<RawFd, Entry>,
    timeouts: TimeIndex,
    pool: Pool<Connection>,
    stats: Arc<Stats>,
}

impl Registry {
    pub fn new(stats: Arc<Stats>) -> Self {
        Self {
            slots: HashMap::new(),
            timeouts: TimeIndex::new(),
            pool: Pool::new(),
            stats,
        }
    }

    /// Insert a pooled connection for a freshly accepted descriptor.
    /// Refuses a descriptor that is somehow still registered.
    pub fn create(&mut self, fd: RawFd, peer: IpAddr) -> bool {
        if self.slots.contains_key(&fd) {
            return false;
        }

        let mut conn = self.pool.allocate();
        conn.init(fd, peer);

        let now = syscalls::fine_clock_us();
        self.slots.insert(
            fd,
            Entry {
                slot: Slot::Resident(conn),
                first_access: now,
                last_access: now,
            },
        );
        self.timeouts.reg(fd, now);
        true
    }

    /// Borrow a resident connection for driving, refreshing its idle
    /// stamp. Checked-out entries yield `None` — they are owned
    /// elsewhere.
    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Connection> {
        let entry = self.slots.get_mut(&fd)?;
        match &mut entry.slot {
            Slot::Resident(conn) => {
                let now = syscalls::fine_clock_us();
                entry.last_access = now;
                self.timeouts.reg(fd, now);
                Some(conn)
            }
            Slot::CheckedOut { .. } => None,
        }
    }

    /// Record readiness for a descriptor. Resident connections get
    /// their flags raised directly; checked-out ones stash the edges in
    /// the tombstone for replay at hand-back. Returns `false` for an
    /// unknown descriptor.
    pub fn allow_io(&mut self, fd: RawFd, readable: bool, writable: bool) -> bool {
        let Some(entry) = self.slots.get_mut(&fd) else {
            return false;
        };
        match &mut entry.slot {
            Slot::Resident(conn) => {
                if readable {
                    conn.allow_read();
                }
                if writable {
                    conn.allow_write();
                }
                let now = syscalls::fine_clock_us();
                entry.last_access = now;
                self.timeouts.reg(fd, now);
            }
            Slot::CheckedOut {
                pending_read,
                pending_write,
                ..
            } => {
                *pending_read |= readable;
                *pending_write |= writable;
            }
        }
        true
    }

    /// Move the connection out for queueing; the slot becomes a
    /// tombstone until [`Registry::hand_back`].
    pub fn check_out(&mut self, fd: RawFd) -> Option<Box<Connection>> {
        let entry = self.slots.get_mut(&fd)?;
        let taken = std::mem::replace(
            &mut entry.slot,
            Slot::CheckedOut {
                evicted: false,
                pending_read: false,
                pending_write: false,
            },
        );
        match taken {
            Slot::Resident(conn) => Some(conn),
            tombstone @ Slot::CheckedOut { .. } => {
                entry.slot = tombstone;
                None
            }
        }
    }

    /// Re-seat a connection the workers finished with. Returns the
    /// descriptor when it is still live and should be driven again;
    /// `None` when the entry was evicted in the meantime and the
    /// connection has been torn down.
    pub fn hand_back(&mut self, conn: Box<Connection>) -> Option<RawFd> {
        let fd = conn.fd();
        let now = syscalls::fine_clock_us();

        enum Verdict {
            Missing,
            Evicted(u64),
            Live(bool, bool),
            AlreadyResident,
        }

        let verdict = match self.slots.get(&fd) {
            None => Verdict::Missing,
            Some(entry) => match entry.slot {
                Slot::CheckedOut { evicted: true, .. } => Verdict::Evicted(entry.first_access),
                Slot::CheckedOut {
                    evicted: false,
                    pending_read,
                    pending_write,
                } => Verdict::Live(pending_read, pending_write),
                Slot::Resident(_) => Verdict::AlreadyResident,
            },
        };

        match verdict {
            Verdict::Missing => {
                tracing::error!("hand_back: descriptor {} has no registry entry", fd);
                self.discard(conn);
                None
            }
            Verdict::Evicted(first_access) => {
                tracing::debug!("{} died while travelling through queues", fd);
                self.slots.remove(&fd);
                self.stats
                    .report_response_time(now.saturating_sub(first_access));
                self.discard(conn);
                None
            }
            Verdict::AlreadyResident => {
                tracing::error!("hand_back: descriptor {} is already resident", fd);
                self.discard(conn);
                None
            }
            Verdict::Live(pending_read, pending_write) => {
                let mut conn = conn;
                if pending_read {
                    conn.allow_read();
                }
                if pending_write {
                    conn.allow_write();
                }
                if let Some(entry) = self.slots.get_mut(&fd) {
                    entry.slot = Slot::Resident(conn);
                    entry.last_access = now;
                }
                self.timeouts.reg(fd, now);
                Some(fd)
            }
        }
    }

    /// Remove a descriptor. Resident entries are torn down and their
    /// object returned to the pool; checked-out entries are marked for
    /// teardown at hand-back. Idempotent against repeated calls.
    pub fn del(&mut self, fd: RawFd) -> bool {
        let now = syscalls::fine_clock_us();

        let resident = match self.slots.get(&fd) {
            Some(entry) => matches!(entry.slot, Slot::Resident(_)),
            None => return false,
        };
        self.timeouts.del(fd);

        if resident {
            if let Some(entry) = self.slots.remove(&fd) {
                let lifetime = now.saturating_sub(entry.first_access);
                tracing::debug!("{} lifetime is {} us", fd, lifetime);
                self.stats.report_response_time(lifetime);
                if let Slot::Resident(conn) = entry.slot {
                    self.discard(conn);
                }
            }
        } else if let Some(entry) = self.slots.get_mut(&fd) {
            if let Slot::CheckedOut { evicted, .. } = &mut entry.slot {
                *evicted = true;
            }
        }
        true
    }

    /// Delete every entry whose last touch is older than `timeout_ms`,
    /// then refresh the pool and descriptor gauges.
    pub fn kill_oldest(&mut self, timeout_ms: u64) {
        let threshold = syscalls::fine_clock_us().saturating_sub(timeout_ms * 1000);
        for fd in self.timeouts.expired(threshold) {
            tracing::debug!("idle timeout for {}", fd);
            self.del(fd);
        }

        self.stats
            .set_pool_gauges(self.pool.allocated_pages(), self.pool.allocated_objects());
        self.stats.set_fd_count(self.slots.len());
    }

    /// Granularity of the multiplexer wait, which bounds how late an
    /// eviction sweep can run.
    pub fn min_timeout() -> i32 {
        EPOLL_TIMEOUT_MS
    }

    pub fn fd_count(&self) -> usize {
        self.slots.len()
    }

    fn discard(&mut self, mut conn: Box<Connection>) {
        conn.destroy();
        self.pool.free(conn);
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        for (_, entry) in self.slots.drain() {
            if let Slot::Resident(mut conn) = entry.slot {
                conn.destroy();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn scratch_fd() -> RawFd {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        fd
    }

    fn peer() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[test]
    fn create_rejects_duplicate_descriptor() {
        let mut reg = Registry::new(Arc::new(Stats::new()));
        let fd = scratch_fd();
        assert!(reg.create(fd, peer()));
        assert!(!reg.create(fd, peer()));
        assert_eq!(reg.fd_count(), 1);
        reg.del(fd);
        assert_eq!(reg.fd_count(), 0);
    }

    #[test]
    fn del_is_idempotent() {
        let mut reg = Registry::new(Arc::new(Stats::new()));
        let fd = scratch_fd();
        assert!(reg.create(fd, peer()));
        assert!(reg.del(fd));
        assert!(!reg.del(fd));
    }

    #[test]
    fn kill_oldest_spares_recently_touched_entries() {
        let mut reg = Registry::new(Arc::new(Stats::new()));
        let stale = scratch_fd();
        let fresh = scratch_fd();
        assert!(reg.create(stale, peer()));
        assert!(reg.create(fresh, peer()));

        std::thread::sleep(Duration::from_millis(60));
        assert!(reg.allow_io(fresh, true, false)); // refreshes last-access

        reg.kill_oldest(30);
        assert_eq!(reg.fd_count(), 1);
        assert!(reg.get_mut(fresh).is_some());
        assert!(reg.get_mut(stale).is_none());

        std::thread::sleep(Duration::from_millis(2));
        reg.kill_oldest(0);
        assert_eq!(reg.fd_count(), 0);
    }

    #[test]
    fn checked_out_entries_defer_release() {
        let mut reg = Registry::new(Arc::new(Stats::new()));
        let fd = scratch_fd();
        assert!(reg.create(fd, peer()));

        let conn = reg.check_out(fd).unwrap();
        assert!(reg.get_mut(fd).is_none());

        // eviction while a worker owns the object only marks the slot
        assert!(reg.del(fd));
        assert_eq!(reg.fd_count(), 1);

        // hand-back performs the actual teardown
        assert!(reg.hand_back(conn).is_none());
        assert_eq!(reg.fd_count(), 0);
    }

    #[test]
    fn hand_back_replays_readiness_edges() {
        let mut reg = Registry::new(Arc::new(Stats::new()));
        let fd = scratch_fd();
        assert!(reg.create(fd, peer()));

        let conn = reg.check_out(fd).unwrap();
        assert!(reg.allow_io(fd, false, true)); // edge arrives while owned elsewhere

        let back = reg.hand_back(conn);
        assert_eq!(back, Some(fd));
        reg.del(fd);
    }
}
