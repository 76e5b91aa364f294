//! # Read-write semaphore
//! A sleeping readers-writer lock: many readers or one writer, contenders block instead of spinning.
//!
//! This is the spinlock-backed flavour. The whole state is one signed counter, every update of
//! it happens under a spin lock instead of a lock-free atomic op:
//! - low 16 bits: the active part, one unit per holder (a writer counts as one)
//! - the rest: [RWSEM_WAITING_BIAS] once per queued waiter and once for an active writer
//!
//! So one sign check tells "free or readers only" (>= 0) from "writer inside or somebody waiting" (< 0).
//!
//! | counter | meaning |
//! |---|---|
//! | 0 | free |
//! | N > 0 | N readers |
//! | [RWSEM_ACTIVE_WRITE_BIAS] | one writer |
//! | N + k * [RWSEM_WAITING_BIAS] | N holders, k waiters (or k-1 waiters and a writer) |
//!
//! Fast paths touch the counter only. On contention the caller queues itself on the wait list
//! and sleeps, see [slowpath]. Wakeups hand the lock over: the woken task owns it already when it
//! wakes up.
//!
//! A writer adds its waiting bias straight away, even before it sleeps, so readers that
//! show up after it see a negative counter and queue behind it. A stream of readers can't
//! starve a writer.
//!
//! Lock order: the wait-list lock, then the counter lock. The counter lock is never held while
//! taking the wait-list lock.

mod slowpath;

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering::SeqCst},
        Arc,
    },
    thread,
    time::Duration,
};

use lock_api::{GuardSend, RawRwLock, RawRwLockDowngrade};

use crate::spin::{spin_lock, SpinLock};
use slowpath::RwsemWaiter;

pub const RWSEM_UNLOCKED_VALUE: i32 = 0x0000_0000;
pub const RWSEM_ACTIVE_BIAS: i32 = 0x0000_0001;
pub const RWSEM_ACTIVE_MASK: i32 = 0x0000_ffff;
pub const RWSEM_WAITING_BIAS: i32 = -0x0001_0000;
pub const RWSEM_ACTIVE_READ_BIAS: i32 = RWSEM_ACTIVE_BIAS;
pub const RWSEM_ACTIVE_WRITE_BIAS: i32 = RWSEM_WAITING_BIAS + RWSEM_ACTIVE_BIAS;

/// Adds `delta` to a counter the caller has locked and returns the new value.
/// Taking `&mut i32` means it can only be reached through the counter's guard.
fn rwsem_update(count: &mut i32, delta: i32) -> i32 {
    *count = count.wrapping_add(delta);
    *count
}

pub struct RawRwSemaphore {
    count: SpinLock<i32>,
    wait_list: SpinLock<VecDeque<Arc<RwsemWaiter>>>,
}

impl RawRwSemaphore {
    pub const fn new() -> Self {
        Self {
            count: spin_lock(RWSEM_UNLOCKED_VALUE),
            wait_list: spin_lock(VecDeque::new()),
        }
    }

    pub fn count(&self) -> i32 {
        *self.count.lock()
    }

    /// Locks the counter, adds `delta`, returns the new value.
    pub fn atomic_update(&self, delta: i32) -> i32 {
        rwsem_update(&mut self.count.lock(), delta)
    }

    /// Replaces the counter with `new` if it equals `old`. Returns what it was.
    pub fn cmpxchg(&self, old: i32, new: i32) -> i32 {
        let mut count = self.count.lock();
        let prev = *count;
        if prev == old {
            *count = new;
        }
        prev
    }

    /// [Self::cmpxchg] restricted to the active part. Returns the previous active part.
    pub fn cmpxchgw(&self, old: u16, new: u16) -> u16 {
        let mut count = self.count.lock();
        let prev = (*count & RWSEM_ACTIVE_MASK) as u16;
        if prev == old {
            *count = (*count & !RWSEM_ACTIVE_MASK) | i32::from(new);
        }
        prev
    }

    pub fn down_read(&self) {
        let count = rwsem_update(&mut self.count.lock(), RWSEM_ACTIVE_READ_BIAS);
        if count < 0 {
            self.down_read_failed();
        }
    }

    pub fn down_read_trylock(&self) -> bool {
        let mut tmp = self.count();
        while tmp >= 0 {
            let seen = self.cmpxchg(tmp, tmp + RWSEM_ACTIVE_READ_BIAS);
            if seen == tmp {
                return true;
            }
            tmp = seen;
        }
        false
    }

    pub fn down_write(&self) {
        let prior = {
            let mut count = self.count.lock();
            rwsem_update(&mut count, RWSEM_ACTIVE_WRITE_BIAS) - RWSEM_ACTIVE_WRITE_BIAS
        };
        if prior != RWSEM_UNLOCKED_VALUE {
            self.down_write_failed();
        }
    }

    pub fn down_write_trylock(&self) -> bool {
        self.cmpxchg(RWSEM_UNLOCKED_VALUE, RWSEM_ACTIVE_WRITE_BIAS) == RWSEM_UNLOCKED_VALUE
    }

    /// Must pair with a successful `down_read`/`down_read_trylock`.
    pub fn up_read(&self) {
        let prior = {
            let mut count = self.count.lock();
            rwsem_update(&mut count, -RWSEM_ACTIVE_READ_BIAS) + RWSEM_ACTIVE_READ_BIAS
        };
        // last one out with waiters queued
        if prior < 0 && (prior - RWSEM_ACTIVE_READ_BIAS) & RWSEM_ACTIVE_MASK == 0 {
            self.wake();
        }
    }

    /// Must pair with a successful `down_write`/`down_write_trylock`.
    pub fn up_write(&self) {
        let count = rwsem_update(&mut self.count.lock(), -RWSEM_ACTIVE_WRITE_BIAS);
        if count < 0 {
            self.wake();
        }
    }

    /// Turns the caller's write lock into a read lock, letting queued readers in with it.
    pub fn downgrade_write(&self) {
        let count = rwsem_update(&mut self.count.lock(), -RWSEM_WAITING_BIAS);
        if count < 0 {
            self.downgrade_wake();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.count() != RWSEM_UNLOCKED_VALUE
    }

    pub fn has_waiters(&self) -> bool {
        !self.wait_list.lock().is_empty()
    }
}

impl Default for RawRwSemaphore {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawRwLock for RawRwSemaphore {
    const INIT: Self = Self::new();
    type GuardMarker = GuardSend;

    fn lock_shared(&self) {
        self.down_read();
    }

    fn try_lock_shared(&self) -> bool {
        self.down_read_trylock()
    }

    unsafe fn unlock_shared(&self) {
        self.up_read();
    }

    fn lock_exclusive(&self) {
        self.down_write();
    }

    fn try_lock_exclusive(&self) -> bool {
        self.down_write_trylock()
    }

    unsafe fn unlock_exclusive(&self) {
        self.up_write();
    }

    fn is_locked(&self) -> bool {
        RawRwSemaphore::is_locked(self)
    }
}

unsafe impl RawRwLockDowngrade for RawRwSemaphore {
    unsafe fn downgrade(&self) {
        self.downgrade_write();
    }
}

pub type RwSemaphore<T> = lock_api::RwLock<RawRwSemaphore, T>;
pub type RwSemaphoreReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RawRwSemaphore, T>;
pub type RwSemaphoreWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RawRwSemaphore, T>;

pub fn run() {
    let config = RwSemaphore::new(String::from("v1"));
    let reads = AtomicUsize::new(0);
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..50 {
                    let c = config.read();
                    reads.fetch_add(1, SeqCst);
                    assert!(c.starts_with('v'));
                }
            });
        }
        s.spawn(|| {
            for v in 2..=5 {
                thread::sleep(Duration::from_millis(1));
                *config.write() = format!("v{v}");
                log::info!("published v{v}");
            }
        });
    });
    log::info!("{} reads, final {}", reads.load(SeqCst), *config.read());
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc;

    fn wait_for(cond: impl Fn() -> bool) {
        while !cond() {
            thread::yield_now();
        }
    }

    #[test]
    fn test_bias_arithmetic() {
        let sem = RawRwSemaphore::new();
        sem.down_read();
        sem.down_read();
        assert_eq!(sem.count(), 2);
        sem.up_read();
        sem.up_read();
        assert_eq!(sem.count(), RWSEM_UNLOCKED_VALUE);

        sem.down_write();
        assert_eq!(sem.count(), RWSEM_ACTIVE_WRITE_BIAS);
        assert!(sem.count() < 0);
        sem.downgrade_write();
        assert_eq!(sem.count(), RWSEM_ACTIVE_READ_BIAS);
        sem.up_read();
        assert!(!sem.is_locked());
    }

    #[test]
    fn test_cmpxchgw_touches_active_part_only() {
        let sem = RawRwSemaphore::new();
        sem.atomic_update(2 * RWSEM_WAITING_BIAS);
        assert_eq!(sem.cmpxchgw(1, 5), 0);
        assert_eq!(sem.count(), 2 * RWSEM_WAITING_BIAS);
        assert_eq!(sem.cmpxchgw(0, 1), 0);
        assert_eq!(sem.count(), 2 * RWSEM_WAITING_BIAS + 1);
        assert_eq!(sem.cmpxchgw(1, 0), 1);
        assert_eq!(sem.count(), 2 * RWSEM_WAITING_BIAS);
    }

    #[test]
    fn test_trylocks() {
        let sem = RawRwSemaphore::new();
        assert!(sem.down_read_trylock());
        assert!(sem.down_read_trylock());
        assert!(!sem.down_write_trylock());
        sem.up_read();
        sem.up_read();
        assert!(sem.down_write_trylock());
        assert!(!sem.down_read_trylock());
        assert!(!sem.down_write_trylock());
        sem.up_write();
        assert_eq!(sem.count(), RWSEM_UNLOCKED_VALUE);
    }

    #[test]
    fn test_reader_then_writer_scenario() {
        let sem = RawRwSemaphore::new();
        let (tx, rx) = mpsc::channel();
        sem.down_read();
        assert_eq!(sem.count(), 1);
        thread::scope(|s| {
            s.spawn(|| {
                sem.down_write();
                tx.send(sem.count()).unwrap();
                sem.up_write();
            });
            // the writer's slow path leaves one waiting bias next to our reader
            wait_for(|| sem.count() == 1 + RWSEM_WAITING_BIAS);
            assert!(sem.has_waiters());
            sem.up_read();
            // handed over: the writer wakes up owning exactly the write bias
            assert_eq!(rx.recv().unwrap(), RWSEM_ACTIVE_WRITE_BIAS);
        });
        assert_eq!(sem.count(), RWSEM_UNLOCKED_VALUE);
        assert!(!sem.has_waiters());
    }

    #[test]
    fn test_waiter_wakes_itself_when_nobody_is_active() {
        let sem = RawRwSemaphore::new();
        // a waiting bias with nobody active and nobody queued: whoever left already
        // ran the wake routine, so the next contender has to hand the lock to itself
        sem.atomic_update(RWSEM_WAITING_BIAS);

        // no other thread exists to wake us, returning at all means the self-wake ran
        sem.down_read();
        assert_eq!(sem.count(), RWSEM_WAITING_BIAS + RWSEM_ACTIVE_READ_BIAS);
        assert!(!sem.has_waiters());
        sem.up_read();
        assert_eq!(sem.count(), RWSEM_WAITING_BIAS);

        sem.down_write();
        assert_eq!(sem.count(), RWSEM_WAITING_BIAS + RWSEM_ACTIVE_WRITE_BIAS);
        assert!(!sem.has_waiters());
        sem.up_write();
        assert_eq!(sem.count(), RWSEM_WAITING_BIAS);

        sem.atomic_update(-RWSEM_WAITING_BIAS);
        assert!(!sem.is_locked());
    }

    #[test]
    fn test_writer_blocks_later_readers() {
        let sem = RawRwSemaphore::new();
        let events = spin_lock(Vec::new());

        sem.down_read(); // R1
        thread::scope(|s| {
            s.spawn(|| {
                sem.down_write(); // W1
                events.lock().push("W1 acquired");
                thread::sleep(Duration::from_millis(20));
                events.lock().push("W1 released");
                sem.up_write();
            });
            wait_for(|| sem.count() == 1 + RWSEM_WAITING_BIAS);

            s.spawn(|| {
                sem.down_read(); // R2
                events.lock().push("R2 acquired");
                sem.up_read();
            });
            // R2 saw a negative count and queued behind W1
            wait_for(|| sem.count() == 1 + 2 * RWSEM_WAITING_BIAS);
            thread::sleep(Duration::from_millis(20));
            assert!(events.lock().is_empty(), "nobody gets in while R1 holds it");

            sem.up_read(); // R1 hands over to W1
        });
        assert_eq!(
            *events.lock(),
            ["W1 acquired", "W1 released", "R2 acquired"]
        );
        assert_eq!(sem.count(), RWSEM_UNLOCKED_VALUE);
    }

    #[test]
    fn test_queued_readers_are_woken_together() {
        let sem = RawRwSemaphore::new();
        let inside = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        sem.down_write();
        thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| {
                    sem.down_read();
                    let n = inside.fetch_add(1, SeqCst) + 1;
                    peak.fetch_max(n, SeqCst);
                    // everybody stays until all three are in
                    wait_for(|| inside.load(SeqCst) == 3);
                    sem.up_read();
                });
            }
            wait_for(|| sem.count() == RWSEM_ACTIVE_WRITE_BIAS + 3 * RWSEM_WAITING_BIAS);
            sem.up_write();
        });
        assert_eq!(peak.load(SeqCst), 3);
        assert_eq!(sem.count(), RWSEM_UNLOCKED_VALUE);
    }

    #[test]
    fn test_downgrade_lets_readers_in_but_not_writers() {
        let sem = RawRwSemaphore::new();
        let reader_in = AtomicUsize::new(0);
        let writer_in = AtomicUsize::new(0);
        sem.down_write();
        thread::scope(|s| {
            s.spawn(|| {
                sem.down_read();
                reader_in.store(1, SeqCst);
                sem.up_read();
            });
            wait_for(|| sem.count() == RWSEM_ACTIVE_WRITE_BIAS + RWSEM_WAITING_BIAS);
            s.spawn(|| {
                sem.down_write();
                writer_in.store(1, SeqCst);
                sem.up_write();
            });
            wait_for(|| sem.count() == RWSEM_ACTIVE_WRITE_BIAS + 2 * RWSEM_WAITING_BIAS);

            sem.downgrade_write();
            wait_for(|| reader_in.load(SeqCst) == 1);
            assert_eq!(writer_in.load(SeqCst), 0, "we still hold it for reading");
            sem.up_read();
        });
        assert_eq!(writer_in.load(SeqCst), 1);
        assert_eq!(sem.count(), RWSEM_UNLOCKED_VALUE);
    }

    #[test]
    fn test_exclusion_under_load() {
        let sem = RwSemaphore::new(0u64);
        let readers = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..500 {
                        let mut g = sem.write();
                        assert_eq!(readers.load(SeqCst), 0);
                        *g += 1;
                    }
                });
                s.spawn(|| {
                    for _ in 0..500 {
                        let g = sem.read();
                        readers.fetch_add(1, SeqCst);
                        assert!(*g <= 2000);
                        readers.fetch_sub(1, SeqCst);
                    }
                });
            }
        });
        assert_eq!(*sem.read(), 2000);
        assert!(!sem.is_locked());
    }

    #[test]
    fn test_guard_downgrade() {
        let sem = RwSemaphore::new(vec![1]);
        let mut w = sem.write();
        w.push(2);
        let r = lock_api::RwLockWriteGuard::downgrade(w);
        assert_eq!(*r, [1, 2]);
        assert!(sem.try_read().is_some());
        assert!(sem.try_write().is_none());
        drop(r);
        assert!(sem.try_write().is_some());
    }
}
