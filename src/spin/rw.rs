//! A readers-writer spin lock with the biased-counter encoding.
//!
//! The lock word starts at [`RW_LOCK_BIAS`]:
//! - a reader takes 1 away and owns the lock if the word stays non-negative
//! - a writer takes the whole bias away and owns the lock if the word hits zero
//!
//! A failed attempt gives its share back, spins until an attempt could succeed, then retries.
//! Like every spin lock here, it never sleeps.

use std::sync::atomic::{
    AtomicI32,
    Ordering::{Acquire, Relaxed, Release},
};

use lock_api::{GuardSend, RawRwLock};

/// Value of an unlocked word, also the most readers the lock can hold at once.
pub const RW_LOCK_BIAS: i32 = 0x0100_0000;

pub struct RawRwSpinLock {
    lock: AtomicI32,
}

impl RawRwSpinLock {
    #[cold]
    fn read_lock_failed(&self) {
        loop {
            self.lock.fetch_add(1, Relaxed);
            while self.lock.load(Relaxed) < 1 {
                std::hint::spin_loop();
            }
            if self.lock.fetch_sub(1, Acquire) > 0 {
                return;
            }
        }
    }

    #[cold]
    fn write_lock_failed(&self) {
        loop {
            self.lock.fetch_add(RW_LOCK_BIAS, Relaxed);
            while self.lock.load(Relaxed) != RW_LOCK_BIAS {
                std::hint::spin_loop();
            }
            if self.lock.fetch_sub(RW_LOCK_BIAS, Acquire) == RW_LOCK_BIAS {
                return;
            }
        }
    }
}

unsafe impl RawRwLock for RawRwSpinLock {
    const INIT: Self = Self {
        lock: AtomicI32::new(RW_LOCK_BIAS),
    };
    type GuardMarker = GuardSend;

    fn lock_shared(&self) {
        // the old value was positive => the new one is non-negative => no writer
        if self.lock.fetch_sub(1, Acquire) <= 0 {
            self.read_lock_failed();
        }
    }

    fn try_lock_shared(&self) -> bool {
        if self.lock.fetch_sub(1, Acquire) > 0 {
            return true;
        }
        self.lock.fetch_add(1, Relaxed);
        false
    }

    unsafe fn unlock_shared(&self) {
        self.lock.fetch_add(1, Release);
    }

    fn lock_exclusive(&self) {
        if self.lock.fetch_sub(RW_LOCK_BIAS, Acquire) != RW_LOCK_BIAS {
            self.write_lock_failed();
        }
    }

    fn try_lock_exclusive(&self) -> bool {
        if self.lock.fetch_sub(RW_LOCK_BIAS, Acquire) == RW_LOCK_BIAS {
            return true;
        }
        self.lock.fetch_add(RW_LOCK_BIAS, Relaxed);
        false
    }

    unsafe fn unlock_exclusive(&self) {
        self.lock.fetch_add(RW_LOCK_BIAS, Release);
    }

    fn is_locked(&self) -> bool {
        self.lock.load(Relaxed) != RW_LOCK_BIAS
    }
}

pub type RwSpinLock<T> = lock_api::RwLock<RawRwSpinLock, T>;
pub type RwSpinLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RawRwSpinLock, T>;
pub type RwSpinLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RawRwSpinLock, T>;

pub fn run() {
    let table = RwSpinLock::new(vec![0u32; 4]);
    std::thread::scope(|s| {
        for i in 0..4 {
            let table = &table;
            s.spawn(move || table.write()[i] += 1);
            s.spawn(move || log::info!("reader sees {:?}", *table.read()));
        }
    });
    assert_eq!(*table.read(), [1, 1, 1, 1]);
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering::SeqCst},
        thread,
    };

    #[test]
    fn test_readers_share_writer_excludes() {
        let l = RawRwSpinLock::INIT;
        assert!(l.try_lock_shared());
        assert!(l.try_lock_shared());
        assert!(!l.try_lock_exclusive());
        unsafe {
            l.unlock_shared();
            l.unlock_shared();
        }
        assert!(!l.is_locked());

        assert!(l.try_lock_exclusive());
        assert!(!l.try_lock_shared());
        assert!(!l.try_lock_exclusive());
        unsafe { l.unlock_exclusive() };

        // failed attempts must leave the word untouched
        assert_eq!(l.lock.load(Relaxed), RW_LOCK_BIAS);
    }

    #[test]
    fn test_no_reader_inside_writer() {
        let lock = RwSpinLock::new(());
        let readers = AtomicUsize::new(0);
        let writers = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| {
                    for _ in 0..2000 {
                        let _g = lock.write();
                        assert_eq!(writers.fetch_add(1, SeqCst), 0);
                        assert_eq!(readers.load(SeqCst), 0);
                        writers.fetch_sub(1, SeqCst);
                    }
                });
                s.spawn(|| {
                    for _ in 0..2000 {
                        let _g = lock.read();
                        readers.fetch_add(1, SeqCst);
                        assert_eq!(writers.load(SeqCst), 0);
                        readers.fetch_sub(1, SeqCst);
                    }
                });
            }
        });
        assert!(!lock.is_locked());
    }
}
