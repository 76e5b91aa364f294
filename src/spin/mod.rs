/*
 * Spin locks never put the caller to sleep: they busy-wait until the lock word flips.
 * Hold them for short critical sections only and never across schedule().
 *
 * Every port does the same thing with a different instruction:
 * - x86 swaps the word with `xchg`
 * - MIPS retries an `ll/sc` pair, s390 retries `cs`
 * Only the contract is shared, so the contract is lock_api::RawMutex and each
 * instruction flavour is its own raw lock.
 */

pub mod rw;

use std::{
    sync::atomic::{
        AtomicBool,
        Ordering::{Acquire, Relaxed, Release},
    },
    thread,
};

use lock_api::{GuardSend, RawMutex};

/// Test-and-set lock, the `xchg` flavour.
pub struct RawSpinLock {
    locked: AtomicBool,
}

unsafe impl RawMutex for RawSpinLock {
    const INIT: Self = Self {
        locked: AtomicBool::new(false),
    };

    // a guard may be released by another thread, the word doesn't care who clears it
    type GuardMarker = GuardSend;

    fn lock(&self) {
        while self.locked.swap(true, Acquire) {
            // Acquire makes sure the previous lock owner has happens-before with the current one
            std::hint::spin_loop();
        }
    }

    fn try_lock(&self) -> bool {
        !self.locked.swap(true, Acquire)
    }

    // SAFETY: the caller owns the lock, see lock_api::RawMutex::unlock
    unsafe fn unlock(&self) {
        self.locked.store(false, Release);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Relaxed)
    }
}

/// Compare-and-swap lock, the `ll/sc` and `cs` flavour.
///
/// `compare_exchange_weak` may fail spuriously just like a store-conditional does,
/// the loop only has to retry.
pub struct RawCasSpinLock {
    locked: AtomicBool,
}

unsafe impl RawMutex for RawCasSpinLock {
    const INIT: Self = Self {
        locked: AtomicBool::new(false),
    };

    type GuardMarker = GuardSend;

    fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Acquire, Relaxed)
            .is_err()
        {
            // wait on a plain load so the cache line isn't bounced by failed CAS-es
            while self.locked.load(Relaxed) {
                std::hint::spin_loop();
            }
        }
    }

    // a single attempt, so the strong CAS: a spurious failure would be a lie here
    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Acquire, Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Release);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Relaxed)
    }
}

/// The raw lock this target uses for everything else in the crate.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub type ArchSpinLock = RawSpinLock;
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
pub type ArchSpinLock = RawCasSpinLock;

pub type SpinLock<T> = lock_api::Mutex<ArchSpinLock, T>;
pub type SpinLockGuard<'a, T> = lock_api::MutexGuard<'a, ArchSpinLock, T>;

/// `const` constructor, so wait queues and semaphores can live in statics
pub const fn spin_lock<T>(value: T) -> SpinLock<T> {
    lock_api::Mutex::const_new(<ArchSpinLock as RawMutex>::INIT, value)
}

/// Four threads bumping one counter through a given flavour, returns the total.
fn contend<R: RawMutex + Sync>(rounds: u64) -> u64 {
    let counter = lock_api::Mutex::<R, u64>::new(0);
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..rounds {
                    *counter.lock() += 1;
                }
            });
        }
    });
    counter.into_inner()
}

pub fn run() {
    let xchg = contend::<RawSpinLock>(100_000);
    let cas = contend::<RawCasSpinLock>(100_000);
    assert_eq!(xchg, cas);
    log::info!("xchg flavour counted {xchg}, cas flavour counted {cas}");
    log::info!(
        "this target locks with {}",
        std::any::type_name::<ArchSpinLock>()
    );
}
