//! Index-based intrusive list for wait queues.
//!
//! Slots hold shared handles to the [Waiter]s, the links live in the waiters themselves as
//! indices into the slot arena. Link words are only written with the owning queue's
//! spin lock held; they are atomics so the owner of a waiter can peek at its own links
//! without the lock (see [Waiter::is_detached_careful]).

use std::sync::{
    atomic::{
        AtomicU32, AtomicUsize,
        Ordering::{Acquire, Relaxed, Release},
    },
    Arc,
};

use crate::task::{Task, WakeMode};

/// link target meaning "the list head"
const HEAD: usize = usize::MAX;
/// link target meaning "myself", i.e. not on any list
const DETACHED: usize = usize::MAX - 1;

const WQ_FLAG_EXCLUSIVE: u32 = 0x01;

/// Called under the queue lock for every waiter a wakeup walks over.
/// Returns whether the waiter counts as woken.
pub type WakeFn = fn(list: &mut WaitList, waiter: &Arc<Waiter>, mode: WakeMode) -> bool;

pub struct Waiter {
    task: Arc<Task>,
    flags: AtomicU32,
    func: WakeFn,
    slot: AtomicUsize,
    next: AtomicUsize,
    prev: AtomicUsize,
}

impl Waiter {
    pub(crate) fn new(task: Arc<Task>, func: WakeFn) -> Self {
        Self {
            task,
            flags: AtomicU32::new(0),
            func,
            slot: AtomicUsize::new(DETACHED),
            next: AtomicUsize::new(DETACHED),
            prev: AtomicUsize::new(DETACHED),
        }
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn is_exclusive(&self) -> bool {
        self.flags.load(Relaxed) & WQ_FLAG_EXCLUSIVE != 0
    }

    pub(crate) fn set_exclusive(&self, exclusive: bool) {
        if exclusive {
            self.flags.fetch_or(WQ_FLAG_EXCLUSIVE, Relaxed);
        } else {
            self.flags.fetch_and(!WQ_FLAG_EXCLUSIVE, Relaxed);
        }
    }

    pub(crate) fn func(&self) -> WakeFn {
        self.func
    }

    /// Lock-free "am I off the list" check for the waiter's owner.
    ///
    /// Both links must read detached. `unlink` writes `prev` first and `next` last with
    /// release, so seeing `next` detached with acquire means the unlink is complete.
    /// Anything else means "maybe still linked": take the lock and look properly.
    pub fn is_detached_careful(&self) -> bool {
        let next = self.next.load(Acquire);
        next == DETACHED && self.prev.load(Relaxed) == DETACHED
    }
}

pub struct WaitList {
    slots: Vec<Option<Arc<Waiter>>>,
    free: Vec<usize>,
    first: usize,
    last: usize,
    len: usize,
}

impl WaitList {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            first: HEAD,
            last: HEAD,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, waiter: &Waiter) -> bool {
        let slot = waiter.slot.load(Relaxed);
        self.slots
            .get(slot)
            .and_then(Option::as_ref)
            .is_some_and(|w| std::ptr::eq(Arc::as_ptr(w), waiter))
    }

    pub(crate) fn front(&self) -> Option<&Arc<Waiter>> {
        self.get(self.first)
    }

    fn get(&self, slot: usize) -> Option<&Arc<Waiter>> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// The waiter linked after this one, if any. Meant for walking the list under its lock.
    pub(crate) fn next_of(&self, waiter: &Waiter) -> Option<Arc<Waiter>> {
        self.get(waiter.next.load(Relaxed)).cloned()
    }

    fn alloc(&mut self, waiter: Arc<Waiter>) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(waiter);
                slot
            }
            None => {
                self.slots.push(Some(waiter));
                self.slots.len() - 1
            }
        }
    }

    fn set_next(&self, at: usize, to: usize) {
        if let Some(w) = self.get(at) {
            w.next.store(to, Relaxed);
        }
    }

    fn set_prev(&self, at: usize, to: usize) {
        if let Some(w) = self.get(at) {
            w.prev.store(to, Relaxed);
        }
    }

    pub(crate) fn push_front(&mut self, waiter: Arc<Waiter>) {
        // relinking moves the waiter instead of linking it twice
        self.unlink(&waiter);
        let old_first = self.first;
        let slot = self.alloc(waiter.clone());
        waiter.slot.store(slot, Relaxed);
        waiter.prev.store(HEAD, Relaxed);
        waiter.next.store(old_first, Relaxed);
        if old_first == HEAD {
            self.last = slot;
        } else {
            self.set_prev(old_first, slot);
        }
        self.first = slot;
        self.len += 1;
    }

    pub(crate) fn push_back(&mut self, waiter: Arc<Waiter>) {
        self.unlink(&waiter);
        let old_last = self.last;
        let slot = self.alloc(waiter.clone());
        waiter.slot.store(slot, Relaxed);
        waiter.next.store(HEAD, Relaxed);
        waiter.prev.store(old_last, Relaxed);
        if old_last == HEAD {
            self.first = slot;
        } else {
            self.set_next(old_last, slot);
        }
        self.last = slot;
        self.len += 1;
    }

    /// Takes the waiter off the list and resets its links to "detached".
    /// A waiter that isn't on this list is left alone and `false` is returned.
    pub fn unlink(&mut self, waiter: &Waiter) -> bool {
        if !self.contains(waiter) {
            return false;
        }
        let slot = waiter.slot.load(Relaxed);
        let prev = waiter.prev.load(Relaxed);
        let next = waiter.next.load(Relaxed);
        if prev == HEAD {
            self.first = next;
        } else {
            self.set_next(prev, next);
        }
        if next == HEAD {
            self.last = prev;
        } else {
            self.set_prev(next, prev);
        }
        self.slots[slot] = None;
        self.free.push(slot);
        self.len -= 1;

        waiter.slot.store(DETACHED, Relaxed);
        waiter.prev.store(DETACHED, Relaxed);
        waiter.next.store(DETACHED, Release);
        true
    }
}

impl Default for WaitList {
    fn default() -> Self {
        Self::new()
    }
}
