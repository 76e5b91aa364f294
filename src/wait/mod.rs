//! # Wait queues
//!
//! A [WaitQueueHead] is a list of tasks waiting for something to happen, guarded by its own
//! spin lock. Entries come in two kinds:
//! - shared: linked at the front, every one of them is woken by a wakeup
//! - exclusive: linked at the tail, a wakeup stops after the first `nr_exclusive` of them,
//!   in the order they were added
//!
//! Waiting is the `prepare -> check -> schedule -> repeat -> finish` loop:
//!
//! ```ignore
//! let entry = WaitEntry::new();
//! loop {
//!     queue.prepare_to_wait(&entry, TaskState::Uninterruptible);
//!     if condition() {
//!         break;
//!     }
//!     task::schedule();
//! }
//! queue.finish_wait(&entry);
//! ```
//!
//! [WaitQueueHead::wait_event] and friends wrap exactly that.
//!
//! A wakeup only says "worth rechecking", the condition may still be false afterwards.

mod list;

pub use list::{WaitList, WakeFn, Waiter};

use std::{
    error::Error,
    fmt,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc,
    },
    thread,
};

use crate::{
    spin::{spin_lock, SpinLock},
    task::{self, Task, TaskState, WakeMode},
};

/// Plain wakeup: the entry stays linked, its owner unlinks it in `finish_wait`.
pub fn default_wake_function(
    _list: &mut WaitList,
    waiter: &Arc<Waiter>,
    mode: WakeMode,
) -> bool {
    waiter.task().wake_up(mode)
}

/// Wakes the entry and takes it off the queue in the same go, for one-shot waits.
pub fn autoremove_wake_function(
    list: &mut WaitList,
    waiter: &Arc<Waiter>,
    mode: WakeMode,
) -> bool {
    let woken = default_wake_function(list, waiter, mode);
    if woken {
        list.unlink(waiter);
    }
    woken
}

/// The handle a waiting task keeps while it is, or may be, on a queue.
/// The queue only borrows it through a shared [Waiter] reference.
pub struct WaitEntry {
    waiter: Arc<Waiter>,
}

impl WaitEntry {
    /// An entry for the current task that unlinks itself when woken.
    pub fn new() -> Self {
        Self::with_func(task::current(), autoremove_wake_function)
    }

    /// An entry for `task` that stays linked until removed.
    pub fn for_task(task: Arc<Task>) -> Self {
        Self::with_func(task, default_wake_function)
    }

    pub fn with_func(task: Arc<Task>, func: WakeFn) -> Self {
        Self {
            waiter: Arc::new(Waiter::new(task, func)),
        }
    }
}

impl Default for WaitEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for WaitEntry {
    type Target = Waiter;
    fn deref(&self) -> &Waiter {
        &self.waiter
    }
}

impl Drop for WaitEntry {
    fn drop(&mut self) {
        if !self.waiter.is_detached_careful() {
            log::warn!("wait entry of task {} dropped while queued", self.task().id());
        }
    }
}

/// An interruptible wait gave up because a signal is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("interrupted by a pending signal")
    }
}

impl Error for Interrupted {}

pub struct WaitQueueHead {
    list: SpinLock<WaitList>,
}

impl WaitQueueHead {
    pub const fn new() -> Self {
        Self {
            list: spin_lock(WaitList::new()),
        }
    }

    pub fn add_wait_queue(&self, entry: &WaitEntry) {
        entry.set_exclusive(false);
        self.list.lock().push_front(entry.waiter.clone());
    }

    pub fn add_wait_queue_exclusive(&self, entry: &WaitEntry) {
        entry.set_exclusive(true);
        self.list.lock().push_back(entry.waiter.clone());
    }

    /// Fine to call on an entry that isn't queued anywhere.
    pub fn remove_wait_queue(&self, entry: &WaitEntry) {
        self.list.lock().unlink(entry);
    }

    /// Links the entry unless it is linked already, then sets the task's state.
    /// Safe to call on every round of a wait loop.
    pub fn prepare_to_wait(&self, entry: &WaitEntry, state: TaskState) {
        entry.set_exclusive(false);
        let mut list = self.list.lock();
        if !list.contains(entry) {
            list.push_front(entry.waiter.clone());
        }
        // still under the lock: a waker that finds the entry finds the sleeping state too
        entry.task().set_state(state);
    }

    pub fn prepare_to_wait_exclusive(&self, entry: &WaitEntry, state: TaskState) {
        entry.set_exclusive(true);
        let mut list = self.list.lock();
        if !list.contains(entry) {
            list.push_back(entry.waiter.clone());
        }
        entry.task().set_state(state);
    }

    pub fn finish_wait(&self, entry: &WaitEntry) {
        entry.task().set_state(TaskState::Running);
        // only a waker holding the lock can detach us behind our back, and it leaves both
        // links detached once done, so two detached links mean there's nothing to do
        if !entry.is_detached_careful() {
            self.list.lock().unlink(entry);
        }
    }

    /// Walks the queue from the front calling each entry's wake function.
    /// Stops after `nr_exclusive` exclusive entries were woken, 0 means no limit.
    /// Returns how many entries reported a wakeup.
    pub fn wake_up(&self, mode: WakeMode, mut nr_exclusive: usize) -> usize {
        let mut list = self.list.lock();
        let mut woken = 0;
        let mut cursor = list.front().cloned();
        while let Some(waiter) = cursor {
            // the wake function may unlink `waiter`, so look ahead first
            let next = list.next_of(&waiter);
            let exclusive = waiter.is_exclusive();
            if (waiter.func())(&mut *list, &waiter, mode) {
                woken += 1;
                if exclusive && nr_exclusive != 0 {
                    nr_exclusive -= 1;
                    if nr_exclusive == 0 {
                        break;
                    }
                }
            }
            cursor = next;
        }
        if woken > 0 {
            log::trace!("{mode} wakeup woke {woken} of {}", woken + list.len());
        }
        woken
    }

    pub fn wake_up_one(&self) -> usize {
        self.wake_up(WakeMode::Normal, 1)
    }

    pub fn wake_up_all(&self) -> usize {
        self.wake_up(WakeMode::Normal, 0)
    }

    pub fn wake_up_interruptible(&self) -> usize {
        self.wake_up(WakeMode::Interruptible, 1)
    }

    pub fn wake_up_interruptible_all(&self) -> usize {
        self.wake_up(WakeMode::Interruptible, 0)
    }

    /// Is anybody queued
    pub fn is_active(&self) -> bool {
        !self.list.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        !self.is_active()
    }

    /// Sleeps uninterruptibly until `condition` holds.
    pub fn wait_event(&self, mut condition: impl FnMut() -> bool) {
        if condition() {
            return;
        }
        let entry = WaitEntry::new();
        loop {
            self.prepare_to_wait(&entry, TaskState::Uninterruptible);
            if condition() {
                break;
            }
            task::schedule();
        }
        self.finish_wait(&entry);
    }

    /// Like [Self::wait_event], but queued as an exclusive waiter.
    pub fn wait_event_exclusive(&self, mut condition: impl FnMut() -> bool) {
        if condition() {
            return;
        }
        let entry = WaitEntry::new();
        loop {
            self.prepare_to_wait_exclusive(&entry, TaskState::Uninterruptible);
            if condition() {
                break;
            }
            task::schedule();
        }
        self.finish_wait(&entry);
    }

    /// Sleeps until `condition` holds or a signal arrives for the current task.
    pub fn wait_event_interruptible(
        &self,
        mut condition: impl FnMut() -> bool,
    ) -> Result<(), Interrupted> {
        if condition() {
            return Ok(());
        }
        let me = task::current();
        let entry = WaitEntry::new();
        let mut ret = Ok(());
        loop {
            self.prepare_to_wait(&entry, TaskState::Interruptible);
            if condition() {
                break;
            }
            if me.signal_pending() {
                ret = Err(Interrupted);
                break;
            }
            task::schedule();
        }
        self.finish_wait(&entry);
        ret
    }
}

impl Default for WaitQueueHead {
    fn default() -> Self {
        Self::new()
    }
}

pub fn run() {
    let queue = WaitQueueHead::new();
    let ready = AtomicBool::new(false);
    thread::scope(|s| {
        for i in 0..3 {
            let (queue, ready) = (&queue, &ready);
            s.spawn(move || {
                queue.wait_event(|| ready.load(SeqCst));
                log::info!("waiter {i} saw the flag");
            });
        }
        while queue.len() < 3 {
            thread::yield_now();
        }
        log::info!("3 waiters queued, raising the flag");
        ready.store(true, SeqCst);
        queue.wake_up_all();
    });
}
