//! # Tasks
//! Wait queues and semaphores talk about "the calling context" going to sleep and somebody else
//! waking it up. Here a context is an OS thread and [Task] is its scheduling record:
//! - a state word: [TaskState::Running] or one of the sleeping states
//! - a pending-signal flag, so interruptible sleeps have something to be interrupted by
//!
//! Sleeping is a futex wait on the state word (see `atomic-wait`), waking is
//! "move the word back to Running, then futex-wake it".
//!
//! The usual protocol from the sleeper's side:
//! 1. publish where you can be found (e.g. link a wait entry) and [Task::set_state] to a sleeping state
//! 2. check the condition you're waiting for
//! 3. [schedule] - returns at once if somebody already woke you up in between
//!
//! A waker that sees the published record after step 1 moves the state back to Running,
//! so the wakeup can't fall into the gap between 2 and 3.

use std::{
    fmt,
    sync::{
        atomic::{
            AtomicBool, AtomicU32, AtomicUsize,
            Ordering::{Acquire, Relaxed, Release, SeqCst},
        },
        Arc,
    },
};

use atomic_wait::{wait, wake_all};
use strum_macros::{Display, FromRepr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[strum(serialize_all = "snake_case")]
#[repr(u32)]
pub enum TaskState {
    Running = 0,
    /// sleeping, but a signal may cut the sleep short
    Interruptible = 1,
    Uninterruptible = 2,
}

/// Which sleepers a wakeup is allowed to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum WakeMode {
    Interruptible,
    /// both sleeping states
    Normal,
}

impl WakeMode {
    pub fn matches(self, state: TaskState) -> bool {
        match (self, state) {
            (_, TaskState::Running) => false,
            (WakeMode::Interruptible, TaskState::Interruptible) => true,
            (WakeMode::Interruptible, TaskState::Uninterruptible) => false,
            (WakeMode::Normal, _) => true,
        }
    }
}

pub struct Task {
    id: usize,
    state: AtomicU32,
    sigpending: AtomicBool,
}

impl Task {
    fn new() -> Self {
        static NEXT_ID: AtomicUsize = AtomicUsize::new(1);
        Self {
            id: NEXT_ID.fetch_add(1, Relaxed),
            state: AtomicU32::new(TaskState::Running as u32),
            sigpending: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> TaskState {
        // only valid discriminants are ever stored
        TaskState::from_repr(self.state.load(Acquire)).unwrap_or(TaskState::Running)
    }

    /// SeqCst so the store is ordered against the condition check that follows it
    pub fn set_state(&self, state: TaskState) {
        self.state.store(state as u32, SeqCst);
    }

    /// Moves a sleeper whose state matches `mode` back to running.
    /// Returns false if the task was running already or sleeps in a state `mode` doesn't cover.
    pub fn wake_up(&self, mode: WakeMode) -> bool {
        let mut s = self.state.load(Relaxed);
        loop {
            match TaskState::from_repr(s) {
                Some(state) if mode.matches(state) => {}
                _ => return false,
            }
            match self
                .state
                .compare_exchange_weak(s, TaskState::Running as u32, Release, Relaxed)
            {
                Ok(_) => break,
                Err(e) => s = e,
            }
        }
        // only the owning thread ever waits on its state word
        wake_all(&self.state);
        true
    }

    pub fn wake_up_process(&self) -> bool {
        self.wake_up(WakeMode::Normal)
    }

    /// Marks a signal pending and kicks the task out of an interruptible sleep.
    pub fn send_signal(&self) {
        self.sigpending.store(true, SeqCst);
        self.wake_up(WakeMode::Interruptible);
    }

    pub fn signal_pending(&self) -> bool {
        self.sigpending.load(SeqCst)
    }

    pub fn flush_signals(&self) {
        self.sigpending.store(false, SeqCst);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("sigpending", &self.signal_pending())
            .finish()
    }
}

thread_local! {
    static CURRENT: Arc<Task> = Arc::new(Task::new());
}

/// The task of the calling thread, created the first time it's asked for.
pub fn current() -> Arc<Task> {
    CURRENT.with(Arc::clone)
}

/// Gives up the processor until the current task is running again.
///
/// The state has to be set to a sleeping one beforehand, otherwise this returns immediately.
/// An interruptible sleeper with a signal pending doesn't sleep at all.
pub fn schedule() {
    let task = current();
    loop {
        let s = task.state.load(Acquire);
        if s == TaskState::Running as u32 {
            return;
        }
        if s == TaskState::Interruptible as u32 && task.signal_pending() {
            task.set_state(TaskState::Running);
            return;
        }
        // blocks only while the word still holds s, so a wakeup after the load isn't lost
        wait(&task.state, s);
    }
}
