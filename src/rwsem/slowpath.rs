//! Contended side of the semaphore: queueing, sleeping and handing the lock over.
//!
//! A waiter never takes the lock itself after it sleeps. Whoever wakes it has already
//! moved the counter on its behalf and only then flips `RwsemWaiter::granted`.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{
            AtomicBool,
            Ordering::{Acquire, Release},
        },
        Arc,
    },
};

use strum_macros::Display;

use super::{RawRwSemaphore, RWSEM_ACTIVE_BIAS, RWSEM_ACTIVE_MASK, RWSEM_WAITING_BIAS};
use crate::task::{self, Task, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub(super) enum WaitingFor {
    Read,
    Write,
}

pub(super) struct RwsemWaiter {
    task: Arc<Task>,
    kind: WaitingFor,
    granted: AtomicBool,
}

impl RwsemWaiter {
    fn grant(&self) {
        // after this store the waiter may return from down_*() at any moment
        self.granted.store(true, Release);
        self.task.wake_up_process();
    }
}

impl RawRwSemaphore {
    #[cold]
    pub(super) fn down_read_failed(&self) {
        // our read bias turns into a waiting bias
        self.down_failed_common(WaitingFor::Read, RWSEM_WAITING_BIAS - RWSEM_ACTIVE_BIAS);
    }

    #[cold]
    pub(super) fn down_write_failed(&self) {
        // the write bias already holds the waiting part
        self.down_failed_common(WaitingFor::Write, -RWSEM_ACTIVE_BIAS);
    }

    fn down_failed_common(&self, kind: WaitingFor, adjustment: i32) {
        let tsk = task::current();
        tsk.set_state(TaskState::Uninterruptible);
        let waiter = Arc::new(RwsemWaiter {
            task: tsk.clone(),
            kind,
            granted: AtomicBool::new(false),
        });

        {
            let mut wait_list = self.wait_list.lock();
            wait_list.push_back(waiter.clone());
            let count = self.atomic_update(adjustment);
            log::trace!("task {} waits for {kind}, count {count:#x}", tsk.id());
            // everybody active left while we were getting here: nobody else will wake the queue
            if count & RWSEM_ACTIVE_MASK == 0 {
                self.do_wake(&mut wait_list, false);
            }
        }

        while !waiter.granted.load(Acquire) {
            task::schedule();
            tsk.set_state(TaskState::Uninterruptible);
        }
        tsk.set_state(TaskState::Running);
        log::trace!("task {} got the semaphore for {kind}", tsk.id());
    }

    /// Called by the last holder out when the counter says somebody is queued.
    pub(super) fn wake(&self) {
        let mut wait_list = self.wait_list.lock();
        if !wait_list.is_empty() {
            self.do_wake(&mut wait_list, false);
        }
    }

    pub(super) fn downgrade_wake(&self) {
        let mut wait_list = self.wait_list.lock();
        if !wait_list.is_empty() {
            self.do_wake(&mut wait_list, true);
        }
    }

    /// Hands the semaphore to the front of the queue: one writer, or the run of readers
    /// at the front. Runs with the wait list locked.
    ///
    /// Outside a downgrade the active part must go 0 -> 1 first, otherwise somebody still
    /// holds the lock and will get here again when leaving. A downgrading writer still
    /// holds it for reading, so only readers may join.
    fn do_wake(&self, wait_list: &mut VecDeque<Arc<RwsemWaiter>>, downgrading: bool) {
        let Some(front) = wait_list.front() else {
            return;
        };

        if downgrading {
            if front.kind == WaitingFor::Write {
                return;
            }
        } else {
            if self.cmpxchgw(0, RWSEM_ACTIVE_BIAS as u16) != 0 {
                return;
            }
            if front.kind == WaitingFor::Write {
                // its waiting bias stays, together with the active unit it's the write bias
                if let Some(writer) = wait_list.pop_front() {
                    log::debug!("handing write lock to task {}", writer.task.id());
                    writer.grant();
                }
                return;
            }
        }

        let woken = wait_list
            .iter()
            .take_while(|w| w.kind == WaitingFor::Read)
            .count();
        // each reader trades its waiting bias for an active unit
        let mut delta = woken as i32 * (RWSEM_ACTIVE_BIAS - RWSEM_WAITING_BIAS);
        if !downgrading {
            // one unit went in with the cmpxchgw above
            delta -= RWSEM_ACTIVE_BIAS;
        }
        self.atomic_update(delta);

        log::debug!("handing read lock to {woken} readers");
        for reader in wait_list.drain(..woken) {
            reader.grant();
        }
    }
}
