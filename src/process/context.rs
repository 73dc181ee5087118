// Per-core state: the running thread and the scheduler's saved context
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::Context;

const IDLE: usize = usize::MAX;

/// Per-core bookkeeping.
pub struct Cpu {
    /// Slot (`Thread::slot`) of the thread running here, or `IDLE`.
    thread: AtomicUsize,
    /// swtch() here to enter the scheduler.
    pub(crate) context: Context,
}

impl Cpu {
    pub(crate) fn new() -> Self {
        Self {
            thread: AtomicUsize::new(IDLE),
            context: Context::new(),
        }
    }

    pub(crate) fn thread_slot(&self) -> Option<usize> {
        match self.thread.load(Ordering::Acquire) {
            IDLE => None,
            slot => Some(slot),
        }
    }

    pub(crate) fn set_thread_slot(&self, slot: Option<usize>) {
        self.thread.store(slot.unwrap_or(IDLE), Ordering::Release);
    }
}
