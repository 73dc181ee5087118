// Process and thread control blocks
use alloc::string::String;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::Context;
use crate::fs::{File, Inode};
use crate::param::{NOFILE, NTHREAD};
use crate::process::signal::SignalState;
use crate::process::Chan;
use crate::spinlock::Spinlock;
use crate::trapframe::{Trapframe, TrapframePage};
use crate::vm::{AddressSpace, Frame};

pub type Pid = i32;
pub type Tid = i32;

/// Process slot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Used,
    Zombie,
}

/// Thread slot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

/// Process fields guarded by `Process::lock`.
pub struct ProcInner {
    pub state: ProcState,
    pub pid: Pid,
    pub killed: bool,
    /// A thread of this process is running `exit`.
    pub exiting: bool,
    pub xstate: i32,
    pub name: String,
    pub sig: SignalState,
}

/// Memory and file references, guarded by `Process::res`.
///
/// `res` is a leaf lock: nothing else is acquired while holding it.
pub struct ProcResources {
    pub space: Option<AddressSpace>,
    pub sz: usize,
    pub ofile: [Option<File>; NOFILE],
    pub cwd: Option<Inode>,
    pub trapframes: Option<Arc<Frame<TrapframePage>>>,
}

pub struct Process {
    pub(crate) index: usize,
    pub(crate) lock: Spinlock<ProcInner>,
    pub(crate) res: Spinlock<ProcResources>,
    /// Table index of the parent, or `NO_PARENT`. Guarded by the kernel's
    /// `wait_lock`.
    parent: AtomicUsize,
    pub(crate) threads: [Thread; NTHREAD],
}

const NO_PARENT: usize = usize::MAX;

impl Process {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            lock: Spinlock::new(
                ProcInner {
                    state: ProcState::Unused,
                    pid: 0,
                    killed: false,
                    exiting: false,
                    xstate: 0,
                    name: String::new(),
                    sig: SignalState::new(),
                },
                "proc",
            ),
            res: Spinlock::new(
                ProcResources {
                    space: None,
                    sz: 0,
                    ofile: core::array::from_fn(|_| None),
                    cwd: None,
                    trapframes: None,
                },
                "proc_res",
            ),
            parent: AtomicUsize::new(NO_PARENT),
            threads: core::array::from_fn(|i| Thread::new(index, i)),
        }
    }

    /// Caller must hold `wait_lock`.
    pub(crate) fn parent(&self) -> Option<usize> {
        match self.parent.load(Ordering::Relaxed) {
            NO_PARENT => None,
            i => Some(i),
        }
    }

    /// Caller must hold `wait_lock`.
    pub(crate) fn set_parent(&self, parent: Option<usize>) {
        self.parent
            .store(parent.unwrap_or(NO_PARENT), Ordering::Relaxed);
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

/// Thread fields guarded by `Thread::lock`.
pub struct ThreadInner {
    pub state: ThreadState,
    pub tid: Tid,
    pub chan: Option<Chan>,
    pub killed: bool,
    pub xstate: i32,
}

/// Thread-private data: touched by the thread itself, or by whoever holds
/// the thread's lock while the thread is not running.
#[derive(Default)]
pub struct ThreadData {
    pub context: Option<Context>,
    pub kstack: Option<Frame<KernelStack>>,
    pub backup: Option<Frame<Trapframe>>,
    pub trapframes: Option<Arc<Frame<TrapframePage>>>,
}

/// A kernel stack page. Kernel code runs on the host thread's own stack, so
/// the page only accounts for the memory.
pub struct KernelStack;

pub struct Thread {
    pub(crate) proc_index: usize,
    pub(crate) index: usize,
    pub(crate) lock: Spinlock<ThreadInner>,
    data: UnsafeCell<ThreadData>,
}

unsafe impl Sync for Thread {}

impl Thread {
    fn new(proc_index: usize, index: usize) -> Self {
        Self {
            proc_index,
            index,
            lock: Spinlock::new(
                ThreadInner {
                    state: ThreadState::Unused,
                    tid: 0,
                    chan: None,
                    killed: false,
                    xstate: 0,
                },
                "thread",
            ),
            data: UnsafeCell::new(ThreadData::default()),
        }
    }

    pub(crate) fn is(&self, other: &Thread) -> bool {
        ptr::eq(self, other)
    }

    /// Slot number shared by the CPU table: `proc * NTHREAD + thread`.
    pub(crate) fn slot(&self) -> usize {
        self.proc_index * NTHREAD + self.index
    }

    /// # Safety
    ///
    /// Caller is this thread, or holds `lock` while the thread is not running.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn data(&self) -> &mut ThreadData {
        &mut *self.data.get()
    }

    /// # Safety
    ///
    /// As for `data`.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn backup(&self) -> &mut Option<Frame<Trapframe>> {
        &mut (*self.data.get()).backup
    }

    /// # Safety
    ///
    /// As for `data`. The thread must be allocated.
    pub(crate) unsafe fn context(&self) -> &Context {
        match (*self.data.get()).context.as_ref() {
            Some(ctx) => ctx,
            None => panic!("thread {} has no context", self.slot()),
        }
    }

    /// This thread's saved user registers.
    ///
    /// # Safety
    ///
    /// As for `data`. The thread must be allocated.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn trapframe(&self) -> &mut Trapframe {
        match (*self.data.get()).trapframes.as_ref() {
            Some(page) => page.slot(self.index),
            None => panic!("thread {} has no trapframe", self.slot()),
        }
    }
}
