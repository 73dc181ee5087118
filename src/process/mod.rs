// Process Management for SMPKERN
//
// The kernel owns a fixed table of processes, each with a fixed table of
// threads. Lock order, outermost first:
//
//   wait_lock -> process lock -> thread locks -> process resources
//   semaphore slot -> process lock -> thread locks
//   tickslock -> process lock -> thread locks
//
// A process lock may be held while taking the lock of any thread, but never
// while taking another process's lock.
use alloc::boxed::Box;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch;
use crate::error::{KResult, KernelError};
use crate::fs::{File, Inode};
use crate::param::{NCPU, NPROC, NTHREAD};
use crate::semaphore::SemaphorePool;
use crate::spinlock::{pop_off, push_off, Spinlock};
use crate::trap::UserMode;
use crate::trapframe::Trapframe;
use crate::vm::PagePool;

pub mod context;
pub mod kthread;
pub mod lifecycle;
pub mod pcb;
pub mod scheduler;
pub mod signal;
pub mod sleep;

pub use context::Cpu;
pub use lifecycle::{ProcSnapshot, ThreadSnapshot};
pub use pcb::{Pid, ProcInner, ProcState, Process, Thread, ThreadInner, ThreadState, Tid};

/// Rendezvous token for sleep/wakeup: the address of the object waited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chan(usize);

impl Chan {
    pub fn of<T: ?Sized>(obj: &T) -> Self {
        Chan(obj as *const T as *const () as usize)
    }
}

pub struct Kernel {
    pub(crate) procs: [Process; NPROC],
    pub(crate) cpus: [Cpu; NCPU],
    next_pid: Spinlock<Pid>,
    next_tid: Spinlock<Tid>,
    /// Protects parent links and orders exit's wakeup against wait's sleep.
    pub(crate) wait_lock: Spinlock<()>,
    initproc: AtomicUsize,
    pub(crate) pages: PagePool,
    pub(crate) bsems: SemaphorePool,
    pub(crate) ticks: Spinlock<u64>,
    pub(crate) console: File,
    pub(crate) root: Inode,
    pub(crate) user: &'static dyn UserMode,
}

const NO_INIT: usize = usize::MAX;

impl Kernel {
    /// Build a kernel with `pages` physical pages. `user` resumes threads in
    /// user mode.
    pub fn new(pages: usize, user: &'static dyn UserMode) -> &'static Kernel {
        Box::leak(Box::new(Kernel {
            procs: core::array::from_fn(Process::new),
            cpus: core::array::from_fn(|_| Cpu::new()),
            next_pid: Spinlock::new(1, "nextpid"),
            next_tid: Spinlock::new(1, "nexttid"),
            wait_lock: Spinlock::new((), "wait_lock"),
            initproc: AtomicUsize::new(NO_INIT),
            pages: PagePool::new(pages),
            bsems: SemaphorePool::new(),
            ticks: Spinlock::new(0, "time"),
            console: File::open("console"),
            root: Inode::lookup("/"),
            user,
        }))
    }

    pub(crate) fn alloc_pid(&self) -> Pid {
        let mut next = self.next_pid.lock();
        let pid = *next;
        *next += 1;
        pid
    }

    pub(crate) fn alloc_tid(&self) -> Tid {
        let mut next = self.next_tid.lock();
        let tid = *next;
        *next += 1;
        tid
    }

    pub fn mycpu(&self) -> &Cpu {
        &self.cpus[arch::cpu_id()]
    }

    pub(crate) fn thread_at(&self, slot: usize) -> &Thread {
        &self.procs[slot / NTHREAD].threads[slot % NTHREAD]
    }

    /// The thread running on this core, if any.
    pub fn mythread(&self) -> Option<&Thread> {
        push_off();
        let slot = self.mycpu().thread_slot();
        pop_off();
        slot.map(|s| self.thread_at(s))
    }

    pub(crate) fn mythread_or_panic(&self) -> &Thread {
        match self.mythread() {
            Some(t) => t,
            None => panic!("no thread on cpu {}", arch::cpu_id()),
        }
    }

    /// The process of the thread running on this core.
    pub fn myproc(&self) -> &Process {
        &self.procs[self.mythread_or_panic().proc_index]
    }

    pub(crate) fn initproc(&self) -> Option<&Process> {
        match self.initproc.load(Ordering::Acquire) {
            NO_INIT => None,
            i => Some(&self.procs[i]),
        }
    }

    pub(crate) fn set_initproc(&self, p: &Process) {
        self.initproc.store(p.index, Ordering::Release);
    }

    /// Copy `src` into the user memory of `p`.
    pub(crate) fn copyout(&self, p: &Process, va: u64, src: &[u8]) -> KResult<()> {
        let mut res = p.res.lock();
        res.space
            .as_mut()
            .ok_or(KernelError::BadAddress)?
            .copy_out(va, src)
    }

    pub(crate) fn copyin(&self, p: &Process, va: u64, dst: &mut [u8]) -> KResult<()> {
        let res = p.res.lock();
        res.space
            .as_ref()
            .ok_or(KernelError::BadAddress)?
            .copy_in(va, dst)
    }

    /// Store into the current process's memory.
    pub fn copyout_user(&self, va: u64, src: &[u8]) -> KResult<()> {
        self.copyout(self.myproc(), va, src)
    }

    /// Load from the current process's memory.
    pub fn copyin_user(&self, va: u64, dst: &mut [u8]) -> KResult<()> {
        self.copyin(self.myproc(), va, dst)
    }

    /// Run `f` on the current thread's saved user registers.
    pub fn with_trapframe<R>(&self, f: impl FnOnce(&mut Trapframe) -> R) -> R {
        let t = self.mythread_or_panic();
        // SAFETY: the current thread owns its trapframe slot
        f(unsafe { t.trapframe() })
    }

    /// Pages left in the physical page pool.
    pub fn free_pages(&self) -> usize {
        self.pages.free_pages()
    }

    pub fn uptime(&self) -> u64 {
        *self.ticks.lock()
    }

    /// The console file every process starts with on descriptors 0-2.
    pub fn console_file(&self) -> &File {
        &self.console
    }
}
