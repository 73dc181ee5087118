// Process and thread lifecycle: allocation, fork, exit, wait, kill
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::arch::Context;
use crate::error::{KResult, KernelError};
use crate::fs::File;
use crate::param::{NOFILE, PGSIZE};
use crate::process::pcb::KernelStack;
use crate::process::signal::valid_signum;
use crate::process::{
    Chan, Kernel, Pid, ProcInner, ProcState, Process, Thread, ThreadInner, ThreadState, Tid,
};
use crate::spinlock::SpinlockGuard;
use crate::trapframe::{Trapframe, TrapframePage};
use crate::vm::AddressSpace;

/// A freshly allocated process, returned with its lock and the lock of its
/// first thread held.
pub(crate) struct NewProcess {
    pub proc: &'static Process,
    pub inner: SpinlockGuard<'static, ProcInner>,
    pub thread: &'static Thread,
    pub tinner: SpinlockGuard<'static, ThreadInner>,
}

/// Point-in-time view of one process slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcSnapshot {
    pub slot: usize,
    pub pid: Pid,
    pub state: ProcState,
    pub killed: bool,
    pub name: String,
    pub threads: Vec<ThreadSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub slot: usize,
    pub tid: Tid,
    pub state: ThreadState,
    /// Wait channel while Sleeping.
    pub chan: Option<Chan>,
}

impl Kernel {
    /// Claim an Unused thread slot of `p` other than the caller's.
    ///
    /// The thread comes back Used, with a fresh tid, its backup frame and
    /// kernel stack allocated, and a context that starts in `forkret`.
    pub(crate) fn alloc_thread(
        &'static self,
        p: &'static Process,
    ) -> KResult<(&'static Thread, SpinlockGuard<'static, ThreadInner>)> {
        let frames = match p.res.lock().trapframes.clone() {
            Some(frames) => frames,
            None => return Err(KernelError::ResourceAllocationFailure),
        };
        let me = self.mythread();
        for t in p.threads.iter() {
            if me.map_or(false, |m| m.is(t)) {
                continue;
            }
            let mut ti = t.lock.lock();
            if ti.state != ThreadState::Unused {
                continue;
            }
            ti.tid = self.alloc_tid();
            ti.state = ThreadState::Used;

            // SAFETY: we hold the lock of an unused thread
            let data = unsafe { t.data() };
            data.trapframes = Some(Arc::clone(&frames));
            data.backup = self.pages.kalloc(Trapframe::default());
            data.kstack = self.pages.kalloc(KernelStack);
            if data.backup.is_none() || data.kstack.is_none() {
                self.free_thread(t, &mut ti);
                return Err(KernelError::ResourceAllocationFailure);
            }
            // New threads start in forkret, which returns to user mode.
            data.context = Some(Context::primed(Box::new(move || {
                self.forkret();
            })));
            return Ok((t, ti));
        }
        Err(KernelError::CapacityExhausted)
    }

    /// Release everything a thread slot owns and mark it Unused.
    pub(crate) fn free_thread(&self, t: &Thread, ti: &mut ThreadInner) {
        // SAFETY: the caller holds the thread lock and the thread is not running
        let data = unsafe { t.data() };
        data.kstack = None;
        data.backup = None;
        data.trapframes = None;
        data.context = None;
        ti.tid = 0;
        ti.chan = None;
        ti.killed = false;
        ti.xstate = 0;
        ti.state = ThreadState::Unused;
    }

    /// Claim the lowest-numbered Unused process slot with a fresh pid, its
    /// register snapshot page, an empty address space and one thread.
    ///
    /// On any failure everything acquired so far is released.
    pub(crate) fn alloc_process(&'static self) -> KResult<NewProcess> {
        for p in self.procs.iter() {
            let mut inner = p.lock.lock();
            if inner.state != ProcState::Unused {
                continue;
            }
            inner.pid = self.alloc_pid();
            inner.state = ProcState::Used;
            match self.init_process(p) {
                Ok((thread, tinner)) => {
                    return Ok(NewProcess {
                        proc: p,
                        inner,
                        thread,
                        tinner,
                    })
                }
                Err(e) => {
                    self.free_process(p, &mut inner);
                    return Err(e);
                }
            }
        }
        Err(KernelError::CapacityExhausted)
    }

    fn init_process(
        &'static self,
        p: &'static Process,
    ) -> KResult<(&'static Thread, SpinlockGuard<'static, ThreadInner>)> {
        let frames = self
            .pages
            .kalloc(TrapframePage::new())
            .ok_or(KernelError::ResourceAllocationFailure)?;
        let space = AddressSpace::create(&self.pages)?;
        {
            let mut res = p.res.lock();
            res.trapframes = Some(Arc::new(frames));
            res.space = Some(space);
            res.sz = 0;
        }
        self.alloc_thread(p)
    }

    /// Release a process slot and everything it owns, including all of its
    /// thread slots, and mark it Unused.
    pub(crate) fn free_process(&self, p: &Process, inner: &mut ProcInner) {
        {
            let mut res = p.res.lock();
            res.trapframes = None;
            res.space = None;
            res.sz = 0;
            res.ofile.iter_mut().for_each(|f| *f = None);
            res.cwd = None;
        }
        for t in p.threads.iter() {
            // Waits for an exiting thread to finish switching away.
            let mut ti = t.lock.lock();
            self.free_thread(t, &mut ti);
        }
        p.set_parent(None);
        inner.pid = 0;
        inner.name.clear();
        inner.killed = false;
        inner.exiting = false;
        inner.xstate = 0;
        inner.sig.reset();
        inner.state = ProcState::Unused;
    }

    /// Create the root process running the image at `entry` with
    /// `image_pages` pages of memory and the stack at the top.
    pub fn userinit(&'static self, entry: u64, image_pages: usize) -> KResult<Pid> {
        let NewProcess {
            proc: p,
            mut inner,
            thread: t,
            mut tinner,
        } = self.alloc_process()?;

        let sz = {
            let mut res = p.res.lock();
            let grown = match res.space.as_mut() {
                Some(space) => space.grow(0, image_pages * PGSIZE),
                None => Err(KernelError::ResourceAllocationFailure),
            };
            match grown {
                Ok(sz) => {
                    res.sz = sz;
                    res.cwd = Some(self.root.dup());
                    for f in res.ofile.iter_mut().take(3) {
                        *f = Some(self.console.dup());
                    }
                    Ok(sz)
                }
                Err(e) => Err(e),
            }
        };
        let sz = match sz {
            Ok(sz) => sz,
            Err(e) => {
                drop(tinner);
                self.free_process(p, &mut inner);
                return Err(e);
            }
        };

        // SAFETY: we hold the lock of the new, not yet runnable thread
        let tf = unsafe { t.trapframe() };
        tf.epc = entry;
        tf.sp = sz as u64;

        inner.name = String::from("initcode");
        self.set_initproc(p);
        tinner.state = ThreadState::Runnable;
        log::info!("userinit: pid {} entry {:#x}", inner.pid, entry);
        Ok(inner.pid)
    }

    /// Grow or shrink the current process's memory by `n` bytes. Returns the
    /// old size.
    pub fn growproc(&self, n: i64) -> KResult<usize> {
        let p = self.myproc();
        let mut res = p.res.lock();
        let old = res.sz;
        let new = usize::try_from(old as i64 + n).map_err(|_| KernelError::InvalidArgument)?;
        let space = res.space.as_mut().ok_or(KernelError::BadAddress)?;
        let sz = if n > 0 {
            space.grow(old, new)?
        } else {
            space.shrink(old, new)
        };
        res.sz = sz;
        Ok(old)
    }

    /// Duplicate the calling process. The child resumes with the caller's
    /// registers and `a0 = 0`; the caller gets the child's pid.
    pub fn fork(&'static self) -> KResult<Pid> {
        let p = self.myproc();
        let t = self.mythread_or_panic();
        let (name, sig) = {
            let inner = p.lock.lock();
            (inner.name.clone(), inner.sig.inherit())
        };

        let NewProcess {
            proc: np,
            inner: mut ni,
            thread: nt,
            tinner: nti,
        } = self.alloc_process()?;

        if let Err(e) = self.copy_resources(p, np) {
            drop(nti);
            self.free_process(np, &mut ni);
            return Err(e);
        }

        // SAFETY: ours is the current thread; the child's is locked and new
        let tf = unsafe { nt.trapframe() };
        *tf = unsafe { *t.trapframe() };
        // fork returns 0 in the child
        tf.a0 = 0;

        ni.name = name;
        ni.sig = sig;
        let pid = ni.pid;
        drop(nti);
        drop(ni);

        {
            let _wl = self.wait_lock.lock();
            np.set_parent(Some(p.index));
        }

        nt.lock.lock().state = ThreadState::Runnable;
        log::debug!("fork: pid {} -> {}", self.getpid(), pid);
        Ok(pid)
    }

    /// Copy memory, open files and working directory from `p` to `np`.
    ///
    /// The two `res` locks are never held together: the child's address
    /// space is taken out, filled under the parent's lock, then put back.
    fn copy_resources(&self, p: &Process, np: &Process) -> KResult<()> {
        let mut space = np
            .res
            .lock()
            .space
            .take()
            .ok_or(KernelError::ResourceAllocationFailure)?;
        let (sz, ofile, cwd) = {
            let parent = p.res.lock();
            let src = parent.space.as_ref().ok_or(KernelError::BadAddress)?;
            src.copy_into(&mut space, parent.sz)?;
            let ofile: [Option<File>; NOFILE] =
                core::array::from_fn(|fd| parent.ofile[fd].as_ref().map(|f| f.dup()));
            (parent.sz, ofile, parent.cwd.as_ref().map(|ip| ip.dup()))
        };
        let mut child = np.res.lock();
        child.space = Some(space);
        child.sz = sz;
        child.ofile = ofile;
        child.cwd = cwd;
        Ok(())
    }

    /// Pass the children of `p` to the root process. Caller holds wait_lock.
    fn reparent(&self, p: &Process) {
        let init = match self.initproc() {
            Some(init) => init,
            None => return,
        };
        for pp in self.procs.iter() {
            if pp.parent() == Some(p.index) {
                pp.set_parent(Some(init.index));
                self.wakeup(Chan::of(init));
            }
        }
    }

    /// Terminate the calling process with `status`. Never returns.
    ///
    /// Open files and the working directory are released, the other threads
    /// are stopped and marked Zombie, children go to the root process and the
    /// parent is woken. The process stays a Zombie until its parent waits.
    pub fn exit(&'static self, status: i32) -> ! {
        let p = self.myproc();
        let t = self.mythread_or_panic();

        if self.initproc().map_or(false, |init| core::ptr::eq(init, p)) {
            panic!("init exiting");
        }

        {
            let mut inner = p.lock.lock();
            if inner.exiting {
                drop(inner);
                self.thread_die();
            }
            inner.exiting = true;
        }

        {
            let mut res = p.res.lock();
            for f in res.ofile.iter_mut() {
                if let Some(f) = f.take() {
                    f.close();
                }
            }
            if let Some(cwd) = res.cwd.take() {
                cwd.put();
            }
        }

        self.stop_siblings(p, t);

        let wl = self.wait_lock.lock();

        // Give any children to init.
        self.reparent(p);

        // Parent might be sleeping in wait().
        if let Some(parent) = p.parent() {
            self.wakeup(Chan::of(&self.procs[parent]));
        }

        let mut inner = p.lock.lock();
        inner.xstate = status;
        inner.state = ProcState::Zombie;
        let mut ti = t.lock.lock();
        ti.state = ThreadState::Zombie;
        log::debug!("exit: pid {} status {}", inner.pid, status);
        drop(inner);
        drop(wl);

        // Jump into the scheduler, never to return.
        self.sched(t, &ti);
        panic!("zombie exit");
    }

    /// Bring every other thread of `p` to Zombie. Threads that are running on
    /// another core are flagged killed and leave at their next trap boundary.
    fn stop_siblings(&self, p: &Process, me: &Thread) {
        loop {
            let mut running = 0;
            for t in p.threads.iter().filter(|t| !t.is(me)) {
                let mut ti = t.lock.lock();
                match ti.state {
                    ThreadState::Unused | ThreadState::Zombie => {}
                    ThreadState::Running => {
                        ti.killed = true;
                        running += 1;
                    }
                    ThreadState::Used | ThreadState::Runnable | ThreadState::Sleeping => {
                        ti.chan = None;
                        ti.state = ThreadState::Zombie;
                    }
                }
            }
            if running == 0 {
                return;
            }
            self.yield_now();
        }
    }

    /// End the calling thread without ending its process: it becomes a
    /// Zombie and never runs again. Used once the process is exiting.
    pub(crate) fn thread_die(&self) -> ! {
        let t = self.mythread_or_panic();
        let mut ti = t.lock.lock();
        ti.state = ThreadState::Zombie;
        self.sched(t, &ti);
        panic!("zombie thread resumed");
    }

    /// Wait for a child to exit. Stores its status at user address `addr`
    /// when nonzero and returns its pid.
    pub fn wait(&self, addr: u64) -> KResult<Pid> {
        let p = self.myproc();
        let t = self.mythread_or_panic();
        let mut wl = self.wait_lock.lock();
        loop {
            // Scan through the table looking for exited children.
            let mut havekids = false;
            for np in self.procs.iter() {
                if np.parent() != Some(p.index) {
                    continue;
                }
                // Make sure the child isn't still in exit() or switching away.
                let mut ni = np.lock.lock();
                havekids = true;
                if ni.state == ProcState::Zombie {
                    let pid = ni.pid;
                    if addr != 0 {
                        self.copyout(p, addr, &ni.xstate.to_le_bytes())?;
                    }
                    self.free_process(np, &mut ni);
                    return Ok(pid);
                }
            }

            // No point waiting if we don't have any children.
            if !havekids {
                return Err(KernelError::NoChildren);
            }
            if p.lock.lock().killed || t.lock.lock().killed {
                return Err(KernelError::Killed);
            }

            // Wait for a child to exit.
            wl = self.sleep(Chan::of(p), wl);
        }
    }

    /// Post signal `signum` to process `pid`.
    pub fn kill(&self, pid: Pid, signum: i32) -> KResult<()> {
        let signum = valid_signum(signum)?;
        for p in self.procs.iter() {
            let mut inner = p.lock.lock();
            if inner.pid == pid && inner.state != ProcState::Unused {
                if inner.state == ProcState::Zombie {
                    return Err(KernelError::InvalidArgument);
                }
                inner.sig.post(signum);
                return Ok(());
            }
        }
        Err(KernelError::InvalidArgument)
    }

    /// Has the current process or thread been killed?
    pub fn killed(&self) -> bool {
        let p = self.myproc();
        let t = self.mythread_or_panic();
        let pk = p.lock.lock().killed;
        pk || t.lock.lock().killed
    }

    pub fn getpid(&self) -> Pid {
        self.myproc().lock.lock().pid
    }

    /// Current state of every slot in use.
    pub fn snapshot(&self) -> Vec<ProcSnapshot> {
        let mut out = Vec::new();
        for p in self.procs.iter() {
            let inner = p.lock.lock();
            if inner.state == ProcState::Unused {
                continue;
            }
            let threads = p
                .threads
                .iter()
                .filter_map(|t| {
                    let ti = t.lock.lock();
                    (ti.state != ThreadState::Unused).then(|| ThreadSnapshot {
                        slot: t.index,
                        tid: ti.tid,
                        state: ti.state,
                        chan: ti.chan,
                    })
                })
                .collect();
            out.push(ProcSnapshot {
                slot: p.index,
                pid: inner.pid,
                state: inner.state,
                killed: inner.killed,
                name: inner.name.clone(),
                threads,
            });
        }
        out
    }

    /// Print a process listing to the console.
    pub fn procdump(&self) {
        println!();
        for ps in self.snapshot() {
            println!("{} {:?} {}", ps.pid, ps.state, ps.name);
            for ts in ps.threads {
                println!("  {} {:?}", ts.tid, ts.state);
            }
        }
    }
}
