// Kernel-level threads within a process
use crate::error::{KResult, KernelError};
use crate::param::MAX_STACK_SIZE;
use crate::process::{Chan, Kernel, ThreadState, Tid};

impl Kernel {
    /// Start a new thread in the calling process at `start`, running on the
    /// `MAX_STACK_SIZE` stack at `stack`. Returns its tid.
    pub fn kthread_create(&'static self, start: u64, stack: u64) -> KResult<Tid> {
        let p = self.myproc();
        let t = self.mythread_or_panic();
        let (nt, mut nti) = self.alloc_thread(p)?;

        // SAFETY: ours is the current thread; the new one is locked and idle
        let tf = unsafe { nt.trapframe() };
        *tf = unsafe { *t.trapframe() };
        tf.epc = start;
        tf.sp = stack.wrapping_add(MAX_STACK_SIZE - 16);

        nti.state = ThreadState::Runnable;
        Ok(nti.tid)
    }

    pub fn kthread_id(&self) -> Tid {
        self.mythread_or_panic().lock.lock().tid
    }

    /// End the calling thread with `status`. The last live thread of a
    /// process ends the process instead.
    pub fn kthread_exit(&'static self, status: i32) -> ! {
        let p = self.myproc();
        let t = self.mythread_or_panic();

        let inner = p.lock.lock();
        let others = p
            .threads
            .iter()
            .filter(|th| !th.is(t))
            .filter(|th| {
                let state = th.lock.lock().state;
                state != ThreadState::Unused && state != ThreadState::Zombie
            })
            .count();
        if others == 0 {
            drop(inner);
            self.exit(status);
        }

        // Joiners sleep on us under the process lock, which we still hold.
        self.wakeup(Chan::of(t));

        let mut ti = t.lock.lock();
        ti.xstate = status;
        ti.state = ThreadState::Zombie;
        drop(inner);

        self.sched(t, &ti);
        panic!("zombie thread exit");
    }

    /// Wait for thread `tid` of the calling process to exit, free its slot
    /// and store its status at user address `addr` when nonzero.
    ///
    /// Joining a thread that is already gone succeeds.
    pub fn kthread_join(&self, tid: Tid, addr: u64) -> KResult<()> {
        let p = self.myproc();
        let me = self.mythread_or_panic();
        if tid <= 0 {
            return Err(KernelError::InvalidArgument);
        }

        let mut inner = p.lock.lock();
        let target = p
            .threads
            .iter()
            .find(|th| th.lock.lock().tid == tid)
            .ok_or(KernelError::InvalidArgument)?;
        if target.is(me) {
            return Err(KernelError::InvalidArgument);
        }

        loop {
            {
                let mut ti = target.lock.lock();
                if ti.tid != tid || ti.state == ThreadState::Unused {
                    return Ok(());
                }
                if ti.state == ThreadState::Zombie {
                    if addr != 0 {
                        self.copyout(p, addr, &ti.xstate.to_le_bytes())?;
                    }
                    self.free_thread(target, &mut ti);
                    return Ok(());
                }
            }
            if inner.killed || me.lock.lock().killed {
                return Err(KernelError::Killed);
            }
            inner = self.sleep(Chan::of(target), inner);
        }
    }
}
