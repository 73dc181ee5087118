// Trap entry and return
//
// User code enters the kernel only through system calls; the timer is
// sampled at every trap and in the scheduler loop. Every return to user mode
// first delivers pending signals and honors kill flags.
use crate::arch;
use crate::process::Kernel;

/// Executes user code on behalf of the kernel.
pub trait UserMode: Send + Sync {
    /// Continue the current thread in user mode from its trapframe.
    fn resume(&self, kernel: &'static Kernel) -> !;
}

impl Kernel {
    /// A new thread's first scheduling by `scheduler` switches here.
    pub(crate) fn forkret(&'static self) -> ! {
        let t = self.mythread_or_panic();
        // Still holding the thread lock from the scheduler.
        unsafe { t.lock.release_from_scheduler() };
        self.usertrapret()
    }

    /// Return to user mode for the first time.
    fn usertrapret(&'static self) -> ! {
        self.return_checks();
        self.user.resume(self)
    }

    /// Handle a system call from user mode. The call number and arguments
    /// are in the current trapframe; the result goes back into `a0`.
    pub fn usertrap(&'static self) {
        self.exit_if_killed();
        self.syscall();
        if arch::timer_fired() {
            if arch::cpu_id() == 0 {
                self.clockintr();
            }
            // Give up the core on a timer interrupt.
            self.yield_now();
        }
        self.return_checks();
    }

    /// Work done before any return to user mode.
    fn return_checks(&'static self) {
        self.exit_if_killed();
        self.handle_signals();
        self.exit_if_killed();
        self.with_trapframe(|tf| tf.kernel_hartid = arch::cpu_id() as u64);
    }

    fn exit_if_killed(&'static self) {
        let t = self.mythread_or_panic();
        if t.lock.lock().killed {
            // A sibling is ending the process.
            self.thread_die();
        }
        if self.myproc().lock.lock().killed {
            self.exit(-1);
        }
    }

    /// User code faulted: kill its process.
    pub fn user_fault(&'static self, what: &str) -> ! {
        let p = self.myproc();
        log::warn!("pid {}: {}", p.lock.lock().pid, what);
        p.lock.lock().killed = true;
        self.exit(-1)
    }
}
