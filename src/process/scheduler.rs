// Process Scheduler for SMPKERN
//
// Each core runs `scheduler` forever. A pass walks the process table in
// index order and, within each live process, its threads in index order,
// running every Runnable thread it finds. The thread returns control with
// `sched` while holding its own lock, which the scheduler then releases.
use crate::arch;
use crate::process::{Chan, Kernel, ProcState, Thread, ThreadInner, ThreadState};
use crate::spinlock::SpinlockGuard;

impl Kernel {
    /// Per-core scheduler loop. Never returns.
    pub fn scheduler(&'static self) -> ! {
        let c = self.mycpu();
        c.set_thread_slot(None);
        loop {
            // Let pending interrupts in; avoids deadlock if every thread waits.
            arch::intr_on();
            self.clock_poll();

            let mut found = false;
            for p in self.procs.iter() {
                if p.lock.lock().state != ProcState::Used {
                    continue;
                }
                for t in p.threads.iter() {
                    let mut ti = t.lock.lock();
                    if ti.state == ThreadState::Runnable {
                        // The thread releases its lock and reacquires it
                        // before switching back.
                        ti.state = ThreadState::Running;
                        c.set_thread_slot(Some(t.slot()));
                        unsafe { arch::swtch(&c.context, t.context()) };
                        // It is done running for now.
                        c.set_thread_slot(None);
                        found = true;
                    }
                }
            }
            arch::scheduler_idle(found);
        }
    }

    /// Switch to this core's scheduler.
    ///
    /// The caller must hold only its own thread lock and must already have
    /// moved its state off Running. Saves and restores the interrupt-enable
    /// state, which belongs to the kernel thread rather than the core.
    pub(crate) fn sched(&self, t: &Thread, ti: &SpinlockGuard<'_, ThreadInner>) {
        if !t.lock.holding() {
            panic!("sched thread lock");
        }
        if arch::this_core().noff() != 1 {
            panic!("sched locks");
        }
        if ti.state == ThreadState::Running {
            panic!("sched running");
        }
        if arch::intr_get() {
            panic!("sched interruptible");
        }
        let intena = arch::this_core().intena();
        unsafe { arch::swtch(t.context(), &self.mycpu().context) };
        arch::this_core().set_intena(intena);
    }

    /// Give up the core for one scheduling round.
    pub fn yield_now(&self) {
        let t = self.mythread_or_panic();
        let mut ti = t.lock.lock();
        ti.state = ThreadState::Runnable;
        self.sched(t, &ti);
    }

    /// Timer tick seen by the scheduler loop: core 0 keeps time.
    fn clock_poll(&self) {
        if arch::cpu_id() == 0 && arch::timer_fired() {
            self.clockintr();
        }
    }

    pub(crate) fn clockintr(&self) {
        let mut ticks = self.ticks.lock();
        *ticks += 1;
        self.wakeup(Chan::of(&self.ticks));
        drop(ticks);
    }
}
