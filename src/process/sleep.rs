// Sleep and wakeup
use crate::process::{Chan, Kernel, ThreadState};
use crate::spinlock::SpinlockGuard;

impl Kernel {
    /// Atomically release `guard` and sleep on `chan`; reacquire the lock
    /// when woken.
    ///
    /// Wakeups may be spurious: callers re-check their condition in a loop.
    pub fn sleep<'a, T: ?Sized>(
        &self,
        chan: Chan,
        guard: SpinlockGuard<'a, T>,
    ) -> SpinlockGuard<'a, T> {
        let t = self.mythread_or_panic();
        let lk = guard.spinlock();

        // Once we hold our own lock no wakeup can be missed: wakeup needs it
        // to change our state.
        let mut ti = t.lock.lock();
        drop(guard);

        ti.chan = Some(chan);
        ti.state = ThreadState::Sleeping;

        self.sched(t, &ti);

        ti.chan = None;
        drop(ti);

        lk.lock()
    }

    /// Make every thread sleeping on `chan` Runnable, except the caller.
    ///
    /// Must be called without holding any thread lock. Returns how many
    /// threads were woken.
    pub fn wakeup(&self, chan: Chan) -> usize {
        let me = self.mythread();
        let mut woken = 0;
        for p in self.procs.iter() {
            for t in p.threads.iter() {
                if me.map_or(false, |m| m.is(t)) {
                    continue;
                }
                let mut ti = t.lock.lock();
                if ti.state == ThreadState::Sleeping && ti.chan == Some(chan) {
                    ti.state = ThreadState::Runnable;
                    woken += 1;
                }
            }
        }
        woken
    }
}
