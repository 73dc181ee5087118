// Mutual exclusion spin locks
//
// Acquiring a lock disables interrupts on the acquiring core (push_off) and
// records that core as the holder; releasing restores them (pop_off) once the
// outermost lock is gone. A lock acquired by one kernel thread may be released
// by the scheduler on the same core after a context switch, so the holder is a
// core, not a guard.
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch;

const NO_CPU: usize = usize::MAX;

pub struct Spinlock<T: ?Sized> {
    name: &'static str,
    locked: AtomicBool,
    cpu: AtomicUsize,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for Spinlock<T> {}
unsafe impl<T: ?Sized + Send> Send for Spinlock<T> {}

/// RAII guard; the lock is released when it drops.
pub struct SpinlockGuard<'a, T: ?Sized> {
    lock: &'a Spinlock<T>,
    _marker: PhantomData<&'a mut T>,
}

impl<T> Spinlock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
            cpu: AtomicUsize::new(NO_CPU),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Spinlock<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquire the lock, spinning until it is free.
    ///
    /// Panics if this core already holds it.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        push_off();
        if self.holding() {
            panic!("acquire {}: already held", self.name);
        }
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
        self.cpu.store(arch::cpu_id(), Ordering::Relaxed);
        SpinlockGuard {
            lock: self,
            _marker: PhantomData,
        }
    }

    /// Is the lock held by this core? Interrupts must be off.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.cpu.load(Ordering::Relaxed) == arch::cpu_id()
    }

    fn unlock(&self) {
        if !self.holding() {
            panic!("release {}: not held", self.name);
        }
        self.cpu.store(NO_CPU, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        pop_off();
    }

    /// Release a lock that the scheduler acquired before switching into the
    /// caller.
    ///
    /// # Safety
    ///
    /// The caller must be the thread the scheduler switched to while holding
    /// this lock, and no guard for it may be live in the caller.
    pub unsafe fn release_from_scheduler(&self) {
        self.unlock();
    }
}

impl<'a, T: ?Sized> SpinlockGuard<'a, T> {
    /// The lock this guard holds.
    pub fn spinlock(&self) -> &'a Spinlock<T> {
        self.lock
    }
}

impl<T: ?Sized> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        // A retired thread unwinds off a core it no longer holds. The only
        // lock it held across its last switch was released by the scheduler.
        if arch::retired() {
            return;
        }
        self.lock.unlock();
    }
}

/// Disable interrupts, remembering whether they were on at the outermost
/// level. push_off/pop_off pairs nest.
pub fn push_off() {
    let old = arch::intr_get();
    arch::intr_off();
    let core = arch::this_core();
    if core.noff() == 0 {
        core.set_intena(old);
    }
    core.set_noff(core.noff() + 1);
}

pub fn pop_off() {
    if arch::intr_get() {
        panic!("pop_off - interruptible");
    }
    let core = arch::this_core();
    let noff = core.noff();
    if noff < 1 {
        panic!("pop_off");
    }
    core.set_noff(noff - 1);
    if noff == 1 && core.intena() {
        arch::intr_on();
    }
}
