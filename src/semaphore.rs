// Binary semaphores shared by the threads of all processes
//
// A descriptor is an index into a fixed pool. `down` sleeps on the slot while
// its value is 0; `up` sets it back to 1 and wakes the sleepers, which race
// to take it.
use crate::error::{KResult, KernelError};
use crate::param::MAX_BSEM;
use crate::process::{Chan, Kernel};
use crate::spinlock::Spinlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SemState {
    allocated: bool,
    value: u8,
}

pub struct SemaphorePool {
    slots: [Spinlock<SemState>; MAX_BSEM],
}

impl SemaphorePool {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| {
                Spinlock::new(
                    SemState {
                        allocated: false,
                        value: 1,
                    },
                    "bsem",
                )
            }),
        }
    }

    fn slot(&self, descriptor: i32) -> KResult<&Spinlock<SemState>> {
        usize::try_from(descriptor)
            .ok()
            .and_then(|d| self.slots.get(d))
            .ok_or(KernelError::InvalidArgument)
    }

    /// Claim the lowest free slot with value 1.
    pub fn alloc(&self) -> KResult<i32> {
        for (d, slot) in self.slots.iter().enumerate() {
            let mut s = slot.lock();
            if !s.allocated {
                s.allocated = true;
                s.value = 1;
                return Ok(d as i32);
            }
        }
        Err(KernelError::CapacityExhausted)
    }

    pub fn free(&self, descriptor: i32) -> KResult<()> {
        let mut s = self.slot(descriptor)?.lock();
        if !s.allocated {
            return Err(KernelError::InvalidArgument);
        }
        s.allocated = false;
        Ok(())
    }

    /// Sleep/wakeup token of a slot.
    pub fn chan(&self, descriptor: i32) -> KResult<Chan> {
        self.slot(descriptor).map(Chan::of)
    }
}

impl Default for SemaphorePool {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    pub fn bsem_alloc(&self) -> KResult<i32> {
        self.bsems.alloc()
    }

    pub fn bsem_free(&self, descriptor: i32) -> KResult<()> {
        self.bsems.free(descriptor)
    }

    /// Take the semaphore, sleeping while it is 0.
    pub fn bsem_down(&self, descriptor: i32) -> KResult<()> {
        let slot = self.bsems.slot(descriptor)?;
        let mut s = slot.lock();
        if !s.allocated {
            return Err(KernelError::InvalidArgument);
        }
        while s.value == 0 {
            if self.killed() {
                return Err(KernelError::Killed);
            }
            s = self.sleep(Chan::of(slot), s);
            if !s.allocated {
                return Err(KernelError::InvalidArgument);
            }
        }
        s.value = 0;
        Ok(())
    }

    /// Release the semaphore and wake everything sleeping on it.
    pub fn bsem_up(&self, descriptor: i32) -> KResult<()> {
        let slot = self.bsems.slot(descriptor)?;
        let mut s = slot.lock();
        if !s.allocated {
            return Err(KernelError::InvalidArgument);
        }
        s.value = 1;
        self.wakeup(Chan::of(slot));
        Ok(())
    }

    pub fn semaphores(&self) -> &SemaphorePool {
        &self.bsems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::hosted::Cores;
    use std::time::Duration;

    #[test]
    fn alloc_takes_lowest_free_slot_and_fails_when_full() {
        let cores = Cores::new(1, Duration::from_millis(1));
        cores.enter(0);
        let pool = SemaphorePool::new();
        for d in 0..MAX_BSEM as i32 {
            assert_eq!(pool.alloc(), Ok(d));
        }
        assert_eq!(pool.alloc(), Err(KernelError::CapacityExhausted));
        pool.free(17).unwrap();
        assert_eq!(pool.alloc(), Ok(17));
        Cores::leave();
    }

    #[test]
    fn bad_descriptors_are_rejected() {
        let cores = Cores::new(1, Duration::from_millis(1));
        cores.enter(0);
        let pool = SemaphorePool::new();
        assert_eq!(pool.free(0), Err(KernelError::InvalidArgument));
        assert_eq!(pool.free(-1), Err(KernelError::InvalidArgument));
        assert_eq!(pool.free(MAX_BSEM as i32), Err(KernelError::InvalidArgument));
        let d = pool.alloc().unwrap();
        pool.free(d).unwrap();
        assert_eq!(pool.free(d), Err(KernelError::InvalidArgument));
        Cores::leave();
    }
}
