// Saved user registers
use core::cell::UnsafeCell;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::param::NTHREAD;

/// User register state saved on a trap.
///
/// The first five words are kernel bookkeeping filled on the way back to
/// user mode; the rest are the RISC-V integer registers.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
pub struct Trapframe {
    pub kernel_satp: u64,
    pub kernel_sp: u64,
    pub kernel_trap: u64,
    pub epc: u64,
    pub kernel_hartid: u64,
    pub ra: u64,
    pub sp: u64,
    pub gp: u64,
    pub tp: u64,
    pub t0: u64,
    pub t1: u64,
    pub t2: u64,
    pub s0: u64,
    pub s1: u64,
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
    pub a6: u64,
    pub a7: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub s10: u64,
    pub s11: u64,
    pub t3: u64,
    pub t4: u64,
    pub t5: u64,
    pub t6: u64,
}

const _: () = assert!(core::mem::size_of::<Trapframe>() == 36 * 8);

/// One page holding a trapframe slot for every thread of a process.
pub struct TrapframePage {
    slots: [UnsafeCell<Trapframe>; NTHREAD],
}

// Slot `i` is only touched by thread `i` of the owning process, or by a
// thread that holds that thread's lock while it is not running.
unsafe impl Sync for TrapframePage {}
unsafe impl Send for TrapframePage {}

impl TrapframePage {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| UnsafeCell::new(Trapframe::default())),
        }
    }

    /// # Safety
    ///
    /// No other reference to slot `index` may be live.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slot(&self, index: usize) -> &mut Trapframe {
        &mut *self.slots[index].get()
    }
}

impl Default for TrapframePage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn register_layout_matches_trampoline_offsets() {
        assert_eq!(offset_of!(Trapframe, epc), 24);
        assert_eq!(offset_of!(Trapframe, ra), 40);
        assert_eq!(offset_of!(Trapframe, sp), 48);
        assert_eq!(offset_of!(Trapframe, a0), 112);
        assert_eq!(offset_of!(Trapframe, a7), 168);
        assert_eq!(offset_of!(Trapframe, t6), 280);
    }

    #[test]
    fn raw_bytes_view() {
        let mut tf = Trapframe::default();
        tf.a0 = 0x1122_3344_5566_7788;
        let bytes = tf.as_bytes();
        assert_eq!(&bytes[112..120], &0x1122_3344_5566_7788u64.to_le_bytes());
        let back = Trapframe::read_from(bytes).unwrap();
        assert_eq!(back, tf);
    }
}
