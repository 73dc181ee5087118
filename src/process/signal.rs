// Signal delivery
//
// Pending signals are a per-process bit set. They are acted on only on the
// way back to user mode, lowest signal number first. A custom handler runs in
// user mode with its own mask; the registers it interrupted are kept in the
// thread's backup frame until `sigret`.
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{KResult, KernelError};
use crate::param::NSIGS;
use crate::process::{Kernel, Process, ProcInner, Thread};
use crate::spinlock::SpinlockGuard;
use crate::syscalls::SyscallNumber;

pub const SIG_DFL: u64 = 0;
pub const SIG_IGN: u64 = 1;

pub const SIGKILL: usize = 9;
pub const SIGSTOP: usize = 17;
pub const SIGCONT: usize = 19;

/// `li a7, SYS_sigret; ecall`, copied onto the user stack as the return
/// address of every custom handler.
pub const SIGRET_TRAMPOLINE: [u8; 8] = {
    let li = ((SyscallNumber::SigRet as u32) << 20) | (17 << 7) | 0x13;
    let l = li.to_le_bytes();
    [l[0], l[1], l[2], l[3], 0x73, 0x00, 0x00, 0x00]
};

pub type SigSet = u32;

pub const fn sigbit(signum: usize) -> SigSet {
    1 << signum
}

const UNBLOCKABLE: SigSet = sigbit(SIGKILL) | sigbit(SIGSTOP);

/// What to do when a signal is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigHandler {
    Default,
    Ignore,
    /// User-mode entry point.
    Custom(u64),
}

impl From<u64> for SigHandler {
    fn from(raw: u64) -> Self {
        match raw {
            SIG_DFL => SigHandler::Default,
            SIG_IGN => SigHandler::Ignore,
            entry => SigHandler::Custom(entry),
        }
    }
}

impl SigHandler {
    pub fn to_raw(self) -> u64 {
        match self {
            SigHandler::Default => SIG_DFL,
            SigHandler::Ignore => SIG_IGN,
            SigHandler::Custom(entry) => entry,
        }
    }
}

/// The user-visible `struct sigaction`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
pub struct SigAction {
    pub sa_handler: u64,
    pub sigmask: u32,
    _pad: u32,
}

impl SigAction {
    pub fn new(handler: u64, sigmask: u32) -> Self {
        Self {
            sa_handler: handler,
            sigmask,
            _pad: 0,
        }
    }
}

/// Whether a custom handler is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Normal,
    /// Thread slot `thread` runs a handler with its own mask; `saved_mask`
    /// comes back at its `sigret`.
    InHandler { saved_mask: SigSet, thread: usize },
}

/// Per-process signal state.
#[derive(Debug, Clone)]
pub struct SignalState {
    pub pending: SigSet,
    blocked: SigSet,
    handlers: [SigHandler; NSIGS],
    masks: [SigSet; NSIGS],
    state: HandlerState,
}

impl SignalState {
    pub const fn new() -> Self {
        Self {
            pending: 0,
            blocked: 0,
            handlers: [SigHandler::Default; NSIGS],
            masks: [0; NSIGS],
            state: HandlerState::Normal,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Signal state a forked child starts with: the parent's mask and
    /// dispositions, nothing pending.
    pub fn inherit(&self) -> Self {
        Self {
            pending: 0,
            blocked: self.blocked,
            handlers: self.handlers,
            masks: self.masks,
            state: HandlerState::Normal,
        }
    }

    pub fn blocked(&self) -> SigSet {
        self.blocked
    }

    pub fn post(&mut self, signum: usize) {
        self.pending |= sigbit(signum);
    }

    /// Replace the blocked set, returning the old one.
    pub fn set_blocked(&mut self, mask: SigSet) -> KResult<SigSet> {
        if mask & UNBLOCKABLE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        Ok(core::mem::replace(&mut self.blocked, mask))
    }

    pub fn action(&self, signum: usize) -> SigAction {
        SigAction::new(self.handlers[signum].to_raw(), self.masks[signum])
    }

    pub fn set_action(&mut self, signum: usize, act: SigAction) -> KResult<()> {
        if act.sigmask & UNBLOCKABLE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let handler = SigHandler::from(act.sa_handler);
        if (signum == SIGKILL || signum == SIGSTOP) && handler != SigHandler::Default {
            return Err(KernelError::InvalidArgument);
        }
        self.handlers[signum] = handler;
        self.masks[signum] = act.sigmask;
        Ok(())
    }

    pub fn handler(&self, signum: usize) -> SigHandler {
        self.handlers[signum]
    }

    pub fn in_handler(&self) -> bool {
        matches!(self.state, HandlerState::InHandler { .. })
    }

    /// Lowest pending, unblocked signal at or above `from`.
    pub fn next_deliverable(&self, from: usize) -> Option<usize> {
        let ready = self.pending & !self.blocked;
        (from..NSIGS).find(|&s| ready & sigbit(s) != 0)
    }

    fn enter_handler(&mut self, signum: usize, thread: usize) {
        self.state = HandlerState::InHandler {
            saved_mask: self.blocked,
            thread,
        };
        self.blocked = self.masks[signum];
        self.pending &= !sigbit(signum);
    }

    /// Only the thread the handler was delivered to may leave it.
    fn leave_handler(&mut self, thread: usize) -> KResult<()> {
        match self.state {
            HandlerState::InHandler { saved_mask, thread: owner } if owner == thread => {
                self.blocked = saved_mask;
                self.state = HandlerState::Normal;
                Ok(())
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn valid_signum(signum: i32) -> KResult<usize> {
    usize::try_from(signum)
        .ok()
        .filter(|&s| s < NSIGS)
        .ok_or(KernelError::InvalidArgument)
}

impl Kernel {
    /// Install and/or read the disposition of `signum`. SIGKILL and SIGSTOP
    /// are refused outright.
    ///
    /// The old action is written to `old` (if nonzero) before the new one
    /// (if `act` is nonzero) is validated and installed.
    pub fn sigaction(&self, signum: i32, act: u64, old: u64) -> KResult<()> {
        let signum = valid_signum(signum)?;
        if signum == SIGKILL || signum == SIGSTOP {
            return Err(KernelError::InvalidArgument);
        }
        let p = self.myproc();
        let mut inner = p.lock.lock();
        if old != 0 {
            let current = inner.sig.action(signum);
            self.copyout(p, old, current.as_bytes())?;
        }
        if act != 0 {
            let mut new = SigAction::default();
            self.copyin(p, act, new.as_bytes_mut())?;
            inner.sig.set_action(signum, new)?;
        }
        Ok(())
    }

    /// Replace the calling process's blocked mask; returns the previous one.
    pub fn sigprocmask(&self, mask: SigSet) -> KResult<SigSet> {
        let p = self.myproc();
        let mut inner = p.lock.lock();
        inner.sig.set_blocked(mask)
    }

    /// Return from a custom handler: restore the interrupted registers and
    /// the mask that was active before delivery. Returns the restored `a0`.
    pub fn sigret(&self) -> KResult<u64> {
        let p = self.myproc();
        let t = self.mythread_or_panic();
        let mut inner = p.lock.lock();
        let _ti = t.lock.lock();
        inner.sig.leave_handler(t.slot())?;
        // SAFETY: the current thread owns its backup and trapframe slot
        let backup = match unsafe { t.backup() } {
            Some(backup) => **backup,
            None => panic!("sigret: no backup frame"),
        };
        let tf = unsafe { t.trapframe() };
        *tf = backup;
        Ok(tf.a0)
    }

    /// Act on pending signals before the current thread returns to user mode.
    pub(crate) fn handle_signals(&'static self) {
        let p = self.myproc();
        let t = self.mythread_or_panic();
        let mut inner = p.lock.lock();
        if inner.sig.in_handler() {
            return;
        }
        let mut from = 0;
        while let Some(signum) = inner.sig.next_deliverable(from) {
            from = signum + 1;
            match inner.sig.handler(signum) {
                SigHandler::Ignore => inner.sig.pending &= !sigbit(signum),
                SigHandler::Default => match signum {
                    SIGSTOP => inner = self.stop(p, t, inner),
                    SIGCONT => inner.sig.pending &= !sigbit(SIGCONT),
                    _ => {
                        inner.sig.pending &= !sigbit(signum);
                        self.kill_process(p, &mut inner);
                    }
                },
                SigHandler::Custom(entry) => {
                    self.deliver(p, t, &mut inner, signum, entry);
                    return;
                }
            }
        }
    }

    /// Mark `p` killed and wake its sleeping threads so they notice.
    pub(crate) fn kill_process(&self, p: &Process, inner: &mut ProcInner) {
        inner.killed = true;
        for t in p.threads.iter() {
            let mut ti = t.lock.lock();
            if ti.state == crate::process::ThreadState::Sleeping {
                ti.state = crate::process::ThreadState::Runnable;
            }
        }
    }

    /// Default SIGSTOP: keep yielding until SIGCONT arrives.
    ///
    /// A SIGKILL posted while stopped ends the stop and kills the process.
    fn stop(
        &'static self,
        p: &'static Process,
        t: &Thread,
        mut inner: SpinlockGuard<'static, ProcInner>,
    ) -> SpinlockGuard<'static, ProcInner> {
        log::debug!("pid {} stopped", inner.pid);
        loop {
            if inner.sig.pending & sigbit(SIGKILL) != 0 || inner.killed {
                inner.sig.pending &= !(sigbit(SIGSTOP) | sigbit(SIGKILL));
                self.kill_process(p, &mut inner);
                return inner;
            }
            if inner.sig.pending & sigbit(SIGCONT) != 0 {
                inner.sig.pending &= !(sigbit(SIGSTOP) | sigbit(SIGCONT));
                log::debug!("pid {} continued", inner.pid);
                return inner;
            }
            if t.lock.lock().killed {
                return inner;
            }
            drop(inner);
            self.yield_now();
            inner = p.lock.lock();
        }
    }

    /// Redirect the current thread into a custom handler.
    fn deliver(
        &self,
        p: &Process,
        t: &Thread,
        inner: &mut ProcInner,
        signum: usize,
        entry: u64,
    ) {
        // SAFETY: the current thread owns its backup and trapframe slot
        let tf = unsafe { t.trapframe() };
        match unsafe { t.backup() } {
            Some(backup) => **backup = *tf,
            None => panic!("deliver: no backup frame"),
        }
        let sp = (tf.sp.wrapping_sub(SIGRET_TRAMPOLINE.len() as u64)) & !0xf;
        if self.copyout(p, sp, &SIGRET_TRAMPOLINE).is_err() {
            log::warn!("pid {}: bad stack for signal {}, killing", inner.pid, signum);
            inner.sig.pending &= !sigbit(signum);
            self.kill_process(p, inner);
            return;
        }
        inner.sig.enter_handler(signum, t.slot());
        tf.sp = sp;
        tf.a0 = signum as u64;
        tf.ra = sp;
        tf.epc = entry;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_and_stop_cannot_be_blocked() {
        let mut sig = SignalState::new();
        assert_eq!(
            sig.set_blocked(sigbit(SIGKILL)),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            sig.set_blocked(sigbit(SIGSTOP) | sigbit(3)),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(sig.set_blocked(sigbit(3)), Ok(0));
        assert_eq!(sig.blocked(), sigbit(3));
    }

    #[test]
    fn handler_masks_are_validated() {
        let mut sig = SignalState::new();
        let bad = SigAction::new(0x4000_0000, sigbit(SIGKILL));
        assert!(sig.set_action(5, bad).is_err());
        assert_eq!(sig.handler(5), SigHandler::Default);
        assert!(sig.set_action(SIGKILL, SigAction::new(SIG_IGN, 0)).is_err());
        assert!(sig.set_action(SIGSTOP, SigAction::new(0x4000_0000, 0)).is_err());
        sig.set_action(5, SigAction::new(0x4000_0000, 0b110)).unwrap();
        assert_eq!(sig.action(5), SigAction::new(0x4000_0000, 0b110));
        assert_eq!(sig.handler(5), SigHandler::Custom(0x4000_0000));
    }

    #[test]
    fn delivery_order_and_blocking() {
        let mut sig = SignalState::new();
        sig.post(12);
        sig.post(4);
        sig.set_blocked(sigbit(4)).unwrap();
        assert_eq!(sig.next_deliverable(0), Some(12));
        sig.set_blocked(0).unwrap();
        assert_eq!(sig.next_deliverable(0), Some(4));
        assert_eq!(sig.next_deliverable(5), Some(12));
        assert_eq!(sig.next_deliverable(13), None);
    }

    #[test]
    fn handler_state_restores_mask() {
        let mut sig = SignalState::new();
        sig.set_blocked(sigbit(2)).unwrap();
        sig.set_action(6, SigAction::new(0x4000_0010, sigbit(7))).unwrap();
        sig.post(6);
        sig.enter_handler(6, 1);
        assert!(sig.in_handler());
        assert_eq!(sig.blocked(), sigbit(7));
        assert_eq!(sig.pending, 0);
        // another thread of the process cannot end the handler
        assert_eq!(sig.leave_handler(0), Err(KernelError::InvalidArgument));
        assert!(sig.in_handler());
        assert_eq!(sig.blocked(), sigbit(7));
        sig.leave_handler(1).unwrap();
        assert_eq!(sig.blocked(), sigbit(2));
        assert_eq!(sig.leave_handler(1), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn fork_inherits_dispositions_not_pending() {
        let mut sig = SignalState::new();
        sig.set_action(3, SigAction::new(SIG_IGN, 0)).unwrap();
        sig.set_blocked(sigbit(8)).unwrap();
        sig.post(8);
        let child = sig.inherit();
        assert_eq!(child.pending, 0);
        assert_eq!(child.blocked(), sigbit(8));
        assert_eq!(child.handler(3), SigHandler::Ignore);
    }

    #[test]
    fn trampoline_encodes_sigret() {
        let li = u32::from_le_bytes([
            SIGRET_TRAMPOLINE[0],
            SIGRET_TRAMPOLINE[1],
            SIGRET_TRAMPOLINE[2],
            SIGRET_TRAMPOLINE[3],
        ]);
        assert_eq!(li & 0x7f, 0x13);
        assert_eq!((li >> 7) & 0x1f, 17);
        assert_eq!(li >> 20, SyscallNumber::SigRet as u32);
        assert_eq!(&SIGRET_TRAMPOLINE[4..], &[0x73, 0, 0, 0]);
    }

    #[test]
    fn signal_numbers_are_bounded() {
        assert_eq!(valid_signum(31), Ok(31));
        assert!(valid_signum(32).is_err());
        assert!(valid_signum(-1).is_err());
    }
}
