// src/syscalls.rs
use crate::error::KernelError;
use crate::process::Kernel;
use crate::trapframe::Trapframe;

/// System call numbers
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallNumber {
    Fork = 1,
    Exit = 2,
    Wait = 3,
    Kill = 6,
    GetPid = 11,
    Sbrk = 12,
    Sleep = 13,
    Uptime = 14,
    SigProcMask = 22,
    SigAction = 23,
    SigRet = 24,
    KthreadCreate = 25,
    KthreadId = 26,
    KthreadExit = 27,
    KthreadJoin = 28,
    BsemAlloc = 29,
    BsemFree = 30,
    BsemDown = 31,
    BsemUp = 32,
}

impl TryFrom<u64> for SyscallNumber {
    type Error = KernelError;

    fn try_from(num: u64) -> Result<Self, KernelError> {
        use SyscallNumber::*;
        Ok(match num {
            1 => Fork,
            2 => Exit,
            3 => Wait,
            6 => Kill,
            11 => GetPid,
            12 => Sbrk,
            13 => Sleep,
            14 => Uptime,
            22 => SigProcMask,
            23 => SigAction,
            24 => SigRet,
            25 => KthreadCreate,
            26 => KthreadId,
            27 => KthreadExit,
            28 => KthreadJoin,
            29 => BsemAlloc,
            30 => BsemFree,
            31 => BsemDown,
            32 => BsemUp,
            _ => return Err(KernelError::InvalidArgument),
        })
    }
}

/// System call arguments (up to 6 arguments in RISC-V)
#[derive(Debug, Clone, Copy)]
pub struct SyscallArgs {
    pub arg0: u64, // a0
    pub arg1: u64, // a1
    pub arg2: u64, // a2
    pub arg3: u64, // a3
    pub arg4: u64, // a4
    pub arg5: u64, // a5
}

impl SyscallArgs {
    pub fn from_trapframe(tf: &Trapframe) -> Self {
        Self {
            arg0: tf.a0,
            arg1: tf.a1,
            arg2: tf.a2,
            arg3: tf.a3,
            arg4: tf.a4,
            arg5: tf.a5,
        }
    }

    /// Argument `n` as a C `int`.
    pub fn int(&self, n: usize) -> i32 {
        self.raw(n) as i32
    }

    pub fn raw(&self, n: usize) -> u64 {
        match n {
            0 => self.arg0,
            1 => self.arg1,
            2 => self.arg2,
            3 => self.arg3,
            4 => self.arg4,
            _ => self.arg5,
        }
    }
}

/// System call result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallResult {
    Success(u64),
    Error(KernelError),
}

impl<T: Into<i64>> From<Result<T, KernelError>> for SyscallResult {
    fn from(result: Result<T, KernelError>) -> Self {
        match result {
            Ok(value) => SyscallResult::Success(value.into() as u64),
            Err(e) => SyscallResult::Error(e),
        }
    }
}

/// Convert syscall result to u64 for return value
impl From<SyscallResult> for u64 {
    fn from(result: SyscallResult) -> u64 {
        match result {
            SyscallResult::Success(value) => value,
            SyscallResult::Error(err) => err.to_raw(),
        }
    }
}

/// System call handler function type
pub type SyscallHandler = fn(&'static Kernel, SyscallArgs) -> SyscallResult;

/// Handle a system call
pub fn handle_syscall(k: &'static Kernel, syscall_num: u64, args: SyscallArgs) -> SyscallResult {
    let handler: SyscallHandler = match SyscallNumber::try_from(syscall_num) {
        Ok(SyscallNumber::Fork) => syscall_fork,
        Ok(SyscallNumber::Exit) => syscall_exit,
        Ok(SyscallNumber::Wait) => syscall_wait,
        Ok(SyscallNumber::Kill) => syscall_kill,
        Ok(SyscallNumber::GetPid) => syscall_getpid,
        Ok(SyscallNumber::Sbrk) => syscall_sbrk,
        Ok(SyscallNumber::Sleep) => syscall_sleep,
        Ok(SyscallNumber::Uptime) => syscall_uptime,
        Ok(SyscallNumber::SigProcMask) => syscall_sigprocmask,
        Ok(SyscallNumber::SigAction) => syscall_sigaction,
        Ok(SyscallNumber::SigRet) => syscall_sigret,
        Ok(SyscallNumber::KthreadCreate) => syscall_kthread_create,
        Ok(SyscallNumber::KthreadId) => syscall_kthread_id,
        Ok(SyscallNumber::KthreadExit) => syscall_kthread_exit,
        Ok(SyscallNumber::KthreadJoin) => syscall_kthread_join,
        Ok(SyscallNumber::BsemAlloc) => syscall_bsem_alloc,
        Ok(SyscallNumber::BsemFree) => syscall_bsem_free,
        Ok(SyscallNumber::BsemDown) => syscall_bsem_down,
        Ok(SyscallNumber::BsemUp) => syscall_bsem_up,
        Err(e) => {
            log::warn!("pid {}: unknown sys call {}", k.getpid(), syscall_num);
            return SyscallResult::Error(e);
        }
    };
    let result = handler(k, args);
    if let SyscallResult::Error(e) = result {
        log::debug!("sys call {} failed: {}", syscall_num, e);
    }
    result
}

impl Kernel {
    /// Dispatch the system call described by the current trapframe.
    pub(crate) fn syscall(&'static self) {
        let (num, args) = self.with_trapframe(|tf| (tf.a7, SyscallArgs::from_trapframe(tf)));
        let result = handle_syscall(self, num, args);
        self.with_trapframe(|tf| tf.a0 = u64::from(result));
    }
}

// Individual syscall implementations
pub fn syscall_fork(k: &'static Kernel, _args: SyscallArgs) -> SyscallResult {
    k.fork().into()
}

pub fn syscall_exit(k: &'static Kernel, args: SyscallArgs) -> SyscallResult {
    k.exit(args.int(0))
}

pub fn syscall_wait(k: &'static Kernel, args: SyscallArgs) -> SyscallResult {
    k.wait(args.arg0).into()
}

pub fn syscall_kill(k: &'static Kernel, args: SyscallArgs) -> SyscallResult {
    k.kill(args.int(0), args.int(1)).map(|()| 0).into()
}

pub fn syscall_getpid(k: &'static Kernel, _args: SyscallArgs) -> SyscallResult {
    SyscallResult::Success(k.getpid() as u64)
}

pub fn syscall_sbrk(k: &'static Kernel, args: SyscallArgs) -> SyscallResult {
    k.growproc(args.int(0).into())
        .map(|old| old as i64)
        .into()
}

pub fn syscall_sleep(k: &'static Kernel, args: SyscallArgs) -> SyscallResult {
    let n = args.int(0).max(0) as u64;
    let mut ticks = k.ticks.lock();
    let ticks0 = *ticks;
    while *ticks - ticks0 < n {
        if k.killed() {
            return SyscallResult::Error(KernelError::Killed);
        }
        ticks = k.sleep(crate::process::Chan::of(&k.ticks), ticks);
    }
    SyscallResult::Success(0)
}

pub fn syscall_uptime(k: &'static Kernel, _args: SyscallArgs) -> SyscallResult {
    SyscallResult::Success(k.uptime())
}

pub fn syscall_sigprocmask(k: &'static Kernel, args: SyscallArgs) -> SyscallResult {
    k.sigprocmask(args.arg0 as u32).into()
}

pub fn syscall_sigaction(k: &'static Kernel, args: SyscallArgs) -> SyscallResult {
    k.sigaction(args.int(0), args.arg1, args.arg2)
        .map(|()| 0)
        .into()
}

/// Returns the restored `a0`, so writing the result back leaves the
/// interrupted registers exactly as they were.
pub fn syscall_sigret(k: &'static Kernel, _args: SyscallArgs) -> SyscallResult {
    match k.sigret() {
        Ok(a0) => SyscallResult::Success(a0),
        Err(e) => SyscallResult::Error(e),
    }
}

pub fn syscall_kthread_create(k: &'static Kernel, args: SyscallArgs) -> SyscallResult {
    k.kthread_create(args.arg0, args.arg1).into()
}

pub fn syscall_kthread_id(k: &'static Kernel, _args: SyscallArgs) -> SyscallResult {
    SyscallResult::Success(k.kthread_id() as u64)
}

pub fn syscall_kthread_exit(k: &'static Kernel, args: SyscallArgs) -> SyscallResult {
    k.kthread_exit(args.int(0))
}

pub fn syscall_kthread_join(k: &'static Kernel, args: SyscallArgs) -> SyscallResult {
    k.kthread_join(args.int(0), args.arg1).map(|()| 0).into()
}

pub fn syscall_bsem_alloc(k: &'static Kernel, _args: SyscallArgs) -> SyscallResult {
    k.bsem_alloc().into()
}

pub fn syscall_bsem_free(k: &'static Kernel, args: SyscallArgs) -> SyscallResult {
    k.bsem_free(args.int(0)).map(|()| 0).into()
}

pub fn syscall_bsem_down(k: &'static Kernel, args: SyscallArgs) -> SyscallResult {
    k.bsem_down(args.int(0)).map(|()| 0).into()
}

pub fn syscall_bsem_up(k: &'static Kernel, args: SyscallArgs) -> SyscallResult {
    k.bsem_up(args.int(0)).map(|()| 0).into()
}
