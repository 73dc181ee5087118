// User mode for the hosted machine
//
// User programs are Rust routines loaded at addresses in a text region. A
// thread "executes" by calling the routine at its trapframe's `epc` with `a0`
// as the argument; a system call stores its number and arguments in the
// trapframe and traps into the kernel. When the kernel redirects `epc` to a
// signal handler the runtime calls that routine and then executes whatever
// code lies at the return address, which for a delivered signal is the
// sigret trampoline on the user stack.
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::Cell;
use spin::RwLock;

use crate::console::Console;
use crate::process::signal::{SigAction, SIGRET_TRAMPOLINE};
use crate::process::{Kernel, Pid, Tid};
use crate::syscalls::SyscallNumber;
use crate::trap::UserMode;
use crate::trapframe::Trapframe;
use zerocopy::{AsBytes, FromBytes};

pub mod csem;

pub use csem::CountingSemaphore;

/// A user program: called with the thread's user context and `a0`.
pub type Routine = Arc<dyn Fn(&User<'_>, u64) + Send + Sync>;

/// Address of the first loaded routine. Never 0 or 1, which are the
/// SIG_DFL and SIG_IGN markers.
pub const USER_TEXT_BASE: u64 = 0x4000_0000;
const ENTRY_ALIGN: u64 = 16;

/// Loaded programs and the user-visible console.
pub struct Runtime {
    text: RwLock<Vec<Routine>>,
    console: Console,
}

impl Runtime {
    pub(crate) fn new() -> &'static Runtime {
        Box::leak(Box::new(Runtime {
            text: RwLock::new(Vec::new()),
            console: Console::new(),
        }))
    }

    pub(crate) fn load(&self, routine: Routine) -> u64 {
        let mut text = self.text.write();
        text.push(routine);
        USER_TEXT_BASE + (text.len() as u64 - 1) * ENTRY_ALIGN
    }

    fn lookup(&self, pc: u64) -> Option<Routine> {
        let off = pc.checked_sub(USER_TEXT_BASE)?;
        if off % ENTRY_ALIGN != 0 {
            return None;
        }
        self.text.read().get((off / ENTRY_ALIGN) as usize).cloned()
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    /// Run the code at `entry` until it returns. False if nothing is there.
    fn call(&self, k: &'static Kernel, entry: u64, arg: u64) -> bool {
        match self.lookup(entry) {
            Some(routine) => {
                let u = User::new(k, self, entry);
                routine(&u, arg);
                true
            }
            None => false,
        }
    }

    /// Continue at return address `ra`. Only the sigret trampoline is
    /// executable outside the text region; true if it ran and restored an
    /// interrupted context.
    fn execute_return(&self, k: &'static Kernel, ra: u64) -> bool {
        let mut code = [0u8; SIGRET_TRAMPOLINE.len()];
        if k.copyin_user(ra, &mut code).is_err() || code != SIGRET_TRAMPOLINE {
            return false;
        }
        k.with_trapframe(|tf| {
            tf.epc = ra;
            tf.a7 = SyscallNumber::SigRet as u64;
        });
        k.usertrap();
        k.with_trapframe(|tf| tf.epc) != ra
    }

    /// Run signal handlers the kernel redirected this thread to until
    /// execution is back at `pc`.
    fn run_redirects(&self, k: &'static Kernel, pc: u64) {
        loop {
            let (entry, ra, arg) = k.with_trapframe(|tf| (tf.epc, tf.ra, tf.a0));
            if entry == pc {
                return;
            }
            if !self.call(k, entry, arg) {
                k.user_fault("jump to unmapped code");
            }
            if !self.execute_return(k, ra) {
                k.user_fault("handler returned to a bad address");
            }
        }
    }
}

impl UserMode for Runtime {
    fn resume(&self, k: &'static Kernel) -> ! {
        loop {
            let (entry, ra, arg) = k.with_trapframe(|tf| (tf.epc, tf.ra, tf.a0));
            if !self.call(k, entry, arg) {
                k.user_fault("jump to unmapped code");
            }
            if !self.execute_return(k, ra) {
                // Fell off the end of the thread's start routine.
                k.kthread_exit(0);
            }
        }
    }
}

/// User-mode view of the running thread: system call stubs and memory
/// access.
pub struct User<'a> {
    kernel: &'static Kernel,
    runtime: &'a Runtime,
    pc: u64,
    scratch: Cell<Option<u64>>,
}

const SCRATCH_SIZE: i64 = 64;

impl<'a> User<'a> {
    fn new(kernel: &'static Kernel, runtime: &'a Runtime, pc: u64) -> Self {
        Self {
            kernel,
            runtime,
            pc,
            scratch: Cell::new(None),
        }
    }

    fn trap(&self, pc: u64, num: SyscallNumber, args: [u64; 3]) -> u64 {
        let k = self.kernel;
        k.with_trapframe(|tf| {
            tf.a0 = args[0];
            tf.a1 = args[1];
            tf.a2 = args[2];
            tf.a7 = num as u64;
            tf.epc = pc;
        });
        k.usertrap();
        self.runtime.run_redirects(k, pc);
        k.with_trapframe(|tf| tf.a0)
    }

    fn syscall(&self, num: SyscallNumber, args: [u64; 3]) -> u64 {
        self.trap(self.pc, num, args)
    }

    /// A small per-call buffer for results passed through memory.
    fn scratch(&self) -> u64 {
        if let Some(addr) = self.scratch.get() {
            return addr;
        }
        let addr = self.malloc(SCRATCH_SIZE as usize);
        self.scratch.set(Some(addr));
        addr
    }

    /// Entry address of the code this context runs.
    pub fn pc(&self) -> u64 {
        self.pc
    }

    /// Copy of the thread's saved registers.
    pub fn regs(&self) -> Trapframe {
        self.kernel.with_trapframe(|tf| *tf)
    }

    pub fn set_regs(&self, f: impl FnOnce(&mut Trapframe)) {
        self.kernel.with_trapframe(f)
    }

    /// Fork; the child starts at `child` with argument 0. Returns the child's
    /// pid, or -1.
    pub fn fork(&self, child: u64) -> Pid {
        let pid = self.trap(child, SyscallNumber::Fork, [0; 3]) as Pid;
        self.kernel.with_trapframe(|tf| tf.epc = self.pc);
        pid
    }

    /// Fork, handing `value` to the child in register `s1`.
    pub fn fork_with(&self, child: u64, value: u64) -> Pid {
        self.set_regs(|tf| tf.s1 = value);
        self.fork(child)
    }

    pub fn exit(&self, status: i32) -> ! {
        self.syscall(SyscallNumber::Exit, [status as u64, 0, 0]);
        unreachable!("exit returned");
    }

    /// Wait for a child; its status goes to `status_addr` when nonzero.
    pub fn wait(&self, status_addr: u64) -> Pid {
        self.syscall(SyscallNumber::Wait, [status_addr, 0, 0]) as Pid
    }

    /// Wait for a child and return `(pid, status)`, or `None` on failure.
    pub fn wait_status(&self) -> Option<(Pid, i32)> {
        let addr = self.scratch();
        let pid = self.wait(addr);
        (pid >= 0).then(|| (pid, self.read_i32(addr)))
    }

    pub fn kill(&self, pid: Pid, signum: i32) -> i32 {
        self.syscall(SyscallNumber::Kill, [pid as u64, signum as u64, 0]) as i32
    }

    pub fn getpid(&self) -> Pid {
        self.syscall(SyscallNumber::GetPid, [0; 3]) as Pid
    }

    pub fn sbrk(&self, n: i64) -> i64 {
        self.syscall(SyscallNumber::Sbrk, [n as u64, 0, 0]) as i64
    }

    /// Allocate `len` bytes of zeroed memory; faults the process when out of
    /// memory.
    pub fn malloc(&self, len: usize) -> u64 {
        let len = (len as i64 + 15) & !15;
        let addr = self.sbrk(len);
        if addr < 0 {
            self.kernel.user_fault("out of memory");
        }
        addr as u64
    }

    pub fn sleep(&self, ticks: i32) -> i32 {
        self.syscall(SyscallNumber::Sleep, [ticks as u64, 0, 0]) as i32
    }

    pub fn uptime(&self) -> u64 {
        self.syscall(SyscallNumber::Uptime, [0; 3])
    }

    /// Set the blocked mask; returns the previous mask or -1.
    pub fn sigprocmask(&self, mask: u32) -> i64 {
        let r = self.syscall(SyscallNumber::SigProcMask, [mask as u64, 0, 0]);
        if r as i64 == -1 {
            -1
        } else {
            r as u32 as i64
        }
    }

    /// Raw `sigaction(signum, act, oldact)` with user addresses.
    pub fn sigaction_raw(&self, signum: i32, act: u64, old: u64) -> i32 {
        self.syscall(SyscallNumber::SigAction, [signum as u64, act, old]) as i32
    }

    /// Install `act` (if any) for `signum`; returns the previous action.
    pub fn sigaction(&self, signum: i32, act: Option<SigAction>) -> Option<SigAction> {
        let scratch = self.scratch();
        let (act_addr, old_addr) = (scratch, scratch + 16);
        if let Some(act) = act {
            self.write_bytes(act_addr, act.as_bytes());
        }
        let r = self.sigaction_raw(signum, if act.is_some() { act_addr } else { 0 }, old_addr);
        if r < 0 {
            return None;
        }
        SigAction::read_from(self.read_bytes(old_addr, 16).as_slice())
    }

    /// Install a custom handler with `mask` for `signum`. Returns false if
    /// the kernel refused it.
    pub fn signal(&self, signum: i32, handler: u64, mask: u32) -> bool {
        self.sigaction(signum, Some(SigAction::new(handler, mask)))
            .is_some()
    }

    pub fn sigret(&self) -> i64 {
        self.syscall(SyscallNumber::SigRet, [0; 3]) as i64
    }

    /// Start a thread at `start` on the stack at `stack`.
    pub fn kthread_create(&self, start: u64, stack: u64) -> Tid {
        self.syscall(SyscallNumber::KthreadCreate, [start, stack, 0]) as Tid
    }

    /// Start a thread at `start` on a freshly allocated stack.
    pub fn spawn(&self, start: u64) -> Tid {
        let stack = self.malloc(crate::param::MAX_STACK_SIZE as usize);
        self.kthread_create(start, stack)
    }

    pub fn kthread_id(&self) -> Tid {
        self.syscall(SyscallNumber::KthreadId, [0; 3]) as Tid
    }

    pub fn kthread_exit(&self, status: i32) -> ! {
        self.syscall(SyscallNumber::KthreadExit, [status as u64, 0, 0]);
        unreachable!("kthread_exit returned");
    }

    pub fn kthread_join(&self, tid: Tid, status_addr: u64) -> i32 {
        self.syscall(SyscallNumber::KthreadJoin, [tid as u64, status_addr, 0]) as i32
    }

    /// Join `tid` and return its exit status, or `None` on failure.
    pub fn join(&self, tid: Tid) -> Option<i32> {
        let addr = self.scratch() + 32;
        self.write_i32(addr, 0);
        (self.kthread_join(tid, addr) == 0).then(|| self.read_i32(addr))
    }

    pub fn bsem_alloc(&self) -> i32 {
        self.syscall(SyscallNumber::BsemAlloc, [0; 3]) as i32
    }

    pub fn bsem_free(&self, d: i32) -> i32 {
        self.syscall(SyscallNumber::BsemFree, [d as u64, 0, 0]) as i32
    }

    pub fn bsem_down(&self, d: i32) -> i32 {
        self.syscall(SyscallNumber::BsemDown, [d as u64, 0, 0]) as i32
    }

    pub fn bsem_up(&self, d: i32) -> i32 {
        self.syscall(SyscallNumber::BsemUp, [d as u64, 0, 0]) as i32
    }

    /// Reap children forever; the body of an init program.
    pub fn reap_forever(&self) -> ! {
        loop {
            if self.wait(0) < 0 {
                self.sleep(1);
            }
        }
    }

    pub fn print(&self, s: &str) {
        self.runtime.console().write_str(s);
    }

    pub fn read_bytes(&self, va: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        if self.kernel.copyin_user(va, &mut buf).is_err() {
            self.kernel.user_fault("load fault");
        }
        buf
    }

    pub fn write_bytes(&self, va: u64, data: &[u8]) {
        if self.kernel.copyout_user(va, data).is_err() {
            self.kernel.user_fault("store fault");
        }
    }

    pub fn read_u64(&self, va: u64) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.read_bytes(va, 8));
        u64::from_le_bytes(b)
    }

    pub fn write_u64(&self, va: u64, v: u64) {
        self.write_bytes(va, &v.to_le_bytes());
    }

    pub fn read_i32(&self, va: u64) -> i32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.read_bytes(va, 4));
        i32::from_le_bytes(b)
    }

    pub fn write_i32(&self, va: u64, v: i32) {
        self.write_bytes(va, &v.to_le_bytes());
    }
}
