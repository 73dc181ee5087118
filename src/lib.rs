// SMPKERN - multithreaded SMP kernel core
//
// Process/thread lifecycle, per-core round-robin scheduling, sleep/wakeup,
// POSIX-style signals and a binary semaphore pool. Hardware access goes
// through `arch`; the `hosted` backend runs every core and every kernel
// thread on a host thread so the whole substrate runs under `cargo test`.
#![no_std]

extern crate alloc;
#[cfg(any(test, feature = "hosted"))]
extern crate std;

#[macro_use]
pub mod console;

pub mod arch;
pub mod error;
pub mod fs;
pub mod logger;
pub mod param;
pub mod process;
pub mod semaphore;
pub mod spinlock;
pub mod syscalls;
pub mod trap;
pub mod trapframe;
pub mod vm;

#[cfg(feature = "hosted")]
pub mod machine;
#[cfg(feature = "hosted")]
pub mod user;

pub use error::{KResult, KernelError};
pub use process::{Chan, Kernel, Pid, ProcSnapshot, ProcState, ThreadSnapshot, ThreadState, Tid};
pub use process::signal::{SigAction, SigHandler, SIGCONT, SIGKILL, SIGSTOP, SIG_DFL, SIG_IGN};
pub use trapframe::Trapframe;

#[cfg(feature = "hosted")]
pub use machine::{Machine, MachineConfig};
#[cfg(feature = "hosted")]
pub use user::{CountingSemaphore, User};
