// Kernel capacities, fixed at build time

/// Maximum number of cores (scheduler instances plus the service core).
pub const NCPU: usize = 8;

/// Process table slots.
pub const NPROC: usize = 64;

/// Thread slots per process.
pub const NTHREAD: usize = 8;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Signal numbers are `0..NSIGS`; signal `n` is bit `1 << n` in a mask.
pub const NSIGS: usize = 32;

/// Binary semaphore pool size.
pub const MAX_BSEM: usize = 128;

pub const PGSIZE: usize = 4096;

/// Size of a user thread stack handed to `kthread_create`.
pub const MAX_STACK_SIZE: u64 = 4000;

/// Pages mapped for the root process image (code/data plus its stack).
pub const INIT_IMAGE_PAGES: usize = 2;

/// Round `sz` up to a page boundary.
pub const fn pg_round_up(sz: usize) -> usize {
    (sz + PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pg_round_down(addr: usize) -> usize {
    addr & !(PGSIZE - 1)
}
