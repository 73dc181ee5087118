// Hosted machine: boots the kernel on host threads
use alloc::sync::Arc;
use core::time::Duration;
use log::LevelFilter;
use std::sync::{Mutex, PoisonError};

use crate::arch::hosted::Cores;
use crate::console::Console;
use crate::error::{KResult, KernelError};
use crate::logger;
use crate::param::{INIT_IMAGE_PAGES, NCPU};
use crate::process::{Kernel, Pid};
use crate::user::{Routine, Runtime, User};

/// Hardware description of a hosted machine.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Cores running a scheduler.
    pub cores: usize,
    /// Physical pages in the page pool.
    pub pages: usize,
    /// Pages mapped for the root process.
    pub init_pages: usize,
    /// Timer period; one tick.
    pub time_slice: Duration,
    pub log_level: LevelFilter,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            cores: 2,
            pages: 1024,
            init_pages: INIT_IMAGE_PAGES,
            time_slice: Duration::from_millis(1),
            log_level: LevelFilter::Warn,
        }
    }
}

/// A kernel plus the cores that run it.
///
/// The last core never runs a scheduler; `inspect` borrows it to call into
/// the kernel from the host.
pub struct Machine {
    config: MachineConfig,
    kernel: &'static Kernel,
    cores: &'static Cores,
    runtime: &'static Runtime,
    service: Mutex<()>,
}

impl Machine {
    pub fn new(config: MachineConfig) -> KResult<Self> {
        if config.cores == 0 || config.cores >= NCPU {
            return Err(KernelError::InvalidArgument);
        }
        logger::init(config.log_level);
        let runtime = Runtime::new();
        let kernel = Kernel::new(config.pages, runtime);
        let cores = Cores::new(config.cores + 1, config.time_slice);
        Ok(Self {
            config,
            kernel,
            cores,
            runtime,
            service: Mutex::new(()),
        })
    }

    /// Load a user routine and return its entry address.
    pub fn program<F>(&self, routine: F) -> u64
    where
        F: Fn(&User<'_>, u64) + Send + Sync + 'static,
    {
        let routine: Routine = Arc::new(routine);
        self.runtime.load(routine)
    }

    /// Create the root process at `init` and power on the cores.
    pub fn boot(&self, init: u64) -> KResult<Pid> {
        let pid = self.inspect(|k| k.userinit(init, self.config.init_pages))?;
        let kernel = self.kernel;
        for id in 0..self.config.cores {
            self.cores.start(id, move || kernel.scheduler());
        }
        log::info!("booted {} cores", self.config.cores);
        Ok(pid)
    }

    /// Run `f` on the service core.
    pub fn inspect<R>(&self, f: impl FnOnce(&'static Kernel) -> R) -> R {
        let _service = self.service.lock().unwrap_or_else(PoisonError::into_inner);
        self.cores.enter(self.config.cores);
        let r = f(self.kernel);
        Cores::leave();
        r
    }

    pub fn kernel(&self) -> &'static Kernel {
        self.kernel
    }

    /// Output written by user programs.
    pub fn console(&self) -> &Console {
        self.runtime.console()
    }

    pub fn free_pages(&self) -> usize {
        self.kernel.free_pages()
    }

    /// Park every scheduler at its next pass.
    pub fn halt(&self) {
        self.cores.halt();
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.halt();
    }
}
