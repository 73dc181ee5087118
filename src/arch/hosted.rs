// Hosted backend: cores and kernel threads on host threads
//
// Every core is a host thread running its scheduler. Every kernel thread
// gets its own host thread the first time a core switches into it. A switch
// hands the core (the `Seat`) to the next context through its baton and then
// blocks on the old context's baton until some core hands one back, so at any
// time exactly one host thread runs on each core.
//
// Freeing a thread slot drops its context, which retires the baton. A host
// thread parked on a retired baton unwinds off its stack and ends.
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use core::any::Any;
use core::cell::Cell;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Interrupt and timer state of one core.
pub struct CoreRegs {
    intr: AtomicBool,
    noff: AtomicUsize,
    intena: AtomicBool,
    deadline: AtomicU64,
}

impl CoreRegs {
    fn new() -> Self {
        Self {
            intr: AtomicBool::new(false),
            noff: AtomicUsize::new(0),
            intena: AtomicBool::new(false),
            deadline: AtomicU64::new(0),
        }
    }

    /// Depth of `push_off` nesting.
    pub fn noff(&self) -> usize {
        self.noff.load(Ordering::Relaxed)
    }

    pub fn set_noff(&self, n: usize) {
        self.noff.store(n, Ordering::Relaxed);
    }

    /// Were interrupts enabled before the outermost `push_off`?
    pub fn intena(&self) -> bool {
        self.intena.load(Ordering::Relaxed)
    }

    pub fn set_intena(&self, on: bool) {
        self.intena.store(on, Ordering::Relaxed);
    }
}

/// The register file of a whole machine.
pub struct Cores {
    regs: Box<[CoreRegs]>,
    epoch: Instant,
    slice_ns: u64,
    halted: AtomicBool,
}

#[derive(Clone, Copy)]
struct Seat {
    cores: &'static Cores,
    id: usize,
}

std::thread_local! {
    static SEAT: Cell<Option<Seat>> = const { Cell::new(None) };
    static RETIRED: Cell<bool> = const { Cell::new(false) };
}

/// Host threads currently backing kernel threads, across all machines.
static KTHREAD_HOSTS: AtomicUsize = AtomicUsize::new(0);

pub fn kthread_hosts() -> usize {
    KTHREAD_HOSTS.load(Ordering::Acquire)
}

/// Is the calling host thread unwinding off a retired context?
pub fn retired() -> bool {
    RETIRED.with(|r| r.get())
}

/// Unwind payload of a retired kernel thread.
struct Retired;

fn unwind_retired() -> ! {
    SEAT.with(|s| s.set(None));
    RETIRED.with(|r| r.set(true));
    panic::resume_unwind(Box::new(Retired))
}

fn run_kthread(entry: Entry) {
    let ran = panic::catch_unwind(AssertUnwindSafe(entry));
    KTHREAD_HOSTS.fetch_sub(1, Ordering::AcqRel);
    match ran {
        Ok(()) => panic!("kernel thread entry returned"),
        Err(payload) if is_retired(&*payload) => {}
        Err(payload) => panic::resume_unwind(payload),
    }
}

fn is_retired(payload: &(dyn Any + Send)) -> bool {
    payload.is::<Retired>()
}

impl Cores {
    /// Create `count` cores whose timers fire every `slice`.
    pub fn new(count: usize, slice: Duration) -> &'static Cores {
        let regs = (0..count).map(|_| CoreRegs::new()).collect();
        Box::leak(Box::new(Cores {
            regs,
            epoch: Instant::now(),
            slice_ns: slice.as_nanos().max(1) as u64,
            halted: AtomicBool::new(false),
        }))
    }

    pub fn count(&self) -> usize {
        self.regs.len()
    }

    /// Bind the calling host thread to core `id`.
    ///
    /// The caller becomes that core: it must be the only host thread doing so.
    pub fn enter(&'static self, id: usize) {
        assert!(id < self.count(), "no core {}", id);
        SEAT.with(|s| s.set(Some(Seat { cores: self, id })));
    }

    /// Unbind the calling host thread from whatever core it occupies.
    pub fn leave() {
        SEAT.with(|s| s.set(None));
    }

    /// Power on core `id`: a new host thread enters it and runs `main`.
    pub fn start<F>(&'static self, id: usize, main: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let spawned = thread::Builder::new()
            .name(alloc::format!("core{}", id))
            .spawn(move || {
                self.enter(id);
                main();
            });
        if let Err(e) = spawned {
            panic!("cannot start core {}: {}", id, e);
        }
    }

    /// Stop all schedulers at their next pass.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::Release);
    }

    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }
}

fn seat() -> Seat {
    match SEAT.with(|s| s.get()) {
        Some(seat) => seat,
        None => panic!("kernel code on a host thread that holds no core"),
    }
}

/// Id of the core the caller runs on.
pub fn cpu_id() -> usize {
    seat().id
}

pub fn this_core() -> &'static CoreRegs {
    let seat = seat();
    &seat.cores.regs[seat.id]
}

pub fn intr_on() {
    this_core().intr.store(true, Ordering::Relaxed);
}

pub fn intr_off() {
    this_core().intr.store(false, Ordering::Relaxed);
}

pub fn intr_get() -> bool {
    this_core().intr.load(Ordering::Relaxed)
}

/// Consume this core's timer interrupt if its time slice has run out.
pub fn timer_fired() -> bool {
    let seat = seat();
    let regs = &seat.cores.regs[seat.id];
    let now = seat.cores.epoch.elapsed().as_nanos() as u64;
    if now >= regs.deadline.load(Ordering::Relaxed) {
        regs.deadline
            .store(now + seat.cores.slice_ns, Ordering::Relaxed);
        true
    } else {
        false
    }
}

/// End of one scheduler pass: park for good once the machine halts,
/// otherwise wait a little when the pass found nothing to run.
pub fn scheduler_idle(found: bool) {
    let seat = seat();
    if seat.cores.halted() {
        loop {
            thread::park();
        }
    }
    if !found {
        thread::sleep(Duration::from_micros(100));
    }
}

type Entry = Box<dyn FnOnce() + Send + 'static>;

struct Handoff {
    seat: Option<Seat>,
    entry: Option<Entry>,
    retired: bool,
}

struct Baton {
    handoff: Mutex<Handoff>,
    ready: Condvar,
}

fn lock(m: &Mutex<Handoff>) -> MutexGuard<'_, Handoff> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Baton {
    fn new(entry: Option<Entry>) -> Arc<Self> {
        Arc::new(Baton {
            handoff: Mutex::new(Handoff {
                seat: None,
                entry,
                retired: false,
            }),
            ready: Condvar::new(),
        })
    }

    fn hand_over(self: &Arc<Self>, seat: Seat) {
        let entry = {
            let mut h = lock(&self.handoff);
            h.seat = Some(seat);
            h.entry.take()
        };
        match entry {
            Some(entry) => {
                let baton = Arc::clone(self);
                KTHREAD_HOSTS.fetch_add(1, Ordering::AcqRel);
                let spawned = thread::Builder::new()
                    .name(String::from("kthread"))
                    .spawn(move || match baton.wait_for_seat() {
                        Some(seat) => {
                            SEAT.with(|s| s.set(Some(seat)));
                            run_kthread(entry);
                        }
                        None => {
                            KTHREAD_HOSTS.fetch_sub(1, Ordering::AcqRel);
                        }
                    });
                if let Err(e) = spawned {
                    panic!("cannot start kernel thread: {}", e);
                }
            }
            None => self.ready.notify_one(),
        }
    }

    fn retire(&self) {
        let entry = {
            let mut h = lock(&self.handoff);
            h.retired = true;
            h.entry.take()
        };
        drop(entry);
        self.ready.notify_all();
    }

    /// Block until a core is handed over. `None` once the baton is retired.
    fn wait_for_seat(&self) -> Option<Seat> {
        let mut h = lock(&self.handoff);
        loop {
            if let Some(seat) = h.seat.take() {
                return Some(seat);
            }
            if h.retired {
                return None;
            }
            h = self
                .ready
                .wait(h)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Saved execution state of a kernel thread or a scheduler.
pub struct Context {
    baton: Arc<Baton>,
}

impl Context {
    /// Context of code that is already running, such as a core's scheduler.
    pub fn new() -> Self {
        Self {
            baton: Baton::new(None),
        }
    }

    /// Context that starts executing `entry` the first time it is switched to.
    pub fn primed(entry: Entry) -> Self {
        Self {
            baton: Baton::new(Some(entry)),
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.baton.retire();
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Save the running state into `old` and resume `new` on this core.
///
/// Returns when another core (or this one) switches back to `old`. If `old`
/// is dropped instead, the calling host thread unwinds and ends.
///
/// # Safety
///
/// The caller must be the code currently running on this core as `old`, and
/// `new` must not be running anywhere.
pub unsafe fn swtch(old: &Context, new: &Context) {
    let seat = seat();
    // `old` may be freed by a reaper once the core is gone
    let parked = Arc::clone(&old.baton);
    new.baton.hand_over(seat);
    match parked.wait_for_seat() {
        Some(seat) => SEAT.with(|s| s.set(Some(seat))),
        None => unwind_retired(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn primed_context_runs_and_switches_back() {
        static WORKER: AtomicUsize = AtomicUsize::new(0);
        let cores = Cores::new(1, Duration::from_millis(1));
        let (tx, rx) = mpsc::channel();
        let main: &'static Context = Box::leak(Box::new(Context::new()));
        let worker: &'static Context = Box::leak(Box::new(Context::primed(Box::new(move || {
            tx.send(cpu_id()).unwrap();
            let me = unsafe { &*(WORKER.load(Ordering::SeqCst) as *const Context) };
            unsafe { swtch(me, main) };
        }))));
        WORKER.store(worker as *const Context as usize, Ordering::SeqCst);
        cores.enter(0);
        unsafe { swtch(main, worker) };
        assert_eq!(rx.recv().unwrap(), 0);
        assert_eq!(cpu_id(), 0);
        Cores::leave();
    }

    #[test]
    fn dropping_a_parked_context_ends_its_host_thread() {
        struct Unwound(mpsc::Sender<bool>);
        impl Drop for Unwound {
            fn drop(&mut self) {
                let _ = self.0.send(retired());
            }
        }
        static WORKER: AtomicUsize = AtomicUsize::new(0);
        let cores = Cores::new(1, Duration::from_millis(1));
        let (tx, rx) = mpsc::channel();
        let main: &'static Context = Box::leak(Box::new(Context::new()));
        let worker = Box::new(Context::primed(Box::new(move || {
            let _unwound = Unwound(tx);
            let me = unsafe { &*(WORKER.load(Ordering::SeqCst) as *const Context) };
            unsafe { swtch(me, main) };
            unreachable!("retired context resumed");
        })));
        WORKER.store(&*worker as *const Context as usize, Ordering::SeqCst);
        cores.enter(0);
        unsafe { swtch(main, &worker) };
        assert!(rx.try_recv().is_err());

        drop(worker);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(true));
        assert!(!retired());
        Cores::leave();
    }

    #[test]
    fn timer_fires_once_per_slice() {
        let cores = Cores::new(1, Duration::from_secs(3600));
        cores.enter(0);
        assert!(timer_fired());
        assert!(!timer_fired());
        Cores::leave();
    }

    #[test]
    fn interrupt_flag_is_per_core() {
        let cores = Cores::new(2, Duration::from_millis(1));
        cores.enter(0);
        intr_on();
        cores.enter(1);
        assert!(!intr_get());
        cores.enter(0);
        assert!(intr_get());
        Cores::leave();
    }
}
