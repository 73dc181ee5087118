// Architecture seam
//
// The kernel core needs a small set of per-core primitives: the current core
// id, the interrupt-enable flag, the push_off nesting state, a context switch
// and a periodic timer. A backend provides all of them.

#[cfg(feature = "hosted")]
pub mod hosted;

#[cfg(feature = "hosted")]
pub use hosted::{
    cpu_id, intr_get, intr_off, intr_on, retired, scheduler_idle, swtch, this_core, timer_fired,
    Context, CoreRegs,
};

#[cfg(not(feature = "hosted"))]
compile_error!("smpkern needs an arch backend; enable the `hosted` feature");
