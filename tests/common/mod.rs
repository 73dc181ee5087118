// Shared helpers for the integration tests
#![allow(dead_code)]

use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use smpkern::{Machine, MachineConfig, ProcSnapshot, User};

/// How long a test waits for a user program to report.
pub const TIMEOUT: Duration = Duration::from_secs(20);

pub fn machine(cores: usize) -> Machine {
    machine_with(MachineConfig {
        cores,
        ..MachineConfig::default()
    })
}

pub fn machine_with(config: MachineConfig) -> Machine {
    match Machine::new(config) {
        Ok(m) => m,
        Err(e) => panic!("cannot build machine: {}", e),
    }
}

/// Next report from a user program.
pub fn recv<T>(rx: &Receiver<T>) -> T {
    rx.recv_timeout(TIMEOUT)
        .expect("user program did not report in time")
}

/// Poll the process table until `pred` holds.
pub fn wait_until(m: &Machine, pred: impl Fn(&[ProcSnapshot]) -> bool) -> Vec<ProcSnapshot> {
    let start = Instant::now();
    loop {
        let procs = m.inspect(|k| k.snapshot());
        if pred(&procs) {
            return procs;
        }
        assert!(start.elapsed() < TIMEOUT, "condition never held: {:?}", procs);
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Sleep in user mode until `cond` holds, giving up after `ticks` ticks.
pub fn spin_ticks(u: &User<'_>, ticks: u32, cond: impl Fn() -> bool) -> bool {
    for _ in 0..ticks {
        if cond() {
            return true;
        }
        u.sleep(1);
    }
    cond()
}
