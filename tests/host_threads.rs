// Host threads behind reaped kernel threads end with them
mod common;

use std::sync::mpsc;
use std::time::{Duration, Instant};

use common::{machine, recv, TIMEOUT};
use smpkern::arch::hosted::kthread_hosts;

const ROUNDS: usize = 3;
const CYCLES: usize = 100;

/// Wait for retired host threads to finish unwinding; returns the count
/// once it is at most `bound`, or the last count seen.
fn settle(bound: usize) -> usize {
    let start = Instant::now();
    loop {
        let n = kthread_hosts();
        if n <= bound || start.elapsed() > TIMEOUT {
            return n;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn fork_exit_wait_cycles_keep_host_threads_bounded() {
    let m = machine(2);
    let (tx, rx) = mpsc::channel();
    let child = m.program(|u, _| u.exit(0));
    let init = m.program(move |u, _| {
        for _ in 0..ROUNDS {
            let mut reaped = 0;
            for _ in 0..CYCLES {
                if u.fork(child) > 0 && u.wait(0) > 0 {
                    reaped += 1;
                }
            }
            tx.send(reaped).unwrap();
        }
        u.reap_forever()
    });
    m.boot(init).unwrap();

    for round in 0..ROUNDS {
        assert_eq!(recv(&rx), CYCLES);
        // init, the child of the next round and a straggler or two
        let live = settle(4);
        assert!(live <= 4, "round {}: {} host threads", round, live);
    }
    // Only init is left.
    assert_eq!(settle(1), 1);
}
