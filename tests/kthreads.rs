// Kernel-level threads: create, join, exit
mod common;

use std::sync::mpsc;

use common::{machine, recv};
use smpkern::param::NTHREAD;

#[derive(Debug)]
struct JoinReport {
    tid: i32,
    status: Option<i32>,
    rejoin: Option<i32>,
    unknown: Option<i32>,
    myself: Option<i32>,
    returned: Option<i32>,
    pid_before: i32,
    pid_after: i32,
}

#[test]
fn create_join_and_exit_status() {
    let m = machine(2);
    let (idtx, idrx) = mpsc::channel();
    let (tx, rx) = mpsc::channel();

    let exits = m.program(move |u, _| {
        idtx.send(u.kthread_id()).unwrap();
        u.kthread_exit(42);
    });
    let returns = m.program(|u, _| {
        u.getpid();
    });
    let init = m.program(move |u, _| {
        let pid_before = u.getpid();
        let tid = u.spawn(exits);
        let status = u.join(tid);
        let rejoin = u.join(tid);
        let unknown = u.join(9999);
        let myself = u.join(u.kthread_id());
        let returned = {
            let tid = u.spawn(returns);
            u.join(tid)
        };
        tx.send(JoinReport {
            tid,
            status,
            rejoin,
            unknown,
            myself,
            returned,
            pid_before,
            pid_after: u.getpid(),
        })
        .unwrap();
        u.reap_forever()
    });
    m.boot(init).unwrap();

    let r = recv(&rx);
    assert!(r.tid > 1, "{:?}", r);
    assert_eq!(recv(&idrx), r.tid);
    assert_eq!(r.status, Some(42));
    assert_eq!(r.rejoin, None, "a joined thread is gone");
    assert_eq!(r.unknown, None);
    assert_eq!(r.myself, None);
    assert_eq!(r.returned, Some(0), "returning from the start routine exits with 0");
    assert_eq!(r.pid_before, r.pid_after);

    // Joined threads left no slots behind.
    let procs = m.inspect(|k| k.snapshot());
    assert_eq!(procs[0].threads.len(), 1);
}

#[test]
fn thread_table_is_bounded() {
    let m = machine(2);
    let (tx, rx) = mpsc::channel();

    let parked = m.program(|u, _| {
        let d = u.regs().s1 as i32;
        u.bsem_down(d);
        u.bsem_up(d);
    });
    let init = m.program(move |u, _| {
        let d = u.bsem_alloc();
        u.bsem_down(d);
        u.set_regs(|tf| tf.s1 = d as u64);
        let tids: Vec<i32> = (1..NTHREAD).map(|_| u.spawn(parked)).collect();
        let overflow = u.spawn(parked);
        u.bsem_up(d);
        let statuses: Vec<Option<i32>> = tids.iter().map(|&t| u.join(t)).collect();
        tx.send((tids, overflow, statuses)).unwrap();
        u.reap_forever()
    });
    m.boot(init).unwrap();

    let (tids, overflow, statuses) = recv(&rx);
    assert!(tids.iter().all(|&t| t > 0), "{:?}", tids);
    assert_eq!(overflow, -1);
    assert_eq!(statuses, vec![Some(0); NTHREAD - 1]);
}

#[test]
fn process_exit_ends_every_thread() {
    let m = machine(3);
    let (tx, rx) = mpsc::channel();

    let spinner = m.program(|u, _| loop {
        u.getpid();
    });
    let blocked = m.program(|u, _| {
        let d = u.regs().s1 as i32;
        u.bsem_down(d);
    });
    let child = m.program(move |u, _| {
        let d = u.bsem_alloc();
        u.bsem_down(d);
        u.set_regs(|tf| tf.s1 = d as u64);
        u.spawn(spinner);
        u.spawn(spinner);
        u.spawn(blocked);
        u.sleep(3);
        u.exit(3);
    });
    let init = m.program(move |u, _| {
        let pid = u.fork(child);
        tx.send((pid, u.wait_status())).unwrap();
        u.reap_forever()
    });
    m.boot(init).unwrap();

    let (pid, status) = recv(&rx);
    assert_eq!(status, Some((pid, 3)));
    let procs = m.inspect(|k| k.snapshot());
    assert!(procs.iter().all(|p| p.pid != pid));
}
