// Signal dispositions and delivery
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};

use common::{machine, recv, spin_ticks};
use smpkern::{SigAction, SIGCONT, SIGKILL, SIGSTOP, SIG_DFL, SIG_IGN};

const SIGUSR: i32 = 10;
const SIGTERM: i32 = 15;

#[test]
fn kill_and_stop_cannot_be_caught_or_blocked() {
    let m = machine(2);
    let (tx, rx) = mpsc::channel();
    let handler = m.program(|_, _| {});
    let init = m.program(move |u, _| {
        let results = vec![
            u.signal(SIGKILL as i32, handler, 0),
            u.sigaction(SIGSTOP as i32, Some(SigAction::new(SIG_IGN, 0))).is_some(),
            u.sigprocmask(1 << SIGKILL) != -1,
            u.sigprocmask(1 << SIGSTOP) != -1,
            u.signal(SIGUSR, handler, 1 << SIGKILL),
            u.sigaction(32, None).is_some(),
        ];
        let mask_before = u.sigprocmask(1 << 3);
        let mask_after = u.sigprocmask(0);
        let usr = u.sigaction(SIGUSR, None);
        let kill = u.sigaction(SIGKILL as i32, None);
        tx.send((results, mask_before, mask_after, usr, kill)).unwrap();
        u.reap_forever()
    });
    m.boot(init).unwrap();

    let (results, mask_before, mask_after, usr, kill) = recv(&rx);
    assert_eq!(results, [false; 6]);
    // the failed calls left the mask alone
    assert_eq!(mask_before, 0);
    assert_eq!(mask_after, 1 << 3);
    assert_eq!(usr, Some(SigAction::new(SIG_DFL, 0)));
    assert_eq!(kill, None);
}

#[derive(Debug, PartialEq)]
struct Delivery {
    signum: u64,
    mask: i64,
}

#[test]
fn custom_handler_runs_once_and_restores_registers() {
    let m = machine(2);
    let (htx, hrx) = mpsc::channel();
    let (tx, rx) = mpsc::channel();
    let runs = Arc::new(AtomicUsize::new(0));

    let handler = {
        let runs = runs.clone();
        m.program(move |u, signum| {
            runs.fetch_add(1, Ordering::SeqCst);
            let mask = u.sigprocmask(0);
            u.sigprocmask(mask as u32);
            // scribble over registers the interrupted code relies on
            u.set_regs(|tf| {
                tf.s2 = 0xbad;
                tf.a0 = 0xbad;
                tf.sp = 0;
            });
            htx.send(Delivery { signum, mask }).unwrap();
        })
    };
    let init = {
        let runs = runs.clone();
        m.program(move |u, _| {
            assert!(u.signal(SIGUSR, handler, 1 << 7));
            u.set_regs(|tf| tf.s2 = 0x5151);
            let sp = u.regs().sp;
            let me = u.getpid();

            let sent = u.kill(me, SIGUSR);
            let after_first = runs.load(Ordering::SeqCst);
            let regs = u.regs();

            // blocked: stays pending until unblocked
            u.sigprocmask(1 << SIGUSR);
            u.kill(me, SIGUSR);
            let while_blocked = runs.load(Ordering::SeqCst);
            let old = u.sigprocmask(0);
            let after_unblock = runs.load(Ordering::SeqCst);

            // ignored: discarded
            u.sigaction(SIGUSR, Some(SigAction::new(SIG_IGN, 0)));
            u.kill(me, SIGUSR);
            u.getpid();
            let after_ignored = runs.load(Ordering::SeqCst);

            tx.send((
                sent,
                after_first,
                regs.s2 == 0x5151 && regs.sp == sp,
                while_blocked,
                old,
                after_unblock,
                after_ignored,
            ))
            .unwrap();
            u.reap_forever()
        })
    };
    m.boot(init).unwrap();

    let (sent, after_first, restored, while_blocked, old, after_unblock, after_ignored) =
        recv(&rx);
    assert_eq!(sent, 0, "kill's result survives the handler");
    assert_eq!(after_first, 1);
    assert!(restored);
    assert_eq!(while_blocked, 1);
    assert_eq!(old, 1 << SIGUSR);
    assert_eq!(after_unblock, 2);
    assert_eq!(after_ignored, 2);

    let expected = Delivery {
        signum: SIGUSR as u64,
        mask: 1 << 7,
    };
    assert_eq!(recv(&hrx), expected);
    assert_eq!(recv(&hrx), expected);
    assert!(hrx.try_recv().is_err());
}

#[test]
fn default_action_terminates() {
    let m = machine(2);
    let (tx, rx) = mpsc::channel();
    let child = m.program(|u, _| loop {
        u.sleep(1);
    });
    let init = m.program(move |u, _| {
        let pid = u.fork(child);
        u.kill(pid, SIGTERM);
        tx.send((pid, u.wait_status())).unwrap();
        u.reap_forever()
    });
    m.boot(init).unwrap();

    let (pid, status) = recv(&rx);
    assert_eq!(status, Some((pid, -1)));
}

#[derive(Debug)]
struct StopReport {
    started: bool,
    stopped_at: usize,
    still: usize,
    resumed: bool,
    status: Option<(i32, i32)>,
}

#[test]
fn stop_and_continue() {
    let m = machine(2);
    let (tx, rx) = mpsc::channel();
    let progress = Arc::new(AtomicUsize::new(0));

    let child = {
        let progress = progress.clone();
        m.program(move |u, _| loop {
            progress.fetch_add(1, Ordering::SeqCst);
            u.getpid();
        })
    };
    let init = {
        let progress = progress.clone();
        m.program(move |u, _| {
            let pid = u.fork(child);
            let started = spin_ticks(u, 5000, || progress.load(Ordering::SeqCst) > 0);

            u.kill(pid, SIGSTOP as i32);
            // let the child reach its next system call return
            u.sleep(5);
            let stopped_at = progress.load(Ordering::SeqCst);
            u.sleep(10);
            let still = progress.load(Ordering::SeqCst);

            u.kill(pid, SIGCONT as i32);
            let resumed = spin_ticks(u, 5000, || progress.load(Ordering::SeqCst) > still);

            u.kill(pid, SIGKILL as i32);
            let status = u.wait_status();
            tx.send(StopReport {
                started,
                stopped_at,
                still,
                resumed,
                status,
            })
            .unwrap();
            u.reap_forever()
        })
    };
    m.boot(init).unwrap();

    let report = recv(&rx);
    assert!(report.started, "{:?}", report);
    assert_eq!(report.stopped_at, report.still, "{:?}", report);
    assert!(report.resumed, "{:?}", report);
    assert_eq!(report.status.map(|(_, s)| s), Some(-1));
}

#[test]
fn stopped_process_dies_on_sigkill() {
    let m = machine(2);
    let (tx, rx) = mpsc::channel();
    let child = m.program(|u, _| loop {
        u.getpid();
    });
    let init = m.program(move |u, _| {
        let pid = u.fork(child);
        u.kill(pid, SIGSTOP as i32);
        u.sleep(3);
        u.kill(pid, SIGKILL as i32);
        tx.send((pid, u.wait_status())).unwrap();
        u.reap_forever()
    });
    m.boot(init).unwrap();

    let (pid, status) = recv(&rx);
    assert_eq!(status, Some((pid, -1)));
}

#[test]
fn only_the_interrupted_thread_can_sigret() {
    let m = machine(2);
    let (otx, orx) = mpsc::channel();
    let (tx, rx) = mpsc::channel();

    let sibling = m.program(move |u, _| {
        u.set_regs(|tf| tf.s2 = 0x2222);
        let r = u.sigret();
        otx.send((r, u.regs().s2)).unwrap();
    });
    let handler = m.program(move |u, _| {
        let tid = u.spawn(sibling);
        u.join(tid);
    });
    let init = m.program(move |u, _| {
        assert!(u.signal(SIGUSR, handler, 0));
        let me = u.getpid();
        let sent = u.kill(me, SIGUSR);
        // the handler already returned through the trampoline
        let outside = u.sigret();
        tx.send((sent, outside)).unwrap();
        u.reap_forever()
    });
    m.boot(init).unwrap();

    // the sibling's registers were left alone
    assert_eq!(recv(&orx), (-1, 0x2222));
    assert_eq!(recv(&rx), (0, -1));
}
