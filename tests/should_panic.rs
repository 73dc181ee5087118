// Lock discipline violations halt the kernel
use std::panic;
use std::process;
use std::time::Duration;

use smpkern::arch::hosted::Cores;
use smpkern::spinlock::Spinlock;

fn main() {
    panic::set_hook(Box::new(|_| {
        println!("[ok]");
        process::exit(0);
    }));

    should_fail();
    println!("[test did not panic]");
    process::exit(1);
}

fn should_fail() {
    print!("should_panic::should_fail...\t");
    let cores = Cores::new(1, Duration::from_millis(1));
    cores.enter(0);
    let lock = Spinlock::new(0u32, "proc");
    let _held = lock.lock();
    // acquiring a lock this core already holds
    let _again = lock.lock();
}
