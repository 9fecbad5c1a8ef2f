//! Basic fibrio example
//!
//! Spawns fibers that yield, sleep and nest, plus a one-shot and a
//! recurring timer, on an IOManager whose workers include the main thread.
//!
//! # Environment Variables
//!
//! - `FIBRIO_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)
//! - `FIBRIO_THREADS=4` - Worker count, the main thread included
//!
//! FIBRIO_LOG_LEVEL=debug cargo run -p fibrio-basic

use fibrio::{current_fiber_id, sleep_ms, spawn, thread_id, yield_now, Runtime, SchedulerConfig};
use fibrio::{kdebug, kinfo, kwarn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn main() {
    println!("=== fibrio Basic Example ===\n");

    fibrio::init_logging();

    let config = SchedulerConfig::from_env().use_caller(true).name("basic");
    config.print();

    let rt = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let completed = Arc::new(AtomicUsize::new(0));

    kinfo!("Spawning fibers...");
    for i in 1..=3 {
        let c = completed.clone();
        rt.spawn(move || {
            kdebug!("[fiber {}] started id={} tid={}", i, current_fiber_id(), thread_id());
            for j in 0..3 {
                kdebug!("[fiber {}] iteration {}", i, j);
                yield_now();
            }
            c.fetch_add(1, Ordering::SeqCst);
        });
    }

    // Hooked sleep parks the fiber; the worker keeps serving others
    let c = completed.clone();
    rt.spawn(move || {
        let c2 = c.clone();
        if let Err(e) = spawn(move || {
            sleep_ms(50);
            kinfo!("[sleeper] nested fiber woke after 50ms");
            c2.fetch_add(1, Ordering::SeqCst);
        }) {
            kwarn!("nested spawn failed: {}", e);
        }
        sleep_ms(100);
        kinfo!("[sleeper] woke after 100ms");
        c.fetch_add(1, Ordering::SeqCst);
    });

    let iom = rt.io_manager().clone();
    iom.add_timer(30, || kinfo!("[timer] one-shot fired"), false);

    let ticks = Arc::new(AtomicUsize::new(0));
    let t = ticks.clone();
    let recurring = iom.add_timer(
        20,
        move || {
            let n = t.fetch_add(1, Ordering::SeqCst) + 1;
            kdebug!("[timer] tick {}", n);
        },
        true,
    );
    rt.spawn(move || {
        sleep_ms(110);
        recurring.cancel();
        kinfo!("[timer] recurring cancelled");
    });

    println!("{}", iom);

    // Stopping runs the caller's share of the work and waits for the rest
    drop(rt);

    println!(
        "\n{} fiber(s) completed, {} timer tick(s)",
        completed.load(Ordering::SeqCst),
        ticks.load(Ordering::SeqCst)
    );
    println!("\n=== Example Complete ===");
}
