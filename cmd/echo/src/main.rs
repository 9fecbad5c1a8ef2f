//! Fiber-per-connection TCP echo server
//!
//! Every accepted connection gets its own fiber doing plain blocking-style
//! reads and writes; the hook layer parks it on EAGAIN. A recurring timer
//! prints connection stats every 5 seconds.
//!
//! Usage:
//!     ./target/release/echo [port] [threads]
//!
//! Test with:
//!     nc 127.0.0.1 9998

use fibrio::{kdebug, kerror, kinfo, Runtime, SchedulerConfig, TcpListener, TcpStream};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

const STATS_INTERVAL_MS: u64 = 5_000;

#[derive(Default)]
struct Stats {
    accepts: AtomicU64,
    bytes: AtomicU64,
    active: AtomicU64,
    errors: AtomicU64,
}

fn handle_client(mut stream: TcpStream, stats: Arc<Stats>) {
    stats.active.fetch_add(1, Ordering::Relaxed);
    if let Err(e) = stream.set_nodelay(true) {
        kerror!("set_nodelay: {}", e);
    }

    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if stream.write_all(&buf[..n]).is_err() {
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                stats.bytes.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(_) => {
                stats.errors.fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    stats.active.fetch_sub(1, Ordering::Relaxed);
}

fn accept_loop(listener: TcpListener, stats: Arc<Stats>) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                stats.accepts.fetch_add(1, Ordering::Relaxed);
                kdebug!("accepted {}", peer);
                let s = Arc::clone(&stats);
                if let Err(e) = fibrio::spawn(move || handle_client(stream, s)) {
                    kerror!("spawn: {}", e);
                    return;
                }
            }
            Err(e) => {
                kerror!("accept: {}", e);
                stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9998);
    let threads: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(4);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let config = SchedulerConfig::from_env().threads(threads).use_caller(true).name("echo");

    let rt = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("echo: runtime: {}", e);
            std::process::exit(1);
        }
    };

    let stats = Arc::new(Stats::default());
    let start = Instant::now();

    let s = Arc::clone(&stats);
    rt.io_manager().add_timer(
        STATS_INTERVAL_MS,
        move || {
            kinfo!(
                "[{:.1}s] active={} accepts={} bytes={} err={}",
                start.elapsed().as_secs_f64(),
                s.active.load(Ordering::Relaxed),
                s.accepts.load(Ordering::Relaxed),
                s.bytes.load(Ordering::Relaxed),
                s.errors.load(Ordering::Relaxed),
            );
        },
        true,
    );

    let s = Arc::clone(&stats);
    rt.spawn(move || {
        // Bind inside a fiber so the listener is tracked by the hook layer
        let listener = match TcpListener::bind(addr) {
            Ok(l) => l,
            Err(e) => {
                kerror!("bind {}: {}", addr, e);
                std::process::exit(1);
            }
        };
        kinfo!("listening on {} with {} thread(s)", addr, threads);
        accept_loop(listener, s);
    });

    // The main thread joins the workers here and serves until killed
    drop(rt);
}
