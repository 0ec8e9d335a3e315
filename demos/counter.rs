//! Demo target for rwatch.
//!
//! Stores 0, 1, ..., N-1 into `WATCHED`, reading each value back, and
//! sleeps briefly every 4096 iterations. N is the first argument
//! (default 2000).
//!
//! ```text
//! rwatch --var WATCHED --exec target/debug/rwatch-counter -- 100
//! ```

use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;
use std::time::Duration;

#[no_mangle]
pub static WATCHED: AtomicI32 = AtomicI32::new(0);

fn main() {
    let iterations: i32 = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(2000);

    println!("counter: start ({} iterations)", iterations);
    for i in 0..iterations {
        WATCHED.store(i, Ordering::Relaxed);
        std::hint::black_box(WATCHED.load(Ordering::Relaxed));
        if i & 0xFFF == 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }
    println!("counter: done, WATCHED = {}", WATCHED.load(Ordering::Relaxed));
}
