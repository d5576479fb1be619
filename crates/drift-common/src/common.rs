// common.rs -- console output and the monotonic clock
//
// Every process (lobby server, host, client) logs through con_printf with a
// short bracketed prefix. con_dprintf only prints in developer mode, which
// the binary enables from the command line.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

static DEVELOPER: AtomicBool = AtomicBool::new(false);

/// General-purpose print function.
pub fn con_printf(msg: &str) {
    print!("{}", msg);
}

/// Developer-only print. Silent unless developer mode is active.
pub fn con_dprintf(msg: &str) {
    if !developer() {
        return;
    }
    print!("{}", msg);
}

pub fn set_developer(on: bool) {
    DEVELOPER.store(on, Ordering::Relaxed);
}

pub fn developer() -> bool {
    DEVELOPER.load(Ordering::Relaxed)
}

/// Milliseconds since a process-local epoch. Monotonic; never wall clock.
/// All TTL and timeout comparisons in the repo go through this.
pub fn sys_milliseconds() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as u64
}
