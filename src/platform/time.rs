//! Delays and uptime

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Busy-wait for `usecs` microseconds
pub fn udelay(usecs: u32) {
    let deadline = Instant::now() + Duration::from_micros(u64::from(usecs));
    while Instant::now() < deadline {
        core::hint::spin_loop();
    }
}

/// Busy-wait for `msecs` milliseconds
pub fn mdelay(msecs: u32) {
    for _ in 0..msecs {
        udelay(1000);
    }
}

/// Sleep for `msecs` milliseconds
///
/// May sleep, so it's for process context only.
pub fn msleep(msecs: u32) {
    super::might_sleep();
    std::thread::sleep(Duration::from_millis(u64::from(msecs)));
}

fn boot() -> Instant {
    static BOOT: OnceLock<Instant> = OnceLock::new();
    *BOOT.get_or_init(Instant::now)
}

/// Milliseconds since the platform's first use of time
///
/// Wraps around after about 49 days.
pub fn time_ms() -> u32 {
    boot().elapsed().as_millis() as u32
}
