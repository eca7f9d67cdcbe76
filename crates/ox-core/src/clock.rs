//! Guest clock
//!
//! The console runs its timebase at 50 MHz. Guest time is derived from
//! host time scaled by a configurable scalar, starting at the system time
//! base captured during setup.

use parking_lot::RwLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Guest timebase frequency (50 MHz)
pub const GUEST_TICK_FREQUENCY: u64 = 50_000_000;

/// 100ns intervals between 1601-01-01 and 1970-01-01
const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;

struct ClockState {
    tick_frequency: u64,
    system_time_base: u64,
    time_scalar: f64,
    host_start: Instant,
}

static CLOCK: RwLock<Option<ClockState>> = parking_lot::const_rwlock(None);

/// Current host system time as a FILETIME (100ns units since 1601)
pub fn query_host_system_time() -> u64 {
    let since_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() / 100)
        .unwrap_or(0) as u64;
    FILETIME_UNIX_EPOCH + since_unix
}

/// Configure the guest clock. Called once during emulator setup.
pub fn setup(tick_frequency: u64, system_time_base: u64, time_scalar: f64) {
    let scalar = if time_scalar > 0.0 { time_scalar } else { 1.0 };
    *CLOCK.write() = Some(ClockState {
        tick_frequency,
        system_time_base,
        time_scalar: scalar,
        host_start: Instant::now(),
    });
    tracing::debug!(
        "Guest clock: {} Hz, base {:#x}, scalar {}",
        tick_frequency,
        system_time_base,
        scalar
    );
}

/// Adjust the time scalar without resetting the time base
pub fn set_time_scalar(time_scalar: f64) {
    if let Some(state) = CLOCK.write().as_mut() {
        if time_scalar > 0.0 {
            state.time_scalar = time_scalar;
        }
    }
}

/// Guest tick frequency, defaulting to the console value before setup
pub fn guest_tick_frequency() -> u64 {
    CLOCK
        .read()
        .as_ref()
        .map(|s| s.tick_frequency)
        .unwrap_or(GUEST_TICK_FREQUENCY)
}

/// Guest ticks elapsed since setup
pub fn query_guest_tick_count() -> u64 {
    match CLOCK.read().as_ref() {
        Some(state) => {
            let elapsed = state.host_start.elapsed().as_secs_f64() * state.time_scalar;
            (elapsed * state.tick_frequency as f64) as u64
        }
        None => 0,
    }
}

/// Guest system time (FILETIME units)
pub fn query_guest_system_time() -> u64 {
    match CLOCK.read().as_ref() {
        Some(state) => {
            let elapsed = state.host_start.elapsed().as_secs_f64() * state.time_scalar;
            state.system_time_base + (elapsed * 10_000_000.0) as u64
        }
        None => query_host_system_time(),
    }
}
