//! Nanosecond arithmetic for the virtual clock
//!
//! All virtual time is kept as signed 128-bit nanoseconds so that the sum of a
//! real clock reading, the accumulated drift and a user-supplied timeout can
//! never overflow. Tracee structures (`timespec`, `timeval`) are handled as two
//! native machine words, which is their layout on every supported target.

use libc::c_long;
use nix::time::{clock_gettime, ClockId};

use crate::error::{OsContext, Result};

/// Signed nanoseconds on the virtual timeline
pub type Nanos = i128;

pub const NSEC_PER_SEC: Nanos = 1_000_000_000;
pub const NSEC_PER_MSEC: Nanos = 1_000_000;
pub const NSEC_PER_USEC: Nanos = 1_000;

/// Read the host's real-time clock
pub fn realtime_now() -> Result<Nanos> {
    let ts = clock_gettime(ClockId::CLOCK_REALTIME).os("clock_gettime(CLOCK_REALTIME)")?;
    Ok(ts.tv_sec() as Nanos * NSEC_PER_SEC + ts.tv_nsec() as Nanos)
}

/// `struct timespec` as read from a tracee: `[tv_sec, tv_nsec]`
pub fn timespec_to_nanos(words: [c_long; 2]) -> Nanos {
    words[0] as Nanos * NSEC_PER_SEC + words[1] as Nanos
}

/// `struct timeval` as read from a tracee: `[tv_sec, tv_usec]`
pub fn timeval_to_nanos(words: [c_long; 2]) -> Nanos {
    words[0] as Nanos * NSEC_PER_SEC + words[1] as Nanos * NSEC_PER_USEC
}

pub fn msec_to_nanos(msec: i64) -> Nanos {
    msec as Nanos * NSEC_PER_MSEC
}

/// Encode nanoseconds as a tracee `struct timespec`
pub fn nanos_to_timespec(ns: Nanos) -> [c_long; 2] {
    let ns = ns.max(0);
    [(ns / NSEC_PER_SEC) as c_long, (ns % NSEC_PER_SEC) as c_long]
}

/// Seconds with millisecond precision, for log lines
pub fn as_secs_f64(ns: Nanos) -> f64 {
    ns as f64 / NSEC_PER_SEC as f64
}
