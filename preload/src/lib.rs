//! Time interception library for timewarp targets
//!
//! Loaded through `LD_PRELOAD` into every traced program. The C library would
//! answer clock reads from the vDSO without entering the kernel, which the
//! tracer cannot see. Every clock read here becomes a genuine
//! `clock_gettime(CLOCK_REALTIME)` system call, and every sleep a genuine
//! relative `nanosleep`, so the tracer can forge and fast-forward both.
//!
//! Not intercepted: alarm(2), setitimer(2), timer_create(2), timerfd(2).

use libc::{c_int, c_long, c_short, c_ushort, c_void, clockid_t, time_t, timespec, timeval};

const NSEC_PER_SEC: i128 = 1_000_000_000;

/// `struct timeb` from `<sys/timeb.h>`
#[repr(C)]
pub struct Timeb {
    pub time: time_t,
    pub millitm: c_ushort,
    pub timezone: c_short,
    pub dstflag: c_short,
}

fn errno() -> c_int {
    // SAFETY: __errno_location always returns the calling thread's errno slot.
    unsafe { *libc::__errno_location() }
}

fn set_errno(value: c_int) {
    // SAFETY: as above.
    unsafe { *libc::__errno_location() = value }
}

fn zero_timespec() -> timespec {
    timespec {
        tv_sec: 0,
        tv_nsec: 0,
    }
}

fn to_nanos(ts: &timespec) -> i128 {
    ts.tv_sec as i128 * NSEC_PER_SEC + ts.tv_nsec as i128
}

fn from_nanos(ns: i128) -> timespec {
    let ns = ns.max(0);
    timespec {
        tv_sec: (ns / NSEC_PER_SEC) as time_t,
        tv_nsec: (ns % NSEC_PER_SEC) as c_long,
    }
}

/// Real-time clock read that always enters the kernel
fn realtime(ts: &mut timespec) -> c_long {
    // SAFETY: `ts` is a valid, writable timespec.
    unsafe {
        libc::syscall(
            libc::SYS_clock_gettime,
            libc::CLOCK_REALTIME,
            ts as *mut timespec,
        )
    }
}

/// How long to sleep for a request issued at `now`
fn sleep_interval(now: i128, request: i128, absolute: bool) -> (i128, i128) {
    if absolute {
        (request, (request - now).max(0))
    } else {
        (now + request, request)
    }
}

/// The clock id is ignored: every clock reads the (forged) real-time clock.
#[no_mangle]
pub unsafe extern "C" fn clock_gettime(_clock_id: clockid_t, tp: *mut timespec) -> c_int {
    libc::syscall(libc::SYS_clock_gettime, libc::CLOCK_REALTIME, tp) as c_int
}

#[no_mangle]
pub unsafe extern "C" fn gettimeofday(tv: *mut timeval, tz: *mut c_void) -> c_int {
    if let Some(tv) = tv.as_mut() {
        let mut ts = zero_timespec();
        if realtime(&mut ts) != 0 {
            return -1;
        }
        tv.tv_sec = ts.tv_sec;
        tv.tv_usec = (ts.tv_nsec / 1000) as libc::suseconds_t;
    }
    if !tz.is_null() {
        // struct timezone { int tz_minuteswest; int tz_dsttime; }
        let tz = tz as *mut [c_int; 2];
        *tz = [0, 0];
    }
    0
}

#[no_mangle]
pub unsafe extern "C" fn time(t: *mut time_t) -> time_t {
    let mut ts = zero_timespec();
    if realtime(&mut ts) != 0 {
        return -1;
    }
    if let Some(t) = t.as_mut() {
        *t = ts.tv_sec;
    }
    ts.tv_sec
}

#[no_mangle]
pub unsafe extern "C" fn ftime(tp: *mut Timeb) -> c_int {
    if let Some(tp) = tp.as_mut() {
        let mut ts = zero_timespec();
        if realtime(&mut ts) != 0 {
            return -1;
        }
        tp.time = ts.tv_sec;
        tp.millitm = (ts.tv_nsec / 1_000_000) as c_ushort;
        tp.timezone = 0;
        tp.dstflag = 0;
    }
    0
}

#[no_mangle]
pub unsafe extern "C" fn nanosleep(req: *const timespec, rem: *mut timespec) -> c_int {
    match clock_nanosleep(libc::CLOCK_REALTIME, 0, req, rem) {
        0 => 0,
        err => {
            set_errno(err);
            -1
        }
    }
}

/// Returns an error number rather than setting errno, like the C library's.
#[no_mangle]
pub unsafe extern "C" fn clock_nanosleep(
    _clock_id: clockid_t,
    flags: c_int,
    request: *const timespec,
    remain: *mut timespec,
) -> c_int {
    let Some(request) = request.as_ref() else {
        return libc::EFAULT;
    };
    let mut now = zero_timespec();
    if realtime(&mut now) != 0 {
        return errno();
    }
    let absolute = flags & libc::TIMER_ABSTIME != 0;
    let (end, interval) = sleep_interval(to_nanos(&now), to_nanos(request), absolute);

    let relative = from_nanos(interval);
    let r = libc::syscall(
        libc::SYS_nanosleep,
        &relative as *const timespec,
        std::ptr::null_mut::<timespec>(),
    );
    if r != 0 {
        return errno();
    }

    if let Some(remain) = remain.as_mut() {
        let mut after = zero_timespec();
        realtime(&mut after);
        *remain = from_nanos(end - to_nanos(&after));
    }
    0
}
