//! Classification of timeout-bearing syscalls and time forgery
//!
//! On syscall entry the timeout argument of a recognised call is decoded into
//! an absolute virtual deadline. On syscall exit clock reads are rewritten to
//! the virtual timeline. After a forced wake-up the interrupted call's error
//! is turned into a plain timeout.

use libc::c_long;
use tracing::{debug, info, warn};

use crate::arch::SyscallArgs;
use crate::clock::{self, Nanos};
use crate::error::{Result, TimewarpError};
use crate::registry::Deadline;
use crate::syscalls::syscall_name;
use crate::tracer::TracedProcess;

/// Encoding of a syscall's timeout argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// `int` milliseconds, negative waits forever
    Msec,
    /// `struct timeval *`, NULL waits forever
    Timeval,
    /// `struct timespec *`, NULL waits forever
    Timespec,
}

/// Where a tracked syscall keeps its timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutParam {
    pub kind: ParamKind,
    /// Zero-based argument slot
    pub slot: usize,
}

const fn param(kind: ParamKind, slot: usize) -> Option<TimeoutParam> {
    Some(TimeoutParam { kind, slot })
}

/// The fixed table of tracked syscalls
pub fn timeout_param(number: i64) -> Option<TimeoutParam> {
    match number as c_long {
        libc::SYS_epoll_wait | libc::SYS_epoll_pwait => param(ParamKind::Msec, 3),
        #[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
        libc::SYS_select => param(ParamKind::Timeval, 4),
        #[cfg(any(target_arch = "x86", target_arch = "arm"))]
        libc::SYS__newselect => param(ParamKind::Timeval, 4),
        libc::SYS_pselect6 => param(ParamKind::Timespec, 4),
        libc::SYS_poll => param(ParamKind::Msec, 2),
        libc::SYS_ppoll => param(ParamKind::Timespec, 2),
        libc::SYS_nanosleep => param(ParamKind::Timespec, 0),
        libc::SYS_clock_nanosleep => param(ParamKind::Timespec, 2),
        libc::SYS_futex => param(ParamKind::Timespec, 3),
        _ => None,
    }
}

/// Where tracees take their clock readings from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockSource {
    /// The kernel or the vDSO; only real-time readings are forged
    #[default]
    Kernel,
    /// The preload library, which answers every clock id with forged real time
    Preload,
}

/// How the decoded timeout relates to the clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timing {
    Relative,
    /// Absolute time on the (forged) real-time clock
    Absolute,
    Untracked,
}

/// Refine the table entry by the call's flag arguments
///
/// Under the preload library an absolute deadline on any clock was computed
/// from a forged real-time reading, so it lives on the virtual timeline even
/// when the kernel is told it is monotonic.
fn timing(sys: &SyscallArgs, clocks: ClockSource) -> Timing {
    let forged = clocks == ClockSource::Preload;
    match sys.number as c_long {
        libc::SYS_futex => {
            let flags = sys.arg(1) as i32;
            let op = flags & !(libc::FUTEX_PRIVATE_FLAG | libc::FUTEX_CLOCK_REALTIME);
            let realtime = (flags & libc::FUTEX_CLOCK_REALTIME) != 0;
            match op {
                libc::FUTEX_WAIT => Timing::Relative,
                libc::FUTEX_WAIT_BITSET if realtime || forged => Timing::Absolute,
                _ => Timing::Untracked,
            }
        }
        libc::SYS_clock_nanosleep => {
            if (sys.arg(1) as i32 & libc::TIMER_ABSTIME) == 0 {
                Timing::Relative
            } else if forged || sys.arg(0) as i32 == libc::CLOCK_REALTIME {
                Timing::Absolute
            } else {
                Timing::Untracked
            }
        }
        _ => Timing::Relative,
    }
}

/// Syscall-enter: work out when the call will time out on its own
///
/// Returns `None` for calls that are not tracked; the child's deadline then
/// stays [`Deadline::Unknown`].
pub fn on_syscall_enter<H: Copy>(
    process: &mut TracedProcess<H>,
    sys: &mut SyscallArgs,
    time_drift: Nanos,
    clocks: ClockSource,
) -> Result<Option<Deadline>> {
    if sys.number as c_long == libc::SYS_prctl && keep_dumpable(sys) {
        info!(pid = %process.pid(), "pacifying prctl(PR_SET_DUMPABLE, 0)");
        process.set_registers(sys)?;
        return Ok(None);
    }

    let Some(param) = timeout_param(sys.number) else {
        return Ok(None);
    };
    let timing = timing(sys, clocks);
    if timing == Timing::Untracked {
        return Ok(Some(Deadline::Unknown));
    }

    let pid = process.pid();
    let syscall = syscall_name(sys.number);
    let value = sys.arg(param.slot);
    let forever = match param.kind {
        ParamKind::Msec => (value as i32) < 0,
        ParamKind::Timeval | ParamKind::Timespec => value == 0,
    };
    if forever {
        debug!(%pid, %syscall, "blocking forever");
        return Ok(Some(Deadline::Forever));
    }

    let timeout = match param.kind {
        ParamKind::Msec => Some(clock::msec_to_nanos(value as i32 as i64)),
        ParamKind::Timeval => read_pair(process, value)?.map(clock::timeval_to_nanos),
        ParamKind::Timespec => read_pair(process, value)?.map(clock::timespec_to_nanos),
    };
    let Some(ns) = timeout else {
        debug!(%pid, %syscall, "blocking with unreadable timeout");
        return Ok(Some(Deadline::Unknown));
    };

    let deadline = if timing == Timing::Absolute {
        debug!(%pid, %syscall, until = ns, "blocking until absolute time");
        ns
    } else {
        debug!(%pid, %syscall, secs = clock::as_secs_f64(ns), "blocking");
        clock::realtime_now()? + time_drift + ns
    };
    Ok(Some(Deadline::At(deadline)))
}

/// Rewrite `prctl(PR_SET_DUMPABLE, 0)` so the process stays traceable
fn keep_dumpable(sys: &mut SyscallArgs) -> bool {
    if sys.arg(0) == libc::PR_SET_DUMPABLE as i64 && sys.arg(1) == 0 {
        sys.args[1] = 1;
        return true;
    }
    false
}

/// Read a `timespec`/`timeval` pair; `None` if the tracee memory faults
fn read_pair<H: Copy>(process: &TracedProcess<H>, addr: i64) -> Result<Option<[c_long; 2]>> {
    let mut words = [0 as c_long; 2];
    match process.read_memory(&mut words, addr as u64) {
        Ok(0) => Ok(Some(words)),
        Ok(missing) => {
            warn!(pid = %process.pid(), addr = format_args!("{:#x}", addr), missing,
                  "timeout argument not readable");
            Ok(None)
        }
        Err(TimewarpError::Unaligned { .. }) => {
            warn!(pid = %process.pid(), addr = format_args!("{:#x}", addr),
                  "timeout argument not word aligned");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Syscall-exit: shift successful clock reads onto the virtual timeline
pub fn on_syscall_exit<H: Copy>(
    process: &mut TracedProcess<H>,
    sys: &SyscallArgs,
    time_drift: Nanos,
) -> Result<()> {
    if sys.number as c_long != libc::SYS_clock_gettime || sys.ret != 0 {
        return Ok(());
    }
    let clock_id = sys.arg(0) as i32 as i64;
    if clock_id != libc::CLOCK_REALTIME as i64 && clock_id != libc::CLOCK_MONOTONIC as i64 {
        return Err(TimewarpError::UnsupportedClock {
            pid: process.pid(),
            clock_id,
        });
    }

    let forged = clock::realtime_now()? + time_drift;
    let missing = process.write_memory(sys.arg(1) as u64, &clock::nanos_to_timespec(forged))?;
    if missing > 0 {
        warn!(pid = %process.pid(), missing, "clock_gettime() result not writable");
    }
    Ok(())
}

/// Return value an interrupted call should report instead of `ret`
///
/// `None` for calls outside the table: their interruption is left to the
/// usual signal semantics.
pub fn pacified_return(number: i64, ret: i64) -> Option<i64> {
    timeout_param(number)?;
    let eintr = -(libc::EINTR as i64);
    // ERESTARTSYS ..= ERESTART_RESTARTBLOCK
    if ret == eintr || (-517..=-512).contains(&ret) {
        Some(0)
    } else {
        Some(ret)
    }
}

/// After a wake signal: make the aborted call look like it timed out
pub fn pacify<H: Copy>(process: &mut TracedProcess<H>, sys: &mut SyscallArgs) -> Result<()> {
    let Some(ret) = pacified_return(sys.number, sys.ret) else {
        return Ok(());
    };
    debug!(pid = %process.pid(), syscall = %syscall_name(sys.number), kernel = sys.ret,
           forged = ret, "restarting interrupted call");
    sys.ret = ret;
    process.set_registers(sys)
}
