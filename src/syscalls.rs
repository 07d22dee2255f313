//! Syscall number to name mapping for diagnostics
//!
//! Covers the timing-related calls the scheduler cares about plus the calls
//! that commonly show up while a process is blocked. Numbers come from `libc`
//! so the table is correct on every supported architecture.

use std::borrow::Cow;

/// Resolve a syscall number to its name
///
/// Returns `None` for numbers outside the table
pub fn lookup(num: i64) -> Option<&'static str> {
    let name = match num as libc::c_long {
        libc::SYS_read => "read",
        libc::SYS_write => "write",
        libc::SYS_close => "close",
        libc::SYS_openat => "openat",
        libc::SYS_readv => "readv",
        libc::SYS_writev => "writev",
        libc::SYS_ioctl => "ioctl",
        libc::SYS_fcntl => "fcntl",
        libc::SYS_wait4 => "wait4",
        libc::SYS_waitid => "waitid",
        libc::SYS_kill => "kill",
        libc::SYS_tkill => "tkill",
        libc::SYS_tgkill => "tgkill",
        libc::SYS_clone => "clone",
        libc::SYS_vfork => "vfork",
        libc::SYS_execve => "execve",
        libc::SYS_exit => "exit",
        libc::SYS_exit_group => "exit_group",
        libc::SYS_prctl => "prctl",
        libc::SYS_futex => "futex",
        libc::SYS_nanosleep => "nanosleep",
        libc::SYS_clock_nanosleep => "clock_nanosleep",
        libc::SYS_clock_gettime => "clock_gettime",
        libc::SYS_gettimeofday => "gettimeofday",
        libc::SYS_poll => "poll",
        libc::SYS_ppoll => "ppoll",
        libc::SYS_pselect6 => "pselect6",
        libc::SYS_epoll_wait => "epoll_wait",
        libc::SYS_epoll_pwait => "epoll_pwait",
        libc::SYS_accept4 => "accept4",
        libc::SYS_connect => "connect",
        libc::SYS_recvfrom => "recvfrom",
        libc::SYS_sendto => "sendto",
        libc::SYS_recvmsg => "recvmsg",
        libc::SYS_sendmsg => "sendmsg",
        libc::SYS_pause => "pause",
        libc::SYS_rt_sigsuspend => "rt_sigsuspend",
        libc::SYS_rt_sigtimedwait => "rt_sigtimedwait",
        libc::SYS_restart_syscall => "restart_syscall",
        #[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
        libc::SYS_select => "select",
        #[cfg(any(target_arch = "x86", target_arch = "arm"))]
        libc::SYS__newselect => "_newselect",
        #[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
        libc::SYS_fork => "fork",
        #[cfg(target_arch = "x86_64")]
        libc::SYS_accept => "accept",
        _ => return None,
    };
    Some(name)
}

/// Resolve a syscall number to a printable name
///
/// Returns `syscall_NNN` when the number is not in the table
pub fn syscall_name(num: i64) -> Cow<'static, str> {
    match lookup(num) {
        Some(name) => Cow::Borrowed(name),
        None => Cow::Owned(format!("syscall_{}", num)),
    }
}
