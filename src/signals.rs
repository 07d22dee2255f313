//! Signal names and raw signal delivery
//!
//! Signals are carried as plain numbers throughout the tracer because tracees
//! may use realtime signals, which `nix::sys::signal::Signal` cannot represent.

use std::str::FromStr;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// Parse a signal given as a number, `SIGNAME`, `NAME`, `SIGRTMIN+N` or `RTMIN+N`
///
/// # Example
/// ```
/// use timewarp::signals::parse_signal;
/// assert_eq!(parse_signal("SIGURG"), Some(libc::SIGURG));
/// assert_eq!(parse_signal("usr1"), Some(libc::SIGUSR1));
/// assert_eq!(parse_signal("15"), Some(libc::SIGTERM));
/// ```
pub fn parse_signal(s: &str) -> Option<i32> {
    let s = s.trim();
    let rtmax = libc::SIGRTMAX();

    if let Ok(signo) = s.parse::<i32>() {
        return (signo > 0 && signo < rtmax).then_some(signo);
    }

    let upper = s.to_ascii_uppercase();
    let bare = upper.strip_prefix("SIG").unwrap_or(&upper);

    if let Some(offset) = bare.strip_prefix("RTMIN+") {
        let signo = libc::SIGRTMIN().checked_add(offset.parse::<i32>().ok()?)?;
        return (signo > 0 && signo < rtmax).then_some(signo);
    }

    let alias = match bare {
        "IOT" => Some(libc::SIGIOT),
        "CLD" => Some(libc::SIGCHLD),
        "POLL" => Some(libc::SIGPOLL),
        _ => None,
    };
    alias.or_else(|| {
        Signal::from_str(&format!("SIG{}", bare))
            .ok()
            .map(|sig| sig as i32)
    })
}

/// Printable name of a signal number
pub fn signal_name(signo: i32) -> String {
    match Signal::try_from(signo) {
        Ok(sig) => sig.as_str().to_string(),
        Err(_) if signo >= libc::SIGRTMIN() => format!("SIGRTMIN+{}", signo - libc::SIGRTMIN()),
        Err(_) => format!("signal {}", signo),
    }
}

/// Send a process-directed signal
pub fn kill(pid: Pid, signo: i32) -> nix::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    Errno::result(unsafe { libc::kill(pid.as_raw(), signo) }).map(drop)
}

/// Send a signal to exactly one thread
pub fn tkill(tid: Pid, signo: i32) -> nix::Result<()> {
    // SAFETY: tkill(2) takes two integers and touches no memory.
    Errno::result(unsafe { libc::syscall(libc::SYS_tkill, tid.as_raw(), signo) }).map(drop)
}
