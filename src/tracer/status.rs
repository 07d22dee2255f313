//! Classification of raw wait statuses
//!
//! Statuses are kept raw (`int` as returned by `waitpid`) because a status may
//! have to be parked before its process is known, and because `nix`'s decoded
//! `WaitStatus` cannot represent stops on realtime signals.

use nix::unistd::Pid;

/// One reaped status change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitReport {
    pub pid: Pid,
    pub status: i32,
}

/// How a traced process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Normal exit with a status code
    Normal(i32),
    /// Killed by a signal
    Signal(i32),
}

impl ExitKind {
    /// Shell-style exit code: the status, or 128 + signal number
    pub fn exit_code(self) -> i32 {
        match self {
            ExitKind::Normal(code) => code,
            ExitKind::Signal(signo) => 128 + signo,
        }
    }
}

/// Meaning of a wait status for an initialised tracee
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// Syscall entry or exit (SIGTRAP | 0x80, requires TRACESYSGOOD)
    Syscall,
    /// fork, vfork or clone event; the new pid is in the event message
    NewProcess,
    /// execve completed, the address space was replaced
    Exec,
    /// About to exit; the final status follows separately
    Exiting,
    /// Plain signal-delivery stop
    Signal(i32),
    /// A ptrace event we never asked for
    UnknownEvent(i32),
    /// The process is gone
    Exited(ExitKind),
    /// Anything else (e.g. continued)
    Unknown,
}

const SYSCALL_TRAP: i32 = libc::SIGTRAP | 0x80;

pub fn classify(status: i32) -> StopKind {
    if libc::WIFEXITED(status) {
        return StopKind::Exited(ExitKind::Normal(libc::WEXITSTATUS(status)));
    }
    if libc::WIFSIGNALED(status) {
        return StopKind::Exited(ExitKind::Signal(libc::WTERMSIG(status)));
    }
    if !libc::WIFSTOPPED(status) {
        return StopKind::Unknown;
    }

    // WSTOPSIG() cuts off the ptrace event bits.
    let signal = (status >> 8) & 0xffff;
    let event = signal >> 8;
    match event {
        0 if signal == SYSCALL_TRAP => StopKind::Syscall,
        0 => StopKind::Signal(signal),
        libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK | libc::PTRACE_EVENT_CLONE => {
            StopKind::NewProcess
        }
        libc::PTRACE_EVENT_EXEC => StopKind::Exec,
        libc::PTRACE_EVENT_EXIT => StopKind::Exiting,
        other => StopKind::UnknownEvent(other),
    }
}

/// First status of a freshly traced process must be a SIGSTOP stop
pub fn is_initial_stop(status: i32) -> bool {
    libc::WIFSTOPPED(status) && libc::WSTOPSIG(status) == libc::SIGSTOP
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stopped(signal: i32) -> i32 {
        (signal << 8) | 0x7f
    }

    fn event(ev: i32) -> i32 {
        stopped(libc::SIGTRAP | (ev << 8))
    }

    #[test]
    fn test_classify_syscall_stop() {
        assert_eq!(classify(stopped(libc::SIGTRAP | 0x80)), StopKind::Syscall);
    }

    #[test]
    fn test_classify_fork_events() {
        assert_eq!(classify(event(libc::PTRACE_EVENT_FORK)), StopKind::NewProcess);
        assert_eq!(classify(event(libc::PTRACE_EVENT_VFORK)), StopKind::NewProcess);
        assert_eq!(classify(event(libc::PTRACE_EVENT_CLONE)), StopKind::NewProcess);
    }

    #[test]
    fn test_classify_exec_and_exit_events() {
        assert_eq!(classify(event(libc::PTRACE_EVENT_EXEC)), StopKind::Exec);
        assert_eq!(classify(event(libc::PTRACE_EVENT_EXIT)), StopKind::Exiting);
        assert_eq!(
            classify(event(libc::PTRACE_EVENT_VFORK_DONE)),
            StopKind::UnknownEvent(libc::PTRACE_EVENT_VFORK_DONE)
        );
    }

    #[test]
    fn test_classify_plain_signals() {
        assert_eq!(classify(stopped(libc::SIGURG)), StopKind::Signal(libc::SIGURG));
        assert_eq!(classify(stopped(libc::SIGTRAP)), StopKind::Signal(libc::SIGTRAP));
        let rt = libc::SIGRTMIN() + 2;
        assert_eq!(classify(stopped(rt)), StopKind::Signal(rt));
    }

    #[test]
    fn test_classify_exits() {
        assert_eq!(classify(42 << 8), StopKind::Exited(ExitKind::Normal(42)));
        assert_eq!(
            classify(libc::SIGKILL),
            StopKind::Exited(ExitKind::Signal(libc::SIGKILL))
        );
        assert_eq!(classify(0xffff), StopKind::Unknown);
    }

    #[test]
    fn test_initial_stop() {
        assert!(is_initial_stop(stopped(libc::SIGSTOP)));
        assert!(!is_initial_stop(stopped(libc::SIGTRAP)));
        assert!(!is_initial_stop(0));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitKind::Normal(3).exit_code(), 3);
        assert_eq!(ExitKind::Signal(libc::SIGTERM).exit_code(), 143);
    }
}
