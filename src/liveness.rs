//! Scheduling-state source for traced processes
//!
//! The kernel reports a task's state as the first field after the command
//! name in `/proc/<pid>/stat`. A task blocked in a syscall that waits for an
//! event sleeps interruptibly (`S`); anything else means the kernel still has
//! work in flight for it.

use std::fs::File;
use std::os::unix::fs::FileExt;

use nix::unistd::Pid;
use tracing::debug;

/// State letter of an interruptible sleep
pub const INTERRUPTIBLE_SLEEP: char = 'S';

/// Open handle on a process's `stat` file
#[derive(Debug)]
pub struct LivenessSource {
    pid: Pid,
    stat: Option<File>,
}

impl LivenessSource {
    pub fn open(pid: Pid) -> Self {
        let stat = match File::open(format!("/proc/{}/stat", pid)) {
            Ok(file) => Some(file),
            Err(e) => {
                debug!(%pid, error = %e, "cannot open stat file");
                None
            }
        };
        Self { pid, stat }
    }

    /// Current state letter, `None` if it cannot be read
    pub fn state(&self) -> Option<char> {
        let stat = self.stat.as_ref()?;
        let mut buf = [0u8; 512];
        let n = match stat.read_at(&mut buf, 0) {
            Ok(n) => n,
            Err(e) => {
                debug!(pid = %self.pid, error = %e, "cannot read stat file");
                return None;
            }
        };
        parse_state(&String::from_utf8_lossy(&buf[..n]))
    }

    /// An unreadable state counts as not quiescent
    pub fn is_quiescent(&self) -> bool {
        self.state() == Some(INTERRUPTIBLE_SLEEP)
    }
}

/// Extract the state letter from a `stat` line
///
/// The command name is parenthesised and may itself contain spaces and
/// parentheses, so parsing starts after the last `)`.
pub fn parse_state(stat: &str) -> Option<char> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.trim_start().chars().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_state_simple() {
        assert_eq!(parse_state("1234 (sleep) S 1 1234 1234 0"), Some('S'));
        assert_eq!(parse_state("1 (init) R 0"), Some('R'));
    }

    #[test]
    fn test_parse_state_tricky_command_name() {
        assert_eq!(parse_state("77 (a) b (c)) D 1 2"), Some('D'));
        assert_eq!(parse_state("77 (with space) t 1"), Some('t'));
    }

    #[test]
    fn test_parse_state_garbage() {
        assert_eq!(parse_state(""), None);
        assert_eq!(parse_state("no parens here"), None);
        assert_eq!(parse_state("1 (x)"), None);
    }

    #[test]
    fn test_own_thread_is_running() {
        // The harness's main thread sleeps while tests run, so read this thread.
        let source = LivenessSource::open(nix::unistd::gettid());
        assert_eq!(source.state(), Some('R'));
        assert!(!source.is_quiescent());
    }

    #[test]
    fn test_missing_process_has_no_state() {
        let source = LivenessSource::open(Pid::from_raw(i32::MAX));
        assert_eq!(source.state(), None);
        assert!(!source.is_quiescent());
    }
}
