//! Error types for the tracer, the registry and the scheduler
//!
//! Three tiers: configuration errors and unexpected OS-call failures are fatal
//! and map to an exit code; recoverable conditions never become errors (they
//! are logged and handled in place).

use nix::errno::Errno;
use nix::unistd::Pid;
use thiserror::Error;

/// Exit code used when an internal OS call fails
pub const EXIT_OS_FAILURE: i32 = 127;

/// Exit code for usage and configuration errors
pub const EXIT_FAILURE: i32 = 1;

/// Errors raised by the time-dilation engine
#[derive(Error, Debug)]
pub enum TimewarpError {
    #[error("{call} failed: {source}")]
    Os {
        call: &'static str,
        #[source]
        source: Errno,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal invariant violated: {0}")]
    Invariant(String),

    #[error("unaligned memory access at {addr:#x} ({len} bytes)")]
    Unaligned { addr: u64, len: usize },

    #[error("pid {pid}: clock_gettime() on unsupported clock id {clock_id}")]
    UnsupportedClock { pid: Pid, clock_id: i64 },

    #[error("pid {pid} in a wrong state: first status {status:#x} is not a SIGSTOP stop")]
    UnexpectedInitialStop { pid: Pid, status: i32 },

    #[error("{0}")]
    Config(String),
}

impl TimewarpError {
    /// Build an OS error for a named call from an errno value
    pub fn os(call: &'static str, source: Errno) -> Self {
        Self::Os { call, source }
    }

    /// Process exit code this error should terminate the tool with
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Os { .. } | Self::Io(_) => EXIT_OS_FAILURE,
            _ => EXIT_FAILURE,
        }
    }
}

pub type Result<T> = std::result::Result<T, TimewarpError>;

/// Attach a call name to a `nix::Result`
pub(crate) trait OsContext<T> {
    fn os(self, call: &'static str) -> Result<T>;
}

impl<T> OsContext<T> for nix::Result<T> {
    fn os(self, call: &'static str) -> Result<T> {
        self.map_err(|errno| TimewarpError::os(call, errno))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_errors_use_reserved_exit_code() {
        let err = TimewarpError::os("waitpid", Errno::EINVAL);
        assert_eq!(err.exit_code(), EXIT_OS_FAILURE);
        assert!(err.to_string().contains("waitpid"));
    }

    #[test]
    fn test_config_errors_use_generic_exit_code() {
        let err = TimewarpError::Config("bad option".to_string());
        assert_eq!(err.exit_code(), EXIT_FAILURE);
        assert_eq!(err.to_string(), "bad option");
    }

    #[test]
    fn test_invariant_error_message() {
        let err = TimewarpError::Invariant("child already blocked".to_string());
        assert_eq!(err.exit_code(), EXIT_FAILURE);
        assert!(err.to_string().contains("already blocked"));
    }

    #[test]
    fn test_os_context_wraps_errno() {
        let res: nix::Result<()> = Err(Errno::ESRCH);
        let err = res.os("kill").unwrap_err();
        match err {
            TimewarpError::Os { call, source } => {
                assert_eq!(call, "kill");
                assert_eq!(source, Errno::ESRCH);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
