//! Immutable run options

use std::path::PathBuf;
use std::time::Duration;

use crate::cli::Cli;

/// Real time to let in-flight kernel work settle before trusting quiescence
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(1);

/// Options shared by every component, fixed at startup
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory holding the preload library, when given explicitly
    pub libpath: Option<PathBuf>,
    /// Signal used to interrupt a blocked child
    pub wake_signal: i32,
    /// Idle time required before the clock is advanced
    pub idleness: Duration,
    /// Short wait after everyone blocked
    pub settle: Duration,
    pub verbosity: u8,
    /// Arrange for targets to load the preload library
    pub preload: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            libpath: None,
            wake_signal: libc::SIGURG,
            idleness: Duration::from_millis(50),
            settle: DEFAULT_SETTLE,
            verbosity: 0,
            preload: true,
        }
    }
}

impl From<&Cli> for Options {
    fn from(cli: &Cli) -> Self {
        Self {
            libpath: cli.libpath.clone(),
            wake_signal: cli.signal,
            idleness: cli.idleness,
            settle: DEFAULT_SETTLE,
            verbosity: cli.verbose,
            preload: !cli.no_preload,
        }
    }
}
