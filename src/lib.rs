//! Timewarp - run programs under a virtual clock
//!
//! Target programs run under ptrace. Whenever every traced process is blocked
//! in a timing-related syscall and the kernel confirms that nothing is still in
//! flight, the virtual clock is advanced to the nearest deadline and only that
//! process is woken. Programs that mostly wait on timers finish in a fraction
//! of real time, with the ordering of their deadlines preserved.

pub mod arch;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod host;
pub mod liveness;
pub mod reactor;
pub mod registry;
pub mod scheduler;
pub mod shim;
pub mod signals;
pub mod syscalls;
pub mod timeout;
pub mod tracer;

pub use config::Options;
pub use error::{Result, TimewarpError};
pub use scheduler::VirtualClockScheduler;
