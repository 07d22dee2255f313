//! Host process setup

use nix::errno::Errno;
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use tracing::debug;

use crate::error::{OsContext, Result};

/// Pin the calling process to the CPU it currently runs on
///
/// Children inherit the mask, so the tool and every target share one CPU.
pub fn pin_cpu() -> Result<usize> {
    // SAFETY: sched_getcpu takes no arguments.
    let cpu = Errno::result(unsafe { libc::sched_getcpu() }).os("sched_getcpu")? as usize;

    let mut set = CpuSet::new();
    set.set(cpu).os("CPU_SET")?;
    sched_setaffinity(Pid::from_raw(0), &set).os("sched_setaffinity")?;
    debug!(cpu, "pinned to CPU");
    Ok(cpu)
}
