//! Per-process tracing state and tracee memory access

use std::fs::File;
use std::io::ErrorKind;
use std::mem::size_of;
use std::os::unix::fs::FileExt;

use libc::c_long;
use nix::errno::Errno;
use nix::sys::ptrace::{self, AddressType};
use nix::unistd::Pid;
use tracing::debug;

use crate::arch::{self, Registers, SyscallArgs};
use crate::error::{OsContext, Result, TimewarpError};

/// Size of one tracee machine word
pub const WORD: usize = size_of::<c_long>();

/// One OS process (or thread) under tracing
///
/// `H` is the handler token: it names which role handles this process's
/// events and carries that role's context.
#[derive(Debug)]
pub struct TracedProcess<H> {
    pid: Pid,
    pub(crate) initialized: bool,
    pub(crate) within_syscall: bool,
    mem: Option<File>,
    pub(crate) regs: Option<Registers>,
    handler: H,
}

fn open_mem(pid: Pid) -> Option<File> {
    match File::open(format!("/proc/{}/mem", pid)) {
        Ok(file) => Some(file),
        Err(e) => {
            debug!(%pid, error = %e, "no direct memory handle, falling back to PTRACE_PEEKDATA");
            None
        }
    }
}

fn check_aligned(addr: u64, len: usize) -> Result<()> {
    if addr % WORD as u64 != 0 || len % WORD != 0 {
        return Err(TimewarpError::Unaligned { addr, len });
    }
    Ok(())
}

fn is_fault(errno: Errno) -> bool {
    matches!(errno, Errno::EIO | Errno::EFAULT)
}

impl<H: Copy> TracedProcess<H> {
    pub(crate) fn new(pid: Pid, handler: H) -> Self {
        Self {
            pid,
            initialized: false,
            within_syscall: false,
            mem: open_mem(pid),
            regs: None,
            handler,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn handler(&self) -> H {
        self.handler
    }

    /// Rebind the role that handles this process's subsequent events
    pub fn set_handler(&mut self, handler: H) {
        self.handler = handler;
    }

    /// True between a syscall-enter-stop and its syscall-exit-stop
    pub fn within_syscall(&self) -> bool {
        self.within_syscall
    }

    /// `/proc/<pid>/mem` is stale after exec and must be reopened
    pub(crate) fn reopen_memory(&mut self) {
        self.mem = open_mem(self.pid);
    }

    /// Push a decoded (possibly modified) syscall back into the registers
    ///
    /// Only valid while the process is stopped at a syscall boundary.
    pub fn set_registers(&mut self, sys: &SyscallArgs) -> Result<()> {
        let mut regs = self.regs.ok_or_else(|| {
            TimewarpError::Invariant(format!(
                "pid {} is not stopped at a syscall boundary",
                self.pid
            ))
        })?;
        sys.apply_to(&mut regs);
        arch::set_registers(self.pid, regs).os("ptrace(PTRACE_SETREGS)")?;
        self.regs = Some(regs);
        Ok(())
    }

    /// Copy words from tracee address `src` into `dst`
    ///
    /// Returns the number of bytes that could not be read. Faulting words are
    /// not errors; any other failure is.
    pub fn read_memory(&self, dst: &mut [c_long], src: u64) -> Result<usize> {
        check_aligned(src, dst.len() * WORD)?;
        if let Some(mem) = &self.mem {
            if let Some(unsatisfied) = self.read_direct(mem, dst, src)? {
                return Ok(unsatisfied);
            }
        }
        self.read_peek(dst, src)
    }

    /// Positional read through `/proc/<pid>/mem`
    ///
    /// `Ok(None)` means the handle is unusable and the caller should peek instead.
    fn read_direct(&self, mem: &File, dst: &mut [c_long], src: u64) -> Result<Option<usize>> {
        let len = dst.len() * WORD;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match mem.read_at(&mut buf[filled..], src + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error().map(Errno::from_raw).is_some_and(is_fault) => break,
                Err(e) => {
                    debug!(pid = %self.pid, error = %e, "direct memory read failed");
                    return Ok(None);
                }
            }
        }
        // Only whole words count as satisfied.
        let whole = filled / WORD;
        for (word, chunk) in dst.iter_mut().zip(buf.chunks_exact(WORD)).take(whole) {
            let mut bytes = [0u8; WORD];
            bytes.copy_from_slice(chunk);
            *word = c_long::from_ne_bytes(bytes);
        }
        Ok(Some(len - whole * WORD))
    }

    fn read_peek(&self, dst: &mut [c_long], src: u64) -> Result<usize> {
        let mut faults = 0;
        for (i, word) in dst.iter_mut().enumerate() {
            let addr = (src as usize + i * WORD) as AddressType;
            match ptrace::read(self.pid, addr) {
                Ok(value) => *word = value,
                Err(errno) if is_fault(errno) => faults += 1,
                Err(errno) => return Err(TimewarpError::os("ptrace(PTRACE_PEEKDATA)", errno)),
            }
        }
        Ok(faults * WORD)
    }

    /// Copy words from `src` to tracee address `dst`, word by word
    ///
    /// Returns the number of bytes that could not be written.
    pub fn write_memory(&self, dst: u64, src: &[c_long]) -> Result<usize> {
        check_aligned(dst, src.len() * WORD)?;
        let mut faults = 0;
        for (i, word) in src.iter().enumerate() {
            let addr = (dst as usize + i * WORD) as AddressType;
            match ptrace::write(self.pid, addr, *word) {
                Ok(()) => {}
                Err(errno) if is_fault(errno) => faults += 1,
                Err(errno) => return Err(TimewarpError::os("ptrace(PTRACE_POKEDATA)", errno)),
            }
        }
        Ok(faults * WORD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unaligned_address_rejected() {
        let process = TracedProcess::new(nix::unistd::getpid(), ());
        let mut dst = [0 as c_long; 2];
        let err = process.read_memory(&mut dst, 3).unwrap_err();
        assert!(matches!(err, TimewarpError::Unaligned { addr: 3, .. }));
    }

    #[test]
    fn test_write_unaligned_rejected() {
        let process = TracedProcess::new(nix::unistd::getpid(), ());
        let err = process.write_memory(1, &[0]).unwrap_err();
        assert!(matches!(err, TimewarpError::Unaligned { .. }));
    }

    #[test]
    fn test_direct_read_of_own_memory() {
        // /proc/self/mem is readable by the owning process without ptrace.
        let process = TracedProcess::new(nix::unistd::getpid(), ());
        let source: [c_long; 2] = [0x1234, -7];
        let mut dst = [0 as c_long; 2];
        let unsatisfied = process
            .read_memory(&mut dst, source.as_ptr() as usize as u64)
            .unwrap();
        assert_eq!(unsatisfied, 0);
        assert_eq!(dst, source);
    }

    #[test]
    fn test_direct_read_of_unmapped_page_counts_faults() {
        let process = TracedProcess::new(nix::unistd::getpid(), ());
        let mut dst = [0 as c_long; 2];
        let unsatisfied = process.read_memory(&mut dst, WORD as u64).unwrap();
        assert_eq!(unsatisfied, 2 * WORD);
    }

    #[test]
    fn test_set_registers_requires_syscall_stop() {
        let mut process = TracedProcess::new(nix::unistd::getpid(), ());
        let err = process.set_registers(&SyscallArgs::default()).unwrap_err();
        assert!(matches!(err, TimewarpError::Invariant(_)));
    }

    #[test]
    fn test_handler_rebinding() {
        let mut process = TracedProcess::new(nix::unistd::getpid(), 1u8);
        assert_eq!(process.handler(), 1);
        process.set_handler(7);
        assert_eq!(process.handler(), 7);
        assert!(!process.within_syscall());
    }
}
