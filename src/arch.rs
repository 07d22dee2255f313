//! Register layouts of the supported process architectures
//!
//! Each architecture exposes the same small surface through
//! [`SyscallRegisters`]: syscall number, six arguments and return value. The
//! layout is chosen at compile time; only x86_64, x86 and 32-bit ARM are
//! supported.
//!
//! On 32-bit targets arguments are zero-extended (they are mostly pointers)
//! while the return value is sign-extended (it carries `-errno`).

use nix::unistd::Pid;

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "arm")))]
compile_error!("timewarp only knows the register layouts of x86_64, x86 and arm");

/// Accessors every architecture's register snapshot provides
pub trait SyscallRegisters {
    /// Heuristic entry detection from register contents alone
    fn is_syscall_entry(&self) -> bool;
    fn syscall_number(&self) -> i64;
    fn set_syscall_number(&mut self, number: i64);
    fn args(&self) -> [i64; 6];
    fn set_args(&mut self, args: [i64; 6]);
    fn return_value(&self) -> i64;
    fn set_return_value(&mut self, value: i64);
}

/// A system call decoded from a register snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyscallArgs {
    pub number: i64,
    pub args: [i64; 6],
    pub ret: i64,
}

impl SyscallArgs {
    pub fn from_registers<R: SyscallRegisters>(regs: &R) -> Self {
        Self {
            number: regs.syscall_number(),
            args: regs.args(),
            ret: regs.return_value(),
        }
    }

    /// Write number, arguments and return value back into `regs`
    pub fn apply_to<R: SyscallRegisters>(&self, regs: &mut R) {
        regs.set_syscall_number(self.number);
        regs.set_args(self.args);
        regs.set_return_value(self.ret);
    }

    /// Argument by zero-based slot
    pub fn arg(&self, slot: usize) -> i64 {
        self.args[slot]
    }
}

#[cfg(target_arch = "x86_64")]
mod imp {
    use super::SyscallRegisters;
    use nix::sys::ptrace;
    use nix::unistd::Pid;

    pub type Registers = libc::user_regs_struct;

    impl SyscallRegisters for libc::user_regs_struct {
        // RAX is set to -ENOSYS on entry; a syscall returning ENOSYS looks the same.
        fn is_syscall_entry(&self) -> bool {
            self.rax as i64 == -(libc::ENOSYS as i64)
        }

        fn syscall_number(&self) -> i64 {
            self.orig_rax as i64
        }

        fn set_syscall_number(&mut self, number: i64) {
            self.orig_rax = number as u64;
        }

        fn args(&self) -> [i64; 6] {
            [
                self.rdi as i64,
                self.rsi as i64,
                self.rdx as i64,
                self.r10 as i64,
                self.r8 as i64,
                self.r9 as i64,
            ]
        }

        fn set_args(&mut self, args: [i64; 6]) {
            self.rdi = args[0] as u64;
            self.rsi = args[1] as u64;
            self.rdx = args[2] as u64;
            self.r10 = args[3] as u64;
            self.r8 = args[4] as u64;
            self.r9 = args[5] as u64;
        }

        fn return_value(&self) -> i64 {
            self.rax as i64
        }

        fn set_return_value(&mut self, value: i64) {
            self.rax = value as u64;
        }
    }

    pub fn get_registers(pid: Pid) -> nix::Result<Registers> {
        ptrace::getregs(pid)
    }

    pub fn set_registers(pid: Pid, regs: Registers) -> nix::Result<()> {
        ptrace::setregs(pid, regs)
    }
}

#[cfg(target_arch = "x86")]
mod imp {
    use super::SyscallRegisters;
    use libc::c_long;
    use nix::sys::ptrace;
    use nix::unistd::Pid;

    pub type Registers = libc::user_regs_struct;

    impl SyscallRegisters for libc::user_regs_struct {
        fn is_syscall_entry(&self) -> bool {
            self.eax == -(libc::ENOSYS as c_long)
        }

        fn syscall_number(&self) -> i64 {
            self.orig_eax as u32 as i64
        }

        fn set_syscall_number(&mut self, number: i64) {
            self.orig_eax = number as c_long;
        }

        fn args(&self) -> [i64; 6] {
            [
                self.ebx as u32 as i64,
                self.ecx as u32 as i64,
                self.edx as u32 as i64,
                self.esi as u32 as i64,
                self.edi as u32 as i64,
                self.ebp as u32 as i64,
            ]
        }

        fn set_args(&mut self, args: [i64; 6]) {
            self.ebx = args[0] as c_long;
            self.ecx = args[1] as c_long;
            self.edx = args[2] as c_long;
            self.esi = args[3] as c_long;
            self.edi = args[4] as c_long;
            self.ebp = args[5] as c_long;
        }

        fn return_value(&self) -> i64 {
            self.eax as i64
        }

        fn set_return_value(&mut self, value: i64) {
            self.eax = value as c_long;
        }
    }

    pub fn get_registers(pid: Pid) -> nix::Result<Registers> {
        ptrace::getregs(pid)
    }

    pub fn set_registers(pid: Pid, regs: Registers) -> nix::Result<()> {
        ptrace::setregs(pid, regs)
    }
}

#[cfg(target_arch = "arm")]
mod imp {
    use super::SyscallRegisters;
    use libc::{c_uint, c_ulong, c_void};
    use nix::errno::Errno;
    use nix::unistd::Pid;
    use std::ptr;

    const PTRACE_GETREGS: c_uint = 12;
    const PTRACE_SETREGS: c_uint = 13;

    const ARM_R0: usize = 0;
    const ARM_R7: usize = 7;
    const ARM_IP: usize = 12;
    const ARM_ORIG_R0: usize = 17;

    /// `struct pt_regs` of 32-bit ARM
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct Registers {
        pub uregs: [c_ulong; 18],
    }

    impl SyscallRegisters for Registers {
        // The kernel sets ip to 0 on syscall entry and 1 on exit.
        fn is_syscall_entry(&self) -> bool {
            self.uregs[ARM_IP] == 0
        }

        fn syscall_number(&self) -> i64 {
            self.uregs[ARM_R7] as i64
        }

        fn set_syscall_number(&mut self, number: i64) {
            self.uregs[ARM_R7] = number as c_ulong;
        }

        // No 64-bit parameters are decoded, so arguments map 1:1 to registers.
        fn args(&self) -> [i64; 6] {
            [
                self.uregs[ARM_ORIG_R0] as i64,
                self.uregs[1] as i64,
                self.uregs[2] as i64,
                self.uregs[3] as i64,
                self.uregs[4] as i64,
                self.uregs[5] as i64,
            ]
        }

        fn set_args(&mut self, args: [i64; 6]) {
            self.uregs[ARM_ORIG_R0] = args[0] as c_ulong;
            for (slot, value) in args.iter().enumerate().skip(1) {
                self.uregs[slot] = *value as c_ulong;
            }
        }

        fn return_value(&self) -> i64 {
            self.uregs[ARM_R0] as i32 as i64
        }

        fn set_return_value(&mut self, value: i64) {
            self.uregs[ARM_R0] = value as c_ulong;
        }
    }

    pub fn get_registers(pid: Pid) -> nix::Result<Registers> {
        let mut regs = Registers::default();
        // SAFETY: PTRACE_GETREGS writes exactly one `struct pt_regs` into `regs`.
        let res = unsafe {
            libc::ptrace(
                PTRACE_GETREGS,
                pid.as_raw(),
                ptr::null_mut::<c_void>(),
                &mut regs as *mut Registers as *mut c_void,
            )
        };
        Errno::result(res).map(|_| regs)
    }

    pub fn set_registers(pid: Pid, mut regs: Registers) -> nix::Result<()> {
        // SAFETY: PTRACE_SETREGS only reads one `struct pt_regs` from `regs`.
        let res = unsafe {
            libc::ptrace(
                PTRACE_SETREGS,
                pid.as_raw(),
                ptr::null_mut::<c_void>(),
                &mut regs as *mut Registers as *mut c_void,
            )
        };
        Errno::result(res).map(drop)
    }
}

pub use imp::Registers;

/// Capture the full register set of a stopped tracee
pub fn get_registers(pid: Pid) -> nix::Result<Registers> {
    imp::get_registers(pid)
}

/// Store a full register set into a stopped tracee
pub fn set_registers(pid: Pid, regs: Registers) -> nix::Result<()> {
    imp::set_registers(pid, regs)
}
