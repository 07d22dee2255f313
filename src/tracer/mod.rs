//! Process tracing engine built on ptrace
//!
//! The tracer owns the tracing session for a set of processes: it spawns
//! traced programs, follows fork/vfork/clone, and turns every reaped wait
//! status into an event for the process's current handler. All event dispatch
//! happens inside [`ProcessTracer::drain`], which the caller invokes whenever
//! the notification descriptor (a signalfd carrying SIGCHLD) becomes readable.
//!
//! Event handling is a single [`EventHandler`] implementation supplied by the
//! caller; each process carries a copyable handler token `H` that tells the
//! handler which role (and which context) the event belongs to.

mod process;
mod status;

pub use process::{TracedProcess, WORD};
pub use status::{classify, ExitKind, StopKind, WaitReport};

use std::collections::HashMap;
use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, RawFd};

use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{raise, sigprocmask, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::unistd::{execvp, fork, ForkResult, Pid};
use tracing::{debug, trace, warn};

use crate::arch::{self, SyscallArgs, SyscallRegisters};
use crate::error::{OsContext, Result, TimewarpError};
use crate::syscalls::syscall_name;

/// Events delivered to the handler
#[derive(Debug)]
pub enum TraceEvent<'a> {
    /// A new process appeared (spawned, forked, vforked or cloned)
    Enter,
    /// The process exited or was killed; it is no longer traced
    Exit(ExitKind),
    /// Syscall-enter-stop; the handler may modify and push back the arguments
    SyscallEnter(&'a mut SyscallArgs),
    /// Syscall-exit-stop; the handler may modify and push back the result
    SyscallExit(&'a mut SyscallArgs),
    /// Signal-delivery-stop; set to 0 to suppress the signal
    Signal(&'a mut i32),
}

/// Receiver of trace events
pub trait EventHandler<H> {
    fn handle(&mut self, process: &mut TracedProcess<H>, event: TraceEvent<'_>) -> Result<()>;
}

const TRACE_OPTIONS: Options = Options::PTRACE_O_TRACESYSGOOD
    .union(Options::PTRACE_O_TRACEFORK)
    .union(Options::PTRACE_O_TRACEVFORK)
    .union(Options::PTRACE_O_TRACECLONE)
    .union(Options::PTRACE_O_TRACEEXEC)
    .union(Options::PTRACE_O_TRACEEXIT)
    .union(Options::PTRACE_O_EXITKILL);

/// Owner of the ptrace session
pub struct ProcessTracer<H> {
    signals: SignalFd,
    mask: SigSet,
    processes: HashMap<Pid, TracedProcess<H>>,
    parked: Vec<WaitReport>,
    initial_handler: H,
    termination_requested: bool,
}

impl<H: Copy> ProcessTracer<H> {
    /// Start a tracing session; new processes get `initial_handler`
    ///
    /// Blocks SIGCHLD, SIGINT and SIGTERM in the calling thread and routes them
    /// to the notification descriptor instead.
    pub fn new(initial_handler: H) -> Result<Self> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGTERM);
        mask.thread_block().os("sigprocmask(SIG_BLOCK)")?;

        let signals = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .os("signalfd")?;

        Ok(Self {
            signals,
            mask,
            processes: HashMap::new(),
            parked: Vec::new(),
            initial_handler,
            termination_requested: false,
        })
    }

    /// Descriptor that becomes readable when [`drain`](Self::drain) has work
    pub fn notification_fd(&self) -> RawFd {
        self.signals.as_fd().as_raw_fd()
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    pub fn process(&self, pid: Pid) -> Option<&TracedProcess<H>> {
        self.processes.get(&pid)
    }

    /// Rebind the handler token of a traced process
    pub fn set_handler(&mut self, pid: Pid, handler: H) -> bool {
        match self.processes.get_mut(&pid) {
            Some(process) => {
                process.set_handler(handler);
                true
            }
            None => false,
        }
    }

    /// SIGINT or SIGTERM was received by the tool itself
    pub fn termination_requested(&self) -> bool {
        self.termination_requested
    }

    /// Fork and exec `argv` under tracing, delivering `Enter` synchronously
    ///
    /// The child requests tracing and stops itself before exec, so no syscall
    /// of the target is missed.
    pub fn spawn<E: EventHandler<H>>(&mut self, argv: &[String], handler: &mut E) -> Result<Pid> {
        let args = argv
            .iter()
            .map(|a| CString::new(a.as_bytes()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| TimewarpError::Config("command contains a NUL byte".to_string()))?;
        let Some(program) = args.first().cloned() else {
            return Err(TimewarpError::Config("empty command".to_string()));
        };
        // Formatted up front: the child must not allocate or lock stderr.
        let exec_failure = format!("timewarp: failed to execute {}\n", argv[0]);

        // SAFETY: the child only calls async-signal-safe functions before exec.
        match unsafe { fork() }.os("fork")? {
            ForkResult::Child => {
                let _ = sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&self.mask), None);
                if ptrace::traceme().is_err() {
                    child_exit(127);
                }
                // Wait for the tracer to catch up.
                let _ = raise(Signal::SIGSTOP);
                let _ = execvp(&program, &args);
                // SAFETY: the buffer outlives the call and fd 2 is a plain descriptor.
                unsafe {
                    libc::write(
                        libc::STDERR_FILENO,
                        exec_failure.as_ptr().cast(),
                        exec_failure.len(),
                    );
                }
                child_exit(127);
            }
            ForkResult::Parent { child } => {
                let mut process = TracedProcess::new(child, self.initial_handler);
                handler.handle(&mut process, TraceEvent::Enter)?;
                self.processes.insert(child, process);
                Ok(child)
            }
        }
    }

    /// Process every pending notification
    pub fn drain<E: EventHandler<H>>(&mut self, handler: &mut E) -> Result<()> {
        self.consume_signals()?;

        while let Some(report) = reap()? {
            if self.processes.contains_key(&report.pid) {
                self.evaluate(report, handler)?;
            } else {
                // The status may overtake its parent's fork notification.
                debug!(pid = %report.pid, status = report.status, "parking status of unknown pid");
                self.parked.push(report);
            }
        }

        for report in std::mem::take(&mut self.parked) {
            if self.processes.contains_key(&report.pid) {
                self.evaluate(report, handler)?;
            } else {
                warn!(pid = %report.pid, status = format_args!("{:#x}", report.status),
                      "wait status from unknown process, keeping it parked");
                self.parked.push(report);
            }
        }
        Ok(())
    }

    /// Empty the signalfd
    ///
    /// Signals coalesce, so the number of records read says nothing about the
    /// number of status changes; only termination requests are looked at.
    fn consume_signals(&mut self) -> Result<()> {
        loop {
            match self.signals.read_signal() {
                Ok(Some(info)) => {
                    let signo = info.ssi_signo as i32;
                    if signo == libc::SIGINT || signo == libc::SIGTERM {
                        warn!(signo, "termination requested");
                        self.termination_requested = true;
                    }
                }
                Ok(None) | Err(Errno::EAGAIN) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(TimewarpError::os("read(signalfd)", errno)),
            }
        }
    }

    fn evaluate<E: EventHandler<H>>(&mut self, report: WaitReport, handler: &mut E) -> Result<()> {
        let WaitReport { pid, status } = report;
        let kind = classify(status);

        if let StopKind::Exited(exit) = kind {
            if let Some(mut process) = self.processes.remove(&pid) {
                handler.handle(&mut process, TraceEvent::Exit(exit))?;
            }
            return Ok(());
        }

        let Some(process) = self.processes.get_mut(&pid) else {
            return Ok(());
        };
        if !process.initialized {
            // The spawned child SIGSTOPs itself; forked descendants start
            // stopped because of TRACEFORK and friends.
            if !status::is_initial_stop(status) {
                return Err(TimewarpError::UnexpectedInitialStop { pid, status });
            }
            ptrace::setoptions(pid, TRACE_OPTIONS).os("ptrace(PTRACE_SETOPTIONS)")?;
            process.initialized = true;
            return resume(pid, 0);
        }

        let inject = match kind {
            StopKind::Syscall => {
                self.syscall_stop(pid, handler)?;
                0
            }
            StopKind::NewProcess => {
                let child = Pid::from_raw(ptrace::getevent(pid).os("ptrace(PTRACE_GETEVENTMSG)")? as i32);
                let mut process = TracedProcess::new(child, self.initial_handler);
                handler.handle(&mut process, TraceEvent::Enter)?;
                self.processes.insert(child, process);
                0
            }
            StopKind::Exec => {
                process.reopen_memory();
                0
            }
            // The final status arrives separately as an exit.
            StopKind::Exiting => 0,
            StopKind::Signal(signo) => {
                let mut signo = signo;
                handler.handle(process, TraceEvent::Signal(&mut signo))?;
                signo
            }
            StopKind::UnknownEvent(event) => {
                warn!(%pid, event, "unexpected ptrace event");
                0
            }
            StopKind::Unknown | StopKind::Exited(_) => {
                warn!(%pid, status = format_args!("{:#x}", status), "wait status not understood");
                0
            }
        };

        if let Some(process) = self.processes.get_mut(&pid) {
            process.regs = None;
        }
        resume(pid, inject)
    }

    fn syscall_stop<E: EventHandler<H>>(&mut self, pid: Pid, handler: &mut E) -> Result<()> {
        let regs = arch::get_registers(pid).os("ptrace(PTRACE_GETREGS)")?;
        let Some(process) = self.processes.get_mut(&pid) else {
            return Ok(());
        };
        process.regs = Some(regs);

        let entering = !process.within_syscall;
        if entering && !regs.is_syscall_entry() {
            warn!(%pid, "syscall entry/exit desynchronization");
        }
        process.within_syscall = entering;

        let mut sys = SyscallArgs::from_registers(&regs);
        trace!(%pid, syscall = %syscall_name(sys.number), entering, ret = sys.ret, "syscall stop");
        let event = if entering {
            TraceEvent::SyscallEnter(&mut sys)
        } else {
            TraceEvent::SyscallExit(&mut sys)
        };
        handler.handle(process, event)
    }
}

impl<H> Drop for ProcessTracer<H> {
    fn drop(&mut self) {
        for pid in self.processes.keys() {
            // Only succeeds for tracees currently in a ptrace-stop.
            let _ = ptrace::detach(*pid, None);
        }
    }
}

/// Leave a forked child without running exit handlers or flushing stdio
fn child_exit(code: i32) -> ! {
    // SAFETY: _exit(2) is async-signal-safe and never returns.
    unsafe { libc::_exit(code) }
}

/// Reap one status change of any child without blocking
///
/// Raw `waitpid` is used so that the status can be kept undecoded.
fn reap() -> Result<Option<WaitReport>> {
    loop {
        let mut status = 0;
        // SAFETY: `status` is a valid out-pointer for the duration of the call.
        let res = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG | libc::__WALL) };
        return match Errno::result(res) {
            Ok(0) | Err(Errno::ECHILD) => Ok(None),
            Ok(pid) => Ok(Some(WaitReport {
                pid: Pid::from_raw(pid),
                status,
            })),
            Err(Errno::EINTR) => continue,
            Err(errno) => Err(TimewarpError::os("waitpid", errno)),
        };
    }
}

/// Resume a stopped tracee until its next syscall boundary, optionally injecting a signal
fn resume(pid: Pid, signal: i32) -> Result<()> {
    // SAFETY: PTRACE_SYSCALL ignores addr and takes the signal number as data.
    let res = unsafe {
        libc::ptrace(
            libc::PTRACE_SYSCALL,
            pid.as_raw(),
            std::ptr::null_mut::<libc::c_void>(),
            signal as libc::c_long,
        )
    };
    match Errno::result(res) {
        Ok(_) => Ok(()),
        // Killed while stopped; its exit status is still to be reaped.
        Err(Errno::ESRCH) => {
            debug!(%pid, "tracee vanished before it could be resumed");
            Ok(())
        }
        Err(errno) => Err(TimewarpError::os("ptrace(PTRACE_SYSCALL)", errno)),
    }
}
