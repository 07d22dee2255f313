//! Virtual clock orchestration
//!
//! The loop waits until every traced process is blocked, double-checks with
//! the kernel that nothing is still in flight, and then advances the virtual
//! clock just far enough to wake the child with the nearest deadline. That
//! child alone gets the wake signal; its interrupted syscall is later
//! rewritten to look like an ordinary timeout.
//!
//! All event handling happens inside [`ProcessTracer::drain`], through the
//! [`EventHandler`] implementation of [`ParentScheduler`] below.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use tracing::{debug, info, warn};

use crate::clock::{self, Nanos};
use crate::config::Options;
use crate::error::{Result, TimewarpError};
use crate::reactor::Reactor;
use crate::registry::{ChildId, Deadline, ParentScheduler, Role};
use crate::signals::{self, signal_name};
use crate::syscalls::syscall_name;
use crate::timeout::{self, ClockSource};
use crate::tracer::{EventHandler, ProcessTracer, TraceEvent, TracedProcess};

/// How long remaining children get to act on SIGTERM before the tracer detaches
const TEARDOWN_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Tracer,
}

impl EventHandler<Role> for ParentScheduler {
    fn handle(&mut self, process: &mut TracedProcess<Role>, event: TraceEvent<'_>) -> Result<()> {
        let pid = process.pid();
        match (process.handler(), event) {
            (Role::Start, TraceEvent::Enter) => {
                let id = self.register(pid);
                process.set_handler(Role::Child(id));
                info!(%pid, "started");
                Ok(())
            }
            (Role::Start, event) => Err(TimewarpError::Invariant(format!(
                "pid {} produced {:?} before it was registered",
                pid, event
            ))),
            (Role::Child(id), event) => self.child_event(id, process, event),
        }
    }
}

impl ParentScheduler {
    fn child_event(
        &mut self,
        id: ChildId,
        process: &mut TracedProcess<Role>,
        event: TraceEvent<'_>,
    ) -> Result<()> {
        let drift = self.time_drift();
        match event {
            TraceEvent::Exit(exit) => {
                let child = self.remove(id)?;
                self.record_exit(&child, exit);
                info!(pid = %process.pid(), ?exit, "exited");
            }
            TraceEvent::SyscallEnter(sys) => {
                self.mark_blocked(id)?;
                let clocks = self.clocks;
                if let Some(deadline) = timeout::on_syscall_enter(process, sys, drift, clocks)? {
                    if let Some(child) = self.child_mut(id) {
                        child.blocked_until = deadline;
                        child.syscall = sys.number;
                    }
                }
            }
            TraceEvent::SyscallExit(sys) => {
                self.mark_unblocked(id)?;
                timeout::on_syscall_exit(process, sys, drift)?;
                let interrupted = match self.child_mut(id) {
                    Some(child) => {
                        child.syscall = 0;
                        child.interrupted
                    }
                    None => false,
                };
                if interrupted {
                    timeout::pacify(process, sys)?;
                }
            }
            TraceEvent::Signal(signo) => {
                if *signo == self.wake_signal {
                    *signo = 0;
                    if let Some(child) = self.child_mut(id) {
                        child.interrupted = false;
                    }
                } else {
                    debug!(pid = %process.pid(), signal = %signal_name(*signo), "passing signal on");
                }
            }
            TraceEvent::Enter => {
                return Err(TimewarpError::Invariant(format!(
                    "pid {} entered twice",
                    process.pid()
                )));
            }
        }
        Ok(())
    }
}

/// The top-level control loop
pub struct VirtualClockScheduler<'a> {
    options: &'a Options,
    tracer: ProcessTracer<Role>,
    parent: ParentScheduler,
    reactor: Reactor<Token>,
    pending: VecDeque<Vec<String>>,
}

impl<'a> VirtualClockScheduler<'a> {
    pub fn new(options: &'a Options, commands: Vec<Vec<String>>) -> Result<Self> {
        let tracer = ProcessTracer::new(Role::Start)?;
        let clocks = if options.preload {
            ClockSource::Preload
        } else {
            ClockSource::Kernel
        };
        let mut reactor = Reactor::new();
        reactor.register(tracer.notification_fd(), Token::Tracer);
        Ok(Self {
            options,
            tracer,
            parent: ParentScheduler::new(options.wake_signal).with_clock_source(clocks),
            reactor,
            pending: commands.into(),
        })
    }

    /// Run every program to completion and return the exit status
    pub fn run(mut self) -> Result<i32> {
        self.launch_next()?;

        loop {
            if self.tracer.termination_requested() {
                warn!("forced exit");
                break;
            }
            if self.parent.child_count() == 0 && self.pending.is_empty() {
                break;
            }

            // Time can only be skipped while nobody is able to observe it.
            if !self.parent.all_blocked() {
                self.wait(None)?;
                continue;
            }

            // Give already completed work a chance to show up.
            nix::sched::sched_yield().map_err(|e| TimewarpError::os("sched_yield", e))?;
            if self.wait(Some(self.options.settle))? > 0 {
                continue;
            }
            if let Some(id) = self.parent.find_non_quiescent() {
                if let Some(child) = self.parent.child(id) {
                    debug!(pid = %child.pid(), "not quiescent yet");
                }
                self.wait(Some(self.options.settle))?;
                continue;
            }
            if self.wait(Some(self.options.idleness))? > 0 {
                continue;
            }

            if !self.pending.is_empty() {
                self.launch_next()?;
                continue;
            }

            if let Some(id) = self.parent.select_min_deadline() {
                self.fast_forward(id)?;
            }
            self.wait(None)?;
        }

        self.parent.kill_all(libc::SIGTERM)?;
        // Traced children only die once their signal-delivery-stop is resumed.
        let grace = Instant::now() + TEARDOWN_GRACE;
        while self.parent.child_count() > 0 && Instant::now() < grace {
            self.wait(Some(self.options.settle))?;
        }
        let status = self.parent.exit_status();
        info!(status, time_drift = %clock::as_secs_f64(self.parent.time_drift()), "done");
        Ok(status)
    }

    fn launch_next(&mut self) -> Result<()> {
        if let Some(argv) = self.pending.pop_front() {
            self.parent.spawn(&mut self.tracer, &argv)?;
        }
        Ok(())
    }

    /// Advance the clock to `id`'s deadline and wake it
    fn fast_forward(&mut self, id: ChildId) -> Result<()> {
        let now = clock::realtime_now()?;
        let drift = self.parent.time_drift();
        let Some(child) = self.parent.child(id) else {
            return Ok(());
        };
        let Deadline::At(deadline) = child.blocked_until else {
            return Err(TimewarpError::Invariant(format!(
                "pid {} selected without a deadline",
                child.pid()
            )));
        };
        let pid = child.pid();
        let syscall = child.syscall;

        let speedup = speedup(deadline, now, drift);
        self.parent.advance(speedup);
        info!(%pid, syscall = %syscall_name(syscall), secs = clock::as_secs_f64(speedup),
              "speeding up");

        if let Some(child) = self.parent.child_mut(id) {
            child.interrupted = true;
        }
        match signals::tkill(pid, self.options.wake_signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                debug!(%pid, "woken child is already gone");
                Ok(())
            }
            Err(errno) => Err(TimewarpError::os("tkill", errno)),
        }
    }

    /// Wait for tracer notifications, draining them; returns the number of ready sources
    fn wait(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let Self {
            reactor,
            tracer,
            parent,
            ..
        } = self;
        reactor.wait(timeout, |token| match token {
            Token::Tracer => tracer.drain(parent),
        })
    }
}

/// How far the virtual clock must jump for `deadline` to be due
///
/// An expired deadline is woken without moving the clock.
fn speedup(deadline: Nanos, now: Nanos, drift: Nanos) -> Nanos {
    (deadline - (now + drift)).max(0)
}
