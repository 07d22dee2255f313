//! Scheduling state of every live traced process
//!
//! [`ParentScheduler`] owns one [`Child`] per traced process, keyed by a
//! stable [`ChildId`] handed out in creation order. The tracer refers to a
//! child only through that id (carried in the [`Role`] handler token), never
//! through a pointer.

use std::collections::{BTreeMap, BTreeSet};

use nix::errno::Errno;
use nix::unistd::Pid;
use tracing::{debug, info};

use crate::clock::Nanos;
use crate::error::{Result, TimewarpError};
use crate::liveness::LivenessSource;
use crate::signals;
use crate::timeout::ClockSource;
use crate::tracer::{ExitKind, ProcessTracer};

/// Stable handle of a child, ordered by creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChildId(u64);

/// Which part of the scheduler handles a traced process's events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Not registered yet; only `Enter` is expected
    Start,
    /// Registered child
    Child(ChildId),
}

/// When a blocked child will wake up on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Blocked on something whose timeout is not tracked
    Unknown,
    /// Blocked without a timeout
    Forever,
    /// Absolute virtual time in nanoseconds
    At(Nanos),
}

impl Deadline {
    pub fn at(self) -> Option<Nanos> {
        match self {
            Deadline::At(ns) => Some(ns),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Child {
    pid: Pid,
    blocked: bool,
    /// Meaningful only while blocked
    pub blocked_until: Deadline,
    /// Syscall being waited in, 0 when not blocking
    pub syscall: i64,
    /// A wake signal is on its way
    pub interrupted: bool,
    launched: bool,
    liveness: LivenessSource,
}

impl Child {
    fn new(pid: Pid) -> Self {
        Self {
            pid,
            blocked: false,
            blocked_until: Deadline::Unknown,
            syscall: 0,
            interrupted: false,
            launched: false,
            liveness: LivenessSource::open(pid),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// Started from a command line group rather than forked by a target
    pub fn is_launched(&self) -> bool {
        self.launched
    }
}

/// Registry of all live children plus the virtual clock offset
#[derive(Debug)]
pub struct ParentScheduler {
    children: BTreeMap<ChildId, Child>,
    blocked: BTreeSet<ChildId>,
    next_id: u64,
    time_drift: Nanos,
    exit_status: i32,
    pub(crate) wake_signal: i32,
    pub(crate) clocks: ClockSource,
}

impl ParentScheduler {
    pub fn new(wake_signal: i32) -> Self {
        Self {
            children: BTreeMap::new(),
            blocked: BTreeSet::new(),
            next_id: 0,
            time_drift: 0,
            exit_status: 0,
            wake_signal,
            clocks: ClockSource::Kernel,
        }
    }

    /// Set where tracees read their clocks from
    pub fn with_clock_source(mut self, clocks: ClockSource) -> Self {
        self.clocks = clocks;
        self
    }

    /// Launch `argv` under tracing; the child is registered by the `Enter` event
    pub fn spawn(&mut self, tracer: &mut ProcessTracer<Role>, argv: &[String]) -> Result<ChildId> {
        let pid = tracer.spawn(argv, self)?;
        let id = self
            .id_of(pid)
            .ok_or_else(|| TimewarpError::Invariant(format!("pid {} was not registered", pid)))?;
        if let Some(child) = self.children.get_mut(&id) {
            child.launched = true;
        }
        info!(%pid, command = %argv.join(" "), "running");
        Ok(id)
    }

    /// Add a child for a process that just appeared
    pub fn register(&mut self, pid: Pid) -> ChildId {
        let id = ChildId(self.next_id);
        self.next_id += 1;
        self.children.insert(id, Child::new(pid));
        id
    }

    /// Drop a child whose process is gone
    pub fn remove(&mut self, id: ChildId) -> Result<Child> {
        if self.children.get(&id).is_some_and(Child::is_blocked) {
            self.mark_unblocked(id)?;
        }
        self.children
            .remove(&id)
            .ok_or_else(|| TimewarpError::Invariant(format!("unknown child {:?}", id)))
    }

    /// Record the exit of a child, folding launched programs into the exit status
    pub fn record_exit(&mut self, child: &Child, exit: ExitKind) {
        if child.launched {
            self.exit_status = self.exit_status.max(exit.exit_code());
        }
    }

    pub fn mark_blocked(&mut self, id: ChildId) -> Result<()> {
        let child = self.child_entry(id)?;
        if child.blocked {
            return Err(TimewarpError::Invariant(format!(
                "pid {} is already blocked",
                child.pid
            )));
        }
        child.blocked = true;
        child.blocked_until = Deadline::Unknown;
        self.blocked.insert(id);
        Ok(())
    }

    pub fn mark_unblocked(&mut self, id: ChildId) -> Result<()> {
        let child = self.child_entry(id)?;
        if !child.blocked {
            return Err(TimewarpError::Invariant(format!(
                "pid {} is not blocked",
                child.pid
            )));
        }
        child.blocked = false;
        self.blocked.remove(&id);
        Ok(())
    }

    /// Blocked child with the nearest finite deadline
    ///
    /// On ties the oldest child wins.
    pub fn select_min_deadline(&self) -> Option<ChildId> {
        let mut best: Option<(ChildId, Nanos)> = None;
        for (id, child) in &self.children {
            let Some(deadline) = child.blocked_until.at().filter(|_| child.blocked) else {
                continue;
            };
            if best.map_or(true, |(_, min)| deadline < min) {
                best = Some((*id, deadline));
            }
        }
        best.map(|(id, _)| id)
    }

    /// First child whose process is not sleeping interruptibly
    pub fn find_non_quiescent(&self) -> Option<ChildId> {
        self.children
            .iter()
            .find(|(_, child)| !child.liveness.is_quiescent())
            .map(|(id, _)| *id)
    }

    /// Send `signo` to every live child
    pub fn kill_all(&self, signo: i32) -> Result<()> {
        for child in self.children.values() {
            match signals::kill(child.pid, signo) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(errno) => return Err(TimewarpError::os("kill", errno)),
            }
        }
        Ok(())
    }

    /// Move the virtual clock forward
    pub fn advance(&mut self, speedup: Nanos) {
        self.time_drift += speedup.max(0);
        debug!(time_drift = self.time_drift, "virtual clock advanced");
    }

    pub fn time_drift(&self) -> Nanos {
        self.time_drift
    }

    pub fn child(&self, id: ChildId) -> Option<&Child> {
        self.children.get(&id)
    }

    pub fn child_mut(&mut self, id: ChildId) -> Option<&mut Child> {
        self.children.get_mut(&id)
    }

    pub fn id_of(&self, pid: Pid) -> Option<ChildId> {
        self.children
            .iter()
            .find(|(_, child)| child.pid == pid)
            .map(|(id, _)| *id)
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }

    pub fn all_blocked(&self) -> bool {
        self.blocked_count() == self.child_count()
    }

    /// Highest exit code among launched programs
    pub fn exit_status(&self) -> i32 {
        self.exit_status
    }

    fn child_entry(&mut self, id: ChildId) -> Result<&mut Child> {
        self.children
            .get_mut(&id)
            .ok_or_else(|| TimewarpError::Invariant(format!("unknown child {:?}", id)))
    }
}
