//! Readiness-based multiplexed wait
//!
//! Register a readable descriptor with a token; [`Reactor::wait`] blocks
//! until at least one registered descriptor is ready (or the timeout expires)
//! and hands the token of every ready descriptor to a callback. The wait is
//! the single suspension point of the scheduler.

use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::error::{Result, TimewarpError};

#[derive(Debug)]
struct Registration<T> {
    fd: RawFd,
    token: T,
}

/// Multiplexed wait over a small set of readable descriptors
///
/// The reactor stores raw descriptors; whoever registers a descriptor must
/// keep it open for the lifetime of the reactor.
#[derive(Debug)]
pub struct Reactor<T> {
    registrations: Vec<Registration<T>>,
}

impl<T: Copy> Default for Reactor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy> Reactor<T> {
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
        }
    }

    /// Watch `fd` for readability, replacing the token of an earlier registration
    pub fn register(&mut self, fd: RawFd, token: T) {
        match self.registrations.iter_mut().find(|r| r.fd == fd) {
            Some(existing) => existing.token = token,
            None => self.registrations.push(Registration { fd, token }),
        }
    }

    /// Block until a descriptor is ready or `timeout` elapses (`None` waits forever)
    ///
    /// Calls `on_ready` once per ready descriptor and returns how many were
    /// ready; 0 means the timeout expired or the wait was interrupted.
    pub fn wait<F>(&mut self, timeout: Option<Duration>, mut on_ready: F) -> Result<usize>
    where
        F: FnMut(T) -> Result<()>,
    {
        let mut fds: Vec<PollFd<'_>> = self
            .registrations
            .iter()
            .map(|r| {
                // SAFETY: registrants keep `fd` open while the reactor lives.
                let fd = unsafe { BorrowedFd::borrow_raw(r.fd) };
                PollFd::new(fd, PollFlags::POLLIN)
            })
            .collect();

        let ready = match poll(&mut fds, poll_timeout(timeout)) {
            Ok(n) => n as usize,
            Err(Errno::EINTR) => return Ok(0),
            Err(errno) => return Err(TimewarpError::os("poll", errno)),
        };
        if ready == 0 {
            return Ok(0);
        }

        // Hangups and errors count as readable so the owner sees them on read.
        let fired: Vec<T> = fds
            .iter()
            .zip(&self.registrations)
            .filter(|(pfd, _)| {
                pfd.revents()
                    .unwrap_or(PollFlags::empty())
                    .intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
            })
            .map(|(_, reg)| reg.token)
            .collect();
        drop(fds);

        for token in &fired {
            on_ready(*token)?;
        }
        Ok(fired.len())
    }
}

/// Millisecond poll timeout, rounded up so short waits never become busy loops
fn poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    match timeout {
        None => PollTimeout::NONE,
        Some(d) => {
            let ms = d.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as i32;
            PollTimeout::try_from(ms).unwrap_or(PollTimeout::NONE)
        }
    }
}
