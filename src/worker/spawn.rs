//! Worker process creation.
//!
//! Workers are created with a bare `fork` rather than `posix_spawn`: the
//! child keeps the manager's address space (copy-on-write), which is the
//! point of preloading the application before forking.

use nix::sys::signal::{SigSet, SigmaskHow};
use nix::unistd::{ForkResult, fork};

use super::ipc::PipeFd;
use crate::error::Result;

/// Both pipes of a worker, before the fork splits them between processes.
pub struct WorkerChannels {
    ready: (PipeFd, PipeFd),
    job: (PipeFd, PipeFd),
}

/// The pipe ends the manager keeps.
pub struct ManagerEnds {
    /// Read end of the ready pipe (non-blocking).
    pub ready_rx: PipeFd,
    /// Write end of the job pipe.
    pub job_tx: PipeFd,
}

/// The pipe ends the worker keeps.
pub struct WorkerEnds {
    /// Write end of the ready pipe.
    pub ready_tx: PipeFd,
    /// Read end of the job pipe.
    pub job_rx: PipeFd,
}

impl WorkerChannels {
    /// Create the ready pipe (non-blocking) and the job pipe (blocking).
    pub fn new() -> Result<Self> {
        Ok(Self {
            ready: PipeFd::nonblocking_pair()?,
            job: PipeFd::pair()?,
        })
    }

    /// Split into the manager's ends and the worker's ends.
    ///
    /// Each process drops the half it does not use right after the fork, so
    /// a dead peer shows up as EOF instead of a descriptor leak.
    pub fn split(self) -> (ManagerEnds, WorkerEnds) {
        let (ready_rx, ready_tx) = self.ready;
        let (job_rx, job_tx) = self.job;
        (
            ManagerEnds { ready_rx, job_tx },
            WorkerEnds { ready_tx, job_rx },
        )
    }
}

/// Fork the current process.
///
/// # Safety
/// The caller must be single-threaded: the child only gets a copy of the
/// calling thread, and locks held by other threads stay locked forever.
pub unsafe fn fork_process() -> Result<ForkResult> {
    // Safety: upheld by the caller.
    Ok(unsafe { fork() }?)
}

/// Fork with every signal blocked across the fork.
///
/// The parent's mask is restored before this returns. The child keeps every
/// signal blocked and must restore the returned mask itself, once its own
/// handlers are in place, so nothing aimed at it runs an inherited handler
/// or gets lost in between.
///
/// # Safety
/// Same as [`fork_process`].
pub unsafe fn fork_blocking_signals() -> Result<(ForkResult, SigSet)> {
    let saved = SigSet::all().thread_swap_mask(SigmaskHow::SIG_BLOCK)?;
    // Safety: upheld by the caller.
    let forked = unsafe { fork() };
    if !matches!(forked, Ok(ForkResult::Child)) {
        saved.thread_set_mask()?;
    }
    Ok((forked?, saved))
}

/// Leave the process without unwinding, flushing or running exit handlers.
///
/// Used by forked children, whose stack and buffers are copies of the
/// parent's. Async-signal-safe.
pub fn exit_immediately(code: i32) -> ! {
    // Safety: _exit takes no pointers and never returns.
    unsafe { libc::_exit(code) }
}
