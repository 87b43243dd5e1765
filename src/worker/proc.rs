//! Manager-side handle for a live worker process.

use std::os::unix::io::{AsFd, BorrowedFd};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use super::Worker;
use super::ipc::{LineWriter, PipeFd, drain_ready};
use super::protocol::Job;
use super::spawn::ManagerEnds;
use crate::error::{HerdError, Result};

/// Bookkeeping the manager keeps for one forked worker.
pub struct WorkerRecord {
    pid: Pid,
    worker: Worker,
    /// Read end of the ready pipe, non-blocking.
    ready_rx: PipeFd,
    /// Write end of the job pipe.
    job_tx: LineWriter,
    /// Sequence number of the readiness report not yet answered with a job.
    ready_since: Option<u64>,
}

impl WorkerRecord {
    /// Wrap a freshly forked child.
    pub fn new(pid: Pid, worker: Worker, ends: ManagerEnds) -> Self {
        Self {
            pid,
            worker,
            ready_rx: ends.ready_rx,
            job_tx: LineWriter::new(ends.job_tx),
            ready_since: None,
        }
    }

    /// Process ID.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Ordinal slot.
    pub fn nr(&self) -> usize {
        self.worker.nr()
    }

    /// Shared worker bookkeeping.
    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// Descriptor the manager polls for readiness reports.
    pub fn ready_fd(&self) -> BorrowedFd<'_> {
        self.ready_rx.as_fd()
    }

    /// Whether the worker reported ready and has not been handed a job since.
    pub fn is_ready(&self) -> bool {
        self.ready_since.is_some()
    }

    pub(crate) fn ready_since(&self) -> Option<u64> {
        self.ready_since
    }

    /// Consume pending readiness bytes; marks the worker ready if any arrived.
    ///
    /// Returns `false` when the worker closed its end of the pipe.
    pub fn collect_ready(&mut self, seq: u64) -> Result<bool> {
        let n = drain_ready(&mut self.ready_rx)?;
        if n == 0 {
            return Ok(false);
        }
        if self.ready_since.is_none() {
            self.ready_since = Some(seq);
        }
        Ok(true)
    }

    /// Hand a job to this worker. Only valid while the worker is ready.
    pub fn dispatch(&mut self, job: &Job) -> Result<()> {
        if self.ready_since.is_none() {
            return Err(HerdError::Worker(format!(
                "worker={} has a job in flight",
                self.nr()
            )));
        }
        let line = job.to_line()?;
        self.job_tx.write_line(&line)?;
        self.ready_since = None;
        Ok(())
    }

    /// Deliver `signal` to the worker.
    ///
    /// Returns `Ok(false)` if the process no longer exists.
    pub fn signal(&self, signal: Signal) -> Result<bool> {
        match signal::kill(self.pid, signal) {
            Ok(()) => Ok(true),
            Err(nix::errno::Errno::ESRCH) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for WorkerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRecord")
            .field("pid", &self.pid)
            .field("nr", &self.nr())
            .field("ready_since", &self.ready_since)
            .finish()
    }
}
