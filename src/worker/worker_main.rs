//! The loop a forked worker runs until it is told to quit.
//!
//! Per job the worker toggles its heartbeat, reports ready, waits for one
//! line on the job pipe, toggles, runs `process_job`, toggles again and
//! checks that its manager is still around. While waiting it wakes every
//! `timeout / 2` to toggle the heartbeat, so an idle worker never looks hung.

use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::SigSet;
use nix::unistd::{Pid, getppid};
use tracing::{debug, error, info};

use super::Worker;
use super::ipc::{LineReader, PipeFd, wait_readable};
use super::protocol::{READY_BYTE, strip_terminator};
use super::signals::{install_worker_handlers, take_reopen_request, worker_alive};
use super::spawn::{WorkerEnds, exit_immediately};
use crate::config::Settings;
use crate::error::{HerdError, Result};
use crate::manager::{Manager, set_process_name};

/// Pause after a failed round, so a persistent error cannot spin.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// What the loop does after one round.
enum Step {
    Continue,
    Exit,
}

/// Run the worker loop in a freshly forked child and exit the process.
///
/// The child arrives with every signal blocked; `mask` is restored once the
/// worker's handlers are installed. Never returns and never unwinds into the
/// caller, which is a copy of the manager's stack.
pub fn run(manager: &Manager, worker: Worker, ends: WorkerEnds, mask: SigSet) -> ! {
    let nr = worker.nr();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        worker_loop(manager, worker, ends, mask)
    }));
    let code = match outcome {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            error!(worker = nr, error = %e, "worker={} failed: {}", nr, e);
            1
        }
        Err(_) => {
            error!(worker = nr, "worker={} panicked", nr);
            1
        }
    };
    exit_immediately(code)
}

fn worker_loop(
    manager: &Manager,
    mut worker: Worker,
    ends: WorkerEnds,
    mask: SigSet,
) -> Result<()> {
    let nr = worker.nr();
    let settings = manager.settings_arc();
    let master_pid = manager.master_pid();

    install_worker_handlers()?;
    mask.thread_set_mask()?;
    set_process_name(&format!("jobherd worker[{}]", nr));
    (settings.after_fork)(manager, &mut worker).map_err(|e| HerdError::hook("after_fork", &e))?;
    if let Some(spec) = settings.user()
        && !worker.switched()
    {
        worker.switch_user(&spec.user, spec.group.as_deref())?;
    }
    if !settings.preload_app() {
        (settings.build_app)().map_err(|e| HerdError::hook("build_app", &e))?;
    }

    let mut session = Session {
        worker,
        settings: &settings,
        ready_tx: ends.ready_tx,
        jobs: LineReader::new(ends.job_rx),
        wait: settings.timeout() / 2,
        master_pid,
    };
    info!(worker = nr, "worker={} ready", nr);

    serve_until_exit(nr, ERROR_BACKOFF, || session.serve_one());
    debug!(worker = nr, "worker={} exiting", nr);
    Ok(())
}

/// Run rounds until one asks to exit or a graceful quit arrives. A failed
/// round is logged and followed by `backoff`.
fn serve_until_exit(nr: usize, backoff: Duration, mut round: impl FnMut() -> Result<Step>) {
    while worker_alive() {
        match round() {
            Ok(Step::Continue) => {}
            Ok(Step::Exit) => break,
            Err(e) => {
                if worker_alive() {
                    error!(worker = nr, error = %e, "Unhandled worker loop error: {}", e);
                    std::thread::sleep(backoff);
                }
            }
        }
    }
}

/// Everything one worker process needs between jobs.
struct Session<'a> {
    worker: Worker,
    settings: &'a Settings,
    ready_tx: PipeFd,
    jobs: LineReader,
    wait: Duration,
    master_pid: Pid,
}

impl Session<'_> {
    fn serve_one(&mut self) -> Result<Step> {
        let nr = self.worker.nr();
        self.reopen_logs_if_requested();

        self.worker.heartbeat_mut().toggle()?;
        match self.ready_tx.write_all(&[READY_BYTE]) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                info!(worker = nr, "worker={} master went away, exiting", nr);
                return Ok(Step::Exit);
            }
            Err(e) => return Err(e.into()),
        }

        if let Step::Exit = self.wait_for_job()? {
            return Ok(Step::Exit);
        }
        let Some(line) = self.jobs.read_line()? else {
            info!(worker = nr, "worker={} job pipe closed, exiting", nr);
            return Ok(Step::Exit);
        };
        let payload = strip_terminator(line);

        self.worker.heartbeat_mut().toggle()?;
        match (self.settings.process_job)(&self.worker, payload) {
            Ok(success) => debug!(worker = nr, success, "worker={} processed job", nr),
            Err(e) => error!(worker = nr, "worker={} job failed: {:#}", nr, e),
        }
        self.worker.heartbeat_mut().toggle()?;

        if !self.manager_alive() {
            return Ok(Step::Exit);
        }
        Ok(Step::Continue)
    }

    /// Block until a job line is available, toggling the heartbeat while idle.
    fn wait_for_job(&mut self) -> Result<Step> {
        loop {
            if self.jobs.has_buffered() {
                return Ok(Step::Continue);
            }
            match wait_readable(self.jobs.as_fd(), self.wait) {
                Ok(true) => return Ok(Step::Continue),
                Ok(false) => {
                    if !worker_alive() || !self.manager_alive() {
                        return Ok(Step::Exit);
                    }
                    self.worker.heartbeat_mut().toggle()?;
                }
                Err(Errno::EINTR) => {
                    if !worker_alive() {
                        return Ok(Step::Exit);
                    }
                    // Already reported ready: reopen without another report.
                    self.reopen_logs_if_requested();
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn reopen_logs_if_requested(&self) {
        if !take_reopen_request() {
            return;
        }
        let nr = self.worker.nr();
        info!(worker = nr, "worker={} reopening logs...", nr);
        if let Err(e) = (self.settings.reopen_logs)() {
            error!(worker = nr, "worker={} error reopening logs: {:#}", nr, e);
        }
        info!(worker = nr, "worker={} done reopening logs", nr);
    }

    /// Orphan check: the parent must still be the manager that forked us.
    fn manager_alive(&self) -> bool {
        if getppid() == self.master_pid {
            return true;
        }
        info!(
            worker = self.worker.nr(),
            "worker={} master PID:{} is gone, exiting",
            self.worker.nr(),
            self.master_pid
        );
        false
    }
}
