//! The master process.
//!
//! The [`Manager`] owns the worker pool, the signal queue and the PID file.
//! [`Manager::start`] brings up the initial pool and [`Manager::join`] runs
//! the master loop until a quit or stop signal arrives. Each iteration of the
//! loop:
//!
//! 1. reaps exited children,
//! 2. consumes at most one queued signal tag,
//! 3. with no tag pending, kills stale workers, reconciles the pool size and
//!    waits up to one tick for ready workers, forwarding one job.
//!
//! Workers are forked from inside the loop, so the manager must stay
//! single-threaded.

pub mod signals;

use std::ffi::CString;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};
use nix::sys::signal::Signal;
use nix::unistd::{ForkResult, Pid, chdir, execve, getpgrp, getpid, getppid};
use tracing::{debug, error, info, warn};

use crate::config::{Settings, SettingsSource};
use crate::error::{HerdError, Result};
use crate::launcher::{REEXEC_ENV, ReadyNotifier, redirect_io};
use crate::pidfile::PidFile;
use crate::worker::Worker;
use crate::worker::ipc::poll_timeout;
use crate::worker::pool::{Reaped, Reconcile, WorkerPool, plan_reconcile};
use crate::worker::proc::WorkerRecord;
use crate::worker::spawn::{WorkerChannels, fork_blocking_signals};
use crate::worker::watchdog::find_stale;
use crate::worker::worker_main;
use signals::{SignalPipe, SignalQueue, SignalTag};

/// Longest the master loop blocks waiting for ready workers.
pub const MASTER_TICK: Duration = Duration::from_secs(1);

/// Pause between rounds of signalling while draining the pool.
const STOP_PAUSE: Duration = Duration::from_millis(100);

/// Lifecycle of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Starting,
    Running,
    Stopping,
    Terminated,
}

/// Whether the master loop keeps going.
enum Flow {
    Continue,
    Exit,
}

/// The master supervisor.
pub struct Manager {
    settings: Arc<Settings>,
    source: Option<Box<dyn SettingsSource>>,
    worker_processes: usize,
    respawn: bool,
    pool: WorkerPool,
    queue: SignalQueue,
    signal_pipe: Option<SignalPipe>,
    pid_file: Option<PidFile>,
    master_pid: Pid,
    state: ManagerState,
    ready_notifier: Option<ReadyNotifier>,
    last_check: Instant,
    last_pull_empty: bool,
    argv: Vec<CString>,
    start_dir: Option<PathBuf>,
}

impl Manager {
    /// Create a manager for `settings`. Nothing happens until [`start`](Self::start).
    pub fn new(settings: Settings) -> Self {
        let argv = std::env::args_os()
            .filter_map(|arg| CString::new(arg.into_vec()).ok())
            .collect();
        Self {
            worker_processes: settings.worker_processes(),
            settings: Arc::new(settings),
            source: None,
            respawn: true,
            pool: WorkerPool::new(),
            queue: SignalQueue::new(),
            signal_pipe: None,
            pid_file: None,
            master_pid: getpid(),
            state: ManagerState::Starting,
            ready_notifier: None,
            last_check: Instant::now(),
            last_pull_empty: false,
            argv,
            start_dir: std::env::current_dir().ok(),
        }
    }

    /// Reload settings from `source` on the reload signal instead of re-executing.
    pub fn with_source(mut self, source: impl SettingsSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Report readiness through `notifier` once the master loop starts.
    pub fn with_ready_notifier(mut self, notifier: ReadyNotifier) -> Self {
        self.ready_notifier = Some(notifier);
        self
    }

    /// The settings snapshot currently in effect.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn settings_arc(&self) -> Arc<Settings> {
        Arc::clone(&self.settings)
    }

    /// Desired pool size, as adjusted by signals.
    pub fn worker_processes(&self) -> usize {
        self.worker_processes
    }

    /// Number of live workers.
    pub fn worker_count(&self) -> usize {
        self.pool.len()
    }

    /// PID of the manager process.
    pub fn master_pid(&self) -> Pid {
        self.master_pid
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    /// Change directory and redirect stdio as configured, claim the PID file,
    /// trap signals, preload the application if asked to, and spawn the
    /// initial pool. On failure every worker already forked is killed and
    /// reaped before the error is returned.
    pub fn start(&mut self) -> Result<()> {
        if self.state != ManagerState::Starting {
            return Err(HerdError::Worker("manager already started".to_string()));
        }
        self.master_pid = getpid();
        if let Err(e) = self.boot() {
            // Workers forked before the failure must not outlive the manager.
            self.stop(false);
            self.signal_pipe = None;
            if let Some(pid_file) = self.pid_file.take() {
                pid_file.release();
            }
            return Err(e);
        }
        self.state = ManagerState::Running;
        Ok(())
    }

    fn boot(&mut self) -> Result<()> {
        apply_process_settings(&self.settings)?;
        if let Some(path) = self.settings.pid() {
            self.pid_file = Some(PidFile::acquire(path)?);
        }
        self.signal_pipe = Some(SignalPipe::install()?);
        if self.settings.preload_app() {
            (self.settings.build_app)().map_err(|e| HerdError::hook("build_app", &e))?;
        }
        self.worker_processes = self.settings.worker_processes();
        self.maintain_worker_count()
    }

    /// Run the master loop until told to quit, then drain the pool.
    pub fn join(&mut self) -> Result<()> {
        if self.state != ManagerState::Running {
            return Err(HerdError::Worker("manager is not running".to_string()));
        }
        set_process_name("jobherd master");
        info!(pid = %self.master_pid, "master process ready");
        if let Some(notifier) = self.ready_notifier.take()
            && let Err(e) = notifier.notify(self.master_pid)
        {
            warn!(error = %e, "failed to notify the invoking process");
        }

        self.respawn = true;
        self.last_check = Instant::now();
        loop {
            match self.tick() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => break,
                Err(e) if e.is_interrupted() => {}
                Err(e) => error!(error = %e, "Unhandled master loop error: {}", e),
            }
        }

        self.state = ManagerState::Stopping;
        self.stop(true);
        info!("master complete");
        if let Some(pid_file) = self.pid_file.take() {
            pid_file.release();
        }
        self.state = ManagerState::Terminated;
        Ok(())
    }

    fn tick(&mut self) -> Result<Flow> {
        self.reap_all_workers();
        self.drain_signals();

        match self.queue.pop() {
            None => {
                if self.last_check.elapsed() > self.settings.timeout() {
                    self.last_check = Instant::now();
                    self.murder_lazy_workers();
                }
                if self.respawn {
                    self.maintain_worker_count()?;
                }
                self.master_poll(MASTER_TICK)?;
            }
            Some(SignalTag::GracefulQuit) => {
                info!("graceful quit requested");
                return Ok(Flow::Exit);
            }
            Some(SignalTag::ImmediateStop) => {
                info!("immediate stop requested");
                self.stop(false);
                return Ok(Flow::Exit);
            }
            Some(SignalTag::ReopenLogs) => {
                info!("master reopening logs...");
                self.reopen_logs();
                info!("master done reopening logs");
                self.pool.kill_each_worker(Signal::SIGUSR1);
            }
            Some(SignalTag::ResizeDown) => {
                if is_daemonized() {
                    self.respawn = false;
                    info!("gracefully stopping all workers");
                    self.pool.kill_each_worker(Signal::SIGQUIT);
                    self.worker_processes = 0;
                } else {
                    info!("SIGWINCH ignored because we're not daemonized");
                }
            }
            Some(SignalTag::Increment) => {
                self.respawn = true;
                self.worker_processes += 1;
                info!(worker_processes = self.worker_processes, "worker_processes incremented");
            }
            Some(SignalTag::Decrement) => {
                self.worker_processes = self.worker_processes.saturating_sub(1);
                info!(worker_processes = self.worker_processes, "worker_processes decremented");
            }
            Some(SignalTag::Reload) => {
                self.respawn = true;
                if self.source.is_some() {
                    self.reload();
                } else {
                    info!("config_file not present, reexecuting binary");
                    self.reexec()?;
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn drain_signals(&mut self) {
        if let Some(pipe) = self.signal_pipe.as_mut()
            && let Err(e) = pipe.drain(&mut self.queue)
        {
            warn!(error = %e, "failed to read signal pipe");
        }
    }

    /// Wait up to `tick` for readiness reports or signals, then hand one job
    /// to the worker that has been ready longest.
    fn master_poll(&mut self, tick: Duration) -> Result<()> {
        let timeout = if self.pool.has_ready() && !self.last_pull_empty {
            Duration::ZERO
        } else {
            tick
        };

        let (signalled, readable) = {
            let mut fds = Vec::with_capacity(self.pool.len() + 1);
            let mut pids = Vec::with_capacity(self.pool.len());
            if let Some(pipe) = &self.signal_pipe {
                fds.push(PollFd::new(pipe.as_fd(), PollFlags::POLLIN));
            }
            let offset = fds.len();
            for record in self.pool.iter() {
                fds.push(PollFd::new(record.ready_fd(), PollFlags::POLLIN));
                pids.push(record.pid());
            }

            match poll(&mut fds, poll_timeout(timeout)) {
                Ok(_) => {}
                Err(Errno::EINTR) => return Ok(()),
                Err(e) => return Err(e.into()),
            }

            let woke = |fd: &PollFd<'_>| {
                fd.revents().is_some_and(|r| {
                    r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                })
            };
            let signalled = offset > 0 && woke(&fds[0]);
            let readable: Vec<Pid> = fds[offset..]
                .iter()
                .zip(pids)
                .filter(|(fd, _)| woke(fd))
                .map(|(_, pid)| pid)
                .collect();
            (signalled, readable)
        };

        if signalled {
            self.drain_signals();
        }
        if !readable.is_empty() {
            self.last_pull_empty = false;
        }
        for pid in readable {
            self.pool.collect_ready(pid);
        }
        self.dispatch_one();
        Ok(())
    }

    /// Pull one job and forward it to the longest-waiting ready worker.
    fn dispatch_one(&mut self) {
        if !self.pool.has_ready() {
            return;
        }
        let pull_job = Arc::clone(&self.settings.pull_job);
        let job = match pull_job(self) {
            Ok(Some(job)) => job,
            Ok(None) => {
                self.last_pull_empty = true;
                return;
            }
            Err(e) => {
                self.last_pull_empty = true;
                error!("Unhandled master poll error: {:#}", e);
                return;
            }
        };
        self.last_pull_empty = false;

        let Some(record) = self.pool.longest_ready() else {
            return;
        };
        let (nr, pid) = (record.nr(), record.pid());
        match record.dispatch(&job) {
            Ok(()) => debug!(worker = nr, %pid, job = %job, "dispatched job"),
            Err(e) => error!(worker = nr, %pid, error = %e, "failed to dispatch job"),
        }
    }

    /// Converge the pool on the desired worker count.
    pub fn maintain_worker_count(&mut self) -> Result<()> {
        match plan_reconcile(&self.pool.ordinals(), self.worker_processes) {
            Reconcile::Steady => Ok(()),
            Reconcile::Spawn(ordinals) => {
                for nr in ordinals {
                    self.spawn_worker(Worker::new(nr)?)?;
                }
                Ok(())
            }
            Reconcile::Retire(pids) => {
                for pid in pids {
                    self.pool.kill_worker(pid, Signal::SIGQUIT);
                }
                Ok(())
            }
        }
    }

    fn spawn_worker(&mut self, worker: Worker) -> Result<()> {
        let before_fork = Arc::clone(&self.settings.before_fork);
        before_fork(self, &worker).map_err(|e| HerdError::hook("before_fork", &e))?;

        let (manager_ends, worker_ends) = WorkerChannels::new()?.split();
        // Safety: the manager never starts threads.
        match unsafe { fork_blocking_signals() }? {
            (ForkResult::Child, mask) => {
                drop(manager_ends);
                self.become_worker();
                worker_main::run(self, worker, worker_ends, mask)
            }
            (ForkResult::Parent { child }, _) => {
                drop(worker_ends);
                debug!(worker = worker.nr(), pid = %child, "forked worker");
                self.pool.insert(WorkerRecord::new(child, worker, manager_ends));
                Ok(())
            }
        }
    }

    /// Shed the manager-only state a freshly forked worker inherited.
    fn become_worker(&mut self) {
        self.pool.forget_inherited();
        self.queue.clear();
        if let Some(pipe) = self.signal_pipe.take() {
            pipe.close_inherited();
        }
        self.ready_notifier = None;
        self.pid_file = None;
    }

    /// Kill every worker whose heartbeat has been silent for longer than the timeout.
    fn murder_lazy_workers(&mut self) {
        let timeout = self.settings.timeout();
        for stale in find_stale(&self.pool, timeout, SystemTime::now()) {
            error!(
                worker = stale.nr,
                pid = %stale.pid,
                "worker={} PID:{} timeout ({:.3}s > {}s), killing",
                stale.nr,
                stale.pid,
                stale.silent_for.as_secs_f64(),
                timeout.as_secs()
            );
            self.pool.kill_worker(stale.pid, Signal::SIGKILL);
        }
    }

    fn reap_all_workers(&mut self) {
        for reaped in self.pool.reap_all() {
            log_reaped(&reaped);
        }
    }

    /// Drain the pool: quit (or terminate) workers until none are left or
    /// the timeout passes, then kill and reap any survivors.
    pub fn stop(&mut self, graceful: bool) {
        let deadline = Instant::now() + self.settings.timeout();
        let signal = if graceful {
            Signal::SIGQUIT
        } else {
            Signal::SIGTERM
        };
        while !self.pool.is_empty() && Instant::now() <= deadline {
            self.pool.kill_each_worker(signal);
            std::thread::sleep(STOP_PAUSE);
            self.reap_all_workers();
        }

        let survivors: Vec<Pid> = self.pool.iter().map(WorkerRecord::pid).collect();
        for pid in survivors {
            warn!(%pid, "worker did not stop in time, killing");
            self.pool.kill_worker(pid, Signal::SIGKILL);
            if let Some(reaped) = self.pool.reap_blocking(pid) {
                log_reaped(&reaped);
            }
        }
    }

    /// Re-read the settings source and replace every worker under the new settings.
    ///
    /// A failed load or commit is logged and the previous settings stay in effect.
    pub fn reload(&mut self) {
        let Some(source) = self.source.as_ref() else {
            return;
        };
        let origin = source.describe();
        info!("reloading {}", origin);
        let loaded = source.load();
        match loaded.and_then(|settings| self.commit(settings)) {
            Ok(()) => {
                self.pool.kill_each_worker(Signal::SIGQUIT);
                self.reopen_logs();
                info!("done reloading {}", origin);
            }
            Err(e) => error!(error = %e, "error reloading {}: {}", origin, e),
        }
    }

    /// Make `settings` the snapshot in effect, moving the PID file if its path changed.
    fn commit(&mut self, settings: Settings) -> Result<()> {
        apply_process_settings(&settings)?;
        let current = self.pid_file.as_ref().map(|p| p.path().to_path_buf());
        if settings.pid().map(Path::to_path_buf) != current {
            let acquired = settings.pid().map(PidFile::acquire).transpose()?;
            if let Some(old) = self.pid_file.take() {
                old.release();
            }
            self.pid_file = acquired;
        }
        self.worker_processes = settings.worker_processes();
        self.settings = Arc::new(settings);
        Ok(())
    }

    fn reopen_logs(&self) {
        if let Err(e) = (self.settings.reopen_logs)() {
            error!("error reopening logs: {:#}", e);
        }
    }

    /// Drain the pool and replace this process image with a fresh copy of
    /// the running executable. Returns only if the exec fails.
    pub fn reexec(&mut self) -> Result<()> {
        self.stop(true);

        let exe = std::env::current_exe()?;
        let path = CString::new(exe.clone().into_os_string().into_vec())
            .map_err(|_| HerdError::Worker(format!("bad executable path: {}", exe.display())))?;
        let mut env: Vec<CString> = std::env::vars_os()
            .filter(|(key, _)| key != REEXEC_ENV)
            .filter_map(|(key, value)| {
                let mut entry = key.into_vec();
                entry.push(b'=');
                entry.extend(value.into_vec());
                CString::new(entry).ok()
            })
            .collect();
        env.extend(CString::new(format!("{}=1", REEXEC_ENV)).ok());

        // Relative arguments were given against the original directory.
        if let Some(dir) = &self.start_dir {
            chdir(dir.as_path())?;
        }
        info!(exe = %exe.display(), "reexecuting");
        match execve(&path, &self.argv, &env) {
            Ok(never) => match never {},
            Err(e) => {
                error!(error = %e, "reexec failed, continuing with the current image");
                Err(e.into())
            }
        }
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("state", &self.state)
            .field("master_pid", &self.master_pid)
            .field("worker_processes", &self.worker_processes)
            .field("workers", &self.pool.len())
            .field("pending_signals", &self.queue.len())
            .finish_non_exhaustive()
    }
}

/// Start a manager for `settings` and run it until it quits.
pub fn run(settings: Settings) -> Result<()> {
    let mut manager = Manager::new(settings);
    manager.start()?;
    manager.join()
}

/// Change into the working directory and redirect stdio, as `settings` ask.
fn apply_process_settings(settings: &Settings) -> Result<()> {
    if let Some(dir) = settings.working_directory() {
        chdir(dir)?;
    }
    redirect_io(settings.stdout_path(), settings.stderr_path())
}

/// Detached from the terminal: orphaned to init, or not a process-group leader.
fn is_daemonized() -> bool {
    getppid() == Pid::from_raw(1) || getpgrp() != getpid()
}

fn log_reaped(reaped: &Reaped) {
    let nr = reaped
        .nr
        .map_or_else(|| "unknown".to_string(), |nr| nr.to_string());
    if reaped.reason.is_success() {
        info!(pid = %reaped.pid, "reaped {} worker={}", reaped.reason, nr);
    } else {
        error!(pid = %reaped.pid, "reaped {} worker={}", reaped.reason, nr);
    }
}

/// Name the process as it shows up in `ps -o comm` and `top`.
#[cfg(target_os = "linux")]
pub(crate) fn set_process_name(name: &str) {
    if let Ok(name) = CString::new(name)
        && let Err(e) = nix::sys::prctl::set_name(&name)
    {
        debug!(error = %e, "failed to set process name");
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_process_name(_name: &str) {}
