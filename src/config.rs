//! Supervisor settings.
//!
//! A [`Settings`] value is an immutable snapshot: the manager swaps it out
//! wholesale on reload and never edits it in place. Snapshots are built with
//! [`SettingsBuilder`], which validates every option before anything starts.
//!
//! Scalar options can also come from a TOML file ([`SettingsFile`]). Hooks
//! are code and are always installed programmatically.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::unistd::{AccessFlags, access};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{HerdError, Result};
use crate::manager::Manager;
use crate::worker::protocol::Job;
use crate::worker::{Worker, resolve_user};

/// Default worker timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Smallest timeout accepted; the heartbeat clock is too coarse below this.
pub const MIN_TIMEOUT_SECS: u64 = 3;

/// Runs in the manager just before each fork.
pub type BeforeForkHook = Arc<dyn Fn(&Manager, &Worker) -> anyhow::Result<()>>;
/// Runs in each worker just after the fork.
pub type AfterForkHook = Arc<dyn Fn(&Manager, &mut Worker) -> anyhow::Result<()>>;
/// Produces the next job, or `None` when there is nothing to do.
pub type PullJobHook = Arc<dyn Fn(&Manager) -> anyhow::Result<Option<Job>>>;
/// Executes one job in a worker; the result is logged only.
pub type ProcessJobHook = Arc<dyn Fn(&Worker, &str) -> anyhow::Result<bool>>;
/// Builds the application, in the manager (preload) or in each worker.
pub type BuildAppHook = Arc<dyn Fn() -> anyhow::Result<()>>;
/// Reopens log files after rotation.
pub type ReopenLogsHook = Arc<dyn Fn() -> anyhow::Result<()>>;

/// Identity workers switch to after forking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSpec {
    /// User name.
    pub user: String,
    /// Group name; the user's primary group when absent.
    pub group: Option<String>,
}

/// Immutable settings snapshot for one reload generation.
#[derive(Clone)]
pub struct Settings {
    worker_processes: usize,
    timeout: Duration,
    preload_app: bool,
    pid: Option<PathBuf>,
    user: Option<UserSpec>,
    working_directory: Option<PathBuf>,
    stdout_path: Option<PathBuf>,
    stderr_path: Option<PathBuf>,
    pub(crate) before_fork: BeforeForkHook,
    pub(crate) after_fork: AfterForkHook,
    pub(crate) pull_job: PullJobHook,
    pub(crate) process_job: ProcessJobHook,
    pub(crate) build_app: BuildAppHook,
    pub(crate) reopen_logs: ReopenLogsHook,
}

impl Settings {
    /// Start building a snapshot from the defaults.
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::default()
    }

    /// Desired pool size.
    pub fn worker_processes(&self) -> usize {
        self.worker_processes
    }

    /// Heartbeat silence after which a worker is killed.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the application is built once in the manager before forking.
    pub fn preload_app(&self) -> bool {
        self.preload_app
    }

    /// PID file location.
    pub fn pid(&self) -> Option<&Path> {
        self.pid.as_deref()
    }

    /// Identity workers switch to.
    pub fn user(&self) -> Option<&UserSpec> {
        self.user.as_ref()
    }

    /// Directory the manager changes into before anything else.
    pub fn working_directory(&self) -> Option<&Path> {
        self.working_directory.as_deref()
    }

    /// Where the manager's (and so every worker's) stdout goes.
    pub fn stdout_path(&self) -> Option<&Path> {
        self.stdout_path.as_deref()
    }

    /// Where stderr goes. The stderr log writer follows it.
    pub fn stderr_path(&self) -> Option<&Path> {
        self.stderr_path.as_deref()
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("worker_processes", &self.worker_processes)
            .field("timeout", &self.timeout)
            .field("preload_app", &self.preload_app)
            .field("pid", &self.pid)
            .field("user", &self.user)
            .field("working_directory", &self.working_directory)
            .field("stdout_path", &self.stdout_path)
            .field("stderr_path", &self.stderr_path)
            .finish_non_exhaustive()
    }
}

/// Validating builder for [`Settings`].
#[derive(Clone)]
pub struct SettingsBuilder {
    worker_processes: usize,
    timeout_secs: u64,
    preload_app: bool,
    pid: Option<PathBuf>,
    user: Option<UserSpec>,
    working_directory: Option<PathBuf>,
    stdout_path: Option<PathBuf>,
    stderr_path: Option<PathBuf>,
    before_fork: BeforeForkHook,
    after_fork: AfterForkHook,
    pull_job: PullJobHook,
    process_job: ProcessJobHook,
    build_app: BuildAppHook,
    reopen_logs: ReopenLogsHook,
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self {
            worker_processes: 1,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            preload_app: false,
            pid: None,
            user: None,
            working_directory: None,
            stdout_path: None,
            stderr_path: None,
            before_fork: Arc::new(|_, worker| {
                info!(worker = worker.nr(), "worker={} spawning...", worker.nr());
                Ok(())
            }),
            after_fork: Arc::new(|_, worker| {
                let pid = nix::unistd::getpid();
                info!(worker = worker.nr(), %pid, "worker={} spawned pid={}", worker.nr(), pid);
                Ok(())
            }),
            pull_job: Arc::new(|_| Ok(None)),
            process_job: Arc::new(|_, _| Ok(true)),
            build_app: Arc::new(|| Ok(())),
            reopen_logs: Arc::new(|| Ok(())),
        }
    }
}

impl SettingsBuilder {
    /// Desired number of workers (at least 1).
    pub fn worker_processes(mut self, n: usize) -> Self {
        self.worker_processes = n;
        self
    }

    /// Worker timeout in seconds (at least 3).
    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Build the application in the manager before forking.
    pub fn preload_app(mut self, preload: bool) -> Self {
        self.preload_app = preload;
        self
    }

    /// PID file location (`None` disables it).
    pub fn pid(mut self, path: Option<PathBuf>) -> Self {
        self.pid = path;
        self
    }

    /// Switch workers to `user` (and optionally `group`) after forking.
    pub fn user(mut self, user: impl Into<String>, group: Option<String>) -> Self {
        self.user = Some(UserSpec {
            user: user.into(),
            group,
        });
        self
    }

    /// Change into `dir` on start and on every reload. Relative `pid`,
    /// `stdout_path` and `stderr_path` values resolve against it.
    pub fn working_directory(mut self, dir: Option<PathBuf>) -> Self {
        self.working_directory = dir;
        self
    }

    /// Redirect stdout to this file (appending).
    pub fn stdout_path(mut self, path: Option<PathBuf>) -> Self {
        self.stdout_path = path;
        self
    }

    /// Redirect stderr to this file (appending).
    pub fn stderr_path(mut self, path: Option<PathBuf>) -> Self {
        self.stderr_path = path;
        self
    }

    /// Send stdout and stderr to `path` unless they were given explicitly.
    /// A detached manager uses `/dev/null`.
    pub fn default_io_path(mut self, path: &Path) -> Self {
        self.stdout_path.get_or_insert_with(|| path.to_path_buf());
        self.stderr_path.get_or_insert_with(|| path.to_path_buf());
        self
    }

    /// Hook run in the manager just before each fork.
    pub fn before_fork(
        mut self,
        hook: impl Fn(&Manager, &Worker) -> anyhow::Result<()> + 'static,
    ) -> Self {
        self.before_fork = Arc::new(hook);
        self
    }

    /// Hook run in each worker just after the fork.
    pub fn after_fork(
        mut self,
        hook: impl Fn(&Manager, &mut Worker) -> anyhow::Result<()> + 'static,
    ) -> Self {
        self.after_fork = Arc::new(hook);
        self
    }

    /// Job source, called in the manager whenever a worker is ready.
    pub fn pull_job(
        mut self,
        hook: impl Fn(&Manager) -> anyhow::Result<Option<Job>> + 'static,
    ) -> Self {
        self.pull_job = Arc::new(hook);
        self
    }

    /// Job executor, called in a worker with the payload text.
    pub fn process_job(
        mut self,
        hook: impl Fn(&Worker, &str) -> anyhow::Result<bool> + 'static,
    ) -> Self {
        self.process_job = Arc::new(hook);
        self
    }

    /// Application builder.
    pub fn build_app(mut self, hook: impl Fn() -> anyhow::Result<()> + 'static) -> Self {
        self.build_app = Arc::new(hook);
        self
    }

    /// Log reopening, run on the reopen-logs signal.
    pub fn reopen_logs(mut self, hook: impl Fn() -> anyhow::Result<()> + 'static) -> Self {
        self.reopen_logs = Arc::new(hook);
        self
    }

    /// Validate and freeze the snapshot.
    pub fn build(self) -> Result<Settings> {
        if self.worker_processes < 1 {
            return Err(HerdError::InvalidConfig(format!(
                "too low (< 1): worker_processes={}",
                self.worker_processes
            )));
        }
        if self.timeout_secs < MIN_TIMEOUT_SECS {
            return Err(HerdError::InvalidConfig(format!(
                "too low (< {}): timeout={}",
                MIN_TIMEOUT_SECS, self.timeout_secs
            )));
        }
        let working_directory = match self.working_directory {
            Some(dir) => Some(check_directory(&dir)?),
            None => None,
        };
        let base = working_directory.as_deref();
        let checked = |option: &str, path: Option<PathBuf>| -> Result<Option<PathBuf>> {
            path.map(|path| check_writable_path(option, base, &path))
                .transpose()
        };
        let pid = checked("pid", self.pid)?;
        let stdout_path = checked("stdout_path", self.stdout_path)?;
        let stderr_path = checked("stderr_path", self.stderr_path)?;
        if let Some(spec) = &self.user {
            resolve_user(&spec.user, spec.group.as_deref())?;
        }

        Ok(Settings {
            worker_processes: self.worker_processes,
            timeout: Duration::from_secs(self.timeout_secs),
            preload_app: self.preload_app,
            pid,
            user: self.user,
            working_directory,
            stdout_path,
            stderr_path,
            before_fork: self.before_fork,
            after_fork: self.after_fork,
            pull_job: self.pull_job,
            process_job: self.process_job,
            build_app: self.build_app,
            reopen_logs: self.reopen_logs,
        })
    }
}

/// Make `path` absolute against `base` (or the current directory) and
/// require that it or its directory is writable.
fn check_writable_path(option: &str, base: Option<&Path>, path: &Path) -> Result<PathBuf> {
    let path = match base {
        _ if path.is_absolute() => path.to_path_buf(),
        Some(dir) => dir.join(path),
        None => std::env::current_dir()?.join(path),
    };
    let dir = path.parent().unwrap_or(Path::new("/"));
    let writable = access(&path, AccessFlags::W_OK).is_ok() || access(dir, AccessFlags::W_OK).is_ok();
    if !writable {
        return Err(HerdError::InvalidConfig(format!(
            "directory for {}={} not writable",
            option,
            path.display()
        )));
    }
    Ok(path)
}

fn check_directory(dir: &Path) -> Result<PathBuf> {
    let dir = std::path::absolute(dir)?;
    if !dir.is_dir() {
        return Err(HerdError::InvalidConfig(format!(
            "working_directory={} is not a directory",
            dir.display()
        )));
    }
    Ok(dir)
}

/// Scalar options as they appear in a TOML settings file.
///
/// ```toml
/// worker_processes = 4
/// timeout = 30
/// preload_app = true
/// pid = "/run/jobherd.pid"
/// user = "nobody"
/// group = "nogroup"
/// working_directory = "/srv/app"
/// stdout_path = "log/jobherd.out"
/// stderr_path = "log/jobherd.err"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsFile {
    pub worker_processes: Option<i64>,
    pub timeout: Option<i64>,
    pub preload_app: Option<bool>,
    pub pid: Option<PathBuf>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub working_directory: Option<PathBuf>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
}

impl SettingsFile {
    /// Read and parse a settings file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            HerdError::ConfigFile(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
            .map_err(|e| HerdError::ConfigFile(format!("{}: {}", path.display(), e)))
    }

    /// Parse settings from TOML text.
    pub fn parse(text: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Overlay the options present in the file onto `builder`.
    pub fn apply(&self, mut builder: SettingsBuilder) -> Result<SettingsBuilder> {
        if let Some(n) = self.worker_processes {
            let n = usize::try_from(n).map_err(|_| {
                HerdError::InvalidConfig(format!("too low (< 1): worker_processes={}", n))
            })?;
            builder = builder.worker_processes(n);
        }
        if let Some(secs) = self.timeout {
            let secs = u64::try_from(secs).map_err(|_| {
                HerdError::InvalidConfig(format!(
                    "too low (< {}): timeout={}",
                    MIN_TIMEOUT_SECS, secs
                ))
            })?;
            builder = builder.timeout(secs);
        }
        if let Some(preload) = self.preload_app {
            builder = builder.preload_app(preload);
        }
        if let Some(pid) = &self.pid {
            builder = builder.pid(Some(pid.clone()));
        }
        if let Some(dir) = &self.working_directory {
            builder = builder.working_directory(Some(dir.clone()));
        }
        if let Some(path) = &self.stdout_path {
            builder = builder.stdout_path(Some(path.clone()));
        }
        if let Some(path) = &self.stderr_path {
            builder = builder.stderr_path(Some(path.clone()));
        }
        match (&self.user, &self.group) {
            (Some(user), group) => builder = builder.user(user.clone(), group.clone()),
            (None, Some(group)) => {
                return Err(HerdError::InvalidConfig(format!(
                    "group={} given without user",
                    group
                )));
            }
            (None, None) => {}
        }
        Ok(builder)
    }
}

/// Where a reload gets its next settings snapshot from.
pub trait SettingsSource {
    /// Human-readable origin, for logs.
    fn describe(&self) -> String;

    /// Produce a fresh, validated snapshot.
    fn load(&self) -> Result<Settings>;
}

/// Settings read from a TOML file, with hooks supplied by the application.
pub struct FileSource {
    path: PathBuf,
    customize: Box<dyn Fn(SettingsBuilder) -> SettingsBuilder>,
}

impl FileSource {
    /// Read `path` on every load; `customize` installs hooks and overrides
    /// on top of the file's options.
    ///
    /// A relative `path` is fixed against the current directory now, so a
    /// `working_directory` change does not lose the file on reload.
    pub fn new(
        path: impl Into<PathBuf>,
        customize: impl Fn(SettingsBuilder) -> SettingsBuilder + 'static,
    ) -> Self {
        let path = path.into();
        Self {
            path: std::path::absolute(&path).unwrap_or(path),
            customize: Box::new(customize),
        }
    }
}

impl SettingsSource for FileSource {
    fn describe(&self) -> String {
        format!("config_file={}", self.path.display())
    }

    fn load(&self) -> Result<Settings> {
        let file = SettingsFile::load(&self.path)?;
        let builder = file.apply(SettingsBuilder::default())?;
        (self.customize)(builder).build()
    }
}
