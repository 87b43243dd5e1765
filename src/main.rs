//! jobherd - pre-forking job supervisor

mod cli;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use tracing::info;

use cli::{Cli, Commands, RunArgs};
use jobherd::logging::{self, LogConfig};
use jobherd::{FileSource, Job, Manager, Settings, SettingsBuilder, launcher};

fn main() {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(&cli, args),
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Logging from the global flags; -v and -q win over the environment.
fn log_config(cli: &Cli) -> LogConfig {
    let mut config = LogConfig::default();
    if cli.quiet {
        config = config.with_filter("warn".to_string());
    } else if cli.verbose == 1 {
        config = config.with_filter("debug".to_string());
    } else if cli.verbose >= 2 {
        config = config.with_filter("trace".to_string());
    }
    config = config.with_env_overrides();
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    if let Some(path) = &cli.log_file {
        config = config.with_file(path.clone());
    }
    config.with_rotation(cli.log_rotation)
}

fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<()> {
    // A re-executed manager is already detached.
    let notifier = if args.daemonize && !launcher::is_reexec() {
        Some(launcher::daemonize().context("failed to daemonize")?)
    } else {
        None
    };
    logging::init(log_config(cli)).context("failed to set up logging")?;

    let demo = Arc::new(DemoApp::new(args));
    let overrides = Overrides::new(args);
    let customize = move |builder: SettingsBuilder| overrides.apply(demo.install(builder));

    let mut manager = match &args.config {
        Some(path) => {
            let source = FileSource::new(path, customize);
            let settings = jobherd::SettingsSource::load(&source)
                .with_context(|| format!("failed to load {}", path.display()))?;
            Manager::new(settings).with_source(source)
        }
        None => Manager::new(customize(Settings::builder()).build()?),
    };
    if let Some(notifier) = notifier {
        manager = manager.with_ready_notifier(notifier);
    }

    manager.start()?;
    manager.join()?;
    Ok(())
}

/// Command-line settings, applied on top of the settings file at every load.
#[derive(Debug, Clone)]
struct Overrides {
    workers: Option<usize>,
    timeout: Option<u64>,
    pid: Option<PathBuf>,
    user: Option<(String, Option<String>)>,
    preload: bool,
    working_directory: Option<PathBuf>,
    stdout_path: Option<PathBuf>,
    stderr_path: Option<PathBuf>,
    daemonized: bool,
}

impl Overrides {
    fn new(args: &RunArgs) -> Self {
        Self {
            workers: args.workers,
            timeout: args.timeout,
            pid: args.pid.clone(),
            user: args.user.clone().map(|user| (user, args.group.clone())),
            preload: args.preload,
            working_directory: args.working_directory.clone(),
            stdout_path: args.stdout_path.clone(),
            stderr_path: args.stderr_path.clone(),
            daemonized: args.daemonize,
        }
    }

    fn apply(&self, mut builder: SettingsBuilder) -> SettingsBuilder {
        if let Some(n) = self.workers {
            builder = builder.worker_processes(n);
        }
        if let Some(secs) = self.timeout {
            builder = builder.timeout(secs);
        }
        if let Some(pid) = &self.pid {
            builder = builder.pid(Some(pid.clone()));
        }
        if let Some((user, group)) = &self.user {
            builder = builder.user(user.clone(), group.clone());
        }
        if self.preload {
            builder = builder.preload_app(true);
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
        if self.daemonized {
            builder = builder.default_io_path(Path::new("/dev/null"));
        }
        builder
    }
}

/// The built-in application: produces numbered timestamps and records which
/// worker processed each one.
#[derive(Debug)]
struct DemoApp {
    produced: AtomicU64,
    max_jobs: Option<u64>,
    output: Option<PathBuf>,
    job_sleep: Duration,
}

impl DemoApp {
    fn new(args: &RunArgs) -> Self {
        Self {
            produced: AtomicU64::new(0),
            max_jobs: args.max_jobs,
            output: args.output.clone(),
            job_sleep: Duration::try_from_secs_f64(args.job_sleep).unwrap_or_default(),
        }
    }

    fn install(self: &Arc<Self>, builder: SettingsBuilder) -> SettingsBuilder {
        let producer = Arc::clone(self);
        let consumer = Arc::clone(self);
        builder
            .pull_job(move |_| Ok(producer.next_job()))
            .process_job(move |worker, payload| consumer.process(worker.nr(), payload))
            .build_app(|| {
                info!(pid = %nix::unistd::getpid(), "application built");
                Ok(())
            })
            .reopen_logs(|| logging::reopen().context("failed to reopen log file"))
    }

    fn next_job(&self) -> Option<Job> {
        if let Some(max) = self.max_jobs
            && self.produced.load(Ordering::Relaxed) >= max
        {
            return None;
        }
        let seq = self.produced.fetch_add(1, Ordering::Relaxed) + 1;
        Some(Job::text(format!("{} {}", seq, chrono::Utc::now().to_rfc3339())))
    }

    fn process(&self, nr: usize, payload: &str) -> Result<bool> {
        let pid = nix::unistd::getpid();
        match &self.output {
            Some(path) => {
                let line = format!("worker={} pid={} job={}\n", nr, pid, payload);
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("failed to open {}", path.display()))?;
                file.write_all(line.as_bytes())
                    .with_context(|| format!("failed to write {}", path.display()))?;
            }
            None => info!(worker = nr, %pid, "worker={} job={}", nr, payload),
        }
        if !self.job_sleep.is_zero() {
            std::thread::sleep(self.job_sleep);
        }
        Ok(true)
    }
}
