//! Command-line interface definitions using clap.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

use jobherd::logging::{LogFormat, LogRotation};

/// Pre-forking job supervisor.
#[derive(Parser, Debug)]
#[command(name = "jobherd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Log output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    pub log_format: Option<LogFormat>,

    /// Also write logs to this file.
    #[arg(long, value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,

    /// Rotation for --log-file (hourly, daily, never).
    #[arg(long, value_name = "WHEN", default_value = "never", global = true)]
    pub log_rotation: LogRotation,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the supervisor with the built-in timestamp job source.
    Run(RunArgs),

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Number of worker processes.
    #[arg(short, long, env = "JOBHERD_WORKERS")]
    pub workers: Option<usize>,

    /// Seconds of heartbeat silence before a worker is killed (min 3).
    #[arg(short, long, env = "JOBHERD_TIMEOUT")]
    pub timeout: Option<u64>,

    /// PID file location.
    #[arg(long, value_name = "PATH")]
    pub pid: Option<PathBuf>,

    /// TOML settings file, re-read on SIGHUP.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Run workers as this user.
    #[arg(long)]
    pub user: Option<String>,

    /// Run workers with this group (requires --user).
    #[arg(long, requires = "user")]
    pub group: Option<String>,

    /// Build the application once in the master before forking.
    #[arg(long)]
    pub preload: bool,

    /// Detach from the terminal once the master is running.
    #[arg(short = 'D', long)]
    pub daemonize: bool,

    /// Change into this directory before starting; relative paths resolve here.
    #[arg(long, value_name = "DIR")]
    pub working_directory: Option<PathBuf>,

    /// Redirect stdout to this file (default with --daemonize: /dev/null).
    #[arg(long, value_name = "FILE")]
    pub stdout_path: Option<PathBuf>,

    /// Redirect stderr, and the log written to it (default with --daemonize: /dev/null).
    #[arg(long, value_name = "FILE")]
    pub stderr_path: Option<PathBuf>,

    /// Append processed jobs to this file instead of logging them.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Seconds each job takes.
    #[arg(long, default_value_t = 0.0, value_name = "SECS")]
    pub job_sleep: f64,

    /// Stop producing jobs after this many.
    #[arg(long, value_name = "N")]
    pub max_jobs: Option<u64>,
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "jobherd",
            &mut std::io::stdout(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_args() {
        let cli = Cli::try_parse_from([
            "jobherd",
            "-v",
            "run",
            "--workers",
            "3",
            "--timeout",
            "5",
            "--max-jobs",
            "10",
            "--job-sleep",
            "0.5",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.workers, Some(3));
        assert_eq!(args.timeout, Some(5));
        assert_eq!(args.max_jobs, Some(10));
        assert!((args.job_sleep - 0.5).abs() < f64::EPSILON);
        assert!(!args.daemonize);
    }

    #[test]
    fn test_io_paths() {
        let cli = Cli::try_parse_from([
            "jobherd",
            "run",
            "-D",
            "--working-directory",
            "/srv/app",
            "--stderr-path",
            "log/err.log",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.daemonize);
        assert_eq!(args.working_directory, Some(PathBuf::from("/srv/app")));
        assert_eq!(args.stderr_path, Some(PathBuf::from("log/err.log")));
        assert!(args.stdout_path.is_none());
    }

    #[test]
    fn test_group_requires_user() {
        assert!(Cli::try_parse_from(["jobherd", "run", "--group", "wheel"]).is_err());
    }

    #[test]
    fn test_log_format_flag() {
        let cli = Cli::try_parse_from(["jobherd", "run", "--log-format", "json"]).unwrap();
        assert_eq!(cli.log_format, Some(LogFormat::Json));
    }

    #[test]
    fn test_log_rotation_flag() {
        let cli = Cli::try_parse_from(["jobherd", "run"]).unwrap();
        assert_eq!(cli.log_rotation, LogRotation::Never);
        let cli = Cli::try_parse_from(["jobherd", "--log-rotation", "daily", "run"]).unwrap();
        assert_eq!(cli.log_rotation, LogRotation::Daily);
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["jobherd", "-q", "-v", "run"]).is_err());
    }
}
