//! Integration tests for the jobherd binary.
//!
//! These tests run real master processes, fork real workers and drive them
//! with signals, reading the master's stderr log to observe what happened.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use assert_cmd::Command;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use predicates::prelude::*;
use tempfile::{TempDir, tempdir};

/// Get a command for the jobherd binary.
fn jobherd() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("jobherd").unwrap()
}

/// Poll `check` until it holds or `timeout` passes.
fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    check()
}

/// A master process running in the background, logging to a file.
struct Herd {
    child: Child,
    log: PathBuf,
    dir: TempDir,
}

impl Herd {
    fn spawn(args: &[&str]) -> Self {
        Self::spawn_in(tempdir().unwrap(), args)
    }

    fn spawn_in(dir: TempDir, args: &[&str]) -> Self {
        let log = dir.path().join("master.log");
        let stderr = File::create(&log).unwrap();
        let child = std::process::Command::new(env!("CARGO_BIN_EXE_jobherd"))
            .arg("run")
            .args(args)
            .env("JOBHERD_LOG_FORMAT", "compact")
            .env_remove("JOBHERD_LOG")
            .env_remove("RUST_LOG")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr)
            .spawn()
            .unwrap();
        Self { child, log, dir }
    }

    fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn log(&self) -> String {
        fs::read_to_string(&self.log).unwrap_or_default()
    }

    fn count(&self, needle: &str) -> usize {
        self.log().matches(needle).count()
    }

    /// Wait for `needle` to appear at least `times` times in the log.
    fn expect_log(&self, needle: &str, times: usize, timeout: Duration) {
        let seen = wait_until(timeout, || self.count(needle) >= times);
        assert!(
            seen,
            "expected {:?} {} time(s) in log:\n{}",
            needle,
            times,
            self.log()
        );
    }

    fn signal(&self, signal: Signal) {
        kill(self.pid(), signal).unwrap();
    }

    fn wait_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                return Some(status);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for Herd {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = kill(self.pid(), Signal::SIGTERM);
            if self.wait_exit(Duration::from_secs(5)).is_none() {
                let _ = self.child.kill();
                let _ = self.child.wait();
            }
        }
    }
}

fn worker_ids(output: &Path) -> Vec<String> {
    fs::read_to_string(output)
        .unwrap_or_default()
        .lines()
        .filter_map(|line| line.split_whitespace().next().map(str::to_string))
        .collect()
}

/// PID a worker logged when it came up ("worker=N spawned pid=P").
fn spawned_pid(log: &str, nr: usize) -> Option<Pid> {
    let needle = format!("worker={} spawned pid=", nr);
    let rest = &log[log.find(&needle)? + needle.len()..];
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok().map(Pid::from_raw)
}

const STARTUP: Duration = Duration::from_secs(10);

// =============================================================================
// Command-line surface
// =============================================================================

#[test]
fn test_help() {
    jobherd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Pre-forking job supervisor"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("completions"));
}

#[test]
fn test_run_help_lists_options() {
    jobherd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--workers"))
        .stdout(predicate::str::contains("--timeout"))
        .stdout(predicate::str::contains("--daemonize"));
}

#[test]
fn test_version() {
    jobherd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("jobherd"));
}

#[test]
fn test_completions_bash() {
    jobherd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("jobherd"));
}

#[test]
fn test_rejects_short_timeout() {
    jobherd()
        .args(["run", "--timeout", "2"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("timeout=2"));
}

#[test]
fn test_rejects_zero_workers() {
    jobherd()
        .args(["run", "--workers", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("worker_processes=0"));
}

#[test]
fn test_rejects_broken_settings_file() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("jobherd.toml");
    fs::write(&config, "listen = \"0.0.0.0:80\"\n").unwrap();
    jobherd()
        .args(["run", "--config", config.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

// =============================================================================
// PID file
// =============================================================================

#[test]
fn test_pid_file_conflict_refuses_to_start() {
    let dir = tempdir().unwrap();
    let pid = dir.path().join("jobherd.pid");
    // The test runner itself is a live process that is not the new master.
    fs::write(&pid, format!("{}\n", std::process::id())).unwrap();

    jobherd()
        .args(["run", "--pid", pid.to_str().unwrap()])
        .timeout(Duration::from_secs(10))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Already running on PID"))
        .stderr(predicate::str::contains("spawning").not());

    assert_eq!(
        fs::read_to_string(&pid).unwrap(),
        format!("{}\n", std::process::id())
    );
}

#[test]
fn test_stale_pid_file_is_replaced_and_removed_on_quit() {
    let dir = tempdir().unwrap();
    let pid = dir.path().join("jobherd.pid");
    let mut dead = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = dead.id();
    dead.wait().unwrap();
    fs::write(&pid, format!("{}\n", dead_pid)).unwrap();

    let mut herd = Herd::spawn_in(dir, &["--pid", pid.to_str().unwrap()]);
    herd.expect_log("master process ready", 1, STARTUP);
    assert_eq!(
        fs::read_to_string(&pid).unwrap(),
        format!("{}\n", herd.pid())
    );

    herd.signal(Signal::SIGQUIT);
    let status = herd.wait_exit(Duration::from_secs(10)).expect("master exits");
    assert!(status.success());
    assert!(!pid.exists());
}

// =============================================================================
// Pool lifecycle
// =============================================================================

#[test]
fn test_jobs_go_to_distinct_workers() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("jobs.out");
    let herd = Herd::spawn_in(
        dir,
        &[
            "--workers",
            "2",
            "--timeout",
            "3",
            "--max-jobs",
            "2",
            "--job-sleep",
            "2",
            "--output",
            output.to_str().unwrap(),
        ],
    );

    let done = wait_until(STARTUP, || worker_ids(&output).len() >= 2);
    assert!(done, "jobs not processed:\n{}", herd.log());

    let mut ids = worker_ids(&output);
    ids.sort();
    ids.dedup();
    assert_eq!(ids, vec!["worker=0".to_string(), "worker=1".to_string()]);

    let content = fs::read_to_string(&output).unwrap();
    assert!(content.contains("job=1 "));
    assert!(content.contains("job=2 "));
}

#[test]
fn test_graceful_quit_drains_and_logs_completion() {
    let mut herd = Herd::spawn(&["--workers", "2"]);
    herd.expect_log("worker=0 ready", 1, STARTUP);
    herd.expect_log("worker=1 ready", 1, STARTUP);

    herd.signal(Signal::SIGQUIT);
    let status = herd.wait_exit(Duration::from_secs(10)).expect("master exits");
    assert!(status.success());

    let log = herd.log();
    assert!(log.contains("master complete"), "log:\n{}", log);
    assert!(log.contains("reaped exited with code 0 worker=0"), "log:\n{}", log);
    assert!(log.contains("reaped exited with code 0 worker=1"), "log:\n{}", log);
}

#[test]
fn test_terminate_does_not_wait_for_jobs() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("jobs.out");
    let mut herd = Herd::spawn_in(
        dir,
        &[
            "--workers",
            "2",
            "--timeout",
            "60",
            "--max-jobs",
            "2",
            "--job-sleep",
            "30",
            "--output",
            output.to_str().unwrap(),
        ],
    );
    let busy = wait_until(STARTUP, || worker_ids(&output).len() >= 2);
    assert!(busy, "workers never got jobs:\n{}", herd.log());

    let sent = Instant::now();
    herd.signal(Signal::SIGTERM);
    let status = herd.wait_exit(Duration::from_secs(10)).expect("master exits");
    assert!(status.success());
    assert!(sent.elapsed() < Duration::from_secs(5));
    assert!(herd.log().contains("master complete"));
}

#[test]
fn test_increment_and_decrement_workers() {
    let herd = Herd::spawn(&["--workers", "1"]);
    herd.expect_log("worker=0 ready", 1, STARTUP);

    herd.signal(Signal::SIGTTIN);
    herd.expect_log("worker=1 ready", 1, STARTUP);
    herd.signal(Signal::SIGTTIN);
    herd.expect_log("worker=2 ready", 1, STARTUP);

    herd.signal(Signal::SIGTTOU);
    herd.expect_log("reaped exited with code 0 worker=2", 1, STARTUP);

    // Worker 1 keeps running; nothing else was retired.
    assert_eq!(herd.count("reaped exited with code 0 worker=1"), 0);
}

#[test]
fn test_decrement_stops_at_zero() {
    let herd = Herd::spawn(&["--workers", "1"]);
    herd.expect_log("worker=0 ready", 1, STARTUP);

    herd.signal(Signal::SIGTTOU);
    herd.expect_log("reaped exited with code 0 worker=0", 1, STARTUP);
    herd.signal(Signal::SIGTTOU);
    herd.expect_log("worker_processes decremented", 2, STARTUP);

    // One increment from zero brings back exactly one worker.
    herd.signal(Signal::SIGTTIN);
    herd.expect_log("worker=0 ready", 2, STARTUP);
    std::thread::sleep(Duration::from_secs(2));
    assert_eq!(herd.count("worker=1 ready"), 0);
}

#[test]
fn test_hung_worker_is_killed_and_replaced() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("jobs.out");
    let herd = Herd::spawn_in(
        dir,
        &[
            "--workers",
            "1",
            "--timeout",
            "3",
            "--max-jobs",
            "1",
            "--job-sleep",
            "60",
            "--output",
            output.to_str().unwrap(),
        ],
    );

    herd.expect_log("worker=0 ready", 1, STARTUP);
    herd.expect_log("timeout (", 1, Duration::from_secs(20));
    herd.expect_log("killed by signal SIGKILL worker=0", 1, Duration::from_secs(5));
    herd.expect_log("worker=0 ready", 2, STARTUP);
}

#[test]
fn test_idle_workers_are_not_killed() {
    let herd = Herd::spawn(&["--workers", "1", "--timeout", "3", "--max-jobs", "0"]);
    herd.expect_log("worker=0 ready", 1, STARTUP);
    std::thread::sleep(Duration::from_secs(8));
    assert_eq!(herd.count("timeout ("), 0, "log:\n{}", herd.log());
    assert_eq!(herd.count("worker=0 ready"), 1);
}

#[test]
fn test_reopen_logs_reaches_workers() {
    let herd = Herd::spawn(&["--workers", "1"]);
    herd.expect_log("worker=0 ready", 1, STARTUP);
    herd.signal(Signal::SIGUSR1);
    herd.expect_log("master done reopening logs", 1, STARTUP);
    herd.expect_log("worker=0 done reopening logs", 1, STARTUP);
}

#[test]
fn test_resize_down_when_not_group_leader() {
    let herd = Herd::spawn(&["--workers", "1"]);
    herd.expect_log("worker=0 ready", 1, STARTUP);
    herd.signal(Signal::SIGWINCH);
    // The master shares the test runner's process group, so it is not a
    // group leader and counts as detached.
    herd.expect_log("gracefully stopping all workers", 1, STARTUP);
    herd.expect_log("reaped exited with code 0 worker=0", 1, STARTUP);
}

#[cfg(target_os = "linux")]
#[test]
fn test_workers_close_each_others_descriptors() {
    let herd = Herd::spawn(&["--workers", "2", "--max-jobs", "0"]);
    herd.expect_log("worker=0 ready", 1, STARTUP);
    herd.expect_log("worker=1 ready", 1, STARTUP);

    let log = herd.log();
    let open_fds = |nr: usize| {
        let pid = spawned_pid(&log, nr).expect("worker logged its pid");
        fs::read_dir(format!("/proc/{}/fd", pid)).unwrap().count()
    };
    // Worker 1 was forked while the manager held worker 0's pipes and
    // heartbeat; it must have closed them, leaving it with no more than
    // worker 0.
    assert_eq!(open_fds(0), open_fds(1), "log:\n{}", log);
}

#[test]
fn test_workers_switch_to_unprivileged_user() {
    if !nix::unistd::getuid().is_root()
        || nix::unistd::User::from_name("nobody").ok().flatten().is_none()
    {
        return;
    }
    let herd = Herd::spawn(&[
        "--workers",
        "1",
        "--timeout",
        "3",
        "--user",
        "nobody",
        "--max-jobs",
        "2",
    ]);
    herd.expect_log("worker=0 ready", 1, STARTUP);
    herd.expect_log("job=2 ", 1, STARTUP);

    // The worker keeps its heartbeat going as nobody: no errors, no kills.
    std::thread::sleep(Duration::from_secs(5));
    assert_eq!(herd.count("Unhandled worker loop error"), 0, "log:\n{}", herd.log());
    assert_eq!(herd.count("timeout ("), 0, "log:\n{}", herd.log());
    assert_eq!(herd.count("worker=0 ready"), 1);
}

// =============================================================================
// Process environment
// =============================================================================

#[test]
fn test_working_directory_and_stderr_path() {
    let dir = tempdir().unwrap();
    let app = dir.path().join("app");
    fs::create_dir(&app).unwrap();
    let herd = Herd::spawn_in(
        dir,
        &[
            "--working-directory",
            app.to_str().unwrap(),
            "--pid",
            "jobherd.pid",
            "--stderr-path",
            "jobherd.err",
            "--max-jobs",
            "1",
            "--output",
            "jobs.out",
        ],
    );

    let err_log = app.join("jobherd.err");
    let ready = wait_until(STARTUP, || {
        fs::read_to_string(&err_log)
            .unwrap_or_default()
            .contains("master process ready")
    });
    assert!(ready, "master log:\n{}", herd.log());
    assert!(!herd.log().contains("master process ready"));
    assert_eq!(
        fs::read_to_string(app.join("jobherd.pid")).unwrap(),
        format!("{}\n", herd.pid())
    );
    // The job output path resolved against the working directory too.
    assert!(wait_until(STARTUP, || !worker_ids(&app.join("jobs.out")).is_empty()));
}

#[test]
fn test_daemonize_hands_off_and_redirects_output() {
    let dir = tempdir().unwrap();
    let pid = dir.path().join("jobherd.pid");
    let err_log = dir.path().join("jobherd.err");

    jobherd()
        .args([
            "run",
            "--daemonize",
            "--pid",
            pid.to_str().unwrap(),
            "--stderr-path",
            err_log.to_str().unwrap(),
            "--max-jobs",
            "0",
        ])
        .env("JOBHERD_LOG_FORMAT", "compact")
        .timeout(Duration::from_secs(20))
        .assert()
        .success()
        .stderr(predicate::str::contains("master process ready").not());

    // The invoker only exits once the manager is up, so the PID file is there.
    let master: i32 = fs::read_to_string(&pid).unwrap().trim().parse().unwrap();
    let master = Pid::from_raw(master);
    assert_ne!(master.as_raw(), std::process::id() as i32);
    assert!(fs::read_to_string(&err_log).unwrap().contains("master process ready"));

    kill(master, Signal::SIGQUIT).unwrap();
    assert!(wait_until(Duration::from_secs(10), || !pid.exists()));
    assert!(wait_until(Duration::from_secs(5), || {
        fs::read_to_string(&err_log)
            .unwrap_or_default()
            .contains("master complete")
    }));
}

// =============================================================================
// Reload
// =============================================================================

#[test]
fn test_reload_applies_new_settings_file() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("jobherd.toml");
    fs::write(&config, "worker_processes = 1\ntimeout = 10\n").unwrap();
    let herd = Herd::spawn_in(dir, &["--config", config.to_str().unwrap()]);
    herd.expect_log("worker=0 ready", 1, STARTUP);

    fs::write(herd.path("jobherd.toml"), "worker_processes = 2\ntimeout = 10\n").unwrap();
    herd.signal(Signal::SIGHUP);
    herd.expect_log("done reloading", 1, STARTUP);
    herd.expect_log("worker=1 ready", 1, STARTUP);
    // The old worker was replaced as well.
    herd.expect_log("worker=0 ready", 2, STARTUP);
}

#[test]
fn test_failed_reload_keeps_running() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("jobherd.toml");
    fs::write(&config, "worker_processes = 1\n").unwrap();
    let herd = Herd::spawn_in(dir, &["--config", config.to_str().unwrap()]);
    herd.expect_log("worker=0 ready", 1, STARTUP);

    fs::write(herd.path("jobherd.toml"), "worker_processes = 0\n").unwrap();
    herd.signal(Signal::SIGHUP);
    herd.expect_log("error reloading", 1, STARTUP);
    assert_eq!(herd.count("worker=0 ready"), 1);
    assert_eq!(herd.count("reaped"), 0);
}

#[test]
fn test_reload_without_settings_file_reexecutes() {
    let dir = tempdir().unwrap();
    let pid = dir.path().join("jobherd.pid");
    let mut herd = Herd::spawn_in(dir, &["--pid", pid.to_str().unwrap()]);
    herd.expect_log("master process ready", 1, STARTUP);

    herd.signal(Signal::SIGHUP);
    herd.expect_log("reexecuting", 1, STARTUP);
    herd.expect_log("master process ready", 2, STARTUP);
    // Same process, same PID file.
    assert_eq!(
        fs::read_to_string(&pid).unwrap(),
        format!("{}\n", herd.pid())
    );

    herd.signal(Signal::SIGQUIT);
    assert!(herd.wait_exit(Duration::from_secs(10)).is_some());
    assert!(!pid.exists());
}
