//! Detaching the manager from the invoking terminal.
//!
//! ```text
//! invoker      reads the ready pipe, exits 0 once the manager reports in
//!  \_ session  setsid(), exits right away
//!      \_ manager  writes its PID to the ready pipe from `Manager::join`
//! ```

use std::io::{Read, Write};
use std::os::unix::io::OwnedFd;
use std::path::Path;

use nix::fcntl::{OFlag, open};
use nix::sys::stat::Mode;
use nix::unistd::{ForkResult, Pid, dup2_stderr, dup2_stdin, dup2_stdout, setsid};

use crate::error::Result;
use crate::worker::ipc::PipeFd;
use crate::worker::spawn::{exit_immediately, fork_process};

/// Set in the environment of a re-executed manager, which is already detached.
pub const REEXEC_ENV: &str = "JOBHERD_REEXEC";

/// Whether this process image was started by a manager re-executing itself.
pub fn is_reexec() -> bool {
    std::env::var_os(REEXEC_ENV).is_some()
}

/// The manager's end of the readiness handoff to the invoking process.
#[derive(Debug)]
pub struct ReadyNotifier {
    tx: PipeFd,
}

impl ReadyNotifier {
    /// Report the manager as running; the invoker exits 0.
    pub fn notify(mut self, pid: Pid) -> std::io::Result<()> {
        writeln!(self.tx, "{}", pid)
    }
}

/// Detach into the background.
///
/// Returns only in the final manager process. The invoking process blocks
/// until the manager calls [`ReadyNotifier::notify`] and exits 0, or exits 1
/// if the manager dies first. Must be called before any thread is spawned.
pub fn daemonize() -> Result<ReadyNotifier> {
    let (mut rx, tx) = PipeFd::pair()?;

    // Safety: called before the process starts any threads.
    match unsafe { fork_process() }? {
        ForkResult::Parent { .. } => {
            drop(tx);
            let mut reply = String::new();
            let _ = rx.read_to_string(&mut reply);
            let manager_pid: i32 = reply.trim().parse().unwrap_or(0);
            if manager_pid > 1 {
                exit_immediately(0);
            }
            eprintln!("master failed to start, check stderr log for details");
            exit_immediately(1);
        }
        ForkResult::Child => {}
    }

    drop(rx);
    setsid()?;
    // Safety: still single-threaded.
    if let ForkResult::Parent { .. } = unsafe { fork_process() }? {
        exit_immediately(0);
    }

    let null: OwnedFd = open("/dev/null", OFlag::O_RDONLY, Mode::empty())?;
    dup2_stdin(&null)?;
    Ok(ReadyNotifier { tx })
}

/// Point stdout and stderr at the given files, opened for appending.
///
/// Workers forked afterwards inherit the new descriptors.
pub fn redirect_io(stdout: Option<&Path>, stderr: Option<&Path>) -> Result<()> {
    if let Some(path) = stdout {
        dup2_stdout(&open_for_append(path)?)?;
    }
    if let Some(path) = stderr {
        dup2_stderr(&open_for_append(path)?)?;
    }
    Ok(())
}

fn open_for_append(path: &Path) -> Result<OwnedFd> {
    let flags = OFlag::O_WRONLY | OFlag::O_APPEND | OFlag::O_CREAT | OFlag::O_CLOEXEC;
    Ok(open(path, flags, Mode::from_bits_truncate(0o644))?)
}
