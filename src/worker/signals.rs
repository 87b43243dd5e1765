//! Worker-side signal handling and exit-status analysis.
//!
//! Inside a worker the handlers only flip flags, except for the immediate
//! terminate signals which `_exit` on the spot. The flags live in statics
//! because a signal handler has no other way to reach them; each worker is
//! its own process, so they are never shared.

use std::ffi::c_int;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::sys::wait::WaitStatus;

use super::spawn::exit_immediately;
use crate::error::Result;

/// Cleared by a graceful quit; the worker loop exits after its current iteration.
static ALIVE: AtomicBool = AtomicBool::new(true);

/// Set by the reopen-logs signal, consumed by the worker loop.
static REOPEN_PENDING: AtomicBool = AtomicBool::new(false);

/// Signals the manager traps that a worker must not inherit handlers for.
const MANAGER_ONLY: [Signal; 5] = [
    Signal::SIGWINCH,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
    Signal::SIGHUP,
    Signal::SIGCHLD,
];

extern "C" fn on_graceful_quit(_: c_int) {
    ALIVE.store(false, Ordering::SeqCst);
}

extern "C" fn on_reopen_logs(_: c_int) {
    REOPEN_PENDING.store(true, Ordering::SeqCst);
}

extern "C" fn on_terminate(_: c_int) {
    exit_immediately(0);
}

/// Install the worker's handlers and drop the ones inherited from the manager.
///
/// Handlers are installed without `SA_RESTART` so a blocking wait on the job
/// pipe returns `EINTR` and the loop gets to look at the flags.
pub fn install_worker_handlers() -> Result<()> {
    ALIVE.store(true, Ordering::SeqCst);
    REOPEN_PENDING.store(false, Ordering::SeqCst);

    let handlers: [(Signal, extern "C" fn(c_int)); 4] = [
        (Signal::SIGQUIT, on_graceful_quit),
        (Signal::SIGUSR1, on_reopen_logs),
        (Signal::SIGTERM, on_terminate),
        (Signal::SIGINT, on_terminate),
    ];
    for (signal, handler) in handlers {
        let action = SigAction::new(
            SigHandler::Handler(handler),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // Safety: the handlers only touch atomics or call _exit.
        unsafe { sigaction(signal, &action) }?;
    }

    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in MANAGER_ONLY {
        // Safety: restoring the default disposition.
        unsafe { sigaction(signal, &default) }?;
    }
    Ok(())
}

/// Whether the worker has not been asked to quit gracefully.
pub fn worker_alive() -> bool {
    ALIVE.load(Ordering::SeqCst)
}

/// Take the reopen-logs request, clearing it.
pub fn take_reopen_request() -> bool {
    REOPEN_PENDING.swap(false, Ordering::SeqCst)
}

/// Reason why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(Signal),
    /// Any other status `waitpid` reported.
    Unknown,
}

impl TerminationReason {
    /// A zero exit status.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// The phrase used in "reaped ..." log lines.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {}", sig.as_str()),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Classify the status of a reaped worker.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),
        _ => TerminationReason::Unknown,
    }
}
