//! Manager-side signal plumbing.
//!
//! Handlers only write the signal number into a non-blocking self-pipe. The
//! master loop polls the read end alongside the workers' ready pipes, drains
//! it into a [`SignalQueue`], and consumes one tag per iteration.

use std::collections::VecDeque;
use std::ffi::c_int;
use std::io::{self, Read};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd};
use std::sync::atomic::{AtomicI32, Ordering};

use nix::errno::Errno;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use tracing::{debug, warn};

use crate::error::Result;
use crate::worker::ipc::PipeFd;

/// Most tags kept pending; newer ones are dropped beyond this.
pub const QUEUE_CAPACITY: usize = 5;

/// Signals the manager reacts to.
pub const MANAGER_SIGNALS: [Signal; 9] = [
    Signal::SIGQUIT,
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGUSR1,
    Signal::SIGWINCH,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
    Signal::SIGHUP,
    Signal::SIGCHLD,
];

/// Write end of the self-pipe, or -1 when no manager owns one.
static SIGNAL_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// A control request waiting for the master loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTag {
    /// Finish in-flight jobs, then stop.
    GracefulQuit,
    /// Terminate workers now, then stop.
    ImmediateStop,
    /// Reopen log files in the manager and every worker.
    ReopenLogs,
    /// Drop the pool to zero when running detached.
    ResizeDown,
    /// One more worker.
    Increment,
    /// One fewer worker.
    Decrement,
    /// Reload settings or re-execute.
    Reload,
}

impl SignalTag {
    /// Map a delivered signal to its tag. `SIGCHLD` and unknown signals have none.
    pub fn from_signal(signal: Signal) -> Option<Self> {
        match signal {
            Signal::SIGQUIT => Some(Self::GracefulQuit),
            Signal::SIGTERM | Signal::SIGINT => Some(Self::ImmediateStop),
            Signal::SIGUSR1 => Some(Self::ReopenLogs),
            Signal::SIGWINCH => Some(Self::ResizeDown),
            Signal::SIGTTIN => Some(Self::Increment),
            Signal::SIGTTOU => Some(Self::Decrement),
            Signal::SIGHUP => Some(Self::Reload),
            _ => None,
        }
    }
}

/// Bounded FIFO of pending control tags.
#[derive(Debug, Default)]
pub struct SignalQueue {
    tags: VecDeque<SignalTag>,
}

impl SignalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tag. A full queue drops the new tag and returns `false`.
    pub fn push(&mut self, tag: SignalTag) -> bool {
        if self.tags.len() >= QUEUE_CAPACITY {
            return false;
        }
        self.tags.push_back(tag);
        true
    }

    /// Take the oldest tag.
    pub fn pop(&mut self) -> Option<SignalTag> {
        self.tags.pop_front()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn clear(&mut self) {
        self.tags.clear();
    }
}

extern "C" fn on_signal(signo: c_int) {
    let fd = SIGNAL_WRITE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    let saved = Errno::last_raw();
    // Safety: the descriptor stays open while it is published in the static.
    let pipe = unsafe { BorrowedFd::borrow_raw(fd) };
    // A full pipe means the manager is already awake with work queued.
    let _ = nix::unistd::write(pipe, &[signo as u8]);
    Errno::set_raw(saved);
}

/// The self-pipe that carries signals from handlers to the master loop.
#[derive(Debug)]
pub struct SignalPipe {
    rx: PipeFd,
    tx: PipeFd,
}

impl SignalPipe {
    /// Create the self-pipe and trap every manager signal. `SIGPIPE` is
    /// ignored so a dead worker's job pipe surfaces as `EPIPE`.
    pub fn install() -> Result<Self> {
        Self::install_for(&MANAGER_SIGNALS)
    }

    fn install_for(signals: &[Signal]) -> Result<Self> {
        let (rx, tx) = PipeFd::nonblocking_pair()?;
        SIGNAL_WRITE_FD.store(tx.as_raw_fd(), Ordering::SeqCst);

        let action = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for &signal in signals {
            // Safety: the handler only calls write(2) and restores errno.
            unsafe { sigaction(signal, &action) }?;
        }
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        // Safety: ignoring a signal installs no code.
        unsafe { sigaction(Signal::SIGPIPE, &ignore) }?;
        Ok(Self { rx, tx })
    }

    /// Move every delivered signal into `queue`.
    pub fn drain(&mut self, queue: &mut SignalQueue) -> io::Result<()> {
        let mut buf = [0u8; 32];
        loop {
            let n = match self.rx.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            };
            for &signo in &buf[..n] {
                let Ok(signal) = Signal::try_from(i32::from(signo)) else {
                    continue;
                };
                let Some(tag) = SignalTag::from_signal(signal) else {
                    continue;
                };
                if queue.push(tag) {
                    debug!(signal = signal.as_str(), "queued signal");
                } else {
                    warn!(
                        signal = signal.as_str(),
                        "signal queue full ({} pending), dropping {}",
                        QUEUE_CAPACITY,
                        signal.as_str()
                    );
                }
            }
        }
    }

    /// Stop routing signals into this pipe and close it.
    ///
    /// Called in a freshly forked worker, which must not write into the
    /// manager's pipe.
    pub fn close_inherited(self) {
        SIGNAL_WRITE_FD.store(-1, Ordering::SeqCst);
        drop(self);
    }
}

impl AsFd for SignalPipe {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.rx.as_fd()
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        let _ = SIGNAL_WRITE_FD.compare_exchange(
            self.tx.as_raw_fd(),
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}
