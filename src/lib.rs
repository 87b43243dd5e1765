//! jobherd - a pre-forking job supervisor.
//!
//! A single manager process forks a pool of workers, hands each one job at a
//! time over a pipe, kills workers whose heartbeat goes silent, and resizes,
//! reloads or drains the pool on operator signals.
//!
//! ```no_run
//! use jobherd::{Job, Manager, Settings};
//!
//! let settings = Settings::builder()
//!     .worker_processes(4)
//!     .timeout(30)
//!     .pull_job(|_| Ok(Some(Job::text("tick"))))
//!     .process_job(|worker, payload| {
//!         println!("worker={} got {}", worker.nr(), payload);
//!         Ok(true)
//!     })
//!     .build()?;
//!
//! let mut manager = Manager::new(settings);
//! manager.start()?;
//! manager.join()?;
//! # Ok::<(), jobherd::HerdError>(())
//! ```

pub mod config;
pub mod error;
pub mod launcher;
pub mod logging;
pub mod manager;
pub mod pidfile;
pub mod worker;

pub use config::{FileSource, Settings, SettingsBuilder, SettingsFile, SettingsSource};
pub use error::{HerdError, Result};
pub use manager::{Manager, ManagerState, run};
pub use worker::Worker;
pub use worker::protocol::Job;
