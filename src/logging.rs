//! Logging setup shared by the manager and its workers.
//!
//! Workers are forked from the manager and inherit its subscriber, so every
//! writer here is synchronous: a background writer thread would not survive
//! the fork.
//!
//! # Environment Variables
//!
//! - `JOBHERD_LOG` - Log filter (overrides RUST_LOG)
//! - `JOBHERD_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `JOBHERD_LOG_FORMAT` - Output format: pretty, compact, json
//! - `JOBHERD_LOG_FILE` - Path to log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use jobherd::logging::{LogConfig, init};
//!
//! init(LogConfig::default().with_env_overrides()).unwrap();
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::Result;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// The log file [`reopen`] acts on, once logging to a plain file is set up.
static REOPENABLE: OnceLock<ReopenableFile> = OnceLock::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line human-readable output
    #[default]
    Pretty,
    /// One line per event
    Compact,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

/// Rotation of the log file.
///
/// `Never` writes one file that external tools rotate; the reopen-logs
/// signal then reopens it by path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    Daily,
    #[default]
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: INFO)
    pub level: Level,
    /// Output format (default: Pretty)
    pub format: LogFormat,
    /// Log file written in addition to stderr
    pub file_path: Option<PathBuf>,
    /// Rotation for the log file (default: Never)
    pub rotation: LogRotation,
    /// Filter directives, overriding `level` when set
    pub filter: Option<String>,
    /// Show the emitting module
    pub show_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: LogRotation::Never,
            filter: None,
            show_target: false,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// A filter already set from the command line wins over `JOBHERD_LOG`,
    /// `RUST_LOG` and `JOBHERD_LOG_LEVEL`. A file or format given on the
    /// command line wins over `JOBHERD_LOG_FILE` and `JOBHERD_LOG_FORMAT`
    /// only when the caller applies it after this call.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            self.filter = std::env::var("JOBHERD_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .ok();
        }
        if self.filter.is_none()
            && let Ok(level) = std::env::var("JOBHERD_LOG_LEVEL")
        {
            self.level = parse_level(&level).unwrap_or(self.level);
        }
        if let Ok(format) = std::env::var("JOBHERD_LOG_FORMAT")
            && let Ok(format) = format.parse()
        {
            self.format = format;
        }
        if let Ok(path) = std::env::var("JOBHERD_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }
        self
    }

    fn build_filter(&self) -> EnvFilter {
        let default = || EnvFilter::new(self.level.to_string().to_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                default()
            }),
            None => default(),
        }
    }

    fn layer<W>(&self, writer: W, ansi: bool) -> BoxedLayer
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let layer = fmt::layer()
            .with_target(self.show_target)
            .with_ansi(ansi)
            .with_writer(writer);
        match self.format {
            LogFormat::Json => layer.json().boxed(),
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Pretty => layer.boxed(),
        }
    }
}

/// Parse a log level name.
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Install the global subscriber: stderr, plus the log file if configured.
///
/// Fails only if the log file cannot be opened. A second call leaves the
/// first subscriber in place.
pub fn init(config: LogConfig) -> Result<()> {
    let mut layers = vec![config.layer(io::stderr, io::stderr().is_terminal())];

    if let Some(path) = &config.file_path {
        match config.rotation {
            LogRotation::Never => {
                let file = ReopenableFile::open(path)?;
                let _ = REOPENABLE.set(file.clone());
                layers.push(config.layer(file, false));
            }
            rotation => {
                let (dir, name) = split_log_path(path);
                let appender = RollingFileAppender::new(rotation_of(rotation), dir, name);
                layers.push(config.layer(appender, false));
            }
        }
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.build_filter())
        .try_init();
    Ok(())
}

/// Reopen the log file by path, picking up a file moved away by logrotate.
///
/// A no-op when logging goes to stderr only or to a self-rotating file.
pub fn reopen() -> io::Result<()> {
    match REOPENABLE.get() {
        Some(file) => file.reopen(),
        None => Ok(()),
    }
}

fn rotation_of(rotation: LogRotation) -> Rotation {
    match rotation {
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Never => Rotation::NEVER,
    }
}

fn split_log_path(path: &Path) -> (&Path, &str) {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("jobherd.log");
    (dir, name)
}

/// An append-mode log file that can be reopened in place.
#[derive(Debug, Clone)]
pub struct ReopenableFile {
    inner: Arc<ReopenableInner>,
}

#[derive(Debug)]
struct ReopenableInner {
    path: PathBuf,
    file: Mutex<File>,
}

impl ReopenableFile {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(ReopenableInner {
                path: path.to_path_buf(),
                file: Mutex::new(open_append(path)?),
            }),
        })
    }

    /// Swap in a fresh descriptor for the same path.
    pub fn reopen(&self) -> io::Result<()> {
        let fresh = open_append(&self.inner.path)?;
        *self
            .inner
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Write for ReopenableFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for ReopenableFile {
    type Writer = ReopenableFile;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
