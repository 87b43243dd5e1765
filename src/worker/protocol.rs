//! Wire format for manager/worker job dispatch.
//!
//! The ready pipe carries one byte per readiness report. The job pipe carries
//! one job per line: the job's text form followed by a newline. Only the text
//! survives the hop; the worker sees the payload as a `&str`.

use crate::error::{HerdError, Result};
use serde::Serialize;
use std::fmt;

/// Byte a worker writes to its ready pipe when it wants a job.
pub const READY_BYTE: u8 = b'.';

/// An opaque job produced by the `pull_job` hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    text: String,
}

impl Job {
    /// Create a job from anything with a text representation.
    pub fn text(value: impl fmt::Display) -> Self {
        Self {
            text: value.to_string(),
        }
    }

    /// Create a job from a serializable value, rendered as single-line JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let text = serde_json::to_string(value)
            .map_err(|e| HerdError::Worker(format!("Failed to serialize job: {}", e)))?;
        Ok(Self { text })
    }

    /// The job's text form.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Encode for the job pipe.
    ///
    /// A newline is appended unless the text already ends with one. Text with
    /// an interior line break cannot travel as a single line and is rejected.
    pub fn to_line(&self) -> Result<String> {
        let body = strip_terminator(&self.text);
        if body.contains('\n') {
            return Err(HerdError::Worker(format!(
                "Job payload spans multiple lines ({} bytes)",
                self.text.len()
            )));
        }
        let mut line = self.text.clone();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        Ok(line)
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl From<String> for Job {
    fn from(text: String) -> Self {
        Self { text }
    }
}

impl From<&str> for Job {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

/// Strip exactly one trailing line terminator (`\n` or `\r\n`).
pub fn strip_terminator(line: &str) -> &str {
    match line.strip_suffix('\n') {
        Some(rest) => rest.strip_suffix('\r').unwrap_or(rest),
        None => line,
    }
}
