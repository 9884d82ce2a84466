//! Execution isolates
//!
//! An isolate runs one validated snippet in a disposable context and always
//! returns within the wall-clock ceiling. The production runtime is
//! [`ProcessIsolate`], which spawns a fresh interpreter per run and hard-kills
//! its whole process tree on expiry.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::EngineResult;
use crate::policy::ResourceLimits;

pub mod process;
#[cfg(target_os = "linux")]
mod reaper;

pub use process::{python_available, ProcessIsolate};

pub const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Work handed to an isolate.
#[derive(Debug, Clone)]
pub struct IsolateJob<'a> {
    pub code: &'a str,
    pub capture_plot: bool,
    pub limits: &'a ResourceLimits,
}

/// Bytes of one artifact produced inside the worker, not yet published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawArtifact {
    /// File extension without the dot, lower-case
    pub extension: String,
    pub bytes: Vec<u8>,
}

/// What happened inside the worker, before artifacts are published.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReport {
    Completed {
        stdout: String,
        stderr: String,
        figures: Vec<RawArtifact>,
        html: Option<String>,
    },
    Raised {
        exception: String,
        message: String,
        traceback: String,
    },
    TimedOut {
        after: Duration,
    },
    MemoryExceeded,
}

#[async_trait]
pub trait IsolateRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Run one snippet. Must return within `job.limits.wall_clock()` plus a
    /// small teardown margin, whatever the snippet does.
    async fn execute(&self, job: IsolateJob<'_>) -> EngineResult<WorkerReport>;
}

/// Cut `text` to at most `max_bytes` (on a char boundary) and append a marker.
pub fn truncate_output(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &text[..end], TRUNCATION_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_output_untouched() {
        assert_eq!(truncate_output("4\n", 10_000), "4\n");
    }

    #[test]
    fn test_long_output_truncated_with_marker() {
        let text = "x".repeat(20);
        let out = truncate_output(&text, 8);
        assert_eq!(out, format!("{}{}", "x".repeat(8), TRUNCATION_MARKER));
    }

    #[test]
    fn test_truncation_respects_char_boundary() {
        let text = "ééééé";
        let out = truncate_output(text, 3);
        assert!(out.starts_with('é'));
        assert!(out.ends_with(TRUNCATION_MARKER));
    }
}
