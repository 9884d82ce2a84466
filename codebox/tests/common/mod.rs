#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use codebox::error::EngineResult;
use codebox::isolate::{IsolateJob, IsolateRuntime, RawArtifact, WorkerReport};
use codebox::{Engine, EngineConfig};

/// Isolate that replays queued reports and records every snippet it sees.
/// Once the script runs out it reports a clean empty run.
#[derive(Default)]
pub struct ScriptedIsolate {
    script: Mutex<VecDeque<WorkerReport>>,
    seen: Mutex<Vec<String>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedIsolate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, report: WorkerReport) {
        self.script.lock().unwrap().push_back(report);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of snippets that were running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl IsolateRuntime for ScriptedIsolate {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, job: IsolateJob<'_>) -> EngineResult<WorkerReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(job.code.to_string());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| completed("")))
    }
}

pub fn completed(stdout: &str) -> WorkerReport {
    WorkerReport::Completed {
        stdout: stdout.to_string(),
        stderr: String::new(),
        figures: Vec::new(),
        html: None,
    }
}

pub fn with_figure() -> WorkerReport {
    WorkerReport::Completed {
        stdout: String::new(),
        stderr: String::new(),
        figures: vec![RawArtifact {
            extension: "png".to_string(),
            bytes: b"\x89PNG\r\n".to_vec(),
        }],
        html: None,
    }
}

pub fn raised(exception: &str, message: &str) -> WorkerReport {
    WorkerReport::Raised {
        exception: exception.to_string(),
        message: message.to_string(),
        traceback: format!(
            "Traceback (most recent call last):\n  File \"<snippet>\", line 1, in <module>\n{}: {}",
            exception, message
        ),
    }
}

pub fn config(artifact_root: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.artifacts.root = artifact_root.to_path_buf();
    config
}

pub fn engine(config: EngineConfig, isolate: Arc<ScriptedIsolate>) -> Engine {
    Engine::builder(config).isolate(isolate).build()
}
