//! Process-per-run isolate.
//!
//! Every run gets a private temporary directory and a fresh interpreter
//! running the embedded harness. The supervisor waits on the child with a hard
//! deadline; on expiry the whole process tree is SIGKILLed, including anything
//! that left the process group. The harness reports back through a single JSON
//! file that is only read once the worker is gone.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::process::Command;
use tokio::time::timeout;

use super::{truncate_output, IsolateJob, IsolateRuntime, RawArtifact, WorkerReport};
use crate::error::{EngineError, EngineResult};
use crate::policy::ResourceLimits;

const HARNESS_SOURCE: &str = include_str!("harness.py");
const HARNESS_FILE: &str = "harness.py";
const SNIPPET_FILE: &str = "snippet.py";
const RESULT_FILE: &str = "result.json";
const WORKER_LOG: &str = "worker.log";
const OUTPUT_DIR: &str = "output";

/// Lines of worker stderr kept when the harness died before reporting.
const LOG_TAIL_LINES: usize = 20;

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum WorkerPayload {
    Ok {
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
        #[serde(default)]
        figures: Vec<String>,
        #[serde(default)]
        html: Option<String>,
    },
    Error {
        exception: String,
        #[serde(default)]
        message: String,
        #[serde(default)]
        traceback: String,
    },
    Memory,
}

/// Spawns one interpreter per run.
#[derive(Debug, Clone)]
pub struct ProcessIsolate {
    python_path: PathBuf,
    max_artifact_bytes: u64,
}

impl ProcessIsolate {
    pub fn new(python_path: impl Into<PathBuf>) -> Self {
        Self {
            python_path: python_path.into(),
            max_artifact_bytes: 10 * 1024 * 1024,
        }
    }

    pub fn with_max_artifact_bytes(mut self, max_artifact_bytes: u64) -> Self {
        self.max_artifact_bytes = max_artifact_bytes;
        self
    }

    pub fn python_path(&self) -> &Path {
        &self.python_path
    }

    fn command(&self, workdir: &Path, capture_plot: bool, limits: &ResourceLimits) -> Command {
        let mut cmd = Command::new(&self.python_path);
        cmd.current_dir(workdir);
        cmd.arg("-B")
            .arg("-u")
            .arg(HARNESS_FILE)
            .arg(SNIPPET_FILE)
            .arg(RESULT_FILE)
            .arg(OUTPUT_DIR)
            .arg(if capture_plot { "1" } else { "0" });

        cmd.env_clear();
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
        cmd.env("HOME", workdir);
        cmd.env("TMPDIR", workdir);
        cmd.env("MPLBACKEND", "Agg");
        cmd.env("MPLCONFIGDIR", workdir.join(".matplotlib"));
        cmd.env("PYTHONDONTWRITEBYTECODE", "1");
        cmd.env("PYTHONUNBUFFERED", "1");
        cmd.env("PYTHONIOENCODING", "utf-8");
        for var in ["OPENBLAS_NUM_THREADS", "OMP_NUM_THREADS", "MKL_NUM_THREADS"] {
            cmd.env(var, "1");
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.kill_on_drop(true);

        #[cfg(unix)]
        apply_rlimits(&mut cmd, limits);
        #[cfg(not(unix))]
        let _ = limits;

        cmd
    }

    async fn collect(
        &self,
        workdir: &Path,
        status: ExitStatus,
        limits: &ResourceLimits,
    ) -> EngineResult<WorkerReport> {
        match read_payload(workdir).await? {
            Some(payload) => self.report(workdir, payload, limits).await,
            None => Ok(self.classify_silent_exit(workdir, status, limits).await),
        }
    }

    async fn report(
        &self,
        workdir: &Path,
        payload: WorkerPayload,
        limits: &ResourceLimits,
    ) -> EngineResult<WorkerReport> {
        match payload {
            WorkerPayload::Ok {
                stdout,
                stderr,
                figures,
                html,
            } => {
                let output_dir = workdir.join(OUTPUT_DIR);
                let mut artifacts = Vec::new();
                for name in figures {
                    if let Some(artifact) = self.read_artifact(&output_dir, &name).await? {
                        artifacts.push(artifact);
                    }
                }
                let html = match html {
                    Some(name) => self
                        .read_artifact(&output_dir, &name)
                        .await?
                        .map(|raw| String::from_utf8_lossy(&raw.bytes).into_owned()),
                    None => None,
                };
                Ok(WorkerReport::Completed {
                    stdout: truncate_output(&stdout, limits.max_output_bytes),
                    stderr: truncate_output(&stderr, limits.max_output_bytes),
                    figures: artifacts,
                    html,
                })
            }
            WorkerPayload::Error {
                exception,
                message,
                traceback,
            } => Ok(WorkerReport::Raised {
                exception,
                message: truncate_output(&message, limits.max_output_bytes),
                traceback: truncate_output(&traceback, limits.max_output_bytes),
            }),
            WorkerPayload::Memory => Ok(WorkerReport::MemoryExceeded),
        }
    }

    /// The worker died without writing a payload.
    async fn classify_silent_exit(
        &self,
        workdir: &Path,
        status: ExitStatus,
        limits: &ResourceLimits,
    ) -> WorkerReport {
        let log = fs::read_to_string(workdir.join(WORKER_LOG))
            .await
            .unwrap_or_default();

        if let Some(signal) = exit_signal(&status) {
            if is_cpu_signal(signal) {
                return WorkerReport::TimedOut {
                    after: limits.wall_clock(),
                };
            }
            tracing::warn!("Worker killed by signal {} without a result", signal);
            return WorkerReport::MemoryExceeded;
        }
        if log.contains("MemoryError") {
            return WorkerReport::MemoryExceeded;
        }

        let tail: Vec<&str> = log.lines().rev().take(LOG_TAIL_LINES).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        WorkerReport::Raised {
            exception: "WorkerError".to_string(),
            message: format!("worker exited without a result ({})", status),
            traceback: truncate_output(&tail.join("\n"), limits.max_output_bytes),
        }
    }

    async fn read_artifact(&self, dir: &Path, name: &str) -> EngineResult<Option<RawArtifact>> {
        // The harness only ever reports bare file names.
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(EngineError::WorkerProtocol(format!(
                "artifact name '{}' is not a bare file name",
                name
            )));
        }
        let path = dir.join(name);
        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if meta.len() > self.max_artifact_bytes {
            tracing::warn!(
                "Dropping artifact {} ({} bytes > {} bytes)",
                name,
                meta.len(),
                self.max_artifact_bytes
            );
            return Ok(None);
        }
        let extension = Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("bin")
            .to_ascii_lowercase();
        Ok(Some(RawArtifact {
            extension,
            bytes: fs::read(&path).await?,
        }))
    }
}

#[async_trait]
impl IsolateRuntime for ProcessIsolate {
    fn name(&self) -> &str {
        "process"
    }

    async fn execute(&self, job: IsolateJob<'_>) -> EngineResult<WorkerReport> {
        let workdir = tempfile::Builder::new().prefix("codebox-").tempdir()?;
        fs::write(workdir.path().join(HARNESS_FILE), HARNESS_SOURCE).await?;
        fs::write(workdir.path().join(SNIPPET_FILE), job.code).await?;
        fs::create_dir(workdir.path().join(OUTPUT_DIR)).await?;
        let log = std::fs::File::create(workdir.path().join(WORKER_LOG))?;

        let mut cmd = self.command(workdir.path(), job.capture_plot, job.limits);
        cmd.stderr(Stdio::from(log));

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| EngineError::Spawn {
            program: self.python_path.display().to_string(),
            source: e,
        })?;
        let pid = child.id();
        let wall = job.limits.wall_clock();

        let status = match timeout(wall, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                kill_tree(pid).await;
                let _ = child.kill().await;
                // Finished but kept alive by something it started.
                if let Some(payload) = read_payload(workdir.path()).await? {
                    tracing::warn!(
                        "Worker {:?} reported but did not exit within {}s, killed",
                        pid,
                        wall.as_secs()
                    );
                    return self.report(workdir.path(), payload, job.limits).await;
                }
                tracing::warn!(
                    "Worker {:?} exceeded {}s wall clock, killed",
                    pid,
                    wall.as_secs()
                );
                return Ok(WorkerReport::TimedOut { after: wall });
            }
        };
        // The harness reaps its own tree; this catches group members it missed.
        kill_group(pid);

        tracing::debug!(
            "Worker {:?} exited with {} after {}ms",
            pid,
            status,
            started.elapsed().as_millis()
        );
        self.collect(workdir.path(), status, job.limits).await
    }
}

async fn read_payload(workdir: &Path) -> EngineResult<Option<WorkerPayload>> {
    let raw = match fs::read(workdir.join(RESULT_FILE)).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|e| EngineError::WorkerProtocol(e.to_string()))
}

/// True when `python_path` can be executed.
pub async fn python_available(python_path: &Path) -> bool {
    let version = Command::new(python_path)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();
    matches!(
        timeout(Duration::from_secs(10), version).await,
        Ok(Ok(status)) if status.success()
    )
}

#[cfg(unix)]
fn apply_rlimits(cmd: &mut Command, limits: &ResourceLimits) {
    let mem_limit = limits.memory_bytes();
    let cpu_limit = limits.cpu_secs();
    let nofile_limit = limits.max_open_files;
    let nproc_limit = limits.max_processes;
    unsafe {
        cmd.pre_exec(move || {
            let set = |resource, value: u64| {
                let rlimit = libc::rlimit {
                    rlim_cur: value as libc::rlim_t,
                    rlim_max: value as libc::rlim_t,
                };
                if libc::setrlimit(resource, &rlimit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            };
            // Own process group so the supervisor can kill the whole tree.
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            // Orphans of the snippet are re-parented here instead of to init.
            #[cfg(target_os = "linux")]
            {
                let (on, unused): (libc::c_ulong, libc::c_ulong) = (1, 0);
                if libc::prctl(libc::PR_SET_CHILD_SUBREAPER, on, unused, unused, unused) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            set(libc::RLIMIT_CORE, 0)?;
            if mem_limit > 0 {
                set(libc::RLIMIT_AS, mem_limit)?;
            }
            set(libc::RLIMIT_CPU, cpu_limit)?;
            if nofile_limit > 0 {
                set(libc::RLIMIT_NOFILE, nofile_limit)?;
            }
            if let Some(limit) = nproc_limit {
                set(libc::RLIMIT_NPROC, limit)?;
            }
            Ok(())
        });
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // ESRCH just means the group is already gone.
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

#[cfg(target_os = "linux")]
async fn kill_tree(pid: Option<u32>) {
    if let Some(pid) = pid {
        super::reaper::kill_tree(pid).await;
    }
}

#[cfg(not(target_os = "linux"))]
async fn kill_tree(pid: Option<u32>) {
    kill_group(pid);
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn is_cpu_signal(signal: i32) -> bool {
    signal == libc::SIGXCPU
}

#[cfg(not(unix))]
fn is_cpu_signal(_signal: i32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn isolate_or_skip() -> Option<ProcessIsolate> {
        let isolate = ProcessIsolate::new("python3");
        if !python_available(isolate.python_path()).await {
            eprintln!("python3 not available, skipping");
            return None;
        }
        Some(isolate)
    }

    fn job<'a>(code: &'a str, limits: &'a ResourceLimits) -> IsolateJob<'a> {
        IsolateJob {
            code,
            capture_plot: false,
            limits,
        }
    }

    #[test]
    fn test_payload_parses_error_variant() {
        let raw = r#"{"status": "error", "exception": "KeyError", "message": "'a'", "traceback": "tb"}"#;
        match serde_json::from_str::<WorkerPayload>(raw).unwrap() {
            WorkerPayload::Error { exception, .. } => assert_eq!(exception, "KeyError"),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_payload_rejects_unknown_status() {
        assert!(serde_json::from_str::<WorkerPayload>(r#"{"status": "maybe"}"#).is_err());
    }

    #[tokio::test]
    async fn test_print_is_captured() {
        let Some(isolate) = isolate_or_skip().await else {
            return;
        };
        let limits = ResourceLimits::default();
        let report = isolate.execute(job("print(2+2)", &limits)).await.unwrap();
        match report {
            WorkerReport::Completed { stdout, figures, .. } => {
                assert_eq!(stdout, "4\n");
                assert!(figures.is_empty());
            }
            other => panic!("unexpected report {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exception_is_reported() {
        let Some(isolate) = isolate_or_skip().await else {
            return;
        };
        let limits = ResourceLimits::default();
        let report = isolate
            .execute(job("d = {}\nd['missing']", &limits))
            .await
            .unwrap();
        match report {
            WorkerReport::Raised {
                exception,
                traceback,
                ..
            } => {
                assert_eq!(exception, "KeyError");
                assert!(traceback.contains("<snippet>"));
                assert!(!traceback.contains("harness.py"));
            }
            other => panic!("unexpected report {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_busy_loop_is_killed_at_deadline() {
        let Some(isolate) = isolate_or_skip().await else {
            return;
        };
        let limits = ResourceLimits {
            wall_clock_secs: 2,
            ..Default::default()
        };
        let started = Instant::now();
        let report = isolate
            .execute(job("while True: pass", &limits))
            .await
            .unwrap();
        assert!(matches!(report, WorkerReport::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[cfg(unix)]
    fn killed_by(signal: i32) -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(signal)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fatal_signal_without_result_is_memory() {
        let dir = tempfile::tempdir().unwrap();
        let isolate = ProcessIsolate::new("python3");
        let limits = ResourceLimits::default();
        let report = isolate
            .classify_silent_exit(dir.path(), killed_by(libc::SIGKILL), &limits)
            .await;
        assert_eq!(report, WorkerReport::MemoryExceeded);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cpu_signal_without_result_is_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let isolate = ProcessIsolate::new("python3");
        let limits = ResourceLimits::default();
        let report = isolate
            .classify_silent_exit(dir.path(), killed_by(libc::SIGXCPU), &limits)
            .await;
        assert_eq!(
            report,
            WorkerReport::TimedOut {
                after: limits.wall_clock()
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_memory_error_in_log_is_memory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(WORKER_LOG), "Traceback ...\nMemoryError\n").unwrap();
        let isolate = ProcessIsolate::new("python3");
        let limits = ResourceLimits::default();
        let exited = {
            use std::os::unix::process::ExitStatusExt;
            ExitStatus::from_raw(1 << 8)
        };
        let report = isolate.classify_silent_exit(dir.path(), exited, &limits).await;
        assert_eq!(report, WorkerReport::MemoryExceeded);
    }

    #[tokio::test]
    async fn test_read_payload_missing_and_present() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_payload(dir.path()).await.unwrap().is_none());
        std::fs::write(
            dir.path().join(RESULT_FILE),
            r#"{"status": "ok", "stdout": "done\n"}"#,
        )
        .unwrap();
        match read_payload(dir.path()).await.unwrap() {
            Some(WorkerPayload::Ok { stdout, .. }) => assert_eq!(stdout, "done\n"),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    /// Snippet that forks a child which leaves the process group and sleeps,
    /// writes the child's pid to `pid_file`, then runs `tail`.
    #[cfg(target_os = "linux")]
    fn escaping_child(pid_file: &Path, tail: &str) -> String {
        format!(
            "import os, time\n\
             pid = os.fork()\n\
             if pid == 0:\n    os.setsid()\n    time.sleep(120)\n    os._exit(0)\n\
             with open({:?}, 'w') as handle:\n    handle.write(str(pid))\n\
             {}\n",
            pid_file.display().to_string(),
            tail
        )
    }

    #[cfg(target_os = "linux")]
    async fn assert_gone(pid_file: &Path) {
        let pid: i32 = std::fs::read_to_string(pid_file).unwrap().trim().parse().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match super::super::reaper::process_stat(pid) {
                None | Some((_, 'Z')) => return,
                Some(_) if Instant::now() > deadline => panic!("process {} survived its run", pid),
                Some(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_setsid_child_is_killed_on_timeout() {
        let Some(isolate) = isolate_or_skip().await else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("child.pid");
        let limits = ResourceLimits {
            wall_clock_secs: 2,
            ..Default::default()
        };
        let code = escaping_child(&pid_file, "while True: pass");
        let report = isolate.execute(job(&code, &limits)).await.unwrap();
        assert!(matches!(report, WorkerReport::TimedOut { .. }), "{:?}", report);
        assert_gone(&pid_file).await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_setsid_child_is_killed_after_normal_exit() {
        let Some(isolate) = isolate_or_skip().await else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("child.pid");
        let limits = ResourceLimits::default();
        let code = escaping_child(&pid_file, "print('parent done')");
        let report = isolate.execute(job(&code, &limits)).await.unwrap();
        match report {
            WorkerReport::Completed { stdout, .. } => assert_eq!(stdout, "parent done\n"),
            other => panic!("unexpected report {:?}", other),
        }
        assert_gone(&pid_file).await;
    }

    #[tokio::test]
    async fn test_lingering_thread_does_not_hold_the_run() {
        let Some(isolate) = isolate_or_skip().await else {
            return;
        };
        let limits = ResourceLimits {
            wall_clock_secs: 5,
            ..Default::default()
        };
        let code = "import threading, time\n\
                    threading.Thread(target=time.sleep, args=(60,)).start()\n\
                    print('done')\n";
        let started = Instant::now();
        let report = isolate.execute(job(code, &limits)).await.unwrap();
        match report {
            WorkerReport::Completed { stdout, .. } => assert_eq!(stdout, "done\n"),
            other => panic!("unexpected report {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_spawn_error() {
        let isolate = ProcessIsolate::new("/nonexistent/python-for-codebox");
        let limits = ResourceLimits::default();
        let err = isolate.execute(job("print(1)", &limits)).await.unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }));
    }
}
