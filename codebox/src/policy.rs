//! Resource policy: per-execution ceilings and per-conversation quotas.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Name of the free-form code execution tool.
pub const EXECUTE_TOOL: &str = "execute_python_code";

/// Ceilings applied to a single isolate run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Hard wall-clock deadline in seconds
    pub wall_clock_secs: u64,
    /// Address-space ceiling in MB (0 disables it)
    pub memory_mb: u64,
    /// Captured stdout/stderr are truncated past this many bytes
    pub max_output_bytes: usize,
    /// Optional ceiling on processes the worker may own
    pub max_processes: Option<u64>,
    /// Ceiling on open file descriptors inside the worker
    pub max_open_files: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            wall_clock_secs: 30,
            memory_mb: 2048,
            max_output_bytes: 10_000,
            max_processes: None,
            max_open_files: 256,
        }
    }
}

impl ResourceLimits {
    pub fn wall_clock(&self) -> Duration {
        Duration::from_secs(self.wall_clock_secs)
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(1024 * 1024)
    }

    /// CPU-seconds ceiling handed to the kernel. One second of slack past the
    /// wall clock so the supervisor deadline normally fires first.
    pub fn cpu_secs(&self) -> u64 {
        self.wall_clock_secs.saturating_add(1)
    }
}

/// Per-conversation execution quotas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaLimits {
    /// Maximum executions across all tools in one conversation
    pub max_executions: u32,
    /// Finer-grained caps keyed by tool name
    pub per_tool: HashMap<String, u32>,
    /// Consecutive failures after which feedback turns terminal
    pub max_consecutive_failures: u32,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        let mut per_tool = HashMap::new();
        per_tool.insert(EXECUTE_TOOL.to_string(), 5);
        per_tool.insert("analyze_exercise_image".to_string(), 3);
        per_tool.insert("extract_math_equations".to_string(), 3);
        per_tool.insert("analyze_graph_chart".to_string(), 3);
        Self {
            max_executions: 10,
            per_tool,
            max_consecutive_failures: 5,
        }
    }
}

impl QuotaLimits {
    pub fn tool_limit(&self, tool_name: &str) -> Option<u32> {
        self.per_tool.get(tool_name).copied()
    }
}
