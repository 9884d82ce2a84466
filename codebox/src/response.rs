//! Tool-call wire format
//!
//! `{status, message, data}` where `status` is the discriminant. Built from an
//! [`ExecutionOutcome`] so every failure carries a non-empty message and, when
//! retrying could help, structured feedback.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::feedback::RetryFeedback;
use crate::outcome::{
    Artifact, ArtifactKind, ErrorCategory, ExecutionOutcome, OutcomeKind, RejectReason,
};

/// Inbound arguments of the execution tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteArgs {
    pub code: String,
    #[serde(default = "default_save_plot")]
    pub save_plot: bool,
}

fn default_save_plot() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<OutcomeKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(default)]
    pub execution_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plot_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<RetryFeedback>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub status: u16,
    pub message: String,
    pub data: ResponseData,
}

impl ToolResponse {
    pub fn from_outcome(
        outcome: &ExecutionOutcome,
        execution_count: u32,
        feedback: Option<RetryFeedback>,
    ) -> Self {
        let mut data = ResponseData {
            outcome: Some(outcome.kind()),
            execution_count,
            category: outcome.category(),
            ..Default::default()
        };

        let message = match outcome {
            ExecutionOutcome::Success {
                stdout,
                stderr,
                artifacts,
            } => {
                data.stdout = Some(stdout.clone()).filter(|s| !s.is_empty());
                data.stderr = Some(stderr.clone()).filter(|s| !s.is_empty());
                if let Some(figure) = artifacts.iter().find(|a| a.kind == ArtifactKind::Figure) {
                    data.plot_path = Some(figure.local_path.display().to_string());
                    data.file_url = Some(figure.public_url.clone());
                }
                if let Some(html) = artifacts.iter().find(|a| a.kind == ArtifactKind::Html) {
                    data.html_path = Some(html.local_path.display().to_string());
                    data.html_url = Some(html.public_url.clone());
                }
                data.artifacts = artifacts.clone();
                "Code executed successfully"
            }
            ExecutionOutcome::Rejected { reason, detail } => {
                data.error = Some(detail.clone());
                match reason {
                    RejectReason::Security => "Security violation",
                    RejectReason::Syntax => "Invalid syntax",
                }
            }
            ExecutionOutcome::TimedOut { after } => {
                data.error = Some(format!("Execution exceeded {} seconds", after.as_secs()));
                data.timeout = Some(after.as_secs());
                "Code execution timed out"
            }
            ExecutionOutcome::MemoryExceeded { limit_mb } => {
                data.error = Some(format!("Execution exceeded {} MB of memory", limit_mb));
                "Memory limit exceeded"
            }
            ExecutionOutcome::RuntimeFailure { message, trace, .. } => {
                data.error = Some(message.clone());
                data.traceback = Some(trace.clone()).filter(|t| !t.is_empty());
                "Code execution failed"
            }
            ExecutionOutcome::QuotaExceeded { limit, .. } => {
                data.error = Some(format!(
                    "Maximum {} executions allowed in this conversation for this tool",
                    limit
                ));
                "Execution limit reached"
            }
        };

        let mut message = message.to_string();
        if let Some(feedback) = &feedback {
            if feedback.terminal && !matches!(outcome, ExecutionOutcome::QuotaExceeded { .. }) {
                // Past the failure ceiling the raw error is withheld.
                data.error = None;
                data.traceback = None;
                message = "Retry limit reached".to_string();
            }
        }
        data.feedback = feedback;

        Self {
            status: outcome.status_code(),
            message,
            data,
        }
    }

    /// The engine itself failed; still a well-formed response.
    pub fn tool_error(err: &EngineError) -> Self {
        Self {
            status: 500,
            message: format!("Tool error: {}", err),
            data: ResponseData {
                error: Some(err.to_string()),
                ..Default::default()
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 200
    }

    /// Text handed back to the agent: the feedback message when there is one,
    /// the serialized response otherwise.
    pub fn agent_text(&self) -> String {
        match &self.data.feedback {
            Some(feedback) => feedback.message.clone(),
            None => serde_json::to_string(self).unwrap_or_else(|_| self.message.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::QuotaScope;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_success_maps_first_figure_to_plot_fields() {
        let outcome = ExecutionOutcome::Success {
            stdout: "4\n".to_string(),
            stderr: String::new(),
            artifacts: vec![Artifact {
                kind: ArtifactKind::Figure,
                local_path: PathBuf::from("output/plots/execute_python_code_1.png"),
                public_url: "http://localhost:8000/api/v2/files/plots/execute_python_code_1.png"
                    .to_string(),
            }],
        };
        let response = ToolResponse::from_outcome(&outcome, 1, None);
        assert_eq!(response.status, 200);
        assert_eq!(response.message, "Code executed successfully");
        assert_eq!(response.data.stdout.as_deref(), Some("4\n"));
        assert_eq!(response.data.stderr, None);
        assert_eq!(
            response.data.file_url.as_deref(),
            Some("http://localhost:8000/api/v2/files/plots/execute_python_code_1.png")
        );
        assert_eq!(response.data.execution_count, 1);
    }

    #[test]
    fn test_security_rejection() {
        let outcome = ExecutionOutcome::Rejected {
            reason: RejectReason::Security,
            detail: "System command execution is not allowed".to_string(),
        };
        let response = ToolResponse::from_outcome(&outcome, 0, None);
        assert_eq!(response.status, 403);
        assert_eq!(response.message, "Security violation");
        assert_eq!(
            response.data.error.as_deref(),
            Some("System command execution is not allowed")
        );
    }

    #[test]
    fn test_timeout_response() {
        let outcome = ExecutionOutcome::TimedOut {
            after: Duration::from_secs(30),
        };
        let response = ToolResponse::from_outcome(&outcome, 2, None);
        assert_eq!(response.status, 408);
        assert_eq!(response.data.timeout, Some(30));
    }

    #[test]
    fn test_terminal_feedback_hides_raw_error() {
        let outcome = ExecutionOutcome::RuntimeFailure {
            category: ErrorCategory::Name,
            message: "NameError: name 'df' is not defined".to_string(),
            trace: "Traceback ...".to_string(),
        };
        let feedback = RetryFeedback::for_outcome(&outcome, 6, 5);
        let response = ToolResponse::from_outcome(&outcome, 6, feedback);
        assert_eq!(response.status, 500);
        assert_eq!(response.message, "Retry limit reached");
        assert_eq!(response.data.error, None);
        assert_eq!(response.data.traceback, None);
        assert!(response.agent_text().starts_with("Stop retrying"));
    }

    #[test]
    fn test_quota_response_keeps_error() {
        let outcome = ExecutionOutcome::QuotaExceeded {
            scope: QuotaScope::Tool("execute_python_code".to_string()),
            limit: 5,
            used: 5,
        };
        let feedback = RetryFeedback::for_outcome(&outcome, 1, 5);
        let response = ToolResponse::from_outcome(&outcome, 5, feedback);
        assert_eq!(response.status, 429);
        assert_eq!(response.message, "Execution limit reached");
        assert!(response.data.error.is_some());
    }

    #[test]
    fn test_tool_error_is_500() {
        let response = ToolResponse::tool_error(&EngineError::PoolClosed);
        assert_eq!(response.status, 500);
        assert!(response.message.starts_with("Tool error: "));
    }

    #[test]
    fn test_execute_args_default_save_plot() {
        let args: ExecuteArgs = serde_json::from_str(r#"{"code": "print(1)"}"#).unwrap();
        assert!(args.save_plot);
    }
}
