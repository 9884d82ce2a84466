//! Interceptor chain
//!
//! Ordered, pluggable stages around every execution. Each stage sees the
//! request and a mutable view of the conversation's state before the engine
//! runs it, and the outcome plus the response after. A `before_execute` that
//! returns a response short-circuits the request; the remaining stages and the
//! isolate are skipped.

use chrono::Utc;
use regex::Regex;
use std::sync::OnceLock;

use crate::outcome::{ExecutionOutcome, ExecutionRequest};
use crate::quota::{ConversationExecutionState, HistoryEntry};
use crate::response::ToolResponse;

/// Most variables remembered per history entry.
const MAX_TRACKED_VARIABLES: usize = 10;

const COMMON_VARIABLES: &[&str] = &["df", "data", "X", "y", "model", "results", "fig", "ax"];

pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    fn before_execute(
        &self,
        _request: &ExecutionRequest,
        _state: &mut ConversationExecutionState,
    ) -> Option<ToolResponse> {
        None
    }

    fn after_execute(
        &self,
        _request: &ExecutionRequest,
        _outcome: &ExecutionOutcome,
        _response: &mut ToolResponse,
        _state: &mut ConversationExecutionState,
    ) {
    }
}

/// Keeps the bounded code history, the last successful snippet and the
/// variables the agent has been working with.
#[derive(Debug, Default)]
pub struct CodeMemory;

impl Interceptor for CodeMemory {
    fn name(&self) -> &str {
        "code_memory"
    }

    fn after_execute(
        &self,
        request: &ExecutionRequest,
        outcome: &ExecutionOutcome,
        _response: &mut ToolResponse,
        state: &mut ConversationExecutionState,
    ) {
        let variables = extract_variables(&request.code);
        if outcome.is_success() {
            state.note_success(&request.code, &variables);
        }
        state.push_history(HistoryEntry {
            timestamp: Utc::now(),
            code: request.code.clone(),
            outcome_kind: outcome.kind(),
            referenced_variables: variables,
        });
        tracing::debug!(
            conversation_id = %request.conversation_id,
            history = state.history().len(),
            "Tracked code execution"
        );
    }
}

/// Logs one line per finished request.
#[derive(Debug, Default)]
pub struct ExecutionLog;

impl Interceptor for ExecutionLog {
    fn name(&self) -> &str {
        "execution_log"
    }

    fn after_execute(
        &self,
        request: &ExecutionRequest,
        outcome: &ExecutionOutcome,
        response: &mut ToolResponse,
        state: &mut ConversationExecutionState,
    ) {
        if outcome.is_success() {
            tracing::info!(
                conversation_id = %request.conversation_id,
                status = response.status,
                executions = state.total_executions(),
                "Code executed successfully"
            );
        } else {
            tracing::warn!(
                conversation_id = %request.conversation_id,
                status = response.status,
                outcome = ?outcome.kind(),
                consecutive_failures = state.consecutive_failures(),
                "{}",
                response.message
            );
        }
    }
}

fn assignment() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\w+)\s*=(?:[^=]|$)").ok())
        .as_ref()
}

/// Common analysis variable names (and any `df_*`) assigned in `code`, first
/// occurrence order, at most ten.
pub fn extract_variables(code: &str) -> Vec<String> {
    let Some(re) = assignment() else {
        return Vec::new();
    };
    let mut found: Vec<String> = Vec::new();
    for caps in re.captures_iter(code) {
        let Some(name) = caps.get(1).map(|m| m.as_str()) else {
            continue;
        };
        let tracked = COMMON_VARIABLES.contains(&name) || name.starts_with("df_");
        if tracked && !found.iter().any(|v| v == name) {
            found.push(name.to_string());
            if found.len() == MAX_TRACKED_VARIABLES {
                break;
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_extract_common_variables() {
        let code = "df = pd.read_csv('a.csv')\ndf_clean = df.dropna()\ncount = 3\nfig, ax = plt.subplots()\nif count == 3:\n    model = 1\n";
        assert_eq!(
            extract_variables(code),
            vec!["df", "df_clean", "ax", "model"]
        );
    }

    #[test]
    fn test_comparison_is_not_assignment() {
        assert!(extract_variables("print(df == 1)").is_empty());
    }

    #[test]
    fn test_variable_cap() {
        let code: String = (0..15).map(|i| format!("df_{} = {}\n", i, i)).collect();
        assert_eq!(extract_variables(&code).len(), MAX_TRACKED_VARIABLES);
    }

    #[test]
    fn test_code_memory_records_history_and_success() {
        let mut state = ConversationExecutionState::new(2);
        let memory = CodeMemory;
        let request = ExecutionRequest::new("c", "df = 1");
        let ok = ExecutionOutcome::Success {
            stdout: String::new(),
            stderr: String::new(),
            artifacts: vec![],
        };
        let mut response = ToolResponse::from_outcome(&ok, 1, None);
        memory.after_execute(&request, &ok, &mut response, &mut state);

        assert_eq!(state.last_successful_code(), Some("df = 1"));
        assert_eq!(state.active_variables(), &["df".to_string()]);
        assert_eq!(state.history().len(), 1);
    }
}
