//! Quota & retry coordinator
//!
//! Admission is checked synchronously before a request ever reaches the worker
//! pool, so a denial costs no sandbox resources. Quota is charged only when an
//! isolate actually starts; outcomes are recorded afterwards and turned into
//! retry feedback.

use serde::{Deserialize, Serialize};

use super::state::Conversation;
use crate::feedback::RetryFeedback;
use crate::outcome::{ExecutionOutcome, QuotaScope};
use crate::policy::QuotaLimits;

/// Why admission was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDenial {
    pub scope: QuotaScope,
    pub limit: u32,
    pub used: u32,
}

impl QuotaDenial {
    pub fn into_outcome(self) -> ExecutionOutcome {
        ExecutionOutcome::QuotaExceeded {
            scope: self.scope,
            limit: self.limit,
            used: self.used,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Denied(QuotaDenial),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Budget left for one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remaining {
    pub total: u32,
    /// None when the tool has no dedicated cap
    pub tool: Option<u32>,
}

#[derive(Debug)]
pub struct QuotaCoordinator {
    limits: QuotaLimits,
}

impl QuotaCoordinator {
    pub fn new(limits: QuotaLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &QuotaLimits {
        &self.limits
    }

    /// Check both the tool cap and the conversation-wide cap. Charges nothing.
    pub fn admit(&self, conversation: &Conversation, tool_name: &str) -> Admission {
        conversation.with_state(|state| {
            if let Some(limit) = self.limits.tool_limit(tool_name) {
                let used = state.tool_executions(tool_name);
                if used >= limit {
                    return Admission::Denied(QuotaDenial {
                        scope: QuotaScope::Tool(tool_name.to_string()),
                        limit,
                        used,
                    });
                }
            }
            let used = state.total_executions();
            if used >= self.limits.max_executions {
                return Admission::Denied(QuotaDenial {
                    scope: QuotaScope::Conversation,
                    limit: self.limits.max_executions,
                    used,
                });
            }
            Admission::Admitted
        })
    }

    /// Count one execution of `tool_name`; called once the run actually starts.
    pub fn charge(&self, conversation: &Conversation, tool_name: &str) {
        conversation.with_state(|state| state.charge(tool_name));
    }

    /// Update the failure streak for `outcome` and build the caller's feedback.
    pub fn record(&self, conversation: &Conversation, outcome: &ExecutionOutcome) -> Option<RetryFeedback> {
        let failures = conversation.with_state(|state| state.record_result(outcome.is_success()));
        if failures > self.limits.max_consecutive_failures {
            tracing::warn!(
                conversation_id = conversation.id(),
                failures,
                "Consecutive failure ceiling exceeded, feedback is terminal"
            );
        }
        RetryFeedback::for_outcome(outcome, failures, self.limits.max_consecutive_failures)
    }

    pub fn remaining(&self, conversation: &Conversation, tool_name: &str) -> Remaining {
        let (total, tool) = conversation.with_state(|state| {
            (state.total_executions(), state.tool_executions(tool_name))
        });
        Remaining {
            total: self.limits.max_executions.saturating_sub(total),
            tool: self
                .limits
                .tool_limit(tool_name)
                .map(|limit| limit.saturating_sub(tool)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::ErrorCategory;
    use crate::policy::EXECUTE_TOOL;
    use crate::quota::ConversationStore;

    fn coordinator() -> QuotaCoordinator {
        QuotaCoordinator::new(QuotaLimits::default())
    }

    fn failure() -> ExecutionOutcome {
        ExecutionOutcome::RuntimeFailure {
            category: ErrorCategory::Name,
            message: "NameError: name 'x' is not defined".to_string(),
            trace: String::new(),
        }
    }

    #[test]
    fn test_admit_does_not_charge() {
        let coordinator = coordinator();
        let store = ConversationStore::new(20);
        let c = store.get_or_create("c");
        for _ in 0..20 {
            assert!(coordinator.admit(&c, EXECUTE_TOOL).is_admitted());
        }
        assert_eq!(coordinator.remaining(&c, EXECUTE_TOOL).tool, Some(5));
    }

    #[test]
    fn test_tool_cap_denies_without_touching_other_tools() {
        let coordinator = coordinator();
        let store = ConversationStore::new(20);
        let c = store.get_or_create("c");
        for _ in 0..5 {
            assert!(coordinator.admit(&c, EXECUTE_TOOL).is_admitted());
            coordinator.charge(&c, EXECUTE_TOOL);
        }
        match coordinator.admit(&c, EXECUTE_TOOL) {
            Admission::Denied(denial) => {
                assert_eq!(denial.scope, QuotaScope::Tool(EXECUTE_TOOL.to_string()));
                assert_eq!(denial.limit, 5);
                assert_eq!(denial.used, 5);
            }
            other => panic!("expected denial, got {:?}", other),
        }
        let vision = coordinator.remaining(&c, "analyze_graph_chart");
        assert_eq!(vision.tool, Some(3));
        assert_eq!(vision.total, 5);
        assert!(coordinator.admit(&c, "analyze_graph_chart").is_admitted());
    }

    #[test]
    fn test_conversation_cap() {
        let coordinator = coordinator();
        let store = ConversationStore::new(20);
        let c = store.get_or_create("c");
        for _ in 0..10 {
            coordinator.charge(&c, "get_column_info");
        }
        match coordinator.admit(&c, "get_column_info") {
            Admission::Denied(denial) => assert_eq!(denial.scope, QuotaScope::Conversation),
            other => panic!("expected denial, got {:?}", other),
        }
        let other = store.get_or_create("other");
        assert!(coordinator.admit(&other, "get_column_info").is_admitted());
    }

    #[test]
    fn test_sixth_failure_is_terminal() {
        let coordinator = coordinator();
        let store = ConversationStore::new(20);
        let c = store.get_or_create("c");
        for attempt in 1..=5 {
            let feedback = coordinator.record(&c, &failure()).unwrap();
            assert!(!feedback.terminal, "attempt {}", attempt);
        }
        let feedback = coordinator.record(&c, &failure()).unwrap();
        assert!(feedback.terminal);
        assert_eq!(feedback.consecutive_failures, 6);
    }
}
