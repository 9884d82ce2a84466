//! Execution requests and their terminal outcomes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// A single code submission. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    pub capture_plot: bool,
    pub conversation_id: String,
}

impl ExecutionRequest {
    pub fn new(conversation_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            capture_plot: true,
            conversation_id: conversation_id.into(),
        }
    }

    pub fn with_capture_plot(mut self, capture_plot: bool) -> Self {
        self.capture_plot = capture_plot;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// A deny-listed construct was found
    Security,
    /// The snippet does not parse
    Syntax,
}

/// Category of an error raised by user code, used to pick a remedy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Syntax,
    Name,
    Type,
    Value,
    Import,
    IndexOrKey,
    Attribute,
    ZeroDivision,
    Timeout,
    Memory,
    Other,
}

impl ErrorCategory {
    /// Map a Python exception class name onto a category.
    pub fn from_exception(name: &str) -> Self {
        match name {
            "SyntaxError" | "IndentationError" | "TabError" => ErrorCategory::Syntax,
            "NameError" | "UnboundLocalError" => ErrorCategory::Name,
            "TypeError" => ErrorCategory::Type,
            "ValueError" | "UnicodeDecodeError" | "UnicodeEncodeError" => ErrorCategory::Value,
            "ImportError" | "ModuleNotFoundError" => ErrorCategory::Import,
            "IndexError" | "KeyError" | "LookupError" => ErrorCategory::IndexOrKey,
            "AttributeError" => ErrorCategory::Attribute,
            "ZeroDivisionError" | "FloatingPointError" => ErrorCategory::ZeroDivision,
            "TimeoutError" => ErrorCategory::Timeout,
            "MemoryError" => ErrorCategory::Memory,
            _ => ErrorCategory::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Syntax => "syntax",
            ErrorCategory::Name => "name",
            ErrorCategory::Type => "type",
            ErrorCategory::Value => "value",
            ErrorCategory::Import => "import",
            ErrorCategory::IndexOrKey => "index_or_key",
            ErrorCategory::Attribute => "attribute",
            ErrorCategory::ZeroDivision => "zero_division",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Memory => "memory",
            ErrorCategory::Other => "other",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Figure,
    Html,
}

/// A published artifact: where it lives on disk and where it is served from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub local_path: PathBuf,
    pub public_url: String,
}

/// Which quota a denied request ran into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaScope {
    Conversation,
    Tool(String),
}

/// Terminal state of one request. Exactly one variant per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success {
        stdout: String,
        stderr: String,
        artifacts: Vec<Artifact>,
    },
    Rejected {
        reason: RejectReason,
        detail: String,
    },
    TimedOut {
        #[serde(with = "duration_secs")]
        after: Duration,
    },
    MemoryExceeded {
        limit_mb: u64,
    },
    RuntimeFailure {
        category: ErrorCategory,
        message: String,
        trace: String,
    },
    QuotaExceeded {
        scope: QuotaScope,
        limit: u32,
        used: u32,
    },
}

/// Discriminant of [`ExecutionOutcome`], kept in code history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    SecurityRejected,
    SyntaxRejected,
    TimedOut,
    MemoryExceeded,
    RuntimeFailure,
    QuotaExceeded,
}

impl ExecutionOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            ExecutionOutcome::Success { .. } => OutcomeKind::Success,
            ExecutionOutcome::Rejected {
                reason: RejectReason::Security,
                ..
            } => OutcomeKind::SecurityRejected,
            ExecutionOutcome::Rejected {
                reason: RejectReason::Syntax,
                ..
            } => OutcomeKind::SyntaxRejected,
            ExecutionOutcome::TimedOut { .. } => OutcomeKind::TimedOut,
            ExecutionOutcome::MemoryExceeded { .. } => OutcomeKind::MemoryExceeded,
            ExecutionOutcome::RuntimeFailure { .. } => OutcomeKind::RuntimeFailure,
            ExecutionOutcome::QuotaExceeded { .. } => OutcomeKind::QuotaExceeded,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    /// Status code used as discriminant on the tool-call wire format.
    pub fn status_code(&self) -> u16 {
        match self {
            ExecutionOutcome::Success { .. } => 200,
            ExecutionOutcome::Rejected { .. } => 403,
            ExecutionOutcome::TimedOut { .. } => 408,
            ExecutionOutcome::QuotaExceeded { .. } => 429,
            ExecutionOutcome::RuntimeFailure { .. } => 500,
            ExecutionOutcome::MemoryExceeded { .. } => 507,
        }
    }

    /// Error category for failures that can be fixed by regenerating code.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            ExecutionOutcome::Rejected {
                reason: RejectReason::Syntax,
                ..
            } => Some(ErrorCategory::Syntax),
            ExecutionOutcome::TimedOut { .. } => Some(ErrorCategory::Timeout),
            ExecutionOutcome::MemoryExceeded { .. } => Some(ErrorCategory::Memory),
            ExecutionOutcome::RuntimeFailure { category, .. } => Some(*category),
            _ => None,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}
