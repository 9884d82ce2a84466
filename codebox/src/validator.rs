//! Static pre-execution gate for submitted snippets.
//!
//! Stage 1 is a lower-cased substring scan against a fixed deny-list; the first
//! hit rejects with a message naming the construct. Stage 2 parses the snippet
//! into a Python AST and rejects on parse failure with the parser's message and
//! location. Stage 1 always runs first.

use rustpython_parser::{ast, Parse};
use serde::{Deserialize, Serialize};

use crate::outcome::{ExecutionOutcome, RejectReason};

/// One forbidden construct and the message returned when it is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DenyRule {
    pub pattern: &'static str,
    pub message: &'static str,
}

/// Process spawning, dynamic evaluation, file I/O, network access, process
/// signaling and reflective namespace access.
pub const DENY_RULES: &[DenyRule] = &[
    DenyRule { pattern: "os.system", message: "System command execution is not allowed" },
    DenyRule { pattern: "subprocess", message: "Subprocess execution is not allowed" },
    DenyRule { pattern: "eval(", message: "eval() is not allowed for security" },
    DenyRule { pattern: "exec(", message: "exec() is not allowed for security" },
    DenyRule { pattern: "compile(", message: "compile() is not allowed for security" },
    DenyRule { pattern: "__import__", message: "Dynamic imports are restricted" },
    DenyRule {
        pattern: "open(",
        message: "Direct file operations are restricted. Use pandas.read_csv/read_excel instead",
    },
    DenyRule { pattern: "os.remove", message: "File deletion is not allowed" },
    DenyRule { pattern: "os.rmdir", message: "Directory deletion is not allowed" },
    DenyRule { pattern: "shutil.rmtree", message: "Directory deletion is not allowed" },
    DenyRule { pattern: "socket", message: "Network operations are not allowed" },
    DenyRule { pattern: "urllib", message: "Network operations are not allowed" },
    DenyRule { pattern: "requests", message: "Network operations are not allowed" },
    DenyRule { pattern: "http", message: "Network operations are not allowed" },
    DenyRule { pattern: "os.fork", message: "Process forking is not allowed" },
    DenyRule { pattern: "os.kill", message: "Process operations are not allowed" },
    DenyRule { pattern: "setsid", message: "Process operations are not allowed" },
    DenyRule { pattern: "setpgid", message: "Process operations are not allowed" },
    DenyRule { pattern: "setpgrp", message: "Process operations are not allowed" },
    DenyRule { pattern: "_exit(", message: "Process operations are not allowed" },
    DenyRule { pattern: "multiprocessing", message: "Process forking is not allowed" },
    DenyRule { pattern: "processpoolexecutor", message: "Process forking is not allowed" },
    DenyRule { pattern: "os.spawn", message: "Process forking is not allowed" },
    DenyRule { pattern: "posix_spawn", message: "Process forking is not allowed" },
    DenyRule { pattern: "os.exec", message: "System command execution is not allowed" },
    DenyRule { pattern: "os.popen", message: "System command execution is not allowed" },
    DenyRule { pattern: "openpty", message: "Process forking is not allowed" },
    DenyRule { pattern: "import pty", message: "Process forking is not allowed" },
    DenyRule { pattern: "from pty", message: "Process forking is not allowed" },
    DenyRule { pattern: "globals()", message: "Access to globals is restricted" },
    DenyRule { pattern: "locals()", message: "Access to locals is restricted" },
    DenyRule { pattern: "vars()", message: "Access to vars is restricted" },
    DenyRule { pattern: "dir()", message: "Access to dir is restricted" },
];

/// Why a snippet was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: RejectReason,
    /// Human-readable explanation
    pub detail: String,
    /// Deny-listed construct that matched (security rejections only)
    pub construct: Option<String>,
    /// 1-based (line, column) of a parse failure
    pub location: Option<(usize, usize)>,
}

impl Rejection {
    /// Message as surfaced to the caller, prefixed with the rejection class.
    pub fn message(&self) -> String {
        match self.reason {
            RejectReason::Security => format!("Security violation: {}", self.detail),
            RejectReason::Syntax => format!("Syntax error: {}", self.detail),
        }
    }

    pub fn into_outcome(self) -> ExecutionOutcome {
        ExecutionOutcome::Rejected {
            reason: self.reason,
            detail: self.detail,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Validator {
    rules: &'static [DenyRule],
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator {
    pub fn new() -> Self {
        Self { rules: DENY_RULES }
    }

    pub fn validate(&self, code: &str) -> Result<(), Rejection> {
        self.scan(code)?;
        check_syntax(code)
    }

    /// Stage 1: deny-list scan. Cheap, so it always precedes the parse.
    pub fn scan(&self, code: &str) -> Result<(), Rejection> {
        let lowered = code.to_lowercase();
        match self
            .rules
            .iter()
            .find(|rule| lowered.contains(rule.pattern))
        {
            Some(rule) => Err(Rejection {
                reason: RejectReason::Security,
                detail: rule.message.to_string(),
                construct: Some(rule.pattern.to_string()),
                location: None,
            }),
            None => Ok(()),
        }
    }
}

/// Stage 2: parse the snippet as a Python module.
pub fn check_syntax(code: &str) -> Result<(), Rejection> {
    match ast::Suite::parse(code, "<snippet>") {
        Ok(_) => Ok(()),
        Err(err) => {
            let offset = u32::from(err.offset) as usize;
            let (line, column) = line_column(code, offset);
            Err(Rejection {
                reason: RejectReason::Syntax,
                detail: format!("{} (line {}, column {})", err.error, line, column),
                construct: None,
                location: Some((line, column)),
            })
        }
    }
}

fn line_column(code: &str, offset: usize) -> (usize, usize) {
    let mut end = offset.min(code.len());
    while !code.is_char_boundary(end) {
        end -= 1;
    }
    let prefix = &code[..end];
    let line = prefix.matches('\n').count() + 1;
    let column = match prefix.rfind('\n') {
        Some(pos) => prefix[pos + 1..].chars().count() + 1,
        None => prefix.chars().count() + 1,
    };
    (line, column)
}
