//! Structured retry feedback
//!
//! Turns a failed outcome into something the calling agent can act on: the
//! error category, a targeted remedy and the attempts left before the
//! consecutive-failure ceiling. Past the ceiling the feedback becomes terminal
//! and no longer carries the raw error.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::outcome::{ErrorCategory, ExecutionOutcome, QuotaScope, RejectReason};

pub const COMMON_FIXES: &str = "Common fixes:
- SyntaxError: Check for missing parentheses, brackets, quotes, colons, or indentation
- NameError: Define missing variables or fix typos
- TypeError: Convert types or use correct operations
- ValueError: Use valid values or add validation
- ImportError: Use pre-imported libraries (np, pd, plt, scipy, stats, sns, sympy, math, random)
- IndexError/KeyError: Check array bounds or dictionary keys
- AttributeError: Use correct method or attribute names
- ZeroDivisionError: Add zero checks before division
- Timeout: Simplify the computation or work on a sample of the data
- MemoryError: Reduce data size or process it in chunks";

/// Targeted fix for one error category.
pub fn remedy(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::Syntax => {
            "Check for missing parentheses, brackets, quotes, colons, or indentation."
        }
        ErrorCategory::Name => "Define missing variables or fix typos in names.",
        ErrorCategory::Type => "Convert values to the expected types or use the correct operation.",
        ErrorCategory::Value => "Use valid values or validate inputs before using them.",
        ErrorCategory::Import => {
            "Use the pre-imported libraries (np, pd, plt, scipy, stats, sns, sympy, math, random) \
             instead of importing new ones."
        }
        ErrorCategory::IndexOrKey => {
            "Check array bounds and dictionary keys; inspect df.columns or len() first."
        }
        ErrorCategory::Attribute => "Use the correct method or attribute name for the object.",
        ErrorCategory::ZeroDivision => "Add a zero check before dividing.",
        ErrorCategory::Timeout => {
            "Simplify the computation, avoid unbounded loops, or work on a sample of the data."
        }
        ErrorCategory::Memory => {
            "Reduce the data size, process it in chunks, or drop intermediate objects."
        }
        ErrorCategory::Other => "Read the traceback, fix the failing line and retry.",
    }
}

/// Feedback attached to every non-successful response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryFeedback {
    pub category: Option<ErrorCategory>,
    pub remedy: String,
    pub message: String,
    /// The caller should stop retrying
    pub terminal: bool,
    pub consecutive_failures: u32,
    pub attempts_left: u32,
}

impl RetryFeedback {
    /// Build feedback for `outcome` given the failure streak it produced.
    /// Returns None for a success.
    pub fn for_outcome(outcome: &ExecutionOutcome, consecutive_failures: u32, ceiling: u32) -> Option<Self> {
        if outcome.is_success() {
            return None;
        }
        let category = outcome.category();
        let attempts_left = ceiling.saturating_sub(consecutive_failures);

        if consecutive_failures > ceiling {
            return Some(Self {
                category,
                remedy: "Stop retrying and ask the user for help.".to_string(),
                message: format!(
                    "Stop retrying: {} consecutive executions failed. Do not call \
                     execute_python_code again for this problem. Explain to the user what \
                     you were trying to do and what went wrong, and ask for help.",
                    consecutive_failures
                ),
                terminal: true,
                consecutive_failures,
                attempts_left: 0,
            });
        }

        let (remedy, message, terminal) = match outcome {
            ExecutionOutcome::Rejected {
                reason: RejectReason::Security,
                detail,
            } => {
                let remedy = "Remove the forbidden construct. Load data with pandas readers \
                              and use the pre-imported libraries.";
                (
                    remedy.to_string(),
                    format!(
                        "Code was rejected before execution: {}.\n\n{} Then call \
                         execute_python_code again ({} attempts left).",
                        detail, remedy, attempts_left
                    ),
                    false,
                )
            }
            ExecutionOutcome::QuotaExceeded { scope, limit, used } => {
                let what = match scope {
                    QuotaScope::Conversation => "this conversation".to_string(),
                    QuotaScope::Tool(tool) => format!("tool '{}'", tool),
                };
                let remedy = "Do not retry. Answer with the results gathered so far.";
                (
                    remedy.to_string(),
                    format!(
                        "Execution limit reached for {} ({} of {} used). {}",
                        what, used, limit, remedy
                    ),
                    true,
                )
            }
            _ => {
                let category = category.unwrap_or(ErrorCategory::Other);
                let remedy = remedy(category);
                (
                    remedy.to_string(),
                    failure_message(outcome, category, remedy, attempts_left),
                    false,
                )
            }
        };

        Some(Self {
            category,
            remedy,
            message,
            terminal,
            consecutive_failures,
            attempts_left,
        })
    }
}

fn failure_message(
    outcome: &ExecutionOutcome,
    category: ErrorCategory,
    remedy: &str,
    attempts_left: u32,
) -> String {
    let (error, trace) = match outcome {
        ExecutionOutcome::RuntimeFailure { message, trace, .. } => (message.clone(), trace.as_str()),
        ExecutionOutcome::Rejected { detail, .. } => (format!("SyntaxError: {}", detail), ""),
        ExecutionOutcome::TimedOut { after } => (
            format!("Execution exceeded {} seconds", after.as_secs()),
            "",
        ),
        ExecutionOutcome::MemoryExceeded { limit_mb } => {
            (format!("Execution exceeded {} MB of memory", limit_mb), "")
        }
        _ => (String::new(), ""),
    };

    let mut text = format!(
        "Code execution failed with error:\n\nError Type: {}\nError: {}\n",
        category, error
    );
    if !trace.is_empty() {
        text.push_str(&format!("\nFull Traceback:\n{}\n", trace));
    }
    text.push_str(&format!(
        "\nSuggested fix: {}\n\nFix the code based on the error message and call \
         execute_python_code again with the corrected code ({} attempts left).\n\n{}",
        remedy, attempts_left, COMMON_FIXES
    ));
    text
}

fn exception_line() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\w+(?:Error|Exception|Interrupt)): ?(.*)$").ok())
        .as_ref()
}

/// Find the last `SomethingError: message` line of a traceback.
///
/// Used when the worker died without a structured payload and only its stderr
/// is left to categorise.
pub fn classify_trace(trace: &str) -> Option<(ErrorCategory, String)> {
    let re = exception_line()?;
    trace.lines().rev().find_map(|line| {
        re.captures(line.trim()).map(|caps| {
            let name = caps.get(1).map_or("", |m| m.as_str());
            let message = caps.get(2).map_or("", |m| m.as_str());
            (ErrorCategory::from_exception(name), format!("{}: {}", name, message))
        })
    })
}
