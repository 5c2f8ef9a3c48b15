// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structural failures: malformed workflow definitions, path syntax, or
/// internal invariant violations. These can never be caught by a
/// workflow's own `Catch` clauses — they indicate the workflow or its
/// inputs are not well-formed, not that a state's work failed.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow has no StartAt state")]
    MissingStartAt,

    #[error("state '{0}' referenced but not defined")]
    UndefinedState(String),

    #[error("state '{0}' is neither terminal nor transitioning (missing Next/End)")]
    DanglingState(String),

    #[error(transparent)]
    Path(#[from] crate::domain::value::PathError),

    #[error(transparent)]
    Intrinsic(#[from] crate::domain::intrinsics::IntrinsicError),

    #[error("workflow definition is invalid: {0}")]
    Validation(String),

    #[error("failed to parse workflow definition: {0}")]
    Parse(String),
}

/// The closed taxonomy of error codes produced by the interpreter itself,
/// distinct from the open `Agent.*` family a registered [`crate::domain::agent::Agent`]
/// may raise.
pub mod codes {
    pub const ALL: &str = "States.ALL";
    pub const ERROR: &str = "States.Error";
    pub const VALIDATION_ERROR: &str = "States.ValidationError";
    pub const STATE_NOT_FOUND: &str = "States.StateNotFound";
    pub const AGENT_NOT_FOUND: &str = "States.AgentNotFound";
    pub const TASK_FAILED: &str = "States.TaskFailed";
    pub const TIMEOUT: &str = "States.Timeout";
    pub const RESULT_PATH_MATCH_FAILURE: &str = "States.ResultPathMatchFailure";
    pub const PARAMETER_PATH_FAILURE: &str = "States.ParameterPathFailure";
    pub const INTRINSIC_FAILURE: &str = "States.IntrinsicFailure";
    pub const BUDGET_EXCEEDED: &str = "States.BudgetExceeded";
    pub const NO_CHOICE_MATCHED: &str = "States.NoChoiceMatched";
    pub const EXECUTION_PAUSED: &str = "States.ExecutionPaused";

    /// Fallback used for the handful of internal failures (a malformed
    /// path expression, a sub-machine's own engine error surfacing through
    /// a nested `run_from`, ...) that don't warrant their own taxonomy
    /// entry. Matched like any other code by `Retry`/`Catch`'s
    /// `States.ALL`/prefix rules.
    pub const RUNTIME: &str = ERROR;
}

/// A catchable, data-valued workflow error. Unlike [`EngineError`] this
/// is not a Rust exception — it flows through `Retry`/`Catch` matching
/// and can be embedded in a workflow's output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateError {
    pub code: String,
    pub cause: String,
    pub state: String,
}

impl StateError {
    pub fn new(code: impl Into<String>, cause: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            cause: cause.into(),
            state: state.into(),
        }
    }

    /// Whether `pattern` (a verbatim code, `States.ALL`, or a
    /// `Prefix.`-style dotted prefix) matches this error's code.
    pub fn matches(&self, pattern: &str) -> bool {
        if pattern == codes::ALL {
            return true;
        }
        if pattern == self.code {
            return true;
        }
        if let Some(prefix) = pattern.strip_suffix('.') {
            return self.code == prefix || self.code.starts_with(pattern);
        }
        false
    }
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} in state '{}': {}", self.code, self.state, self.cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_verbatim_code() {
        let e = StateError::new("States.TaskFailed", "boom", "DoWork");
        assert!(e.matches("States.TaskFailed"));
        assert!(!e.matches("States.Timeout"));
    }

    #[test]
    fn matches_all_wildcard() {
        let e = StateError::new("Agent.ToolError", "boom", "DoWork");
        assert!(e.matches(codes::ALL));
    }

    #[test]
    fn matches_dotted_prefix() {
        let e = StateError::new("Agent.ToolError.Timeout", "boom", "DoWork");
        assert!(e.matches("Agent.ToolError."));
        assert!(e.matches("Agent."));
        assert!(!e.matches("Agent.Other."));
    }

    #[test]
    fn prefix_without_trailing_dot_is_not_a_prefix_match() {
        let e = StateError::new("Agent.ToolErrorExtra", "boom", "DoWork");
        assert!(!e.matches("Agent.ToolError"));
    }
}
