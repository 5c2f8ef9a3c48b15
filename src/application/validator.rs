// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Validator
//!
//! Structural validation beyond what [`crate::domain::workflow::WorkflowDefinition::validate`]
//! already enforces at the shape level: kind-specific required-field
//! checks that don't fit serde's required/optional distinction.

use crate::domain::error::EngineError;
use crate::domain::workflow::{StateDefinition, WorkflowDefinition};

/// Runs structural validation and returns the list of unreachable-state
/// warnings on success. This never inspects runtime data — only the
/// workflow's shape.
pub fn validate(workflow: &WorkflowDefinition) -> Result<Vec<String>, EngineError> {
    let warnings = workflow.validate()?;

    for (name, state) in &workflow.states {
        if let StateDefinition::Wait(w) = state {
            if w.seconds.is_none()
                && w.seconds_path.is_none()
                && w.timestamp.is_none()
                && w.timestamp_path.is_none()
            {
                return Err(EngineError::Validation(format!(
                    "Wait state '{name}' needs one of Seconds, SecondsPath, Timestamp, or TimestampPath"
                )));
            }
        }
        if let StateDefinition::Map(m) = state {
            m.iterator.validate()?;
        }
        if let StateDefinition::Parallel(p) = state {
            for branch in &p.branches {
                branch.validate()?;
            }
        }
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_wait_state_with_no_time_field() {
        let wf: WorkflowDefinition = serde_json::from_value(json!({
            "StartAt": "Pause",
            "States": {
                "Pause": {"Type": "Wait", "End": true}
            }
        }))
        .unwrap();
        assert!(validate(&wf).is_err());
    }

    #[test]
    fn accepts_wait_state_with_seconds() {
        let wf: WorkflowDefinition = serde_json::from_value(json!({
            "StartAt": "Pause",
            "States": {
                "Pause": {"Type": "Wait", "Seconds": 5, "End": true}
            }
        }))
        .unwrap();
        assert!(validate(&wf).is_ok());
    }
}
