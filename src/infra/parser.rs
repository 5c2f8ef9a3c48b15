// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Workflow Parser
//!
//! Loads a [`WorkflowDefinition`] from JSON (the canonical wire format)
//! or YAML text, then runs structural validation before handing it back
//! to the caller.

use crate::application::validator;
use crate::domain::error::EngineError;
use crate::domain::workflow::WorkflowDefinition;

pub struct WorkflowParser;

impl WorkflowParser {
    /// Parses `text` as JSON first, falling back to YAML on failure,
    /// then runs structural validation. Returns the unreachable-state
    /// warnings alongside the parsed definition.
    pub fn parse(text: &str) -> Result<(WorkflowDefinition, Vec<String>), EngineError> {
        let workflow = Self::parse_json(text)
            .or_else(|_| Self::parse_yaml(text))
            .map_err(|e| EngineError::Parse(e.to_string()))?;
        let warnings = validator::validate(&workflow)?;
        Ok((workflow, warnings))
    }

    pub fn parse_json(text: &str) -> Result<WorkflowDefinition, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn parse_yaml(text: &str) -> Result<WorkflowDefinition, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_json() {
        let text = r#"{
            "StartAt": "Greet",
            "States": { "Greet": { "Type": "Succeed" } }
        }"#;
        let (wf, warnings) = WorkflowParser::parse(text).unwrap();
        assert_eq!(wf.start_at, "Greet");
        assert!(warnings.is_empty());
    }

    #[test]
    fn parses_yaml_manifest() {
        let text = "StartAt: Greet\nStates:\n  Greet:\n    Type: Succeed\n";
        let (wf, _) = WorkflowParser::parse(text).unwrap();
        assert_eq!(wf.start_at, "Greet");
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(WorkflowParser::parse("not a workflow").is_err());
    }
}
