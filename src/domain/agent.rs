// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::value::Value;

/// Optional token/cost accounting an [`Agent`] may report alongside its
/// result, surfaced via `States.CurrentCost`/`States.CurrentTokens`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentUsage {
    pub tokens: u64,
    pub cost: f64,
}

/// An agent's successful output: the result value plus any usage it
/// wants credited to the run's accumulators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    pub result: Value,
    #[serde(default)]
    pub usage: AgentUsage,
}

impl AgentOutput {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            usage: AgentUsage::default(),
        }
    }

    pub fn with_usage(result: Value, tokens: u64, cost: f64) -> Self {
        Self {
            result,
            usage: AgentUsage { tokens, cost },
        }
    }
}

/// An error an [`Agent`] raises performing a Task state's work. `code`
/// belongs to the open `Agent.*` family (anything outside the closed
/// `States.*` taxonomy), and is matched verbatim/prefix/`States.ALL` by
/// a Task's `Retry`/`Catch` entries exactly like interpreter-raised codes.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct AgentError {
    pub code: String,
    pub message: String,
}

impl AgentError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// The boundary a workflow's Task states call through. Implementations
/// are supplied by the embedding application; this crate ships none of
/// its own beyond the `testing::ScriptedAgent` double, since concrete
/// network clients are out of scope.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Performs the task's unit of work against a resolved parameter
    /// mapping (the result of the state's `Parameters`/`InputPath`
    /// resolution) and returns the mapping that becomes the state's raw
    /// result, prior to `ResultSelector`/`ResultPath`.
    async fn invoke(&self, params: Value) -> Result<AgentOutput, AgentError>;
}

/// A name-indexed, read-only-after-construction directory of agents a
/// workflow's Task states resolve `Resource` names against.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, agent: Arc<dyn Agent>) {
        self.agents.insert(name.into(), agent);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoAgent;

    #[async_trait]
    impl Agent for EchoAgent {
        async fn invoke(&self, params: Value) -> Result<AgentOutput, AgentError> {
            Ok(AgentOutput::new(params))
        }
    }

    #[tokio::test]
    async fn registry_resolves_registered_agent_by_name() {
        let mut registry = AgentRegistry::new();
        registry.register("echo", Arc::new(EchoAgent));
        let agent = registry.get("echo").expect("registered");
        let out = agent.invoke(json!({"a": 1})).await.unwrap();
        assert_eq!(out.result, json!({"a": 1}));
    }

    #[test]
    fn registry_reports_unknown_agent_as_absent() {
        let registry = AgentRegistry::new();
        assert!(registry.get("nope").is_none());
        assert!(!registry.contains("nope"));
    }
}
