// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Test doubles for exercising the interpreter without a real agent
//! network or approval channel.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::application::approval::{ApprovalHandler, ApprovalOutcome};
use crate::domain::agent::{Agent, AgentError, AgentOutput};
use crate::domain::value::Value;

/// An [`Agent`] that plays back a scripted sequence of responses in
/// order, one per call to `invoke`. Panics if called more times than
/// scripted, which surfaces unexpected retry/call-count bugs loudly in
/// tests rather than silently looping.
pub struct ScriptedAgent {
    script: Mutex<std::collections::VecDeque<Result<AgentOutput, AgentError>>>,
}

impl ScriptedAgent {
    pub fn new(script: Vec<Result<AgentOutput, AgentError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
        }
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn invoke(&self, _params: Value) -> Result<AgentOutput, AgentError> {
        self.script
            .lock()
            .expect("script mutex poisoned")
            .pop_front()
            .expect("ScriptedAgent called more times than scripted")
    }
}

/// An [`ApprovalHandler`] that auto-approves with a fixed decision
/// value, or, by default, the request's first `options` entry — the
/// "auto-approve to the first option" test default §4.4.9 describes for
/// the no-handler-configured case.
#[derive(Default)]
pub struct InMemoryApprovalHandler {
    decision: Option<Value>,
}

impl InMemoryApprovalHandler {
    pub fn auto_approving(decision: Value) -> Self {
        Self { decision: Some(decision) }
    }
}

#[async_trait]
impl ApprovalHandler for InMemoryApprovalHandler {
    async fn request_approval(&self, request: Value) -> ApprovalOutcome {
        match &self.decision {
            Some(decision) => ApprovalOutcome::Decided(decision.clone()),
            None => {
                let first_option = request["options"]
                    .as_array()
                    .and_then(|opts| opts.first())
                    .cloned()
                    .unwrap_or(Value::Null);
                ApprovalOutcome::Decided(serde_json::json!({
                    "approval": first_option,
                    "approver": "auto",
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn scripted_agent_plays_back_in_order() {
        let agent = ScriptedAgent::new(vec![
            Ok(AgentOutput::new(json!(1))),
            Err(AgentError::new("States.TaskFailed", "boom")),
        ]);
        assert_eq!(agent.invoke(json!({})).await.unwrap().result, json!(1));
        assert!(agent.invoke(json!({})).await.is_err());
    }

    #[tokio::test]
    async fn in_memory_approval_defaults_to_first_option() {
        let handler = InMemoryApprovalHandler::default();
        let outcome = handler
            .request_approval(json!({"options": ["approve", "reject"]}))
            .await;
        match outcome {
            ApprovalOutcome::Decided(v) => assert_eq!(v["approval"], json!("approve")),
            _ => panic!("expected decided outcome"),
        }
    }
}
