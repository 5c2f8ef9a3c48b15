// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use tokio::time::Duration;
use tracing::{debug, warn};

use crate::domain::agent::AgentError;
use crate::domain::context::ExecutionContext;
use crate::domain::error::{codes, EngineError, StateError};
use crate::domain::value::Value;
use crate::domain::workflow::{CatchRule, JitterStrategy, RetryRule, StateDefinition, TaskState};

use crate::application::interpreter::Interpreter;

use super::{shape_input, shape_output, terminate_or_transition, StateOutcome};

pub async fn execute(
    interpreter: &Interpreter,
    state: &TaskState,
    name: &str,
    input: Value,
    ctx: &mut ExecutionContext,
) -> Result<StateOutcome, EngineError> {
    let Some(agent) = interpreter.agents.get(&state.resource) else {
        let error = StateError::new(
            codes::AGENT_NOT_FOUND,
            format!("no agent registered under the name '{}'", state.resource),
            name,
        );
        if let Some(catcher) = matching_catch(&state.catch, &error) {
            let error_value = serde_json::to_value(&error).unwrap_or(Value::Null);
            let merged = crate::domain::value::apply_result_path(catcher.result_path.as_deref(), &input, error_value);
            return Ok(match merged {
                Ok(data) => StateOutcome::Transition(catcher.next.clone(), data),
                Err(e) => StateOutcome::Failure(StateError::new(codes::RESULT_PATH_MATCH_FAILURE, e.to_string(), name)),
            });
        }
        return Ok(StateOutcome::Failure(error));
    };

    let params = match shape_input(&state.flow, name, &input, ctx) {
        Ok(v) => v,
        Err(e) => return Ok(StateOutcome::Failure(e)),
    };

    let mut attempt: u32 = 0;
    let raw_result = loop {
        attempt += 1;
        debug!(state = name, attempt, "invoking task agent");
        let invocation = agent.invoke(params.clone());
        let outcome = match state.timeout_seconds {
            Some(secs) => match tokio::time::timeout(Duration::from_secs_f64(secs), invocation).await {
                Ok(inner) => inner,
                Err(_elapsed) => Err(AgentError::new(
                    codes::TIMEOUT,
                    format!("task did not complete within {secs}s"),
                )),
            },
            None => invocation.await,
        };
        match outcome {
            Ok(output) => {
                ctx.accumulators.add(output.usage.tokens, output.usage.cost);
                break Ok(output.result);
            }
            Err(agent_err) => {
                let error = agent_error_to_state_error(&agent_err, name);
                let Some(rule) = matching_retry(&state.retry, &error) else {
                    break Err(error);
                };
                if attempt >= rule.max_attempts {
                    break Err(error);
                }
                let delay = backoff_delay(rule, attempt);
                warn!(state = name, attempt, delay_seconds = delay, code = %error.code, "retrying task after failure");
                ctx.push_trace(crate::domain::events::TraceRecord::Retry {
                    timestamp: chrono::Utc::now(),
                    state: name.to_string(),
                    attempt,
                    error: error.clone(),
                    delay_seconds: delay,
                });
                ctx.retry_count = attempt;
                if delay > 0.0 {
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                }
            }
        }
    };

    let raw_result = match raw_result {
        Ok(v) => v,
        Err(error) => {
            if let Some(catcher) = matching_catch(&state.catch, &error) {
                ctx.push_trace(crate::domain::events::TraceRecord::Catch {
                    timestamp: chrono::Utc::now(),
                    state: name.to_string(),
                    error: error.clone(),
                    next: catcher.next.clone(),
                });
                let error_value = serde_json::to_value(&error).unwrap_or(Value::Null);
                let merged = crate::domain::value::apply_result_path(
                    catcher.result_path.as_deref(),
                    &input,
                    error_value,
                );
                return Ok(match merged {
                    Ok(data) => StateOutcome::Transition(catcher.next.clone(), data),
                    Err(e) => StateOutcome::Failure(StateError::new(codes::RESULT_PATH_MATCH_FAILURE, e.to_string(), name)),
                });
            }
            return Ok(StateOutcome::Failure(error));
        }
    };

    let output = match shape_output(&state.flow, name, &input, raw_result, ctx) {
        Ok(v) => v,
        Err(e) => return Ok(StateOutcome::Failure(e)),
    };
    let def = StateDefinition::Task(state.clone());
    Ok(terminate_or_transition(&def, output))
}

fn agent_error_to_state_error(err: &AgentError, state: &str) -> StateError {
    StateError::new(err.code.clone(), err.message.clone(), state)
}

pub(super) fn matching_retry<'a>(rules: &'a [RetryRule], error: &StateError) -> Option<&'a RetryRule> {
    rules.iter().find(|r| r.error_equals.iter().any(|p| error.matches(p)))
}

pub(super) fn matching_catch<'a>(rules: &'a [CatchRule], error: &StateError) -> Option<&'a CatchRule> {
    rules.iter().find(|r| r.error_equals.iter().any(|p| error.matches(p)))
}

/// Exponential backoff with an optional jitter strategy, capped by
/// `MaxDelaySeconds` when given.
pub(super) fn backoff_delay(rule: &RetryRule, attempt: u32) -> f64 {
    let base = rule.interval_seconds * rule.backoff_rate.powi(attempt as i32 - 1);
    let capped = match rule.max_delay_seconds {
        Some(max) => base.min(max),
        None => base,
    };
    match rule.jitter_strategy {
        JitterStrategy::None => capped,
        JitterStrategy::Full => rand::random::<f64>() * capped,
        JitterStrategy::Equal => capped / 2.0 + rand::random::<f64>() * (capped / 2.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::workflow::{CatchRule, WorkflowDefinition};

    fn rule(errors: &[&str], max_attempts: u32) -> RetryRule {
        RetryRule {
            error_equals: errors.iter().map(|s| s.to_string()).collect(),
            max_attempts,
            interval_seconds: 1.0,
            backoff_rate: 2.0,
            max_delay_seconds: None,
            jitter_strategy: JitterStrategy::None,
        }
    }

    #[test]
    fn matching_retry_finds_rule_by_code() {
        let rules = vec![rule(&["States.TaskFailed"], 3)];
        let err = StateError::new("States.TaskFailed", "x", "DoWork");
        assert!(matching_retry(&rules, &err).is_some());
    }

    #[test]
    fn matching_catch_respects_states_all() {
        let rules = vec![CatchRule {
            error_equals: vec!["States.ALL".to_string()],
            next: "Recover".to_string(),
            result_path: None,
        }];
        let err = StateError::new("Agent.Weird", "x", "DoWork");
        assert_eq!(matching_catch(&rules, &err).unwrap().next, "Recover");
    }

    #[test]
    fn backoff_delay_grows_exponentially_without_jitter() {
        let r = rule(&["States.ALL"], 5);
        assert_eq!(backoff_delay(&r, 1), 1.0);
        assert_eq!(backoff_delay(&r, 2), 2.0);
        assert_eq!(backoff_delay(&r, 3), 4.0);
    }

    #[test]
    fn backoff_delay_caps_at_max_delay() {
        let mut r = rule(&["States.ALL"], 5);
        r.max_delay_seconds = Some(3.0);
        assert_eq!(backoff_delay(&r, 3), 3.0);
    }

    struct SlowAgent;

    #[async_trait::async_trait]
    impl crate::domain::agent::Agent for SlowAgent {
        async fn invoke(
            &self,
            _params: Value,
        ) -> Result<crate::domain::agent::AgentOutput, AgentError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(crate::domain::agent::AgentOutput::new(serde_json::json!({})))
        }
    }

    #[tokio::test]
    async fn timeout_seconds_fails_with_states_timeout() {
        use crate::application::approval::ApprovalOutcome;
        use crate::domain::agent::AgentRegistry;
        use crate::domain::context::RunOptions;
        use std::sync::Arc;

        let mut agents = AgentRegistry::new();
        agents.register("slow", Arc::new(SlowAgent));

        struct NeverCalled;
        #[async_trait::async_trait]
        impl crate::application::approval::ApprovalHandler for NeverCalled {
            async fn request_approval(&self, _request: Value) -> ApprovalOutcome {
                ApprovalOutcome::Pause
            }
        }

        let interp = Interpreter::new(agents, Arc::new(NeverCalled));
        let wf: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "StartAt": "DoWork",
            "States": {
                "DoWork": {
                    "Type": "Task",
                    "Resource": "slow",
                    "TimeoutSeconds": 0.05,
                    "End": true
                }
            }
        }))
        .unwrap();

        let result = interp
            .run("timeout-wf", &wf, serde_json::json!({}), RunOptions::default())
            .await
            .unwrap();
        match result {
            crate::application::interpreter::WorkflowResult::Failed { error, .. } => {
                assert_eq!(error.code, codes::TIMEOUT);
            }
            other => panic!("expected timeout failure, got {other:?}"),
        }
    }
}
