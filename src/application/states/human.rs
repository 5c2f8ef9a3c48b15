// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use serde_json::json;
use tracing::info;

use crate::domain::context::ExecutionContext;
use crate::domain::error::{codes, EngineError, StateError};
use crate::domain::events::{PendingInput, TraceRecord};
use crate::domain::value::{self, Path, Value};
use crate::domain::workflow::{ApprovalState, CheckpointState, DebateState, StateDefinition};

use crate::application::approval::ApprovalOutcome;
use crate::application::interpreter::Interpreter;

use super::scalar::choose_next;
use super::task::{backoff_delay, matching_catch, matching_retry};
use super::{shape_input, shape_output, terminate_or_transition, StateOutcome};

/// Resolves `Prompt`/`Prompt.$` against the shaped input: a static
/// literal (string or structured `{Title, Description}`), a dynamic
/// path expression, or `null` if neither is given.
fn resolve_prompt(state: &ApprovalState, data: &Value, ctx: &ExecutionContext, name: &str) -> Result<Value, StateError> {
    if let Some(path_expr) = &state.prompt_path {
        let path = Path::parse(path_expr).map_err(|e| StateError::new(codes::PARAMETER_PATH_FAILURE, e.to_string(), name))?;
        return value::evaluate(&path, data, Some(&ctx.as_context_value()))
            .map_err(|e| StateError::new(codes::PARAMETER_PATH_FAILURE, e.to_string(), name));
    }
    Ok(state.prompt.clone().unwrap_or(Value::Null))
}

/// Builds the `{approval, approver, timestamp[, comment][, edited_content], prompt}`
/// mapping written through `ResultPath` (§4.4.9), from either resume data
/// or a handler's decision — both carry the same shape.
fn build_approval_result(decision: &Value, prompt: &Value) -> Value {
    let mut result = json!({
        "approval": decision.get("approval").cloned().unwrap_or(Value::Null),
        "approver": decision.get("approver").cloned().unwrap_or(Value::Null),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "prompt": prompt.clone(),
    });
    if let Some(comment) = decision.get("comment") {
        result["comment"] = comment.clone();
    }
    if let Some(edited) = decision.get("edited_content") {
        result["edited_content"] = edited.clone();
    }
    result
}

pub async fn execute_approval(
    interpreter: &Interpreter,
    state: &ApprovalState,
    name: &str,
    input: Value,
    ctx: &mut ExecutionContext,
) -> Result<StateOutcome, EngineError> {
    let shaped = match shape_input(&state.flow, name, &input, ctx) {
        Ok(v) => v,
        Err(e) => return Ok(StateOutcome::Failure(e)),
    };

    let prompt = match resolve_prompt(state, &shaped, ctx, name) {
        Ok(v) => v,
        Err(e) => return Ok(StateOutcome::Failure(e)),
    };

    // Decision source priority 1: this is a resumption carrying an
    // `approval` field in its resume data (§4.4.9).
    if let Some(resume) = ctx.resume_data.take() {
        if resume.get("approval").is_some() {
            let result = build_approval_result(&resume, &prompt);
            return finish_approval(state, name, input, result, ctx);
        }
        ctx.resume_data = Some(resume);
    }

    // Priority 2: ask the configured handler.
    let request = json!({
        "prompt": prompt,
        "options": state.options,
        "state": name,
        "timeout": state.timeout_seconds,
        "input": shaped,
        "editable": state.editable,
    });

    match interpreter.approval.request_approval(request).await {
        ApprovalOutcome::Decided(decision) => {
            let result = build_approval_result(&decision, &prompt);
            finish_approval(state, name, input, result, ctx)
        }
        ApprovalOutcome::Pause => {
            ctx.checkpoint = Some(input);
            info!(state = name, "approval state requested pause");
            Ok(StateOutcome::Paused(PendingInput {
                kind: "approval".to_string(),
                prompt,
                options: state.options.clone(),
                editable: if state.editable { Some(true) } else { None },
                timeout: state.timeout_seconds,
            }))
        }
    }
}

fn finish_approval(
    state: &ApprovalState,
    name: &str,
    input: Value,
    result: Value,
    ctx: &mut ExecutionContext,
) -> Result<StateOutcome, EngineError> {
    let output = match shape_output(&state.flow, name, &input, result, ctx) {
        Ok(v) => v,
        Err(e) => return Ok(StateOutcome::Failure(e)),
    };

    if !state.choices.is_empty() {
        let context = ctx.as_context_value();
        return Ok(match choose_next(&state.choices, &state.default, &output, &context, name) {
            Ok(next) => StateOutcome::Transition(next, output),
            Err(e) => StateOutcome::Failure(e),
        });
    }

    let def = StateDefinition::Approval(state.clone());
    Ok(terminate_or_transition(&def, output))
}

pub fn execute_checkpoint(
    state: &CheckpointState,
    name: &str,
    input: Value,
    ctx: &mut ExecutionContext,
) -> Result<StateOutcome, EngineError> {
    let shaped = match shape_input(&state.flow, name, &input, ctx) {
        Ok(v) => v,
        Err(e) => return Ok(StateOutcome::Failure(e)),
    };
    ctx.checkpoint = Some(shaped.clone());
    ctx.push_trace(TraceRecord::CheckpointCreated {
        timestamp: chrono::Utc::now(),
        state: name.to_string(),
    });

    // The actual snapshot (name, execution id, filtered input, trace,
    // accumulators, TTL) is handed to a storage collaborator out of this
    // crate's scope (§4.4.10); the core only surfaces the result handle.
    let checkpoint_name = state.name.clone().unwrap_or_else(|| name.to_string());
    let raw_result = json!({
        "checkpoint": {
            "name": checkpoint_name,
            "id": ctx.execution_id.to_string(),
            "createdAt": chrono::Utc::now().to_rfc3339(),
        }
    });

    let output = match shape_output(&state.flow, name, &input, raw_result, ctx) {
        Ok(v) => v,
        Err(e) => return Ok(StateOutcome::Failure(e)),
    };
    let def = StateDefinition::Checkpoint(state.clone());
    Ok(terminate_or_transition(&def, output))
}

/// Runs `Rounds` of debate among `Participants`, each called with the
/// topic and history so far; when `Arbiter` is set it is called once
/// afterward with the full history to produce `decision`/`consensus`.
/// Without an arbiter, `RequireConsensus` falls back to a
/// majority-of-agreement heuristic over the final round's responses.
/// Grounded on the multi-judge consensus pattern in the teacher's
/// validation service, simplified to this crate's self-contained
/// `Agent` boundary (no judge-specific weighting).
pub async fn execute_debate(
    interpreter: &Interpreter,
    state: &DebateState,
    name: &str,
    input: Value,
    ctx: &mut ExecutionContext,
) -> Result<StateOutcome, EngineError> {
    let shaped = match shape_input(&state.flow, name, &input, ctx) {
        Ok(v) => v,
        Err(e) => return Ok(StateOutcome::Failure(e)),
    };

    let mut attempt: u32 = 0;
    let raw_result = loop {
        attempt += 1;
        match run_debate(interpreter, state, name, &shaped).await {
            Ok(result) => break Ok(result),
            Err(error) => {
                let Some(rule) = matching_retry(&state.retry, &error) else {
                    break Err(error);
                };
                if attempt >= rule.max_attempts {
                    break Err(error);
                }
                let delay = backoff_delay(rule, attempt);
                if delay > 0.0 {
                    tokio::time::sleep(tokio::time::Duration::from_secs_f64(delay)).await;
                }
            }
        }
    };

    let raw_result = match raw_result {
        Ok(v) => v,
        Err(error) => {
            if let Some(catcher) = matching_catch(&state.catch, &error) {
                let error_value = serde_json::to_value(&error).unwrap_or(Value::Null);
                let merged = crate::domain::value::apply_result_path(catcher.result_path.as_deref(), &input, error_value);
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
    let def = StateDefinition::Debate(state.clone());
    Ok(terminate_or_transition(&def, output))
}

async fn run_debate(interpreter: &Interpreter, state: &DebateState, name: &str, shaped_input: &Value) -> Result<Value, StateError> {
    let topic = state.topic.clone().unwrap_or_else(|| shaped_input.clone());
    let mut history: Vec<Value> = Vec::new();

    for round in 0..state.rounds {
        let mut round_responses = Vec::with_capacity(state.participants.len());
        for participant in &state.participants {
            let agent = interpreter
                .agents
                .get(participant)
                .ok_or_else(|| StateError::new(codes::RUNTIME, format!("unknown debate participant '{participant}'"), name))?;
            let params = json!({
                "topic": topic,
                "round": round,
                "history": history,
            });
            let output = agent
                .invoke(params)
                .await
                .map_err(|e| StateError::new(e.code.clone(), e.message.clone(), name))?;
            round_responses.push(json!({"participant": participant, "response": output.result}));
        }
        history.extend(round_responses);
    }

    let (decision, consensus) = resolve_decision(interpreter, state, name, &topic, &history).await?;

    Ok(json!({
        "topic": topic,
        "rounds": state.rounds,
        "participants": state.participants,
        "history": history,
        "decision": decision,
        "consensus": consensus,
    }))
}

async fn resolve_decision(
    interpreter: &Interpreter,
    state: &DebateState,
    name: &str,
    topic: &Value,
    history: &[Value],
) -> Result<(Value, bool), StateError> {
    if let Some(arbiter_name) = &state.arbiter {
        let arbiter = interpreter
            .agents
            .get(arbiter_name)
            .ok_or_else(|| StateError::new(codes::RUNTIME, format!("unknown debate arbiter '{arbiter_name}'"), name))?;
        let output = arbiter
            .invoke(json!({"topic": topic, "history": history}))
            .await
            .map_err(|e| StateError::new(e.code.clone(), e.message.clone(), name))?;
        // Tolerate arbiters that don't emit a structured `decision` field
        // by falling back to the raw response (§9 open question).
        let decision = output.result.get("decision").cloned().unwrap_or_else(|| output.result.clone());
        let consensus = output.result.get("consensus").and_then(Value::as_bool).unwrap_or(true);
        return Ok((decision, consensus));
    }

    if state.require_consensus && !state.participants.is_empty() {
        let n = state.participants.len().min(history.len());
        let final_round = &history[history.len() - n..];
        let decision = extract_consensus(final_round);
        let consensus = !matches!(decision, Value::Array(_));
        return Ok((decision, consensus));
    }

    Ok((Value::Null, true))
}

fn extract_consensus(final_round: &[Value]) -> Value {
    let mut counts: Vec<(&Value, usize)> = Vec::new();
    for entry in final_round {
        let response = &entry["response"];
        if let Some(slot) = counts.iter_mut().find(|(v, _)| *v == response) {
            slot.1 += 1;
        } else {
            counts.push((response, 1));
        }
    }
    match counts.iter().max_by_key(|(_, n)| *n) {
        Some((value, n)) if *n > final_round.len() / 2 => (*value).clone(),
        _ => Value::Array(final_round.to_vec()),
    }
}
