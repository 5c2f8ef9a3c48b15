// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use futures::stream::{self, StreamExt};

use crate::domain::context::{ContextAccumulators, ExecutionContext, MapItemContext};
use crate::domain::error::{codes, EngineError, StateError};
use crate::domain::events::{PendingInput, TraceRecord};
use crate::domain::value::{self, Path, Value};
use crate::domain::workflow::{MapState, ParallelState, StateDefinition};

use crate::application::interpreter::{Interpreter, WorkflowResult};

use super::task::{backoff_delay, matching_catch, matching_retry};
use super::{shape_input, shape_output, terminate_or_transition, StateOutcome};

pub async fn execute_map(
    interpreter: &Interpreter,
    state: &MapState,
    name: &str,
    input: Value,
    ctx: &mut ExecutionContext,
) -> Result<StateOutcome, EngineError> {
    let shaped = match shape_input(&state.flow, name, &input, ctx) {
        Ok(v) => v,
        Err(e) => return Ok(StateOutcome::Failure(e)),
    };

    let items_path = match Path::parse(&state.items_path) {
        Ok(p) => p,
        Err(e) => return Ok(StateOutcome::Failure(StateError::new(codes::RUNTIME, e.to_string(), name))),
    };
    let items_value = match value::evaluate(&items_path, &shaped, Some(&ctx.as_context_value())) {
        Ok(v) => v,
        Err(e) => return Ok(StateOutcome::Failure(StateError::new(codes::RUNTIME, e.to_string(), name))),
    };
    let Value::Array(items) = items_value else {
        return Ok(StateOutcome::Failure(StateError::new(
            codes::TASK_FAILED,
            "ItemsPath did not resolve to an array",
            name,
        )));
    };

    let mut attempt: u32 = 0;
    let raw_result = loop {
        attempt += 1;
        match run_map_iterations(interpreter, state, name, &items, ctx).await {
            Ok(CompositeRun::Done(outputs)) => {
                let outputs = merge_iteration_results(ctx, outputs);
                break Ok(Value::Array(outputs));
            }
            Ok(CompositeRun::Paused { trace, accumulators, pending_input }) => {
                ctx.trace.extend(trace);
                ctx.accumulators.add(accumulators.tokens(), accumulators.cost());
                ctx.checkpoint = Some(input);
                return Ok(StateOutcome::Paused(pending_input));
            }
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

    finish_composite(&StateDefinition::Map(state.clone()), &state.flow, &state.catch, name, input, raw_result, ctx)
}

/// Computes one item's iterator input per §4.4.4: `ItemSelector` resolved
/// against the item (with `$$.Map.Item` in scope) when present; else the
/// item itself if it's already a mapping; else `{value, index}`.
fn select_item_input(
    state: &MapState,
    item: &Value,
    idx: usize,
    child_ctx: &ExecutionContext,
) -> Result<Value, StateError> {
    match &state.item_selector {
        Some(template) => crate::application::parameters::resolve_parameters(
            template,
            item,
            &child_ctx.as_context_value(),
            &child_ctx.accumulators,
        )
        .map_err(|e| StateError::new(codes::PARAMETER_PATH_FAILURE, e.to_string(), "Map")),
        None => Ok(match item {
            Value::Object(_) => item.clone(),
            other => serde_json::json!({"value": other, "index": idx}),
        }),
    }
}

type IterationResult = (usize, Value, Vec<TraceRecord>, ContextAccumulators);

/// One item's (or branch's) outcome inside a Map/Parallel fan-out: it
/// either completed, or its nested run paused and is asking the whole
/// composite state to pause too.
enum BranchOutcome {
    Completed(IterationResult),
    Paused {
        trace: Vec<TraceRecord>,
        accumulators: ContextAccumulators,
        pending_input: PendingInput,
    },
}

/// The aggregated result of draining every item/branch: either every one
/// completed, or at least one paused (§5: siblings still in flight are
/// drained to their own conclusion first, but a pause always wins over a
/// plain completion once any item/branch reports one).
enum CompositeRun {
    Done(Vec<IterationResult>),
    Paused {
        trace: Vec<TraceRecord>,
        accumulators: ContextAccumulators,
        pending_input: PendingInput,
    },
}

/// Folds a drained batch of per-item/per-branch outcomes into a
/// [`CompositeRun`]. A pause takes precedence over completions — the
/// lowest-index item/branch that paused is reported — so siblings that
/// finished are not silently promoted to a false success.
fn fold_branch_outcomes(outcomes: Vec<Result<BranchOutcome, StateError>>) -> Result<CompositeRun, StateError> {
    let mut completed: Vec<IterationResult> = Vec::with_capacity(outcomes.len());
    let mut paused: Option<(Vec<TraceRecord>, ContextAccumulators, PendingInput)> = None;

    for outcome in outcomes {
        match outcome? {
            BranchOutcome::Completed(result) => completed.push(result),
            BranchOutcome::Paused { trace, accumulators, pending_input } => {
                if paused.is_none() {
                    paused = Some((trace, accumulators, pending_input));
                }
            }
        }
    }

    if let Some((trace, accumulators, pending_input)) = paused {
        return Ok(CompositeRun::Paused { trace, accumulators, pending_input });
    }

    completed.sort_by_key(|(idx, ..)| *idx);
    Ok(CompositeRun::Done(completed))
}

async fn run_map_iterations(
    interpreter: &Interpreter,
    state: &MapState,
    name: &str,
    items: &[Value],
    ctx: &ExecutionContext,
) -> Result<CompositeRun, StateError> {
    let concurrency = state
        .max_concurrency
        .map(|c| c as usize)
        .unwrap_or_else(|| items.len().max(1));

    let results: Vec<Result<BranchOutcome, StateError>> = stream::iter(items.iter().cloned().enumerate())
        .map(|(idx, item)| async move {
            let mut child = ctx
                .child(state.iterator.start_at.clone(), Some(MapItemContext { index: idx, value: item.clone() }))
                .map_err(|e| StateError::new(codes::BUDGET_EXCEEDED, e.to_string(), name))?;
            let item_input = select_item_input(state, &item, idx, &child)?;
            match interpreter.run_from(&state.iterator, &mut child, item_input).await {
                Ok(WorkflowResult::Succeeded { output, trace, tokens, cost, .. }) => {
                    let mut accumulators = ContextAccumulators::default();
                    accumulators.add(tokens, cost);
                    Ok(BranchOutcome::Completed((idx, output, trace, accumulators)))
                }
                Ok(WorkflowResult::Failed { error, .. }) => Err(error),
                Ok(WorkflowResult::Paused { pending_input, trace, context, .. }) => {
                    let mut accumulators = ContextAccumulators::default();
                    accumulators.add(context.accumulators.tokens(), context.accumulators.cost());
                    Ok(BranchOutcome::Paused { trace, accumulators, pending_input })
                }
                Err(engine_err) => Err(StateError::new(codes::RUNTIME, engine_err.to_string(), name)),
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    fold_branch_outcomes(results)
}

/// Folds each iteration's trace and accumulators into the Map state's own
/// context (§5: "merge trace entries and accumulators back into the
/// parent on completion") and returns the ordered per-item outputs.
fn merge_iteration_results(ctx: &mut ExecutionContext, iterations: Vec<IterationResult>) -> Vec<Value> {
    let mut outputs = Vec::with_capacity(iterations.len());
    for (_, output, trace, accumulators) in iterations {
        ctx.trace.extend(trace);
        ctx.accumulators.add(accumulators.tokens(), accumulators.cost());
        outputs.push(output);
    }
    outputs
}

pub async fn execute_parallel(
    interpreter: &Interpreter,
    state: &ParallelState,
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
        match run_branches(interpreter, state, name, &shaped, ctx).await {
            Ok(CompositeRun::Done(outputs)) => {
                let outputs = merge_iteration_results(ctx, outputs);
                break Ok(Value::Array(outputs));
            }
            Ok(CompositeRun::Paused { trace, accumulators, pending_input }) => {
                ctx.trace.extend(trace);
                ctx.accumulators.add(accumulators.tokens(), accumulators.cost());
                ctx.checkpoint = Some(input);
                return Ok(StateOutcome::Paused(pending_input));
            }
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

    finish_composite(&StateDefinition::Parallel(state.clone()), &state.flow, &state.catch, name, input, raw_result, ctx)
}

async fn run_branches(
    interpreter: &Interpreter,
    state: &ParallelState,
    name: &str,
    branch_input: &Value,
    ctx: &ExecutionContext,
) -> Result<CompositeRun, StateError> {
    let futures = state.branches.iter().enumerate().map(|(idx, branch)| async move {
        let mut child = ctx
            .child(branch.start_at.clone(), None)
            .map_err(|e| StateError::new(codes::BUDGET_EXCEEDED, e.to_string(), name))?;
        match interpreter.run_from(branch, &mut child, branch_input.clone()).await {
            Ok(WorkflowResult::Succeeded { output, trace, tokens, cost, .. }) => {
                let mut accumulators = ContextAccumulators::default();
                accumulators.add(tokens, cost);
                Ok(BranchOutcome::Completed((idx, output, trace, accumulators)))
            }
            Ok(WorkflowResult::Failed { error, .. }) => Err(error),
            Ok(WorkflowResult::Paused { pending_input, trace, context, .. }) => {
                let mut accumulators = ContextAccumulators::default();
                accumulators.add(context.accumulators.tokens(), context.accumulators.cost());
                Ok(BranchOutcome::Paused { trace, accumulators, pending_input })
            }
            Err(engine_err) => Err(StateError::new(codes::RUNTIME, engine_err.to_string(), name)),
        }
    });

    let results: Vec<Result<BranchOutcome, StateError>> = futures::future::join_all(futures).await;
    fold_branch_outcomes(results)
}

fn finish_composite(
    def: &StateDefinition,
    flow: &crate::domain::workflow::DataFlow,
    catch: &[crate::domain::workflow::CatchRule],
    name: &str,
    input: Value,
    raw_result: Result<Value, StateError>,
    ctx: &mut ExecutionContext,
) -> Result<StateOutcome, EngineError> {
    let raw_result = match raw_result {
        Ok(v) => v,
        Err(error) => {
            if let Some(catcher) = matching_catch(catch, &error) {
                let error_value = serde_json::to_value(&error).unwrap_or(Value::Null);
                let merged = value::apply_result_path(catcher.result_path.as_deref(), &input, error_value);
                return Ok(match merged {
                    Ok(data) => StateOutcome::Transition(catcher.next.clone(), data),
                    Err(e) => StateOutcome::Failure(StateError::new(codes::RESULT_PATH_MATCH_FAILURE, e.to_string(), name)),
                });
            }
            return Ok(StateOutcome::Failure(error));
        }
    };

    let output = match shape_output(flow, name, &input, raw_result, ctx) {
        Ok(v) => v,
        Err(e) => return Ok(StateOutcome::Failure(e)),
    };
    Ok(terminate_or_transition(def, output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::{Agent, AgentOutput, AgentRegistry};
    use crate::domain::context::RunOptions;
    use crate::application::approval::{ApprovalHandler, ApprovalOutcome};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct DoubleAgent;

    #[async_trait]
    impl Agent for DoubleAgent {
        async fn invoke(&self, params: Value) -> Result<AgentOutput, crate::domain::agent::AgentError> {
            let n = params["n"].as_i64().unwrap_or(0);
            Ok(AgentOutput::new(json!({"n": n * 2})))
        }
    }

    struct MeteredAgent;

    #[async_trait]
    impl Agent for MeteredAgent {
        async fn invoke(&self, params: Value) -> Result<AgentOutput, crate::domain::agent::AgentError> {
            let n = params["n"].as_i64().unwrap_or(0);
            Ok(AgentOutput::with_usage(json!({"n": n}), 10, 0.01))
        }
    }

    struct NeverApprove;

    #[async_trait]
    impl ApprovalHandler for NeverApprove {
        async fn request_approval(&self, _request: Value) -> ApprovalOutcome {
            ApprovalOutcome::Pause
        }
    }

    fn interpreter() -> Interpreter {
        let mut agents = AgentRegistry::new();
        agents.register("doubler", Arc::new(DoubleAgent));
        Interpreter::new(agents, Arc::new(NeverApprove))
    }

    fn map_state() -> MapState {
        serde_json::from_value(json!({
            "ItemsPath": "$.items",
            "Iterator": {
                "StartAt": "Double",
                "States": {
                    "Double": {"Type": "Task", "Resource": "doubler", "End": true}
                }
            },
            "End": true
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn map_preserves_input_order_regardless_of_completion_order() {
        let interp = interpreter();
        let state = map_state();
        let mut ctx = ExecutionContext::new("wf", "Iterate", RunOptions::default());
        let input = json!({"items": [{"n": 1}, {"n": 2}, {"n": 3}]});
        let out = execute_map(&interp, &state, "Iterate", input, &mut ctx).await.unwrap();
        match out {
            StateOutcome::Terminal(v) => assert_eq!(v, json!([{"n": 2}, {"n": 4}, {"n": 6}])),
            _ => panic!("expected terminal outcome"),
        }
    }

    #[tokio::test]
    async fn map_item_selector_reads_map_item_value_from_context() {
        struct DoubleScalarAgent;
        #[async_trait]
        impl Agent for DoubleScalarAgent {
            async fn invoke(&self, params: Value) -> Result<AgentOutput, crate::domain::agent::AgentError> {
                let v = params["v"].as_i64().unwrap_or(0);
                Ok(AgentOutput::new(json!({"doubled": v * 2})))
            }
        }
        let mut agents = AgentRegistry::new();
        agents.register("doubler_scalar", Arc::new(DoubleScalarAgent));
        let interp = Interpreter::new(agents, Arc::new(NeverApprove));

        let state: MapState = serde_json::from_value(json!({
            "ItemsPath": "$.items",
            "ItemSelector": {"v.$": "$$.Map.Item.Value"},
            "Iterator": {
                "StartAt": "Double",
                "States": {
                    "Double": {"Type": "Task", "Resource": "doubler_scalar", "End": true}
                }
            },
            "End": true
        }))
        .unwrap();
        let mut ctx = ExecutionContext::new("wf", "Iterate", RunOptions::default());
        let input = json!({"items": [1, 2, 3, 4, 5]});
        let out = execute_map(&interp, &state, "Iterate", input, &mut ctx).await.unwrap();
        match out {
            StateOutcome::Terminal(v) => assert_eq!(
                v,
                json!([{"doubled": 2}, {"doubled": 4}, {"doubled": 6}, {"doubled": 8}, {"doubled": 10}])
            ),
            _ => panic!("expected terminal outcome"),
        }
    }

    #[tokio::test]
    async fn map_merges_iteration_tokens_and_trace_into_parent_context() {
        let mut agents = AgentRegistry::new();
        agents.register("metered", Arc::new(MeteredAgent));
        let interp = Interpreter::new(agents, Arc::new(NeverApprove));

        let state: MapState = serde_json::from_value(json!({
            "ItemsPath": "$.items",
            "Iterator": {
                "StartAt": "Meter",
                "States": {
                    "Meter": {"Type": "Task", "Resource": "metered", "End": true}
                }
            },
            "End": true
        }))
        .unwrap();
        let mut ctx = ExecutionContext::new("wf", "Iterate", RunOptions::default());
        let input = json!({"items": [{"n": 1}, {"n": 2}, {"n": 3}]});
        execute_map(&interp, &state, "Iterate", input, &mut ctx).await.unwrap();

        assert_eq!(ctx.accumulators.tokens(), 30);
        assert!((ctx.accumulators.cost() - 0.03).abs() < 1e-9);
        assert!(ctx.trace.iter().any(|r| matches!(r, crate::domain::events::TraceRecord::WorkflowComplete { .. })));
    }

    #[tokio::test]
    async fn parallel_runs_branches_in_definition_order() {
        let interp = interpreter();
        let state: ParallelState = serde_json::from_value(json!({
            "Branches": [
                {"StartAt": "A", "States": {"A": {"Type": "Task", "Resource": "doubler", "End": true}}},
                {"StartAt": "B", "States": {"B": {"Type": "Pass", "End": true}}}
            ],
            "End": true
        }))
        .unwrap();
        let mut ctx = ExecutionContext::new("wf", "Split", RunOptions::default());
        let out = execute_parallel(&interp, &state, "Split", json!({"n": 5}), &mut ctx).await.unwrap();
        match out {
            StateOutcome::Terminal(v) => assert_eq!(v, json!([{"n": 10}, {"n": 5}])),
            _ => panic!("expected terminal outcome"),
        }
    }

    #[tokio::test]
    async fn map_items_path_not_an_array_fails_task_failed() {
        let interp = interpreter();
        let state = map_state();
        let mut ctx = ExecutionContext::new("wf", "Iterate", RunOptions::default());
        let out = execute_map(&interp, &state, "Iterate", json!({"items": "not-an-array"}), &mut ctx)
            .await
            .unwrap();
        match out {
            StateOutcome::Failure(e) => assert_eq!(e.code, "States.TaskFailed"),
            _ => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn map_propagates_pause_from_a_nested_approval_instead_of_failing() {
        let mut agents = AgentRegistry::new();
        agents.register("doubler", Arc::new(DoubleAgent));
        let interp = Interpreter::new(agents, Arc::new(NeverApprove));

        let state: MapState = serde_json::from_value(json!({
            "ItemsPath": "$.items",
            "Iterator": {
                "StartAt": "Approve",
                "States": {
                    "Approve": {"Type": "Approval", "Prompt": "ok?", "Options": ["yes", "no"], "End": true}
                }
            },
            "End": true
        }))
        .unwrap();
        let mut ctx = ExecutionContext::new("wf", "Iterate", RunOptions::default());
        let input = json!({"items": [{"n": 1}]});
        let out = execute_map(&interp, &state, "Iterate", input.clone(), &mut ctx).await.unwrap();
        match out {
            StateOutcome::Paused(pending) => assert_eq!(pending.options, vec!["yes".to_string(), "no".to_string()]),
            _ => panic!("expected paused outcome"),
        }
        assert_eq!(ctx.checkpoint, Some(input));
    }

    #[tokio::test]
    async fn parallel_propagates_pause_from_a_nested_approval_instead_of_failing() {
        let interp = interpreter();
        let state: ParallelState = serde_json::from_value(json!({
            "Branches": [
                {"StartAt": "A", "States": {"A": {"Type": "Task", "Resource": "doubler", "End": true}}},
                {"StartAt": "Approve", "States": {
                    "Approve": {"Type": "Approval", "Prompt": "ok?", "Options": ["yes", "no"], "End": true}
                }}
            ],
            "End": true
        }))
        .unwrap();
        let mut ctx = ExecutionContext::new("wf", "Split", RunOptions::default());
        let input = json!({"n": 5});
        let out = execute_parallel(&interp, &state, "Split", input.clone(), &mut ctx).await.unwrap();
        match out {
            StateOutcome::Paused(pending) => assert_eq!(pending.options, vec!["yes".to_string(), "no".to_string()]),
            _ => panic!("expected paused outcome"),
        }
        assert_eq!(ctx.checkpoint, Some(input));
    }
}
