// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! State Implementations
//!
//! One executor per state kind, sharing the common input/output
//! data-shaping pipeline (`InputPath` -> kind-specific work ->
//! `ResultSelector` -> `ResultPath` -> `OutputPath`) defined here.

mod composite;
mod human;
mod scalar;
mod task;

use crate::domain::context::ExecutionContext;
use crate::domain::error::{codes, EngineError, StateError};
use crate::domain::events::PendingInput;
use crate::domain::value::{self, Path, Value};
use crate::domain::workflow::{DataFlow, StateDefinition};
use crate::application::interpreter::Interpreter;

/// What running one state produced.
pub enum StateOutcome {
    /// Move to the named next state with the given output data.
    Transition(String, Value),
    /// The run has reached a Succeed/Fail terminus.
    Terminal(Value),
    /// An uncaught error; ends the run.
    Failure(StateError),
    /// An Approval state asked to suspend the run, describing what
    /// external input is needed to resume.
    Paused(PendingInput),
}

pub async fn dispatch(
    interpreter: &Interpreter,
    state: &StateDefinition,
    name: &str,
    input: Value,
    ctx: &mut ExecutionContext,
) -> Result<StateOutcome, EngineError> {
    match state {
        StateDefinition::Task(s) => task::execute(interpreter, s, name, input, ctx).await,
        StateDefinition::Pass(s) => scalar::execute_pass(s, name, input, ctx),
        StateDefinition::Choice(s) => scalar::execute_choice(s, name, input, ctx),
        StateDefinition::Wait(s) => scalar::execute_wait(s, name, input, ctx).await,
        StateDefinition::Succeed(s) => scalar::execute_succeed(s, name, input, ctx),
        StateDefinition::Fail(s) => scalar::execute_fail(s, name, input),
        StateDefinition::Map(s) => composite::execute_map(interpreter, s, name, input, ctx).await,
        StateDefinition::Parallel(s) => composite::execute_parallel(interpreter, s, name, input, ctx).await,
        StateDefinition::Approval(s) => human::execute_approval(interpreter, s, name, input, ctx).await,
        StateDefinition::Checkpoint(s) => human::execute_checkpoint(s, name, input, ctx),
        StateDefinition::Debate(s) => human::execute_debate(interpreter, s, name, input, ctx).await,
    }
}

/// `InputPath` then `Parameters`, producing the value kind-specific work
/// actually operates on.
pub(super) fn shape_input(
    flow: &DataFlow,
    name: &str,
    input: &Value,
    ctx: &ExecutionContext,
) -> Result<Value, StateError> {
    let after_input_path = apply_path(flow.input_path.as_deref(), input, ctx, name, codes::PARAMETER_PATH_FAILURE)?;

    match &flow.parameters {
        None => Ok(after_input_path),
        Some(template) => crate::application::parameters::resolve_parameters(
            template,
            &after_input_path,
            &ctx.as_context_value(),
            &ctx.accumulators,
        )
        .map_err(|e| StateError::new(codes::PARAMETER_PATH_FAILURE, e.to_string(), name)),
    }
}

/// `ResultSelector` then `ResultPath` then `OutputPath`, merging a raw
/// result back into the state's input and slicing the output.
pub(super) fn shape_output(
    flow: &DataFlow,
    name: &str,
    input: &Value,
    raw_result: Value,
    ctx: &ExecutionContext,
) -> Result<Value, StateError> {
    let selected = match &flow.result_selector {
        None => raw_result,
        Some(template) => crate::application::parameters::resolve_parameters(
            template,
            &raw_result,
            &ctx.as_context_value(),
            &ctx.accumulators,
        )
        .map_err(|e| StateError::new(codes::RESULT_PATH_MATCH_FAILURE, e.to_string(), name))?,
    };

    let merged = value::apply_result_path(flow.result_path.as_deref(), input, selected)
        .map_err(|e| StateError::new(codes::RESULT_PATH_MATCH_FAILURE, e.to_string(), name))?;

    apply_path(flow.output_path.as_deref(), &merged, ctx, name, codes::RESULT_PATH_MATCH_FAILURE)
}

fn apply_path(
    raw: Option<&str>,
    data: &Value,
    ctx: &ExecutionContext,
    name: &str,
    error_code: &str,
) -> Result<Value, StateError> {
    match raw {
        None => Ok(data.clone()),
        Some(p) => {
            let path = Path::parse(p).map_err(|e| StateError::new(error_code, e.to_string(), name))?;
            value::evaluate(&path, data, Some(&ctx.as_context_value()))
                .map_err(|e| StateError::new(error_code, e.to_string(), name))
        }
    }
}

/// Resolves a state's declared `Next`/`End` into either a transition or
/// terminal outcome, given the already output-shaped data.
pub(super) fn terminate_or_transition(state: &StateDefinition, data: Value) -> StateOutcome {
    if let Some(next) = state.next() {
        StateOutcome::Transition(next.clone(), data)
    } else {
        StateOutcome::Terminal(data)
    }
}
