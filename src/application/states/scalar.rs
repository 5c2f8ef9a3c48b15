// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use tokio::time::Duration;

use crate::domain::context::ExecutionContext;
use crate::domain::error::{codes, EngineError, StateError};
use crate::domain::value::{self, Path, Value};
use crate::domain::workflow::{
    ChoiceExpr, ChoiceState, ComparisonChoice, ComparisonOp, CompoundChoice, FailState, PassState,
    StateDefinition, SucceedState, WaitState,
};

use super::{shape_input, shape_output, terminate_or_transition, StateOutcome};

/// A static `Result` wins outright (no `InputPath`/`Parameters` applied);
/// otherwise falls back to the usual `Parameters`-resolved-or-filtered
/// input, matching §4.4.2's priority ladder.
pub fn execute_pass(
    state: &PassState,
    name: &str,
    input: Value,
    ctx: &mut ExecutionContext,
) -> Result<StateOutcome, EngineError> {
    let raw_result = match &state.flow.result {
        Some(result) => result.clone(),
        None => match shape_input(&state.flow, name, &input, ctx) {
            Ok(v) => v,
            Err(e) => return Ok(StateOutcome::Failure(e)),
        },
    };
    let output = match shape_output(&state.flow, name, &input, raw_result, ctx) {
        Ok(v) => v,
        Err(e) => return Ok(StateOutcome::Failure(e)),
    };
    let def = StateDefinition::Pass(state.clone());
    Ok(terminate_or_transition(&def, output))
}

pub fn execute_choice(
    state: &ChoiceState,
    name: &str,
    input: Value,
    ctx: &mut ExecutionContext,
) -> Result<StateOutcome, EngineError> {
    let shaped = match shape_input(&state.flow, name, &input, ctx) {
        Ok(v) => v,
        Err(e) => return Ok(StateOutcome::Failure(e)),
    };
    let context = ctx.as_context_value();

    match choose_next(&state.choices, &state.default, &shaped, &context, name) {
        Ok(next) => Ok(StateOutcome::Transition(next, shaped)),
        Err(e) => Ok(StateOutcome::Failure(e)),
    }
}

/// Shared by Choice states and Approval states with a `Choices` routing
/// table: the first matching rule's `Next` wins, falling back to
/// `Default`, failing `States.NoChoiceMatched` if neither applies.
pub(super) fn choose_next(
    choices: &[crate::domain::workflow::ChoiceRule],
    default: &Option<String>,
    data: &Value,
    context: &Value,
    name: &str,
) -> Result<String, StateError> {
    for rule in choices {
        if evaluate_expr(&rule.expr, data, context)? {
            return Ok(rule.next.clone());
        }
    }
    default.clone().ok_or_else(|| {
        StateError::new(
            codes::NO_CHOICE_MATCHED,
            "no Choices rule matched and no Default was given",
            name,
        )
    })
}

fn evaluate_expr(expr: &ChoiceExpr, data: &Value, context: &Value) -> Result<bool, StateError> {
    match expr {
        ChoiceExpr::Compound(CompoundChoice::And(exprs)) => {
            for e in exprs {
                if !evaluate_expr(e, data, context)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        ChoiceExpr::Compound(CompoundChoice::Or(exprs)) => {
            for e in exprs {
                if evaluate_expr(e, data, context)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        ChoiceExpr::Compound(CompoundChoice::Not(inner)) => {
            Ok(!evaluate_expr(inner, data, context)?)
        }
        ChoiceExpr::Comparison(cmp) => evaluate_comparison(cmp, data, context),
    }
}

fn path_str(p: &str, data: &Value, context: &Value) -> Result<Value, StateError> {
    let path = Path::parse(p).map_err(|e| StateError::new(codes::RUNTIME, e.to_string(), "Choice"))?;
    value::evaluate(&path, data, Some(context)).map_err(|e| StateError::new(codes::RUNTIME, e.to_string(), "Choice"))
}

fn as_f64(v: &Value) -> Option<f64> {
    v.as_f64()
}

fn evaluate_comparison(cmp: &ComparisonChoice, data: &Value, context: &Value) -> Result<bool, StateError> {
    let variable = path_str(&cmp.variable, data, context)?;
    Ok(match &cmp.op {
        ComparisonOp::StringEquals(expected) => variable.as_str() == Some(expected.as_str()),
        ComparisonOp::StringEqualsPath(p) => variable == path_str(p, data, context)?,
        ComparisonOp::StringLessThan(expected) => {
            variable.as_str().map(|s| s < expected.as_str()).unwrap_or(false)
        }
        ComparisonOp::StringLessThanEquals(expected) => {
            variable.as_str().map(|s| s <= expected.as_str()).unwrap_or(false)
        }
        ComparisonOp::StringGreaterThan(expected) => {
            variable.as_str().map(|s| s > expected.as_str()).unwrap_or(false)
        }
        ComparisonOp::StringGreaterThanEquals(expected) => {
            variable.as_str().map(|s| s >= expected.as_str()).unwrap_or(false)
        }
        ComparisonOp::StringMatches(pattern) => variable
            .as_str()
            .map(|s| glob_match(pattern, s))
            .unwrap_or(false),
        ComparisonOp::NumericEquals(expected) => as_f64(&variable) == Some(*expected),
        ComparisonOp::NumericLessThan(expected) => as_f64(&variable).map(|n| n < *expected).unwrap_or(false),
        ComparisonOp::NumericLessThanEquals(expected) => {
            as_f64(&variable).map(|n| n <= *expected).unwrap_or(false)
        }
        ComparisonOp::NumericGreaterThan(expected) => {
            as_f64(&variable).map(|n| n > *expected).unwrap_or(false)
        }
        ComparisonOp::NumericGreaterThanEquals(expected) => {
            as_f64(&variable).map(|n| n >= *expected).unwrap_or(false)
        }
        ComparisonOp::BooleanEquals(expected) => variable.as_bool() == Some(*expected),
        ComparisonOp::TimestampEquals(expected) => {
            compare_timestamps(&variable, &Value::String(expected.clone())) == Some(std::cmp::Ordering::Equal)
        }
        ComparisonOp::TimestampLessThan(expected) => {
            compare_timestamps(&variable, expected) == Some(std::cmp::Ordering::Less)
        }
        ComparisonOp::TimestampGreaterThan(expected) => {
            compare_timestamps(&variable, expected) == Some(std::cmp::Ordering::Greater)
        }
        ComparisonOp::IsNull(expected) => variable.is_null() == *expected,
        ComparisonOp::IsPresent(expected) => !variable.is_null() == *expected,
        ComparisonOp::IsString(expected) => variable.is_string() == *expected,
        ComparisonOp::IsNumeric(expected) => variable.is_number() == *expected,
        ComparisonOp::IsBoolean(expected) => variable.is_boolean() == *expected,
        ComparisonOp::IsTimestamp(expected) => {
            variable.as_str().map(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok()).unwrap_or(false) == *expected
        }
    })
}

/// Compares two ISO-8601 timestamps as instants, falling back to lexical
/// string comparison when either side fails to parse.
fn compare_timestamps(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    let (a_str, b_str) = (a.as_str()?, b.as_str()?);
    match (
        chrono::DateTime::parse_from_rfc3339(a_str),
        chrono::DateTime::parse_from_rfc3339(b_str),
    ) {
        (Ok(a_ts), Ok(b_ts)) => Some(a_ts.cmp(&b_ts)),
        _ => a_str.partial_cmp(b_str),
    }
}

/// Minimal glob matcher supporting `*` and `?`, sufficient for
/// `StringMatches` patterns.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(pc), Some(tc)) if pc == tc => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

/// Seconds from now until `ts` (an ISO-8601 absolute timestamp), clamped
/// to non-negative per §4.4.6.
fn seconds_until(ts: &str) -> Result<f64, chrono::ParseError> {
    let target = chrono::DateTime::parse_from_rfc3339(ts)?;
    let delta = (target.with_timezone(&chrono::Utc) - chrono::Utc::now()).num_milliseconds() as f64 / 1000.0;
    Ok(delta.max(0.0))
}

pub async fn execute_wait(
    state: &WaitState,
    name: &str,
    input: Value,
    ctx: &mut ExecutionContext,
) -> Result<StateOutcome, EngineError> {
    let shaped = match shape_input(&state.flow, name, &input, ctx) {
        Ok(v) => v,
        Err(e) => return Ok(StateOutcome::Failure(e)),
    };

    let seconds = if let Some(s) = state.seconds {
        s
    } else if let Some(p) = &state.seconds_path {
        let path = match Path::parse(p) {
            Ok(p) => p,
            Err(e) => return Ok(StateOutcome::Failure(StateError::new(codes::RUNTIME, e.to_string(), name))),
        };
        match value::evaluate(&path, &shaped, Some(&ctx.as_context_value())) {
            Ok(v) => v.as_f64().unwrap_or(0.0),
            Err(e) => return Ok(StateOutcome::Failure(StateError::new(codes::RUNTIME, e.to_string(), name))),
        }
    } else if let Some(ts) = &state.timestamp {
        match seconds_until(ts) {
            Ok(s) => s,
            Err(e) => return Ok(StateOutcome::Failure(StateError::new(codes::RUNTIME, e.to_string(), name))),
        }
    } else if let Some(p) = &state.timestamp_path {
        let path = match Path::parse(p) {
            Ok(p) => p,
            Err(e) => return Ok(StateOutcome::Failure(StateError::new(codes::RUNTIME, e.to_string(), name))),
        };
        let ts = match value::evaluate(&path, &shaped, Some(&ctx.as_context_value())) {
            Ok(Value::String(s)) => s,
            Ok(_) => {
                return Ok(StateOutcome::Failure(StateError::new(
                    codes::RUNTIME,
                    "TimestampPath did not resolve to a string",
                    name,
                )))
            }
            Err(e) => return Ok(StateOutcome::Failure(StateError::new(codes::RUNTIME, e.to_string(), name))),
        };
        match seconds_until(&ts) {
            Ok(s) => s,
            Err(e) => return Ok(StateOutcome::Failure(StateError::new(codes::RUNTIME, e.to_string(), name))),
        }
    } else {
        0.0
    };

    if seconds > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
    }

    let output = match shape_output(&state.flow, name, &input, shaped, ctx) {
        Ok(v) => v,
        Err(e) => return Ok(StateOutcome::Failure(e)),
    };
    let def = StateDefinition::Wait(state.clone());
    Ok(terminate_or_transition(&def, output))
}

pub fn execute_succeed(
    state: &SucceedState,
    name: &str,
    input: Value,
    ctx: &mut ExecutionContext,
) -> Result<StateOutcome, EngineError> {
    let shaped = match shape_input(&state.flow, name, &input, ctx) {
        Ok(v) => v,
        Err(e) => return Ok(StateOutcome::Failure(e)),
    };
    let output = match shape_output(&state.flow, name, &input, shaped, ctx) {
        Ok(v) => v,
        Err(e) => return Ok(StateOutcome::Failure(e)),
    };
    Ok(StateOutcome::Terminal(output))
}

pub fn execute_fail(
    state: &FailState,
    name: &str,
    _input: Value,
) -> Result<StateOutcome, EngineError> {
    Ok(StateOutcome::Failure(StateError::new(
        state.error.clone().unwrap_or_else(|| "States.Failed".to_string()),
        state.cause.clone().unwrap_or_else(|| "Workflow failed".to_string()),
        name,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::context::RunOptions;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("wf", "Choice", RunOptions::default())
    }

    #[test]
    fn choice_routes_on_timestamp_comparison() {
        let state: ChoiceState = serde_json::from_value(json!({
            "Choices": [
                {"Variable": "$.at", "TimestampGreaterThan": "2024-01-01T00:00:00Z", "Next": "Late"}
            ],
            "Default": "Early"
        }))
        .unwrap();
        let mut c = ctx();
        let out = execute_choice(&state, "Pick", json!({"at": "2025-06-01T00:00:00Z"}), &mut c).unwrap();
        match out {
            StateOutcome::Transition(next, _) => assert_eq!(next, "Late"),
            _ => panic!("expected transition"),
        }
    }

    #[test]
    fn timestamp_equals_treats_equivalent_offsets_as_equal() {
        let state: ChoiceState = serde_json::from_value(json!({
            "Choices": [
                {"Variable": "$.at", "TimestampEquals": "2024-01-01T00:00:00Z", "Next": "Match"}
            ],
            "Default": "NoMatch"
        }))
        .unwrap();
        let mut c = ctx();
        let out = execute_choice(&state, "Pick", json!({"at": "2024-01-01T00:00:00+00:00"}), &mut c).unwrap();
        match out {
            StateOutcome::Transition(next, _) => assert_eq!(next, "Match"),
            _ => panic!("expected transition"),
        }
    }

    #[test]
    fn glob_match_handles_star_and_question() {
        assert!(glob_match("foo*", "foobar"));
        assert!(glob_match("f?o", "foo"));
        assert!(!glob_match("foo", "foobar"));
    }

    #[test]
    fn choice_routes_on_numeric_comparison() {
        let state: ChoiceState = serde_json::from_value(json!({
            "Choices": [
                {"Variable": "$.n", "NumericGreaterThan": 10.0, "Next": "Big"}
            ],
            "Default": "Small"
        }))
        .unwrap();
        let mut c = ctx();
        let out = execute_choice(&state, "Pick", json!({"n": 20}), &mut c).unwrap();
        match out {
            StateOutcome::Transition(next, _) => assert_eq!(next, "Big"),
            _ => panic!("expected transition"),
        }
    }

    #[test]
    fn choice_falls_back_to_default() {
        let state: ChoiceState = serde_json::from_value(json!({
            "Choices": [
                {"Variable": "$.n", "NumericGreaterThan": 10.0, "Next": "Big"}
            ],
            "Default": "Small"
        }))
        .unwrap();
        let mut c = ctx();
        let out = execute_choice(&state, "Pick", json!({"n": 1}), &mut c).unwrap();
        match out {
            StateOutcome::Transition(next, _) => assert_eq!(next, "Small"),
            _ => panic!("expected transition"),
        }
    }

    #[test]
    fn choice_without_match_or_default_fails() {
        let state: ChoiceState = serde_json::from_value(json!({
            "Choices": [
                {"Variable": "$.n", "NumericGreaterThan": 10.0, "Next": "Big"}
            ]
        }))
        .unwrap();
        let mut c = ctx();
        let out = execute_choice(&state, "Pick", json!({"n": 1}), &mut c).unwrap();
        match out {
            StateOutcome::Failure(e) => assert_eq!(e.code, codes::NO_CHOICE_MATCHED),
            _ => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn wait_with_timestamp_path_resolves_against_input() {
        let state: WaitState = serde_json::from_value(json!({
            "TimestampPath": "$.resumeAt",
            "End": true
        }))
        .unwrap();
        let mut c = ctx();
        let input = json!({"resumeAt": "2000-01-01T00:00:00Z"});
        let out = execute_wait(&state, "Pause", input.clone(), &mut c).await.unwrap();
        match out {
            StateOutcome::Terminal(v) => assert_eq!(v, input),
            _ => panic!("expected terminal outcome"),
        }
    }

    #[test]
    fn fail_state_carries_error_and_cause() {
        let state = FailState {
            error: Some("Custom.Error".to_string()),
            cause: Some("bad input".to_string()),
        };
        let out = execute_fail(&state, "Bail", json!({})).unwrap();
        match out {
            StateOutcome::Failure(e) => {
                assert_eq!(e.code, "Custom.Error");
                assert_eq!(e.cause, "bad input");
            }
            _ => panic!("expected failure"),
        }
    }

    #[test]
    fn fail_state_defaults_error_and_cause_when_omitted() {
        let state = FailState { error: None, cause: None };
        let out = execute_fail(&state, "Bail", json!({})).unwrap();
        match out {
            StateOutcome::Failure(e) => {
                assert_eq!(e.code, "States.Failed");
                assert_eq!(e.cause, "Workflow failed");
            }
            _ => panic!("expected failure"),
        }
    }

    #[test]
    fn pass_state_static_result_overrides_filtered_input() {
        let state: PassState = serde_json::from_value(json!({
            "Result": {"s": 1},
            "ResultPath": "$.r1",
            "End": true
        }))
        .unwrap();
        let mut c = ctx();
        let out = execute_pass(&state, "A", json!({"combined": 0}), &mut c).unwrap();
        match out {
            StateOutcome::Terminal(v) => assert_eq!(v, json!({"combined": 0, "r1": {"s": 1}})),
            _ => panic!("expected terminal outcome"),
        }
    }
}
