// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Parameter Resolver
//!
//! Walks a `Parameters`/`ResultSelector` template, resolving `.$`-suffixed
//! keys as path expressions or intrinsic calls against the state's input
//! and the execution context, and passing every other key through as a
//! literal.

use serde_json::Map;

use crate::domain::context::ContextAccumulators;
use crate::domain::error::EngineError;
use crate::domain::intrinsics::Evaluator;
use crate::domain::value::{Path, Value};

/// Resolves a `Parameters`-style template. Keys ending in `.$` are
/// stripped of the suffix and their string value is evaluated as either
/// a path expression (`$...`/`$$...`) or an intrinsic call
/// (`States.Name(...)`); every other key/value passes through literally,
/// recursing into nested objects and arrays.
pub fn resolve_parameters(
    template: &Value,
    input: &Value,
    context: &Value,
    accumulators: &ContextAccumulators,
) -> Result<Value, EngineError> {
    let evaluator = Evaluator {
        data: input,
        context: Some(context),
        accumulators: Some(accumulators),
    };
    resolve_value(template, &evaluator)
}

fn resolve_value(
    template: &Value,
    evaluator: &Evaluator<'_>,
) -> Result<Value, EngineError> {
    match template {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                if let Some(stripped) = key.strip_suffix(".$") {
                    let Value::String(expr) = value else {
                        return Err(EngineError::Validation(format!(
                            "'{key}' must be a string path/intrinsic expression"
                        )));
                    };
                    let resolved = resolve_expr(expr, evaluator)?;
                    out.insert(stripped.to_string(), resolved);
                } else {
                    out.insert(key.clone(), resolve_value(value, evaluator)?);
                }
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|v| resolve_value(v, evaluator))
                .collect::<Result<_, _>>()?,
        )),
        other => Ok(other.clone()),
    }
}

fn resolve_expr(expr: &str, evaluator: &Evaluator<'_>) -> Result<Value, EngineError> {
    let trimmed = expr.trim();
    if trimmed.starts_with("States.") {
        Ok(evaluator.eval_expr(trimmed)?)
    } else if trimmed.starts_with('$') {
        let path = Path::parse(trimmed)?;
        Ok(crate::domain::value::evaluate(&path, evaluator.data, evaluator.context)?)
    } else {
        Err(EngineError::Validation(format!(
            "'.$' value must be a path or intrinsic call, got: {expr}"
        )))
    }
}
