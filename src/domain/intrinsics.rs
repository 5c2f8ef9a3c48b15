// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Intrinsic Functions
//!
//! A closed, fixed catalog of pure functions callable from path-valued
//! parameters via the syntax `States.Name(arg1, arg2, ...)`. See §4.2 and
//! §6 of the spec for the full catalog and argument-parsing rules.

use crate::domain::context::ContextAccumulators;
use crate::domain::value::{self, Path, Value};
use base64::Engine as _;
use serde_json::{json, Map};
use sha1::Digest as _;
use std::collections::HashSet;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum IntrinsicError {
    #[error("unknown intrinsic function '{0}'")]
    UnknownFunction(String),

    #[error("intrinsic '{name}' expects {expected} argument(s), got {got}")]
    WrongArity {
        name: String,
        expected: String,
        got: usize,
    },

    #[error("intrinsic '{name}' received an argument of the wrong type: {detail}")]
    TypeViolation { name: String, detail: String },

    #[error("malformed intrinsic call: {0}")]
    Malformed(String),

    #[error(transparent)]
    Path(#[from] value::PathError),
}

/// A single parsed argument to an intrinsic call, prior to resolution
/// against input/context.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    StringLiteral(String),
    Number(Value),
    Bool(bool),
    Null,
    PathRef(String),
    Intrinsic(Call),
    Identifier(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub name: String,
    pub args: Vec<Arg>,
}

/// Parse `States.Name(arg1, arg2, ...)` into a [`Call`]. Respects quoted
/// string literals (with backslash-escaped quotes), nested parens/brackets
/// for composition and path indices, and top-level comma separation.
pub fn parse_call(expr: &str) -> Result<Call, IntrinsicError> {
    let expr = expr.trim();
    if !expr.starts_with("States.") {
        return Err(IntrinsicError::Malformed(format!(
            "expected 'States.Name(...)', got: {expr}"
        )));
    }
    let open = expr
        .find('(')
        .ok_or_else(|| IntrinsicError::Malformed(format!("missing '(' in: {expr}")))?;
    if !expr.ends_with(')') {
        return Err(IntrinsicError::Malformed(format!(
            "missing closing ')' in: {expr}"
        )));
    }
    let name = expr["States.".len()..open].trim().to_string();
    let inner = &expr[open + 1..expr.len() - 1];

    let raw_args = split_top_level_args(inner)?;
    let args = raw_args
        .into_iter()
        .map(|a| parse_arg(a.trim()))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Call { name, args })
}

fn split_top_level_args(inner: &str) -> Result<Vec<String>, IntrinsicError> {
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut args = Vec::new();
    let mut depth = 0i32;
    let mut in_quote: Option<char> = None;
    let mut current = String::new();
    let mut chars = inner.chars().peekable();

    while let Some(c) = chars.next() {
        match in_quote {
            Some(q) => {
                current.push(c);
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                } else if c == q {
                    in_quote = None;
                }
            }
            None => match c {
                '\'' | '"' => {
                    in_quote = Some(c);
                    current.push(c);
                }
                '(' | '[' => {
                    depth += 1;
                    current.push(c);
                }
                ')' | ']' => {
                    depth -= 1;
                    current.push(c);
                }
                ',' if depth == 0 => {
                    args.push(current.clone());
                    current.clear();
                }
                _ => current.push(c),
            },
        }
    }

    if depth != 0 || in_quote.is_some() {
        return Err(IntrinsicError::Malformed(format!(
            "unbalanced argument list: {inner}"
        )));
    }
    args.push(current);
    Ok(args)
}

fn parse_arg(raw: &str) -> Result<Arg, IntrinsicError> {
    if raw.is_empty() {
        return Err(IntrinsicError::Malformed("empty argument".to_string()));
    }

    if (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
        || (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
    {
        let quote = raw.chars().next().unwrap();
        let body = &raw[1..raw.len() - 1];
        return Ok(Arg::StringLiteral(unescape(body, quote)));
    }

    if raw == "true" {
        return Ok(Arg::Bool(true));
    }
    if raw == "false" {
        return Ok(Arg::Bool(false));
    }
    if raw == "null" {
        return Ok(Arg::Null);
    }

    if raw.starts_with("States.") {
        return Ok(Arg::Intrinsic(parse_call(raw)?));
    }

    if raw.starts_with('$') {
        return Ok(Arg::PathRef(raw.to_string()));
    }

    if let Ok(i) = raw.parse::<i64>() {
        return Ok(Arg::Number(json!(i)));
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Ok(Arg::Number(json!(f)));
    }

    Ok(Arg::Identifier(raw.to_string()))
}

fn unescape(body: &str, quote: char) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if next == quote || next == '\\' {
                    out.push(next);
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

/// Resolves parsed [`Arg`]s against data/context, evaluates the call, and
/// returns the result value.
pub struct Evaluator<'a> {
    pub data: &'a Value,
    pub context: Option<&'a Value>,
    pub accumulators: Option<&'a ContextAccumulators>,
}

impl<'a> Evaluator<'a> {
    pub fn eval_expr(&self, expr: &str) -> Result<Value, IntrinsicError> {
        let call = parse_call(expr)?;
        self.eval_call(&call)
    }

    pub fn eval_call(&self, call: &Call) -> Result<Value, IntrinsicError> {
        let args = call
            .args
            .iter()
            .map(|a| self.eval_arg(a))
            .collect::<Result<Vec<_>, _>>()?;
        dispatch(&call.name, args, self.accumulators)
    }

    fn eval_arg(&self, arg: &Arg) -> Result<Value, IntrinsicError> {
        Ok(match arg {
            Arg::StringLiteral(s) => json!(s),
            Arg::Number(n) => n.clone(),
            Arg::Bool(b) => json!(b),
            Arg::Null => Value::Null,
            Arg::Identifier(s) => json!(s),
            Arg::PathRef(p) => {
                let path = Path::parse(p)?;
                value::evaluate(&path, self.data, self.context)?
            }
            Arg::Intrinsic(c) => self.eval_call(c)?,
        })
    }
}

fn arity_err(name: &str, expected: &str, got: usize) -> IntrinsicError {
    IntrinsicError::WrongArity {
        name: name.to_string(),
        expected: expected.to_string(),
        got,
    }
}

fn type_err(name: &str, detail: impl Into<String>) -> IntrinsicError {
    IntrinsicError::TypeViolation {
        name: name.to_string(),
        detail: detail.into(),
    }
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_number(name: &str, v: &Value) -> f64 {
    let _ = name;
    v.as_f64().unwrap_or(0.0)
}

fn dispatch(
    name: &str,
    args: Vec<Value>,
    accumulators: Option<&ContextAccumulators>,
) -> Result<Value, IntrinsicError> {
    match name {
        "Format" => {
            if args.is_empty() {
                return Err(arity_err(name, ">=1", args.len()));
            }
            let Value::String(template) = &args[0] else {
                return Err(type_err(name, "first argument must be a string template"));
            };
            let mut out = String::new();
            let mut rest = args[1..].iter();
            let mut chars = template.chars().peekable();
            while let Some(c) = chars.next() {
                if c == '{' && chars.peek() == Some(&'}') {
                    chars.next();
                    let next = rest
                        .next()
                        .ok_or_else(|| type_err(name, "not enough arguments for placeholders"))?;
                    out.push_str(&stringify(next));
                } else {
                    out.push(c);
                }
            }
            Ok(json!(out))
        }

        "StringToJson" => {
            if args.len() != 1 {
                return Err(arity_err(name, "1", args.len()));
            }
            let Value::String(s) = &args[0] else {
                return Err(type_err(name, "argument must be a string"));
            };
            serde_json::from_str(s).map_err(|e| type_err(name, format!("invalid JSON: {e}")))
        }

        "JsonToString" => {
            if args.len() != 1 {
                return Err(arity_err(name, "1", args.len()));
            }
            serde_json::to_string(&args[0])
                .map(|s| json!(s))
                .map_err(|e| type_err(name, e.to_string()))
        }

        "Array" => Ok(Value::Array(args)),

        "ArrayPartition" => {
            if args.len() != 2 {
                return Err(arity_err(name, "2", args.len()));
            }
            let Value::Array(arr) = &args[0] else {
                return Err(type_err(name, "first argument must be an array"));
            };
            let size = args[1]
                .as_u64()
                .ok_or_else(|| type_err(name, "second argument must be a positive integer"))?
                as usize;
            if size == 0 {
                return Err(type_err(name, "partition size must be > 0"));
            }
            let chunks: Vec<Value> = arr
                .chunks(size)
                .map(|c| Value::Array(c.to_vec()))
                .collect();
            Ok(Value::Array(chunks))
        }

        "ArrayContains" => {
            if args.len() != 2 {
                return Err(arity_err(name, "2", args.len()));
            }
            let Value::Array(arr) = &args[0] else {
                return Err(type_err(name, "first argument must be an array"));
            };
            Ok(json!(arr.contains(&args[1])))
        }

        "ArrayGetItem" => {
            if args.len() != 2 {
                return Err(arity_err(name, "2", args.len()));
            }
            let Value::Array(arr) = &args[0] else {
                return Err(type_err(name, "first argument must be an array"));
            };
            let idx = args[1]
                .as_i64()
                .ok_or_else(|| type_err(name, "second argument must be an integer"))?;
            let resolved = if idx >= 0 {
                idx as usize
            } else {
                let from_end = (-idx) as usize;
                if from_end > arr.len() {
                    return Ok(Value::Null);
                }
                arr.len() - from_end
            };
            Ok(arr.get(resolved).cloned().unwrap_or(Value::Null))
        }

        "ArrayLength" => {
            if args.len() != 1 {
                return Err(arity_err(name, "1", args.len()));
            }
            let Value::Array(arr) = &args[0] else {
                return Err(type_err(name, "argument must be an array"));
            };
            Ok(json!(arr.len()))
        }

        "ArrayRange" => {
            if args.len() != 2 && args.len() != 3 {
                return Err(arity_err(name, "2 or 3", args.len()));
            }
            let start = args[0]
                .as_i64()
                .ok_or_else(|| type_err(name, "start must be an integer"))?;
            let end = args[1]
                .as_i64()
                .ok_or_else(|| type_err(name, "end must be an integer"))?;
            let step = if args.len() == 3 {
                args[2]
                    .as_i64()
                    .ok_or_else(|| type_err(name, "step must be an integer"))?
            } else {
                1
            };
            if step == 0 {
                return Err(type_err(name, "step must not be zero"));
            }
            let mut out = Vec::new();
            let mut i = start;
            if step > 0 {
                while i < end {
                    out.push(json!(i));
                    i += step;
                }
            } else {
                while i > end {
                    out.push(json!(i));
                    i += step;
                }
            }
            Ok(Value::Array(out))
        }

        "ArrayUnique" => {
            if args.len() != 1 {
                return Err(arity_err(name, "1", args.len()));
            }
            let Value::Array(arr) = &args[0] else {
                return Err(type_err(name, "argument must be an array"));
            };
            let mut seen: Vec<&Value> = Vec::new();
            let mut out = Vec::new();
            for v in arr {
                if !seen.contains(&v) {
                    seen.push(v);
                    out.push(v.clone());
                }
            }
            Ok(Value::Array(out))
        }

        "ArrayConcat" => {
            if args.is_empty() {
                return Err(arity_err(name, ">=1", args.len()));
            }
            let mut out = Vec::new();
            for a in &args {
                let Value::Array(arr) = a else {
                    return Err(type_err(name, "all arguments must be arrays"));
                };
                out.extend(arr.iter().cloned());
            }
            Ok(Value::Array(out))
        }

        "MathAdd" | "MathSubtract" | "MathMultiply" => {
            if args.len() != 2 {
                return Err(arity_err(name, "2", args.len()));
            }
            let a = as_number(name, &args[0]);
            let b = as_number(name, &args[1]);
            let result = match name {
                "MathAdd" => a + b,
                "MathSubtract" => a - b,
                _ => a * b,
            };
            Ok(number_value(result))
        }

        "MathRandom" => {
            if !args.is_empty() {
                return Err(arity_err(name, "0", args.len()));
            }
            use rand::Rng;
            Ok(json!(rand::rng().random_range(0.0..1.0)))
        }

        "Hash" => {
            if args.len() != 2 {
                return Err(arity_err(name, "2", args.len()));
            }
            let data = stringify(&args[0]);
            let Value::String(algo) = &args[1] else {
                return Err(type_err(name, "second argument must be a string algorithm name"));
            };
            let digest = match algo.as_str() {
                "MD5" => {
                    use md5::Digest as _;
                    hex::encode(md5::Md5::digest(data.as_bytes()))
                }
                "SHA-1" => hex::encode(sha1::Sha1::digest(data.as_bytes())),
                "SHA-256" => {
                    use sha2::Digest as _;
                    hex::encode(sha2::Sha256::digest(data.as_bytes()))
                }
                "SHA-384" => {
                    use sha2::Digest as _;
                    hex::encode(sha2::Sha384::digest(data.as_bytes()))
                }
                "SHA-512" => {
                    use sha2::Digest as _;
                    hex::encode(sha2::Sha512::digest(data.as_bytes()))
                }
                other => {
                    return Err(type_err(name, format!("unsupported algorithm '{other}'")));
                }
            };
            Ok(json!(digest))
        }

        "Base64Encode" => {
            if args.len() != 1 {
                return Err(arity_err(name, "1", args.len()));
            }
            let data = stringify(&args[0]);
            Ok(json!(base64::engine::general_purpose::STANDARD.encode(data)))
        }

        "Base64Decode" => {
            if args.len() != 1 {
                return Err(arity_err(name, "1", args.len()));
            }
            let Value::String(s) = &args[0] else {
                return Err(type_err(name, "argument must be a string"));
            };
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(s)
                .map_err(|e| type_err(name, format!("invalid base64: {e}")))?;
            let decoded = String::from_utf8(bytes)
                .map_err(|e| type_err(name, format!("decoded bytes are not UTF-8: {e}")))?;
            Ok(json!(decoded))
        }

        "UUID" => {
            if !args.is_empty() {
                return Err(arity_err(name, "0", args.len()));
            }
            Ok(json!(uuid::Uuid::new_v4().to_string()))
        }

        "TokenCount" => {
            if args.len() != 1 {
                return Err(arity_err(name, "1", args.len()));
            }
            let s = stringify(&args[0]);
            Ok(json!((s.chars().count() as f64 / 4.0).ceil() as u64))
        }

        "Truncate" => {
            if args.len() != 2 {
                return Err(arity_err(name, "2", args.len()));
            }
            let s = stringify(&args[0]);
            let max_tokens = args[1]
                .as_u64()
                .ok_or_else(|| type_err(name, "second argument must be a positive integer"))?;
            let max_chars = (max_tokens * 4) as usize;
            let chars: Vec<char> = s.chars().collect();
            if chars.len() <= max_chars {
                Ok(json!(s))
            } else {
                let mut clipped: String = chars[..max_chars].iter().collect();
                clipped.push_str("...");
                Ok(json!(clipped))
            }
        }

        "Merge" => {
            let mut acc = Map::new();
            for a in &args {
                let Value::Object(m) = a else {
                    return Err(type_err(name, "all arguments must be objects"));
                };
                deep_merge(&mut acc, m);
            }
            Ok(Value::Object(acc))
        }

        "Pick" => {
            if args.len() < 2 {
                return Err(arity_err(name, ">=2", args.len()));
            }
            let Value::Object(m) = &args[0] else {
                return Err(type_err(name, "first argument must be an object"));
            };
            let mut out = Map::new();
            for key in &args[1..] {
                let Value::String(k) = key else {
                    return Err(type_err(name, "key arguments must be strings"));
                };
                if let Some(v) = m.get(k) {
                    out.insert(k.clone(), v.clone());
                }
            }
            Ok(Value::Object(out))
        }

        "Omit" => {
            if args.len() < 2 {
                return Err(arity_err(name, ">=2", args.len()));
            }
            let Value::Object(m) = &args[0] else {
                return Err(type_err(name, "first argument must be an object"));
            };
            let drop: HashSet<String> = args[1..]
                .iter()
                .map(|v| match v {
                    Value::String(s) => Ok(s.clone()),
                    _ => Err(type_err(name, "key arguments must be strings")),
                })
                .collect::<Result<_, _>>()?;
            let mut out = Map::new();
            for (k, v) in m {
                if !drop.contains(k) {
                    out.insert(k.clone(), v.clone());
                }
            }
            Ok(Value::Object(out))
        }

        "CurrentCost" => {
            if !args.is_empty() {
                return Err(arity_err(name, "0", args.len()));
            }
            Ok(json!(accumulators.map(|a| a.cost()).unwrap_or(0.0)))
        }

        "CurrentTokens" => {
            if !args.is_empty() {
                return Err(arity_err(name, "0", args.len()));
            }
            Ok(json!(accumulators.map(|a| a.tokens()).unwrap_or(0)))
        }

        other => Err(IntrinsicError::UnknownFunction(other.to_string())),
    }
}

fn number_value(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        json!(f as i64)
    } else {
        json!(f)
    }
}

/// Right-wins-on-scalar-conflict, recursive-merge-on-mapping-conflict
/// deep merge, per the Open Question in §9 of the spec (the legacy
/// scalar-duplicating-into-sequences behavior is not reproduced here).
fn deep_merge(acc: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (k, v) in incoming {
        match (acc.get(k), v) {
            (Some(Value::Object(existing)), Value::Object(new)) => {
                let mut merged = existing.clone();
                deep_merge(&mut merged, new);
                acc.insert(k.clone(), Value::Object(merged));
            }
            _ => {
                acc.insert(k.clone(), v.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(expr: &str, data: &Value) -> Result<Value, IntrinsicError> {
        let ev = Evaluator {
            data,
            context: None,
            accumulators: None,
        };
        ev.eval_expr(expr)
    }

    #[test]
    fn format_substitutes_placeholders() {
        let out = eval("States.Format('Result: {}', States.MathAdd(5, 3))", &json!({})).unwrap();
        assert_eq!(out, json!("Result: 8"));
    }

    #[test]
    fn array_partition_chunks() {
        let out = eval("States.ArrayPartition(States.Array(1,2,3,4,5), 2)", &json!({})).unwrap();
        assert_eq!(out, json!([[1, 2], [3, 4], [5]]));
    }

    #[test]
    fn array_range_is_half_open() {
        let out = eval("States.ArrayRange(0, 5, 1)", &json!({})).unwrap();
        assert_eq!(out, json!([0, 1, 2, 3, 4]));
    }

    #[test]
    fn array_get_item_negative_index() {
        let out = eval("States.ArrayGetItem(States.Array(1,2,3), -1)", &json!({})).unwrap();
        assert_eq!(out, json!(3));
    }

    #[test]
    fn array_get_item_out_of_range_is_null() {
        let out = eval("States.ArrayGetItem(States.Array(1,2), 9)", &json!({})).unwrap();
        assert_eq!(out, Value::Null);
    }

    #[test]
    fn hash_sha256() {
        let out = eval("States.Hash('abc', 'SHA-256')", &json!({})).unwrap();
        assert_eq!(
            out,
            json!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn base64_round_trip() {
        let encoded = eval("States.Base64Encode('hello')", &json!({})).unwrap();
        assert_eq!(encoded, json!("aGVsbG8="));
        let decoded = eval("States.Base64Decode('aGVsbG8=')", &json!({})).unwrap();
        assert_eq!(decoded, json!("hello"));
    }

    #[test]
    fn merge_right_wins_on_scalar_conflict() {
        let out = eval(
            "States.Merge(States.StringToJson('{\"a\":1,\"b\":{\"x\":1}}'), States.StringToJson('{\"a\":2,\"b\":{\"y\":2}}'))",
            &json!({}),
        )
        .unwrap();
        assert_eq!(out, json!({"a": 2, "b": {"x": 1, "y": 2}}));
    }

    #[test]
    fn pick_and_omit() {
        let data = json!({});
        let picked = eval("States.Pick(States.StringToJson('{\"a\":1,\"b\":2}'), 'a')", &data).unwrap();
        assert_eq!(picked, json!({"a": 1}));
        let omitted = eval("States.Omit(States.StringToJson('{\"a\":1,\"b\":2}'), 'a')", &data).unwrap();
        assert_eq!(omitted, json!({"b": 2}));
    }

    #[test]
    fn unknown_function_fails_intrinsic_failure() {
        let err = eval("States.Nope(1)", &json!({})).unwrap_err();
        assert!(matches!(err, IntrinsicError::UnknownFunction(_)));
    }

    #[test]
    fn wrong_arity_fails() {
        let err = eval("States.MathAdd(1)", &json!({})).unwrap_err();
        assert!(matches!(err, IntrinsicError::WrongArity { .. }));
    }

    #[test]
    fn path_ref_argument_resolves_against_data() {
        let data = json!({"n": 7});
        let out = eval("States.MathAdd($.n, 3)", &data).unwrap();
        assert_eq!(out, json!(10));
    }

    #[test]
    fn array_unique_preserves_first_occurrence() {
        let out = eval("States.ArrayUnique(States.Array(1,2,1,3,2))", &json!({})).unwrap();
        assert_eq!(out, json!([1, 2, 3]));
    }
}
