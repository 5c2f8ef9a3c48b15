// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Value Model & Path Engine
//!
//! [`Value`] is the JSON-like datum that flows between workflow states.
//! [`Path`] is the `$`/`$$`-rooted selector used to read it, write it, and
//! address the context-object view exposed to `$$` lookups.
//!
//! # Architectural Context
//!
//! - **Bounded Context:** Workflow Orchestration
//! - **Layer:** Domain
//!
//! Every other component in this crate (intrinsics, parameter resolution,
//! choice comparisons, `ResultPath` merges) closes over this module.

use serde::{Deserialize, Serialize};
use serde_json::Map as JsonMap;
use std::fmt;

/// A JSON-like value: null, boolean, number, string, ordered sequence, or
/// an insertion-order-preserving mapping from string to `Value`.
///
/// This is a thin, serde-compatible wrapper around [`serde_json::Value`].
/// Object key order is preserved (serde_json's default `Map` already
/// preserves insertion order when the `preserve_order` feature-equivalent
/// behavior is relied upon) so trace output is deterministic, though key
/// order carries no semantic weight.
pub type Value = serde_json::Value;

/// Errors raised by path evaluation, writing, or parsing.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
    #[error("malformed path expression: {0}")]
    Malformed(String),

    #[error("path '{0}' references the execution context but none was supplied")]
    ContextUnavailable(String),
}

/// A single segment of a parsed path: a mapping key, a positive index, a
/// negative (from-end) index, or the `[*]` wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(i64),
    Wildcard,
}

/// A parsed, reusable path expression.
///
/// - `$` selects the root of the data value.
/// - `$.a.b[0].c` walks nested keys and array indices; `[-1]` counts from
///   the end; `[*]` yields the array itself (used for enumeration).
/// - `$$.a.b` roots the walk at the execution context object instead of
///   the data value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    raw: String,
    context_rooted: bool,
    segments: Vec<Segment>,
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl Path {
    /// Is this `$` or `$$` with no further segments?
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Does this path address the `$$` context object rather than data?
    pub fn is_context_rooted(&self) -> bool {
        self.context_rooted
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Parse a path expression. Does not evaluate it.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        if raw.is_empty() {
            return Err(PathError::Malformed("empty path".to_string()));
        }

        let context_rooted = raw.starts_with("$$");
        let rest = if context_rooted {
            &raw[2..]
        } else if let Some(stripped) = raw.strip_prefix('$') {
            stripped
        } else {
            return Err(PathError::Malformed(format!(
                "path must start with '$' or '$$': {raw}"
            )));
        };

        let segments = parse_segments(rest)
            .map_err(|e| PathError::Malformed(format!("{raw}: {e}")))?;

        Ok(Self {
            raw: raw.to_string(),
            context_rooted,
            segments,
        })
    }
}

/// Parse the portion of a path after the `$`/`$$` prefix into segments.
fn parse_segments(rest: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let chars: Vec<char> = rest.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '.' => {
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                    i += 1;
                }
                if start == i {
                    return Err("empty path segment".to_string());
                }
                segments.push(Segment::Key(chars[start..i].iter().collect()));
            }
            '[' => {
                let close = chars[i..]
                    .iter()
                    .position(|&c| c == ']')
                    .ok_or_else(|| "unterminated '['".to_string())?
                    + i;
                let inner: String = chars[i + 1..close].iter().collect();
                if inner == "*" {
                    segments.push(Segment::Wildcard);
                } else {
                    let idx: i64 = inner
                        .parse()
                        .map_err(|_| format!("invalid index '{inner}'"))?;
                    segments.push(Segment::Index(idx));
                }
                i = close + 1;
            }
            other => return Err(format!("unexpected character '{other}' in path")),
        }
    }

    Ok(segments)
}

/// Evaluate `path` against `data`, optionally resolving `$$` against
/// `context`. Missing intermediate keys or out-of-range indices return
/// `Ok(Value::Null)`, never an error — only malformed paths or a `$$`
/// path with no context error.
pub fn evaluate(path: &Path, data: &Value, context: Option<&Value>) -> Result<Value, PathError> {
    let root = if path.is_context_rooted() {
        context.ok_or_else(|| PathError::ContextUnavailable(path.raw.clone()))?
    } else {
        data
    };

    if path.is_root() {
        return Ok(root.clone());
    }

    let mut current = root;
    for seg in &path.segments {
        match seg {
            Segment::Key(key) => match current.as_object().and_then(|m| m.get(key)) {
                Some(v) => current = v,
                None => return Ok(Value::Null),
            },
            Segment::Index(idx) => {
                let Some(arr) = current.as_array() else {
                    return Ok(Value::Null);
                };
                let resolved = resolve_index(*idx, arr.len());
                match resolved.and_then(|i| arr.get(i)) {
                    Some(v) => current = v,
                    None => return Ok(Value::Null),
                }
            }
            Segment::Wildcard => {
                // `[*]` yields the sequence itself; only meaningful as the
                // final segment in practice, but we simply pass through.
                return Ok(current.clone());
            }
        }
    }

    Ok(current.clone())
}

fn resolve_index(idx: i64, len: usize) -> Option<usize> {
    if idx >= 0 {
        Some(idx as usize)
    } else {
        let from_end = (-idx) as usize;
        if from_end > len {
            None
        } else {
            Some(len - from_end)
        }
    }
}

/// Sentinel recognized by [`apply_result_path`]: a raw (unparsed) path
/// string equal to this literal discards the value and returns `data`
/// unchanged (§4.1). It is not itself a valid `$`-rooted path, so it must
/// be checked before [`Path::parse`] is attempted.
pub const DISCARD_SENTINEL: &str = "null";

/// Apply a `ResultPath`-style raw path string to merge `result` into
/// `data`. `raw` of `None` defaults to `$` (whole replacement); `Some("null")`
/// discards the result and returns `data` unchanged; anything else is
/// parsed and passed to [`set`].
pub fn apply_result_path(
    raw: Option<&str>,
    data: &Value,
    result: Value,
) -> Result<Value, PathError> {
    match raw {
        None => set(&Path::parse("$")?, data, result),
        Some(p) if p == DISCARD_SENTINEL => Ok(data.clone()),
        Some(p) => set(&Path::parse(p)?, data, result),
    }
}

/// Write `value` into `data` at `path`, creating missing intermediate
/// mappings. `$` replaces the whole root (non-mapping values are wrapped
/// as `{ "value": v }`).
pub fn set(path: &Path, data: &Value, value: Value) -> Result<Value, PathError> {
    if path.is_context_rooted() {
        return Err(PathError::Malformed(format!(
            "cannot write through context path '{}'",
            path.raw
        )));
    }

    if path.is_root() {
        return Ok(match value {
            Value::Object(_) => value,
            other => {
                let mut m = JsonMap::new();
                m.insert("value".to_string(), other);
                Value::Object(m)
            }
        });
    }

    let mut result = data.clone();
    set_segments(&mut result, &path.segments, value);
    Ok(result)
}

fn set_segments(current: &mut Value, segments: &[Segment], value: Value) {
    let Some((seg, rest)) = segments.split_first() else {
        *current = value;
        return;
    };

    match seg {
        Segment::Key(key) => {
            if !current.is_object() {
                *current = Value::Object(JsonMap::new());
            }
            let map = current.as_object_mut().expect("just coerced to object");
            let entry = map.entry(key.clone()).or_insert(Value::Null);
            if rest.is_empty() {
                *entry = value;
            } else {
                set_segments(entry, rest, value);
            }
        }
        Segment::Index(idx) => {
            if !current.is_array() {
                *current = Value::Array(Vec::new());
            }
            let arr = current.as_array_mut().expect("just coerced to array");
            let resolved = resolve_index(*idx, arr.len()).unwrap_or(arr.len());
            while arr.len() <= resolved {
                arr.push(Value::Null);
            }
            if rest.is_empty() {
                arr[resolved] = value;
            } else {
                set_segments(&mut arr[resolved], rest, value);
            }
        }
        Segment::Wildcard => {
            // Writing through `[*]` is not a supported pattern; treat as a
            // whole-value replacement at this position.
            *current = value;
        }
    }
}
