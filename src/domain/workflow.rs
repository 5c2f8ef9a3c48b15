//! Workflow Domain Model
//!
//! Defines the declarative finite-state-machine shape a workflow
//! definition parses into: states, transitions, data-shaping fields,
//! and the choice-rule/retry/catch vocabulary every state kind shares.
//!
//! # Design Principles
//!
//! 1. **Immutability:** a parsed [`WorkflowDefinition`] never mutates.
//! 2. **Declarative:** states describe what happens, not how the
//!    interpreter's loop is implemented.
//! 3. **Self-Validating:** [`WorkflowDefinition::validate`] enforces the
//!    structural invariants before a run ever starts.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::error::EngineError;
use crate::domain::value::Value;

/// A parsed, not-yet-validated workflow. `States` maps a state name to
/// its definition; `StartAt` must name a key in that map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(rename = "StartAt")]
    pub start_at: String,
    #[serde(rename = "States")]
    pub states: HashMap<String, StateDefinition>,
}

impl WorkflowDefinition {
    /// Structural checks only (§4.7): `StartAt` is defined, every `Next`
    /// target is defined, every state is either terminal or
    /// transitioning, and kind-specific required fields are present.
    /// Unreachable states are reported as warnings, not failures.
    pub fn validate(&self) -> Result<Vec<String>, EngineError> {
        if !self.states.contains_key(&self.start_at) {
            return Err(EngineError::MissingStartAt);
        }

        for (name, state) in &self.states {
            state.validate(name)?;
            if let Some(next) = state.next() {
                if !self.states.contains_key(next) {
                    return Err(EngineError::UndefinedState(next.clone()));
                }
            }
            for catcher in state.catch() {
                if !self.states.contains_key(&catcher.next) {
                    return Err(EngineError::UndefinedState(catcher.next.clone()));
                }
            }
            if let StateDefinition::Choice(choice) = state {
                for rule in &choice.choices {
                    if !self.states.contains_key(&rule.next) {
                        return Err(EngineError::UndefinedState(rule.next.clone()));
                    }
                }
                if let Some(default) = &choice.default {
                    if !self.states.contains_key(default) {
                        return Err(EngineError::UndefinedState(default.clone()));
                    }
                }
            }
        }

        Ok(self.unreachable_states())
    }

    fn unreachable_states(&self) -> Vec<String> {
        let mut reachable = std::collections::HashSet::new();
        let mut stack = vec![self.start_at.clone()];
        while let Some(name) = stack.pop() {
            if !reachable.insert(name.clone()) {
                continue;
            }
            let Some(state) = self.states.get(&name) else {
                continue;
            };
            if let Some(next) = state.next() {
                stack.push(next.clone());
            }
            for catcher in state.catch() {
                stack.push(catcher.next.clone());
            }
            if let StateDefinition::Choice(choice) = state {
                for rule in &choice.choices {
                    stack.push(rule.next.clone());
                }
                if let Some(default) = &choice.default {
                    stack.push(default.clone());
                }
            }
        }
        self.states
            .keys()
            .filter(|k| !reachable.contains(*k))
            .cloned()
            .collect()
    }
}

/// The common path-shaping fields every state kind honors, applied in
/// the order `InputPath` -> kind-specific work -> `ResultSelector` ->
/// `ResultPath` -> `OutputPath`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataFlow {
    #[serde(rename = "InputPath", default)]
    pub input_path: Option<String>,
    #[serde(rename = "Parameters", default)]
    pub parameters: Option<Value>,
    /// Pass's static replacement value (§4.4.2); takes priority over
    /// `Parameters`/the filtered input when present.
    #[serde(rename = "Result", default)]
    pub result: Option<Value>,
    #[serde(rename = "ResultSelector", default)]
    pub result_selector: Option<Value>,
    #[serde(rename = "ResultPath", default)]
    pub result_path: Option<String>,
    #[serde(rename = "OutputPath", default)]
    pub output_path: Option<String>,
}

/// One entry of a `Retry` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRule {
    #[serde(rename = "ErrorEquals")]
    pub error_equals: Vec<String>,
    #[serde(rename = "MaxAttempts", default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(rename = "IntervalSeconds", default = "default_interval_seconds")]
    pub interval_seconds: f64,
    #[serde(rename = "BackoffRate", default = "default_backoff_rate")]
    pub backoff_rate: f64,
    #[serde(rename = "MaxDelaySeconds", default)]
    pub max_delay_seconds: Option<f64>,
    #[serde(rename = "JitterStrategy", default)]
    pub jitter_strategy: JitterStrategy,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_interval_seconds() -> f64 {
    1.0
}
fn default_backoff_rate() -> f64 {
    2.0
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum JitterStrategy {
    #[default]
    #[serde(rename = "NONE")]
    None,
    #[serde(rename = "FULL")]
    Full,
    #[serde(rename = "EQUAL")]
    Equal,
}

/// One entry of a `Catch` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatchRule {
    #[serde(rename = "ErrorEquals")]
    pub error_equals: Vec<String>,
    #[serde(rename = "Next")]
    pub next: String,
    #[serde(rename = "ResultPath", default)]
    pub result_path: Option<String>,
}

/// Choice-rule comparison vocabulary (§4.4.3). `And`/`Or`/`Not` compose
/// other rules; everything else compares `Variable` against `Value`/
/// `*Path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChoiceExpr {
    Compound(CompoundChoice),
    Comparison(ComparisonChoice),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CompoundChoice {
    And(Vec<ChoiceExpr>),
    Or(Vec<ChoiceExpr>),
    Not(Box<ChoiceExpr>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonChoice {
    #[serde(rename = "Variable")]
    pub variable: String,
    #[serde(flatten)]
    pub op: ComparisonOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ComparisonOp {
    StringEquals(String),
    StringEqualsPath(String),
    StringLessThan(String),
    StringLessThanEquals(String),
    StringGreaterThan(String),
    StringGreaterThanEquals(String),
    StringMatches(String),
    NumericEquals(f64),
    NumericLessThan(f64),
    NumericLessThanEquals(f64),
    NumericGreaterThan(f64),
    NumericGreaterThanEquals(f64),
    BooleanEquals(bool),
    TimestampEquals(String),
    #[serde(rename = "TimestampLessThan")]
    TimestampLessThan(Value),
    #[serde(rename = "TimestampGreaterThan")]
    TimestampGreaterThan(Value),
    IsNull(bool),
    IsPresent(bool),
    IsString(bool),
    IsNumeric(bool),
    IsBoolean(bool),
    IsTimestamp(bool),
}

/// One `Choices` array entry: a rule paired with its transition target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChoiceRule {
    #[serde(flatten)]
    pub expr: ChoiceExpr,
    #[serde(rename = "Next")]
    pub next: String,
}

/// The discriminated union of state kinds, tagged by `Type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum StateDefinition {
    Task(TaskState),
    Pass(PassState),
    Choice(ChoiceState),
    Wait(WaitState),
    Succeed(SucceedState),
    Fail(FailState),
    Map(MapState),
    Parallel(ParallelState),
    Approval(ApprovalState),
    Checkpoint(CheckpointState),
    Debate(DebateState),
}

impl StateDefinition {
    pub fn next(&self) -> Option<&String> {
        match self {
            StateDefinition::Task(s) => s.next.as_ref(),
            StateDefinition::Pass(s) => s.next.as_ref(),
            StateDefinition::Choice(_) => None,
            StateDefinition::Wait(s) => s.next.as_ref(),
            StateDefinition::Succeed(_) => None,
            StateDefinition::Fail(_) => None,
            StateDefinition::Map(s) => s.next.as_ref(),
            StateDefinition::Parallel(s) => s.next.as_ref(),
            StateDefinition::Approval(s) => s.next.as_ref(),
            StateDefinition::Checkpoint(s) => s.next.as_ref(),
            StateDefinition::Debate(s) => s.next.as_ref(),
        }
    }

    pub fn is_end(&self) -> bool {
        match self {
            StateDefinition::Task(s) => s.end,
            StateDefinition::Pass(s) => s.end,
            StateDefinition::Choice(_) => false,
            StateDefinition::Wait(s) => s.end,
            StateDefinition::Succeed(_) => true,
            StateDefinition::Fail(_) => true,
            StateDefinition::Map(s) => s.end,
            StateDefinition::Parallel(s) => s.end,
            StateDefinition::Approval(s) => s.end,
            StateDefinition::Checkpoint(s) => s.end,
            StateDefinition::Debate(s) => s.end,
        }
    }

    pub fn retry(&self) -> &[RetryRule] {
        match self {
            StateDefinition::Task(s) => &s.retry,
            StateDefinition::Map(s) => &s.retry,
            StateDefinition::Parallel(s) => &s.retry,
            StateDefinition::Debate(s) => &s.retry,
            _ => &[],
        }
    }

    pub fn catch(&self) -> &[CatchRule] {
        match self {
            StateDefinition::Task(s) => &s.catch,
            StateDefinition::Map(s) => &s.catch,
            StateDefinition::Parallel(s) => &s.catch,
            StateDefinition::Debate(s) => &s.catch,
            _ => &[],
        }
    }

    pub fn data_flow(&self) -> &DataFlow {
        match self {
            StateDefinition::Task(s) => &s.flow,
            StateDefinition::Pass(s) => &s.flow,
            StateDefinition::Choice(s) => &s.flow,
            StateDefinition::Wait(s) => &s.flow,
            StateDefinition::Succeed(s) => &s.flow,
            StateDefinition::Fail(_) => &EMPTY_FLOW,
            StateDefinition::Map(s) => &s.flow,
            StateDefinition::Parallel(s) => &s.flow,
            StateDefinition::Approval(s) => &s.flow,
            StateDefinition::Checkpoint(s) => &s.flow,
            StateDefinition::Debate(s) => &s.flow,
        }
    }

    fn validate(&self, name: &str) -> Result<(), EngineError> {
        let transitioning = self.next().is_some();
        let terminal = self.is_end();
        if !transitioning && !terminal {
            return Err(EngineError::DanglingState(name.to_string()));
        }
        match self {
            StateDefinition::Choice(c) if c.choices.is_empty() => Err(EngineError::Validation(
                format!("Choice state '{name}' has no Choices entries"),
            )),
            StateDefinition::Map(m) if m.iterator.states.is_empty() => Err(EngineError::Validation(
                format!("Map state '{name}' has an empty Iterator"),
            )),
            StateDefinition::Parallel(p) if p.branches.is_empty() => Err(EngineError::Validation(
                format!("Parallel state '{name}' has no Branches"),
            )),
            StateDefinition::Debate(d) if d.participants.len() < 2 => Err(EngineError::Validation(
                format!("Debate state '{name}' needs at least two participants"),
            )),
            _ => Ok(()),
        }
    }
}

const EMPTY_FLOW: DataFlow = DataFlow {
    input_path: None,
    parameters: None,
    result: None,
    result_selector: None,
    result_path: None,
    output_path: None,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    #[serde(rename = "Resource")]
    pub resource: String,
    #[serde(rename = "Next", default)]
    pub next: Option<String>,
    #[serde(rename = "End", default)]
    pub end: bool,
    #[serde(rename = "TimeoutSeconds", default)]
    pub timeout_seconds: Option<f64>,
    #[serde(rename = "Retry", default)]
    pub retry: Vec<RetryRule>,
    #[serde(rename = "Catch", default)]
    pub catch: Vec<CatchRule>,
    #[serde(flatten)]
    pub flow: DataFlow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassState {
    #[serde(rename = "Next", default)]
    pub next: Option<String>,
    #[serde(rename = "End", default)]
    pub end: bool,
    #[serde(flatten)]
    pub flow: DataFlow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChoiceState {
    #[serde(rename = "Choices")]
    pub choices: Vec<ChoiceRule>,
    #[serde(rename = "Default", default)]
    pub default: Option<String>,
    #[serde(flatten)]
    pub flow: DataFlow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitState {
    #[serde(rename = "Seconds", default)]
    pub seconds: Option<f64>,
    #[serde(rename = "SecondsPath", default)]
    pub seconds_path: Option<String>,
    #[serde(rename = "Timestamp", default)]
    pub timestamp: Option<String>,
    #[serde(rename = "TimestampPath", default)]
    pub timestamp_path: Option<String>,
    #[serde(rename = "Next", default)]
    pub next: Option<String>,
    #[serde(rename = "End", default)]
    pub end: bool,
    #[serde(flatten)]
    pub flow: DataFlow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SucceedState {
    #[serde(flatten)]
    pub flow: DataFlow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailState {
    #[serde(rename = "Error", default)]
    pub error: Option<String>,
    #[serde(rename = "Cause", default)]
    pub cause: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapState {
    #[serde(rename = "ItemsPath", default = "default_items_path")]
    pub items_path: String,
    /// Resolved like `Parameters` against each item (with `$$.Map.Item`
    /// in scope); when absent the item itself is used as the iterator's
    /// input if it's a mapping, else it's wrapped as `{value, index}`
    /// (§4.4.4).
    #[serde(rename = "ItemSelector", default)]
    pub item_selector: Option<Value>,
    #[serde(rename = "MaxConcurrency", default)]
    pub max_concurrency: Option<u32>,
    #[serde(rename = "Iterator")]
    pub iterator: WorkflowDefinition,
    #[serde(rename = "Next", default)]
    pub next: Option<String>,
    #[serde(rename = "End", default)]
    pub end: bool,
    #[serde(rename = "Retry", default)]
    pub retry: Vec<RetryRule>,
    #[serde(rename = "Catch", default)]
    pub catch: Vec<CatchRule>,
    #[serde(flatten)]
    pub flow: DataFlow,
}

fn default_items_path() -> String {
    "$".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelState {
    #[serde(rename = "Branches")]
    pub branches: Vec<WorkflowDefinition>,
    #[serde(rename = "Next", default)]
    pub next: Option<String>,
    #[serde(rename = "End", default)]
    pub end: bool,
    #[serde(rename = "Retry", default)]
    pub retry: Vec<RetryRule>,
    #[serde(rename = "Catch", default)]
    pub catch: Vec<CatchRule>,
    #[serde(flatten)]
    pub flow: DataFlow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalState {
    /// Static prompt text, a structured `{Title, Description}` object, or
    /// (via `Prompt.$`, folded by the loader into `prompt_path`) a dynamic
    /// expression evaluated against the state's input.
    #[serde(rename = "Prompt", default)]
    pub prompt: Option<Value>,
    #[serde(rename = "Prompt.$", default)]
    pub prompt_path: Option<String>,
    #[serde(rename = "Options", default)]
    pub options: Vec<String>,
    #[serde(rename = "Editable", default)]
    pub editable: bool,
    #[serde(rename = "TimeoutSeconds", default)]
    pub timeout_seconds: Option<f64>,
    /// When present, routes post-result data through the same Choice
    /// semantics as a Choice state instead of `Next`/`End`.
    #[serde(rename = "Choices", default)]
    pub choices: Vec<ChoiceRule>,
    #[serde(rename = "Default", default)]
    pub default: Option<String>,
    #[serde(rename = "Next", default)]
    pub next: Option<String>,
    #[serde(rename = "End", default)]
    pub end: bool,
    #[serde(flatten)]
    pub flow: DataFlow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    #[serde(rename = "Name", default)]
    pub name: Option<String>,
    #[serde(rename = "TtlSeconds", default)]
    pub ttl_seconds: Option<u64>,
    #[serde(rename = "Next", default)]
    pub next: Option<String>,
    #[serde(rename = "End", default)]
    pub end: bool,
    #[serde(flatten)]
    pub flow: DataFlow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateState {
    #[serde(rename = "Participants")]
    pub participants: Vec<String>,
    #[serde(rename = "Rounds", default = "default_rounds")]
    pub rounds: u32,
    /// An optional participant that does not take part in the rounds
    /// themselves but is called once afterward with the full history to
    /// produce the final `decision`/`consensus` fields.
    #[serde(rename = "Arbiter", default)]
    pub arbiter: Option<String>,
    #[serde(rename = "RequireConsensus", default)]
    pub require_consensus: bool,
    #[serde(rename = "Topic", default)]
    pub topic: Option<Value>,
    #[serde(rename = "Next", default)]
    pub next: Option<String>,
    #[serde(rename = "End", default)]
    pub end: bool,
    #[serde(rename = "Retry", default)]
    pub retry: Vec<RetryRule>,
    #[serde(rename = "Catch", default)]
    pub catch: Vec<CatchRule>,
    #[serde(flatten)]
    pub flow: DataFlow,
}

fn default_rounds() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> WorkflowDefinition {
        serde_json::from_value(json!({
            "StartAt": "Greet",
            "States": {
                "Greet": {
                    "Type": "Pass",
                    "Next": "Done"
                },
                "Done": {
                    "Type": "Succeed"
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn validates_a_minimal_well_formed_workflow() {
        let wf = sample();
        assert!(wf.validate().unwrap().is_empty());
    }

    #[test]
    fn rejects_missing_start_state() {
        let mut wf = sample();
        wf.start_at = "Nope".to_string();
        assert!(matches!(wf.validate(), Err(EngineError::MissingStartAt)));
    }

    #[test]
    fn rejects_undefined_next_target() {
        let mut wf = sample();
        if let StateDefinition::Pass(p) = wf.states.get_mut("Greet").unwrap() {
            p.next = Some("Ghost".to_string());
        }
        assert!(matches!(wf.validate(), Err(EngineError::UndefinedState(_))));
    }

    #[test]
    fn rejects_dangling_state_without_next_or_end() {
        let mut wf = sample();
        if let StateDefinition::Pass(p) = wf.states.get_mut("Greet").unwrap() {
            p.next = None;
            p.end = false;
        }
        assert!(matches!(wf.validate(), Err(EngineError::DanglingState(_))));
    }

    #[test]
    fn reports_unreachable_states_as_warnings() {
        let mut wf = sample();
        wf.states.insert(
            "Orphan".to_string(),
            StateDefinition::Succeed(SucceedState { flow: DataFlow::default() }),
        );
        let warnings = wf.validate().unwrap();
        assert_eq!(warnings, vec!["Orphan".to_string()]);
    }

    #[test]
    fn choice_state_requires_nonempty_choices() {
        let mut wf = sample();
        wf.states.insert(
            "Pick".to_string(),
            StateDefinition::Choice(ChoiceState {
                choices: vec![],
                default: None,
                flow: DataFlow::default(),
            }),
        );
        if let StateDefinition::Pass(p) = wf.states.get_mut("Greet").unwrap() {
            p.next = Some("Pick".to_string());
        }
        assert!(matches!(wf.validate(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn debate_state_requires_two_participants() {
        let mut wf = sample();
        wf.states.insert(
            "Discuss".to_string(),
            StateDefinition::Debate(DebateState {
                participants: vec!["only-one".to_string()],
                rounds: 1,
                arbiter: None,
                require_consensus: false,
                topic: None,
                next: None,
                end: true,
                retry: vec![],
                catch: vec![],
                flow: DataFlow::default(),
            }),
        );
        if let StateDefinition::Pass(p) = wf.states.get_mut("Greet").unwrap() {
            p.next = Some("Discuss".to_string());
        }
        assert!(matches!(wf.validate(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn deserializes_task_state_with_retry_and_catch() {
        let wf: WorkflowDefinition = serde_json::from_value(json!({
            "StartAt": "DoWork",
            "States": {
                "DoWork": {
                    "Type": "Task",
                    "Resource": "writer",
                    "End": true,
                    "Retry": [{"ErrorEquals": ["States.ALL"], "MaxAttempts": 2}],
                    "Catch": [{"ErrorEquals": ["States.ALL"], "Next": "DoWork"}]
                }
            }
        }))
        .unwrap();
        let StateDefinition::Task(t) = &wf.states["DoWork"] else {
            panic!("expected Task state");
        };
        assert_eq!(t.retry[0].max_attempts, 2);
        assert_eq!(t.catch[0].next, "DoWork");
    }
}
