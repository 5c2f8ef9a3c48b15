// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::domain::error::{codes, EngineError, StateError};
use crate::domain::events::TraceRecord;
use crate::domain::value::Value;

/// Token/cost totals accumulated over a run, exposed to `States.CurrentCost`
/// and `States.CurrentTokens`.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ContextAccumulators {
    tokens: u64,
    cost: f64,
}

impl ContextAccumulators {
    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub fn add(&mut self, tokens: u64, cost: f64) {
        self.tokens += tokens;
        self.cost += cost;
    }
}

/// Per-map-iteration context, exposed at `$.Map.Item` in the execution
/// context object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapItemContext {
    pub index: usize,
    pub value: Value,
}

/// Bounds on a single run, guarding against runaway loops and unbounded
/// recursion through nested Map/Parallel sub-machines. Additive to the
/// interpreter's observable semantics: a well-behaved workflow never
/// reaches either limit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RunOptions {
    pub max_steps: u64,
    pub max_depth: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_steps: 10_000,
            max_depth: 16,
        }
    }
}

/// Runtime state threaded through a single workflow run: identity,
/// current-state bookkeeping, the append-only trace, accumulated
/// tokens/cost, and the step/depth budget.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub workflow_name: String,
    pub start_time: DateTime<Utc>,
    pub current_state: String,
    pub state_entered_at: DateTime<Utc>,
    pub retry_count: u32,
    pub map_item: Option<MapItemContext>,
    pub trace: Vec<TraceRecord>,
    pub accumulators: ContextAccumulators,
    pub paused: bool,
    pub checkpoint: Option<Value>,
    pub resume_data: Option<Value>,
    options: RunOptions,
    steps_taken: u64,
    depth: u32,
}

impl ExecutionContext {
    pub fn new(workflow_name: impl Into<String>, start_state: impl Into<String>, options: RunOptions) -> Self {
        let now = Utc::now();
        Self {
            execution_id: Uuid::new_v4(),
            workflow_name: workflow_name.into(),
            start_time: now,
            current_state: start_state.into(),
            state_entered_at: now,
            retry_count: 0,
            map_item: None,
            trace: Vec::new(),
            accumulators: ContextAccumulators::default(),
            paused: false,
            checkpoint: None,
            resume_data: None,
            options,
            steps_taken: 0,
            depth: 0,
        }
    }

    /// A child context for one Map iteration or Parallel branch, sharing
    /// the run's step budget but one level deeper.
    pub fn child(&self, start_state: impl Into<String>, map_item: Option<MapItemContext>) -> Result<Self, EngineError> {
        if self.depth + 1 > self.options.max_depth {
            return Err(EngineError::Validation(format!(
                "nesting depth exceeded ({})",
                self.options.max_depth
            )));
        }
        let mut child = Self::new(self.workflow_name.clone(), start_state, self.options);
        child.depth = self.depth + 1;
        child.map_item = map_item;
        Ok(child)
    }

    pub fn enter_state(&mut self, state: impl Into<String>) {
        self.current_state = state.into();
        self.state_entered_at = Utc::now();
        self.retry_count = 0;
    }

    /// Advances the step counter, returning a catchable `StateError` with
    /// code `States.BudgetExceeded` once the run's step budget is spent.
    pub fn record_step(&mut self) -> Result<(), StateError> {
        self.steps_taken += 1;
        if self.steps_taken > self.options.max_steps {
            return Err(StateError::new(
                codes::BUDGET_EXCEEDED,
                format!("exceeded step budget of {}", self.options.max_steps),
                self.current_state.clone(),
            ));
        }
        Ok(())
    }

    pub fn push_trace(&mut self, record: TraceRecord) {
        self.trace.push(record);
    }

    /// Builds the `$.Context` object available to `...Path` parameters
    /// (`Execution.{Id,Name,StartTime}`, `State.{Name,EnteredTime,RetryCount}`,
    /// and `Map.Item` when inside a Map iteration).
    pub fn as_context_value(&self) -> Value {
        let mut ctx = json!({
            "Execution": {
                "Id": self.execution_id.to_string(),
                "Name": self.workflow_name,
                "StartTime": self.start_time.to_rfc3339(),
            },
            "State": {
                "Name": self.current_state,
                "EnteredTime": self.state_entered_at.to_rfc3339(),
                "RetryCount": self.retry_count,
            },
        });
        if let Some(item) = &self.map_item {
            ctx["Map"] = json!({
                "Item": {
                    "Index": item.index,
                    "Value": item.value,
                }
            });
        }
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_value_exposes_execution_and_state() {
        let ctx = ExecutionContext::new("wf", "Start", RunOptions::default());
        let v = ctx.as_context_value();
        assert_eq!(v["State"]["Name"], json!("Start"));
        assert_eq!(v["State"]["RetryCount"], json!(0));
        assert!(v["Map"].is_null());
    }

    #[test]
    fn map_item_surfaces_under_context() {
        let mut ctx = ExecutionContext::new("wf", "Iterate", RunOptions::default());
        ctx.map_item = Some(MapItemContext {
            index: 2,
            value: json!("x"),
        });
        let v = ctx.as_context_value();
        assert_eq!(v["Map"]["Item"]["Index"], json!(2));
        assert_eq!(v["Map"]["Item"]["Value"], json!("x"));
    }

    #[test]
    fn record_step_fails_once_budget_exceeded() {
        let mut opts = RunOptions::default();
        opts.max_steps = 2;
        let mut ctx = ExecutionContext::new("wf", "Start", opts);
        ctx.record_step().unwrap();
        ctx.record_step().unwrap();
        let err = ctx.record_step().unwrap_err();
        assert_eq!(err.code, codes::BUDGET_EXCEEDED);
    }

    #[test]
    fn child_context_rejects_depth_overflow() {
        let mut opts = RunOptions::default();
        opts.max_depth = 0;
        let ctx = ExecutionContext::new("wf", "Start", opts);
        assert!(ctx.child("Inner", None).is_err());
    }

    #[test]
    fn enter_state_resets_retry_count() {
        let mut ctx = ExecutionContext::new("wf", "Start", RunOptions::default());
        ctx.retry_count = 3;
        ctx.enter_state("Next");
        assert_eq!(ctx.retry_count, 0);
        assert_eq!(ctx.current_state, "Next");
    }
}
