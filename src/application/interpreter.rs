//! Workflow Interpreter Application Service
//!
//! This module implements the FSM execution engine that drives workflow
//! state transitions.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Orchestrate workflow execution (FSM tick loop)
//! - **Dependencies:** Domain (Workflow, Agent, Context), Application (States,
//!   Validator, Approval)
//!
//! # FSM Tick Loop
//!
//! ```text
//! loop {
//!     current = workflow.states[current_name]
//!     outcome = execute_state(current, data)
//!     match outcome {
//!         Transition(next, data) => current_name = next,
//!         Terminal(data) => return Succeeded,
//!         Failure(err) => return Failed,
//!         Paused(pending) => return Paused,
//!     }
//! }
//! ```

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};

use crate::application::approval::ApprovalHandler;
use crate::application::states::{self, StateOutcome};
use crate::application::validator;
use crate::domain::agent::AgentRegistry;
use crate::domain::context::{ExecutionContext, RunOptions};
use crate::domain::error::{EngineError, StateError};
use crate::domain::events::{PendingInput, TraceRecord};
use crate::domain::value::Value;
use crate::domain::workflow::WorkflowDefinition;

/// The three-way terminal outcome of a run: normal completion, an
/// uncaught error, or a suspension awaiting external input (an Approval
/// state's pause).
#[derive(Debug, Clone)]
pub enum WorkflowResult {
    Succeeded {
        output: Value,
        trace: Vec<TraceRecord>,
        duration_seconds: f64,
        tokens: u64,
        cost: f64,
    },
    Failed {
        error: StateError,
        trace: Vec<TraceRecord>,
        duration_seconds: f64,
    },
    Paused {
        state_name: String,
        checkpoint_data: Value,
        pending_input: PendingInput,
        trace: Vec<TraceRecord>,
        duration_seconds: f64,
        /// Full execution context, so an embedding application can
        /// persist and later hand back to [`Interpreter::resume`].
        context: ExecutionContext,
    },
}

/// The FSM tick loop driving a [`WorkflowDefinition`] to completion.
/// Holds the [`AgentRegistry`] Task states resolve `Resource` names
/// against and the [`ApprovalHandler`] Approval states call through.
pub struct Interpreter {
    pub(crate) agents: AgentRegistry,
    pub(crate) approval: Arc<dyn ApprovalHandler>,
}

fn elapsed_seconds(start: chrono::DateTime<Utc>) -> f64 {
    (Utc::now() - start).num_milliseconds() as f64 / 1000.0
}

impl Interpreter {
    pub fn new(agents: AgentRegistry, approval: Arc<dyn ApprovalHandler>) -> Self {
        Self { agents, approval }
    }

    /// Runs a workflow from its `StartAt` state (or `RunOptions`'s
    /// start-state override) to a terminal or paused outcome.
    #[instrument(skip(self, workflow, input), fields(workflow = %workflow_name))]
    pub async fn run(
        &self,
        workflow_name: &str,
        workflow: &WorkflowDefinition,
        input: Value,
        options: RunOptions,
    ) -> Result<WorkflowResult, EngineError> {
        validator::validate(workflow)?;
        let mut ctx = ExecutionContext::new(workflow_name, workflow.start_at.clone(), options);
        self.run_from(workflow, &mut ctx, input).await
    }

    /// Resumes a previously paused run: re-enters the state it was
    /// paused in with the checkpointed input (the value presented to
    /// that state on entry, per §3's invariant), seeding `resume_data`
    /// for the state to pick up (e.g. an Approval state's decision).
    pub async fn resume(
        &self,
        workflow: &WorkflowDefinition,
        mut ctx: ExecutionContext,
        resume_data: Value,
    ) -> Result<WorkflowResult, EngineError> {
        let checkpoint_input = ctx.checkpoint.clone().unwrap_or(Value::Null);
        ctx.paused = false;
        ctx.resume_data = Some(resume_data);
        self.run_from(workflow, &mut ctx, checkpoint_input).await
    }

    /// The tick loop shared by top-level runs and nested Map/Parallel
    /// sub-machines, which call back into this via `states::dispatch`.
    pub(crate) async fn run_from(
        &self,
        workflow: &WorkflowDefinition,
        ctx: &mut ExecutionContext,
        input: Value,
    ) -> Result<WorkflowResult, EngineError> {
        let mut data = input;
        let mut current = ctx.current_state.clone();
        ctx.push_trace(TraceRecord::WorkflowStart {
            timestamp: Utc::now(),
            start_state: current.clone(),
        });

        loop {
            ctx.enter_state(current.clone());

            if let Err(budget_error) = ctx.record_step() {
                ctx.push_trace(TraceRecord::WorkflowError {
                    timestamp: Utc::now(),
                    state: current.clone(),
                    error: budget_error.clone(),
                });
                return Ok(WorkflowResult::Failed {
                    error: budget_error,
                    trace: ctx.trace.clone(),
                    duration_seconds: elapsed_seconds(ctx.start_time),
                });
            }

            let state = workflow
                .states
                .get(&current)
                .ok_or_else(|| EngineError::UndefinedState(current.clone()))?;

            ctx.push_trace(TraceRecord::StateEnter {
                timestamp: Utc::now(),
                state: current.clone(),
                input: data.clone(),
            });

            let outcome = states::dispatch(self, state, &current, data.clone(), ctx).await?;

            match outcome {
                StateOutcome::Transition(next, new_data) => {
                    ctx.push_trace(TraceRecord::StateExit {
                        timestamp: Utc::now(),
                        state: current.clone(),
                        output: new_data.clone(),
                    });
                    data = new_data;
                    current = next;
                }
                StateOutcome::Terminal(new_data) => {
                    ctx.push_trace(TraceRecord::StateExit {
                        timestamp: Utc::now(),
                        state: current.clone(),
                        output: new_data.clone(),
                    });
                    ctx.push_trace(TraceRecord::WorkflowComplete {
                        timestamp: Utc::now(),
                        output: new_data.clone(),
                    });
                    info!(state = %current, "workflow reached terminal state");
                    return Ok(WorkflowResult::Succeeded {
                        output: new_data,
                        trace: ctx.trace.clone(),
                        duration_seconds: elapsed_seconds(ctx.start_time),
                        tokens: ctx.accumulators.tokens(),
                        cost: ctx.accumulators.cost(),
                    });
                }
                StateOutcome::Failure(error) => {
                    ctx.push_trace(TraceRecord::WorkflowError {
                        timestamp: Utc::now(),
                        state: current.clone(),
                        error: error.clone(),
                    });
                    return Ok(WorkflowResult::Failed {
                        error,
                        trace: ctx.trace.clone(),
                        duration_seconds: elapsed_seconds(ctx.start_time),
                    });
                }
                StateOutcome::Paused(pending_input) => {
                    ctx.paused = true;
                    ctx.push_trace(TraceRecord::WorkflowPaused {
                        timestamp: Utc::now(),
                        state: current.clone(),
                    });
                    return Ok(WorkflowResult::Paused {
                        state_name: current.clone(),
                        checkpoint_data: ctx.checkpoint.clone().unwrap_or(Value::Null),
                        pending_input,
                        trace: ctx.trace.clone(),
                        duration_seconds: elapsed_seconds(ctx.start_time),
                        context: ctx.clone(),
                    });
                }
            }
        }
    }
}
