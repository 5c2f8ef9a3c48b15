// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # aegis-workflow-engine
//!
//! A declarative finite-state-machine workflow interpreter: named states
//! connected by transitions, a dataflow value routed between them, and
//! a fixed vocabulary of state kinds (Task, Pass, Choice, Wait, Succeed,
//! Fail, Map, Parallel, Approval, Checkpoint, Debate) covering dispatch
//! to external agents, conditional branching, iteration, parallel
//! sub-machines, classified retry/catch, and human-in-the-loop pause and
//! resume.
//!
//! ## Layer Structure
//!
//! ```text
//! application/    ← Interpreter (FSM tick loop), state executors, validator,
//!                   parameter resolver, approval boundary
//!     ↓
//! domain/         ← Value/path model, intrinsics, workflow definition,
//!                   execution context, agent registry, error taxonomy
//!     ↓
//! infra/          ← Workflow definition parsing (JSON/YAML)
//! ```
//!
//! ## Entry Points
//!
//! Build an [`domain::agent::AgentRegistry`], an [`application::approval::ApprovalHandler`],
//! parse a workflow with [`infra::parser::WorkflowParser`], and drive it with
//! [`application::interpreter::Interpreter::run`]. See `tests/` for worked
//! scenarios covering retry recovery, catch redirection, Map/Parallel
//! ordering, and approval pause/resume.

pub mod domain;
pub mod application;
pub mod infra;

pub mod testing;

pub use domain::agent::{Agent, AgentError, AgentOutput, AgentRegistry, AgentUsage};
pub use domain::context::{ExecutionContext, RunOptions};
pub use domain::error::{codes, EngineError, StateError};
pub use domain::events::{PendingInput, TraceRecord};
pub use domain::value::{Path, PathError, Value};
pub use domain::workflow::WorkflowDefinition;
pub use application::approval::{ApprovalHandler, ApprovalOutcome};
pub use application::interpreter::{Interpreter, WorkflowResult};
pub use infra::parser::WorkflowParser;
