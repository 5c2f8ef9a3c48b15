// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::StateError;
use crate::domain::value::Value;

/// The `pendingInput` descriptor carried by a paused [`crate::application::interpreter::WorkflowResult`],
/// describing what external input is needed to resume (§6, §4.4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInput {
    #[serde(rename = "type")]
    pub kind: String,
    pub prompt: Value,
    pub options: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub editable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

/// One entry in a run's append-only trace, recorded at every interpreter
/// phase transition: entering/exiting a state, a retry attempt, a catch
/// match, checkpoint creation, and terminal outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TraceRecord {
    WorkflowStart {
        timestamp: DateTime<Utc>,
        start_state: String,
    },
    StateEnter {
        timestamp: DateTime<Utc>,
        state: String,
        input: Value,
    },
    StateExit {
        timestamp: DateTime<Utc>,
        state: String,
        output: Value,
    },
    Retry {
        timestamp: DateTime<Utc>,
        state: String,
        attempt: u32,
        error: StateError,
        delay_seconds: f64,
    },
    Catch {
        timestamp: DateTime<Utc>,
        state: String,
        error: StateError,
        next: String,
    },
    CheckpointCreated {
        timestamp: DateTime<Utc>,
        state: String,
    },
    WorkflowPaused {
        timestamp: DateTime<Utc>,
        state: String,
    },
    WorkflowComplete {
        timestamp: DateTime<Utc>,
        output: Value,
    },
    WorkflowError {
        timestamp: DateTime<Utc>,
        state: String,
        error: StateError,
    },
}

impl TraceRecord {
    pub fn state_name(&self) -> Option<&str> {
        match self {
            TraceRecord::WorkflowStart { .. } => None,
            TraceRecord::StateEnter { state, .. }
            | TraceRecord::StateExit { state, .. }
            | TraceRecord::Retry { state, .. }
            | TraceRecord::Catch { state, .. }
            | TraceRecord::CheckpointCreated { state, .. }
            | TraceRecord::WorkflowPaused { state, .. }
            | TraceRecord::WorkflowError { state, .. } => Some(state),
            TraceRecord::WorkflowComplete { .. } => None,
        }
    }
}
