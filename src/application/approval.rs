// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::value::Value;

/// The outcome an [`ApprovalHandler`] returns for an Approval state: a
/// decision mapping that becomes the state's result, or a request to
/// suspend the run until external input arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ApprovalOutcome {
    Decided(Value),
    Pause,
}

/// The human-in-the-loop boundary an Approval state calls through. This
/// crate ships no concrete implementation beyond the in-memory test
/// double; wiring to a real notification/approval channel is an
/// embedding application's concern.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn request_approval(&self, request: Value) -> ApprovalOutcome;
}
