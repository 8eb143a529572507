// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;

use televibe_protocol::{ControlRequest, SessionEvent};
use televibe_store::Job;

use crate::progress::JobProgress;

/// Downstream consumer of runner output.  The tracker implements this to
/// mirror the event stream into the chat; the orchestrator implements
/// `on_approval_needed` to open the approval gate.
///
/// Methods are awaited inline by the event pump, so within one job events
/// reach the sink in stream order.
#[async_trait]
pub trait JobSink: Send + Sync {
    async fn on_event(&self, _job_id: &str, _event: &SessionEvent) {}

    /// Throttled progress update (at most once per throttle interval).
    async fn on_progress(&self, _job_id: &str, _progress: &JobProgress) {}

    /// The assistant requested a privileged action; the job is now in
    /// waiting-approval and the runner blocks until the approval bridge
    /// resolves.
    async fn on_approval_needed(&self, _job_id: &str, _request: &ControlRequest) {}

    /// The job reached a terminal status and the session was released.
    async fn on_complete(&self, _job: &Job) {}
}

/// Sink that discards everything.
pub struct NullSink;

#[async_trait]
impl JobSink for NullSink {}
