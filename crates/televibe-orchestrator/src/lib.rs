// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! Service wiring: runner → tracker → approval gate.
//!
//! The chat front-end is a collaborator that drives these services through
//! their public interfaces; this crate only composes them and routes the
//! runner's callbacks to the right consumer.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use televibe_approvals::{classify_tool, format_approval_message, ApprovalGate};
use televibe_config::Config;
use televibe_protocol::{ControlRequest, EventKind, SessionEvent};
use televibe_runner::{ApprovalBridge, JobExecutor, JobProgress, JobSink};
use televibe_session::SessionManager;
use televibe_store::{Job, Store};
use televibe_tracker::{
    Button, ChatApi, Keyboard, TrackerConfig, TrackerManager, TrackerSink, TrackerStatus,
};

/// All core services, constructed once at startup and shared with the chat
/// collaborator.
pub struct Orchestrator {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub sessions: Arc<SessionManager>,
    pub executor: JobExecutor,
    pub tracker: Arc<TrackerManager>,
    pub gate: Arc<ApprovalGate>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        chat: Arc<dyn ChatApi>,
        default_tracker: TrackerConfig,
    ) -> Self {
        let bridge = Arc::new(ApprovalBridge::new());
        let tracker = Arc::new(TrackerManager::new(chat.clone(), default_tracker));
        let gate = Arc::new(ApprovalGate::new(store.clone(), bridge.clone()));
        let sink = Arc::new(OrchestratorSink {
            inner: TrackerSink::new(tracker.clone()),
            tracker: tracker.clone(),
            gate: gate.clone(),
            chat,
        });
        let executor = JobExecutor::new(config.clone(), store.clone(), sink, bridge);
        let sessions = Arc::new(SessionManager::new(config.clone(), store.clone()));

        Self {
            config,
            store,
            sessions,
            executor,
            tracker,
            gate,
        }
    }

    /// Submit an instruction for a chat's session and open its tracker
    /// message.
    pub async fn run_instruction(
        &self,
        chat_id: i64,
        session_id: &str,
        text: &str,
    ) -> anyhow::Result<Job> {
        let job = self.executor.submit(session_id, text).await?;

        let project_name = self
            .store
            .get_project(&job.project_id)
            .await?
            .map(|p| p.name)
            .unwrap_or_else(|| job.project_id.clone());

        if let Err(e) = self
            .tracker
            .create_tracker(chat_id, &job.job_id, session_id, &project_name, text)
            .await
        {
            warn!(job_id = %job.job_id, error = %e, "tracker message failed");
        }
        Ok(job)
    }

    /// Resolve a chat's stored tracker preset + overrides and install the
    /// result on the tracker manager.  Called by the chat collaborator after
    /// any preset or toggle change.
    pub async fn refresh_tracker_config(&self, chat_id: i64) -> anyhow::Result<()> {
        let (preset_name, overrides) = self.store.get_tracker_config(chat_id).await?;
        let config = televibe_tracker::preset(&preset_name).with_overrides(&overrides);
        self.tracker.set_chat_config(chat_id, config).await;
        Ok(())
    }

    /// Close a session.  Force-closing first cancels the current job.
    pub async fn close_session(&self, session_id: &str, force: bool) -> anyhow::Result<()> {
        if force {
            if let Some(session) = self.store.get_session(session_id).await? {
                if let Some(job_id) = session.current_job_id {
                    if let Err(e) = self.executor.cancel(&job_id).await {
                        warn!(session_id, job_id, error = %e, "cancel before close failed");
                    }
                }
            }
        }
        self.sessions.close_session(session_id, force).await?;
        Ok(())
    }
}

/// Routes runner callbacks: events, progress, and completion delegate to
/// the tracker sink; approval requests open the gate and post the prompt.
struct OrchestratorSink {
    inner: TrackerSink,
    tracker: Arc<TrackerManager>,
    gate: Arc<ApprovalGate>,
    chat: Arc<dyn ChatApi>,
}

#[async_trait]
impl JobSink for OrchestratorSink {
    async fn on_event(&self, job_id: &str, event: &SessionEvent) {
        self.inner.on_event(job_id, event).await;
    }

    async fn on_progress(&self, job_id: &str, progress: &JobProgress) {
        self.inner.on_progress(job_id, progress).await;
    }

    async fn on_approval_needed(&self, job_id: &str, request: &ControlRequest) {
        let approval_type = classify_tool(&request.tool_name, &request.input);
        let description = request
            .description
            .clone()
            .unwrap_or_else(|| format!("{} requested by the assistant", request.tool_name));

        let approval = match self
            .gate
            .open(
                job_id,
                approval_type,
                &description,
                Some(request.input.clone()),
            )
            .await
        {
            Ok(approval) => approval,
            Err(e) => {
                warn!(job_id, error = %e, "failed to open approval");
                return;
            }
        };

        self.tracker
            .set_status(job_id, TrackerStatus::WaitingApproval)
            .await;
        self.tracker
            .add_event(
                job_id,
                &SessionEvent::new(
                    EventKind::ApprovalPending {
                        tool_name: request.tool_name.clone(),
                        approval_id: Some(approval.approval_id.clone()),
                    },
                    None,
                    Some(job_id.to_string()),
                ),
            )
            .await;

        // Post the approval prompt and remember its locator so the reply
        // handler can edit it in place.
        if let Some(state) = self.tracker.tracker(job_id).await {
            let text = format_approval_message(&approval);
            let keyboard = Keyboard::single_row(vec![
                Button::new(
                    "✅ Approve",
                    format!("approval:approve:{}", approval.approval_id),
                ),
                Button::new(
                    "❌ Deny",
                    format!("approval:deny:{}", approval.approval_id),
                ),
            ]);
            match self
                .chat
                .send_message(state.chat_id, &text, Some(&keyboard))
                .await
            {
                Ok(message_id) => {
                    if let Err(e) = self
                        .gate
                        .set_chat_message(&approval.approval_id, state.chat_id, message_id)
                        .await
                    {
                        warn!(job_id, error = %e, "failed to store approval locator");
                    }
                }
                Err(e) => warn!(job_id, error = %e, "approval prompt failed"),
            }
        }
    }

    async fn on_complete(&self, job: &Job) {
        self.inner.on_complete(job).await;
    }
}
