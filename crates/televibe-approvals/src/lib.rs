// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! Approval gate.
//!
//! When the assistant requests a privileged action, the runner suspends the
//! job and the gate records a pending approval.  The user's reply resolves
//! the record and wires the decision back into the waiting job task through
//! the runner's [`ApprovalBridge`].  Pending approvals persist in the store,
//! so they survive restarts; only the in-process wakeup is lost.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::info;

use televibe_runner::{ApprovalBridge, ApprovalDecision};
use televibe_store::{
    Approval, ApprovalState, ApprovalType, JobStatus, SessionState, Store, StoreError,
};

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("approval is already {state}, cannot {action}")]
    NotPending {
        state: ApprovalState,
        action: &'static str,
    },

    #[error("job '{job_id}' already has a pending approval")]
    AlreadyOpen { job_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct ApprovalGate {
    store: Arc<Store>,
    bridge: Arc<ApprovalBridge>,
}

impl ApprovalGate {
    pub fn new(store: Arc<Store>, bridge: Arc<ApprovalBridge>) -> Self {
        Self { store, bridge }
    }

    /// Create a pending approval for a job and flip job/session into their
    /// suspended states.  A job may hold at most one pending approval;
    /// reopening requires the previous one to be resolved first.
    pub async fn open(
        &self,
        job_id: &str,
        approval_type: ApprovalType,
        description: &str,
        details: Option<serde_json::Value>,
    ) -> Result<Approval, ApprovalError> {
        let mut job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| ApprovalError::NotFound {
                entity: "job",
                id: job_id.to_string(),
            })?;

        if self.store.pending_approval_for_job(job_id).await?.is_some() {
            return Err(ApprovalError::AlreadyOpen {
                job_id: job_id.to_string(),
            });
        }

        let mut approval = Approval::new(&job, approval_type, description);
        approval.action_details = details;
        self.store.create_approval(&approval).await?;

        job.status = JobStatus::WaitingApproval;
        job.approval_required = true;
        job.approval_scope = Some(approval_type.as_str().to_string());
        self.store.update_job(&job).await?;

        self.store
            .update_session_state(&job.session_id, SessionState::Blocked)
            .await?;

        info!(
            approval_id = %approval.approval_id,
            job_id,
            approval_type = %approval_type,
            "approval opened"
        );
        Ok(approval)
    }

    /// Approve a pending approval.  The record and the job's approval
    /// snapshot flip to approved; the job stays in waiting-approval until
    /// the runner's interlock resumes the child.
    pub async fn approve(&self, approval_id: &str, by: &str) -> Result<Approval, ApprovalError> {
        let mut approval = self.get_pending(approval_id, "approve").await?;

        approval.state = ApprovalState::Approved;
        approval.resolved_by = Some(by.to_string());
        approval.resolved_at = Some(Utc::now());
        self.store.update_approval(&approval).await?;

        if let Some(mut job) = self.store.get_job(&approval.job_id).await? {
            job.approval_state = Some(ApprovalState::Approved);
            self.store.update_job(&job).await?;
        }

        self.bridge
            .resolve(&approval.job_id, ApprovalDecision::Allow { by: by.to_string() })
            .await;

        info!(approval_id, by, "approval granted");
        Ok(approval)
    }

    /// Deny a pending approval: the job is terminalized as canceled with the
    /// denial error and the session returns to idle.
    pub async fn deny(
        &self,
        approval_id: &str,
        by: &str,
        reason: Option<&str>,
    ) -> Result<Approval, ApprovalError> {
        let mut approval = self.get_pending(approval_id, "deny").await?;

        approval.state = ApprovalState::Denied;
        approval.resolved_by = Some(by.to_string());
        approval.resolved_at = Some(Utc::now());
        self.store.update_approval(&approval).await?;

        let decision = ApprovalDecision::Deny {
            by: by.to_string(),
            reason: reason.map(str::to_string),
        };
        let denial_error = decision.denial_error().unwrap_or_default();

        if let Some(mut job) = self.store.get_job(&approval.job_id).await? {
            job.status = JobStatus::Canceled;
            job.approval_state = Some(ApprovalState::Denied);
            job.error = Some(denial_error.clone());
            job.finished_at = Some(Utc::now());
            self.store.update_job(&job).await?;
        }

        if let Some(mut session) = self.store.get_session(&approval.session_id).await? {
            session.state = SessionState::Idle;
            session.current_job_id = None;
            self.store.update_session(&mut session).await?;
        }

        self.bridge.resolve(&approval.job_id, decision).await;

        info!(approval_id, by, "approval denied");
        Ok(approval)
    }

    /// Pending approvals, globally or for one session.
    pub async fn pending(&self, session_id: Option<&str>) -> Result<Vec<Approval>, ApprovalError> {
        let approvals = match session_id {
            Some(sid) => self
                .store
                .approvals_by_session(sid)
                .await?
                .into_iter()
                .filter(|a| a.state == ApprovalState::Pending)
                .collect(),
            None => self.store.pending_approvals().await?,
        };
        Ok(approvals)
    }

    /// Record the chat locator of the prompt message so it can be edited in
    /// place on resolution.
    pub async fn set_chat_message(
        &self,
        approval_id: &str,
        chat_id: i64,
        message_id: i64,
    ) -> Result<(), ApprovalError> {
        let mut approval =
            self.store
                .get_approval(approval_id)
                .await?
                .ok_or_else(|| ApprovalError::NotFound {
                    entity: "approval",
                    id: approval_id.to_string(),
                })?;
        approval.chat_id = Some(chat_id);
        approval.message_id = Some(message_id);
        self.store.update_approval(&approval).await?;
        Ok(())
    }

    async fn get_pending(
        &self,
        approval_id: &str,
        action: &'static str,
    ) -> Result<Approval, ApprovalError> {
        let approval =
            self.store
                .get_approval(approval_id)
                .await?
                .ok_or_else(|| ApprovalError::NotFound {
                    entity: "approval",
                    id: approval_id.to_string(),
                })?;
        if approval.state != ApprovalState::Pending {
            return Err(ApprovalError::NotPending {
                state: approval.state,
                action,
            });
        }
        Ok(approval)
    }
}

/// Classify a privileged-action request by the tool it names.
pub fn classify_tool(tool_name: &str, input: &serde_json::Value) -> ApprovalType {
    match tool_name {
        "Bash" => {
            let command = input.get("command").and_then(|v| v.as_str()).unwrap_or("");
            if command.contains("git push") {
                ApprovalType::GitPush
            } else {
                ApprovalType::ShellCommand
            }
        }
        "Write" | "Edit" | "MultiEdit" => ApprovalType::FileWrite,
        "WebFetch" | "WebSearch" => ApprovalType::ExternalRequest,
        _ => ApprovalType::DangerousEdit,
    }
}

/// Format an approval request for chat display.
pub fn format_approval_message(approval: &Approval) -> String {
    let icon = match approval.approval_type {
        ApprovalType::ShellCommand => "🖥️",
        ApprovalType::FileWrite => "📝",
        ApprovalType::GitPush => "⬆️",
        ApprovalType::Deploy => "🚀",
        ApprovalType::DangerousEdit => "⚠️",
        ApprovalType::ExternalRequest => "🌐",
    };
    let type_name = approval
        .approval_type
        .as_str()
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    let mut text = format!(
        "*⚠️ Approval Required*\n\n{icon} *Type*: {type_name}\n📂 Session: `{}`\n🔹 Job: `{}`\n\n*Action*:\n_{}_\n\n",
        approval.session_id, approval.job_id, approval.action_description
    );

    if let Some(details) = &approval.action_details {
        if let Some(command) = details.get("command").and_then(|v| v.as_str()) {
            text.push_str(&format!("*Command*:\n`{command}`\n\n"));
        }
        if let Some(file_path) = details.get("file_path").and_then(|v| v.as_str()) {
            text.push_str(&format!("*File*: `{file_path}`\n\n"));
        }
    }

    text
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
