// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::StoreError;

/// Short random identifier for jobs and approvals: the first 8 hex chars of
/// a v4 UUID, enough to be unambiguous within one deployment while staying
/// readable in chat messages.
pub fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Macro for the string-enum boilerplate shared by every state/status enum:
/// `as_str`, `FromStr` returning [`StoreError::InvalidValue`], and `Display`.
macro_rules! string_enum {
    ($name:ident, $field:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(StoreError::InvalidValue {
                        field: $field,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// ── Enums ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Running,
    Blocked,
    Closing,
}

string_enum!(SessionState, "session state", {
    Idle => "idle",
    Running => "running",
    Blocked => "blocked",
    Closing => "closing",
});

/// Where a session's jobs execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Isolated git worktree sharing object storage with the main checkout.
    #[default]
    Worktree,
    /// Directly inside the project folder; changes affect the main checkout.
    Direct,
}

string_enum!(ExecutionMode, "execution mode", {
    Worktree => "worktree",
    Direct => "direct",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Blocked,
    NeedsReview,
    Done,
}

string_enum!(TaskStatus, "task status", {
    Todo => "todo",
    InProgress => "in_progress",
    Blocked => "blocked",
    NeedsReview => "needs_review",
    Done => "done",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

string_enum!(TaskPriority, "task priority", {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

impl TaskPriority {
    /// Sort rank: critical first.
    pub fn rank(&self) -> u8 {
        match self {
            TaskPriority::Critical => 1,
            TaskPriority::High => 2,
            TaskPriority::Medium => 3,
            TaskPriority::Low => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    WaitingApproval,
    Done,
    Failed,
    Canceled,
}

string_enum!(JobStatus, "job status", {
    Queued => "queued",
    Running => "running",
    WaitingApproval => "waiting_approval",
    Done => "done",
    Failed => "failed",
    Canceled => "canceled",
});

impl JobStatus {
    /// Terminal statuses never transition again outside the corrective
    /// administrative path.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Canceled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    #[default]
    Pending,
    Approved,
    Denied,
}

string_enum!(ApprovalState, "approval state", {
    Pending => "pending",
    Approved => "approved",
    Denied => "denied",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    ShellCommand,
    FileWrite,
    GitPush,
    Deploy,
    DangerousEdit,
    ExternalRequest,
}

string_enum!(ApprovalType, "approval type", {
    ShellCommand => "shell_command",
    FileWrite => "file_write",
    GitPush => "git_push",
    Deploy => "deploy",
    DangerousEdit => "dangerous_edit",
    ExternalRequest => "external_request",
});

impl ApprovalType {
    pub const ALL: [ApprovalType; 6] = [
        ApprovalType::ShellCommand,
        ApprovalType::FileWrite,
        ApprovalType::GitPush,
        ApprovalType::Deploy,
        ApprovalType::DangerousEdit,
        ApprovalType::ExternalRequest,
    ];
}

// ── Entities ──────────────────────────────────────────────────────────────────

/// A git repository managed by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Stable lowercase slug, unique across the store.
    pub project_id: String,
    pub name: String,
    /// Absolute path to the repository.
    pub path: String,
    pub remote_url: Option<String>,
    pub default_branch: String,
    pub backlog_enabled: bool,
    pub backlog_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(project_id: impl Into<String>, name: impl Into<String>, path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            project_id: project_id.into(),
            name: name.into(),
            path: path.into(),
            remote_url: None,
            default_branch: "main".to_string(),
            backlog_enabled: false,
            backlog_path: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// An isolated assistant workspace on a specific branch of one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// `S<n>`, monotonically assigned.
    pub session_id: String,
    pub project_id: String,
    pub display_name: Option<String>,
    /// Unique across the store.
    pub workspace_path: String,
    pub branch: String,
    pub state: SessionState,
    pub execution_mode: ExecutionMode,
    pub attached_task_ids: Vec<String>,
    pub current_job_id: Option<String>,
    pub last_summary: Option<String>,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        session_id: impl Into<String>,
        project_id: impl Into<String>,
        workspace_path: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            project_id: project_id.into(),
            display_name: None,
            workspace_path: workspace_path.into(),
            branch: branch.into(),
            state: SessionState::Idle,
            execution_mode: ExecutionMode::Worktree,
            attached_task_ids: Vec::new(),
            current_job_id: None,
            last_summary: None,
            last_activity_at: now,
            created_at: now,
        }
    }
}

/// A backlog item imported from a markdown-task directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub project_id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub epic: Option<String>,
    pub priority: TaskPriority,
    pub session_id: Option<String>,
    pub branch: Option<String>,
    pub assignee: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        task_id: impl Into<String>,
        project_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            project_id: project_id.into(),
            title: title.into(),
            description: None,
            status: TaskStatus::Todo,
            epic: None,
            priority: TaskPriority::Medium,
            session_id: None,
            branch: None,
            assignee: None,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// One instruction executed in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub session_id: String,
    pub project_id: String,
    /// Context-enriched text actually sent to the assistant.
    pub instruction: String,
    /// Original user text, preserved verbatim.
    pub raw_input: String,
    pub status: JobStatus,
    pub approval_required: bool,
    pub approval_scope: Option<String>,
    pub approval_state: Option<ApprovalState>,
    pub log_path: Option<String>,
    pub result_summary: Option<String>,
    pub files_changed: Option<Vec<String>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        job_id: impl Into<String>,
        session_id: impl Into<String>,
        project_id: impl Into<String>,
        instruction: impl Into<String>,
        raw_input: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            session_id: session_id.into(),
            project_id: project_id.into(),
            instruction: instruction.into(),
            raw_input: raw_input.into(),
            status: JobStatus::Queued,
            approval_required: false,
            approval_scope: None,
            approval_state: None,
            log_path: None,
            result_summary: None,
            files_changed: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// A deliberate pause in a job awaiting explicit user consent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub approval_id: String,
    pub job_id: String,
    pub session_id: String,
    pub project_id: String,
    pub approval_type: ApprovalType,
    pub action_description: String,
    pub action_details: Option<serde_json::Value>,
    pub state: ApprovalState,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Chat locator so the prompt can be edited in place on resolution.
    pub chat_id: Option<i64>,
    pub message_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Approval {
    pub fn new(
        job: &Job,
        approval_type: ApprovalType,
        action_description: impl Into<String>,
    ) -> Self {
        Self {
            approval_id: short_id(),
            job_id: job.job_id.clone(),
            session_id: job.session_id.clone(),
            project_id: job.project_id.clone(),
            approval_type,
            action_description: action_description.into(),
            action_details: None,
            state: ApprovalState::Pending,
            resolved_by: None,
            resolved_at: None,
            chat_id: None,
            message_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Per-user preferences, keyed by chat id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserPreferences {
    pub chat_id: i64,
    pub ai_model_id: Option<String>,
    pub ai_provider: Option<String>,
    pub active_session_id: Option<String>,
    pub notifications_enabled: bool,
    pub tracker_preset: String,
    /// Per-key overrides applied on top of the preset.
    pub tracker_config: serde_json::Map<String, serde_json::Value>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
