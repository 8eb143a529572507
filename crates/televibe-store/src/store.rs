// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::{
    Approval, Job, JobStatus, Project, Session, SessionState, Task, UserPreferences,
};

const SCHEMA: &str = r#"
-- Projects table
CREATE TABLE IF NOT EXISTS projects (
    project_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    path TEXT NOT NULL UNIQUE,
    remote_url TEXT,
    default_branch TEXT DEFAULT 'main',
    backlog_enabled INTEGER DEFAULT 0,
    backlog_path TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Sessions table
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(project_id),
    display_name TEXT,
    workspace_path TEXT NOT NULL UNIQUE,
    branch TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'idle',
    execution_mode TEXT NOT NULL DEFAULT 'worktree',
    attached_task_ids TEXT DEFAULT '[]',
    current_job_id TEXT,
    last_summary TEXT,
    last_activity_at TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Tasks table
CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(project_id),
    title TEXT NOT NULL,
    description TEXT,
    status TEXT NOT NULL DEFAULT 'todo',
    epic TEXT,
    priority TEXT DEFAULT 'medium',
    session_id TEXT REFERENCES sessions(session_id) ON DELETE SET NULL,
    branch TEXT,
    assignee TEXT,
    tags TEXT DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Jobs table
CREATE TABLE IF NOT EXISTS jobs (
    job_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
    project_id TEXT NOT NULL REFERENCES projects(project_id),
    instruction TEXT NOT NULL,
    raw_input TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',
    approval_required INTEGER DEFAULT 0,
    approval_scope TEXT,
    approval_state TEXT,
    log_path TEXT,
    result_summary TEXT,
    files_changed TEXT,
    error TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT
);

-- Approvals table
CREATE TABLE IF NOT EXISTS approvals (
    approval_id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL REFERENCES jobs(job_id) ON DELETE CASCADE,
    session_id TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
    project_id TEXT NOT NULL REFERENCES projects(project_id),
    approval_type TEXT NOT NULL,
    action_description TEXT NOT NULL,
    action_details TEXT,
    state TEXT NOT NULL DEFAULT 'pending',
    resolved_by TEXT,
    resolved_at TEXT,
    chat_id INTEGER,
    message_id INTEGER,
    created_at TEXT NOT NULL
);

-- User preferences table (keyed by chat id)
CREATE TABLE IF NOT EXISTS user_preferences (
    chat_id INTEGER PRIMARY KEY,
    ai_model_id TEXT,
    ai_provider TEXT,
    active_session_id TEXT,
    notifications_enabled INTEGER DEFAULT 1,
    tracker_preset TEXT DEFAULT 'normal',
    tracker_config TEXT DEFAULT '{}',
    updated_at TEXT NOT NULL
);

-- Indexes
CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_id);
CREATE INDEX IF NOT EXISTS idx_sessions_state ON sessions(state);
CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_session ON tasks(session_id);
CREATE INDEX IF NOT EXISTS idx_jobs_session ON jobs(session_id);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_approvals_job ON approvals(job_id);
CREATE INDEX IF NOT EXISTS idx_approvals_state ON approvals(state);
"#;

/// Single-file SQLite store.  All writers serialize through one connection
/// behind an async mutex; every write commits before the call returns.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path`, apply the schema and any
    /// pending additive migrations.
    pub fn connect(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::initialize(conn)
    }

    /// In-memory store for tests.
    pub fn connect_in_memory() -> Result<Self, StoreError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        run_migrations(&conn)?;
        info!("store initialised");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Project CRUD ──────────────────────────────────────────────────────────

    pub async fn create_project(&self, project: &Project) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO projects (project_id, name, path, remote_url, default_branch,
                 backlog_enabled, backlog_path, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                project.project_id,
                project.name,
                project.path,
                project.remote_url,
                project.default_branch,
                project.backlog_enabled as i64,
                project.backlog_path,
                project.created_at.to_rfc3339(),
                project.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Option<Project>, StoreError> {
        let conn = self.conn.lock().await;
        optional(
            conn.query_row(
                "SELECT * FROM projects WHERE project_id = ?1",
                [project_id],
                row_to_project,
            ),
        )
    }

    pub async fn get_project_by_path(&self, path: &str) -> Result<Option<Project>, StoreError> {
        let conn = self.conn.lock().await;
        optional(conn.query_row(
            "SELECT * FROM projects WHERE path = ?1",
            [path],
            row_to_project,
        ))
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        let conn = self.conn.lock().await;
        let result = collect(
            conn.prepare("SELECT * FROM projects ORDER BY name")?
                .query_map([], row_to_project),
        );
        result
    }

    pub async fn update_project(&self, project: &mut Project) -> Result<(), StoreError> {
        project.updated_at = Utc::now();
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE projects SET name = ?1, path = ?2, remote_url = ?3, default_branch = ?4,
                 backlog_enabled = ?5, backlog_path = ?6, updated_at = ?7
             WHERE project_id = ?8",
            params![
                project.name,
                project.path,
                project.remote_url,
                project.default_branch,
                project.backlog_enabled as i64,
                project.backlog_path,
                project.updated_at.to_rfc3339(),
                project.project_id,
            ],
        )?;
        Ok(())
    }

    pub async fn delete_project(&self, project_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let n = conn.execute("DELETE FROM projects WHERE project_id = ?1", [project_id])?;
        Ok(n > 0)
    }

    // ── Session CRUD ──────────────────────────────────────────────────────────

    pub async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sessions (session_id, project_id, display_name, workspace_path, branch,
                 state, execution_mode, attached_task_ids, current_job_id, last_summary,
                 last_activity_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                session.session_id,
                session.project_id,
                session.display_name,
                session.workspace_path,
                session.branch,
                session.state.as_str(),
                session.execution_mode.as_str(),
                serde_json::to_string(&session.attached_task_ids).map_err(|e| json_err("attached_task_ids", e))?,
                session.current_job_id,
                session.last_summary,
                session.last_activity_at.to_rfc3339(),
                session.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let conn = self.conn.lock().await;
        optional(conn.query_row(
            "SELECT * FROM sessions WHERE session_id = ?1",
            [session_id],
            row_to_session,
        ))
    }

    pub async fn list_sessions_by_project(
        &self,
        project_id: &str,
    ) -> Result<Vec<Session>, StoreError> {
        let conn = self.conn.lock().await;
        let result = collect(
            conn.prepare(
                "SELECT * FROM sessions WHERE project_id = ?1 ORDER BY created_at DESC",
            )?
            .query_map([project_id], row_to_session),
        );
        result
    }

    pub async fn list_all_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let conn = self.conn.lock().await;
        let result = collect(
            conn.prepare("SELECT * FROM sessions ORDER BY last_activity_at DESC")?
                .query_map([], row_to_session),
        );
        result
    }

    /// Sessions that are not closing, most recently active first.
    pub async fn list_active_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let conn = self.conn.lock().await;
        let result = collect(
            conn.prepare(
                "SELECT * FROM sessions WHERE state != 'closing' ORDER BY last_activity_at DESC",
            )?
            .query_map([], row_to_session),
        );
        result
    }

    /// Full-row update; also bumps `last_activity_at`.
    pub async fn update_session(&self, session: &mut Session) -> Result<(), StoreError> {
        session.last_activity_at = Utc::now();
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sessions SET display_name = ?1, workspace_path = ?2, branch = ?3,
                 state = ?4, execution_mode = ?5, attached_task_ids = ?6, current_job_id = ?7,
                 last_summary = ?8, last_activity_at = ?9
             WHERE session_id = ?10",
            params![
                session.display_name,
                session.workspace_path,
                session.branch,
                session.state.as_str(),
                session.execution_mode.as_str(),
                serde_json::to_string(&session.attached_task_ids).map_err(|e| json_err("attached_task_ids", e))?,
                session.current_job_id,
                session.last_summary,
                session.last_activity_at.to_rfc3339(),
                session.session_id,
            ],
        )?;
        Ok(())
    }

    pub async fn update_session_state(
        &self,
        session_id: &str,
        state: SessionState,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE sessions SET state = ?1, last_activity_at = ?2 WHERE session_id = ?3",
            params![state.as_str(), Utc::now().to_rfc3339(), session_id],
        )?;
        Ok(n > 0)
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let n = conn.execute("DELETE FROM sessions WHERE session_id = ?1", [session_id])?;
        Ok(n > 0)
    }

    /// `max(n over existing S<n>) + 1`, or 1 when no session exists.
    pub async fn next_session_number(&self) -> Result<u32, StoreError> {
        let conn = self.conn.lock().await;
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(CAST(SUBSTR(session_id, 2) AS INTEGER)) FROM sessions",
            [],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0) as u32 + 1)
    }

    // ── Task CRUD ─────────────────────────────────────────────────────────────

    pub async fn create_task(&self, task: &Task) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tasks (task_id, project_id, title, description, status, epic,
                 priority, session_id, branch, assignee, tags, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                task.task_id,
                task.project_id,
                task.title,
                task.description,
                task.status.as_str(),
                task.epic,
                task.priority.as_str(),
                task.session_id,
                task.branch,
                task.assignee,
                serde_json::to_string(&task.tags).map_err(|e| json_err("tags", e))?,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let conn = self.conn.lock().await;
        optional(conn.query_row(
            "SELECT * FROM tasks WHERE task_id = ?1",
            [task_id],
            row_to_task,
        ))
    }

    pub async fn list_tasks_by_project(&self, project_id: &str) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn.lock().await;
        let result = collect(
            conn.prepare(
                "SELECT * FROM tasks WHERE project_id = ?1
                 ORDER BY
                     CASE priority
                         WHEN 'critical' THEN 1
                         WHEN 'high' THEN 2
                         WHEN 'medium' THEN 3
                         WHEN 'low' THEN 4
                     END,
                     created_at",
            )?
            .query_map([project_id], row_to_task),
        );
        result
    }

    /// Pending tasks (todo / in_progress) ordered critical-first then oldest.
    pub async fn pending_tasks(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn.lock().await;
        let result = collect(
            conn.prepare(
                "SELECT * FROM tasks
                 WHERE project_id = ?1 AND status IN ('todo', 'in_progress')
                 ORDER BY
                     CASE priority
                         WHEN 'critical' THEN 1
                         WHEN 'high' THEN 2
                         WHEN 'medium' THEN 3
                         WHEN 'low' THEN 4
                     END,
                     created_at
                 LIMIT ?2",
            )?
            .query_map(params![project_id, limit as i64], row_to_task),
        );
        result
    }

    pub async fn update_task(&self, task: &mut Task) -> Result<(), StoreError> {
        task.updated_at = Utc::now();
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET title = ?1, description = ?2, status = ?3, epic = ?4,
                 priority = ?5, session_id = ?6, branch = ?7, assignee = ?8, tags = ?9,
                 updated_at = ?10
             WHERE task_id = ?11",
            params![
                task.title,
                task.description,
                task.status.as_str(),
                task.epic,
                task.priority.as_str(),
                task.session_id,
                task.branch,
                task.assignee,
                serde_json::to_string(&task.tags).map_err(|e| json_err("tags", e))?,
                task.updated_at.to_rfc3339(),
                task.task_id,
            ],
        )?;
        Ok(())
    }

    pub async fn delete_task(&self, task_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let n = conn.execute("DELETE FROM tasks WHERE task_id = ?1", [task_id])?;
        Ok(n > 0)
    }

    // ── Job CRUD ──────────────────────────────────────────────────────────────

    pub async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO jobs (job_id, session_id, project_id, instruction, raw_input,
                 status, approval_required, approval_scope, approval_state, log_path,
                 result_summary, files_changed, error, created_at, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                job.job_id,
                job.session_id,
                job.project_id,
                job.instruction,
                job.raw_input,
                job.status.as_str(),
                job.approval_required as i64,
                job.approval_scope,
                job.approval_state.map(|s| s.as_str()),
                job.log_path,
                job.result_summary,
                job.files_changed
                    .as_ref()
                    .map(|f| serde_json::to_string(f))
                    .transpose()
                    .map_err(|e| json_err("files_changed", e))?,
                job.error,
                job.created_at.to_rfc3339(),
                job.started_at.map(|t| t.to_rfc3339()),
                job.finished_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let conn = self.conn.lock().await;
        optional(conn.query_row(
            "SELECT * FROM jobs WHERE job_id = ?1",
            [job_id],
            row_to_job,
        ))
    }

    pub async fn list_jobs_by_session(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn.lock().await;
        let result = collect(
            conn.prepare(
                "SELECT * FROM jobs WHERE session_id = ?1 ORDER BY created_at DESC LIMIT ?2",
            )?
            .query_map(params![session_id, limit as i64], row_to_job),
        );
        result
    }

    pub async fn running_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn.lock().await;
        let result = collect(
            conn.prepare("SELECT * FROM jobs WHERE status = 'running'")?
                .query_map([], row_to_job),
        );
        result
    }

    pub async fn waiting_approval_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn.lock().await;
        let result = collect(
            conn.prepare("SELECT * FROM jobs WHERE status = 'waiting_approval'")?
                .query_map([], row_to_job),
        );
        result
    }

    pub async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE jobs SET status = ?1, approval_required = ?2, approval_scope = ?3,
                 approval_state = ?4, log_path = ?5, result_summary = ?6, files_changed = ?7,
                 error = ?8, started_at = ?9, finished_at = ?10
             WHERE job_id = ?11",
            params![
                job.status.as_str(),
                job.approval_required as i64,
                job.approval_scope,
                job.approval_state.map(|s| s.as_str()),
                job.log_path,
                job.result_summary,
                job.files_changed
                    .as_ref()
                    .map(|f| serde_json::to_string(f))
                    .transpose()
                    .map_err(|e| json_err("files_changed", e))?,
                job.error,
                job.started_at.map(|t| t.to_rfc3339()),
                job.finished_at.map(|t| t.to_rfc3339()),
                job.job_id,
            ],
        )?;
        Ok(())
    }

    /// Status-only transition; stamps `started_at` on Running and
    /// `finished_at` on any terminal status.
    pub async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let n = match status {
            JobStatus::Running => conn.execute(
                "UPDATE jobs SET status = ?1, started_at = ?2 WHERE job_id = ?3",
                params![status.as_str(), now, job_id],
            )?,
            s if s.is_terminal() => conn.execute(
                "UPDATE jobs SET status = ?1, finished_at = ?2 WHERE job_id = ?3",
                params![status.as_str(), now, job_id],
            )?,
            _ => conn.execute(
                "UPDATE jobs SET status = ?1 WHERE job_id = ?2",
                params![status.as_str(), job_id],
            )?,
        };
        Ok(n > 0)
    }

    // ── Approval CRUD ─────────────────────────────────────────────────────────

    pub async fn create_approval(&self, approval: &Approval) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO approvals (approval_id, job_id, session_id, project_id,
                 approval_type, action_description, action_details, state, resolved_by,
                 resolved_at, chat_id, message_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                approval.approval_id,
                approval.job_id,
                approval.session_id,
                approval.project_id,
                approval.approval_type.as_str(),
                approval.action_description,
                approval
                    .action_details
                    .as_ref()
                    .map(|d| serde_json::to_string(d))
                    .transpose()
                    .map_err(|e| json_err("action_details", e))?,
                approval.state.as_str(),
                approval.resolved_by,
                approval.resolved_at.map(|t| t.to_rfc3339()),
                approval.chat_id,
                approval.message_id,
                approval.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_approval(&self, approval_id: &str) -> Result<Option<Approval>, StoreError> {
        let conn = self.conn.lock().await;
        optional(conn.query_row(
            "SELECT * FROM approvals WHERE approval_id = ?1",
            [approval_id],
            row_to_approval,
        ))
    }

    /// The pending approval for a job, if any.
    pub async fn pending_approval_for_job(
        &self,
        job_id: &str,
    ) -> Result<Option<Approval>, StoreError> {
        let conn = self.conn.lock().await;
        optional(conn.query_row(
            "SELECT * FROM approvals WHERE job_id = ?1 AND state = 'pending'",
            [job_id],
            row_to_approval,
        ))
    }

    pub async fn pending_approvals(&self) -> Result<Vec<Approval>, StoreError> {
        let conn = self.conn.lock().await;
        let result = collect(
            conn.prepare(
                "SELECT * FROM approvals WHERE state = 'pending' ORDER BY created_at DESC",
            )?
            .query_map([], row_to_approval),
        );
        result
    }

    pub async fn approvals_by_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<Approval>, StoreError> {
        let conn = self.conn.lock().await;
        let result = collect(
            conn.prepare(
                "SELECT * FROM approvals WHERE session_id = ?1 ORDER BY created_at DESC",
            )?
            .query_map([session_id], row_to_approval),
        );
        result
    }

    pub async fn update_approval(&self, approval: &Approval) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE approvals SET state = ?1, resolved_by = ?2, resolved_at = ?3,
                 chat_id = ?4, message_id = ?5
             WHERE approval_id = ?6",
            params![
                approval.state.as_str(),
                approval.resolved_by,
                approval.resolved_at.map(|t| t.to_rfc3339()),
                approval.chat_id,
                approval.message_id,
                approval.approval_id,
            ],
        )?;
        Ok(())
    }

    // ── User preferences ──────────────────────────────────────────────────────

    pub async fn get_user_preferences(
        &self,
        chat_id: i64,
    ) -> Result<Option<UserPreferences>, StoreError> {
        let conn = self.conn.lock().await;
        optional(conn.query_row(
            "SELECT * FROM user_preferences WHERE chat_id = ?1",
            [chat_id],
            row_to_preferences,
        ))
    }

    pub async fn set_user_ai_model(
        &self,
        chat_id: i64,
        model_id: &str,
        provider: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO user_preferences (chat_id, ai_model_id, ai_provider, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(chat_id) DO UPDATE SET
                 ai_model_id = excluded.ai_model_id,
                 ai_provider = excluded.ai_provider,
                 updated_at = excluded.updated_at",
            params![chat_id, model_id, provider, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub async fn set_user_active_session(
        &self,
        chat_id: i64,
        session_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO user_preferences (chat_id, active_session_id, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(chat_id) DO UPDATE SET
                 active_session_id = excluded.active_session_id,
                 updated_at = excluded.updated_at",
            params![chat_id, session_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub async fn set_user_notifications(
        &self,
        chat_id: i64,
        enabled: bool,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO user_preferences (chat_id, notifications_enabled, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(chat_id) DO UPDATE SET
                 notifications_enabled = excluded.notifications_enabled,
                 updated_at = excluded.updated_at",
            params![chat_id, enabled as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// `(preset_name, per-key overrides)` for a chat; defaults when unset.
    pub async fn get_tracker_config(
        &self,
        chat_id: i64,
    ) -> Result<(String, serde_json::Map<String, serde_json::Value>), StoreError> {
        let conn = self.conn.lock().await;
        let row: Option<(Option<String>, Option<String>)> = optional(conn.query_row(
            "SELECT tracker_preset, tracker_config FROM user_preferences WHERE chat_id = ?1",
            [chat_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ))?;
        let Some((preset, config)) = row else {
            return Ok(("normal".to_string(), serde_json::Map::new()));
        };
        let overrides = config
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default();
        Ok((preset.unwrap_or_else(|| "normal".to_string()), overrides))
    }

    /// Switching preset resets the per-key overrides.
    pub async fn set_tracker_preset(&self, chat_id: i64, preset: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO user_preferences (chat_id, tracker_preset, tracker_config, updated_at)
             VALUES (?1, ?2, '{}', ?3)
             ON CONFLICT(chat_id) DO UPDATE SET
                 tracker_preset = excluded.tracker_preset,
                 tracker_config = '{}',
                 updated_at = excluded.updated_at",
            params![chat_id, preset, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub async fn update_tracker_config(
        &self,
        chat_id: i64,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        let (_, mut overrides) = self.get_tracker_config(chat_id).await?;
        overrides.insert(key.to_string(), value);
        let config_json = serde_json::to_string(&overrides).map_err(|e| json_err("tracker_config", e))?;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO user_preferences (chat_id, tracker_config, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(chat_id) DO UPDATE SET
                 tracker_config = excluded.tracker_config,
                 updated_at = excluded.updated_at",
            params![chat_id, config_json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

// ── Migrations ────────────────────────────────────────────────────────────────

/// Additive, idempotent migrations for databases created by older builds.
/// Each probe checks for a column and adds it with a default when missing.
fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    if !column_exists(conn, "sessions", "execution_mode")? {
        debug!("migrating: sessions.execution_mode");
        conn.execute(
            "ALTER TABLE sessions ADD COLUMN execution_mode TEXT NOT NULL DEFAULT 'worktree'",
            [],
        )?;
    }
    if !column_exists(conn, "user_preferences", "tracker_preset")? {
        debug!("migrating: user_preferences tracker columns");
        conn.execute(
            "ALTER TABLE user_preferences ADD COLUMN tracker_preset TEXT DEFAULT 'normal'",
            [],
        )?;
        conn.execute(
            "ALTER TABLE user_preferences ADD COLUMN tracker_config TEXT DEFAULT '{}'",
            [],
        )?;
    }
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

// ── Row mapping ───────────────────────────────────────────────────────────────

/// Convert a domain parse failure into the rusqlite error shape so row
/// mappers compose with `query_map`.
fn conv<T, E>(result: Result<T, E>) -> rusqlite::Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    result.map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn get_ts(row: &Row, col: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(col)?;
    conv(
        DateTime::parse_from_rfc3339(&raw)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| StoreError::Timestamp {
                column: "timestamp",
                value: format!("{raw}: {e}"),
            }),
    )
}

fn get_opt_ts(row: &Row, col: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(col)?;
    match raw {
        Some(s) => Ok(Some(conv(
            DateTime::parse_from_rfc3339(&s)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| StoreError::Timestamp {
                    column: "timestamp",
                    value: format!("{s}: {e}"),
                }),
        )?)),
        None => Ok(None),
    }
}

fn get_enum<T: FromStr<Err = StoreError>>(row: &Row, col: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(col)?;
    conv(raw.parse())
}

fn get_json_vec(row: &Row, col: &str) -> rusqlite::Result<Vec<String>> {
    let raw: Option<String> = row.get(col)?;
    match raw {
        Some(s) if !s.is_empty() => conv(serde_json::from_str(&s)),
        _ => Ok(Vec::new()),
    }
}

fn row_to_project(row: &Row) -> rusqlite::Result<Project> {
    Ok(Project {
        project_id: row.get("project_id")?,
        name: row.get("name")?,
        path: row.get("path")?,
        remote_url: row.get("remote_url")?,
        default_branch: row.get("default_branch")?,
        backlog_enabled: row.get::<_, i64>("backlog_enabled")? != 0,
        backlog_path: row.get("backlog_path")?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
    })
}

fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
    Ok(Session {
        session_id: row.get("session_id")?,
        project_id: row.get("project_id")?,
        display_name: row.get("display_name")?,
        workspace_path: row.get("workspace_path")?,
        branch: row.get("branch")?,
        state: get_enum(row, "state")?,
        execution_mode: get_enum(row, "execution_mode")?,
        attached_task_ids: get_json_vec(row, "attached_task_ids")?,
        current_job_id: row.get("current_job_id")?,
        last_summary: row.get("last_summary")?,
        last_activity_at: get_ts(row, "last_activity_at")?,
        created_at: get_ts(row, "created_at")?,
    })
}

fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
    Ok(Task {
        task_id: row.get("task_id")?,
        project_id: row.get("project_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        status: get_enum(row, "status")?,
        epic: row.get("epic")?,
        priority: get_enum(row, "priority")?,
        session_id: row.get("session_id")?,
        branch: row.get("branch")?,
        assignee: row.get("assignee")?,
        tags: get_json_vec(row, "tags")?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
    })
}

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    let files_changed: Option<String> = row.get("files_changed")?;
    let approval_state: Option<String> = row.get("approval_state")?;
    Ok(Job {
        job_id: row.get("job_id")?,
        session_id: row.get("session_id")?,
        project_id: row.get("project_id")?,
        instruction: row.get("instruction")?,
        raw_input: row.get("raw_input")?,
        status: get_enum(row, "status")?,
        approval_required: row.get::<_, i64>("approval_required")? != 0,
        approval_scope: row.get("approval_scope")?,
        approval_state: approval_state.map(|s| conv(s.parse())).transpose()?,
        log_path: row.get("log_path")?,
        result_summary: row.get("result_summary")?,
        files_changed: files_changed.map(|s| conv(serde_json::from_str(&s))).transpose()?,
        error: row.get("error")?,
        created_at: get_ts(row, "created_at")?,
        started_at: get_opt_ts(row, "started_at")?,
        finished_at: get_opt_ts(row, "finished_at")?,
    })
}

fn row_to_approval(row: &Row) -> rusqlite::Result<Approval> {
    let details: Option<String> = row.get("action_details")?;
    Ok(Approval {
        approval_id: row.get("approval_id")?,
        job_id: row.get("job_id")?,
        session_id: row.get("session_id")?,
        project_id: row.get("project_id")?,
        approval_type: get_enum(row, "approval_type")?,
        action_description: row.get("action_description")?,
        action_details: details.map(|s| conv(serde_json::from_str(&s))).transpose()?,
        state: get_enum(row, "state")?,
        resolved_by: row.get("resolved_by")?,
        resolved_at: get_opt_ts(row, "resolved_at")?,
        chat_id: row.get("chat_id")?,
        message_id: row.get("message_id")?,
        created_at: get_ts(row, "created_at")?,
    })
}

fn row_to_preferences(row: &Row) -> rusqlite::Result<UserPreferences> {
    let config: Option<String> = row.get("tracker_config")?;
    Ok(UserPreferences {
        chat_id: row.get("chat_id")?,
        ai_model_id: row.get("ai_model_id")?,
        ai_provider: row.get("ai_provider")?,
        active_session_id: row.get("active_session_id")?,
        notifications_enabled: row.get::<_, i64>("notifications_enabled")? != 0,
        tracker_preset: row
            .get::<_, Option<String>>("tracker_preset")?
            .unwrap_or_else(|| "normal".to_string()),
        tracker_config: config
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default(),
    })
}

// ── Query helpers ─────────────────────────────────────────────────────────────

fn optional<T>(result: rusqlite::Result<T>) -> Result<Option<T>, StoreError> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn collect<T>(
    rows: rusqlite::Result<impl Iterator<Item = rusqlite::Result<T>>>,
) -> Result<Vec<T>, StoreError> {
    let mut out = Vec::new();
    for row in rows? {
        out.push(row?);
    }
    Ok(out)
}

fn json_err(column: &'static str, source: serde_json::Error) -> StoreError {
    StoreError::Json { column, source }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{short_id, ApprovalState, ApprovalType, TaskPriority, TaskStatus};

    async fn store_with_project() -> (Store, Project) {
        let store = Store::connect_in_memory().unwrap();
        let project = Project::new("demo", "Demo", "/repos/demo");
        store.create_project(&project).await.unwrap();
        (store, project)
    }

    async fn insert_session(store: &Store, n: u32) -> Session {
        let id = format!("S{n}");
        let session = Session::new(&id, "demo", format!("/ws/{id}"), format!("televibe/{id}"));
        store.create_session(&session).await.unwrap();
        session
    }

    // ── Projects ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn project_round_trip() {
        let (store, project) = store_with_project().await;
        let loaded = store.get_project("demo").await.unwrap().unwrap();
        assert_eq!(loaded.name, project.name);
        assert_eq!(loaded.path, project.path);
        assert_eq!(loaded.default_branch, "main");
    }

    #[tokio::test]
    async fn duplicate_project_path_is_rejected() {
        let (store, _) = store_with_project().await;
        let dup = Project::new("other", "Other", "/repos/demo");
        assert!(store.create_project(&dup).await.is_err());
    }

    #[tokio::test]
    async fn get_project_by_path_finds_registered_repo() {
        let (store, _) = store_with_project().await;
        let found = store.get_project_by_path("/repos/demo").await.unwrap();
        assert_eq!(found.unwrap().project_id, "demo");
        assert!(store.get_project_by_path("/elsewhere").await.unwrap().is_none());
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn session_requires_existing_project() {
        let store = Store::connect_in_memory().unwrap();
        let session = Session::new("S1", "ghost", "/ws/S1", "b");
        assert!(store.create_session(&session).await.is_err());
    }

    #[tokio::test]
    async fn next_session_number_is_max_plus_one() {
        let (store, _) = store_with_project().await;
        assert_eq!(store.next_session_number().await.unwrap(), 1);
        insert_session(&store, 1).await;
        insert_session(&store, 7).await;
        assert_eq!(store.next_session_number().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn active_sessions_exclude_closing() {
        let (store, _) = store_with_project().await;
        insert_session(&store, 1).await;
        insert_session(&store, 2).await;
        store
            .update_session_state("S1", SessionState::Closing)
            .await
            .unwrap();

        let active = store.list_active_sessions().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, "S2");
    }

    #[tokio::test]
    async fn attached_task_ids_round_trip_as_json() {
        let (store, _) = store_with_project().await;
        let mut session = insert_session(&store, 1).await;
        session.attached_task_ids = vec!["T-1".into(), "T-2".into()];
        store.update_session(&mut session).await.unwrap();

        let loaded = store.get_session("S1").await.unwrap().unwrap();
        assert_eq!(loaded.attached_task_ids, vec!["T-1", "T-2"]);
    }

    // ── Tasks ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn pending_tasks_order_by_priority_then_age() {
        let (store, _) = store_with_project().await;

        let mut low = Task::new("T-1", "demo", "low");
        low.priority = TaskPriority::Low;
        let mut critical = Task::new("T-2", "demo", "critical");
        critical.priority = TaskPriority::Critical;
        let mut done = Task::new("T-3", "demo", "done");
        done.status = TaskStatus::Done;
        let mut high = Task::new("T-4", "demo", "high");
        high.priority = TaskPriority::High;

        for t in [&low, &critical, &done, &high] {
            store.create_task(t).await.unwrap();
        }

        let pending = store.pending_tasks("demo", 10).await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["T-2", "T-4", "T-1"]);
    }

    #[tokio::test]
    async fn pending_tasks_respects_limit() {
        let (store, _) = store_with_project().await;
        for i in 0..5 {
            store
                .create_task(&Task::new(format!("T-{i}"), "demo", format!("task {i}")))
                .await
                .unwrap();
        }
        assert_eq!(store.pending_tasks("demo", 2).await.unwrap().len(), 2);
    }

    // ── Jobs ──────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn job_status_transitions_stamp_timestamps() {
        let (store, _) = store_with_project().await;
        insert_session(&store, 1).await;

        let job = Job::new(short_id(), "S1", "demo", "do", "do");
        store.create_job(&job).await.unwrap();

        store
            .update_job_status(&job.job_id, JobStatus::Running)
            .await
            .unwrap();
        let running = store.get_job(&job.job_id).await.unwrap().unwrap();
        assert!(running.started_at.is_some());
        assert!(running.finished_at.is_none());

        store
            .update_job_status(&job.job_id, JobStatus::Done)
            .await
            .unwrap();
        let done = store.get_job(&job.job_id).await.unwrap().unwrap();
        assert!(done.finished_at.is_some());
        assert!(done.started_at.unwrap() <= done.finished_at.unwrap());
    }

    #[tokio::test]
    async fn running_jobs_query_spans_sessions() {
        let (store, _) = store_with_project().await;
        insert_session(&store, 1).await;
        insert_session(&store, 2).await;

        for (i, sid) in ["S1", "S2"].iter().enumerate() {
            let job = Job::new(format!("job{i}"), *sid, "demo", "x", "x");
            store.create_job(&job).await.unwrap();
            store
                .update_job_status(&job.job_id, JobStatus::Running)
                .await
                .unwrap();
        }

        assert_eq!(store.running_jobs().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn jobs_by_session_honours_limit_and_order() {
        let (store, _) = store_with_project().await;
        insert_session(&store, 1).await;
        for i in 0..4 {
            let mut job = Job::new(format!("job{i}"), "S1", "demo", "x", "x");
            // Spread created_at so ordering is deterministic.
            job.created_at = Utc::now() + chrono::Duration::seconds(i);
            store.create_job(&job).await.unwrap();
        }
        let jobs = store.list_jobs_by_session("S1", 2).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].job_id, "job3");
    }

    // ── Approvals ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn pending_approval_for_job_ignores_resolved() {
        let (store, _) = store_with_project().await;
        insert_session(&store, 1).await;
        let job = Job::new("j1", "S1", "demo", "x", "x");
        store.create_job(&job).await.unwrap();

        let mut approval = Approval::new(&job, ApprovalType::ShellCommand, "run rm");
        store.create_approval(&approval).await.unwrap();
        assert!(store.pending_approval_for_job("j1").await.unwrap().is_some());

        approval.state = ApprovalState::Approved;
        approval.resolved_by = Some("user".into());
        approval.resolved_at = Some(Utc::now());
        store.update_approval(&approval).await.unwrap();
        assert!(store.pending_approval_for_job("j1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn action_details_round_trip_as_json() {
        let (store, _) = store_with_project().await;
        insert_session(&store, 1).await;
        let job = Job::new("j1", "S1", "demo", "x", "x");
        store.create_job(&job).await.unwrap();

        let mut approval = Approval::new(&job, ApprovalType::GitPush, "push");
        approval.action_details = Some(serde_json::json!({"remote": "origin"}));
        store.create_approval(&approval).await.unwrap();

        let loaded = store.get_approval(&approval.approval_id).await.unwrap().unwrap();
        assert_eq!(loaded.action_details.unwrap()["remote"], "origin");
    }

    // ── Preferences ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn preferences_upsert_preserves_other_fields() {
        let store = Store::connect_in_memory().unwrap();
        store.set_user_ai_model(7, "model-x", "provider-y").await.unwrap();
        store.set_user_active_session(7, Some("S3")).await.unwrap();

        let prefs = store.get_user_preferences(7).await.unwrap().unwrap();
        assert_eq!(prefs.ai_model_id.as_deref(), Some("model-x"));
        assert_eq!(prefs.active_session_id.as_deref(), Some("S3"));
        assert!(prefs.notifications_enabled);
    }

    #[tokio::test]
    async fn tracker_preset_switch_resets_overrides() {
        let store = Store::connect_in_memory().unwrap();
        store
            .update_tracker_config(7, "show_cost", serde_json::Value::Bool(true))
            .await
            .unwrap();
        let (_, overrides) = store.get_tracker_config(7).await.unwrap();
        assert_eq!(overrides["show_cost"], serde_json::Value::Bool(true));

        store.set_tracker_preset(7, "verbose").await.unwrap();
        let (preset, overrides) = store.get_tracker_config(7).await.unwrap();
        assert_eq!(preset, "verbose");
        assert!(overrides.is_empty());
    }

    #[tokio::test]
    async fn tracker_config_defaults_for_unknown_chat() {
        let store = Store::connect_in_memory().unwrap();
        let (preset, overrides) = store.get_tracker_config(99).await.unwrap();
        assert_eq!(preset, "normal");
        assert!(overrides.is_empty());
    }

    // ── Migrations ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn migrations_are_idempotent_on_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let store = Store::connect(&path).unwrap();
            store
                .create_project(&Project::new("demo", "Demo", "/repos/demo"))
                .await
                .unwrap();
        }
        // Reconnecting re-applies the schema and probes migrations again.
        let store = Store::connect(&path).unwrap();
        assert!(store.get_project("demo").await.unwrap().is_some());
    }
}
