// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use televibe_config::Config;
use televibe_store::{Job, Session, SessionState, Store};
use televibe_workspace::{generate_session_branch, BranchStatus, GitRepo};

use crate::error::SessionError;

/// Result of closing a session.
#[derive(Debug, Clone)]
pub struct ClosedSession {
    pub session_id: String,
    pub worktree_removed: bool,
    pub note: Option<String>,
}

/// Aggregate view for one session: row, project name, branch status of the
/// working copy, recent jobs.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub session: Session,
    pub project_name: String,
    pub git: Option<BranchStatus>,
    pub recent_jobs: Vec<Job>,
}

/// Lifecycle of sessions over the store and the workspace provisioner.
///
/// The manager is the sole writer of session lifecycle fields; the runner
/// updates only the job-related fields through its own paths.
pub struct SessionManager {
    config: Arc<Config>,
    store: Arc<Store>,
}

impl SessionManager {
    pub fn new(config: Arc<Config>, store: Arc<Store>) -> Self {
        Self { config, store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Create a session: assign the next `S<n>` id, resolve the branch,
    /// provision the worktree, insert the idle session row.
    ///
    /// Worktree creation happens before the insert; a failed insert rolls
    /// the worktree back so no orphaned checkout survives.
    pub async fn create_session(
        &self,
        project_id: &str,
        branch: Option<String>,
        display_name: Option<String>,
    ) -> Result<Session, SessionError> {
        let project = self
            .store
            .get_project(project_id)
            .await?
            .ok_or_else(|| SessionError::not_found("project", project_id))?;

        let number = self.store.next_session_number().await?;
        let session_id = format!("S{number}");
        let branch =
            branch.unwrap_or_else(|| generate_session_branch(number, display_name.as_deref()));

        let workspace_path = self.config.workspaces_dir().join(&session_id);
        if workspace_path.exists() {
            return Err(SessionError::Conflict(format!(
                "workspace path already exists: {}",
                workspace_path.display()
            )));
        }

        let repo = GitRepo::open(&project.path).await?;
        let branch_exists = repo.branch_exists(&branch).await;
        repo.create_worktree(
            &workspace_path,
            &branch,
            !branch_exists,
            Some(&project.default_branch),
        )
        .await?;

        let mut session = Session::new(
            &session_id,
            &project.project_id,
            workspace_path.display().to_string(),
            &branch,
        );
        session.display_name = display_name;

        if let Err(e) = self.store.create_session(&session).await {
            // Roll back the worktree so a retried create starts clean.
            let _ = repo.remove_worktree(&workspace_path, true).await;
            return Err(e.into());
        }

        info!(session_id, project_id, branch, "session created");
        Ok(session)
    }

    /// Close a session and release its worktree.  Refused while a job is
    /// running unless `force` is set.  A session whose project has been
    /// deleted is still cleaned up.
    pub async fn close_session(
        &self,
        session_id: &str,
        force: bool,
    ) -> Result<ClosedSession, SessionError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| SessionError::not_found("session", session_id))?;

        if session.state == SessionState::Running && !force {
            return Err(SessionError::Busy {
                session_id: session_id.to_string(),
                job_id: session.current_job_id.clone(),
            });
        }

        let workspace_path = Path::new(&session.workspace_path).to_path_buf();
        let mut worktree_removed = false;
        let mut note = None;

        match self.store.get_project(&session.project_id).await? {
            Some(project) => {
                if workspace_path.exists() {
                    let repo = GitRepo::open(&project.path).await?;
                    match repo.remove_worktree(&workspace_path, force).await {
                        Ok(removed) => worktree_removed = removed.existed,
                        Err(e) if force => {
                            // Worktree metadata may be broken; force close
                            // falls back to removing the directory.
                            warn!(session_id, error = %e, "git removal failed, deleting directory");
                            std::fs::remove_dir_all(&workspace_path)
                                .map_err(televibe_workspace::GitError::Io)?;
                            worktree_removed = true;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            None => {
                if workspace_path.exists() {
                    std::fs::remove_dir_all(&workspace_path)
                        .map_err(televibe_workspace::GitError::Io)?;
                    worktree_removed = true;
                }
                note = Some("project no longer exists, session cleaned up".to_string());
            }
        }

        self.store
            .update_session_state(session_id, SessionState::Closing)
            .await?;
        self.store.delete_session(session_id).await?;

        info!(session_id, worktree_removed, "session closed");
        Ok(ClosedSession {
            session_id: session_id.to_string(),
            worktree_removed,
            note,
        })
    }

    /// Session row plus branch status and recent jobs.
    pub async fn session_status(&self, session_id: &str) -> Result<SessionStatus, SessionError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| SessionError::not_found("session", session_id))?;
        let project = self
            .store
            .get_project(&session.project_id)
            .await?
            .ok_or_else(|| SessionError::not_found("project", session.project_id.clone()))?;

        let workspace_path = Path::new(&session.workspace_path);
        let git = if workspace_path.exists() {
            let repo = GitRepo::open(&project.path).await?;
            repo.branch_status(Some(workspace_path)).await.ok()
        } else {
            None
        };

        let recent_jobs = self.store.list_jobs_by_session(session_id, 5).await?;

        Ok(SessionStatus {
            session,
            project_name: project.name,
            git,
            recent_jobs,
        })
    }

    /// Attach a task to a session (bidirectional, idempotent).  The task
    /// also picks up the session's branch.
    pub async fn attach_task(
        &self,
        session_id: &str,
        task_id: &str,
    ) -> Result<bool, SessionError> {
        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| SessionError::not_found("session", session_id))?;
        let mut task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| SessionError::not_found("task", task_id))?;

        if session.attached_task_ids.iter().any(|t| t == task_id) {
            return Ok(false);
        }

        session.attached_task_ids.push(task_id.to_string());
        self.store.update_session(&mut session).await?;

        task.session_id = Some(session_id.to_string());
        task.branch = Some(session.branch.clone());
        self.store.update_task(&mut task).await?;

        Ok(true)
    }

    /// Detach a task from a session (idempotent).
    pub async fn detach_task(
        &self,
        session_id: &str,
        task_id: &str,
    ) -> Result<bool, SessionError> {
        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| SessionError::not_found("session", session_id))?;

        let before = session.attached_task_ids.len();
        session.attached_task_ids.retain(|t| t != task_id);
        if session.attached_task_ids.len() == before {
            return Ok(false);
        }
        self.store.update_session(&mut session).await?;

        if let Some(mut task) = self.store.get_task(task_id).await? {
            if task.session_id.as_deref() == Some(session_id) {
                task.session_id = None;
                self.store.update_task(&mut task).await?;
            }
        }

        Ok(true)
    }

    /// Switch a chat's active session.  Pure read-side preference update.
    pub async fn switch_active(&self, chat_id: i64, session_id: &str) -> Result<(), SessionError> {
        if self.store.get_session(session_id).await?.is_none() {
            return Err(SessionError::not_found("session", session_id));
        }
        self.store
            .set_user_active_session(chat_id, Some(session_id))
            .await?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
