// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use tracing::info;

use televibe_store::{Project, SessionState, Store};
use televibe_workspace::GitRepo;

use crate::error::SessionError;

/// Outcome of registering a repository.
#[derive(Debug, Clone)]
pub struct ProjectRegistration {
    pub project: Project,
    pub backlog_detected: bool,
}

/// Convert a display name to a lowercase slug suitable as a project id.
pub fn slugify(name: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for c in name.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_matches('-').to_string()
}

/// Register a git repository as a project.
///
/// Validates that `path` is a repository, derives name/id when not supplied,
/// rejects duplicate ids and paths, captures the remote url and default
/// branch, and auto-detects a backlog directory.
pub async fn register_project(
    store: &Store,
    path: &Path,
    name: Option<&str>,
    project_id: Option<&str>,
) -> Result<ProjectRegistration, SessionError> {
    if !path.exists() {
        return Err(SessionError::Validation(format!(
            "path does not exist: {}",
            path.display()
        )));
    }
    let repo = GitRepo::open(path).await?;

    let name = match name {
        Some(n) => n.to_string(),
        None => path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string()),
    };
    let project_id = match project_id {
        Some(id) => id.to_string(),
        None => slugify(&name),
    };
    if project_id.is_empty() {
        return Err(SessionError::Validation(
            "project id must not be empty".to_string(),
        ));
    }

    let path_str = path.display().to_string();
    if store.get_project(&project_id).await?.is_some() {
        return Err(SessionError::Conflict(format!(
            "project with id '{project_id}' already exists"
        )));
    }
    if store.get_project_by_path(&path_str).await?.is_some() {
        return Err(SessionError::Conflict(format!(
            "project at path '{path_str}' already registered"
        )));
    }

    let mut project = Project::new(&project_id, &name, &path_str);
    project.remote_url = repo.remote_url().await;
    project.default_branch = repo.default_branch().await;

    // Auto-detect a backlog directory.
    for candidate in ["backlog", "Backlog", ".backlog"] {
        let dir = path.join(candidate);
        if dir.is_dir() {
            project.backlog_enabled = true;
            project.backlog_path = Some(dir.display().to_string());
            break;
        }
    }
    let backlog_detected = project.backlog_enabled;

    store.create_project(&project).await?;
    info!(project_id, path = %path_str, "project registered");

    Ok(ProjectRegistration {
        project,
        backlog_detected,
    })
}

/// Delete a project.  Refused while any non-terminal session references it.
pub async fn remove_project(store: &Store, project_id: &str) -> Result<(), SessionError> {
    let project = store
        .get_project(project_id)
        .await?
        .ok_or_else(|| SessionError::not_found("project", project_id))?;

    let sessions = store.list_sessions_by_project(&project.project_id).await?;
    let live: Vec<&str> = sessions
        .iter()
        .filter(|s| s.state != SessionState::Closing)
        .map(|s| s.session_id.as_str())
        .collect();
    if !live.is_empty() {
        return Err(SessionError::Conflict(format!(
            "project '{project_id}' still has sessions: {}",
            live.join(", ")
        )));
    }

    store.delete_project(project_id).await?;
    info!(project_id, "project removed");
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
