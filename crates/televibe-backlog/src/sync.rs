// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use thiserror::Error;
use tracing::info;

use televibe_store::{Store, StoreError};

use crate::parser::scan_backlog_dir;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("project '{0}' not found")]
    ProjectNotFound(String),

    #[error("project '{0}' has no backlog directory configured")]
    BacklogDisabled(String),

    #[error("backlog path does not exist: {0}")]
    BacklogMissing(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Counts from one backlog sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub found: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// Import the project's backlog directory into the store.  New tasks are
/// created; known tasks are updated only when a tracked field actually
/// changed, so repeated syncs of an untouched backlog report everything
/// unchanged.
pub async fn sync_backlog(store: &Store, project_id: &str) -> Result<SyncReport, SyncError> {
    let project = store
        .get_project(project_id)
        .await?
        .ok_or_else(|| SyncError::ProjectNotFound(project_id.to_string()))?;

    let backlog_path = match (project.backlog_enabled, &project.backlog_path) {
        (true, Some(path)) => path.clone(),
        _ => return Err(SyncError::BacklogDisabled(project_id.to_string())),
    };
    let backlog_path = Path::new(&backlog_path);
    if !backlog_path.exists() {
        return Err(SyncError::BacklogMissing(backlog_path.display().to_string()));
    }

    let parsed = scan_backlog_dir(backlog_path, project_id, true);
    let mut report = SyncReport {
        found: parsed.len(),
        ..SyncReport::default()
    };

    for task in parsed {
        match store.get_task(&task.task_id).await? {
            None => {
                store.create_task(&task).await?;
                report.created += 1;
            }
            Some(mut existing) => {
                let changed = existing.title != task.title
                    || existing.description != task.description
                    || existing.status != task.status
                    || existing.priority != task.priority
                    || existing.epic != task.epic
                    || existing.assignee != task.assignee
                    || existing.tags != task.tags;
                if changed {
                    existing.title = task.title;
                    existing.description = task.description;
                    existing.status = task.status;
                    existing.priority = task.priority;
                    existing.epic = task.epic;
                    existing.assignee = task.assignee;
                    existing.tags = task.tags;
                    store.update_task(&mut existing).await?;
                    report.updated += 1;
                } else {
                    report.unchanged += 1;
                }
            }
        }
    }

    info!(
        project_id,
        found = report.found,
        created = report.created,
        updated = report.updated,
        "backlog synced"
    );
    Ok(report)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use televibe_store::{Project, TaskStatus};

    async fn store_with_backlog(dir: &Path) -> Store {
        let store = Store::connect_in_memory().unwrap();
        let mut project = Project::new("demo", "Demo", "/repos/demo");
        project.backlog_enabled = true;
        project.backlog_path = Some(dir.display().to_string());
        store.create_project(&project).await.unwrap();
        store
    }

    #[tokio::test]
    async fn sync_creates_then_reports_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("T-001-first.md"),
            "---\nstatus: todo\npriority: high\n---\n\n# First task\n",
        )
        .unwrap();
        let store = store_with_backlog(dir.path()).await;

        let first = sync_backlog(&store, "demo").await.unwrap();
        assert_eq!(first.created, 1);
        assert_eq!(first.unchanged, 0);

        let second = sync_backlog(&store, "demo").await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.unchanged, 1);
    }

    #[tokio::test]
    async fn sync_picks_up_status_changes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("T-001-first.md");
        std::fs::write(&file, "---\nstatus: todo\n---\n\n# First task\n").unwrap();
        let store = store_with_backlog(dir.path()).await;
        sync_backlog(&store, "demo").await.unwrap();

        std::fs::write(&file, "---\nstatus: done\n---\n\n# First task\n").unwrap();
        let report = sync_backlog(&store, "demo").await.unwrap();
        assert_eq!(report.updated, 1);

        let task = store.get_task("T-001").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn sync_requires_backlog_enabled() {
        let store = Store::connect_in_memory().unwrap();
        store
            .create_project(&Project::new("demo", "Demo", "/repos/demo"))
            .await
            .unwrap();
        assert!(matches!(
            sync_backlog(&store, "demo").await,
            Err(SyncError::BacklogDisabled(_))
        ));
    }

    #[tokio::test]
    async fn sync_unknown_project_fails() {
        let store = Store::connect_in_memory().unwrap();
        assert!(matches!(
            sync_backlog(&store, "ghost").await,
            Err(SyncError::ProjectNotFound(_))
        ));
    }
}
