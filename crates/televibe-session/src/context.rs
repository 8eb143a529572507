// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! Context injection for assistant instructions.
//!
//! The assistant child process only sees its working directory; the context
//! block tells it which session it is driving, which project and branch it
//! is on, and whether changes land in an isolated worktree or the primary
//! checkout.

use televibe_store::{ExecutionMode, Project, Session};

/// Prepend the session context block to `instruction`.  The caller keeps
/// the original text as the job's `raw_input`.
pub fn enrich_instruction(instruction: &str, session: &Session, project: &Project) -> String {
    let mode_desc = match session.execution_mode {
        ExecutionMode::Worktree => "isolated worktree (safe for experiments)",
        ExecutionMode::Direct => "project folder directly (changes affect main project)",
    };

    format!(
        "# TeleVibe Session Context\n\
         - Session: {session_id}\n\
         - Project: {project_name} ({project_id})\n\
         - Branch: {branch}\n\
         - Mode: {mode} - {mode_desc}\n\
         - Workspace: {workspace}\n\
         \n\
         ---\n\
         \n\
         {instruction}",
        session_id = session.session_id,
        project_name = project.name,
        project_id = project.project_id,
        branch = session.branch,
        mode = session.execution_mode,
        workspace = session.workspace_path,
    )
}

/// One-line context summary for display.
pub fn context_summary(session: &Session, project: &Project) -> String {
    let mode_icon = match session.execution_mode {
        ExecutionMode::Worktree => "🌳",
        ExecutionMode::Direct => "📁",
    };
    format!(
        "{mode_icon} {} | {}:{} | {}",
        session.session_id, project.name, session.branch, session.execution_mode
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn fixtures() -> (Session, Project) {
        let session = Session::new("S3", "demo", "/ws/S3", "televibe/S3");
        let project = Project::new("demo", "Demo", "/repos/demo");
        (session, project)
    }

    #[test]
    fn enriched_instruction_keeps_original_text_at_end() {
        let (session, project) = fixtures();
        let enriched = enrich_instruction("fix the tests", &session, &project);
        assert!(enriched.starts_with("# TeleVibe Session Context"));
        assert!(enriched.ends_with("fix the tests"));
        assert!(enriched.contains("- Session: S3"));
        assert!(enriched.contains("- Branch: televibe/S3"));
        assert!(enriched.contains("- Workspace: /ws/S3"));
    }

    #[test]
    fn worktree_mode_is_described_as_safe() {
        let (session, project) = fixtures();
        let enriched = enrich_instruction("x", &session, &project);
        assert!(enriched.contains("isolated worktree"));
    }

    #[test]
    fn direct_mode_warns_about_main_project() {
        let (mut session, project) = fixtures();
        session.execution_mode = ExecutionMode::Direct;
        let enriched = enrich_instruction("x", &session, &project);
        assert!(enriched.contains("changes affect main project"));
    }

    #[test]
    fn summary_is_one_line() {
        let (session, project) = fixtures();
        let summary = context_summary(&session, &project);
        assert!(!summary.contains('\n'));
        assert!(summary.contains("S3"));
        assert!(summary.contains("Demo"));
    }
}
