// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! Workspace provisioning over plain `git` subprocess invocations.
//!
//! Each session gets an isolated worktree sharing object storage with the
//! primary checkout.  All verbs shell out to `git`; no libgit2 binding is
//! linked so the provisioner behaves identically to what an operator would
//! type by hand.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("not a git repository: {0}")]
    NotARepository(String),

    #[error("worktree path already exists: {0}")]
    PathExists(String),

    #[error("git {verb} failed: {stderr}")]
    Command { verb: String, stderr: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a worktree creation.
#[derive(Debug, Clone)]
pub struct CreatedWorktree {
    pub path: PathBuf,
    pub branch: String,
}

/// Result of a worktree removal.  Removal is idempotent: a missing worktree
/// reports `existed = false` instead of an error.
#[derive(Debug, Clone)]
pub struct RemovedWorktree {
    pub path: PathBuf,
    pub existed: bool,
}

/// One entry from `git worktree list --porcelain`.
#[derive(Debug, Clone, Default)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub head: Option<String>,
    pub branch: Option<String>,
    pub bare: bool,
    pub detached: bool,
}

/// Working-copy status for a branch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchStatus {
    pub branch: String,
    pub staged: usize,
    pub unstaged: usize,
    pub untracked: usize,
    pub ahead: usize,
    pub behind: usize,
}

impl BranchStatus {
    pub fn has_changes(&self) -> bool {
        self.staged + self.unstaged + self.untracked > 0
    }
}

/// Handle onto one git repository, from which worktrees are provisioned.
#[derive(Debug, Clone)]
pub struct GitRepo {
    repo_path: PathBuf,
}

impl GitRepo {
    /// Bind to a repository.  Fails when `path` is not inside a git repo.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, GitError> {
        let repo = Self {
            repo_path: path.into(),
        };
        match repo.run(&["rev-parse", "--git-dir"]).await {
            Ok(_) => Ok(repo),
            Err(_) => Err(GitError::NotARepository(
                repo.repo_path.display().to_string(),
            )),
        }
    }

    pub fn path(&self) -> &Path {
        &self.repo_path
    }

    /// Create a worktree at `path` bound to `branch`.  With `create_branch`
    /// the branch is created from `base` (or the repo's default branch).
    /// Fails when the target path already exists.
    pub async fn create_worktree(
        &self,
        path: &Path,
        branch: &str,
        create_branch: bool,
        base: Option<&str>,
    ) -> Result<CreatedWorktree, GitError> {
        if path.exists() {
            return Err(GitError::PathExists(path.display().to_string()));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let path_str = path.display().to_string();
        if create_branch {
            let base = match base {
                Some(b) => b.to_string(),
                None => self.default_branch().await,
            };
            self.run(&["worktree", "add", "-b", branch, &path_str, &base])
                .await?;
        } else {
            self.run(&["worktree", "add", &path_str, branch]).await?;
        }

        debug!(path = %path.display(), branch, "worktree created");
        Ok(CreatedWorktree {
            path: path.to_path_buf(),
            branch: branch.to_string(),
        })
    }

    /// Remove a worktree.  Idempotent: removing a path git does not know is
    /// reported as `existed = false`.  `force` discards uncommitted changes.
    pub async fn remove_worktree(
        &self,
        path: &Path,
        force: bool,
    ) -> Result<RemovedWorktree, GitError> {
        let path_str = path.display().to_string();
        let result = if force {
            self.run(&["worktree", "remove", "--force", &path_str]).await
        } else {
            self.run(&["worktree", "remove", &path_str]).await
        };

        match result {
            Ok(_) => Ok(RemovedWorktree {
                path: path.to_path_buf(),
                existed: true,
            }),
            Err(GitError::Command { stderr, .. }) if stderr.contains("is not a working tree") => {
                Ok(RemovedWorktree {
                    path: path.to_path_buf(),
                    existed: false,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// All worktrees of this repository, main checkout included.
    pub async fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, GitError> {
        let output = self.run(&["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_list(&output))
    }

    /// Branch status of `workdir` (or the main checkout when `None`):
    /// staged/unstaged/untracked counts plus ahead/behind vs the tracking
    /// branch.  Ahead/behind are zero when no upstream is configured.
    pub async fn branch_status(&self, workdir: Option<&Path>) -> Result<BranchStatus, GitError> {
        let dir = workdir.unwrap_or(&self.repo_path);

        let branch = run_in(dir, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?
            .trim()
            .to_string();

        let porcelain = run_in(dir, &["status", "--porcelain"]).await?;
        let mut status = parse_porcelain_status(&porcelain);
        status.branch = branch;

        // Ahead/behind only when a tracking branch exists.
        if let Ok(upstream) =
            run_in(dir, &["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{u}"]).await
        {
            let upstream = upstream.trim();
            let range = format!("{upstream}...HEAD");
            if let Ok(counts) =
                run_in(dir, &["rev-list", "--left-right", "--count", &range]).await
            {
                let mut parts = counts.split_whitespace();
                if let (Some(behind), Some(ahead)) = (parts.next(), parts.next()) {
                    status.behind = behind.parse().unwrap_or(0);
                    status.ahead = ahead.parse().unwrap_or(0);
                }
            }
        }

        Ok(status)
    }

    pub async fn branch_exists(&self, branch: &str) -> bool {
        self.run(&["rev-parse", "--verify", &format!("refs/heads/{branch}")])
            .await
            .is_ok()
    }

    /// Default branch: origin/HEAD when set, then a main/master probe, then
    /// the current branch, finally "main".
    pub async fn default_branch(&self) -> String {
        if let Ok(refname) = self.run(&["symbolic-ref", "refs/remotes/origin/HEAD"]).await {
            if let Some(name) = refname.trim().strip_prefix("refs/remotes/origin/") {
                return name.to_string();
            }
        }
        for candidate in ["main", "master"] {
            if self.branch_exists(candidate).await {
                return candidate.to_string();
            }
        }
        if let Ok(current) = self.run(&["rev-parse", "--abbrev-ref", "HEAD"]).await {
            let current = current.trim();
            if current != "HEAD" {
                return current.to_string();
            }
        }
        "main".to_string()
    }

    pub async fn create_branch(&self, branch: &str, base: Option<&str>) -> Result<(), GitError> {
        let base = base.unwrap_or("HEAD");
        self.run(&["branch", branch, base]).await?;
        Ok(())
    }

    /// Idempotent: a missing branch is already deleted.
    pub async fn delete_branch(&self, branch: &str, force: bool) -> Result<(), GitError> {
        let flag = if force { "-D" } else { "-d" };
        match self.run(&["branch", flag, branch]).await {
            Ok(_) => Ok(()),
            Err(GitError::Command { stderr, .. }) if stderr.contains("not found") => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn short_sha(&self, rev: &str) -> Result<String, GitError> {
        Ok(self
            .run(&["rev-parse", "--short", rev])
            .await?
            .trim()
            .to_string())
    }

    pub async fn remote_url(&self) -> Option<String> {
        self.run(&["remote", "get-url", "origin"])
            .await
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    async fn run(&self, args: &[&str]) -> Result<String, GitError> {
        run_in(&self.repo_path, args).await
    }
}

/// Run `git <args>` in `dir` and return trimmed-trailing stdout.
async fn run_in(dir: &Path, args: &[&str]) -> Result<String, GitError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        // No terminal access for git hooks or credential helpers.
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(GitError::Command {
            verb: args.first().unwrap_or(&"git").to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

fn parse_worktree_list(output: &str) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut current = WorktreeInfo::default();
    let mut seen_any = false;

    for line in output.lines() {
        if line.is_empty() {
            if seen_any {
                worktrees.push(std::mem::take(&mut current));
                seen_any = false;
            }
            continue;
        }
        seen_any = true;
        if let Some(path) = line.strip_prefix("worktree ") {
            current.path = PathBuf::from(path);
        } else if let Some(head) = line.strip_prefix("HEAD ") {
            current.head = Some(head.to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            current.branch = Some(branch.trim_start_matches("refs/heads/").to_string());
        } else if line == "bare" {
            current.bare = true;
        } else if line == "detached" {
            current.detached = true;
        }
    }
    if seen_any {
        worktrees.push(current);
    }
    worktrees
}

/// Count staged / unstaged / untracked entries from `status --porcelain`.
fn parse_porcelain_status(porcelain: &str) -> BranchStatus {
    let mut status = BranchStatus::default();
    for line in porcelain.lines() {
        let mut chars = line.chars();
        let index = chars.next().unwrap_or(' ');
        let work = chars.next().unwrap_or(' ');

        if index == '?' {
            status.untracked += 1;
        } else {
            if index != ' ' {
                status.staged += 1;
            }
            if work != ' ' {
                status.unstaged += 1;
            }
        }
    }
    status
}

/// Standardized branch name for a session: `televibe/S<n>[-<slug>]`.
/// The description slug keeps only alphanumerics and dashes, capped at 30
/// characters.
pub fn generate_session_branch(session_number: u32, description: Option<&str>) -> String {
    let base = format!("televibe/S{session_number}");
    let Some(desc) = description else {
        return base;
    };

    let mut slug = String::new();
    let mut last_dash = true;
    for c in desc.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= 30 {
            break;
        }
    }
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        base
    } else {
        format!("{base}-{slug}")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    /// Initialise a repo with one commit on `main` so worktree adds succeed.
    fn init_repo(dir: &Path) {
        let run = |args: &[&str]| {
            let status = StdCommand::new("git")
                .args(args)
                .current_dir(dir)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .unwrap();
            assert!(status.success(), "git {args:?} failed");
        };
        run(&["init", "-b", "main"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(dir.join("README.md"), "# test\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "init"]);
    }

    // ── Branch name generation ────────────────────────────────────────────────

    #[test]
    fn session_branch_without_description() {
        assert_eq!(generate_session_branch(12, None), "televibe/S12");
    }

    #[test]
    fn session_branch_slugifies_description() {
        assert_eq!(
            generate_session_branch(3, Some("Fix Auth Flow!")),
            "televibe/S3-fix-auth-flow"
        );
    }

    #[test]
    fn session_branch_caps_slug_length() {
        let long = "a very long description that keeps going and going forever";
        let branch = generate_session_branch(1, Some(long));
        assert!(branch.len() <= "televibe/S1-".len() + 30);
    }

    #[test]
    fn session_branch_ignores_symbol_only_description() {
        assert_eq!(generate_session_branch(2, Some("!!!")), "televibe/S2");
    }

    // ── Porcelain parsing ─────────────────────────────────────────────────────

    #[test]
    fn porcelain_counts_each_category() {
        let porcelain = "M  staged.rs\n M unstaged.rs\nMM both.rs\n?? new.rs\n";
        let status = parse_porcelain_status(porcelain);
        assert_eq!(status.staged, 2); // staged.rs + both.rs
        assert_eq!(status.unstaged, 2); // unstaged.rs + both.rs
        assert_eq!(status.untracked, 1);
        assert!(status.has_changes());
    }

    #[test]
    fn empty_porcelain_has_no_changes() {
        assert!(!parse_porcelain_status("").has_changes());
    }

    #[test]
    fn worktree_list_parses_porcelain_blocks() {
        let output = "worktree /repo\nHEAD abc123\nbranch refs/heads/main\n\n\
                      worktree /ws/S1\nHEAD def456\nbranch refs/heads/televibe/S1\n\n";
        let list = parse_worktree_list(output);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].branch.as_deref(), Some("main"));
        assert_eq!(list[1].path, PathBuf::from("/ws/S1"));
        assert_eq!(list[1].branch.as_deref(), Some("televibe/S1"));
    }

    // ── Worktree lifecycle (real git) ─────────────────────────────────────────

    #[tokio::test]
    async fn open_rejects_non_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            GitRepo::open(dir.path()).await,
            Err(GitError::NotARepository(_))
        ));
    }

    #[tokio::test]
    async fn create_and_remove_worktree() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let repo = GitRepo::open(dir.path()).await.unwrap();

        let ws = dir.path().join("ws").join("S1");
        let created = repo
            .create_worktree(&ws, "televibe/S1", true, None)
            .await
            .unwrap();
        assert_eq!(created.branch, "televibe/S1");
        assert!(ws.join("README.md").exists());

        let removed = repo.remove_worktree(&ws, false).await.unwrap();
        assert!(removed.existed);

        // Second removal is the idempotent no-op path.
        let removed_again = repo.remove_worktree(&ws, false).await.unwrap();
        assert!(!removed_again.existed);
    }

    #[tokio::test]
    async fn create_worktree_refuses_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let repo = GitRepo::open(dir.path()).await.unwrap();

        let ws = dir.path().join("taken");
        std::fs::create_dir_all(&ws).unwrap();
        assert!(matches!(
            repo.create_worktree(&ws, "b", true, None).await,
            Err(GitError::PathExists(_))
        ));
    }

    #[tokio::test]
    async fn branch_status_counts_fresh_worktree_as_clean() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let repo = GitRepo::open(dir.path()).await.unwrap();

        let ws = dir.path().join("ws").join("S1");
        repo.create_worktree(&ws, "televibe/S1", true, None)
            .await
            .unwrap();

        let status = repo.branch_status(Some(&ws)).await.unwrap();
        assert_eq!(status.branch, "televibe/S1");
        assert!(!status.has_changes());

        std::fs::write(ws.join("new.txt"), "x").unwrap();
        let status = repo.branch_status(Some(&ws)).await.unwrap();
        assert_eq!(status.untracked, 1);
    }

    #[tokio::test]
    async fn default_branch_probes_main() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let repo = GitRepo::open(dir.path()).await.unwrap();
        assert_eq!(repo.default_branch().await, "main");
    }

    #[tokio::test]
    async fn branch_exists_after_create() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let repo = GitRepo::open(dir.path()).await.unwrap();

        assert!(!repo.branch_exists("feature").await);
        repo.create_branch("feature", None).await.unwrap();
        assert!(repo.branch_exists("feature").await);

        repo.delete_branch("feature", true).await.unwrap();
        // Deleting again hits the idempotent path.
        repo.delete_branch("feature", true).await.unwrap();
    }
}
