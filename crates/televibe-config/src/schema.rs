// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Serde default helper that returns `3`.
///
/// `#[serde(default)]` on a numeric field falls back to `0`, which would
/// disable job execution entirely, so the real default needs a named function.
fn default_max_jobs() -> usize {
    3
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_claude_bin() -> String {
    "claude".to_string()
}

/// How jobs are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorType {
    /// Spawn the assistant CLI as a child process (default).
    #[default]
    Subprocess,
    /// In-process library invocation.  Accepted by the config but currently
    /// resolved to the subprocess path at startup.
    Sdk,
}

/// Log verbosity, mapped onto a tracing env-filter directive at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// The `tracing_subscriber::EnvFilter` directive for this level.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bot token handed through to the chat collaborator.  The core never
    /// interprets it.
    #[serde(default)]
    pub telegram_bot_token: String,

    /// Chat IDs allowed to drive the orchestrator.  An empty list means
    /// "allow any" and is logged as insecure at startup.
    #[serde(default)]
    pub telegram_allowed_chat_ids: Vec<i64>,

    /// Global cap on concurrently running jobs across all sessions.
    #[serde(default = "default_max_jobs")]
    pub max_concurrent_jobs: usize,

    #[serde(default)]
    pub executor_type: ExecutorType,

    #[serde(default)]
    pub log_level: LogLevel,

    /// Root directory containing the managed projects.  All televibe state
    /// lives under `<root>/.televibe/`.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Assistant executable.  Overridable so tests can substitute a scripted
    /// fake that prints stream-JSON lines.
    #[serde(default = "default_claude_bin")]
    pub claude_bin: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telegram_bot_token: String::new(),
            telegram_allowed_chat_ids: Vec::new(),
            max_concurrent_jobs: default_max_jobs(),
            executor_type: ExecutorType::default(),
            log_level: LogLevel::default(),
            root: default_root(),
            claude_bin: default_claude_bin(),
        }
    }
}

impl Config {
    /// `<root>/.televibe`
    pub fn televibe_dir(&self) -> PathBuf {
        self.root.join(".televibe")
    }

    /// `<root>/.televibe/state.db`
    pub fn db_path(&self) -> PathBuf {
        self.televibe_dir().join("state.db")
    }

    /// `<root>/.televibe/logs`
    pub fn logs_dir(&self) -> PathBuf {
        self.televibe_dir().join("logs")
    }

    /// `<root>/.televibe/workspaces`
    pub fn workspaces_dir(&self) -> PathBuf {
        self.televibe_dir().join("workspaces")
    }

    /// `<root>/.televibe/restart_state.json`, written by the outer
    /// supervisor to signal which chats to notify after a restart.
    pub fn restart_state_path(&self) -> PathBuf {
        self.televibe_dir().join("restart_state.json")
    }

    /// `<root>/.televibe/health.flag`, touched once initial setup
    /// completes; the supervisor watches it.
    pub fn health_flag_path(&self) -> PathBuf {
        self.televibe_dir().join("health.flag")
    }

    /// Create the `.televibe` directory tree.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.televibe_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.workspaces_dir())?;
        Ok(())
    }

    /// True when `chat_id` may drive the orchestrator.
    pub fn is_chat_allowed(&self, chat_id: i64) -> bool {
        self.telegram_allowed_chat_ids.is_empty()
            || self.telegram_allowed_chat_ids.contains(&chat_id)
    }
}

/// Parse a comma-separated chat-id list (the env-var form of
/// `telegram_allowed_chat_ids`).  Blank entries are skipped; a malformed
/// entry fails the whole parse so typos do not silently widen access.
pub(crate) fn parse_chat_ids(raw: &str) -> Result<Vec<i64>, std::num::ParseIntError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
