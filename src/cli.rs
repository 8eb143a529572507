// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "televibe",
    about = "Remote orchestration harness for coding-assistant sessions",
    version
)]
pub struct Cli {
    /// Explicit config file, merged at highest priority.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the projects root directory.
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the orchestrator (default).
    Serve,

    /// Print the merged configuration as YAML.
    ShowConfig,

    /// Manage registered projects.
    Projects {
        #[command(subcommand)]
        command: ProjectCommands,
    },

    /// Inspect sessions.
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },

    /// Backlog tasks.
    Tasks {
        #[command(subcommand)]
        command: TaskCommands,
    },
}

#[derive(Debug, Subcommand)]
pub enum ProjectCommands {
    /// List registered projects.
    List,

    /// Register a git repository as a project.
    Register {
        /// Path to the repository.
        path: PathBuf,

        /// Display name (defaults to the directory name).
        #[arg(long)]
        name: Option<String>,

        /// Project id slug (defaults to the slugified name).
        #[arg(long)]
        id: Option<String>,
    },

    /// Remove a project that has no remaining sessions.
    Remove { project_id: String },
}

#[derive(Debug, Subcommand)]
pub enum SessionCommands {
    /// List sessions that are not closing.
    List,
}

#[derive(Debug, Subcommand)]
pub enum TaskCommands {
    /// Import tasks from the project's backlog directory.
    Sync { project_id: String },

    /// List pending tasks, highest priority first.
    List {
        project_id: String,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}
