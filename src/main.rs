// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands, ProjectCommands, SessionCommands, TaskCommands};
use televibe_config::Config;
use televibe_orchestrator::Orchestrator;
use televibe_session::{register_project, remove_project};
use televibe_store::Store;
use televibe_tracker::{ChatApi, ChatError, Keyboard, TrackerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = televibe_config::load(cli.config.as_deref())?;
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    let config = Arc::new(config);

    init_logging(&config);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::ShowConfig => {
            println!("{}", serde_yaml::to_string(config.as_ref())?);
            Ok(())
        }
        Commands::Projects { command } => run_project_command(&config, command).await,
        Commands::Sessions { command } => run_session_command(&config, command).await,
        Commands::Tasks { command } => run_task_command(&config, command).await,
        Commands::Serve => serve(config).await,
    }
}

/// Default filter comes from `log_level`; `RUST_LOG` wins when set.
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn connect_store(config: &Config) -> anyhow::Result<Arc<Store>> {
    config.ensure_dirs().context("creating .televibe directories")?;
    let store = Store::connect(&config.db_path())
        .with_context(|| format!("opening store at {}", config.db_path().display()))?;
    Ok(Arc::new(store))
}

async fn serve(config: Arc<Config>) -> anyhow::Result<()> {
    if config.executor_type == televibe_config::ExecutorType::Sdk {
        warn!("sdk executor selected but not wired; falling back to subprocess");
    }
    let store = connect_store(&config)?;

    // Stand-in transport until a chat collaborator attaches; messages land
    // in the log instead of a chat.
    let chat: Arc<dyn ChatApi> = Arc::new(LogChat);
    let orchestrator = Orchestrator::new(config.clone(), store, chat, TrackerConfig::default());

    surface_restart_notice(&config);

    // Signal the supervisor that initial setup completed.
    std::fs::write(config.health_flag_path(), chrono::Utc::now().to_rfc3339())
        .context("writing health flag")?;

    let sessions = orchestrator.store.list_active_sessions().await?;
    info!(
        sessions = sessions.len(),
        max_jobs = config.max_concurrent_jobs,
        root = %config.root.display(),
        "televibe core ready"
    );

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    Ok(())
}

/// Report the restart-notice file the supervisor leaves behind after a
/// self-heal, then consume it.
fn surface_restart_notice(config: &Config) {
    let path = config.restart_state_path();
    if !path.exists() {
        return;
    }
    match std::fs::read_to_string(&path) {
        Ok(content) => {
            info!(notice = %content.trim(), "supervisor restart notice");
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(error = %e, "could not consume restart notice");
            }
        }
        Err(e) => warn!(error = %e, "could not read restart notice"),
    }
}

async fn run_project_command(config: &Config, command: ProjectCommands) -> anyhow::Result<()> {
    let store = connect_store(config)?;
    match command {
        ProjectCommands::List => {
            for project in store.list_projects().await? {
                println!(
                    "{:<20} {:<24} {} ({})",
                    project.project_id, project.name, project.path, project.default_branch
                );
            }
        }
        ProjectCommands::Register { path, name, id } => {
            let registration =
                register_project(&store, &path, name.as_deref(), id.as_deref()).await?;
            println!(
                "registered {} as '{}'{}",
                registration.project.path,
                registration.project.project_id,
                if registration.backlog_detected {
                    " (backlog detected)"
                } else {
                    ""
                }
            );
        }
        ProjectCommands::Remove { project_id } => {
            remove_project(&store, &project_id).await?;
            println!("removed '{project_id}'");
        }
    }
    Ok(())
}

async fn run_session_command(config: &Config, command: SessionCommands) -> anyhow::Result<()> {
    let store = connect_store(config)?;
    match command {
        SessionCommands::List => {
            for session in store.list_active_sessions().await? {
                println!(
                    "{:<6} {:<16} {:<28} {:<8} job={}",
                    session.session_id,
                    session.project_id,
                    session.branch,
                    session.state,
                    session.current_job_id.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}

async fn run_task_command(config: &Config, command: TaskCommands) -> anyhow::Result<()> {
    let store = connect_store(config)?;
    match command {
        TaskCommands::Sync { project_id } => {
            let report = televibe_backlog::sync_backlog(&store, &project_id).await?;
            println!(
                "found {} task(s): {} created, {} updated, {} unchanged",
                report.found, report.created, report.updated, report.unchanged
            );
        }
        TaskCommands::List { project_id, limit } => {
            for task in store.pending_tasks(&project_id, limit).await? {
                println!(
                    "{:<10} {:<9} {:<12} {}",
                    task.task_id, task.priority, task.status, task.title
                );
            }
        }
    }
    Ok(())
}

/// [`ChatApi`] stand-in that writes messages to the log.  Used by `serve`
/// until a real chat collaborator is wired in.
struct LogChat;

#[async_trait]
impl ChatApi for LogChat {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        _keyboard: Option<&Keyboard>,
    ) -> Result<i64, ChatError> {
        info!(chat_id, text, "chat send");
        Ok(0)
    }

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        _keyboard: Option<&Keyboard>,
    ) -> Result<(), ChatError> {
        info!(chat_id, message_id, text, "chat edit");
        Ok(())
    }

    async fn reply_to_message(
        &self,
        chat_id: i64,
        parent_message_id: i64,
        text: &str,
    ) -> Result<i64, ChatError> {
        info!(chat_id, parent_message_id, text, "chat reply");
        Ok(0)
    }
}
