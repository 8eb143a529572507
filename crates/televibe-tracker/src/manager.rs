// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use televibe_protocol::{ControlRequest, EventCategory, EventKind, SessionEvent};
use televibe_runner::{JobProgress, JobSink};
use televibe_store::{Job, JobStatus};

use crate::chat::{ChatApi, ChatError};
use crate::config::TrackerConfig;
use crate::limiter::EditRateLimiter;
use crate::renderer::{TrackerRenderer, TrackerState, TrackerStatus};

/// Manages the live tracker message of every running job.
///
/// Owns per-chat configs, the per-job tracker states, and the edit-rate
/// limiter.  All chat I/O goes through the [`ChatApi`] collaborator; the
/// benign "not modified" edit failure is swallowed here.
pub struct TrackerManager {
    chat: Arc<dyn ChatApi>,
    default_config: TrackerConfig,
    limiter: EditRateLimiter,
    chat_configs: Mutex<HashMap<i64, TrackerConfig>>,
    trackers: Mutex<HashMap<String, TrackerState>>,
    /// tool_use_id → tool name, for enriching results with their tool.
    pending_tools: Mutex<HashMap<String, String>>,
    /// Events that arrived before the tracker message existed.  A fast job
    /// can emit output (or even finish) between submit and the initial
    /// send; these are replayed when the tracker is created.
    early_events: Mutex<HashMap<String, Vec<SessionEvent>>>,
    early_completions: Mutex<HashMap<String, EarlyCompletion>>,
}

struct EarlyCompletion {
    status: TrackerStatus,
    result: Option<String>,
    error: Option<String>,
    files_changed: Option<Vec<String>>,
}

/// Per-job cap on buffered early events.
const EARLY_EVENT_CAP: usize = 256;

impl TrackerManager {
    pub fn new(chat: Arc<dyn ChatApi>, default_config: TrackerConfig) -> Self {
        let limiter = EditRateLimiter::new(default_config.update_interval_ms);
        Self {
            chat,
            default_config,
            limiter,
            chat_configs: Mutex::new(HashMap::new()),
            trackers: Mutex::new(HashMap::new()),
            pending_tools: Mutex::new(HashMap::new()),
            early_events: Mutex::new(HashMap::new()),
            early_completions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn set_chat_config(&self, chat_id: i64, config: TrackerConfig) {
        self.chat_configs.lock().await.insert(chat_id, config);
        info!(chat_id, "tracker config set");
    }

    pub async fn get_chat_config(&self, chat_id: i64) -> TrackerConfig {
        self.chat_configs
            .lock()
            .await
            .get(&chat_id)
            .cloned()
            .unwrap_or_else(|| self.default_config.clone())
    }

    /// Create and send the initial tracker message for a job.
    pub async fn create_tracker(
        &self,
        chat_id: i64,
        job_id: &str,
        session_id: &str,
        project_name: &str,
        instruction: &str,
    ) -> Result<(), ChatError> {
        let mut state = TrackerState::new(job_id, session_id, project_name, instruction, chat_id);

        let config = self.get_chat_config(chat_id).await;
        let (text, keyboard) = TrackerRenderer::new(config).render(&state);
        let message_id = self.chat.send_message(chat_id, &text, Some(&keyboard)).await?;
        state.message_id = Some(message_id);
        state.status = TrackerStatus::Running;

        self.trackers.lock().await.insert(job_id.to_string(), state);
        info!(job_id, chat_id, message_id, "tracker created");

        // Replay anything the job emitted before the message existed.
        let buffered = self
            .early_events
            .lock()
            .await
            .remove(job_id)
            .unwrap_or_default();
        for event in &buffered {
            self.add_event(job_id, event).await;
        }
        if let Some(done) = self.early_completions.lock().await.remove(job_id) {
            self.complete(
                job_id,
                done.status,
                done.result.as_deref(),
                done.error.as_deref(),
                done.files_changed.as_deref(),
            )
            .await;
        }

        Ok(())
    }

    /// Feed one typed event into a job's tracker: filter, enrich, buffer,
    /// update stats, and refresh the chat message.
    pub async fn add_event(&self, job_id: &str, event: &SessionEvent) {
        let rendered = {
            let mut trackers = self.trackers.lock().await;
            let Some(state) = trackers.get_mut(job_id) else {
                drop(trackers);
                let mut early = self.early_events.lock().await;
                let buffer = early.entry(job_id.to_string()).or_default();
                if buffer.len() < EARLY_EVENT_CAP {
                    buffer.push(event.clone());
                }
                return;
            };

            // Track tool starts and enrich results with their tool name
            // before any filtering, so per-tool result rules can match even
            // when the start itself is hidden.
            let mut event = event.clone();
            match &mut event.kind {
                EventKind::ToolStart {
                    tool_name,
                    tool_use_id,
                    ..
                } => {
                    self.pending_tools
                        .lock()
                        .await
                        .insert(tool_use_id.clone(), tool_name.clone());
                }
                EventKind::ToolResult {
                    tool_use_id,
                    tool_name,
                    ..
                } => {
                    if let Some(name) = self.pending_tools.lock().await.remove(tool_use_id) {
                        *tool_name = name;
                    }
                }
                _ => {}
            }

            // A paused tracker still surfaces system events and tool errors.
            if state.updates_paused
                && !matches!(
                    event.category(),
                    EventCategory::System | EventCategory::ToolError
                )
            {
                return;
            }

            let config = self.get_chat_config(state.chat_id).await;
            if !should_include(&event, &config) {
                return;
            }

            update_stats(state, &event);
            state.events.push(event);

            self.render_locked(state, &config)
        };

        self.push_edit(rendered).await;
    }

    /// Refresh elapsed time from a throttled progress callback.
    pub async fn tick(&self, job_id: &str, elapsed_seconds: u64) {
        let rendered = {
            let mut trackers = self.trackers.lock().await;
            let Some(state) = trackers.get_mut(job_id) else {
                return;
            };
            state.elapsed_seconds = elapsed_seconds;
            let config = self.get_chat_config(state.chat_id).await;
            self.render_locked(state, &config)
        };
        self.push_edit(rendered).await;
    }

    pub async fn set_status(&self, job_id: &str, status: TrackerStatus) {
        let rendered = {
            let mut trackers = self.trackers.lock().await;
            let Some(state) = trackers.get_mut(job_id) else {
                return;
            };
            state.status = status;
            let config = self.get_chat_config(state.chat_id).await;
            self.render_locked(state, &config)
        };
        self.push_edit(rendered).await;
    }

    pub async fn pause_updates(&self, job_id: &str) {
        self.set_paused(job_id, true).await;
    }

    pub async fn resume_updates(&self, job_id: &str) {
        self.set_paused(job_id, false).await;
    }

    async fn set_paused(&self, job_id: &str, paused: bool) {
        let rendered = {
            let mut trackers = self.trackers.lock().await;
            let Some(state) = trackers.get_mut(job_id) else {
                return;
            };
            state.updates_paused = paused;
            let config = self.get_chat_config(state.chat_id).await;
            self.render_locked(state, &config)
        };
        self.push_edit(rendered).await;
    }

    /// Terminal hand-off: one final forced edit of the tracker message, then
    /// a sibling completion reply, then the tracker state is freed.
    pub async fn complete(
        &self,
        job_id: &str,
        status: TrackerStatus,
        result: Option<&str>,
        error: Option<&str>,
        files_changed: Option<&[String]>,
    ) {
        let (rendered, reply) = {
            let mut trackers = self.trackers.lock().await;
            let Some(state) = trackers.get_mut(job_id) else {
                drop(trackers);
                // The job finished before its tracker message existed; hold
                // the completion until create_tracker replays it.
                self.early_completions.lock().await.insert(
                    job_id.to_string(),
                    EarlyCompletion {
                        status,
                        result: result.map(str::to_string),
                        error: error.map(str::to_string),
                        files_changed: files_changed.map(|f| f.to_vec()),
                    },
                );
                return;
            };
            state.status = status;
            state.final_result = result.map(str::to_string);
            state.error = error.map(str::to_string);
            state.elapsed_seconds = state.start_time.elapsed().as_secs();

            let config = self.get_chat_config(state.chat_id).await;
            let rendered = self.render_locked(state, &config);
            let reply = state.message_id.map(|message_id| {
                (
                    state.chat_id,
                    message_id,
                    completion_reply(state, &config, status, result, error, files_changed),
                )
            });
            (rendered, reply)
        };

        self.push_edit(rendered).await;

        if let Some((chat_id, message_id, text)) = reply {
            if let Err(e) = self.chat.reply_to_message(chat_id, message_id, &text).await {
                warn!(job_id, error = %e, "completion reply failed");
            }
            self.limiter.cleanup(message_id).await;
        }

        self.trackers.lock().await.remove(job_id);
        info!(job_id, "tracker completed");
    }

    /// Snapshot of a tracker's state.
    pub async fn tracker(&self, job_id: &str) -> Option<TrackerState> {
        self.trackers.lock().await.get(job_id).cloned()
    }

    fn render_locked(
        &self,
        state: &TrackerState,
        config: &TrackerConfig,
    ) -> Option<(i64, i64, String, crate::chat::Keyboard)> {
        let message_id = state.message_id?;
        let (text, keyboard) = TrackerRenderer::new(config.clone()).render(state);
        Some((state.chat_id, message_id, text, keyboard))
    }

    async fn push_edit(&self, rendered: Option<(i64, i64, String, crate::chat::Keyboard)>) {
        let Some((chat_id, message_id, text, keyboard)) = rendered else {
            return;
        };
        self.limiter.acquire(message_id).await;
        match self
            .chat
            .edit_message(chat_id, message_id, &text, Some(&keyboard))
            .await
        {
            Ok(()) | Err(ChatError::NotModified) => {}
            Err(e) => warn!(message_id, error = %e, "tracker edit failed"),
        }
    }
}

/// The event filter: which events survive into the rendered buffer.
fn should_include(event: &SessionEvent, config: &TrackerConfig) -> bool {
    match &event.kind {
        EventKind::Speech { .. } => config.show_ai_speech,
        EventKind::Thinking { .. } => config.show_ai_thinking,
        EventKind::ToolStart { tool_name, .. } => {
            if !config.show_tool_start {
                return false;
            }
            if let Some(whitelist) = &config.tool_whitelist {
                if !whitelist.is_empty() && !whitelist.iter().any(|t| t == tool_name) {
                    return false;
                }
            }
            !config.tool_blacklist.iter().any(|t| t == tool_name)
        }
        EventKind::ToolResult {
            tool_name,
            is_error,
            ..
        } => {
            if *is_error {
                return config.show_tool_errors;
            }
            config.show_tool_result || config.show_result_for_tools.iter().any(|t| t == tool_name)
        }
        EventKind::ApprovalPending { .. } => config.show_approvals,
        // System events always pass.
        EventKind::SystemInit { .. } | EventKind::SystemResult { .. } => true,
    }
}

fn update_stats(state: &mut TrackerState, event: &SessionEvent) {
    match &event.kind {
        EventKind::ToolStart { .. } => {
            if let Some(path) = event.file_path() {
                state.files_touched.insert(path.to_string());
            }
        }
        EventKind::SystemResult {
            num_turns,
            cost_usd,
            input_tokens,
            output_tokens,
            ..
        } => {
            state.turn_count = *num_turns;
            state.cost_usd = cost_usd.unwrap_or(0.0);
            state.input_tokens = *input_tokens;
            state.output_tokens = *output_tokens;
        }
        _ => {}
    }
    state.elapsed_seconds = state.start_time.elapsed().as_secs();
}

/// Build the sibling completion message posted under the tracker.
fn completion_reply(
    state: &TrackerState,
    config: &TrackerConfig,
    status: TrackerStatus,
    result: Option<&str>,
    error: Option<&str>,
    files_changed: Option<&[String]>,
) -> String {
    let (icon, title, body) = match status {
        TrackerStatus::Done => {
            let mut body_parts: Vec<String> = Vec::new();

            if let Some(files) = files_changed.filter(|f| !f.is_empty()) {
                let count = files.len();
                let plural = if count == 1 { "" } else { "s" };
                body_parts.push(format!("📝 Modified {count} file{plural}"));
                for file in files.iter().take(3) {
                    let short = if file.chars().count() <= 40 {
                        file.clone()
                    } else {
                        let tail: String =
                            file.chars().skip(file.chars().count() - 37).collect();
                        format!("...{tail}")
                    };
                    body_parts.push(format!("   • `{short}`"));
                }
                if count > 3 {
                    body_parts.push(format!("   _...and {} more_", count - 3));
                }
            }

            if let Some(result) = result.filter(|r| !r.is_empty()) {
                let mut summary: String = result.chars().take(200).collect();
                if result.chars().count() > 200 {
                    summary.push_str("...");
                }
                body_parts.push(format!("\n💬 _{summary}_"));
            }

            let body = if body_parts.is_empty() {
                "Task completed successfully.".to_string()
            } else {
                body_parts.join("\n")
            };
            ("✅", "Job Completed", body)
        }
        TrackerStatus::Failed => {
            let error = error.unwrap_or("Unknown error");
            let mut shown: String = error.chars().take(200).collect();
            if error.chars().count() > 200 {
                shown.push_str("...");
            }
            ("❌", "Job Failed", format!("_{shown}_"))
        }
        _ => ("⏹️", "Job Cancelled", "The job was cancelled.".to_string()),
    };

    let mut stats_parts: Vec<String> = Vec::new();
    if state.elapsed_seconds > 0 {
        let (mins, secs) = (state.elapsed_seconds / 60, state.elapsed_seconds % 60);
        if mins > 0 {
            stats_parts.push(format!("⏱️ {mins}m {secs}s"));
        } else {
            stats_parts.push(format!("⏱️ {secs}s"));
        }
    }
    if state.turn_count > 0 {
        stats_parts.push(format!("🔄 {} turns", state.turn_count));
    }
    if config.show_cost && state.cost_usd > 0.0 {
        stats_parts.push(format!("💰 ${:.3}", state.cost_usd));
    }

    let mut text = format!("{icon} *{title}*\n\n{body}");
    if !stats_parts.is_empty() {
        text.push_str(&format!("\n\n{}", stats_parts.join(" • ")));
    }
    text.push_str(&format!(
        "\n\n`/summary {0}` • `/tail {0}`",
        state.job_id
    ));
    text
}

// ── Runner sink adapter ───────────────────────────────────────────────────────

/// Wires the runner's callbacks into the tracker manager.
pub struct TrackerSink {
    manager: Arc<TrackerManager>,
}

impl TrackerSink {
    pub fn new(manager: Arc<TrackerManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl JobSink for TrackerSink {
    async fn on_event(&self, job_id: &str, event: &SessionEvent) {
        self.manager.add_event(job_id, event).await;
    }

    async fn on_progress(&self, job_id: &str, progress: &JobProgress) {
        self.manager.tick(job_id, progress.elapsed_seconds).await;
    }

    async fn on_approval_needed(&self, job_id: &str, _request: &ControlRequest) {
        self.manager
            .set_status(job_id, TrackerStatus::WaitingApproval)
            .await;
    }

    async fn on_complete(&self, job: &Job) {
        let status = match job.status {
            JobStatus::Done => TrackerStatus::Done,
            JobStatus::Failed => TrackerStatus::Failed,
            JobStatus::Canceled => TrackerStatus::Cancelled,
            _ => return,
        };
        self.manager
            .complete(
                &job.job_id,
                status,
                job.result_summary.as_deref(),
                job.error.as_deref(),
                job.files_changed.as_deref(),
            )
            .await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
