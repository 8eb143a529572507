// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeSet;
use std::sync::OnceLock;
use std::time::Instant;

use regex::Regex;

use televibe_protocol::{get_tool_icon, get_tool_verb, EventKind, SessionEvent};

use crate::chat::{Button, Keyboard};
use crate::config::{ToolDisplayMode, TrackerConfig};

/// Hard ceiling on the rendered message, matching the chat transport limit.
const MAX_MESSAGE_CHARS: usize = 4000;
/// Where the text is cut when it would exceed the ceiling.
const TRUNCATE_AT: usize = 3950;

/// Tools whose consecutive repeats fold into one `×N` line.
const READ_LIKE_TOOLS: [&str; 3] = ["Read", "Glob", "Grep"];

/// Lifecycle of a tracker, separate from the job status enum because the
/// tracker also has a pre-running `Starting` phase while the initial message
/// is being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerStatus {
    Starting,
    Running,
    WaitingApproval,
    Done,
    Failed,
    Cancelled,
}

impl TrackerStatus {
    pub fn icon(&self) -> &'static str {
        match self {
            TrackerStatus::Starting => "🔄",
            TrackerStatus::Running => "🔧",
            TrackerStatus::WaitingApproval => "⏸️",
            TrackerStatus::Done => "✅",
            TrackerStatus::Failed => "❌",
            TrackerStatus::Cancelled => "⏹️",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TrackerStatus::Done | TrackerStatus::Failed | TrackerStatus::Cancelled
        )
    }
}

/// Live view state for one job.  Allocated when the tracker message is
/// created and freed after the terminal render and completion reply.
#[derive(Debug, Clone)]
pub struct TrackerState {
    pub job_id: String,
    pub session_id: String,
    pub project_name: String,
    pub instruction: String,

    pub chat_id: i64,
    pub message_id: Option<i64>,

    /// Filtered, append-only event buffer.
    pub events: Vec<SessionEvent>,

    pub start_time: Instant,
    pub elapsed_seconds: u64,
    pub files_touched: BTreeSet<String>,
    pub turn_count: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,

    pub status: TrackerStatus,
    pub final_result: Option<String>,
    pub error: Option<String>,

    pub updates_paused: bool,
}

impl TrackerState {
    pub fn new(
        job_id: impl Into<String>,
        session_id: impl Into<String>,
        project_name: impl Into<String>,
        instruction: impl Into<String>,
        chat_id: i64,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            session_id: session_id.into(),
            project_name: project_name.into(),
            instruction: instruction.into(),
            chat_id,
            message_id: None,
            events: Vec::new(),
            start_time: Instant::now(),
            elapsed_seconds: 0,
            files_touched: BTreeSet::new(),
            turn_count: 0,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            status: TrackerStatus::Starting,
            final_result: None,
            error: None,
            updates_paused: false,
        }
    }
}

/// One line of the event log: either a single event or a folded run of
/// read-like tool starts.
enum DisplayItem<'a> {
    Event(&'a SessionEvent),
    Collapsed { tool: &'a str, count: usize },
}

/// Renders a [`TrackerState`] to message text plus an inline keyboard.
pub struct TrackerRenderer {
    config: TrackerConfig,
}

impl TrackerRenderer {
    pub fn new(config: TrackerConfig) -> Self {
        Self { config }
    }

    pub fn render(&self, state: &TrackerState) -> (String, Keyboard) {
        let mut parts: Vec<String> = Vec::new();

        parts.push(self.render_header(state));
        parts.push(String::new());

        if let Some(event_log) = self.render_events(&state.events) {
            parts.push(event_log);
            parts.push(String::new());
        }

        if state.status == TrackerStatus::Running && self.config.show_progress_bar {
            parts.push(self.render_progress_bar(state));
        }

        if let Some(stats) = self.render_stats(state) {
            parts.push(stats);
        }

        if state.status.is_terminal() {
            parts.push(self.render_completion(state));
        }

        let mut text = parts.join("\n");
        if text.chars().count() > MAX_MESSAGE_CHARS {
            text = text.chars().take(TRUNCATE_AT).collect::<String>() + "\n\n_...truncated_";
        }

        (text, self.render_keyboard(state))
    }

    fn render_header(&self, state: &TrackerState) -> String {
        let mut instr: String = state.instruction.chars().take(40).collect();
        if state.instruction.chars().count() > 40 {
            instr.push_str("...");
        }
        format!(
            "{} *Job* `{}` • `{}` ({})\n📝 _{instr}_",
            state.status.icon(),
            state.job_id,
            state.session_id,
            state.project_name
        )
    }

    fn render_events(&self, events: &[SessionEvent]) -> Option<String> {
        if events.is_empty() {
            return None;
        }

        let mut lines: Vec<String> = Vec::new();
        let max_events = self.config.max_events_displayed;
        let window_start = events.len().saturating_sub(max_events);
        if window_start > 0 {
            lines.push(format!("_...{window_start} earlier_"));
        }
        let window: Vec<&SessionEvent> = events[window_start..].iter().collect();

        let items = if self.config.collapse_repeated_tools {
            collapse_repeated(&window)
        } else {
            window.into_iter().map(DisplayItem::Event).collect()
        };

        for item in items {
            if let Some(line) = self.render_item(&item) {
                lines.push(line);
            }
        }

        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }

    fn render_item(&self, item: &DisplayItem) -> Option<String> {
        match item {
            DisplayItem::Collapsed { tool, count } => {
                Some(format!("{} {tool} ×{count}", get_tool_icon(tool)))
            }
            DisplayItem::Event(event) => self.render_event(event),
        }
    }

    fn render_event(&self, event: &SessionEvent) -> Option<String> {
        match &event.kind {
            EventKind::Speech { text } => {
                if !self.config.show_ai_speech {
                    return None;
                }
                let max = self.config.ai_speech_max_length;
                let mut shown: String = if max > 0 {
                    text.chars().take(max).collect()
                } else {
                    text.clone()
                };
                if max > 0 && text.chars().count() > max {
                    shown.push_str("...");
                }
                let shown = shown.replace('_', "\\_").replace('*', "\\*");
                Some(format!("💬 _{shown}_"))
            }

            EventKind::Thinking { thinking } => {
                if !self.config.show_ai_thinking {
                    return None;
                }
                let shown: String = thinking.chars().take(80).collect();
                Some(format!("🧠 _{shown}..._"))
            }

            EventKind::ToolStart { .. } => {
                if !self.config.show_tool_start {
                    return None;
                }
                Some(self.render_tool_start(event))
            }

            EventKind::ToolResult {
                tool_name,
                result,
                is_error,
                ..
            } => {
                if *is_error && self.config.show_tool_errors {
                    let shown: String = result.chars().take(80).collect();
                    return Some(format!("   └─ ❌ {shown}"));
                }
                let show_for_tool = self
                    .config
                    .show_result_for_tools
                    .iter()
                    .any(|t| t == tool_name);
                if !self.config.show_tool_result && !show_for_tool {
                    return None;
                }
                self.render_tool_result(tool_name, result)
            }

            EventKind::ApprovalPending { tool_name, .. } => {
                if !self.config.show_approvals {
                    return None;
                }
                Some(format!(
                    "⏸️ *Waiting*: {} {tool_name}",
                    get_tool_icon(tool_name)
                ))
            }

            // System events pass the filter but carry no log line of their
            // own; they feed the stats instead.
            EventKind::SystemInit { .. } | EventKind::SystemResult { .. } => None,
        }
    }

    fn render_tool_start(&self, event: &SessionEvent) -> String {
        let tool_name = event.tool_name().unwrap_or_default();
        let icon = get_tool_icon(tool_name);
        if self.config.tool_display_mode == ToolDisplayMode::Minimal {
            return icon.to_string();
        }

        let mut parts = vec![icon.to_string(), get_tool_verb(tool_name).to_string()];

        if self.config.show_file_paths && event.file_path().is_some() {
            let path = self.truncate_path(event.file_path().unwrap_or_default());
            parts.push(format!("`{path}`"));
        } else if self.config.show_bash_commands && event.command().is_some() {
            let command = event.command().unwrap_or_default();
            let max = self.config.bash_command_max_length;
            let mut shown: String = command.chars().take(max).collect();
            if command.chars().count() > max {
                shown.push_str("...");
            }
            parts.push(format!("`{shown}`"));
        } else if let Some(pattern) = event.pattern() {
            parts.push(format!("`{}`", pattern.chars().take(30).collect::<String>()));
        } else if let Some(url) = event.url() {
            let mut shown: String = url.chars().take(40).collect();
            if url.chars().count() > 40 {
                shown.push_str("...");
            }
            parts.push(shown);
        } else if let Some(query) = event.query() {
            parts.push(format!("\"{}\"", query.chars().take(30).collect::<String>()));
        } else if let Some(description) = event.description() {
            parts.push(description.chars().take(40).collect());
        }

        parts.join(" ")
    }

    fn render_tool_result(&self, tool_name: &str, result: &str) -> Option<String> {
        if self.config.parse_test_output && tool_name == "Bash" {
            if let Some(parsed) = parse_test_output(result) {
                return Some(format!("   └─ {parsed}"));
            }
        }

        let max = self.config.result_max_length;
        let mut shown: String = result.chars().take(max).collect();
        if result.chars().count() > max {
            shown.push_str("...");
        }
        if shown.trim().is_empty() {
            None
        } else {
            Some(format!("   └─ {shown}"))
        }
    }

    fn truncate_path(&self, path: &str) -> String {
        if !self.config.truncate_paths {
            return path.to_string();
        }
        let max = self.config.path_max_length;
        let count = path.chars().count();
        if count <= max {
            return path.to_string();
        }
        let tail: String = path
            .chars()
            .skip(count - (max.saturating_sub(3)))
            .collect();
        format!("...{tail}")
    }

    fn render_progress_bar(&self, state: &TrackerState) -> String {
        let filled = (state.events.len() + state.turn_count as usize).min(20);
        format!("[{}{}]", "█".repeat(filled), "░".repeat(20 - filled))
    }

    fn render_stats(&self, state: &TrackerState) -> Option<String> {
        let mut parts: Vec<String> = Vec::new();

        if self.config.show_elapsed_time {
            let (mins, secs) = (state.elapsed_seconds / 60, state.elapsed_seconds % 60);
            if mins > 0 {
                parts.push(format!("⏱️ {mins}m {secs}s"));
            } else {
                parts.push(format!("⏱️ {secs}s"));
            }
        }

        if self.config.show_file_count && !state.files_touched.is_empty() {
            let count = state.files_touched.len();
            let plural = if count == 1 { "" } else { "s" };
            parts.push(format!("📝 {count} file{plural}"));
        }

        if self.config.show_turn_count && state.turn_count > 0 {
            parts.push(format!("🔄 {}", state.turn_count));
        }

        if self.config.show_token_count {
            let tokens = state.input_tokens + state.output_tokens;
            if tokens > 1000 {
                parts.push(format!("🔤 {}k", tokens / 1000));
            } else if tokens > 0 {
                parts.push(format!("🔤 {tokens}"));
            }
        }

        if self.config.show_cost && state.cost_usd > 0.0 {
            parts.push(format!("💰 ${:.3}", state.cost_usd));
        }

        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" • "))
        }
    }

    fn render_completion(&self, state: &TrackerState) -> String {
        match state.status {
            TrackerStatus::Done => {
                let result = state.final_result.as_deref().unwrap_or("Completed");
                let mut shown: String = result.chars().take(150).collect();
                if result.chars().count() > 150 {
                    shown.push_str("...");
                }
                format!("\n✅ *Done*\n_{shown}_")
            }
            TrackerStatus::Failed => {
                let error = state.error.as_deref().unwrap_or("Unknown error");
                let mut shown: String = error.chars().take(150).collect();
                if error.chars().count() > 150 {
                    shown.push_str("...");
                }
                format!("\n❌ *Failed*\n_{shown}_")
            }
            TrackerStatus::Cancelled => "\n⏹️ *Cancelled*".to_string(),
            _ => String::new(),
        }
    }

    fn render_keyboard(&self, state: &TrackerState) -> Keyboard {
        if state.status.is_terminal() {
            return Keyboard::single_row(vec![
                Button::new("📋 Summary", format!("tracker:summary:{}", state.job_id)),
                Button::new("📜 Logs", format!("tracker:logs:{}", state.job_id)),
            ]);
        }

        let pause_resume = if state.updates_paused {
            Button::new("▶️ Resume", format!("tracker:resume:{}", state.job_id))
        } else {
            Button::new("⏸️ Pause", format!("tracker:pause:{}", state.job_id))
        };
        Keyboard::single_row(vec![
            pause_resume,
            Button::new("⏹️ Cancel", format!("tracker:cancel:{}", state.job_id)),
        ])
    }
}

/// Fold consecutive same-tool starts for read-like tools into one item.
fn collapse_repeated<'a>(events: &[&'a SessionEvent]) -> Vec<DisplayItem<'a>> {
    let mut items = Vec::new();
    let mut i = 0;
    while i < events.len() {
        if let EventKind::ToolStart { tool_name, .. } = &events[i].kind {
            if READ_LIKE_TOOLS.contains(&tool_name.as_str()) {
                let mut j = i + 1;
                while j < events.len() {
                    match &events[j].kind {
                        EventKind::ToolStart { tool_name: next, .. } if next == tool_name => {
                            j += 1;
                        }
                        _ => break,
                    }
                }
                if j - i > 1 {
                    items.push(DisplayItem::Collapsed {
                        tool: tool_name,
                        count: j - i,
                    });
                    i = j;
                    continue;
                }
            }
        }
        items.push(DisplayItem::Event(events[i]));
        i += 1;
    }
    items
}

/// Extract a pass/fail summary from test-runner output.
fn parse_test_output(output: &str) -> Option<String> {
    static PASSED: OnceLock<Regex> = OnceLock::new();
    static FAILED: OnceLock<Regex> = OnceLock::new();
    static SUITE: OnceLock<Regex> = OnceLock::new();
    let passed_re = PASSED.get_or_init(|| Regex::new(r"(\d+) passed").expect("static regex"));
    let failed_re = FAILED.get_or_init(|| Regex::new(r"(\d+) failed").expect("static regex"));
    let suite_re = SUITE.get_or_init(|| Regex::new(r"Tests:\s*(\d+) passed").expect("static regex"));

    if let Some(suite) = suite_re.captures(output) {
        return Some(format!("✅ {} passed", &suite[1]));
    }
    if let Some(passed) = passed_re.captures(output) {
        if let Some(failed) = failed_re.captures(output) {
            return Some(format!("❌ {} passed, {} failed", &passed[1], &failed[1]));
        }
        return Some(format!("✅ {} passed", &passed[1]));
    }

    let lower = output.to_lowercase();
    if lower.contains("error") {
        return Some("❌ Error".to_string());
    }
    if lower.contains("success") || lower.contains("passed") {
        return Some("✅ Success".to_string());
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
