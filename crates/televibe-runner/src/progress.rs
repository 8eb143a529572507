// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

/// Aggregate progress for a running job, updated from the event stream and
/// pushed to the sink at most once per throttle interval.
#[derive(Debug, Clone, Default)]
pub struct JobProgress {
    pub job_id: String,
    pub status: String,
    pub elapsed_seconds: u64,
    pub files_touched: Vec<String>,
    pub current_tool: Option<String>,
    pub tool_count: usize,
    pub message_count: usize,
    pub last_message: Option<String>,
    pub error: Option<String>,
}

impl JobProgress {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: "starting".to_string(),
            ..Self::default()
        }
    }

    /// Activity-based progress bar: `min(tools + messages, 20)` of 20 cells.
    pub fn progress_bar(&self) -> String {
        let filled = (self.tool_count + self.message_count).min(20);
        format!("[{}{}]", "█".repeat(filled), "░".repeat(20 - filled))
    }

    /// Multi-line progress summary for display.
    pub fn to_progress_text(&self) -> String {
        let mut parts = vec![format!("🔧 *Running...* {}", self.progress_bar())];

        if self.elapsed_seconds > 0 {
            let (mins, secs) = (self.elapsed_seconds / 60, self.elapsed_seconds % 60);
            if mins > 0 {
                parts.push(format!("⏱️ {mins}m {secs}s"));
            } else {
                parts.push(format!("⏱️ {secs}s"));
            }
        }

        if let Some(tool) = &self.current_tool {
            parts.push(format!("🔨 {tool}"));
        }

        if !self.files_touched.is_empty() {
            let count = self.files_touched.len();
            let plural = if count == 1 { "" } else { "s" };
            parts.push(format!("📝 {count} file{plural}"));
        }

        if let Some(message) = &self.last_message {
            let mut msg: String = message.chars().take(80).collect();
            if message.chars().count() > 80 {
                msg.push_str("...");
            }
            parts.push(format!("💬 _{msg}_"));
        }

        parts.join("\n")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
