// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// High-level event categories for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    System,
    Speech,
    Thinking,
    ToolStart,
    ToolResult,
    ToolError,
    Approval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSubtype {
    #[default]
    Success,
    Error,
}

/// The closed set of events the core recognises.  Everything downstream
/// (progress accounting, tracker rendering) pattern-matches on this sum;
/// unknown stream lines never produce a variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventKind {
    /// Assistant session started.
    SystemInit {
        tools: Vec<String>,
        cwd: Option<String>,
    },
    /// Assistant session ended.
    SystemResult {
        subtype: ResultSubtype,
        is_error: bool,
        error_message: Option<String>,
        cost_usd: Option<f64>,
        num_turns: u32,
        duration_ms: u64,
        input_tokens: u64,
        output_tokens: u64,
    },
    /// Assistant text response.
    Speech { text: String },
    /// Extended reasoning content.
    Thinking { thinking: String },
    /// Tool invocation begun.
    ToolStart {
        tool_name: String,
        tool_use_id: String,
        tool_input: Value,
    },
    /// Tool completed.  `tool_name` is attached by matching `tool_use_id`
    /// against the earlier ToolStart.
    ToolResult {
        tool_use_id: String,
        tool_name: String,
        result: String,
        is_error: bool,
    },
    /// Waiting for user approval.  Produced by the approval gate, never by
    /// the stream parser.
    ApprovalPending {
        tool_name: String,
        approval_id: Option<String>,
    },
}

/// A single typed record derived from one line of assistant output,
/// enriched with the driving job and the assistant's own session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<String>,
    pub job_id: Option<String>,
    pub kind: EventKind,
}

impl SessionEvent {
    pub fn new(kind: EventKind, session_id: Option<String>, job_id: Option<String>) -> Self {
        Self {
            event_id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            timestamp: Utc::now(),
            session_id,
            job_id,
            kind,
        }
    }

    pub fn category(&self) -> EventCategory {
        match &self.kind {
            EventKind::SystemInit { .. } | EventKind::SystemResult { .. } => EventCategory::System,
            EventKind::Speech { .. } => EventCategory::Speech,
            EventKind::Thinking { .. } => EventCategory::Thinking,
            EventKind::ToolStart { .. } => EventCategory::ToolStart,
            EventKind::ToolResult { is_error: true, .. } => EventCategory::ToolError,
            EventKind::ToolResult { .. } => EventCategory::ToolResult,
            EventKind::ApprovalPending { .. } => EventCategory::Approval,
        }
    }

    /// Tool name for tool-start / tool-result / approval events.
    pub fn tool_name(&self) -> Option<&str> {
        match &self.kind {
            EventKind::ToolStart { tool_name, .. }
            | EventKind::ToolResult { tool_name, .. }
            | EventKind::ApprovalPending { tool_name, .. } => Some(tool_name),
            _ => None,
        }
    }

    fn tool_input_str(&self, key: &str) -> Option<&str> {
        match &self.kind {
            EventKind::ToolStart { tool_input, .. } => tool_input.get(key)?.as_str(),
            _ => None,
        }
    }

    /// File path for file operations (Read / Write / Edit…).
    pub fn file_path(&self) -> Option<&str> {
        self.tool_input_str("file_path")
    }

    /// Command for Bash operations.
    pub fn command(&self) -> Option<&str> {
        self.tool_input_str("command")
    }

    /// Pattern for Grep / Glob.
    pub fn pattern(&self) -> Option<&str> {
        self.tool_input_str("pattern")
    }

    /// URL for WebFetch.
    pub fn url(&self) -> Option<&str> {
        self.tool_input_str("url")
    }

    /// Query for WebSearch.
    pub fn query(&self) -> Option<&str> {
        self.tool_input_str("query")
    }

    pub fn description(&self) -> Option<&str> {
        self.tool_input_str("description")
    }
}

/// Display icon for a tool.
pub fn get_tool_icon(tool_name: &str) -> &'static str {
    match tool_name {
        "Read" => "📖",
        "Write" => "📝",
        "Edit" | "MultiEdit" => "✏️",
        "Bash" => "🔨",
        "Grep" => "🔍",
        "Glob" => "📂",
        "WebFetch" => "🌐",
        "WebSearch" => "🔎",
        "TodoWrite" | "TodoRead" => "📋",
        "Task" => "🤖",
        "NotebookEdit" | "NotebookRead" => "📓",
        _ => "🔧",
    }
}

/// Display verb for a tool; unknown tools fall back to their own name.
pub fn get_tool_verb(tool_name: &str) -> &str {
    match tool_name {
        "Read" => "Reading",
        "Write" => "Creating",
        "Edit" | "MultiEdit" => "Editing",
        "Bash" => "Running",
        "Grep" => "Searching",
        "Glob" => "Finding",
        "WebFetch" => "Fetching",
        "WebSearch" => "Searching",
        "TodoWrite" => "Updating tasks",
        "TodoRead" => "Checking tasks",
        "Task" => "Spawning agent",
        "NotebookEdit" => "Editing notebook",
        "NotebookRead" => "Reading notebook",
        other => other,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
