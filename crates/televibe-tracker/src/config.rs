// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_speech_max() -> usize {
    150
}

fn default_path_max() -> usize {
    40
}

fn default_bash_max() -> usize {
    50
}

fn default_result_max() -> usize {
    100
}

fn default_max_events() -> usize {
    10
}

fn default_update_interval() -> u64 {
    1500
}

fn default_result_for_tools() -> Vec<String> {
    vec!["Bash".to_string(), "Edit".to_string()]
}

/// How much detail a tool-start line carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolDisplayMode {
    /// Icon only.
    Minimal,
    /// Icon + verb + target.
    #[default]
    Normal,
    /// Icon + verb + target + details.
    Detailed,
}

/// Per-user configuration of which events survive into the rendered tracker
/// message and how they are displayed.  Stored as a preset name plus a JSON
/// override map; [`TrackerConfig::with_overrides`] applies the merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    // ── Category toggles ──────────────────────────────────────────────────────
    #[serde(default = "default_true")]
    pub show_ai_speech: bool,
    #[serde(default)]
    pub show_ai_thinking: bool,
    #[serde(default = "default_true")]
    pub show_tool_start: bool,
    #[serde(default)]
    pub show_tool_result: bool,
    #[serde(default = "default_true")]
    pub show_tool_errors: bool,
    #[serde(default = "default_true")]
    pub show_approvals: bool,

    // ── Tool filters ──────────────────────────────────────────────────────────
    /// Only show these tools; `None` shows all.
    #[serde(default)]
    pub tool_whitelist: Option<Vec<String>>,
    /// Never show these tools.
    #[serde(default)]
    pub tool_blacklist: Vec<String>,
    /// Show results for these tools even when `show_tool_result` is off.
    #[serde(default = "default_result_for_tools")]
    pub show_result_for_tools: Vec<String>,

    // ── Display ───────────────────────────────────────────────────────────────
    /// Max characters per speech line (0 = unlimited).
    #[serde(default = "default_speech_max")]
    pub ai_speech_max_length: usize,
    #[serde(default)]
    pub tool_display_mode: ToolDisplayMode,
    #[serde(default = "default_true")]
    pub show_file_paths: bool,
    #[serde(default = "default_true")]
    pub truncate_paths: bool,
    #[serde(default = "default_path_max")]
    pub path_max_length: usize,
    #[serde(default = "default_true")]
    pub show_bash_commands: bool,
    #[serde(default = "default_bash_max")]
    pub bash_command_max_length: usize,
    /// Parse test-runner output into a pass/fail line.
    #[serde(default = "default_true")]
    pub parse_test_output: bool,
    #[serde(default = "default_result_max")]
    pub result_max_length: usize,

    // ── Progress / stats ──────────────────────────────────────────────────────
    #[serde(default = "default_true")]
    pub show_progress_bar: bool,
    #[serde(default = "default_true")]
    pub show_elapsed_time: bool,
    #[serde(default = "default_true")]
    pub show_file_count: bool,
    #[serde(default = "default_true")]
    pub show_turn_count: bool,
    #[serde(default)]
    pub show_token_count: bool,
    #[serde(default)]
    pub show_cost: bool,

    // ── Event buffer ──────────────────────────────────────────────────────────
    /// Max events rendered; older ones scroll off behind an "earlier" marker.
    #[serde(default = "default_max_events")]
    pub max_events_displayed: usize,
    #[serde(default = "default_true")]
    pub collapse_repeated_tools: bool,

    // ── Rate limit ────────────────────────────────────────────────────────────
    /// Minimum milliseconds between in-place edits of one message.
    #[serde(default = "default_update_interval")]
    pub update_interval_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            show_ai_speech: true,
            show_ai_thinking: false,
            show_tool_start: true,
            show_tool_result: false,
            show_tool_errors: true,
            show_approvals: true,
            tool_whitelist: None,
            tool_blacklist: Vec::new(),
            show_result_for_tools: default_result_for_tools(),
            ai_speech_max_length: default_speech_max(),
            tool_display_mode: ToolDisplayMode::Normal,
            show_file_paths: true,
            truncate_paths: true,
            path_max_length: default_path_max(),
            show_bash_commands: true,
            bash_command_max_length: default_bash_max(),
            parse_test_output: true,
            result_max_length: default_result_max(),
            show_progress_bar: true,
            show_elapsed_time: true,
            show_file_count: true,
            show_turn_count: true,
            show_token_count: false,
            show_cost: false,
            max_events_displayed: default_max_events(),
            collapse_repeated_tools: true,
            update_interval_ms: default_update_interval(),
        }
    }
}

impl TrackerConfig {
    /// Apply per-key JSON overrides on top of this config.  Unknown keys and
    /// type mismatches are ignored so a stale override map cannot brick the
    /// tracker.
    pub fn with_overrides(
        &self,
        overrides: &serde_json::Map<String, serde_json::Value>,
    ) -> TrackerConfig {
        let mut value = match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => return self.clone(),
        };
        for (key, override_value) in overrides {
            if value.contains_key(key) {
                value.insert(key.clone(), override_value.clone());
            }
        }
        serde_json::from_value(serde_json::Value::Object(value)).unwrap_or_else(|_| self.clone())
    }
}

/// Named presets selectable per chat.
pub fn preset(name: &str) -> TrackerConfig {
    let base = TrackerConfig::default();
    match name.to_lowercase().as_str() {
        "minimal" => TrackerConfig {
            show_ai_speech: false,
            show_tool_result: false,
            tool_display_mode: ToolDisplayMode::Minimal,
            max_events_displayed: 5,
            show_turn_count: false,
            ..base
        },
        "verbose" => TrackerConfig {
            ai_speech_max_length: 200,
            show_tool_result: true,
            tool_display_mode: ToolDisplayMode::Detailed,
            max_events_displayed: 15,
            show_token_count: true,
            ..base
        },
        "debug" => TrackerConfig {
            show_ai_thinking: true,
            ai_speech_max_length: 0,
            show_tool_result: true,
            tool_display_mode: ToolDisplayMode::Detailed,
            max_events_displayed: 20,
            show_token_count: true,
            show_cost: true,
            ..base
        },
        "speech" => TrackerConfig {
            ai_speech_max_length: 0,
            show_tool_start: false,
            show_tool_result: false,
            max_events_displayed: 5,
            show_progress_bar: false,
            ..base
        },
        "tools" => TrackerConfig {
            show_ai_speech: false,
            show_tool_result: true,
            tool_display_mode: ToolDisplayMode::Detailed,
            max_events_displayed: 12,
            ..base
        },
        // "normal" and anything unknown.
        _ => TrackerConfig {
            ai_speech_max_length: 100,
            show_result_for_tools: vec!["Bash".to_string()],
            max_events_displayed: 8,
            ..base
        },
    }
}

pub fn preset_names() -> &'static [&'static str] {
    &["minimal", "normal", "verbose", "debug", "speech", "tools"]
}

/// Short aliases toggleable from chat commands, mapped to config keys.
pub fn toggle_alias(alias: &str) -> Option<&'static str> {
    Some(match alias {
        "ai" | "speech" => "show_ai_speech",
        "thinking" => "show_ai_thinking",
        "tools" => "show_tool_start",
        "results" => "show_tool_result",
        "errors" => "show_tool_errors",
        "approvals" => "show_approvals",
        "progress" => "show_progress_bar",
        "time" => "show_elapsed_time",
        "files" => "show_file_count",
        "turns" => "show_turn_count",
        "tokens" => "show_token_count",
        "cost" => "show_cost",
        "paths" => "show_file_paths",
        "commands" => "show_bash_commands",
        "tests" => "parse_test_output",
        _ => return None,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let c = TrackerConfig::default();
        assert!(c.show_ai_speech);
        assert!(!c.show_ai_thinking);
        assert!(c.show_tool_start);
        assert!(!c.show_tool_result);
        assert!(c.show_tool_errors);
        assert_eq!(c.ai_speech_max_length, 150);
        assert_eq!(c.max_events_displayed, 10);
        assert_eq!(c.update_interval_ms, 1500);
        assert_eq!(c.show_result_for_tools, vec!["Bash", "Edit"]);
    }

    #[test]
    fn every_preset_name_resolves() {
        for name in preset_names() {
            // Must not panic and must round-trip through serde.
            let c = preset(name);
            let json = serde_json::to_value(&c).unwrap();
            let back: TrackerConfig = serde_json::from_value(json).unwrap();
            assert_eq!(back, c);
        }
    }

    #[test]
    fn minimal_preset_hides_speech() {
        let c = preset("minimal");
        assert!(!c.show_ai_speech);
        assert_eq!(c.tool_display_mode, ToolDisplayMode::Minimal);
        assert_eq!(c.max_events_displayed, 5);
    }

    #[test]
    fn debug_preset_shows_everything() {
        let c = preset("debug");
        assert!(c.show_ai_thinking);
        assert!(c.show_cost);
        assert_eq!(c.ai_speech_max_length, 0);
    }

    #[test]
    fn unknown_preset_falls_back_to_normal() {
        assert_eq!(preset("nonsense"), preset("normal"));
    }

    #[test]
    fn overrides_win_over_preset_values() {
        let mut overrides = serde_json::Map::new();
        overrides.insert("show_cost".to_string(), serde_json::Value::Bool(true));
        overrides.insert(
            "max_events_displayed".to_string(),
            serde_json::Value::from(3),
        );

        let c = preset("normal").with_overrides(&overrides);
        assert!(c.show_cost);
        assert_eq!(c.max_events_displayed, 3);
        // Untouched keys keep preset values.
        assert_eq!(c.ai_speech_max_length, 100);
    }

    #[test]
    fn unknown_override_keys_are_ignored() {
        let mut overrides = serde_json::Map::new();
        overrides.insert("no_such_key".to_string(), serde_json::Value::Bool(true));
        let c = preset("normal").with_overrides(&overrides);
        assert_eq!(c, preset("normal"));
    }

    #[test]
    fn toggle_aliases_map_to_real_keys() {
        assert_eq!(toggle_alias("speech"), Some("show_ai_speech"));
        assert_eq!(toggle_alias("cost"), Some("show_cost"));
        assert_eq!(toggle_alias("bogus"), None);
    }
}
