// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod chat;
mod config;
mod limiter;
mod manager;
mod renderer;

pub use chat::{Button, ChatApi, ChatError, Keyboard};
pub use config::{preset, preset_names, toggle_alias, ToolDisplayMode, TrackerConfig};
pub use limiter::EditRateLimiter;
pub use manager::{TrackerManager, TrackerSink};
pub use renderer::{TrackerRenderer, TrackerState, TrackerStatus};
