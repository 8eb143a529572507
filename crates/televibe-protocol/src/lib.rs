// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod events;
mod parser;

pub use events::{
    get_tool_icon, get_tool_verb, EventCategory, EventKind, ResultSubtype, SessionEvent,
};
pub use parser::{control_response, parse_control_request, parse_stream_events, ControlRequest};
