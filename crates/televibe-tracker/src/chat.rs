// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    /// The edit produced identical text; benign and swallowed by callers.
    #[error("message is not modified")]
    NotModified,

    #[error("chat transport error: {0}")]
    Transport(String),
}

/// One inline action button.  `action` is an opaque callback token routed
/// back by the chat collaborator, e.g. `tracker:cancel:<job-id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub action: String,
}

impl Button {
    pub fn new(label: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            action: action.into(),
        }
    }
}

/// Inline keyboard spec attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keyboard {
    pub rows: Vec<Vec<Button>>,
}

impl Keyboard {
    pub fn single_row(buttons: Vec<Button>) -> Self {
        Self {
            rows: vec![buttons],
        }
    }

    /// Flat list of all actions, row order.
    pub fn actions(&self) -> Vec<&str> {
        self.rows
            .iter()
            .flatten()
            .map(|b| b.action.as_str())
            .collect()
    }
}

/// Interface the core consumes from the chat collaborator.  The transport
/// (Telegram or otherwise) is out of scope; implementations are assumed safe
/// for concurrent use.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Send a new message, returning its id for later edits.
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<i64, ChatError>;

    /// Edit a message in place.  May fail with [`ChatError::NotModified`]
    /// when the text is unchanged; callers ignore that case.
    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), ChatError>;

    /// Post a sibling message replying to `parent_message_id`.
    async fn reply_to_message(
        &self,
        chat_id: i64,
        parent_message_id: i64,
        text: &str,
    ) -> Result<i64, ChatError>;
}
