// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

use televibe_store::StoreError;
use televibe_workspace::GitError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("session {session_id} already has an active job")]
    Busy {
        session_id: String,
        job_id: Option<String>,
    },

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        SessionError::NotFound {
            entity,
            id: id.into(),
        }
    }
}
