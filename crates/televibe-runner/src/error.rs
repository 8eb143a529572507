// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

use televibe_store::{JobStatus, StoreError};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("session {session_id} already has an active job")]
    Busy {
        session_id: String,
        job_id: Option<String>,
    },

    #[error("at capacity: {running} of {max} jobs running")]
    Capacity { running: usize, max: usize },

    #[error("job '{job_id}' is already {status}")]
    Terminal { job_id: String, status: JobStatus },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        RunnerError::NotFound {
            entity,
            id: id.into(),
        }
    }
}
