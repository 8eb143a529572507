// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid {field} value: {value:?}")]
    InvalidValue { field: &'static str, value: String },

    #[error("corrupt json column {column}: {source}")]
    Json {
        column: &'static str,
        source: serde_json::Error,
    },

    #[error("corrupt timestamp column {column}: {value:?}")]
    Timestamp { column: &'static str, value: String },
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity,
            id: id.into(),
        }
    }
}
