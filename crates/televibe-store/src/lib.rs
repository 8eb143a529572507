// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod error;
mod models;
mod store;

pub use error::StoreError;
pub use models::{
    short_id, Approval, ApprovalState, ApprovalType, ExecutionMode, Job, JobStatus, Project,
    Session, SessionState, Task, TaskPriority, TaskStatus, UserPreferences,
};
pub use store::Store;
