// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use tokio::sync::{oneshot, Mutex};
use tracing::debug;

/// Resolution of a pending approval, delivered back into the waiting job
/// task.
#[derive(Debug, Clone)]
pub enum ApprovalDecision {
    Allow {
        by: String,
    },
    Deny {
        by: String,
        reason: Option<String>,
    },
}

impl ApprovalDecision {
    /// The cancellation error recorded on a denied job.
    pub fn denial_error(&self) -> Option<String> {
        match self {
            ApprovalDecision::Allow { .. } => None,
            ApprovalDecision::Deny { by, reason } => Some(match reason {
                Some(r) => format!("Denied by {by}: {r}"),
                None => format!("Denied by {by}"),
            }),
        }
    }
}

/// One-shot rendezvous between a job task suspended on an approval and the
/// approval gate that resolves it.  Pending approvals survive restarts in
/// the store; this bridge only carries the in-process wakeup.
#[derive(Default)]
pub struct ApprovalBridge {
    waiters: Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>,
}

impl ApprovalBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the waiting job and return the receiver its task awaits.
    /// A second registration for the same job replaces the first (the old
    /// receiver resolves as closed).
    pub async fn register(&self, job_id: &str) -> oneshot::Receiver<ApprovalDecision> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(job_id.to_string(), tx);
        rx
    }

    /// Deliver a decision to the waiting job.  Returns false when no task
    /// is waiting (job already finished or process restarted since).
    pub async fn resolve(&self, job_id: &str, decision: ApprovalDecision) -> bool {
        match self.waiters.lock().await.remove(job_id) {
            Some(tx) => tx.send(decision).is_ok(),
            None => {
                debug!(job_id, "no waiter registered for approval resolution");
                false
            }
        }
    }

    /// Drop the waiter without a decision (job canceled while suspended).
    pub async fn abandon(&self, job_id: &str) {
        self.waiters.lock().await.remove(job_id);
    }

    pub async fn is_waiting(&self, job_id: &str) -> bool {
        self.waiters.lock().await.contains_key(job_id)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_wakes_registered_waiter() {
        let bridge = ApprovalBridge::new();
        let rx = bridge.register("j1").await;
        assert!(bridge.is_waiting("j1").await);

        assert!(bridge.resolve("j1", ApprovalDecision::Allow { by: "user".into() }).await);
        match rx.await.unwrap() {
            ApprovalDecision::Allow { by } => assert_eq!(by, "user"),
            other => panic!("unexpected decision: {other:?}"),
        }
        assert!(!bridge.is_waiting("j1").await);
    }

    #[tokio::test]
    async fn resolve_without_waiter_reports_false() {
        let bridge = ApprovalBridge::new();
        assert!(
            !bridge
                .resolve("ghost", ApprovalDecision::Allow { by: "user".into() })
                .await
        );
    }

    #[test]
    fn denial_error_includes_reason_when_present() {
        let with_reason = ApprovalDecision::Deny {
            by: "user".into(),
            reason: Some("no".into()),
        };
        assert_eq!(with_reason.denial_error().as_deref(), Some("Denied by user: no"));

        let without = ApprovalDecision::Deny {
            by: "user".into(),
            reason: None,
        };
        assert_eq!(without.denial_error().as_deref(), Some("Denied by user"));

        let allow = ApprovalDecision::Allow { by: "user".into() };
        assert!(allow.denial_error().is_none());
    }
}
