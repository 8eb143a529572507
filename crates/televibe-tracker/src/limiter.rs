// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Default)]
struct MessageGate {
    last_edit: Option<Instant>,
}

/// Rate limiter for in-place message edits.
///
/// Chat APIs throttle edits to roughly one per second per message.  Each
/// message gets its own gate: concurrent callers serialize through the gate
/// mutex, and a caller arriving inside the minimum interval sleeps out the
/// remainder before its edit slot is stamped.
pub struct EditRateLimiter {
    min_interval: Duration,
    gates: Mutex<HashMap<i64, Arc<Mutex<MessageGate>>>>,
}

impl EditRateLimiter {
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            min_interval: Duration::from_millis(min_interval_ms),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until this caller may edit `message_id`, then claim the slot.
    pub async fn acquire(&self, message_id: i64) {
        let gate = {
            let mut gates = self.gates.lock().await;
            gates.entry(message_id).or_default().clone()
        };

        let mut gate = gate.lock().await;
        if let Some(last) = gate.last_edit {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        gate.last_edit = Some(Instant::now());
    }

    /// Drop tracking for a message once its tracker completes.
    pub async fn cleanup(&self, message_id: i64) {
        self.gates.lock().await.remove(&message_id);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
