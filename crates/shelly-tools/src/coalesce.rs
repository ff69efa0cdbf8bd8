// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Collapses concurrent identical approval prompts into a single user-facing
//! question.
//!
//! When two tool calls race to ask about the same resource (e.g. two writes
//! under an unapproved directory, or two invocations of an untrusted
//! command), only the first caller actually invokes the ask callback; later
//! callers wait on a broadcast of its answer. The map entry is removed the
//! moment the answer is delivered, so the next prompt for that key starts
//! fresh rather than replaying a stale decision.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

/// The outcome of a coalesced prompt, shared with every waiter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromptOutcome {
    /// Permanent trust was granted; waiters may proceed without re-asking.
    Trusted,
    /// A one-shot approval whose applicability to a *different* request is
    /// unknown; waiters must re-prompt individually.
    OneShot,
    /// Denied; every waiter receives the same denial.
    Denied,
}

enum Slot {
    Pending(broadcast::Sender<PromptOutcome>),
}

/// Keyed coalescer: one pending-prompt slot per resource identity.
#[derive(Default)]
pub struct PromptCoalescer {
    pending: Mutex<HashMap<String, Slot>>,
}

/// What a caller should do after calling [`PromptCoalescer::join`].
pub enum Role {
    /// This caller is first; it must invoke the ask callback itself and then
    /// call [`PromptCoalescer::resolve`] with the outcome.
    Leader,
    /// This caller arrived while another was already prompting; it receives
    /// the leader's outcome once available.
    Follower(broadcast::Receiver<PromptOutcome>),
}

impl PromptCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `key`. The first caller becomes the leader and
    /// must eventually call [`resolve`](Self::resolve); every subsequent
    /// caller for the same key becomes a follower until that happens.
    pub fn join(&self, key: &str) -> Role {
        let mut pending = self.pending.lock().expect("coalescer lock poisoned");
        if let Some(Slot::Pending(tx)) = pending.get(key) {
            return Role::Follower(tx.subscribe());
        }
        let (tx, _rx) = broadcast::channel(1);
        pending.insert(key.to_string(), Slot::Pending(tx));
        Role::Leader
    }

    /// Deliver the leader's outcome to every waiting follower and clear the
    /// slot so the next prompt for this key is fresh.
    pub fn resolve(&self, key: &str, outcome: PromptOutcome) {
        let slot = self.pending.lock().expect("coalescer lock poisoned").remove(key);
        if let Some(Slot::Pending(tx)) = slot {
            let _ = tx.send(outcome);
        }
    }
}
