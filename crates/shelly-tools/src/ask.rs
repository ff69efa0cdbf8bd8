// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Front-end callback interfaces.
//!
//! The terminal/TUI that actually renders a question or a notification to
//! the human is deliberately outside this crate — these traits are the only
//! contract the safety-gated handlers need. A headless embedding (CI, a
//! test harness) can supply a trivial always-deny or always-yes
//! implementation without pulling in any UI code.

use async_trait::async_trait;

/// Presents a question with a fixed set of options and returns the option
/// the user chose, matched case-insensitively by the caller.
#[async_trait]
pub trait AskCallback: Send + Sync {
    async fn ask(&self, question: &str, options: &[&str]) -> anyhow::Result<String>;
}

/// Fire-and-forget notification; never blocks the caller.
pub trait NotifyCallback: Send + Sync {
    fn notify(&self, message: &str);
}

/// An [`AskCallback`] that always returns the first option, for headless
/// embeddings that want every gated operation to succeed without a human.
pub struct AutoApprove;

#[async_trait]
impl AskCallback for AutoApprove {
    async fn ask(&self, _question: &str, options: &[&str]) -> anyhow::Result<String> {
        options.first().map(|s| s.to_string()).ok_or_else(|| anyhow::anyhow!("no options offered"))
    }
}

/// An [`AskCallback`] that always denies, for sandboxed/CI runs where no
/// interactive approval is possible.
pub struct AutoDeny;

#[async_trait]
impl AskCallback for AutoDeny {
    async fn ask(&self, _question: &str, _options: &[&str]) -> anyhow::Result<String> {
        Ok("no".to_string())
    }
}

/// A [`NotifyCallback`] that discards every message; used where the
/// embedding has no UI surface worth writing to (tests, headless CI).
pub struct NullNotify;

impl NotifyCallback for NullNotify {
    fn notify(&self, _message: &str) {}
}
