// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! An ambient per-session flag that, once set, suppresses per-file diff
//! confirmation prompts for the rest of the conversation (the front-end is
//! still notified, just not asked). The flag is one-way: it can move from
//! untrusted to trusted but never back, and absence of a flag is always
//! equivalent to untrusted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A mutable trust flag, shared by cloning the handle.
#[derive(Clone, Default)]
pub struct SessionTrust(Arc<AtomicBool>);

impl SessionTrust {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_trusted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Flip the flag to trusted. Idempotent; never clears it back.
    pub fn grant(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_untrusted() {
        let t = SessionTrust::new();
        assert!(!t.is_trusted());
    }

    #[test]
    fn grant_is_visible_through_clones() {
        let t = SessionTrust::new();
        let t2 = t.clone();
        t.grant();
        assert!(t2.is_trusted());
    }

    #[test]
    fn grant_is_one_way() {
        let t = SessionTrust::new();
        t.grant();
        // no API to un-grant; re-granting is a no-op
        t.grant();
        assert!(t.is_trusted());
    }

    #[test]
    fn default_is_untrusted() {
        let t = SessionTrust::default();
        assert!(!t.is_trusted());
    }
}
