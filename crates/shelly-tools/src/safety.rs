// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Ties the permission store, file locker, session trust flag and prompt
//! coalescer together into the single safety-gating algorithm that every
//! mutating filesystem handler runs before touching disk.
//!
//! This module is the concrete form of the pattern described for
//! `write`/`edit_file`/`delete_file`: resolve the path, make sure its
//! directory is approved (prompting once per concurrent burst of identical
//! asks), confirm the actual content change unless the session has already
//! opted out of per-file confirmation, then hand the caller a lock guard to
//! perform the I/O under.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::ask::{AskCallback, NotifyCallback};
use crate::coalesce::{PromptCoalescer, PromptOutcome, Role};
use crate::locker::{PairGuard, PathGuard, PathLocker};
use crate::permission::PermissionStore;
use crate::session_trust::SessionTrust;

/// Bundles the four collaborating safety-kernel pieces (permission store,
/// file locker, session trust flag, prompt coalescer) plus the front-end
/// callbacks, so tool handlers can be constructed with a single shared
/// handle instead of four separate ones.
pub struct SafetyKernel {
    pub store: Arc<PermissionStore>,
    pub locker: Arc<PathLocker>,
    pub session_trust: SessionTrust,
    coalescer: PromptCoalescer,
    ask: Arc<dyn AskCallback>,
    notify: Arc<dyn NotifyCallback>,
}

impl SafetyKernel {
    pub fn new(
        store: Arc<PermissionStore>,
        ask: Arc<dyn AskCallback>,
        notify: Arc<dyn NotifyCallback>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            locker: PathLocker::new(),
            session_trust: SessionTrust::new(),
            coalescer: PromptCoalescer::new(),
            ask,
            notify,
        })
    }

    /// Resolve `p` to an absolute path, compute the directory it is guarded
    /// by (itself if it's an existing directory, its parent otherwise), and
    /// make sure that directory — and, if the path resolves through
    /// symlinks, the real directory too — is approved. Returns the absolute
    /// path on success.
    pub async fn guard_path(&self, p: impl AsRef<Path>) -> Result<PathBuf, SafetyDenial> {
        let raw = p.as_ref();
        let absolute = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|e| SafetyDenial::Io(e.to_string()))?
                .join(raw)
        };

        let guarded_dir = if absolute.is_dir() {
            absolute.clone()
        } else {
            absolute.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("/"))
        };

        self.ensure_dir_approved(&guarded_dir).await?;

        // If the path already exists, re-derive the guarded directory from
        // its canonical (symlink-resolved) form and re-approve if it names a
        // different real directory.
        if let Ok(real) = absolute.canonicalize() {
            let real_dir = if real.is_dir() {
                real.clone()
            } else {
                real.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("/"))
            };
            if real_dir != guarded_dir {
                self.ensure_dir_approved(&real_dir).await?;
            }
        }

        Ok(absolute)
    }

    async fn ensure_dir_approved(&self, dir: &Path) -> Result<(), SafetyDenial> {
        if self.store.is_dir_approved(dir) {
            return Ok(());
        }

        let key = format!("dir:{}", dir.display());
        match self.coalescer.join(&key) {
            Role::Leader => {
                let question =
                    format!("Allow file operations in {}?", dir.display());
                let answer = self
                    .ask
                    .ask(&question, &["yes", "no"])
                    .await
                    .map_err(|e| SafetyDenial::AskFailed(e.to_string()))?;
                let granted = answer.eq_ignore_ascii_case("yes");
                if granted {
                    self.store
                        .approve_dir(dir)
                        .map_err(|e| SafetyDenial::Io(e.to_string()))?;
                }
                self.coalescer.resolve(
                    &key,
                    if granted { PromptOutcome::Trusted } else { PromptOutcome::Denied },
                );
                if granted {
                    Ok(())
                } else {
                    Err(SafetyDenial::DirectoryNotApproved(dir.to_path_buf()))
                }
            }
            Role::Follower(mut rx) => match rx.recv().await {
                Ok(PromptOutcome::Trusted) => Ok(()),
                Ok(PromptOutcome::Denied) => {
                    Err(SafetyDenial::DirectoryNotApproved(dir.to_path_buf()))
                }
                Ok(PromptOutcome::OneShot) | Err(_) => {
                    // Re-prompt individually: the leader's answer doesn't
                    // necessarily transfer (or the channel was dropped).
                    Box::pin(self.ensure_dir_approved(dir)).await
                }
            },
        }
    }

    /// Confirm a content change at `path` given a unified diff (empty old
    /// content for new files). Honors session trust: once granted, changes
    /// are merely notified, never blocked on a prompt.
    pub async fn confirm_change(&self, path: &Path, diff: &str) -> Result<(), SafetyDenial> {
        if self.session_trust.is_trusted() {
            self.notify.notify(&format!("applying change to {} (session trusted)\n{diff}", path.display()));
            return Ok(());
        }

        let question = format!("Apply this change to {}?\n{diff}", path.display());
        let answer = self
            .ask
            .ask(&question, &["yes", "no", "trust this session"])
            .await
            .map_err(|e| SafetyDenial::AskFailed(e.to_string()))?;

        if answer.eq_ignore_ascii_case("trust this session") {
            self.session_trust.grant();
            Ok(())
        } else if answer.eq_ignore_ascii_case("yes") {
            Ok(())
        } else {
            Err(SafetyDenial::ChangeDenied(path.to_path_buf()))
        }
    }

    /// Resolve whether `domain` may be contacted, prompting (coalesced across
    /// concurrent callers asking about the same domain) when untrusted. A
    /// `"trust"` answer persists via [`PermissionStore::trust_domain`]; a
    /// one-shot `"yes"` allows only this call.
    pub async fn authorize_domain(&self, domain: &str) -> Result<(), SafetyDenial> {
        if self.store.is_domain_trusted(domain) {
            return Ok(());
        }

        let key = format!("domain:{domain}");
        match self.coalescer.join(&key) {
            Role::Leader => {
                let question = format!("Allow fetching from untrusted domain '{domain}'?");
                let answer = self
                    .ask
                    .ask(&question, &["yes", "trust", "no"])
                    .await
                    .map_err(|e| SafetyDenial::AskFailed(e.to_string()))?;

                let (granted, outcome) = match answer.to_ascii_lowercase().as_str() {
                    "trust" => {
                        self.store
                            .trust_domain(domain)
                            .map_err(|e| SafetyDenial::Io(e.to_string()))?;
                        (true, PromptOutcome::Trusted)
                    }
                    "yes" => (true, PromptOutcome::OneShot),
                    _ => (false, PromptOutcome::Denied),
                };
                self.coalescer.resolve(&key, outcome);
                if granted {
                    Ok(())
                } else {
                    Err(SafetyDenial::DomainNotTrusted(domain.to_string()))
                }
            }
            Role::Follower(mut rx) => match rx.recv().await {
                Ok(PromptOutcome::Trusted) => Ok(()),
                Ok(PromptOutcome::Denied) => Err(SafetyDenial::DomainNotTrusted(domain.to_string())),
                Ok(PromptOutcome::OneShot) | Err(_) => {
                    Box::pin(self.authorize_domain(domain)).await
                }
            },
        }
    }

    pub async fn lock(self: &Arc<Self>, path: impl AsRef<Path>) -> PathGuard {
        self.locker.lock(path).await
    }

    pub async fn lock_pair(
        self: &Arc<Self>,
        p: impl AsRef<Path>,
        q: impl AsRef<Path>,
    ) -> PairGuard {
        self.locker.lock_pair(p, q).await
    }
}

/// Why a safety-gated operation did not proceed. Handlers convert this into
/// a `ToolOutput::err` with a message tailored to the failing step.
#[derive(Debug)]
pub enum SafetyDenial {
    DirectoryNotApproved(PathBuf),
    ChangeDenied(PathBuf),
    DomainNotTrusted(String),
    AskFailed(String),
    Io(String),
}

impl std::fmt::Display for SafetyDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SafetyDenial::DirectoryNotApproved(p) => {
                write!(f, "directory not approved: {}", p.display())
            }
            SafetyDenial::ChangeDenied(p) => write!(f, "change denied: {}", p.display()),
            SafetyDenial::DomainNotTrusted(d) => write!(f, "domain not trusted: {d}"),
            SafetyDenial::AskFailed(e) => write!(f, "approval prompt failed: {e}"),
            SafetyDenial::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for SafetyDenial {}
