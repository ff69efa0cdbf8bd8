// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The permission store — a single atomic JSON-backed kernel of trust
//! decisions for directories, commands, and domains.
//!
//! Directories are matched by ancestry: approving `/home/u` also approves
//! every path beneath it.  Commands and domains are matched by exact string.
//! Every mutation is written to disk before the call that requested it
//! returns, so a crash immediately after `approve_dir` never loses the grant.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default on-disk location, relative to the process's working directory.
pub const DEFAULT_PERMISSIONS_PATH: &str = ".shelly/local/permissions.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PermissionSnapshot {
    #[serde(default)]
    fs_directories: BTreeSet<String>,
    #[serde(default)]
    trusted_commands: BTreeSet<String>,
    #[serde(default)]
    trusted_domains: BTreeSet<String>,
}

/// Recognizes the legacy wire shape (a bare JSON array of directories) in
/// addition to the current object shape.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredForm {
    Legacy(Vec<String>),
    Current(PermissionSnapshot),
}

/// Atomic JSON-backed store of filesystem/command/domain trust decisions.
///
/// Readers take a read-lock; writers build the new snapshot under a
/// write-lock, release it, and only then perform file I/O — the lock is
/// never held across a syscall.
pub struct PermissionStore {
    path: PathBuf,
    state: RwLock<PermissionSnapshot>,
}

impl PermissionStore {
    /// Load (or lazily create) the store at `path`.
    ///
    /// A missing file is treated as an empty store; it is not created until
    /// the first mutation.  A parse failure is returned as an error — the
    /// process must never silently drop existing grants.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => PermissionSnapshot::default(),
            Ok(bytes) => match serde_json::from_slice::<StoredForm>(&bytes)
                .with_context(|| format!("parsing permissions file {}", path.display()))?
            {
                StoredForm::Legacy(dirs) => PermissionSnapshot {
                    fs_directories: dirs.into_iter().collect(),
                    ..Default::default()
                },
                StoredForm::Current(s) => s,
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PermissionSnapshot::default(),
            Err(e) => return Err(e).context("reading permissions file"),
        };
        Ok(Self { path, state: RwLock::new(state) })
    }

    /// Construct a store backed by the default path under the process cwd.
    pub fn load_default() -> Result<Self> {
        Self::load(DEFAULT_PERMISSIONS_PATH)
    }

    /// `true` iff `p` or any ancestor up to the filesystem root is approved.
    pub fn is_dir_approved(&self, p: impl AsRef<Path>) -> bool {
        let dirs = &self.state.read().expect("permission lock poisoned").fs_directories;
        let mut cur = Some(p.as_ref());
        while let Some(dir) = cur {
            if dirs.contains(&dir.to_string_lossy().to_string()) {
                return true;
            }
            cur = dir.parent();
        }
        false
    }

    pub fn is_command_trusted(&self, command: &str) -> bool {
        self.state.read().expect("permission lock poisoned").trusted_commands.contains(command)
    }

    pub fn is_domain_trusted(&self, domain: &str) -> bool {
        self.state.read().expect("permission lock poisoned").trusted_domains.contains(domain)
    }

    pub fn approve_dir(&self, p: impl AsRef<Path>) -> Result<()> {
        let key = p.as_ref().to_string_lossy().to_string();
        self.mutate(|s| { s.fs_directories.insert(key); })
    }

    pub fn trust_command(&self, command: impl Into<String>) -> Result<()> {
        let command = command.into();
        self.mutate(|s| { s.trusted_commands.insert(command); })
    }

    pub fn trust_domain(&self, domain: impl Into<String>) -> Result<()> {
        let domain = domain.into();
        self.mutate(|s| { s.trusted_domains.insert(domain); })
    }

    /// Apply `f` to the in-memory snapshot under a write-lock, take a copy,
    /// release the lock, then persist the copy. The lock is never held
    /// during I/O.
    fn mutate(&self, f: impl FnOnce(&mut PermissionSnapshot)) -> Result<()> {
        let snapshot = {
            let mut guard = self.state.write().expect("permission lock poisoned");
            f(&mut guard);
            guard.clone()
        };
        self.persist(&snapshot)
    }

    fn persist(&self, snapshot: &PermissionSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
                }
            }
        }

        let body = serde_json::to_vec_pretty(snapshot)?;
        let dir = self.path.parent().filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let tmp = dir.join(format!(
            ".{}.tmp-{}",
            self.path.file_name().and_then(|n| n.to_str()).unwrap_or("permissions.json"),
            std::process::id(),
        ));
        std::fs::write(&tmp, &body).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming {} -> {}", tmp.display(), self.path.display()))?;
        debug!(path = %self.path.display(), "permissions persisted");
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path() -> PathBuf {
        use std::sync::atomic::{AtomicU32, Ordering};
        static CTR: AtomicU32 = AtomicU32::new(0);
        let n = CTR.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("shelly_perm_test_{}_{n}/permissions.json", std::process::id()))
    }

    #[test]
    fn missing_file_is_empty_store() {
        let store = PermissionStore::load(tmp_path()).unwrap();
        assert!(!store.is_dir_approved("/home/u"));
    }

    #[test]
    fn approve_dir_then_child_path_is_approved() {
        let path = tmp_path();
        let store = PermissionStore::load(&path).unwrap();
        store.approve_dir("/home/u").unwrap();
        assert!(store.is_dir_approved("/home/u"));
        assert!(store.is_dir_approved("/home/u/sub/file.txt"));
        assert!(!store.is_dir_approved("/home/other"));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn approve_dir_survives_reload() {
        let path = tmp_path();
        {
            let store = PermissionStore::load(&path).unwrap();
            store.approve_dir("/home/u").unwrap();
        }
        let reloaded = PermissionStore::load(&path).unwrap();
        assert!(reloaded.is_dir_approved("/home/u/sub/file.txt"));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn trust_command_survives_reload() {
        let path = tmp_path();
        {
            let store = PermissionStore::load(&path).unwrap();
            store.trust_command("git").unwrap();
        }
        let reloaded = PermissionStore::load(&path).unwrap();
        assert!(reloaded.is_command_trusted("git"));
        assert!(!reloaded.is_command_trusted("rm"));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn trust_domain_exact_match_only() {
        let path = tmp_path();
        let store = PermissionStore::load(&path).unwrap();
        store.trust_domain("api.example.com").unwrap();
        assert!(store.is_domain_trusted("api.example.com"));
        assert!(!store.is_domain_trusted("evil.example.com"));
        assert!(!store.is_domain_trusted("example.com"));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn legacy_bare_array_is_read_as_directories() {
        let path = tmp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"["/home/u", "/srv/app"]"#).unwrap();
        let store = PermissionStore::load(&path).unwrap();
        assert!(store.is_dir_approved("/home/u"));
        assert!(store.is_dir_approved("/srv/app/x"));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn unknown_additional_keys_are_ignored() {
        let path = tmp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"fs_directories": ["/a"], "future_field": 42}"#).unwrap();
        let store = PermissionStore::load(&path).unwrap();
        assert!(store.is_dir_approved("/a"));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn parse_failure_is_an_error_not_a_silent_empty_store() {
        let path = tmp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json at all {{{").unwrap();
        assert!(PermissionStore::load(&path).is_err());
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn root_is_not_spuriously_approved() {
        let store = PermissionStore::load(tmp_path()).unwrap();
        assert!(!store.is_dir_approved("/"));
    }
}
