// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-path file locking so concurrent tool invocations never interleave
//! writes to the same file.
//!
//! Entries are created lazily on first acquisition and removed once nothing
//! holds or is waiting on them, so the map never grows to the size of "every
//! path ever touched". Pair locking always acquires in lexicographic order,
//! which makes deadlock between any two threads locking the same two paths
//! impossible regardless of which path each thread names first.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

struct Entry {
    mutex: Arc<Mutex<()>>,
    refs: usize,
}

/// A map from absolute path to a reference-counted mutex guarding it.
#[derive(Default)]
pub struct PathLocker {
    entries: StdMutex<HashMap<PathBuf, Entry>>,
}

/// RAII guard released by dropping. Holds the owned mutex guard plus enough
/// state to decrement the entry's ref-count and reap it if it hits zero.
pub struct PathGuard {
    locker: Arc<PathLocker>,
    path: PathBuf,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        self.locker.release(&self.path);
    }
}

/// RAII guard for two simultaneously held paths, released in reverse order.
pub struct PairGuard {
    _first: Option<PathGuard>,
    _second: Option<PathGuard>,
}

impl PathLocker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { entries: StdMutex::new(HashMap::new()) })
    }

    fn get_or_create(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut entries = self.entries.lock().expect("locker map poisoned");
        let entry = entries.entry(path.to_path_buf()).or_insert_with(|| Entry {
            mutex: Arc::new(Mutex::new(())),
            refs: 0,
        });
        entry.refs += 1;
        entry.mutex.clone()
    }

    fn release(&self, path: &Path) {
        let mut entries = self.entries.lock().expect("locker map poisoned");
        if let Some(entry) = entries.get_mut(path) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                entries.remove(path);
            }
        }
    }

    /// Acquire the lock for a single path. Blocks until available.
    pub async fn lock(self: &Arc<Self>, path: impl AsRef<Path>) -> PathGuard {
        let path = path.as_ref().to_path_buf();
        let mutex = self.get_or_create(&path);
        let guard = mutex.lock_owned().await;
        PathGuard { locker: self.clone(), path, _guard: guard }
    }

    /// Acquire locks for two paths, always in lexicographic order so that a
    /// concurrent `lock_pair(q, p)` cannot deadlock against this call.
    pub async fn lock_pair(
        self: &Arc<Self>,
        p: impl AsRef<Path>,
        q: impl AsRef<Path>,
    ) -> PairGuard {
        let p = p.as_ref();
        let q = q.as_ref();
        if p == q {
            let g = self.lock(p).await;
            return PairGuard { _first: Some(g), _second: None };
        }
        let (first, second) = if p < q { (p, q) } else { (q, p) };
        let g1 = self.lock(first).await;
        let g2 = self.lock(second).await;
        PairGuard { _first: Some(g1), _second: Some(g2) }
    }

    /// Current number of live (held-or-pending) path entries. Test/debug use.
    pub fn active_entries(&self) -> usize {
        self.entries.lock().expect("locker map poisoned").len()
    }
}
