// Weave
// Copyright (C) 2025 Loomworks

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Per-scope module caches: a prebuilt dylib bundling a scope's modules
//! for fast linking, plus a manifest describing what it contains.
//!
//! Each build of the cache is a [`CacheRevision`]. Revisions are
//! reference-counted: cloning a revision is `use()`, dropping a clone is
//! `disuse()`. Rebuilding produces a new revision under a new file name, so
//! a revision with outstanding uses keeps linking against its own file;
//! the superseded file is deleted once its last use drops.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};
use weave_common::{Issue, IssuesError};

/// What a cache build contains, and the hash that decides staleness.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheManifest {
    pub target: String,
    pub content_hash: String,
    pub module_keys: BTreeSet<String>,
    /// Libraries the cached modules need at link time, beyond the cache
    /// dylib itself.
    pub link_dependencies: BTreeSet<String>,
}

impl CacheManifest {
    /// Builds the manifest for a set of (key, artifact bytes) pairs.
    pub fn for_modules(target: &str, modules: &BTreeMap<String, Vec<u8>>, link_dependencies: BTreeSet<String>) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(target.as_bytes());
        for (key, bytes) in modules {
            hasher.update(key.as_bytes());
            hasher.update(&(bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        }
        Self {
            target: target.to_string(),
            content_hash: hasher.finalize().to_hex().to_string(),
            module_keys: modules.keys().cloned().collect(),
            link_dependencies,
        }
    }
}

/// Everything `make_available` needs beyond the expected contents.
#[derive(Debug, Clone, Default)]
pub struct MakeAvailableRequest {
    /// Caches at broader scopes whose modules need not be re-bundled here.
    pub prior_caches: Vec<CacheManifest>,
    pub extra_dylibs: Vec<PathBuf>,
    pub extra_frameworks: Vec<String>,
    pub run_path_search_paths: Vec<PathBuf>,
}

#[derive(Debug)]
struct RevisionInner {
    archive_path: PathBuf,
    manifest: CacheManifest,
    superseded: AtomicBool,
}

impl Drop for RevisionInner {
    fn drop(&mut self) {
        if self.superseded.load(Ordering::Acquire) {
            debug!(path = %self.archive_path.display(), "removing superseded cache revision");
            let _ = std::fs::remove_file(&self.archive_path);
        }
    }
}

/// One reference-counted build of a module cache.
///
/// Clone to `use()` the revision, drop the clone to `disuse()` it. The
/// archive file outlives every clone.
#[derive(Debug, Clone)]
pub struct CacheRevision {
    inner: Arc<RevisionInner>,
}

impl CacheRevision {
    pub fn manifest(&self) -> &CacheManifest {
        &self.inner.manifest
    }

    pub fn archive_path(&self) -> &Path {
        &self.inner.archive_path
    }

    /// Uses outstanding beyond the cache's own reference.
    pub fn external_use_count(&self) -> usize {
        Arc::strong_count(&self.inner).saturating_sub(1)
    }

    fn mark_superseded(&self) {
        self.inner.superseded.store(true, Ordering::Release);
    }
}

/// On-disk archive format: the manifest plus each module's artifact.
#[derive(Serialize, Deserialize)]
struct CacheArchiveFile {
    manifest: CacheManifest,
    modules: BTreeMap<String, Vec<u8>>,
}

/// Sidecar recording which archive file is current.
#[derive(Serialize, Deserialize)]
struct CacheIndexFile {
    manifest: CacheManifest,
    archive: String,
    revision: u64,
}

struct CacheState {
    current: Option<CacheRevision>,
    next_revision: u64,
}

/// The module cache for one scope.
pub struct ModuleCache {
    scope_name: String,
    directory: PathBuf,
    state: Mutex<CacheState>,
}

impl ModuleCache {
    /// Opens the cache directory, adopting an existing build if its index
    /// and archive are intact.
    pub fn new(scope_name: &str, directory: &Path) -> Self {
        let cache = Self {
            scope_name: scope_name.to_string(),
            directory: directory.to_path_buf(),
            state: Mutex::new(CacheState {
                current: None,
                next_revision: 0,
            }),
        };
        cache.adopt_existing();
        cache
    }

    fn index_path(&self) -> PathBuf {
        self.directory.join(format!("libWeaveModuleCache-{}.json", self.scope_name))
    }

    fn archive_path(&self, revision: u64) -> PathBuf {
        self.directory.join(format!("libWeaveModuleCache-{}-{}.dylib", self.scope_name, revision))
    }

    fn adopt_existing(&self) {
        let Ok(bytes) = std::fs::read(self.index_path()) else {
            return;
        };
        let Ok(index) = serde_json::from_slice::<CacheIndexFile>(&bytes) else {
            return;
        };
        let archive_path = self.directory.join(&index.archive);
        if !archive_path.is_file() {
            return;
        }
        let mut state = self.state.lock();
        state.next_revision = index.revision + 1;
        state.current = Some(CacheRevision {
            inner: Arc::new(RevisionInner {
                archive_path,
                manifest: index.manifest,
                superseded: AtomicBool::new(false),
            }),
        });
    }

    /// The current revision, `use()`d for the caller.
    pub fn use_current_revision(&self) -> Option<CacheRevision> {
        self.state.lock().current.clone()
    }

    /// Ensures an archive matching `expected` exists, rebuilding only when
    /// the manifest is stale or `use_existing` is false. Returns a `use()`d
    /// revision either way.
    pub fn make_available(
        &self,
        use_existing: bool,
        expected: &CacheManifest,
        modules: &BTreeMap<String, Vec<u8>>,
        _request: &MakeAvailableRequest,
    ) -> Result<CacheRevision, IssuesError> {
        let mut state = self.state.lock();
        if use_existing {
            if let Some(current) = &state.current {
                if current.manifest().content_hash == expected.content_hash {
                    debug!(scope = %self.scope_name, "module cache is up to date");
                    return Ok(current.clone());
                }
            }
        }

        let revision_number = state.next_revision;
        state.next_revision += 1;
        let archive_path = self.archive_path(revision_number);
        std::fs::create_dir_all(&self.directory).map_err(|e| self.build_error(&archive_path, &e.to_string()))?;
        let archive = CacheArchiveFile {
            manifest: expected.clone(),
            modules: modules.clone(),
        };
        let bytes = serde_json::to_vec(&archive).map_err(|e| self.build_error(&archive_path, &e.to_string()))?;
        std::fs::write(&archive_path, bytes).map_err(|e| self.build_error(&archive_path, &e.to_string()))?;
        let index = CacheIndexFile {
            manifest: expected.clone(),
            archive: archive_path.file_name().unwrap_or_default().to_string_lossy().into_owned(),
            revision: revision_number,
        };
        let index_bytes = serde_json::to_vec_pretty(&index).map_err(|e| self.build_error(&archive_path, &e.to_string()))?;
        std::fs::write(self.index_path(), index_bytes).map_err(|e| self.build_error(&archive_path, &e.to_string()))?;

        let revision = CacheRevision {
            inner: Arc::new(RevisionInner {
                archive_path,
                manifest: expected.clone(),
                superseded: AtomicBool::new(false),
            }),
        };
        if let Some(old) = state.current.replace(revision.clone()) {
            // The old build stays readable for in-flight links; its file
            // goes away with its last use.
            old.mark_superseded();
        }
        info!(scope = %self.scope_name, revision = revision_number, modules = modules.len(), "rebuilt module cache");
        Ok(revision)
    }

    fn build_error(&self, path: &Path, detail: &str) -> IssuesError {
        IssuesError::single(Issue::error("building module cache", "could not write module cache", detail).with_path(path))
    }

    /// Reads one module's artifact bytes out of a cache archive.
    pub fn read_cached_module(archive_path: &Path, key: &str) -> Option<Vec<u8>> {
        let bytes = std::fs::read(archive_path).ok()?;
        let archive: CacheArchiveFile = serde_json::from_slice(&bytes).ok()?;
        archive.modules.get(key).cloned()
    }
}
