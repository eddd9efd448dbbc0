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

//! One scope's ownership boundary: search paths, loaded modules, discovered
//! module infos, the per-environment dependency graph, and the module cache
//! handle.
//!
//! Environments may be shared by several compiler instances. All mutation
//! happens on the environment context; accessors therefore require an
//! [`EnvironmentToken`].

use crate::cache::ModuleCache;
use crate::context::EnvironmentToken;
use crate::graph::DependencyGraph;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use weave_core::module::COMPILED_MODULE_EXTENSION;
use weave_core::source::SourceCompilerRegistry;
use weave_core::{Module, ModuleInfo};

static NEXT_ENVIRONMENT_ID: AtomicU64 = AtomicU64::new(1);

/// A module unloaded because its source changed, held until recompilation
/// either succeeds (reported as "modified") or fails (reported as
/// "removed").
#[derive(Debug, Clone)]
pub struct InvalidatedModule {
    pub old_module: Arc<Module>,
}

/// New files found by a search-path scan.
#[derive(Debug, Default, Clone)]
pub struct ScanDelta {
    /// Keys of newly discovered compiled modules.
    pub added_modules: BTreeSet<String>,
    /// Keys of newly discovered sources.
    pub added_sources: BTreeSet<String>,
}

impl ScanDelta {
    pub fn is_empty(&self) -> bool {
        self.added_modules.is_empty() && self.added_sources.is_empty()
    }
}

struct EnvironmentState {
    modules: HashMap<String, Arc<Module>>,
    module_infos: HashMap<String, ModuleInfo>,
    graph: DependencyGraph,
    cache: Option<Arc<ModuleCache>>,
    invalidated_awaiting_recompilation: HashMap<String, InvalidatedModule>,
    scanned: bool,
}

/// An isolated set of loaded modules and their search paths at one scope.
pub struct Environment {
    id: u64,
    name: String,
    is_builtin: bool,
    is_generated: bool,
    module_search_paths: Vec<PathBuf>,
    library_search_paths: Vec<PathBuf>,
    framework_search_paths: Vec<PathBuf>,
    header_search_paths: Vec<PathBuf>,
    state: Mutex<EnvironmentState>,
}

impl Environment {
    pub fn new(name: &str, is_builtin: bool, is_generated: bool, module_search_paths: Vec<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ENVIRONMENT_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            is_builtin,
            is_generated,
            module_search_paths,
            library_search_paths: Vec::new(),
            framework_search_paths: Vec::new(),
            header_search_paths: Vec::new(),
            state: Mutex::new(EnvironmentState {
                modules: HashMap::new(),
                module_infos: HashMap::new(),
                graph: DependencyGraph::new(),
                cache: None,
                invalidated_awaiting_recompilation: HashMap::new(),
                scanned: false,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_builtin(&self) -> bool {
        self.is_builtin
    }

    pub fn is_generated(&self) -> bool {
        self.is_generated
    }

    pub fn module_search_paths(&self) -> &[PathBuf] {
        &self.module_search_paths
    }

    pub fn library_search_paths(&self) -> &[PathBuf] {
        &self.library_search_paths
    }

    pub fn framework_search_paths(&self) -> &[PathBuf] {
        &self.framework_search_paths
    }

    pub fn header_search_paths(&self) -> &[PathBuf] {
        &self.header_search_paths
    }

    /// Where compiled artifacts for this environment's sources are cached.
    pub fn compiled_module_directory(&self) -> Option<PathBuf> {
        self.module_search_paths.first().map(|p| p.join(".compiled"))
    }

    pub fn set_cache(&self, _token: &EnvironmentToken, cache: Option<Arc<ModuleCache>>) {
        self.state.lock().cache = cache;
    }

    pub fn cache(&self, _token: &EnvironmentToken) -> Option<Arc<ModuleCache>> {
        self.state.lock().cache.clone()
    }

    pub fn module(&self, _token: &EnvironmentToken, key: &str) -> Option<Arc<Module>> {
        self.state.lock().modules.get(key).cloned()
    }

    pub fn is_module_loaded(&self, _token: &EnvironmentToken, key: &str) -> bool {
        self.state.lock().modules.contains_key(key)
    }

    pub fn loaded_modules(&self, _token: &EnvironmentToken) -> BTreeMap<String, Arc<Module>> {
        self.state.lock().modules.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
    }

    pub fn loaded_keys(&self, _token: &EnvironmentToken) -> BTreeSet<String> {
        self.state.lock().modules.keys().cloned().collect()
    }

    /// Loads `module` into this environment, replacing any previous version
    /// of the same key and recording its dependency edges. Returns the
    /// replaced module, if any.
    pub fn install_module(&self, _token: &EnvironmentToken, module: Arc<Module>) -> Option<Arc<Module>> {
        let mut state = self.state.lock();
        let key = module.key.clone();
        state.graph.remove_vertex(&key);
        state.graph.add_vertex(&key);
        for dependency in &module.dependencies {
            state.graph.add_edge(&key, dependency);
        }
        let previous = state.modules.insert(key.clone(), module);
        debug!(environment = %self.name, key = %key, replaced = previous.is_some(), "loaded module");
        previous
    }

    /// Unloads the module for `key`, removing its graph vertex. The caller
    /// owns the returned reference; dropping it releases the module's
    /// backing artifact.
    pub fn take_module(&self, _token: &EnvironmentToken, key: &str) -> Option<Arc<Module>> {
        let mut state = self.state.lock();
        let module = state.modules.remove(key);
        if module.is_some() {
            state.graph.remove_vertex(key);
            debug!(environment = %self.name, key = %key, "unloaded module");
        }
        module
    }

    pub fn module_info(&self, _token: &EnvironmentToken, key: &str) -> Option<ModuleInfo> {
        self.state.lock().module_infos.get(key).cloned()
    }

    pub fn set_module_info(&self, _token: &EnvironmentToken, info: ModuleInfo) {
        self.state.lock().module_infos.insert(info.key.clone(), info);
    }

    pub fn remove_module_info(&self, _token: &EnvironmentToken, key: &str) -> Option<ModuleInfo> {
        self.state.lock().module_infos.remove(key)
    }

    pub fn update_module_info(&self, _token: &EnvironmentToken, key: &str, update: impl FnOnce(&mut ModuleInfo)) {
        if let Some(info) = self.state.lock().module_infos.get_mut(key) {
            update(info);
        }
    }

    pub fn source_keys(&self, _token: &EnvironmentToken) -> BTreeSet<String> {
        self.state.lock().module_infos.values().filter(|i| i.is_source).map(|i| i.key.clone()).collect()
    }

    /// Runs `f` with this environment's dependency graph.
    pub fn with_graph<R>(&self, _token: &EnvironmentToken, f: impl FnOnce(&mut DependencyGraph) -> R) -> R {
        f(&mut self.state.lock().graph)
    }

    /// Keys of loaded modules whose raw dependency lists name `key`.
    ///
    /// Unlike the graph, this sees the same-scope generated→installed edges
    /// that are deliberately kept out of the network.
    pub fn dependents_of(&self, _token: &EnvironmentToken, key: &str) -> BTreeSet<String> {
        self.state
            .lock()
            .modules
            .values()
            .filter(|m| m.dependencies.contains(key))
            .map(|m| m.key.clone())
            .collect()
    }

    pub fn invalidated_module(&self, _token: &EnvironmentToken, key: &str) -> Option<InvalidatedModule> {
        self.state.lock().invalidated_awaiting_recompilation.get(key).cloned()
    }

    pub fn mark_invalidated(&self, _token: &EnvironmentToken, key: &str, old_module: Arc<Module>) {
        self.state
            .lock()
            .invalidated_awaiting_recompilation
            .insert(key.to_string(), InvalidatedModule { old_module });
    }

    pub fn resolve_invalidated(&self, _token: &EnvironmentToken, key: &str) -> Option<InvalidatedModule> {
        self.state.lock().invalidated_awaiting_recompilation.remove(key)
    }

    pub fn invalidated_keys(&self, _token: &EnvironmentToken) -> BTreeSet<String> {
        self.state.lock().invalidated_awaiting_recompilation.keys().cloned().collect()
    }

    pub fn has_scanned(&self, _token: &EnvironmentToken) -> bool {
        self.state.lock().scanned
    }

    /// Scans every module search path, creating ModuleInfo records for
    /// files not seen before. Rescans with no filesystem changes produce an
    /// empty delta.
    pub fn scan(&self, _token: &EnvironmentToken, registry: &SourceCompilerRegistry) -> ScanDelta {
        let mut state = self.state.lock();
        let mut delta = ScanDelta::default();
        for search_path in &self.module_search_paths {
            let Ok(entries) = std::fs::read_dir(search_path) else {
                continue;
            };
            for entry in entries.flatten() {
                let file = entry.path();
                let Some(extension) = file.extension().map(|e| e.to_string_lossy().into_owned()) else {
                    continue;
                };
                let Some(key) = file.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                    continue;
                };
                let is_source = registry.is_source_extension(&extension);
                if !is_source && extension != COMPILED_MODULE_EXTENSION {
                    continue;
                }
                if state.module_infos.contains_key(&key) {
                    continue;
                }
                state.module_infos.insert(key.clone(), ModuleInfo::new(&key, search_path, &file, is_source));
                if is_source {
                    delta.added_sources.insert(key);
                } else {
                    delta.added_modules.insert(key);
                }
            }
        }
        state.scanned = true;
        if !delta.is_empty() {
            debug!(
                environment = %self.name,
                modules = delta.added_modules.len(),
                sources = delta.added_sources.len(),
                "scanned module search paths"
            );
        }
        delta
    }

    /// The modules this environment would contribute to its scope's cache,
    /// plus the link dependencies that fall outside the bundle.
    pub fn cacheable_modules_and_dependencies(&self, _token: &EnvironmentToken) -> (BTreeMap<String, Vec<u8>>, BTreeSet<String>) {
        let state = self.state.lock();
        let mut bundle = BTreeMap::new();
        for (key, module) in &state.modules {
            if let Some(artifact) = &module.artifact {
                bundle.insert(key.clone(), artifact.bitcode.clone());
            }
        }
        let mut extra_link_dependencies = BTreeSet::new();
        for module in state.modules.values() {
            for dependency in &module.dependencies {
                if !bundle.contains_key(dependency) {
                    extra_link_dependencies.insert(dependency.clone());
                }
            }
        }
        (bundle, extra_link_dependencies)
    }
}

/// Reads a compiled module from the path recorded in `info`.
pub fn load_compiled_module(info: &ModuleInfo) -> Result<Module, weave_common::IssuesError> {
    let bytes = std::fs::read(&info.file).map_err(|e| {
        weave_common::IssuesError::single(
            weave_common::Issue::error("loading module", "unreadable compiled module", &format!("{e}"))
                .with_path(&info.file)
                .with_module_key(&info.key),
        )
    })?;
    Module::from_artifact_bytes(&bytes, &info.file)
}
