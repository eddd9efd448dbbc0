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

//! The compiler instance: selects a scope lattice for a composition,
//! loads modules through the incremental loader, and exposes module
//! queries, source overrides, cache building, and file-event entry points.
//!
//! Several compiler instances may share environments (the built-in, system,
//! and user scopes, and composition families); the process-wide registry
//! routes changes between them.

use crate::cache::{CacheManifest, CacheRevision, MakeAvailableRequest};
use crate::context::EnvironmentToken;
use crate::delegate::{CompilerDelegate, DelegateDispatcher, LoadedModulesData, ModifiedModule};
use crate::environment::Environment;
use crate::graph::DependencyNetwork;
use crate::registry::{CompilerRegistry, EnvironmentClient, ScopePaths};
use crate::scope::{ScopeLattice, family_modules_folder};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};
use weave_core::backend::{CableGraphAnalyzer, CompositionAnalyzer, CompositionCodeGenerator, Linker, ToolLinker};
use weave_core::{Composition, Module};

static NEXT_COMPILER_ID: AtomicU64 = AtomicU64::new(1);

/// State mutated only on the environment context.
pub(crate) struct CoreState {
    pub lattice: ScopeLattice,
    /// Where newly generated (ad-hoc / specialized) modules are written.
    pub generated_target: Option<Arc<Environment>>,
    pub network: DependencyNetwork,
    pub has_loaded_all: bool,
    /// Modules loaded but whose referenced types or generic bases are not
    /// loaded yet; notification is postponed until they can be reified.
    pub pending_reification: BTreeMap<String, u64>,
    pub composition_path: Option<PathBuf>,
    pub family_folder: Option<PathBuf>,
}

pub(crate) struct CompilerCore {
    pub id: u64,
    pub target: String,
    pub paths: ScopePaths,
    pub registry: &'static CompilerRegistry,
    pub dispatcher: Arc<DelegateDispatcher>,
    pub analyzer: Arc<dyn CompositionAnalyzer>,
    pub generator: Mutex<Option<Arc<dyn CompositionCodeGenerator>>>,
    pub linker: Mutex<Arc<dyn Linker>>,
    pub state: Mutex<CoreState>,
    pub(crate) weak_self: Mutex<Weak<CompilerCore>>,
}

impl CompilerCore {
    pub(crate) fn strong(&self) -> Arc<CompilerCore> {
        self.weak_self.lock().upgrade().expect("compiler core outlives its jobs")
    }
}

impl EnvironmentClient for CompilerCore {
    fn client_id(&self) -> u64 {
        self.id
    }

    fn uses_environment(&self, environment_id: u64) -> bool {
        self.state.lock().lattice.contains_environment(environment_id)
    }

    fn shared_environment_changed(&self, environment_id: u64, changes: &Arc<LoadedModulesData>, token: &EnvironmentToken) {
        // Another compiler changed a shared environment. This compiler's
        // delegate retains the same data; dependents in this compiler's
        // narrower scopes are reloaded through its own loader.
        debug!(compiler = self.id, environment = environment_id, "observing shared environment change");
        if self.dispatcher.has_delegate() {
            self.dispatcher.notify(Arc::clone(changes));
        }
        let changed_keys: BTreeSet<String> = changes
            .modified
            .keys()
            .chain(changes.removed.keys())
            .cloned()
            .collect();
        if !changed_keys.is_empty() {
            self.reload_dependents_of_shared_change(token, environment_id, &changed_keys);
        }
    }
}

/// A compiler for one composition (or for ad-hoc module queries).
pub struct Compiler {
    core: Arc<CompilerCore>,
}

impl Compiler {
    pub fn new(target: &str, paths: ScopePaths, composition_path: Option<&Path>) -> Self {
        let registry = CompilerRegistry::shared();
        let (lattice, generated_target) = registry.lattice_for(target, &paths, composition_path);
        let core = Arc::new_cyclic(|weak: &Weak<CompilerCore>| CompilerCore {
            id: NEXT_COMPILER_ID.fetch_add(1, Ordering::Relaxed),
            target: target.to_string(),
            paths,
            registry,
            dispatcher: DelegateDispatcher::new(),
            analyzer: Arc::new(CableGraphAnalyzer),
            generator: Mutex::new(None),
            linker: Mutex::new(Arc::new(ToolLinker::default())),
            state: Mutex::new(CoreState {
                lattice,
                generated_target: Some(generated_target),
                network: DependencyNetwork::new(),
                has_loaded_all: false,
                pending_reification: BTreeMap::new(),
                composition_path: composition_path.map(Path::to_path_buf),
                family_folder: composition_path.and_then(family_modules_folder),
            }),
            weak_self: Mutex::new(Weak::new()),
        });
        *core.weak_self.lock() = Arc::downgrade(&core);
        registry.register_client(Arc::downgrade(&core) as Weak<dyn EnvironmentClient>);
        info!(compiler = core.id, target = %core.target, "created compiler");
        Self { core }
    }

    /// Creates a compiler with the default scope paths for this host.
    pub fn for_composition(composition_path: Option<&Path>) -> Self {
        Self::new(&weave_common::default_target(), ScopePaths::default_paths(), composition_path)
    }

    pub fn target(&self) -> &str {
        &self.core.target
    }

    pub fn set_delegate(&self, delegate: Option<Arc<dyn CompilerDelegate>>) {
        self.core.dispatcher.set_delegate(delegate);
    }

    /// Blocks until all delegate notifications enqueued so far are
    /// acknowledged, including ones still in flight on the environment
    /// context (cross-compiler updates hop through it). Mostly useful in
    /// tests.
    pub fn drain_delegate_notifications(&self) {
        self.core.registry.environment_context().run_sync(|_| {});
        self.core.dispatcher.drain();
    }

    pub fn set_code_generator(&self, generator: Option<Arc<dyn CompositionCodeGenerator>>) {
        *self.core.generator.lock() = generator;
    }

    pub fn set_linker(&self, linker: Arc<dyn Linker>) {
        *self.core.linker.lock() = linker;
    }

    /// Re-selects the scope lattice for `composition_path`. A path mapping
    /// to the same composition family is a no-op; switching families
    /// rebuilds the lattice and, if the family environment changed,
    /// synthesizes a notification for the difference in visible modules.
    pub fn set_composition_path(&self, composition_path: Option<&Path>) {
        let core = self.core.strong();
        let new_path = composition_path.map(Path::to_path_buf);
        self.core.registry.environment_context().run_sync(move |token| {
            let new_family = new_path.as_deref().and_then(family_modules_folder);
            let (same_family, old_visible) = {
                let mut state = core.state.lock();
                if state.family_folder == new_family && state.composition_path.is_some() == new_path.is_some() {
                    state.composition_path = new_path.clone();
                    (true, BTreeMap::new())
                } else {
                    (false, state.lattice.directly_visible_modules(token))
                }
            };
            if same_family {
                return;
            }
            let (lattice, generated_target) = core.registry.lattice_for(&core.target, &core.paths, new_path.as_deref());
            let family_changed;
            {
                let mut state = core.state.lock();
                family_changed = state.family_folder != new_family;
                state.family_folder = new_family;
                state.composition_path = new_path;
                state.lattice = lattice;
                state.generated_target = Some(generated_target);
                state.network = state.lattice.build_network(token);
            }
            if family_changed {
                let new_visible = core.state.lock().lattice.directly_visible_modules(token);
                let changes = diff_visible_modules(&old_visible, &new_visible);
                if !changes.is_empty() {
                    debug!(compiler = core.id, "composition family changed; notifying visible-module difference");
                    core.dispatcher.notify(Arc::new(changes));
                }
            }
        });
    }

    /// Loads the requested module keys (plus their dependency closure), or
    /// everything discoverable when `keys` is empty. Returns after any
    /// triggered source compilation has finished and its modules are
    /// loaded.
    pub fn load_modules_if_needed(&self, keys: &[String]) {
        self.core.load_modules_if_needed(keys);
    }

    /// The module resolved for `key` at the narrowest scope, loading it
    /// first if needed.
    pub fn module(&self, key: &str) -> Option<Arc<Module>> {
        self.core.load_modules_if_needed(std::slice::from_ref(&key.to_string()));
        let core = self.core.strong();
        let key = key.to_string();
        self.core
            .registry
            .environment_context()
            .run_sync(move |token| core.state.lock().lattice.resolve(token, &key).map(|(_, _, module)| module))
    }

    /// The node class for `key`, if `key` resolves to one.
    pub fn node_class(&self, key: &str) -> Option<Arc<Module>> {
        self.module(key).filter(|m| m.payload.as_node_class().is_some())
    }

    /// Every node class visible from this compiler's lattice, keyed by
    /// module key.
    pub fn list_node_classes(&self) -> BTreeMap<String, Arc<Module>> {
        self.core.load_modules_if_needed(&[]);
        let core = self.core.strong();
        self.core.registry.environment_context().run_sync(move |token| {
            core.state
                .lock()
                .lattice
                .directly_visible_modules(token)
                .into_iter()
                .filter(|(_, m)| m.payload.as_node_class().is_some())
                .collect()
        })
    }

    /// All modules visible from this compiler's lattice.
    pub fn visible_modules(&self) -> BTreeMap<String, Arc<Module>> {
        let core = self.core.strong();
        self.core
            .registry
            .environment_context()
            .run_sync(move |token| core.state.lock().lattice.directly_visible_modules(token))
    }

    /// Parses a composition file against this compiler's loaded modules.
    pub fn composition_from_file(&self, path: &Path) -> Result<Composition, weave_common::IssuesError> {
        Composition::parse_file(path)
    }

    /// Replaces the on-disk source of `key` with in-memory text and
    /// recompiles it and its dependents.
    pub fn set_source_override(&self, key: &str, source_text: &str) {
        self.core.apply_source_override(key, Some(source_text.to_string()));
    }

    /// Removes an override installed by [`Self::set_source_override`],
    /// restoring the installed module's behavior. Triggers exactly one
    /// "modified" notification.
    pub fn revert_source_override(&self, key: &str) {
        self.core.apply_source_override(key, None);
    }

    /// Reacts to a module or source file appearing, changing, or
    /// disappearing under one of the lattice's search paths.
    pub fn note_file_added(&self, path: &Path) {
        self.core.note_file_event(path, FileEvent::Added);
    }

    pub fn note_file_changed(&self, path: &Path) {
        self.core.note_file_event(path, FileEvent::Changed);
    }

    pub fn note_file_removed(&self, path: &Path) {
        self.core.note_file_event(path, FileEvent::Removed);
    }

    /// Ensures each scope's module cache matches its loaded modules,
    /// rebuilding only the stale ones (or all of them when `use_existing`
    /// is false).
    pub fn make_module_caches_available(&self, use_existing: bool) -> Vec<CacheRevision> {
        let core = self.core.strong();
        self.core.registry.environment_context().run_sync(move |token| {
            let lattice = core.state.lock().lattice.clone();
            let mut revisions = Vec::new();
            for level in &lattice.levels {
                let Some(cache) = level.installed.cache(token) else {
                    continue;
                };
                let (bundle, link_dependencies) = level.installed.cacheable_modules_and_dependencies(token);
                if bundle.is_empty() {
                    continue;
                }
                let manifest = CacheManifest::for_modules(&core.target, &bundle, link_dependencies);
                match cache.make_available(use_existing, &manifest, &bundle, &MakeAvailableRequest::default()) {
                    Ok(revision) => revisions.push(revision),
                    Err(e) => e.issues.log_all(),
                }
            }
            revisions
        })
    }

    pub(crate) fn core(&self) -> &Arc<CompilerCore> {
        &self.core
    }
}

/// File events delivered by the embedder's filesystem watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileEvent {
    Added,
    Changed,
    Removed,
}

/// Old-vs-new difference of the directly visible module set, reported when
/// the composition family changes.
fn diff_visible_modules(old: &BTreeMap<String, Arc<Module>>, new: &BTreeMap<String, Arc<Module>>) -> LoadedModulesData {
    let mut changes = LoadedModulesData::default();
    for (key, module) in new {
        match old.get(key) {
            None => {
                changes.added.insert(key.clone(), Arc::clone(module));
            }
            Some(previous) if !Arc::ptr_eq(previous, module) => {
                changes.modified.insert(
                    key.clone(),
                    ModifiedModule {
                        old: Arc::clone(previous),
                        new: Arc::clone(module),
                    },
                );
            }
            Some(_) => {}
        }
    }
    for (key, module) in old {
        if !new.contains_key(key) {
            changes.removed.insert(key.clone(), Arc::clone(module));
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_visible_modules_classifies_transitions() {
        use weave_core::ModulePayload;
        let a1 = Arc::new(Module::new("a", ModulePayload::Library));
        let a2 = Arc::new(Module::new("a", ModulePayload::Library));
        let b = Arc::new(Module::new("b", ModulePayload::Library));
        let c = Arc::new(Module::new("c", ModulePayload::Library));

        let old = BTreeMap::from([("a".to_string(), Arc::clone(&a1)), ("b".to_string(), Arc::clone(&b))]);
        let new = BTreeMap::from([("a".to_string(), Arc::clone(&a2)), ("c".to_string(), Arc::clone(&c))]);
        let changes = diff_visible_modules(&old, &new);
        assert!(changes.added.contains_key("c"));
        assert!(changes.modified.contains_key("a"));
        assert!(changes.removed.contains_key("b"));
        assert_eq!(changes.added.len() + changes.modified.len() + changes.removed.len(), 3);
    }
}
