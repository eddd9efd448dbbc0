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

//! The incremental module loader.
//!
//! Computes add/modify/remove deltas per environment, excludes cyclic
//! sources, unloads stale modules and their dependents, loads modules to a
//! fixed point, hands unresolved keys to specialization generation,
//! schedules asynchronous source compilation, and notifies delegates of the
//! net change. Everything here runs on the environment context; compilation
//! runs on the code-generation context and re-enters the loader when done.

use crate::compiler::{CompilerCore, FileEvent};
use crate::context::{EnvironmentToken, WaitGroup};
use crate::delegate::{LoadedModulesData, ModifiedModule};
use crate::environment::{Environment, load_compiled_module};
use crate::scope::ScopeLattice;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use weave_common::{Issue, IssueList};
use weave_core::module::{COMPILED_MODULE_EXTENSION, generic_base_candidates, is_generic_type_key};
use weave_core::source::{SourceCompileRequest, SourceCompilerRegistry};
use weave_core::{Composition, Module, ModuleInfo, ModulePayload};

/// Added/modified/removed module and source keys for one environment.
#[derive(Debug, Default, Clone)]
pub struct ModuleSetDelta {
    pub added_modules: BTreeSet<String>,
    pub modified_modules: BTreeSet<String>,
    pub removed_modules: BTreeSet<String>,
    pub added_sources: BTreeSet<String>,
    pub modified_sources: BTreeSet<String>,
    pub removed_sources: BTreeSet<String>,
}

impl ModuleSetDelta {
    fn is_empty(&self) -> bool {
        self.added_modules.is_empty()
            && self.modified_modules.is_empty()
            && self.removed_modules.is_empty()
            && self.added_sources.is_empty()
            && self.modified_sources.is_empty()
            && self.removed_sources.is_empty()
    }
}

/// One invocation of the loading pipeline.
#[derive(Default)]
pub(crate) struct LoadRequest {
    /// Deltas keyed by environment id.
    pub deltas: HashMap<u64, ModuleSetDelta>,
    /// Freshly compiled modules to install directly instead of reading a
    /// compiled artifact from disk.
    pub materialized: HashMap<(u64, String), Arc<Module>>,
    /// Keys the caller asked for by name; unresolvable ones are reported.
    pub requested: BTreeSet<String>,
    /// Sources whose compilation just failed, with their diagnostics.
    pub failed_sources: HashMap<u64, BTreeMap<String, IssueList>>,
}

impl LoadRequest {
    fn delta(&mut self, environment_id: u64) -> &mut ModuleSetDelta {
        self.deltas.entry(environment_id).or_default()
    }

    fn is_empty(&self) -> bool {
        self.deltas.values().all(ModuleSetDelta::is_empty) && self.materialized.is_empty() && self.requested.is_empty() && self.failed_sources.is_empty()
    }
}

/// Elements of a compound type key: `WeaveList_WeaveInteger` →
/// `["WeaveInteger"]`. Keys with no underscore (or dotted node-class keys)
/// are not compound types.
fn compound_type_elements(key: &str) -> Option<Vec<String>> {
    if key.contains('.') || !key.contains('_') {
        return None;
    }
    let mut segments = key.split('_');
    segments.next()?;
    let elements: Vec<String> = segments.map(|s| s.to_string()).collect();
    if elements.is_empty() { None } else { Some(elements) }
}

/// Substitutes concrete types for a generic base's placeholders and wires
/// the back-reference. Runs on the code-generation context.
fn generate_specialized_module(base: &Module, key: &str, type_keys: &[String]) -> Module {
    let base_node_class = base.payload.as_node_class().cloned().unwrap_or_default();
    let placeholders: Vec<String> = base_node_class.generic_placeholders().into_iter().collect();
    let specializations: BTreeMap<String, String> = placeholders.iter().cloned().zip(type_keys.iter().cloned()).collect();
    let mut node_class = base_node_class;
    for port in &mut node_class.ports {
        if let Some(type_key) = &port.type_key {
            if let Some(concrete) = specializations.get(type_key) {
                port.type_key = Some(concrete.clone());
            }
        }
    }
    let mut dependencies: BTreeSet<String> = BTreeSet::from([base.key.clone()]);
    dependencies.extend(type_keys.iter().cloned());
    Module::new(
        key,
        ModulePayload::SpecializedNodeClass {
            node_class,
            generic_base_key: base.key.clone(),
            specializations,
        },
    )
    .with_dependencies(dependencies)
    .with_compatibility(base.compatibility.clone())
    .with_artifact(weave_core::CodeArtifact::in_memory(format!("specialized:{key}").into_bytes()))
}

fn generate_compound_type(key: &str, elements: Vec<String>) -> Module {
    Module::new(key, ModulePayload::CompoundType { element_keys: elements.clone() })
        .with_dependencies(elements)
        .with_artifact(weave_core::CodeArtifact::in_memory(format!("compound:{key}").into_bytes()))
}

struct SpecializationPlan {
    key: String,
    base: Option<Arc<Module>>,
    type_keys: Vec<String>,
    compound_elements: Option<Vec<String>>,
    target_environment: Arc<Environment>,
}

impl CompilerCore {
    /// Public loading entry point. Blocks the calling thread until any
    /// triggered source compilation has completed and its modules loaded.
    /// Must not be called from the environment context.
    pub(crate) fn load_modules_if_needed(&self, keys: &[String]) {
        let wait = WaitGroup::new();
        let core = self.strong();
        let keys = keys.to_vec();
        let wait_inner = wait.clone();
        self.registry.environment_context().run_sync(move |token| {
            core.load_requested(token, &keys, &wait_inner);
        });
        wait.wait();
    }

    fn load_requested(&self, token: &EnvironmentToken, keys: &[String], wait: &WaitGroup) {
        let mut request = LoadRequest::default();
        let lattice = self.state.lock().lattice.clone();

        let first_load = !self.state.lock().has_loaded_all;
        if first_load {
            for environment in lattice.environments() {
                let scanned = environment.scan(token, SourceCompilerRegistry::shared());
                if !scanned.is_empty() {
                    let delta = request.delta(environment.id());
                    delta.added_modules.extend(scanned.added_modules);
                    delta.added_sources.extend(scanned.added_sources);
                }
            }
            self.state.lock().has_loaded_all = true;
        }

        for key in keys {
            if lattice.resolve(token, key).is_some() {
                continue;
            }
            request.requested.insert(key.clone());
            if let Some((_, environment, info)) = lattice.find_module_info(token, key) {
                if info.is_source {
                    if !environment.is_module_loaded(token, key) {
                        request.delta(environment.id()).added_sources.insert(key.clone());
                    }
                } else {
                    request.delta(environment.id()).added_modules.insert(key.clone());
                }
            }
        }

        self.load_modules_and_sources(token, request, wait);
    }

    /// The loading pipeline: cycle exclusion, dependent resolution, unload,
    /// fixed-point load, specialization hand-off, compilation scheduling,
    /// reclassification, reification, and delegate notification.
    pub(crate) fn load_modules_and_sources(&self, token: &EnvironmentToken, mut request: LoadRequest, wait: &WaitGroup) {
        if request.is_empty() {
            return;
        }
        let lattice = self.state.lock().lattice.clone();
        let mut issues = IssueList::new();

        let excluded_sources = self.exclude_cyclic_sources(token, &lattice, &mut request, &mut issues);

        // Everything that must be unloaded: explicitly modified/removed
        // modules and sources, plus their transitive dependents across
        // environments (recovered through both the network and raw
        // dependency lists).
        let (to_unload_removed, to_unload_modified) = self.resolve_dependents(token, &lattice, &mut request);

        let mut removed_now: BTreeMap<(u64, String), Arc<Module>> = BTreeMap::new();
        for (environment_id, key) in &to_unload_removed {
            if let Some(environment) = lattice.environment_by_id(*environment_id) {
                if let Some(old) = environment.take_module(token, key) {
                    removed_now.insert((*environment_id, key.clone()), old);
                }
            }
        }
        for (environment_id, key) in &to_unload_modified {
            if let Some(environment) = lattice.environment_by_id(*environment_id) {
                if let Some(old) = environment.take_module(token, key) {
                    environment.mark_invalidated(token, key, old);
                }
            }
        }

        // Fixed-point load of compiled modules and their dependency
        // closures, tracking the broadest level that needed each
        // still-unresolved key.
        let mut loaded_now: BTreeMap<(u64, String), Arc<Module>> = BTreeMap::new();
        let mut unresolved: BTreeMap<String, usize> = BTreeMap::new();
        self.load_to_fixed_point(token, &lattice, &mut request, &excluded_sources, &mut loaded_now, &mut unresolved, &mut issues);

        // Unresolved keys may be generic-type specializations; hand them to
        // the generation facility of the environment chosen above.
        self.generate_specializations(token, &lattice, &request, unresolved, wait, &mut issues);

        // Sources whose backing files disappeared: drop their records and
        // cached compiled artifacts. Their dependents were already pulled
        // into the unload/recompile sets.
        for (environment_id, delta) in &request.deltas {
            for key in &delta.removed_sources {
                if let Some(environment) = lattice.environment_by_id(*environment_id) {
                    environment.remove_module_info(token, key);
                    if let Some(dir) = environment.compiled_module_directory() {
                        let _ = std::fs::remove_file(dir.join(format!("{key}.{COMPILED_MODULE_EXTENSION}")));
                    }
                }
            }
            for key in &delta.removed_modules {
                if let Some(environment) = lattice.environment_by_id(*environment_id) {
                    environment.remove_module_info(token, key);
                }
            }
        }

        self.schedule_source_compilation(token, &lattice, &request, &excluded_sources, &loaded_now, wait, &mut issues);

        self.finish_and_notify(token, &lattice, request, loaded_now, removed_now, issues);
    }

    /// Step 2: a source participating in a dependency cycle within its own
    /// environment is excluded from compilation with an Error, and its
    /// "attempted" flag is cleared so it is retried if the cycle is later
    /// broken. Returns the excluded (environment, key) pairs so the rest of
    /// the pass does not resurrect them.
    fn exclude_cyclic_sources(&self, token: &EnvironmentToken, lattice: &ScopeLattice, request: &mut LoadRequest, issues: &mut IssueList) -> BTreeSet<(u64, String)> {
        let mut excluded = BTreeSet::new();
        for (environment_id, delta) in request.deltas.iter_mut() {
            let candidates: BTreeSet<String> = delta.added_sources.union(&delta.modified_sources).cloned().collect();
            if candidates.is_empty() {
                continue;
            }
            let Some(environment) = lattice.environment_by_id(*environment_id) else {
                continue;
            };
            for key in &candidates {
                let Some(info) = environment.module_info(token, key) else {
                    continue;
                };
                let Some(dependencies) = source_dependencies(&info) else {
                    continue;
                };
                environment.with_graph(token, |graph| {
                    for dependency in &dependencies {
                        graph.add_edge(key, dependency);
                    }
                });
            }
            let cyclic = environment.with_graph(token, |graph| graph.cycle_vertices(&candidates));
            for key in cyclic {
                delta.added_sources.remove(&key);
                delta.modified_sources.remove(&key);
                environment.update_module_info(token, &key, |info| info.attempted = false);
                let path = environment.module_info(token, &key).map(|i| i.file);
                let mut issue = Issue::error(
                    "compiling subcomposition",
                    "Subcomposition contains itself",
                    "%module directly or indirectly contains an instance of itself, so it was not compiled",
                )
                .with_module_key(&key);
                if let Some(path) = path {
                    issue = issue.with_path(path);
                }
                warn!(key = %key, "excluding cyclic source from compilation");
                issues.append(issue);
                excluded.insert((*environment_id, key));
            }
        }
        excluded
    }

    /// Step 3: expands the request with everything that (directly or
    /// transitively) depends on a modified or removed module, marking
    /// sources for recompilation and compiled modules for reload. Returns
    /// the (environment, key) sets to unload.
    #[allow(clippy::type_complexity)]
    fn resolve_dependents(&self, token: &EnvironmentToken, lattice: &ScopeLattice, request: &mut LoadRequest) -> (BTreeSet<(u64, String)>, BTreeSet<(u64, String)>) {
        let mut removed: BTreeSet<(u64, String)> = BTreeSet::new();
        let mut modified: BTreeSet<(u64, String)> = BTreeSet::new();
        let mut processed: BTreeSet<(u64, String)> = BTreeSet::new();
        let mut worklist: VecDeque<(u64, String, bool)> = VecDeque::new();

        for (environment_id, delta) in &request.deltas {
            for key in delta.removed_modules.iter().chain(&delta.removed_sources) {
                worklist.push_back((*environment_id, key.clone(), true));
            }
            for key in delta.modified_modules.iter().chain(&delta.modified_sources) {
                worklist.push_back((*environment_id, key.clone(), false));
            }
        }

        while let Some((environment_id, key, is_removed)) = worklist.pop_front() {
            let entry = (environment_id, key.clone());
            if is_removed {
                removed.insert(entry.clone());
            } else if !removed.contains(&entry) {
                modified.insert(entry.clone());
            }
            if !processed.insert(entry) {
                continue;
            }

            // Dependents through the network plus the raw dependency lists
            // (the latter recover the same-scope generated→installed edges
            // omitted from the network).
            let mut dependents: BTreeSet<(u64, String)> = BTreeSet::new();
            let vertex = crate::graph::NetworkVertex::new(environment_id, &key);
            let network_downstream = self.state.lock().network.downstream_vertices(&vertex);
            for v in network_downstream {
                dependents.insert((v.environment, v.key));
            }
            for environment in lattice.environments() {
                for dependent in environment.dependents_of(token, &key) {
                    dependents.insert((environment.id(), dependent));
                }
            }

            for (dependent_env_id, dependent_key) in dependents {
                let Some(environment) = lattice.environment_by_id(dependent_env_id) else {
                    continue;
                };
                if processed.contains(&(dependent_env_id, dependent_key.clone())) {
                    continue;
                }
                let delta = request.delta(dependent_env_id);
                match environment.module_info(token, &dependent_key) {
                    Some(info) if info.is_source => {
                        delta.modified_sources.insert(dependent_key.clone());
                        environment.update_module_info(token, &dependent_key, |i| i.attempted = false);
                    }
                    Some(_) => {
                        delta.modified_modules.insert(dependent_key.clone());
                    }
                    None => {
                        // A generated module with no on-disk info: unload it
                        // and let specialization regenerate it.
                        delta.modified_modules.insert(dependent_key.clone());
                        request.requested.insert(dependent_key.clone());
                    }
                }
                worklist.push_back((dependent_env_id, dependent_key, false));
            }
        }

        (removed, modified)
    }

    /// Step 5: loads every added/modified compiled module, then chases
    /// dependency keys across visible scopes until nothing new can be
    /// loaded.
    #[allow(clippy::too_many_arguments)]
    fn load_to_fixed_point(
        &self,
        token: &EnvironmentToken,
        lattice: &ScopeLattice,
        request: &mut LoadRequest,
        excluded_sources: &BTreeSet<(u64, String)>,
        loaded_now: &mut BTreeMap<(u64, String), Arc<Module>>,
        unresolved: &mut BTreeMap<String, usize>,
        issues: &mut IssueList,
    ) {
        let mut queue: VecDeque<(usize, String)> = VecDeque::new();

        let seeds: Vec<(u64, String)> = request
            .deltas
            .iter()
            .flat_map(|(environment_id, delta)| {
                delta
                    .added_modules
                    .iter()
                    .chain(&delta.modified_modules)
                    .map(move |key| (*environment_id, key.clone()))
            })
            .collect();
        for (environment_id, key) in seeds {
            self.load_into_environment(token, lattice, request, environment_id, &key, loaded_now, &mut queue, issues);
        }
        let narrowest = lattice.levels.len().saturating_sub(1);
        for key in request.requested.clone() {
            queue.push_back((narrowest, key));
        }

        while let Some((requester_level, key)) = queue.pop_front() {
            if lattice.resolve_visible_from(token, &key, requester_level).is_some() {
                continue;
            }
            let mut found = None;
            for (index, level) in lattice.levels.iter().enumerate().take(requester_level + 1).rev() {
                for environment in [&level.installed, &level.generated] {
                    if let Some(info) = environment.module_info(token, &key) {
                        found = Some((index, Arc::clone(environment), info));
                        break;
                    }
                }
                if found.is_some() {
                    break;
                }
            }
            match found {
                Some((_, environment, info)) if info.is_source => {
                    // The dependency has a source; the compilation pass
                    // will provide the module — unless the source was just
                    // excluded for being cyclic.
                    if !excluded_sources.contains(&(environment.id(), key.clone())) {
                        request.delta(environment.id()).added_sources.insert(key);
                    }
                }
                Some((_, environment, _)) => {
                    self.load_into_environment(token, lattice, request, environment.id(), &key, loaded_now, &mut queue, issues);
                }
                None => {
                    // Remember the broadest environment that needed the
                    // key; a specialization, if one applies, is generated
                    // there.
                    unresolved
                        .entry(key)
                        .and_modify(|level| *level = (*level).min(requester_level))
                        .or_insert(requester_level);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn load_into_environment(
        &self,
        token: &EnvironmentToken,
        lattice: &ScopeLattice,
        request: &mut LoadRequest,
        environment_id: u64,
        key: &str,
        loaded_now: &mut BTreeMap<(u64, String), Arc<Module>>,
        queue: &mut VecDeque<(usize, String)>,
        issues: &mut IssueList,
    ) {
        let Some(environment) = lattice.environment_by_id(environment_id) else {
            return;
        };
        if environment.is_module_loaded(token, key) {
            return;
        }
        let module = match request.materialized.remove(&(environment_id, key.to_string())) {
            Some(module) => module,
            None => {
                let Some(info) = environment.module_info(token, key) else {
                    return;
                };
                if info.is_source {
                    return;
                }
                match load_compiled_module(&info) {
                    Ok(module) => Arc::new(module),
                    Err(e) => {
                        issues.append_list(e.issues);
                        return;
                    }
                }
            }
        };

        if !module.compatibility.is_compatible_with(&self.target) {
            issues.append(
                Issue::error("loading module", "incompatible module", "%module is not available for the current target")
                    .with_module_key(key),
            );
            return;
        }

        environment.install_module(token, Arc::clone(&module));
        let level = lattice.level_of_environment(environment_id).unwrap_or(0);

        // A generated module depending on an installed module at the very
        // same scope would make the graph cyclic; drop those edges now and
        // recover the relationship from the raw dependency list on demand.
        if environment.is_generated() {
            if let Some(scope_level) = lattice.levels.get(level) {
                for dependency in &module.dependencies {
                    if scope_level.installed.is_module_loaded(token, dependency) || scope_level.installed.module_info(token, dependency).is_some() {
                        environment.with_graph(token, |graph| graph.remove_edge(key, dependency));
                    }
                }
            }
        }

        for dependency in &module.dependencies {
            queue.push_back((level, dependency.clone()));
        }
        loaded_now.insert((environment_id, key.to_string()), module);
    }

    /// Step 6: groups unresolved keys by target environment and dispatches
    /// specialization generation; each result re-enters the loading
    /// pipeline.
    fn generate_specializations(
        &self,
        token: &EnvironmentToken,
        lattice: &ScopeLattice,
        request: &LoadRequest,
        unresolved: BTreeMap<String, usize>,
        wait: &WaitGroup,
        issues: &mut IssueList,
    ) {
        let generated_target = self.state.lock().generated_target.clone();
        let mut plans = Vec::new();
        for (key, broadest_level) in unresolved {
            let target_environment = lattice
                .levels
                .get(broadest_level)
                .map(|level| Arc::clone(&level.generated))
                .or_else(|| generated_target.clone());
            let Some(target_environment) = target_environment else {
                continue;
            };

            if let Some(elements) = compound_type_elements(&key) {
                plans.push(SpecializationPlan {
                    key,
                    base: None,
                    type_keys: Vec::new(),
                    compound_elements: Some(elements),
                    target_environment,
                });
                continue;
            }

            let mut planned = false;
            for (base_key, type_keys) in generic_base_candidates(&key) {
                if let Some((_, _, base)) = lattice.resolve(token, &base_key) {
                    if base.payload.is_specializable() {
                        plans.push(SpecializationPlan {
                            key: key.clone(),
                            base: Some(base),
                            type_keys,
                            compound_elements: None,
                            target_environment: Arc::clone(&target_environment),
                        });
                        planned = true;
                        break;
                    }
                }
            }

            if !planned && request.requested.contains(&key) && !is_generic_type_key(&key) {
                issues.append(
                    Issue::error("loading module", "Module not found", "%module was not found in any module search path").with_module_key(&key),
                );
            }
        }

        for plan in plans {
            wait.add(1);
            let core = self.strong();
            let environment_id = plan.target_environment.id();
            let wait = wait.clone();
            self.registry.codegen_context().run_async(move |_codegen| {
                // Generation touches the shared backend state, so it stays
                // on the code-generation context.
                let module = match (&plan.base, &plan.compound_elements) {
                    (Some(base), _) => generate_specialized_module(base, &plan.key, &plan.type_keys),
                    (None, Some(elements)) => generate_compound_type(&plan.key, elements.clone()),
                    _ => unreachable!("a plan carries a base or compound elements"),
                };
                debug!(key = %plan.key, "generated specialization");
                let key = plan.key.clone();
                core.registry.environment_context().run_async({
                    let core = Arc::clone(&core);
                    let wait_inner = wait.clone();
                    move |token| {
                        let mut request = LoadRequest::default();
                        request.delta(environment_id).added_modules.insert(key.clone());
                        request.materialized.insert((environment_id, key), Arc::new(module));
                        core.load_modules_and_sources(token, request, &wait_inner);
                        wait_inner.done();
                    }
                });
            });
        }
    }

    /// Step 8: schedules asynchronous compilation for added/modified
    /// sources, plus sources directly depending on a module just loaded.
    #[allow(clippy::too_many_arguments)]
    fn schedule_source_compilation(
        &self,
        token: &EnvironmentToken,
        lattice: &ScopeLattice,
        request: &LoadRequest,
        excluded_sources: &BTreeSet<(u64, String)>,
        loaded_now: &BTreeMap<(u64, String), Arc<Module>>,
        wait: &WaitGroup,
        issues: &mut IssueList,
    ) {
        let mut to_compile: BTreeSet<(u64, String)> = BTreeSet::new();
        for (environment_id, delta) in &request.deltas {
            for key in delta.added_sources.iter().chain(&delta.modified_sources) {
                to_compile.insert((*environment_id, key.clone()));
            }
        }
        // Sources directly depending on a just-loaded module may have been
        // skipped earlier (missing dependency); retry them now.
        for (_, key) in loaded_now.keys() {
            for environment in lattice.environments() {
                let dependents = environment.with_graph(token, |graph| graph.immediately_downstream(key));
                for dependent in dependents {
                    if let Some(info) = environment.module_info(token, &dependent) {
                        if info.is_source && !info.attempted && !environment.is_module_loaded(token, &dependent) {
                            to_compile.insert((environment.id(), dependent.clone()));
                        }
                    }
                }
            }
        }

        // Scheduling hint only: sources nearer the leaves go first.
        let mut ordered: Vec<(u64, String, usize)> = Vec::new();
        for (environment_id, key) in to_compile {
            if excluded_sources.contains(&(environment_id, key.clone())) {
                continue;
            }
            let Some(environment) = lattice.environment_by_id(environment_id) else {
                continue;
            };
            let Some(info) = environment.module_info(token, &key) else {
                continue;
            };
            if info.attempted {
                continue;
            }
            let hint = environment.with_graph(token, |graph| graph.longest_downstream_path(&key));
            environment.update_module_info(token, &key, |i| {
                i.attempted = true;
                i.longest_downstream_path = hint;
            });
            ordered.push((environment_id, key, hint));
        }
        ordered.sort_by_key(|(_, _, hint)| *hint);

        for (environment_id, key, _) in ordered {
            let Some(environment) = lattice.environment_by_id(environment_id) else {
                continue;
            };
            let Some(info) = environment.module_info(token, &key) else {
                continue;
            };
            let source_text = match info.read_source() {
                Ok(text) => text,
                Err(e) => {
                    issues.append(
                        Issue::error("compiling module", "unreadable source", &format!("{e}"))
                            .with_path(&info.file)
                            .with_module_key(&key),
                    );
                    continue;
                }
            };
            let compile_request = SourceCompileRequest {
                key: key.clone(),
                source_path: info.file.clone(),
                source_text,
                target: self.target.clone(),
                header_search_paths: environment.header_search_paths().to_vec(),
            };

            wait.add(1);
            let core = self.strong();
            let wait = wait.clone();
            let compiled_dir = environment.compiled_module_directory();
            self.registry.codegen_context().run_async(move |_codegen| {
                let result = SourceCompilerRegistry::shared().compile(&compile_request);
                let key = compile_request.key.clone();
                core.registry.environment_context().run_async({
                    let core = Arc::clone(&core);
                    let wait_inner = wait.clone();
                    move |token| {
                        let mut request = LoadRequest::default();
                        match result {
                            Ok(module) => {
                                if let Some(dir) = &compiled_dir {
                                    if std::fs::create_dir_all(dir).is_ok() {
                                        let _ = std::fs::write(dir.join(format!("{key}.{COMPILED_MODULE_EXTENSION}")), module.to_artifact_bytes());
                                    }
                                }
                                request.delta(environment_id).added_modules.insert(key.clone());
                                request.materialized.insert((environment_id, key), Arc::new(module));
                            }
                            Err(e) => {
                                request.failed_sources.entry(environment_id).or_default().insert(key, e.issues);
                            }
                        }
                        core.load_modules_and_sources(token, request, &wait_inner);
                        wait_inner.done();
                    }
                });
            });
        }
    }

    /// Steps 9–11: reclassify added/removed pairs as modified, postpone
    /// modules that cannot be reified yet, filter by narrowest-scope-wins,
    /// log, and notify delegates — this compiler's and those of other
    /// compilers sharing an affected environment.
    fn finish_and_notify(
        &self,
        token: &EnvironmentToken,
        lattice: &ScopeLattice,
        request: LoadRequest,
        mut loaded_now: BTreeMap<(u64, String), Arc<Module>>,
        mut removed_now: BTreeMap<(u64, String), Arc<Module>>,
        mut issues: IssueList,
    ) {
        // A failed recompilation turns a previously invalidated module into
        // a removal.
        for (environment_id, failures) in &request.failed_sources {
            let Some(environment) = lattice.environment_by_id(*environment_id) else {
                continue;
            };
            for (key, failure_issues) in failures {
                issues.append_list(failure_issues.clone());
                if let Some(invalidated) = environment.resolve_invalidated(token, key) {
                    removed_now.insert((*environment_id, key.clone()), invalidated.old_module);
                }
            }
        }

        // Retry postponed reifications now that more modules are loaded.
        let pending: Vec<(String, u64)> = self.state.lock().pending_reification.iter().map(|(k, v)| (k.clone(), *v)).collect();
        for (key, environment_id) in pending {
            if let Some(environment) = lattice.environment_by_id(environment_id) {
                if let Some(module) = environment.module(token, &key) {
                    let resolvable = module
                        .unresolved_references(|reference| lattice.resolve(token, reference).is_some())
                        .is_empty();
                    if resolvable {
                        self.state.lock().pending_reification.remove(&key);
                        loaded_now.insert((environment_id, key.clone()), module);
                    }
                } else {
                    self.state.lock().pending_reification.remove(&key);
                }
            }
        }

        let mut changes = LoadedModulesData::default();

        let loaded_now_keys: BTreeSet<(u64, String)> = loaded_now.keys().cloned().collect();
        for ((environment_id, key), module) in &loaded_now {
            let Some(environment) = lattice.environment_by_id(*environment_id) else {
                continue;
            };

            // Reification check: a node class whose referenced types or
            // generic base are not loaded yet is postponed to a later call
            // rather than notified prematurely.
            let unresolved = module.unresolved_references(|reference| lattice.resolve(token, reference).is_some());
            if !unresolved.is_empty() {
                debug!(key = %key, ?unresolved, "postponing notification until references can be reified");
                self.state.lock().pending_reification.insert(key.clone(), *environment_id);
                continue;
            }

            // Scope filtering: only the transition affecting the winning
            // version at the narrowest scope is reported.
            let Some((_, winning_environment, winning_module)) = lattice.resolve(token, key) else {
                continue;
            };
            if winning_environment.id() != *environment_id {
                debug!(key = %key, "change absorbed by a narrower scope");
                continue;
            }

            if let Some(old) = removed_now.remove(&(*environment_id, key.clone())) {
                // Simultaneously added and removed: report as modified.
                changes.modified.insert(
                    key.clone(),
                    ModifiedModule {
                        old,
                        new: Arc::clone(&winning_module),
                    },
                );
                continue;
            }
            if let Some(invalidated) = environment.resolve_invalidated(token, key) {
                changes.modified.insert(
                    key.clone(),
                    ModifiedModule {
                        old: invalidated.old_module,
                        new: Arc::clone(&winning_module),
                    },
                );
                continue;
            }
            // A version at a broader scope was the previous winner: the
            // visible module changed rather than appeared. Versions loaded
            // in this same pass were never visible, so they don't count.
            let broader_version = lattice
                .levels
                .iter()
                .rev()
                .flat_map(|level| [&level.installed, &level.generated])
                .filter(|e| e.id() != *environment_id && !loaded_now_keys.contains(&(e.id(), key.clone())))
                .find_map(|e| e.module(token, key));
            match broader_version {
                Some(old) => {
                    changes.modified.insert(
                        key.clone(),
                        ModifiedModule {
                            old,
                            new: Arc::clone(&winning_module),
                        },
                    );
                }
                None => {
                    changes.added.insert(key.clone(), Arc::clone(&winning_module));
                }
            }
        }

        for ((_, key), old) in removed_now {
            match lattice.resolve(token, &key) {
                Some((_, _, still_visible)) => {
                    // A broader scope still defines the key: the removal
                    // reverts the visible version rather than removing it.
                    changes.modified.insert(key, ModifiedModule { old, new: still_visible });
                }
                None => {
                    changes.removed.insert(key, old);
                }
            }
        }

        self.state.lock().network = lattice.build_network(token);

        changes.issues = issues;
        // Diagnostics are logged before any asynchronous notification so
        // they survive a subsequent crash.
        changes.issues.log_all();

        if changes.is_empty() {
            return;
        }
        info!(
            compiler = self.id,
            added = changes.added.len(),
            modified = changes.modified.len(),
            removed = changes.removed.len(),
            issues = changes.issues.len(),
            "module set changed"
        );

        let affected_environments: BTreeSet<u64> = request.deltas.keys().copied().collect();
        let data = Arc::new(changes);
        self.dispatcher.notify(Arc::clone(&data));
        for environment_id in affected_environments {
            for other in self.registry.other_clients_using(environment_id, self.id) {
                let data = Arc::clone(&data);
                self.registry.environment_context().run_async(move |token| {
                    other.shared_environment_changed(environment_id, &data, token);
                });
            }
        }
    }

    /// Installs or clears an in-memory source override for `key` and runs
    /// the pipeline so the module and its dependents recompile.
    pub(crate) fn apply_source_override(&self, key: &str, source_text: Option<String>) {
        let wait = WaitGroup::new();
        let core = self.strong();
        let key = key.to_string();
        let wait_inner = wait.clone();
        self.registry.environment_context().run_sync(move |token| {
            let lattice = core.state.lock().lattice.clone();
            let Some((_, environment, info)) = lattice.find_module_info(token, &key) else {
                warn!(key = %key, "no source found to override");
                return;
            };
            if !info.is_source {
                warn!(key = %key, "module has no source to override");
                return;
            }
            environment.update_module_info(token, &key, |i| {
                i.source_override = source_text;
                i.attempted = false;
            });
            let mut request = LoadRequest::default();
            request.delta(environment.id()).modified_sources.insert(key);
            core.load_modules_and_sources(token, request, &wait_inner);
        });
        wait.wait();
    }

    /// Reacts to one file event under a search path owned by the lattice.
    pub(crate) fn note_file_event(&self, path: &Path, event: FileEvent) {
        let wait = WaitGroup::new();
        let core = self.strong();
        let path = path.to_path_buf();
        let wait_inner = wait.clone();
        self.registry.environment_context().run_sync(move |token| {
            let lattice = core.state.lock().lattice.clone();
            let Some(parent) = path.parent() else {
                return;
            };
            let Some(environment) = lattice.environments().into_iter().find(|e| e.module_search_paths().iter().any(|p| p == parent)) else {
                warn!(path = %path.display(), "file event outside every search path");
                return;
            };
            let Some(key) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                return;
            };
            let Some(extension) = path.extension().map(|e| e.to_string_lossy().into_owned()) else {
                return;
            };
            let is_source = SourceCompilerRegistry::shared().is_source_extension(&extension);
            if !is_source && extension != COMPILED_MODULE_EXTENSION {
                return;
            }

            let mut request = LoadRequest::default();
            let delta = request.delta(environment.id());
            match event {
                FileEvent::Added => {
                    environment.set_module_info(token, ModuleInfo::new(&key, parent, &path, is_source));
                    if is_source {
                        delta.added_sources.insert(key);
                    } else {
                        delta.added_modules.insert(key);
                    }
                }
                FileEvent::Changed => {
                    if environment.module_info(token, &key).is_none() {
                        environment.set_module_info(token, ModuleInfo::new(&key, parent, &path, is_source));
                    }
                    environment.update_module_info(token, &key, |i| i.attempted = false);
                    if is_source {
                        delta.modified_sources.insert(key);
                    } else {
                        delta.modified_modules.insert(key);
                    }
                }
                FileEvent::Removed => {
                    if is_source {
                        delta.removed_sources.insert(key);
                    } else {
                        delta.removed_modules.insert(key);
                    }
                }
            }
            core.load_modules_and_sources(token, request, &wait_inner);
        });
        wait.wait();
    }

    /// Reloads this compiler's dependents of keys changed in a shared
    /// environment by another compiler. Runs on the environment context.
    pub(crate) fn reload_dependents_of_shared_change(&self, token: &EnvironmentToken, _environment_id: u64, changed_keys: &BTreeSet<String>) {
        let lattice = self.state.lock().lattice.clone();
        let mut request = LoadRequest::default();
        for key in changed_keys {
            // The originating compiler already handled the shared scopes;
            // only this compiler's family and composition scopes need work.
            for level in lattice.levels.iter().filter(|l| l.scope >= crate::scope::Scope::CompositionFamily) {
                for environment in [&level.installed, &level.generated] {
                    for dependent in environment.dependents_of(token, key) {
                        let delta = request.delta(environment.id());
                        match environment.module_info(token, &dependent) {
                            Some(info) if info.is_source => {
                                environment.update_module_info(token, &dependent, |i| i.attempted = false);
                                delta.modified_sources.insert(dependent);
                            }
                            _ => {
                                delta.modified_modules.insert(dependent);
                            }
                        }
                    }
                }
            }
        }
        if !request.is_empty() {
            let wait = WaitGroup::new();
            self.load_modules_and_sources(token, request, &wait);
        }
    }
}

fn source_dependencies(info: &ModuleInfo) -> Option<BTreeSet<String>> {
    if info.file.extension().is_some_and(|e| e == "weave") {
        let text = info.read_source().ok()?;
        let composition = Composition::parse(&text, Some(&info.file)).ok()?;
        return Some(composition.node_class_keys());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_core::module::{NodeClass, Port};

    #[test]
    fn test_compound_type_elements() {
        assert_eq!(compound_type_elements("WeaveList_WeaveInteger"), Some(vec!["WeaveInteger".to_string()]));
        assert_eq!(
            compound_type_elements("WeaveDictionary_WeaveText_WeaveReal"),
            Some(vec!["WeaveText".to_string(), "WeaveReal".to_string()])
        );
        assert_eq!(compound_type_elements("WeaveInteger"), None);
        assert_eq!(compound_type_elements("weave.list.make"), None);
    }

    #[test]
    fn test_generate_specialized_module_substitutes_ports() {
        let base = Module::new(
            "weave.math.add",
            ModulePayload::NodeClass(NodeClass {
                ports: vec![Port::data("a", "WeaveGenericType1"), Port::data("b", "WeaveGenericType1"), Port::event("refresh")],
            }),
        );
        let specialized = generate_specialized_module(&base, "weave.math.add.WeaveInteger", &["WeaveInteger".to_string()]);
        let ModulePayload::SpecializedNodeClass {
            node_class,
            generic_base_key,
            specializations,
        } = &specialized.payload
        else {
            panic!("expected a specialized node class");
        };
        assert_eq!(generic_base_key, "weave.math.add");
        assert_eq!(specializations.get("WeaveGenericType1").unwrap(), "WeaveInteger");
        assert!(node_class.ports.iter().all(|p| p.type_key.as_deref() != Some("WeaveGenericType1")));
        assert!(specialized.dependencies.contains("weave.math.add"));
        assert!(specialized.dependencies.contains("WeaveInteger"));
    }

    #[test]
    fn test_generate_compound_type_depends_on_elements() {
        let module = generate_compound_type("WeaveList_WeaveInteger", vec!["WeaveInteger".to_string()]);
        assert!(module.dependencies.contains("WeaveInteger"));
        assert!(matches!(module.payload, ModulePayload::CompoundType { .. }));
    }
}
