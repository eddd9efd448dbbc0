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

//! Linking orchestration: turning a compiled composition plus its
//! transitive dependencies, module-cache dylibs, and runtime objects into
//! an executable or dynamic library.
//!
//! The live-coding variant keeps a ledger across calls and emits at most
//! two small resource dylibs per call (built-in dependencies and the rest)
//! so a running composition can swap new code in place without a full
//! relink.

use crate::cache::CacheRevision;
use crate::compiler::Compiler;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use weave_common::{Issue, IssueList, IssuesError};
use weave_core::backend::{LinkKind, LinkRequest};
use weave_core::{Composition, Module};

/// Whether linking may reuse prebuilt per-scope module caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Optimization {
    /// Use existing cache dylibs where their manifests cover a dependency;
    /// fall back to standalone artifacts for scopes with no usable cache.
    ExistingModuleCaches,
    /// Always link standalone per-module artifacts.
    NoModuleCaches,
}

/// The output of compiling one composition: verified bitcode plus the
/// direct dependency set it was compiled against.
#[derive(Debug, Clone)]
pub struct CompiledComposition {
    pub name: String,
    pub bitcode: Vec<u8>,
    pub direct_dependencies: BTreeSet<String>,
}

/// Ledger of what a running composition has already been given, carried
/// across repeated live-coding links.
#[derive(Debug, Default)]
pub struct RunningCompositionLibraries {
    linked_dependencies: BTreeSet<String>,
    cache_revisions: BTreeMap<String, CacheRevision>,
    resource_dylib_count: u64,
}

impl RunningCompositionLibraries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn linked_dependencies(&self) -> &BTreeSet<String> {
        &self.linked_dependencies
    }

    /// Cache revisions currently referenced by the running composition.
    pub fn cache_revisions(&self) -> impl Iterator<Item = (&String, &CacheRevision)> {
        self.cache_revisions.iter()
    }
}

impl Compiler {
    /// Compiles a composition graph into verified bitcode via the external
    /// code generator, after loading its node classes and checking each
    /// dependency's compatibility (one diagnostic per incompatible
    /// dependency, then failure).
    pub fn compile_composition(&self, composition: &Composition) -> Result<CompiledComposition, IssuesError> {
        let keys: Vec<String> = composition.node_class_keys().into_iter().collect();
        self.load_modules_if_needed(&keys);

        let mut issues = IssueList::new();
        let visible = self.visible_modules();
        for key in &keys {
            match visible.get(key) {
                None => {
                    issues.append(
                        Issue::error("compiling composition", "Node class not found", "%module is not installed at any scope").with_module_key(key),
                    );
                }
                Some(module) if !module.compatibility.is_compatible_with(self.target()) => {
                    issues.append(
                        Issue::error(
                            "compiling composition",
                            "incompatible dependency",
                            "%module is not available for the current target",
                        )
                        .with_module_key(key),
                    );
                }
                Some(_) => {}
            }
        }
        if issues.has_errors() {
            return Err(IssuesError::new(issues));
        }

        let generator = self.core().generator.lock().clone();
        let bitcode = match generator {
            Some(generator) => generator.generate(composition, self.target())?,
            // Without an attached backend the serialized graph stands in
            // for bitcode; tests and dry runs link it as-is.
            None => serde_json::to_vec(&composition.node_class_keys()).unwrap_or_default(),
        };
        info!(composition = %composition.name, bytes = bitcode.len(), "compiled composition");
        Ok(CompiledComposition {
            name: composition.name.clone(),
            bitcode,
            direct_dependencies: composition.node_class_keys(),
        })
    }

    /// Compiles and writes the bitcode to `output`.
    pub fn compile_composition_to_bitcode(&self, composition: &Composition, output: &Path) -> Result<CompiledComposition, IssuesError> {
        let compiled = self.compile_composition(composition)?;
        std::fs::write(output, &compiled.bitcode)
            .map_err(|e| IssuesError::single(Issue::error("compiling composition", "could not write bitcode", &format!("{e}")).with_path(output)))?;
        Ok(compiled)
    }

    /// The full transitive dependency closure of `compiled`, resolved
    /// through the lattice's raw dependency lists (which also see the
    /// same-scope generated→installed relationship the network omits).
    pub fn transitive_dependencies(&self, compiled: &CompiledComposition) -> BTreeMap<String, Arc<Module>> {
        let visible = self.visible_modules();
        let mut closure: BTreeMap<String, Arc<Module>> = BTreeMap::new();
        let mut queue: Vec<String> = compiled.direct_dependencies.iter().cloned().collect();
        while let Some(key) = queue.pop() {
            if closure.contains_key(&key) {
                continue;
            }
            if let Some(module) = visible.get(&key) {
                queue.extend(module.dependencies.iter().cloned());
                closure.insert(key, Arc::clone(module));
            }
        }
        closure
    }

    pub fn link_composition_to_executable(&self, compiled: &CompiledComposition, output: &Path, optimization: Optimization) -> Result<(), IssuesError> {
        self.link_composition(compiled, output, LinkKind::Executable, optimization)
    }

    pub fn link_composition_to_dynamic_library(&self, compiled: &CompiledComposition, output: &Path, optimization: Optimization) -> Result<(), IssuesError> {
        self.link_composition(compiled, output, LinkKind::DynamicLibrary, optimization)
    }

    fn link_composition(&self, compiled: &CompiledComposition, output: &Path, kind: LinkKind, optimization: Optimization) -> Result<(), IssuesError> {
        let dependencies = self.transitive_dependencies(compiled);
        let staging = staging_directory(output)?;

        let bitcode_input = staging.join(format!("{}.bc", compiled.name));
        write_input(&bitcode_input, &compiled.bitcode)?;
        let mut inputs = vec![bitcode_input];

        // Resolve each dependency to a cache dylib when one covers it (and
        // the optimization allows), otherwise to a standalone artifact.
        let mut used_revisions: Vec<CacheRevision> = Vec::new();
        let mut covered: BTreeSet<String> = BTreeSet::new();
        if optimization == Optimization::ExistingModuleCaches {
            let dependency_keys: BTreeSet<String> = dependencies.keys().cloned().collect();
            for revision in self.current_cache_revisions() {
                let provides: BTreeSet<String> = revision.manifest().module_keys.intersection(&dependency_keys).cloned().collect();
                if !provides.is_empty() {
                    inputs.push(revision.archive_path().to_path_buf());
                    covered.extend(provides);
                    used_revisions.push(revision);
                }
            }
        }
        for (key, module) in &dependencies {
            if covered.contains(key) {
                continue;
            }
            inputs.push(standalone_artifact(&staging, key, module)?);
        }

        let request = LinkRequest {
            output: output.to_path_buf(),
            kind,
            inputs,
            libraries: Vec::new(),
            frameworks: Vec::new(),
            run_path_search_paths: self.run_path_search_paths(),
            target: self.target().to_string(),
            should_adhoc_sign: false,
        };
        let linker = self.core().linker.lock().clone();
        linker.link(&request)?;
        // The revisions stay in use for the duration of the link only; a
        // process keeping the output alive re-links or holds its own
        // revision handles.
        drop(used_revisions);
        info!(output = %output.display(), dependencies = dependencies.len(), "linked composition");
        Ok(())
    }

    /// Live-coding link: emits only what changed since the previous call —
    /// at most one resource dylib for new built-in dependencies and one for
    /// the rest. Returns the paths of the dylibs produced by this call.
    pub fn link_composition_to_create_dynamic_libraries(
        &self,
        compiled: &CompiledComposition,
        output_directory: &Path,
        running: &mut RunningCompositionLibraries,
    ) -> Result<Vec<PathBuf>, IssuesError> {
        let dependencies = self.transitive_dependencies(compiled);
        let staging = staging_directory(&output_directory.join(format!("{}.dylib", compiled.name)))?;

        // Stale cache revisions must be superseded before new code links
        // against them. Keyed by the cache's on-disk location, which is
        // stable across rebuilds of one scope.
        let mut superseded = 0;
        for revision in self.current_cache_revisions() {
            let scope_key = revision.archive_path().parent().unwrap_or(Path::new("")).display().to_string();
            match running.cache_revisions.get(&scope_key) {
                Some(previous) if previous.manifest().content_hash == revision.manifest().content_hash => {}
                Some(_) => {
                    superseded += 1;
                    running.cache_revisions.insert(scope_key, revision);
                }
                None => {
                    running.cache_revisions.insert(scope_key, revision);
                }
            }
        }
        if superseded > 0 {
            debug!(superseded, "cache revisions superseded for running composition");
        }

        let added: BTreeMap<String, Arc<Module>> = dependencies
            .iter()
            .filter(|(key, _)| !running.linked_dependencies.contains(*key))
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        if added.is_empty() {
            return Ok(Vec::new());
        }
        let added_keys: Vec<String> = added.keys().cloned().collect();

        // Partition once: keys whose winning environment is built-in.
        let builtin_keys: BTreeSet<String> = {
            let core = self.core().strong();
            let keys = added_keys.clone();
            self.core().registry.environment_context().run_sync(move |token| {
                let lattice = core.state.lock().lattice.clone();
                keys.into_iter()
                    .filter(|key| lattice.resolve(token, key).is_some_and(|(_, environment, _)| environment.is_builtin()))
                    .collect()
            })
        };
        let (builtin_added, other_added): (Vec<(String, Arc<Module>)>, Vec<(String, Arc<Module>)>) =
            added.into_iter().partition(|(key, _)| builtin_keys.contains(key));

        let linker = self.core().linker.lock().clone();
        let mut produced = Vec::new();
        for (label, group) in [("builtin", builtin_added), ("local", other_added)] {
            if group.is_empty() {
                continue;
            }
            running.resource_dylib_count += 1;
            let output = output_directory.join(format!("lib{}-resource{}-{}.dylib", compiled.name, running.resource_dylib_count, label));
            let mut inputs = Vec::new();
            for (key, module) in &group {
                inputs.push(standalone_artifact(&staging, key, module)?);
            }
            let request = LinkRequest {
                output: output.clone(),
                kind: LinkKind::DynamicLibrary,
                inputs,
                libraries: Vec::new(),
                frameworks: Vec::new(),
                run_path_search_paths: self.run_path_search_paths(),
                target: self.target().to_string(),
                should_adhoc_sign: false,
            };
            linker.link(&request)?;
            produced.push(output);
        }
        info!(new_dylibs = produced.len(), added = added_keys.len(), "live-coding link complete");
        running.linked_dependencies.extend(added_keys);
        Ok(produced)
    }

    /// Current cache revisions of every scope in the lattice, `use()`d for
    /// the caller, narrowest scope first.
    pub fn current_cache_revisions(&self) -> Vec<CacheRevision> {
        let core = self.core().strong();
        self.core().registry.environment_context().run_sync(move |token| {
            let lattice = core.state.lock().lattice.clone();
            lattice
                .levels
                .iter()
                .rev()
                .filter_map(|level| level.installed.cache(token))
                .filter_map(|cache| cache.use_current_revision())
                .collect()
        })
    }

    /// Run-path search paths, narrowest scope to broadest.
    pub fn run_path_search_paths(&self) -> Vec<PathBuf> {
        let core = self.core().strong();
        self.core().registry.environment_context().run_sync(move |_token| {
            let lattice = core.state.lock().lattice.clone();
            lattice
                .levels
                .iter()
                .rev()
                .flat_map(|level| level.installed.module_search_paths().to_vec())
                .collect()
        })
    }

    /// Writes a GCC-style Makefile depfile listing everything `output` was
    /// built from, for build-system integration.
    pub fn write_dependency_file(&self, compiled: &CompiledComposition, output: &Path, depfile: &Path) -> Result<(), IssuesError> {
        let dependencies = self.transitive_dependencies(compiled);
        let mut files: Vec<PathBuf> = Vec::new();
        for module in dependencies.values() {
            if let Some(source) = &module.source_path {
                files.push(source.clone());
            } else if let Some(artifact) = &module.artifact {
                if let Some(file) = &artifact.file {
                    files.push(file.clone());
                }
            }
        }
        files.sort();
        files.dedup();
        let mut contents = format!("{}:", output.display());
        for file in &files {
            contents.push_str(" \\\n  ");
            contents.push_str(&file.display().to_string());
        }
        contents.push('\n');
        std::fs::write(depfile, contents)
            .map_err(|e| IssuesError::single(Issue::error("writing depfile", "could not write depfile", &format!("{e}")).with_path(depfile)))
    }

    /// Emits a C header declaring the entry points of a composition built
    /// as a dynamic library.
    pub fn generate_header_file(&self, compiled: &CompiledComposition, header: &Path) -> Result<(), IssuesError> {
        let guard = compiled.name.replace(['.', '-'], "_").to_uppercase();
        let symbol = compiled.name.replace(['.', '-'], "_");
        let contents = format!(
            "#ifndef {guard}_H\n#define {guard}_H\n\n#ifdef __cplusplus\nextern \"C\" {{\n#endif\n\n\
             void {symbol}_start(void);\nvoid {symbol}_stop(void);\n\n\
             #ifdef __cplusplus\n}}\n#endif\n\n#endif\n"
        );
        std::fs::write(header, contents)
            .map_err(|e| IssuesError::single(Issue::error("generating header", "could not write header", &format!("{e}")).with_path(header)))
    }

    /// Copies the built-in scope's compiled modules into a framework-layout
    /// folder.
    pub fn generate_builtin_modules(&self, framework_path: &Path) -> Result<usize, IssuesError> {
        self.load_modules_if_needed(&[]);
        let core = self.core().strong();
        let framework_path = framework_path.to_path_buf();
        self.core().registry.environment_context().run_sync(move |token| {
            let lattice = core.state.lock().lattice.clone();
            let modules_dir = framework_path.join("Modules");
            std::fs::create_dir_all(&modules_dir)
                .map_err(|e| IssuesError::single(Issue::error("generating built-in modules", "could not create folder", &format!("{e}")).with_path(&modules_dir)))?;
            let mut written = 0;
            for level in lattice.levels.iter().filter(|l| l.installed.is_builtin()) {
                for (key, module) in level.installed.loaded_modules(token) {
                    let path = modules_dir.join(format!("{key}.{}", weave_core::module::COMPILED_MODULE_EXTENSION));
                    std::fs::write(&path, module.to_artifact_bytes())
                        .map_err(|e| IssuesError::single(Issue::error("generating built-in modules", "could not write module", &format!("{e}")).with_path(&path)))?;
                    written += 1;
                }
            }
            Ok(written)
        })
    }

    /// Prebuilds the built-in scope's module cache into a framework-layout
    /// folder.
    pub fn generate_builtin_module_caches(&self, framework_path: &Path) -> Result<(), IssuesError> {
        use crate::cache::{CacheManifest, MakeAvailableRequest, ModuleCache};
        self.load_modules_if_needed(&[]);
        let core = self.core().strong();
        let framework_path = framework_path.to_path_buf();
        let target = self.target().to_string();
        self.core().registry.environment_context().run_sync(move |token| {
            let lattice = core.state.lock().lattice.clone();
            for level in lattice.levels.iter().filter(|l| l.installed.is_builtin()) {
                let (bundle, link_dependencies) = level.installed.cacheable_modules_and_dependencies(token);
                if bundle.is_empty() {
                    continue;
                }
                let manifest = CacheManifest::for_modules(&target, &bundle, link_dependencies);
                let cache = ModuleCache::new("builtin", &framework_path.join("ModuleCaches"));
                cache.make_available(true, &manifest, &bundle, &MakeAvailableRequest::default())?;
            }
            Ok(())
        })
    }
}

fn staging_directory(output: &Path) -> Result<PathBuf, IssuesError> {
    let staging = output.with_extension("link.d");
    std::fs::create_dir_all(&staging)
        .map_err(|e| IssuesError::single(Issue::error("linking composition", "could not create staging folder", &format!("{e}")).with_path(&staging)))?;
    Ok(staging)
}

fn write_input(path: &Path, bytes: &[u8]) -> Result<(), IssuesError> {
    std::fs::write(path, bytes)
        .map_err(|e| IssuesError::single(Issue::error("linking composition", "could not write link input", &format!("{e}")).with_path(path)))
}

/// A dependency with no covering cache links as its own artifact file.
fn standalone_artifact(staging: &Path, key: &str, module: &Module) -> Result<PathBuf, IssuesError> {
    let path = staging.join(format!("{key}.o"));
    let bytes = module.artifact.as_ref().map(|a| a.bitcode.clone()).unwrap_or_default();
    write_input(&path, &bytes)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_libraries_ledger_accumulates() {
        let mut running = RunningCompositionLibraries::new();
        assert!(running.linked_dependencies().is_empty());
        running.linked_dependencies.insert("weave.math.add".to_string());
        running.linked_dependencies.insert("WeaveInteger".to_string());
        assert_eq!(running.linked_dependencies().len(), 2);
    }
}
