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

//! Process-wide shared state: the serial execution contexts, the shared
//! scope environments, and the set of live compiler instances.
//!
//! Constructed once via an atomic-once guard; `reset()` drops the shared
//! environments and compiler registrations for tests.

use crate::cache::ModuleCache;
use crate::context::{CodegenToken, EnvironmentToken, SerialContext};
use crate::delegate::LoadedModulesData;
use crate::environment::Environment;
use crate::scope::{Scope, ScopeLattice, ScopeLevel, family_modules_folder};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use tracing::debug;

/// Where the shared scopes look for modules and keep their caches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopePaths {
    pub builtin_modules: PathBuf,
    pub system_modules: PathBuf,
    pub user_modules: PathBuf,
    pub cache_directory: PathBuf,
}

impl ScopePaths {
    /// Conventional locations for a user session.
    pub fn default_paths() -> Self {
        let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
        Self {
            builtin_modules: PathBuf::from("/usr/local/share/weave/builtin-modules"),
            system_modules: PathBuf::from("/usr/local/share/weave/modules"),
            user_modules: home.join(".weave/modules"),
            cache_directory: home.join(".cache/weave"),
        }
    }

    /// Whether `composition_path` lives directly inside one of the shared
    /// module folders, making the composition itself a shared module.
    pub fn contains_composition(&self, composition_path: &Path) -> Option<Scope> {
        let parent = composition_path.parent()?;
        if parent == self.builtin_modules {
            Some(Scope::BuiltIn)
        } else if parent == self.system_modules {
            Some(Scope::System)
        } else if parent == self.user_modules {
            Some(Scope::User)
        } else {
            None
        }
    }
}

struct SharedScopes {
    builtin: ScopeLevel,
    system: ScopeLevel,
    user: ScopeLevel,
    families: HashMap<PathBuf, ScopeLevel>,
}

impl SharedScopes {
    fn new(paths: &ScopePaths) -> Self {
        let make_level = |scope: Scope, search_path: &Path| {
            let installed = Environment::new(&format!("{} installed", scope.name()), scope == Scope::BuiltIn, false, vec![search_path.to_path_buf()]);
            let generated = Environment::new(&format!("{} generated", scope.name()), scope == Scope::BuiltIn, true, vec![]);
            ScopeLevel { scope, installed, generated }
        };
        Self {
            builtin: make_level(Scope::BuiltIn, &paths.builtin_modules),
            system: make_level(Scope::System, &paths.system_modules),
            user: make_level(Scope::User, &paths.user_modules),
            families: HashMap::new(),
        }
    }
}

/// A compiler instance as seen by the registry: enough to route changes in
/// shared environments to the other compilers using them.
pub trait EnvironmentClient: Send + Sync {
    fn client_id(&self) -> u64;

    /// Whether this compiler's lattice includes the environment.
    fn uses_environment(&self, environment_id: u64) -> bool;

    /// Reacts to modules changed in a shared environment by another
    /// compiler: retains the same change data for this compiler's delegate
    /// and reloads dependents in this compiler's narrower scopes. Runs on
    /// the environment context.
    fn shared_environment_changed(&self, environment_id: u64, changes: &Arc<LoadedModulesData>, token: &EnvironmentToken);
}

/// The process-wide registry.
pub struct CompilerRegistry {
    environment_context: Arc<SerialContext<EnvironmentToken>>,
    codegen_context: Arc<SerialContext<CodegenToken>>,
    scopes: Mutex<HashMap<(String, ScopePaths), Arc<Mutex<SharedScopes>>>>,
    clients: Mutex<Vec<Weak<dyn EnvironmentClient>>>,
}

impl CompilerRegistry {
    fn new() -> Self {
        Self {
            environment_context: SerialContext::new("weave-environment"),
            codegen_context: SerialContext::new("weave-codegen"),
            scopes: Mutex::new(HashMap::new()),
            clients: Mutex::new(Vec::new()),
        }
    }

    /// The singleton, constructed on first use.
    pub fn shared() -> &'static CompilerRegistry {
        static SHARED: OnceLock<CompilerRegistry> = OnceLock::new();
        SHARED.get_or_init(CompilerRegistry::new)
    }

    pub fn environment_context(&self) -> Arc<SerialContext<EnvironmentToken>> {
        Arc::clone(&self.environment_context)
    }

    pub fn codegen_context(&self) -> Arc<SerialContext<CodegenToken>> {
        Arc::clone(&self.codegen_context)
    }

    /// Drops shared environments and client registrations. Tests only; live
    /// compilers must be dropped first.
    pub fn reset(&self) {
        self.scopes.lock().clear();
        self.clients.lock().clear();
    }

    pub fn register_client(&self, client: Weak<dyn EnvironmentClient>) {
        let mut clients = self.clients.lock();
        clients.retain(|c| c.strong_count() > 0);
        clients.push(client);
    }

    /// Live clients other than `except` whose lattices include
    /// `environment_id`.
    pub fn other_clients_using(&self, environment_id: u64, except: u64) -> Vec<Arc<dyn EnvironmentClient>> {
        self.clients
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| c.client_id() != except && c.uses_environment(environment_id))
            .collect()
    }

    fn shared_scopes(&self, target: &str, paths: &ScopePaths) -> Arc<Mutex<SharedScopes>> {
        let mut scopes = self.scopes.lock();
        Arc::clone(
            scopes
                .entry((target.to_string(), paths.clone()))
                .or_insert_with(|| Arc::new(Mutex::new(SharedScopes::new(paths)))),
        )
    }

    /// Builds the scope lattice for a composition, reusing shared
    /// environments and lazily creating family/composition-local pairs.
    ///
    /// Returns the lattice plus the generated environment new ad-hoc or
    /// specialized modules should be written into.
    pub fn lattice_for(&self, target: &str, paths: &ScopePaths, composition_path: Option<&Path>) -> (ScopeLattice, Arc<Environment>) {
        // Build the level list under the scopes lock, but never enter the
        // environment context while holding it.
        let (levels, generated) = {
            let shared = self.shared_scopes(target, paths);
            let mut shared = shared.lock();
            let mut levels = vec![shared.builtin.clone(), shared.system.clone(), shared.user.clone()];

            let generated = 'generated: {
                let Some(composition_path) = composition_path else {
                    break 'generated Arc::clone(&shared.user.generated);
                };

                if let Some(scope) = paths.contains_composition(composition_path) {
                    // The composition is itself a shared module; it
                    // compiles against the shared scopes and generates into
                    // its own scope.
                    break 'generated match scope {
                        Scope::BuiltIn => Arc::clone(&shared.builtin.generated),
                        Scope::System => Arc::clone(&shared.system.generated),
                        _ => Arc::clone(&shared.user.generated),
                    };
                }

                let family_folder = family_modules_folder(composition_path);
                let mut generated_for_new = None;
                if let Some(folder) = &family_folder {
                    let level = shared
                        .families
                        .entry(folder.clone())
                        .or_insert_with(|| {
                            debug!(folder = %folder.display(), "creating composition-family scope");
                            ScopeLevel {
                                scope: Scope::CompositionFamily,
                                installed: Environment::new("composition-family installed", false, false, vec![folder.clone()]),
                                generated: Environment::new("composition-family generated", false, true, vec![]),
                            }
                        })
                        .clone();
                    generated_for_new = Some(Arc::clone(&level.generated));
                    levels.push(level);
                }

                let local = ScopeLevel {
                    scope: Scope::Composition,
                    installed: Environment::new("composition installed", false, false, vec![]),
                    generated: Environment::new("composition generated", false, true, vec![]),
                };
                // A subcomposition inside a custom Modules folder generates
                // into its family; a standalone composition generates into
                // its own pair.
                let generated = generated_for_new.unwrap_or_else(|| Arc::clone(&local.generated));
                levels.push(local);
                generated
            };
            (levels, generated)
        };

        // Attach per-scope caches to the shared installed environments on
        // first use.
        for level in levels.iter().filter(|l| l.scope <= Scope::User) {
            let installed = Arc::clone(&level.installed);
            let scope_name = level.scope.name().to_string();
            let cache_dir = paths.cache_directory.join(&scope_name);
            self.environment_context.run_sync(move |token| {
                if installed.cache(token).is_none() {
                    installed.set_cache(token, Some(Arc::new(ModuleCache::new(&scope_name, &cache_dir))));
                }
            });
        }

        (ScopeLattice { levels }, generated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths_in(dir: &Path) -> ScopePaths {
        ScopePaths {
            builtin_modules: dir.join("builtin"),
            system_modules: dir.join("system"),
            user_modules: dir.join("user"),
            cache_directory: dir.join("cache"),
        }
    }

    #[test]
    fn test_shared_scopes_are_reused_across_lattices() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        let registry = CompilerRegistry::shared();
        let (a, _) = registry.lattice_for("t", &paths, None);
        let (b, _) = registry.lattice_for("t", &paths, None);
        assert_eq!(a.levels[2].installed.id(), b.levels[2].installed.id());
    }

    #[test]
    fn test_standalone_composition_gets_local_scope_pair() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        let registry = CompilerRegistry::shared();
        let composition = dir.path().join("comps/main.weave");
        let (lattice, generated) = registry.lattice_for("t", &paths, Some(&composition));
        assert_eq!(lattice.levels.len(), 4);
        assert_eq!(lattice.levels[3].scope, Scope::Composition);
        assert_eq!(generated.id(), lattice.levels[3].generated.id());
    }

    #[test]
    fn test_subcomposition_in_modules_folder_generates_into_family() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        let registry = CompilerRegistry::shared();
        let composition = dir.path().join("comps/Modules/sub.weave");
        let (lattice, generated) = registry.lattice_for("t", &paths, Some(&composition));
        assert_eq!(lattice.levels.len(), 5);
        assert_eq!(lattice.levels[3].scope, Scope::CompositionFamily);
        assert_eq!(generated.id(), lattice.levels[3].generated.id());
    }

    #[test]
    fn test_composition_inside_shared_scope_uses_shared_generated() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        let registry = CompilerRegistry::shared();
        let composition = paths.user_modules.join("helper.weave");
        let (lattice, generated) = registry.lattice_for("t", &paths, Some(&composition));
        assert_eq!(lattice.levels.len(), 3);
        assert_eq!(generated.id(), lattice.levels[2].generated.id());
    }

    #[test]
    fn test_same_family_reuses_the_family_level() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        let registry = CompilerRegistry::shared();
        let (a, _) = registry.lattice_for("t", &paths, Some(&dir.path().join("c/Modules/x.weave")));
        let (b, _) = registry.lattice_for("t", &paths, Some(&dir.path().join("c/Modules/y.weave")));
        assert_eq!(a.levels[3].installed.id(), b.levels[3].installed.id());
    }
}
