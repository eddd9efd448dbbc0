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

//! The scope lattice: ordered scope levels from broadest (built-in) to
//! narrowest (composition-local), each holding an installed and a generated
//! environment.
//!
//! A module visible at several scopes resolves to the narrowest scope that
//! defines it. The generated environment of a level sits downstream of the
//! installed environment at the same level and of every broader level.

use crate::context::EnvironmentToken;
use crate::environment::Environment;
use crate::graph::{DependencyNetwork, NetworkVertex};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use weave_core::{Module, ModuleInfo};

/// A level of module visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Scope {
    BuiltIn,
    System,
    User,
    CompositionFamily,
    Composition,
}

impl Scope {
    pub fn name(&self) -> &'static str {
        match self {
            Scope::BuiltIn => "built-in",
            Scope::System => "system",
            Scope::User => "user",
            Scope::CompositionFamily => "composition-family",
            Scope::Composition => "composition",
        }
    }
}

/// One level of the lattice: the scope plus its environment pair.
#[derive(Clone)]
pub struct ScopeLevel {
    pub scope: Scope,
    pub installed: Arc<Environment>,
    pub generated: Arc<Environment>,
}

/// The ordered levels applicable to one composition, broadest first.
#[derive(Clone, Default)]
pub struct ScopeLattice {
    pub levels: Vec<ScopeLevel>,
}

impl ScopeLattice {
    /// Every environment, broadest level first, installed before generated.
    pub fn environments(&self) -> Vec<Arc<Environment>> {
        let mut environments = Vec::with_capacity(self.levels.len() * 2);
        for level in &self.levels {
            environments.push(Arc::clone(&level.installed));
            environments.push(Arc::clone(&level.generated));
        }
        environments
    }

    pub fn environment_by_id(&self, id: u64) -> Option<Arc<Environment>> {
        self.environments().into_iter().find(|e| e.id() == id)
    }

    /// Index of the level owning the environment with `id`.
    pub fn level_of_environment(&self, id: u64) -> Option<usize> {
        self.levels
            .iter()
            .position(|level| level.installed.id() == id || level.generated.id() == id)
    }

    pub fn contains_environment(&self, id: u64) -> bool {
        self.level_of_environment(id).is_some()
    }

    /// Resolves `key` to the module at the narrowest scope defining it.
    pub fn resolve(&self, token: &EnvironmentToken, key: &str) -> Option<(usize, Arc<Environment>, Arc<Module>)> {
        self.resolve_visible_from(token, key, self.levels.len().saturating_sub(1))
    }

    /// Resolves `key` as seen from `level`: the narrowest level not
    /// narrower than `level` that defines it.
    pub fn resolve_visible_from(&self, token: &EnvironmentToken, key: &str, level: usize) -> Option<(usize, Arc<Environment>, Arc<Module>)> {
        for (index, scope_level) in self.levels.iter().enumerate().take(level + 1).rev() {
            for environment in [&scope_level.installed, &scope_level.generated] {
                if let Some(module) = environment.module(token, key) {
                    return Some((index, Arc::clone(environment), module));
                }
            }
        }
        None
    }

    /// Finds the ModuleInfo for `key` at the narrowest level that has one.
    pub fn find_module_info(&self, token: &EnvironmentToken, key: &str) -> Option<(usize, Arc<Environment>, ModuleInfo)> {
        for (index, scope_level) in self.levels.iter().enumerate().rev() {
            for environment in [&scope_level.installed, &scope_level.generated] {
                if let Some(info) = environment.module_info(token, key) {
                    return Some((index, Arc::clone(environment), info));
                }
            }
        }
        None
    }

    /// The winner per key across all scopes: what a composition compiled
    /// against this lattice actually sees.
    pub fn directly_visible_modules(&self, token: &EnvironmentToken) -> BTreeMap<String, Arc<Module>> {
        let mut visible = BTreeMap::new();
        // Broad to narrow so narrower levels overwrite broader ones.
        for level in &self.levels {
            for environment in [&level.installed, &level.generated] {
                for (key, module) in environment.loaded_modules(token) {
                    visible.insert(key, module);
                }
            }
        }
        visible
    }

    /// Composes every environment's modules into the cross-environment
    /// dependency network.
    ///
    /// The structurally-cyclic relationship — a generated module depending
    /// on an installed module at the same level — is omitted; it is
    /// re-derived from raw dependency lists where needed.
    pub fn build_network(&self, token: &EnvironmentToken) -> DependencyNetwork {
        let mut network = DependencyNetwork::new();
        for (level_index, level) in self.levels.iter().enumerate() {
            for environment in [&level.installed, &level.generated] {
                for (key, module) in environment.loaded_modules(token) {
                    let dependent = NetworkVertex::new(environment.id(), &key);
                    network.add_vertex(dependent.clone());
                    for dependency in &module.dependencies {
                        let Some((dep_level, dep_env, _)) = self.resolve_visible_from(token, dependency, level_index) else {
                            continue;
                        };
                        let same_scope_generated_to_installed = environment.is_generated() && !dep_env.is_generated() && dep_level == level_index;
                        if same_scope_generated_to_installed {
                            continue;
                        }
                        network.add_edge(dependent.clone(), NetworkVertex::new(dep_env.id(), dependency));
                    }
                }
            }
        }
        network
    }
}

/// Whether a composition at `path` sits inside a custom `Modules` folder,
/// which places it in a composition-family scope.
pub fn family_modules_folder(composition_path: &Path) -> Option<PathBuf> {
    let parent = composition_path.parent()?;
    if parent.file_name().is_some_and(|n| n == "Modules") {
        Some(parent.to_path_buf())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextToken;
    use weave_core::ModulePayload;

    fn token() -> EnvironmentToken {
        EnvironmentToken::issue()
    }

    fn library(key: &str, deps: &[&str]) -> Arc<Module> {
        Arc::new(Module::new(key, ModulePayload::Library).with_dependencies(deps.iter().copied()))
    }

    fn lattice_of(levels: &[(Scope, &str)]) -> ScopeLattice {
        ScopeLattice {
            levels: levels
                .iter()
                .map(|(scope, name)| ScopeLevel {
                    scope: *scope,
                    installed: Environment::new(&format!("{name} installed"), *scope == Scope::BuiltIn, false, vec![]),
                    generated: Environment::new(&format!("{name} generated"), *scope == Scope::BuiltIn, true, vec![]),
                })
                .collect(),
        }
    }

    #[test]
    fn test_narrowest_scope_wins() {
        let token = token();
        let lattice = lattice_of(&[(Scope::System, "system"), (Scope::User, "user")]);
        lattice.levels[0].installed.install_module(&token, library("weave.test.shadowed", &[]));
        lattice.levels[1]
            .installed
            .install_module(&token, library("weave.test.shadowed", &["weave.extra"]));

        let (level, _, module) = lattice.resolve(&token, "weave.test.shadowed").unwrap();
        assert_eq!(level, 1);
        assert!(module.dependencies.contains("weave.extra"));
    }

    #[test]
    fn test_visibility_does_not_reach_narrower_scopes() {
        let token = token();
        let lattice = lattice_of(&[(Scope::System, "system"), (Scope::User, "user")]);
        lattice.levels[1].installed.install_module(&token, library("weave.test.local", &[]));
        assert!(lattice.resolve_visible_from(&token, "weave.test.local", 0).is_none());
        assert!(lattice.resolve_visible_from(&token, "weave.test.local", 1).is_some());
    }

    #[test]
    fn test_network_omits_same_scope_generated_to_installed_edge() {
        let token = token();
        let lattice = lattice_of(&[(Scope::User, "user")]);
        lattice.levels[0].installed.install_module(&token, library("weave.list.make", &[]));
        lattice.levels[0]
            .generated
            .install_module(&token, library("weave.list.make.WeaveInteger", &["weave.list.make"]));

        let network = lattice.build_network(&token);
        let generated_vertex = NetworkVertex::new(lattice.levels[0].generated.id(), "weave.list.make.WeaveInteger");
        assert!(
            network.upstream_vertices(&generated_vertex).is_empty(),
            "the same-scope generated→installed edge must not appear in the network"
        );
        // Raw inspection still recovers the dependency.
        assert!(
            lattice.levels[0]
                .generated
                .dependents_of(&token, "weave.list.make")
                .contains("weave.list.make.WeaveInteger")
        );
    }

    #[test]
    fn test_network_keeps_cross_scope_edges() {
        let token = token();
        let lattice = lattice_of(&[(Scope::System, "system"), (Scope::User, "user")]);
        lattice.levels[0].installed.install_module(&token, library("WeaveInteger", &[]));
        lattice.levels[1]
            .generated
            .install_module(&token, library("weave.list.make.WeaveInteger", &["WeaveInteger"]));

        let network = lattice.build_network(&token);
        let vertex = NetworkVertex::new(lattice.levels[1].generated.id(), "weave.list.make.WeaveInteger");
        let upstream = network.upstream_vertices(&vertex);
        assert!(upstream.contains(&NetworkVertex::new(lattice.levels[0].installed.id(), "WeaveInteger")));
    }

    #[test]
    fn test_family_modules_folder_detection() {
        assert_eq!(
            family_modules_folder(Path::new("/home/u/comps/Modules/sub.weave")),
            Some(PathBuf::from("/home/u/comps/Modules"))
        );
        assert_eq!(family_modules_folder(Path::new("/home/u/comps/main.weave")), None);
    }
}
