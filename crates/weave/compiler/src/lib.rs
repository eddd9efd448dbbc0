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

//! The Weave compiler core: environment/scope lattice, dependency network,
//! incremental module loader, module-cache lifecycle, delegate
//! notification, and linking orchestration.
//!
//! A [`Compiler`] selects its scope lattice from a composition's path, the
//! module loader populates the lattice's environments, and compiling a
//! composition consults the loaded modules before the linker combines the
//! compiled output with cache dylibs and runtime objects. Delegates are
//! notified of every net change to the loaded-module set, including changes
//! driven by other compiler instances sharing an environment.

pub mod cache;
pub mod compiler;
pub mod context;
pub mod delegate;
pub mod environment;
pub mod graph;
pub mod linker;
pub mod loader;
pub mod registry;
pub mod scope;

pub use cache::{CacheManifest, CacheRevision, MakeAvailableRequest, ModuleCache};
pub use compiler::Compiler;
pub use delegate::{CompilerDelegate, CompletionToken, DelegateDispatcher, LoadedModulesData, ModifiedModule};
pub use environment::Environment;
pub use graph::{DependencyGraph, DependencyNetwork, NetworkVertex};
pub use linker::{CompiledComposition, Optimization, RunningCompositionLibraries};
pub use loader::ModuleSetDelta;
pub use registry::{CompilerRegistry, ScopePaths};
pub use scope::{Scope, ScopeLattice, ScopeLevel};
