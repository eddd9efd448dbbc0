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

//! Per-source-type module compilers, selected by file extension.
//!
//! The registry is process-wide and constructed once; embedders register
//! compilers for the source languages they support (C, ISF, GLSL, …).
//! The subcomposition compiler for `.weave` sources is built in. `reset()`
//! restores the built-in state for tests.

use crate::composition::{COMPOSITION_EXTENSION, Composition};
use crate::module::{CodeArtifact, Module, ModulePayload, NodeClass, Port};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use weave_common::{Issue, IssuesError};

/// One source file to compile into a module.
#[derive(Debug, Clone)]
pub struct SourceCompileRequest {
    pub key: String,
    pub source_path: PathBuf,
    /// Source text, already resolved through any in-memory override.
    pub source_text: String,
    pub target: String,
    /// Extra include directories for C-family compilers; ignored by the
    /// subcomposition compiler.
    pub header_search_paths: Vec<PathBuf>,
}

/// Compiles one source language into modules.
pub trait SourceCompiler: Send + Sync {
    /// File extensions (without dot) this compiler accepts.
    fn extensions(&self) -> &[&'static str];

    fn compile(&self, request: &SourceCompileRequest) -> Result<Module, IssuesError>;
}

/// Compiles `.weave` subcomposition sources: the subcomposition becomes a
/// node class whose dependencies are the node classes it instantiates.
#[derive(Debug, Default)]
pub struct SubcompositionCompiler;

impl SourceCompiler for SubcompositionCompiler {
    fn extensions(&self) -> &[&'static str] {
        &[COMPOSITION_EXTENSION]
    }

    fn compile(&self, request: &SourceCompileRequest) -> Result<Module, IssuesError> {
        let composition = Composition::parse(&request.source_text, Some(&request.source_path))?;
        let ports = vec![Port::event("refresh")];
        Ok(Module::new(&request.key, ModulePayload::NodeClass(NodeClass { ports }))
            .with_dependencies(composition.node_class_keys())
            .with_artifact(CodeArtifact::in_memory(request.source_text.clone().into_bytes()))
            .with_source_path(&request.source_path))
    }
}

/// Process-wide registry of source compilers keyed by extension.
pub struct SourceCompilerRegistry {
    compilers: RwLock<HashMap<String, Arc<dyn SourceCompiler>>>,
}

impl SourceCompilerRegistry {
    fn with_builtins() -> Self {
        let registry = Self {
            compilers: RwLock::new(HashMap::new()),
        };
        registry.register(Arc::new(SubcompositionCompiler));
        registry
    }

    /// The process-wide registry, constructed on first use.
    pub fn shared() -> &'static SourceCompilerRegistry {
        static SHARED: OnceLock<SourceCompilerRegistry> = OnceLock::new();
        SHARED.get_or_init(SourceCompilerRegistry::with_builtins)
    }

    pub fn register(&self, compiler: Arc<dyn SourceCompiler>) {
        let mut compilers = self.compilers.write();
        for extension in compiler.extensions() {
            compilers.insert((*extension).to_string(), Arc::clone(&compiler));
        }
    }

    pub fn compiler_for_extension(&self, extension: &str) -> Option<Arc<dyn SourceCompiler>> {
        self.compilers.read().get(extension).cloned()
    }

    /// Whether files with this extension are recognized sources.
    pub fn is_source_extension(&self, extension: &str) -> bool {
        self.compilers.read().contains_key(extension)
    }

    /// Restores the built-in compilers, discarding embedder registrations.
    pub fn reset(&self) {
        let fresh = Self::with_builtins();
        *self.compilers.write() = fresh.compilers.into_inner();
    }

    /// Compiles `request` with the compiler registered for its extension.
    /// An unrecognized source type is a recoverable Error.
    pub fn compile(&self, request: &SourceCompileRequest) -> Result<Module, IssuesError> {
        let extension = request
            .source_path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        let compiler = self.compiler_for_extension(&extension).ok_or_else(|| {
            IssuesError::single(
                Issue::error(
                    "compiling module",
                    "unrecognized source type",
                    &format!("no compiler is registered for \".{extension}\" files"),
                )
                .with_path(&request.source_path)
                .with_module_key(&request.key),
            )
        })?;
        compiler.compile(request)
    }
}
