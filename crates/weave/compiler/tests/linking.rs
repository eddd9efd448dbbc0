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

//! End-to-end tests of linking orchestration and module-cache lifecycle.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use weave_common::IssuesError;
use weave_compiler::{Compiler, Optimization, RunningCompositionLibraries, ScopePaths};
use weave_core::backend::{LinkRequest, Linker};
use weave_core::{CodeArtifact, Composition, Module, ModulePayload};

fn scope_paths(dir: &Path) -> ScopePaths {
    ScopePaths {
        builtin_modules: dir.join("builtin"),
        system_modules: dir.join("system"),
        user_modules: dir.join("user"),
        cache_directory: dir.join("cache"),
    }
}

fn make_scope_dirs(paths: &ScopePaths) {
    for dir in [&paths.builtin_modules, &paths.system_modules, &paths.user_modules, &paths.cache_directory] {
        std::fs::create_dir_all(dir).unwrap();
    }
}

fn write_compiled_module(dir: &Path, module: &Module) -> PathBuf {
    let path = dir.join(format!("{}.wbc", module.key));
    std::fs::write(&path, module.to_artifact_bytes()).unwrap();
    path
}

fn node_class(key: &str, deps: &[&str]) -> Module {
    Module::new(key, ModulePayload::NodeClass(weave_core::module::NodeClass::default()))
        .with_dependencies(deps.iter().copied())
        .with_artifact(CodeArtifact::in_memory(format!("bitcode:{key}").into_bytes()))
}

fn library(key: &str) -> Module {
    Module::new(key, ModulePayload::Library).with_artifact(CodeArtifact::in_memory(format!("bitcode:{key}").into_bytes()))
}

/// Records link requests and fabricates outputs instead of running a
/// system linker.
#[derive(Default)]
struct RecordingLinker {
    requests: Mutex<Vec<LinkRequest>>,
}

impl RecordingLinker {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Linker for RecordingLinker {
    fn link(&self, request: &LinkRequest) -> Result<(), IssuesError> {
        std::fs::write(&request.output, b"linked").unwrap();
        self.requests.lock().push(request.clone());
        Ok(())
    }
}

fn compiler_with_modules(dir: &Path) -> (Compiler, ScopePaths, Arc<RecordingLinker>) {
    let paths = scope_paths(dir);
    make_scope_dirs(&paths);
    write_compiled_module(&paths.user_modules, &node_class("weave.image.blur", &["weave.image.lib"]));
    write_compiled_module(&paths.user_modules, &library("weave.image.lib"));
    let compiler = Compiler::new("test-target", paths.clone(), None);
    let linker = RecordingLinker::new();
    compiler.set_linker(linker.clone());
    (compiler, paths, linker)
}

fn blur_composition() -> Composition {
    Composition::parse("composition blurred\nnode b weave.image.blur\n", None).unwrap()
}

#[test]
fn test_compile_composition_gathers_direct_dependencies() {
    let dir = tempfile::tempdir().unwrap();
    let (compiler, _, _) = compiler_with_modules(dir.path());
    let compiled = compiler.compile_composition(&blur_composition()).unwrap();
    assert_eq!(compiled.name, "blurred");
    assert!(compiled.direct_dependencies.contains("weave.image.blur"));
    assert!(!compiled.bitcode.is_empty());
}

#[test]
fn test_compile_composition_rejects_missing_node_class() {
    let dir = tempfile::tempdir().unwrap();
    let (compiler, _, _) = compiler_with_modules(dir.path());
    let composition = Composition::parse("node g weave.ghost\n", None).unwrap();
    let err = compiler.compile_composition(&composition).unwrap_err();
    assert!(err.issues.issues().iter().any(|i| i.summary == "Node class not found"));
}

#[test]
fn test_link_without_caches_falls_back_to_standalone_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let (compiler, _, linker) = compiler_with_modules(dir.path());
    let compiled = compiler.compile_composition(&blur_composition()).unwrap();
    let output = dir.path().join("blurred");

    // No cache has been built; ExistingModuleCaches must still succeed.
    compiler.link_composition_to_executable(&compiled, &output, Optimization::ExistingModuleCaches).unwrap();
    assert!(output.is_file());

    let requests = linker.requests.lock();
    let inputs: Vec<String> = requests[0].inputs.iter().map(|p| p.display().to_string()).collect();
    assert!(inputs.iter().any(|i| i.ends_with("weave.image.blur.o")), "dependencies link as standalone artifacts: {inputs:?}");
    assert!(inputs.iter().any(|i| i.ends_with("weave.image.lib.o")), "transitive dependencies are included: {inputs:?}");
}

#[test]
fn test_link_uses_cache_archive_when_available() {
    let dir = tempfile::tempdir().unwrap();
    let (compiler, _, linker) = compiler_with_modules(dir.path());
    compiler.load_modules_if_needed(&[]);
    let revisions = compiler.make_module_caches_available(true);
    assert!(!revisions.is_empty(), "the user scope has cacheable modules");

    let compiled = compiler.compile_composition(&blur_composition()).unwrap();
    let output = dir.path().join("blurred-cached");
    compiler.link_composition_to_executable(&compiled, &output, Optimization::ExistingModuleCaches).unwrap();

    let requests = linker.requests.lock();
    let inputs: Vec<String> = requests.last().unwrap().inputs.iter().map(|p| p.display().to_string()).collect();
    assert!(inputs.iter().any(|i| i.contains("libWeaveModuleCache")), "the cache dylib is a link input: {inputs:?}");
    assert!(!inputs.iter().any(|i| i.ends_with("weave.image.blur.o")), "cached modules do not also link standalone: {inputs:?}");
}

#[test]
fn test_no_module_caches_optimization_ignores_cache() {
    let dir = tempfile::tempdir().unwrap();
    let (compiler, _, linker) = compiler_with_modules(dir.path());
    compiler.load_modules_if_needed(&[]);
    compiler.make_module_caches_available(true);

    let compiled = compiler.compile_composition(&blur_composition()).unwrap();
    let output = dir.path().join("blurred-plain");
    compiler.link_composition_to_executable(&compiled, &output, Optimization::NoModuleCaches).unwrap();

    let requests = linker.requests.lock();
    let inputs: Vec<String> = requests.last().unwrap().inputs.iter().map(|p| p.display().to_string()).collect();
    assert!(!inputs.iter().any(|i| i.contains("libWeaveModuleCache")));
    assert!(inputs.iter().any(|i| i.ends_with("weave.image.blur.o")));
}

#[test]
fn test_make_module_caches_available_twice_does_not_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let (compiler, _, _) = compiler_with_modules(dir.path());
    compiler.load_modules_if_needed(&[]);

    let first = compiler.make_module_caches_available(true);
    let second = compiler.make_module_caches_available(true);
    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.archive_path(), b.archive_path(), "an up-to-date cache is not rebuilt");
    }
}

#[test]
fn test_live_coding_links_only_added_dependencies() {
    let dir = tempfile::tempdir().unwrap();
    let paths = scope_paths(dir.path());
    make_scope_dirs(&paths);
    write_compiled_module(&paths.user_modules, &node_class("weave.image.blur", &[]));
    write_compiled_module(&paths.user_modules, &node_class("weave.image.sharpen", &[]));
    let compiler = Compiler::new("test-target", paths, None);
    let linker = RecordingLinker::new();
    compiler.set_linker(linker.clone());

    let output_dir = dir.path().join("live");
    std::fs::create_dir_all(&output_dir).unwrap();
    let mut running = RunningCompositionLibraries::new();

    let first = compiler.compile_composition(&blur_composition()).unwrap();
    let produced = compiler.link_composition_to_create_dynamic_libraries(&first, &output_dir, &mut running).unwrap();
    assert_eq!(produced.len(), 1, "one resource dylib for the first link");

    // Relinking the unchanged composition produces nothing new.
    let again = compiler.link_composition_to_create_dynamic_libraries(&first, &output_dir, &mut running).unwrap();
    assert!(again.is_empty());

    // Growing the composition produces one dylib with only the additions.
    let grown = Composition::parse("composition blurred\nnode b weave.image.blur\nnode s weave.image.sharpen\n", None).unwrap();
    let second = compiler.compile_composition(&grown).unwrap();
    let produced = compiler.link_composition_to_create_dynamic_libraries(&second, &output_dir, &mut running).unwrap();
    assert_eq!(produced.len(), 1);
    let request = linker.requests.lock().last().unwrap().clone();
    let inputs: Vec<String> = request.inputs.iter().map(|p| p.display().to_string()).collect();
    assert!(inputs.iter().any(|i| i.ends_with("weave.image.sharpen.o")));
    assert!(!inputs.iter().any(|i| i.ends_with("weave.image.blur.o")), "already-linked dependencies are not relinked: {inputs:?}");
}

#[test]
fn test_dependency_file_lists_module_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let (compiler, _, _) = compiler_with_modules(dir.path());
    let compiled = compiler.compile_composition(&blur_composition()).unwrap();
    let output = dir.path().join("blurred");
    let depfile = dir.path().join("blurred.d");
    compiler.write_dependency_file(&compiled, &output, &depfile).unwrap();

    let contents = std::fs::read_to_string(&depfile).unwrap();
    assert!(contents.starts_with(&format!("{}:", output.display())));
    assert!(contents.contains("weave.image.blur.wbc"));
}

#[test]
fn test_header_file_declares_entry_points() {
    let dir = tempfile::tempdir().unwrap();
    let (compiler, _, _) = compiler_with_modules(dir.path());
    let compiled = compiler.compile_composition(&blur_composition()).unwrap();
    let header = dir.path().join("blurred.h");
    compiler.generate_header_file(&compiled, &header).unwrap();

    let contents = std::fs::read_to_string(&header).unwrap();
    assert!(contents.contains("#ifndef BLURRED_H"));
    assert!(contents.contains("void blurred_start(void);"));
    assert!(contents.contains("void blurred_stop(void);"));
}

#[test]
fn test_failed_link_aborts_only_that_operation() {
    struct FailingLinker;
    impl Linker for FailingLinker {
        fn link(&self, _request: &LinkRequest) -> Result<(), IssuesError> {
            Err(IssuesError::single(weave_common::Issue::error("linking composition", "linker failed", "exit status 1")))
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let (compiler, _, _) = compiler_with_modules(dir.path());
    let compiled = compiler.compile_composition(&blur_composition()).unwrap();
    compiler.set_linker(Arc::new(FailingLinker));
    let err = compiler
        .link_composition_to_executable(&compiled, &dir.path().join("broken"), Optimization::NoModuleCaches)
        .unwrap_err();
    assert!(err.issues.has_errors());

    // The compiler remains usable: module queries and recompiles still work.
    assert!(compiler.module("weave.image.blur").is_some());
    let recovered = RecordingLinker::new();
    compiler.set_linker(recovered);
    compiler
        .link_composition_to_executable(&compiled, &dir.path().join("fixed"), Optimization::NoModuleCaches)
        .unwrap();
}
