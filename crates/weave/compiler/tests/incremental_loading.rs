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

//! End-to-end tests of the incremental module loader: scanning, scope
//! shadowing, cycle rejection, source compilation, specialization, and
//! delegate notification.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use weave_common::Compatibility;
use weave_compiler::{Compiler, CompilerDelegate, CompletionToken, LoadedModulesData, ScopePaths};
use weave_core::module::{NodeClass, Port};
use weave_core::{CodeArtifact, Module, ModulePayload};

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

fn library(key: &str, deps: &[&str]) -> Module {
    Module::new(key, ModulePayload::Library)
        .with_dependencies(deps.iter().copied())
        .with_artifact(CodeArtifact::in_memory(format!("bitcode:{key}").into_bytes()))
}

fn type_module(key: &str) -> Module {
    Module::new(key, ModulePayload::Type).with_artifact(CodeArtifact::in_memory(format!("bitcode:{key}").into_bytes()))
}

fn generic_node_class(key: &str) -> Module {
    Module::new(
        key,
        ModulePayload::NodeClass(NodeClass {
            ports: vec![Port::data("a", "WeaveGenericType1"), Port::data("b", "WeaveGenericType1"), Port::event("refresh")],
        }),
    )
    .with_artifact(CodeArtifact::in_memory(format!("bitcode:{key}").into_bytes()))
}

/// Records every delegate notification for later assertions.
#[derive(Default)]
struct Recorder {
    added: Mutex<Vec<String>>,
    modified: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
    error_summaries: Mutex<Vec<String>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn clear(&self) {
        self.added.lock().clear();
        self.modified.lock().clear();
        self.removed.lock().clear();
        self.error_summaries.lock().clear();
    }

    fn count_of(&self, list: &Mutex<Vec<String>>, key: &str) -> usize {
        list.lock().iter().filter(|k| *k == key).count()
    }
}

impl CompilerDelegate for Recorder {
    fn loaded_modules(&self, changes: &Arc<LoadedModulesData>, completion: CompletionToken) {
        self.added.lock().extend(changes.added.keys().cloned());
        self.modified.lock().extend(changes.modified.keys().cloned());
        self.removed.lock().extend(changes.removed.keys().cloned());
        self.error_summaries
            .lock()
            .extend(changes.issues.issues().iter().map(|i| i.summary.clone()));
        completion.complete();
    }
}

#[test]
fn test_first_request_scans_and_second_request_reuses() {
    let dir = tempfile::tempdir().unwrap();
    let paths = scope_paths(dir.path());
    make_scope_dirs(&paths);
    write_compiled_module(&paths.user_modules, &generic_node_class("weave.math.add"));
    write_compiled_module(&paths.user_modules, &type_module("WeaveInteger"));

    let compiler = Compiler::new("test-target", paths, None);
    let first = compiler.module("weave.math.add.WeaveInteger").expect("specialization is generated and loaded");
    assert!(matches!(first.payload, ModulePayload::SpecializedNodeClass { .. }));

    let second = compiler.module("weave.math.add.WeaveInteger").expect("still loaded");
    assert!(Arc::ptr_eq(&first, &second), "second request returns the same module without rescanning");
}

#[test]
fn test_specialization_substitutes_concrete_types() {
    let dir = tempfile::tempdir().unwrap();
    let paths = scope_paths(dir.path());
    make_scope_dirs(&paths);
    write_compiled_module(&paths.user_modules, &generic_node_class("weave.math.multiply"));
    write_compiled_module(&paths.user_modules, &type_module("WeaveReal"));

    let compiler = Compiler::new("test-target", paths, None);
    let module = compiler.module("weave.math.multiply.WeaveReal").unwrap();
    let ModulePayload::SpecializedNodeClass { node_class, generic_base_key, .. } = &module.payload else {
        panic!("expected a specialized node class");
    };
    assert_eq!(generic_base_key, "weave.math.multiply");
    assert!(node_class.ports.iter().any(|p| p.type_key.as_deref() == Some("WeaveReal")));
    assert!(module.dependencies.contains("weave.math.multiply"));
    assert!(module.dependencies.contains("WeaveReal"));
}

#[test]
fn test_new_subcomposition_is_compiled_and_reported_added_once() {
    let dir = tempfile::tempdir().unwrap();
    let paths = scope_paths(dir.path());
    make_scope_dirs(&paths);
    write_compiled_module(&paths.user_modules, &library("weave.math.count", &[]));

    let compiler = Compiler::new("test-target", paths.clone(), None);
    let recorder = Recorder::new();
    compiler.set_delegate(Some(recorder.clone()));
    compiler.load_modules_if_needed(&[]);
    compiler.drain_delegate_notifications();
    recorder.clear();

    let foo = paths.user_modules.join("foo.weave");
    std::fs::write(&foo, "node a weave.math.count\n").unwrap();
    compiler.note_file_added(&foo);
    compiler.drain_delegate_notifications();

    assert_eq!(recorder.count_of(&recorder.added, "foo"), 1, "exactly one added notification for the new subcomposition");
    let module = compiler.module("foo").expect("subcomposition compiled and loaded");
    assert!(module.dependencies.contains("weave.math.count"));
}

#[test]
fn test_narrowest_scope_wins_and_removal_reverts_to_broader() {
    let dir = tempfile::tempdir().unwrap();
    let paths = scope_paths(dir.path());
    make_scope_dirs(&paths);
    write_compiled_module(&paths.system_modules, &library("weave.test.dup", &["system-flavor"]));
    let user_copy = write_compiled_module(&paths.user_modules, &library("weave.test.dup", &["user-flavor"]));

    let compiler = Compiler::new("test-target", paths, None);
    let recorder = Recorder::new();
    compiler.set_delegate(Some(recorder.clone()));

    let winner = compiler.module("weave.test.dup").unwrap();
    assert!(winner.dependencies.contains("user-flavor"), "user scope shadows system scope");
    compiler.drain_delegate_notifications();
    recorder.clear();

    compiler.note_file_removed(&user_copy);
    compiler.drain_delegate_notifications();

    assert_eq!(recorder.count_of(&recorder.modified, "weave.test.dup"), 1, "reverting to the broader scope is a modification");
    assert_eq!(recorder.count_of(&recorder.removed, "weave.test.dup"), 0);
    assert_eq!(recorder.count_of(&recorder.added, "weave.test.dup"), 0);

    let reverted = compiler.module("weave.test.dup").unwrap();
    assert!(reverted.dependencies.contains("system-flavor"));
}

#[test]
fn test_self_referential_subcomposition_is_excluded() {
    let dir = tempfile::tempdir().unwrap();
    let paths = scope_paths(dir.path());
    make_scope_dirs(&paths);
    std::fs::write(paths.user_modules.join("loopy.weave"), "node inner loopy\n").unwrap();

    let compiler = Compiler::new("test-target", paths, None);
    let recorder = Recorder::new();
    compiler.set_delegate(Some(recorder.clone()));
    compiler.load_modules_if_needed(&[]);
    compiler.drain_delegate_notifications();

    assert_eq!(
        recorder
            .error_summaries
            .lock()
            .iter()
            .filter(|s| *s == "Subcomposition contains itself")
            .count(),
        1,
        "exactly one cycle error"
    );
    assert!(compiler.module("loopy").is_none(), "the cyclic subcomposition is not loaded");
}

#[test]
fn test_indirect_subcomposition_cycle_is_excluded() {
    let dir = tempfile::tempdir().unwrap();
    let paths = scope_paths(dir.path());
    make_scope_dirs(&paths);
    std::fs::write(paths.user_modules.join("ping.weave"), "node p pong\n").unwrap();
    std::fs::write(paths.user_modules.join("pong.weave"), "node p ping\n").unwrap();

    let compiler = Compiler::new("test-target", paths, None);
    let recorder = Recorder::new();
    compiler.set_delegate(Some(recorder.clone()));
    compiler.load_modules_if_needed(&[]);
    compiler.drain_delegate_notifications();

    assert!(compiler.module("ping").is_none());
    assert!(compiler.module("pong").is_none());
    assert!(
        recorder.error_summaries.lock().iter().any(|s| s == "Subcomposition contains itself"),
        "the cycle is reported"
    );
}

#[test]
fn test_rescan_without_changes_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let paths = scope_paths(dir.path());
    make_scope_dirs(&paths);
    write_compiled_module(&paths.user_modules, &library("weave.test.stable", &[]));
    std::fs::write(paths.user_modules.join("steady.weave"), "node a weave.test.stable\n").unwrap();

    let compiler = Compiler::new("test-target", paths, None);
    let recorder = Recorder::new();
    compiler.set_delegate(Some(recorder.clone()));
    compiler.load_modules_if_needed(&[]);
    compiler.drain_delegate_notifications();
    recorder.clear();

    compiler.load_modules_if_needed(&[]);
    compiler.drain_delegate_notifications();
    assert!(recorder.added.lock().is_empty());
    assert!(recorder.modified.lock().is_empty());
    assert!(recorder.removed.lock().is_empty());
}

#[test]
fn test_override_and_revert_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let paths = scope_paths(dir.path());
    make_scope_dirs(&paths);
    write_compiled_module(&paths.user_modules, &library("weave.event.fire", &[]));
    write_compiled_module(&paths.user_modules, &library("weave.event.spark", &[]));
    std::fs::write(paths.user_modules.join("reactor.weave"), "node a weave.event.fire\n").unwrap();

    let compiler = Compiler::new("test-target", paths, None);
    let recorder = Recorder::new();
    compiler.set_delegate(Some(recorder.clone()));
    compiler.load_modules_if_needed(&[]);
    compiler.drain_delegate_notifications();
    recorder.clear();

    compiler.set_source_override("reactor", "node a weave.event.spark\n");
    compiler.drain_delegate_notifications();
    assert_eq!(recorder.count_of(&recorder.modified, "reactor"), 1, "override yields one modified notification");
    assert!(compiler.module("reactor").unwrap().dependencies.contains("weave.event.spark"));
    recorder.clear();

    compiler.revert_source_override("reactor");
    compiler.drain_delegate_notifications();
    assert_eq!(recorder.count_of(&recorder.modified, "reactor"), 1, "revert yields exactly one modified notification");
    assert!(
        compiler.module("reactor").unwrap().dependencies.contains("weave.event.fire"),
        "revert restores the installed behavior"
    );
}

#[test]
fn test_missing_module_reports_error() {
    let dir = tempfile::tempdir().unwrap();
    let paths = scope_paths(dir.path());
    make_scope_dirs(&paths);

    let compiler = Compiler::new("test-target", paths, None);
    let recorder = Recorder::new();
    compiler.set_delegate(Some(recorder.clone()));

    assert!(compiler.module("weave.does.not.exist").is_none());
    compiler.drain_delegate_notifications();
    assert!(recorder.error_summaries.lock().iter().any(|s| s == "Module not found"));
}

#[test]
fn test_incompatible_module_is_not_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let paths = scope_paths(dir.path());
    make_scope_dirs(&paths);
    let incompatible = library("weave.test.elsewhere", &[]).with_compatibility(Compatibility::restricted_to(["other-target"]));
    write_compiled_module(&paths.user_modules, &incompatible);

    let compiler = Compiler::new("test-target", paths, None);
    let recorder = Recorder::new();
    compiler.set_delegate(Some(recorder.clone()));
    assert!(compiler.module("weave.test.elsewhere").is_none());
    compiler.drain_delegate_notifications();
    assert!(recorder.error_summaries.lock().iter().any(|s| s == "incompatible module"));
}

#[test]
fn test_modified_compiled_module_reloads_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let paths = scope_paths(dir.path());
    make_scope_dirs(&paths);
    write_compiled_module(&paths.user_modules, &library("weave.base.timer", &[]));
    std::fs::write(paths.user_modules.join("clockface.weave"), "node t weave.base.timer\n").unwrap();

    let compiler = Compiler::new("test-target", paths.clone(), None);
    let recorder = Recorder::new();
    compiler.set_delegate(Some(recorder.clone()));
    compiler.load_modules_if_needed(&[]);
    compiler.drain_delegate_notifications();
    let before = compiler.module("clockface").unwrap();
    recorder.clear();

    // Rewrite the compiled module and report the change.
    let path = write_compiled_module(&paths.user_modules, &library("weave.base.timer", &["weave.extra"]));
    compiler.note_file_changed(&path);
    compiler.drain_delegate_notifications();

    assert_eq!(recorder.count_of(&recorder.modified, "weave.base.timer"), 1);
    assert_eq!(recorder.count_of(&recorder.modified, "clockface"), 1, "the dependent subcomposition recompiled");
    let after = compiler.module("clockface").unwrap();
    assert!(!Arc::ptr_eq(&before, &after), "the dependent was rebuilt");
}

#[test]
fn test_removed_source_removes_module_and_cached_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let paths = scope_paths(dir.path());
    make_scope_dirs(&paths);
    write_compiled_module(&paths.user_modules, &library("weave.util.echo", &[]));
    let source = paths.user_modules.join("repeater.weave");
    std::fs::write(&source, "node e weave.util.echo\n").unwrap();

    let compiler = Compiler::new("test-target", paths.clone(), None);
    let recorder = Recorder::new();
    compiler.set_delegate(Some(recorder.clone()));
    compiler.load_modules_if_needed(&[]);
    compiler.drain_delegate_notifications();
    assert!(compiler.module("repeater").is_some());
    let cached = paths.user_modules.join(".compiled/repeater.wbc");
    assert!(cached.is_file(), "compiling a source caches its artifact");
    recorder.clear();

    std::fs::remove_file(&source).unwrap();
    compiler.note_file_removed(&source);
    compiler.drain_delegate_notifications();

    assert_eq!(recorder.count_of(&recorder.removed, "repeater"), 1);
    assert!(compiler.module("repeater").is_none());
    assert!(!cached.is_file(), "the cached compiled artifact is deleted with its source");
}

#[test]
fn test_shared_environment_changes_reach_other_compilers() {
    let dir = tempfile::tempdir().unwrap();
    let paths = scope_paths(dir.path());
    make_scope_dirs(&paths);
    write_compiled_module(&paths.user_modules, &library("weave.shared.pulse", &[]));

    let compiler_a = Compiler::new("test-target", paths.clone(), None);
    let compiler_b = Compiler::new("test-target", paths.clone(), None);
    compiler_a.load_modules_if_needed(&[]);
    compiler_b.load_modules_if_needed(&[]);

    let recorder_b = Recorder::new();
    compiler_b.set_delegate(Some(recorder_b.clone()));

    let path = write_compiled_module(&paths.user_modules, &library("weave.shared.pulse", &["weave.changed"]));
    compiler_a.note_file_changed(&path);
    compiler_a.drain_delegate_notifications();
    compiler_b.drain_delegate_notifications();

    assert_eq!(
        recorder_b.count_of(&recorder_b.modified, "weave.shared.pulse"),
        1,
        "the other compiler sharing the environment observes the change"
    );
}
