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

//! Collaborator interfaces consumed by the compiler core.
//!
//! The LLVM code generator, the composition graph analyzer, and the system
//! linker are external to this repository; the core talks to them through
//! these traits. Reference implementations suitable for tests and the CLI
//! live alongside the traits.

use crate::composition::Composition;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;
use weave_common::{Issue, IssueList, IssuesError};

/// Turns a verified composition graph into backend bitcode.
pub trait CompositionCodeGenerator: Send + Sync {
    /// Generates bitcode for `composition`. Verification failures are
    /// Errors that abort only this compile.
    fn generate(&self, composition: &Composition, target: &str) -> Result<Vec<u8>, IssuesError>;
}

/// Answers cycle and longest-path questions about a composition graph.
pub trait CompositionAnalyzer: Send + Sync {
    /// Node ids participating in a cable cycle, empty when acyclic.
    fn cycle_node_ids(&self, composition: &Composition) -> Vec<String>;

    /// Length of the longest cable path downstream of `node_id`.
    fn longest_downstream_path(&self, composition: &Composition, node_id: &str) -> usize;
}

/// Reference analyzer over the composition's cable graph.
#[derive(Debug, Default)]
pub struct CableGraphAnalyzer;

impl CompositionAnalyzer for CableGraphAnalyzer {
    fn cycle_node_ids(&self, composition: &Composition) -> Vec<String> {
        // Iterative DFS coloring; any back edge marks the cycle members.
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for (from, to) in &composition.cables {
            adjacency.entry(from).or_default().push(to);
        }
        let mut in_cycle = Vec::new();
        for start in composition.nodes.iter().map(|n| n.id.as_str()) {
            let mut stack = vec![(start, 0usize)];
            let mut path = Vec::new();
            while let Some((node, child)) = stack.pop() {
                if child == 0 {
                    path.push(node);
                }
                let children = adjacency.get(node).map(Vec::as_slice).unwrap_or_default();
                if child < children.len() {
                    stack.push((node, child + 1));
                    let next = children[child];
                    if next == start {
                        if !in_cycle.contains(&start.to_string()) {
                            in_cycle.push(start.to_string());
                        }
                    } else if !path.contains(&next) {
                        stack.push((next, 0));
                    }
                } else {
                    path.pop();
                }
            }
        }
        in_cycle
    }

    fn longest_downstream_path(&self, composition: &Composition, node_id: &str) -> usize {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for (from, to) in &composition.cables {
            adjacency.entry(from).or_default().push(to);
        }
        fn depth(adjacency: &HashMap<&str, Vec<&str>>, node: &str, seen: &mut Vec<String>) -> usize {
            if seen.iter().any(|s| s == node) {
                return 0;
            }
            seen.push(node.to_string());
            let best = adjacency
                .get(node)
                .map(|children| children.iter().map(|c| 1 + depth(adjacency, c, seen)).max().unwrap_or(0))
                .unwrap_or(0);
            seen.pop();
            best
        }
        depth(&adjacency, node_id, &mut Vec::new())
    }
}

/// Whether a link produces an executable or a dynamic library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Executable,
    DynamicLibrary,
}

/// Everything the external linker needs for one invocation.
#[derive(Debug, Clone)]
pub struct LinkRequest {
    pub output: PathBuf,
    pub kind: LinkKind,
    /// Object/bitcode/archive inputs, in link order.
    pub inputs: Vec<PathBuf>,
    pub libraries: Vec<String>,
    pub frameworks: Vec<String>,
    /// Run-path search paths, narrowest scope first.
    pub run_path_search_paths: Vec<PathBuf>,
    pub target: String,
    pub should_adhoc_sign: bool,
}

/// Invokes the system linker.
pub trait Linker: Send + Sync {
    /// A tool failure (missing binary, non-zero exit) aborts only this
    /// link; the caller's state stays consistent.
    fn link(&self, request: &LinkRequest) -> Result<(), IssuesError>;
}

/// Linker that shells out to a `cc`-style driver.
#[derive(Debug, Clone)]
pub struct ToolLinker {
    pub tool: PathBuf,
}

impl Default for ToolLinker {
    fn default() -> Self {
        Self { tool: PathBuf::from("cc") }
    }
}

impl Linker for ToolLinker {
    fn link(&self, request: &LinkRequest) -> Result<(), IssuesError> {
        let mut command = Command::new(&self.tool);
        if request.kind == LinkKind::DynamicLibrary {
            command.arg("-shared");
        }
        command.arg("-target").arg(&request.target);
        command.arg("-o").arg(&request.output);
        for input in &request.inputs {
            command.arg(input);
        }
        for library in &request.libraries {
            command.arg(format!("-l{library}"));
        }
        for framework in &request.frameworks {
            command.arg("-framework").arg(framework);
        }
        for rpath in &request.run_path_search_paths {
            command.arg(format!("-Wl,-rpath,{}", rpath.display()));
        }
        debug!(tool = %self.tool.display(), output = %request.output.display(), inputs = request.inputs.len(), "invoking linker");
        let output = command.output().map_err(|e| {
            IssuesError::single(
                Issue::error("linking composition", "linker not found", &format!("could not run {}: {e}", self.tool.display()))
                    .with_path(&request.output),
            )
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut issues = IssueList::new();
            issues.append(
                Issue::error("linking composition", "linker failed", &format!("{} exited with {}: {}", self.tool.display(), output.status, stderr.trim()))
                    .with_path(&request.output),
            );
            return Err(IssuesError::new(issues));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composition::Composition;

    fn chain() -> Composition {
        Composition::parse(
            "composition chain\nnode a weave.a\nnode b weave.b\nnode c weave.c\ncable a b\ncable b c\n",
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_acyclic_composition_has_no_cycle_nodes() {
        assert!(CableGraphAnalyzer.cycle_node_ids(&chain()).is_empty());
    }

    #[test]
    fn test_cycle_is_detected() {
        let composition = Composition::parse("node a weave.a\nnode b weave.b\ncable a b\ncable b a\n", None).unwrap();
        let cycle = CableGraphAnalyzer.cycle_node_ids(&composition);
        assert!(cycle.contains(&"a".to_string()));
    }

    #[test]
    fn test_longest_downstream_path() {
        let composition = chain();
        assert_eq!(CableGraphAnalyzer.longest_downstream_path(&composition, "a"), 2);
        assert_eq!(CableGraphAnalyzer.longest_downstream_path(&composition, "c"), 0);
    }
}
