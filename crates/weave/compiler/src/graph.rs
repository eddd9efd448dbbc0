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

//! Dependency graphs over module keys.
//!
//! [`DependencyGraph`] holds one environment's module→dependency edges and
//! is strictly acyclic for compiled modules; cycle queries are run over
//! sources being (re)compiled. [`DependencyNetwork`] composes the graphs of
//! every environment in a scope lattice into one directed acyclic network
//! whose vertices are (environment, key) pairs.
//!
//! Edges point from dependent to dependency, so "upstream" of a module is
//! what it depends on and "downstream" is what depends on it.

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use std::collections::{BTreeSet, HashMap, HashSet};

/// One environment's module dependency edges.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: StableDiGraph<String, ()>,
    node_indices: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a vertex if not present, returning its index.
    pub fn add_vertex(&mut self, key: &str) -> NodeIndex {
        if let Some(&index) = self.node_indices.get(key) {
            return index;
        }
        let index = self.graph.add_node(key.to_string());
        self.node_indices.insert(key.to_string(), index);
        index
    }

    pub fn remove_vertex(&mut self, key: &str) {
        if let Some(index) = self.node_indices.remove(key) {
            self.graph.remove_node(index);
        }
    }

    pub fn find_vertex(&self, key: &str) -> bool {
        self.node_indices.contains_key(key)
    }

    /// Records that `dependent` depends on `dependency`.
    pub fn add_edge(&mut self, dependent: &str, dependency: &str) {
        let from = self.add_vertex(dependent);
        let to = self.add_vertex(dependency);
        if self.graph.edges_connecting(from, to).next().is_none() {
            self.graph.add_edge(from, to, ());
        }
    }

    pub fn remove_edge(&mut self, dependent: &str, dependency: &str) {
        if let (Some(&from), Some(&to)) = (self.node_indices.get(dependent), self.node_indices.get(dependency)) {
            let edges: Vec<_> = self.graph.edges_connecting(from, to).map(|e| e.id()).collect();
            for edge in edges {
                self.graph.remove_edge(edge);
            }
        }
    }

    pub fn vertices(&self) -> impl Iterator<Item = &str> {
        self.graph.node_weights().map(String::as_str)
    }

    fn neighbors(&self, key: &str, direction: Direction) -> Vec<String> {
        match self.node_indices.get(key) {
            Some(&index) => self.graph.neighbors_directed(index, direction).map(|i| self.graph[i].clone()).collect(),
            None => Vec::new(),
        }
    }

    /// Direct dependencies of `key`.
    pub fn immediately_upstream(&self, key: &str) -> Vec<String> {
        self.neighbors(key, Direction::Outgoing)
    }

    /// Direct dependents of `key`.
    pub fn immediately_downstream(&self, key: &str) -> Vec<String> {
        self.neighbors(key, Direction::Incoming)
    }

    fn reachable(&self, key: &str, direction: Direction) -> BTreeSet<String> {
        let mut reached = BTreeSet::new();
        let Some(&start) = self.node_indices.get(key) else {
            return reached;
        };
        let mut stack = vec![start];
        let mut seen = HashSet::from([start]);
        while let Some(index) = stack.pop() {
            for next in self.graph.neighbors_directed(index, direction) {
                if seen.insert(next) {
                    reached.insert(self.graph[next].clone());
                    stack.push(next);
                }
            }
        }
        reached.remove(key);
        reached
    }

    /// Everything `key` transitively depends on.
    pub fn upstream_vertices(&self, key: &str) -> BTreeSet<String> {
        self.reachable(key, Direction::Outgoing)
    }

    /// Everything transitively depending on `key`.
    pub fn downstream_vertices(&self, key: &str) -> BTreeSet<String> {
        self.reachable(key, Direction::Incoming)
    }

    /// Vertices participating in any cycle, restricted to `candidates`.
    ///
    /// Compiled modules are assumed already validated, so callers pass the
    /// sources being (re)compiled as candidates.
    pub fn cycle_vertices(&self, candidates: &BTreeSet<String>) -> BTreeSet<String> {
        let mut in_cycle = BTreeSet::new();
        for component in tarjan_scc(&self.graph) {
            let cyclic = component.len() > 1 || component.iter().any(|&i| self.graph.edges_connecting(i, i).next().is_some());
            if cyclic {
                for index in component {
                    let key = &self.graph[index];
                    if candidates.contains(key) {
                        in_cycle.insert(key.clone());
                    }
                }
            }
        }
        in_cycle
    }

    /// Number of edges on the longest chain of dependents below `key`.
    /// Used as a recompilation-scheduling hint only.
    pub fn longest_downstream_path(&self, key: &str) -> usize {
        fn walk(graph: &StableDiGraph<String, ()>, index: NodeIndex, active: &mut HashSet<NodeIndex>, memo: &mut HashMap<NodeIndex, usize>) -> usize {
            if let Some(&length) = memo.get(&index) {
                return length;
            }
            if !active.insert(index) {
                // Cycle under a source awaiting exclusion; cut it off here.
                return 0;
            }
            let length = graph
                .neighbors_directed(index, Direction::Incoming)
                .map(|next| 1 + walk(graph, next, active, memo))
                .max()
                .unwrap_or(0);
            active.remove(&index);
            memo.insert(index, length);
            length
        }
        match self.node_indices.get(key) {
            Some(&index) => walk(&self.graph, index, &mut HashSet::new(), &mut HashMap::new()),
            None => 0,
        }
    }
}

/// A vertex in the cross-environment network: a module key in the
/// environment that owns it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetworkVertex {
    pub environment: u64,
    pub key: String,
}

impl NetworkVertex {
    pub fn new(environment: u64, key: &str) -> Self {
        Self {
            environment,
            key: key.to_string(),
        }
    }
}

/// The directed acyclic network composed from every environment's graph.
///
/// The one structurally-cyclic relationship — a generated module depending
/// on an installed module at the very same scope — is never added here; the
/// loader re-derives it from raw dependency lists when needed.
#[derive(Debug, Clone, Default)]
pub struct DependencyNetwork {
    graph: StableDiGraph<NetworkVertex, ()>,
    node_indices: HashMap<NetworkVertex, NodeIndex>,
}

impl DependencyNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_vertex(&mut self, vertex: NetworkVertex) -> NodeIndex {
        if let Some(&index) = self.node_indices.get(&vertex) {
            return index;
        }
        let index = self.graph.add_node(vertex.clone());
        self.node_indices.insert(vertex, index);
        index
    }

    pub fn remove_vertex(&mut self, vertex: &NetworkVertex) {
        if let Some(index) = self.node_indices.remove(vertex) {
            self.graph.remove_node(index);
        }
    }

    pub fn add_edge(&mut self, dependent: NetworkVertex, dependency: NetworkVertex) {
        let from = self.add_vertex(dependent);
        let to = self.add_vertex(dependency);
        if self.graph.edges_connecting(from, to).next().is_none() {
            self.graph.add_edge(from, to, ());
        }
    }

    /// All vertices carrying `key`, across environments.
    pub fn find_vertex(&self, key: &str) -> Vec<NetworkVertex> {
        self.graph.node_weights().filter(|v| v.key == key).cloned().collect()
    }

    fn reachable(&self, vertex: &NetworkVertex, direction: Direction) -> BTreeSet<NetworkVertex> {
        let mut reached = BTreeSet::new();
        let Some(&start) = self.node_indices.get(vertex) else {
            return reached;
        };
        let mut stack = vec![start];
        let mut seen = HashSet::from([start]);
        while let Some(index) = stack.pop() {
            for next in self.graph.neighbors_directed(index, direction) {
                if seen.insert(next) {
                    reached.insert(self.graph[next].clone());
                    stack.push(next);
                }
            }
        }
        reached
    }

    /// Everything `vertex` transitively depends on, across environments.
    pub fn upstream_vertices(&self, vertex: &NetworkVertex) -> BTreeSet<NetworkVertex> {
        self.reachable(vertex, Direction::Outgoing)
    }

    /// Everything transitively depending on `vertex`, across environments.
    pub fn downstream_vertices(&self, vertex: &NetworkVertex) -> BTreeSet<NetworkVertex> {
        self.reachable(vertex, Direction::Incoming)
    }

    pub fn immediately_upstream(&self, vertex: &NetworkVertex) -> Vec<NetworkVertex> {
        match self.node_indices.get(vertex) {
            Some(&index) => self.graph.neighbors_directed(index, Direction::Outgoing).map(|i| self.graph[i].clone()).collect(),
            None => Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.graph.clear();
        self.node_indices.clear();
    }
}
