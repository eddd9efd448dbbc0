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

//! The composition model: a node graph instantiating node classes.
//!
//! Compositions are stored as a line-oriented text format:
//!
//! ```text
//! composition weave.example.blend
//! node blur1 weave.image.blur
//! node blend1 weave.image.blend
//! cable blur1 blend1
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use weave_common::{Issue, IssuesError};

/// File extension of a composition / subcomposition source.
pub const COMPOSITION_EXTENSION: &str = "weave";

/// One node instance in a composition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositionNode {
    pub id: String,
    pub class_key: String,
}

/// A parsed composition: named node instances plus the cables among them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Composition {
    pub name: String,
    pub nodes: Vec<CompositionNode>,
    /// Cables as (upstream node id, downstream node id) pairs.
    pub cables: Vec<(String, String)>,
    pub source_path: Option<PathBuf>,
}

impl Composition {
    /// Parses the text format, collecting one Error per malformed line.
    pub fn parse(text: &str, source_path: Option<&Path>) -> Result<Composition, IssuesError> {
        let mut composition = Composition {
            source_path: source_path.map(Path::to_path_buf),
            ..Composition::default()
        };
        let mut node_ids = BTreeSet::new();
        let mut issues = weave_common::IssueList::new();

        for (line_number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let keyword = parts.next().unwrap_or_default();
            let fields: Vec<&str> = parts.collect();
            let malformed = |what: &str| {
                let mut issue = Issue::error(
                    "parsing composition",
                    "malformed composition",
                    &format!("line {}: {}", line_number + 1, what),
                );
                if let Some(path) = source_path {
                    issue = issue.with_path(path);
                }
                issue
            };
            match (keyword, fields.as_slice()) {
                ("composition", [name]) => composition.name = name.to_string(),
                ("node", [id, class_key]) => {
                    if !node_ids.insert(id.to_string()) {
                        issues.append(malformed(&format!("duplicate node id \"{id}\"")));
                        continue;
                    }
                    composition.nodes.push(CompositionNode {
                        id: id.to_string(),
                        class_key: class_key.to_string(),
                    });
                }
                ("cable", [from, to]) => {
                    composition.cables.push((from.to_string(), to.to_string()));
                }
                _ => issues.append(malformed(&format!("unrecognized statement \"{line}\""))),
            }
        }

        for (from, to) in &composition.cables {
            if !node_ids.contains(from) || !node_ids.contains(to) {
                let mut issue = Issue::error(
                    "parsing composition",
                    "malformed composition",
                    &format!("cable references unknown node \"{}\"", if node_ids.contains(from) { to } else { from }),
                );
                if let Some(path) = source_path {
                    issue = issue.with_path(path);
                }
                issues.append(issue);
            }
        }

        if issues.has_errors() {
            return Err(IssuesError::new(issues));
        }
        if composition.name.is_empty() {
            composition.name = source_path
                .and_then(|p| p.file_stem())
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "untitled".to_string());
        }
        Ok(composition)
    }

    /// Reads and parses a composition file.
    pub fn parse_file(path: &Path) -> Result<Composition, IssuesError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            IssuesError::single(Issue::error("parsing composition", "unreadable composition", &format!("{e}")).with_path(path))
        })?;
        Self::parse(&text, Some(path))
    }

    /// The set of node class keys this composition instantiates — its
    /// direct module dependencies.
    pub fn node_class_keys(&self) -> BTreeSet<String> {
        self.nodes.iter().map(|n| n.class_key.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        let text = "composition weave.example.blend\n\
                    # blur then blend\n\
                    node blur1 weave.image.blur\n\
                    node blend1 weave.image.blend\n\
                    cable blur1 blend1\n";
        let composition = Composition::parse(text, None).unwrap();
        assert_eq!(composition.name, "weave.example.blend");
        assert_eq!(composition.nodes.len(), 2);
        assert_eq!(composition.cables, vec![("blur1".to_string(), "blend1".to_string())]);
        assert_eq!(
            composition.node_class_keys(),
            BTreeSet::from(["weave.image.blur".to_string(), "weave.image.blend".to_string()])
        );
    }

    #[test]
    fn test_parse_collects_all_errors() {
        let text = "node a weave.a\nnode a weave.a\ncable a missing\nbogus line\n";
        let err = Composition::parse(text, None).unwrap_err();
        assert_eq!(err.issues.len(), 3);
    }

    #[test]
    fn test_name_falls_back_to_file_stem() {
        let composition = Composition::parse("node n weave.test.fire\n", Some(Path::new("/tmp/foo.weave"))).unwrap();
        assert_eq!(composition.name, "foo");
    }
}
