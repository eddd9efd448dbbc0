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

//! The compiled module: node classes, data types, and libraries.
//!
//! Module kinds share a key, a dependency set, and compatibility info; the
//! kind-specific payload lives in [`ModulePayload`], matched exhaustively
//! wherever kind-specific behavior is needed.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use weave_common::{Compatibility, Issue, IssuesError};

/// Placeholder type keys look like `WeaveGenericType1`.
pub const GENERIC_TYPE_PREFIX: &str = "WeaveGenericType";

/// File extension of a compiled module artifact.
pub const COMPILED_MODULE_EXTENSION: &str = "wbc";

/// Whether `key` names a generic placeholder type rather than a real type.
pub fn is_generic_type_key(key: &str) -> bool {
    key.strip_prefix(GENERIC_TYPE_PREFIX)
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}

/// Whether `key` names a node class (`weave.math.add`) as opposed to a type
/// (`WeaveInteger`) or compound type (`WeaveList_WeaveInteger`).
pub fn is_node_class_key(key: &str) -> bool {
    key.contains('.') && key.chars().next().is_some_and(|c| c.is_ascii_lowercase())
}

/// Candidate (generic base key, type suffix) splits of an unresolved key.
///
/// `weave.math.add.WeaveInteger` yields `("weave.math.add",
/// ["WeaveInteger"])`; longer suffixes are tried first so
/// `weave.pair.WeaveInteger.WeaveReal` prefers the two-type split.
pub fn generic_base_candidates(key: &str) -> Vec<(String, Vec<String>)> {
    let segments: Vec<&str> = key.split('.').collect();
    let mut candidates = Vec::new();
    // A suffix segment is a type key when it starts uppercase.
    let mut first_type = segments.len();
    while first_type > 1 && segments[first_type - 1].chars().next().is_some_and(|c| c.is_ascii_uppercase()) {
        first_type -= 1;
    }
    for split in first_type..segments.len() {
        let base = segments[..split].join(".");
        let types = segments[split..].iter().map(|s| s.to_string()).collect();
        candidates.push((base, types));
    }
    candidates
}

/// A port on a node class: data ports reference a type key (possibly a
/// generic placeholder), event-only ports reference none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub name: String,
    pub type_key: Option<String>,
}

impl Port {
    pub fn data(name: &str, type_key: &str) -> Self {
        Self {
            name: name.to_string(),
            type_key: Some(type_key.to_string()),
        }
    }

    pub fn event(name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_key: None,
        }
    }
}

/// A node class: the executable building block a composition instantiates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeClass {
    pub ports: Vec<Port>,
}

impl NodeClass {
    /// Generic placeholder type keys referenced by this node class's ports.
    pub fn generic_placeholders(&self) -> BTreeSet<String> {
        self.ports
            .iter()
            .filter_map(|p| p.type_key.as_deref())
            .filter(|k| is_generic_type_key(k))
            .map(|k| k.to_string())
            .collect()
    }
}

/// Kind-specific payload of a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModulePayload {
    NodeClass(NodeClass),
    /// A node class generated by substituting concrete types into a generic
    /// base; keeps the back-reference to the base and the substitution map.
    SpecializedNodeClass {
        node_class: NodeClass,
        generic_base_key: String,
        specializations: BTreeMap<String, String>,
    },
    /// A primitive data type.
    Type,
    /// A generated composite type such as `WeaveList_WeaveInteger`,
    /// referencing its element types.
    CompoundType { element_keys: Vec<String> },
    /// A plain library with no node interface.
    Library,
}

impl ModulePayload {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ModulePayload::NodeClass(_) => "node class",
            ModulePayload::SpecializedNodeClass { .. } => "specialized node class",
            ModulePayload::Type => "type",
            ModulePayload::CompoundType { .. } => "compound type",
            ModulePayload::Library => "library",
        }
    }

    pub fn as_node_class(&self) -> Option<&NodeClass> {
        match self {
            ModulePayload::NodeClass(nc) => Some(nc),
            ModulePayload::SpecializedNodeClass { node_class, .. } => Some(node_class),
            _ => None,
        }
    }

    /// A node class with generic placeholder ports can be specialized.
    pub fn is_specializable(&self) -> bool {
        match self {
            ModulePayload::NodeClass(nc) => !nc.generic_placeholders().is_empty(),
            _ => false,
        }
    }
}

/// The compiled code backing a module: bitcode bytes plus the artifact file
/// they came from, if any. Dropping the artifact releases the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeArtifact {
    pub bitcode: Vec<u8>,
    pub file: Option<PathBuf>,
}

impl CodeArtifact {
    pub fn in_memory(bitcode: Vec<u8>) -> Self {
        Self { bitcode, file: None }
    }
}

/// A successfully compiled module, owned by exactly one environment at a
/// time. Destruction is explicit (the last `Arc` dropping) and releases the
/// backing artifact with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub key: String,
    pub dependencies: BTreeSet<String>,
    pub compatibility: Compatibility,
    pub payload: ModulePayload,
    pub artifact: Option<CodeArtifact>,
    pub source_path: Option<PathBuf>,
}

/// On-disk form of a compiled module (a `.wbc` file).
#[derive(Serialize, Deserialize)]
struct ModuleArtifactFile {
    key: String,
    dependencies: BTreeSet<String>,
    compatibility: Compatibility,
    payload: ModulePayload,
    bitcode: String,
}

impl Module {
    pub fn new(key: &str, payload: ModulePayload) -> Self {
        Self {
            key: key.to_string(),
            dependencies: BTreeSet::new(),
            compatibility: Compatibility::any(),
            payload,
            artifact: None,
            source_path: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_compatibility(mut self, compatibility: Compatibility) -> Self {
        self.compatibility = compatibility;
        self
    }

    pub fn with_artifact(mut self, artifact: CodeArtifact) -> Self {
        self.artifact = Some(artifact);
        self
    }

    pub fn with_source_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    /// Type and generic-base keys this module references that `is_loaded`
    /// cannot resolve. Empty means the module is fully reified.
    pub fn unresolved_references(&self, is_loaded: impl Fn(&str) -> bool) -> BTreeSet<String> {
        let mut unresolved = BTreeSet::new();
        if let Some(nc) = self.payload.as_node_class() {
            for port in &nc.ports {
                if let Some(type_key) = &port.type_key {
                    if !is_generic_type_key(type_key) && !is_loaded(type_key) {
                        unresolved.insert(type_key.clone());
                    }
                }
            }
        }
        if let ModulePayload::SpecializedNodeClass { generic_base_key, specializations, .. } = &self.payload {
            if !is_loaded(generic_base_key) {
                unresolved.insert(generic_base_key.clone());
            }
            for concrete in specializations.values() {
                if !is_loaded(concrete) {
                    unresolved.insert(concrete.clone());
                }
            }
        }
        if let ModulePayload::CompoundType { element_keys } = &self.payload {
            for element in element_keys {
                if !is_loaded(element) {
                    unresolved.insert(element.clone());
                }
            }
        }
        unresolved
    }

    /// Serializes this module to the `.wbc` artifact format.
    pub fn to_artifact_bytes(&self) -> Vec<u8> {
        let file = ModuleArtifactFile {
            key: self.key.clone(),
            dependencies: self.dependencies.clone(),
            compatibility: self.compatibility.clone(),
            payload: self.payload.clone(),
            bitcode: BASE64.encode(self.artifact.as_ref().map(|a| a.bitcode.as_slice()).unwrap_or_default()),
        };
        serde_json::to_vec_pretty(&file).expect("module artifact serialization cannot fail")
    }

    /// Reads a compiled module back from a `.wbc` file's bytes.
    pub fn from_artifact_bytes(bytes: &[u8], path: &Path) -> Result<Module, IssuesError> {
        let file: ModuleArtifactFile = serde_json::from_slice(bytes).map_err(|e| {
            IssuesError::single(
                Issue::error("loading module", "malformed compiled module", &format!("the file could not be parsed: {e}")).with_path(path),
            )
        })?;
        let bitcode = BASE64.decode(file.bitcode.as_bytes()).map_err(|e| {
            IssuesError::single(
                Issue::error("loading module", "malformed compiled module", &format!("the bitcode payload could not be decoded: {e}")).with_path(path),
            )
        })?;
        Ok(Module {
            key: file.key,
            dependencies: file.dependencies,
            compatibility: file.compatibility,
            payload: file.payload,
            artifact: Some(CodeArtifact {
                bitcode,
                file: Some(path.to_path_buf()),
            }),
            source_path: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generic_add() -> Module {
        Module::new(
            "weave.math.add",
            ModulePayload::NodeClass(NodeClass {
                ports: vec![Port::data("a", "WeaveGenericType1"), Port::data("b", "WeaveGenericType1"), Port::event("refresh")],
            }),
        )
    }

    #[test]
    fn test_generic_type_key_detection() {
        assert!(is_generic_type_key("WeaveGenericType1"));
        assert!(is_generic_type_key("WeaveGenericType12"));
        assert!(!is_generic_type_key("WeaveGenericType"));
        assert!(!is_generic_type_key("WeaveInteger"));
    }

    #[test]
    fn test_node_class_key_detection() {
        assert!(is_node_class_key("weave.math.add"));
        assert!(!is_node_class_key("WeaveInteger"));
        assert!(!is_node_class_key("WeaveList_WeaveInteger"));
    }

    #[test]
    fn test_generic_base_candidates() {
        let candidates = generic_base_candidates("weave.math.add.WeaveInteger");
        assert_eq!(candidates, vec![("weave.math.add".to_string(), vec!["WeaveInteger".to_string()])]);

        let candidates = generic_base_candidates("weave.pair.make.WeaveInteger.WeaveReal");
        assert_eq!(candidates[0].0, "weave.pair.make");
        assert_eq!(candidates[0].1, vec!["WeaveInteger".to_string(), "WeaveReal".to_string()]);
        assert_eq!(candidates[1].0, "weave.pair.make.WeaveInteger");

        assert!(generic_base_candidates("weave.math.add").is_empty());
    }

    #[test]
    fn test_specializable() {
        assert!(generic_add().payload.is_specializable());
        let concrete = Module::new(
            "weave.logic.not",
            ModulePayload::NodeClass(NodeClass {
                ports: vec![Port::data("value", "WeaveBoolean")],
            }),
        );
        assert!(!concrete.payload.is_specializable());
    }

    #[test]
    fn test_unresolved_references_ignores_placeholders() {
        let module = generic_add();
        let unresolved = module.unresolved_references(|_| false);
        assert!(unresolved.is_empty(), "placeholders are not reference targets: {unresolved:?}");
    }

    #[test]
    fn test_unresolved_references_for_specialization() {
        let module = Module::new(
            "weave.math.add.WeaveInteger",
            ModulePayload::SpecializedNodeClass {
                node_class: NodeClass {
                    ports: vec![Port::data("a", "WeaveInteger")],
                },
                generic_base_key: "weave.math.add".to_string(),
                specializations: BTreeMap::from([("WeaveGenericType1".to_string(), "WeaveInteger".to_string())]),
            },
        );
        let unresolved = module.unresolved_references(|key| key == "weave.math.add");
        assert_eq!(unresolved, BTreeSet::from(["WeaveInteger".to_string()]));
    }

    #[test]
    fn test_artifact_round_trip() {
        let module = generic_add()
            .with_dependencies(["weave.math.internal"])
            .with_artifact(CodeArtifact::in_memory(b"BC\xc0\xde".to_vec()));
        let bytes = module.to_artifact_bytes();
        let loaded = Module::from_artifact_bytes(&bytes, Path::new("weave.math.add.wbc")).unwrap();
        assert_eq!(loaded.key, module.key);
        assert_eq!(loaded.dependencies, module.dependencies);
        assert_eq!(loaded.artifact.as_ref().unwrap().bitcode, b"BC\xc0\xde");
    }

    #[test]
    fn test_malformed_artifact_is_an_error() {
        let err = Module::from_artifact_bytes(b"not json", Path::new("bad.wbc")).unwrap_err();
        assert!(err.issues.has_errors());
    }
}
