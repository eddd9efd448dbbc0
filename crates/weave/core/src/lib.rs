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

//! Module and composition model for the Weave compiler.
//!
//! A *module* is a compiled node class, data type, or library identified by
//! a dotted key. A *composition* is a node graph that instantiates node
//! classes. This crate defines both, plus the collaborator interfaces the
//! compiler core consumes: the composition code generator, the composition
//! analyzer, the linker, and the per-source-type module compiler registry.

pub mod backend;
pub mod composition;
pub mod info;
pub mod module;
pub mod source;

pub use composition::{Composition, CompositionNode};
pub use info::ModuleInfo;
pub use module::{CodeArtifact, Module, ModulePayload, NodeClass, Port};
