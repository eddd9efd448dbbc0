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

//! Target triples and module compatibility checks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Target triple for the host the compiler is running on.
pub fn default_target() -> String {
    let arch = std::env::consts::ARCH;
    let os = match std::env::consts::OS {
        "macos" => "apple-macosx",
        "linux" => "unknown-linux-gnu",
        "windows" => "pc-windows-msvc",
        other => other,
    };
    format!("{arch}-{os}")
}

/// The set of targets a module can run on. `None` means unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compatibility {
    targets: Option<BTreeSet<String>>,
}

impl Compatibility {
    /// Compatible with every target.
    pub fn any() -> Self {
        Self { targets: None }
    }

    pub fn restricted_to<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: Some(targets.into_iter().map(Into::into).collect()),
        }
    }

    pub fn is_compatible_with(&self, target: &str) -> bool {
        match &self.targets {
            None => true,
            Some(targets) => targets.contains(target),
        }
    }

    /// Intersection of two compatibility sets, used when a module inherits
    /// restrictions from its dependencies.
    pub fn intersection(&self, other: &Compatibility) -> Compatibility {
        match (&self.targets, &other.targets) {
            (None, None) => Compatibility::any(),
            (Some(t), None) | (None, Some(t)) => Compatibility { targets: Some(t.clone()) },
            (Some(a), Some(b)) => Compatibility {
                targets: Some(a.intersection(b).cloned().collect()),
            },
        }
    }
}
