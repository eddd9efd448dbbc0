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

//! Metadata about a module or source discovered on disk but not
//! necessarily loaded.

use std::path::{Path, PathBuf};

/// One discovered module file or source file inside a search path.
///
/// Created when the search path is scanned, updated when the file changes,
/// destroyed when the file disappears.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub key: String,
    /// The search path the file was found under.
    pub search_path: PathBuf,
    pub file: PathBuf,
    /// True for a source awaiting compilation, false for a compiled artifact.
    pub is_source: bool,
    /// Set once compilation of this source has been scheduled, so repeated
    /// loader passes do not schedule it twice. Cleared when the source is
    /// excluded from compilation and should be retried later.
    pub attempted: bool,
    /// Scheduling hint: how far this source is from the leaves of the
    /// dependency graph. Sources with larger values compile at lower
    /// priority; no strict ordering is guaranteed.
    pub longest_downstream_path: usize,
    /// In-memory source text overriding the file's contents, if the editor
    /// supplied one.
    pub source_override: Option<String>,
}

impl ModuleInfo {
    pub fn new(key: &str, search_path: &Path, file: &Path, is_source: bool) -> Self {
        Self {
            key: key.to_string(),
            search_path: search_path.to_path_buf(),
            file: file.to_path_buf(),
            is_source,
            attempted: false,
            longest_downstream_path: 0,
            source_override: None,
        }
    }

    /// The source text to compile: the override if present, otherwise the
    /// file's contents.
    pub fn read_source(&self) -> std::io::Result<String> {
        match &self.source_override {
            Some(text) => Ok(text.clone()),
            None => std::fs::read_to_string(&self.file),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_override_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("weave.test.count.weave");
        let mut f = std::fs::File::create(&file).unwrap();
        writeln!(f, "on disk").unwrap();

        let mut info = ModuleInfo::new("weave.test.count", dir.path(), &file, true);
        assert_eq!(info.read_source().unwrap().trim(), "on disk");

        info.source_override = Some("overridden".to_string());
        assert_eq!(info.read_source().unwrap(), "overridden");

        info.source_override = None;
        assert_eq!(info.read_source().unwrap().trim(), "on disk");
    }
}
