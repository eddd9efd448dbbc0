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

//! Diagnostics accumulated while loading, compiling, and linking modules.
//!
//! Functions that can degrade rather than fail append [`Issue`]s to a
//! caller-supplied [`IssueList`] and keep going; functions that must fail
//! return an [`IssuesError`] carrying the list so callers can merge it
//! instead of duplicating entries.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{error, warn};

/// Whether the attempted action failed outright or merely produced a
/// surprising result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueSeverity {
    Error,
    Warning,
}

impl fmt::Display for IssueSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueSeverity::Error => write!(f, "error"),
            IssueSeverity::Warning => write!(f, "warning"),
        }
    }
}

/// One diagnostic: the action that was being attempted, where, and what
/// happened.
///
/// `details` is a template; `%module` is replaced with the module key (in
/// backquotes) and `%link` with the help link when the issue is rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: IssueSeverity,
    /// Short label for the action that produced the issue, e.g. "compiling composition".
    pub action: String,
    /// File the issue pertains to, if any.
    pub path: Option<PathBuf>,
    pub summary: String,
    pub details: String,
    /// Module key substituted for `%module` in `details`.
    pub module_key: Option<String>,
    pub hint: Option<String>,
    pub help_link: Option<String>,
}

impl Issue {
    pub fn new(severity: IssueSeverity, action: &str, summary: &str, details: &str) -> Self {
        Self {
            severity,
            action: action.to_string(),
            path: None,
            summary: summary.to_string(),
            details: details.to_string(),
            module_key: None,
            hint: None,
            help_link: None,
        }
    }

    pub fn error(action: &str, summary: &str, details: &str) -> Self {
        Self::new(IssueSeverity::Error, action, summary, details)
    }

    pub fn warning(action: &str, summary: &str, details: &str) -> Self {
        Self::new(IssueSeverity::Warning, action, summary, details)
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_module_key(mut self, key: &str) -> Self {
        self.module_key = Some(key.to_string());
        self
    }

    pub fn with_hint(mut self, hint: &str) -> Self {
        self.hint = Some(hint.to_string());
        self
    }

    pub fn with_help_link(mut self, link: &str) -> Self {
        self.help_link = Some(link.to_string());
        self
    }

    /// Renders `details` with `%module` and `%link` substituted.
    pub fn rendered_details(&self) -> String {
        let mut out = self.details.clone();
        if let Some(key) = &self.module_key {
            out = out.replace("%module", &format!("`{}`", key));
        }
        if let Some(link) = &self.help_link {
            out = out.replace("%link", link);
        }
        out
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.summary)?;
        if let Some(path) = &self.path {
            write!(f, " ({})", path.display())?;
        }
        let details = self.rendered_details();
        if !details.is_empty() {
            write!(f, " — {}", details)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " [{}]", hint)?;
        }
        Ok(())
    }
}

/// Ordered, de-duplicating collection of issues.
///
/// Appending an issue identical to one already present is a no-op, so a
/// dependency checked along several paths reports its problem once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueList {
    issues: Vec<Issue>,
}

impl IssueList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, issue: Issue) {
        if !self.issues.contains(&issue) {
            self.issues.push(issue);
        }
    }

    pub fn append_list(&mut self, other: IssueList) {
        for issue in other.issues {
            self.append(issue);
        }
    }

    pub fn issues(&self) -> &[Issue] {
        &self.issues
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(|i| i.severity == IssueSeverity::Error)
    }

    /// Logs every issue at its severity's level. Called before diagnostics
    /// are handed to asynchronous consumers so they survive a later crash.
    pub fn log_all(&self) {
        for issue in &self.issues {
            match issue.severity {
                IssueSeverity::Error => error!(action = %issue.action, "{}", issue),
                IssueSeverity::Warning => warn!(action = %issue.action, "{}", issue),
            }
        }
    }
}

impl fmt::Display for IssueList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, issue) in self.issues.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", issue)?;
        }
        Ok(())
    }
}

impl IntoIterator for IssueList {
    type Item = Issue;
    type IntoIter = std::vec::IntoIter<Issue>;

    fn into_iter(self) -> Self::IntoIter {
        self.issues.into_iter()
    }
}

impl FromIterator<Issue> for IssueList {
    fn from_iter<T: IntoIterator<Item = Issue>>(iter: T) -> Self {
        let mut list = IssueList::new();
        for issue in iter {
            list.append(issue);
        }
        list
    }
}

/// Error type carrying the accumulated diagnostics of a failed operation.
#[derive(Debug, Clone, Error)]
#[error("{issues}")]
pub struct IssuesError {
    pub issues: IssueList,
}

impl IssuesError {
    pub fn new(issues: IssueList) -> Self {
        Self { issues }
    }

    pub fn single(issue: Issue) -> Self {
        let mut issues = IssueList::new();
        issues.append(issue);
        Self { issues }
    }
}

impl From<Issue> for IssuesError {
    fn from(issue: Issue) -> Self {
        IssuesError::single(issue)
    }
}
