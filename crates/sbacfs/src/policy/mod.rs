//! Static access policy.
//!
//! A policy maps every [`Section`] to an ordered table of regex path
//! patterns, each granting or denying access. Three sections hold the plain
//! access classes (`read`, `write`, `execute`); the other two scope the
//! history-sensitive rules (`written-no-execute`, `first-object-only`) to the
//! paths they apply to.
//!
//! ## Matching
//!
//! Tables are kept sorted by the length of each pattern's literal prefix,
//! longest first, so the first matching entry is the most specific one even
//! though the patterns are regular expressions. Patterns are anchored at the
//! start of the path and may match a prefix of it.
//!
//! ## Example
//!
//! ```rust
//! use sbacfs::policy::{PolicyBuilder, Section};
//!
//! let policy = PolicyBuilder::new()
//!     .allow(Section::Read, "/home/.*")
//!     .deny(Section::Read, "/home/user/.ssh/.*")
//!     .build();
//!
//! let entry = policy.section(Section::Read).lookup("/home/user/.ssh/id_rsa");
//! assert!(!entry.map(|e| e.allow).unwrap_or(true));
//! ```

mod compiler;

use std::fmt;
use std::path::Path;

use regex_lite::Regex;
use thiserror::Error;

use crate::request::AccessClass;
use crate::rules::StateRule;

pub use compiler::{CompiledPolicy, PolicyCompiler, literal_prefix_len};

/// Problems found while loading a policy.
///
/// Everything except [`PolicyError::Io`] is recoverable: the offending
/// section or entry is skipped and reported as a diagnostic.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The policy file exists but could not be read
    #[error("failed to read policy file {path}: {source}")]
    Io {
        /// File that failed
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// A section header names none of the known sections
    #[error("unknown policy section [{0}], expected one of: {known}", known = Section::NAMES.join(", "))]
    UnknownSection(String),
    /// An entry's value is not a recognised decision literal
    #[error("entry '{pattern}' in [{section}] has invalid decision '{value}'")]
    InvalidDecision {
        /// Section containing the entry
        section: String,
        /// Pattern of the entry
        pattern: String,
        /// The rejected value
        value: String,
    },
    /// An entry's pattern is not a valid regular expression
    #[error("pattern '{pattern}' in [{section}] does not compile: {reason}")]
    InvalidPattern {
        /// Section containing the entry
        section: String,
        /// The rejected pattern
        pattern: String,
        /// Regex compiler message
        reason: String,
    },
    /// An entry appears before any section header
    #[error("line {line}: entry outside of any section")]
    OrphanEntry {
        /// 1-based line number
        line: usize,
    },
    /// The same pattern appears twice in one section
    #[error("pattern '{pattern}' is declared twice in [{section}], keeping the first")]
    DuplicatePattern {
        /// Section containing the entry
        section: String,
        /// The repeated pattern
        pattern: String,
    },
    /// A line is neither a header, a comment nor a `key = value` pair
    #[error("line {line}: cannot parse '{text}'")]
    MalformedLine {
        /// 1-based line number
        line: usize,
        /// Offending text
        text: String,
    },
}

/// A policy section.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Section {
    /// `[read]`
    Read,
    /// `[write]`
    Write,
    /// `[execute]`
    Execute,
    /// A section scoping a history-sensitive rule
    Rule(StateRule),
}

impl Section {
    /// Every section, in evaluation order.
    pub const ALL: [Section; 5] = [
        Section::Read,
        Section::Write,
        Section::Execute,
        Section::Rule(StateRule::WrittenNoExecute),
        Section::Rule(StateRule::FirstObjectOnly),
    ];

    /// Header names of every section.
    pub const NAMES: [&'static str; 5] = [
        "read",
        "write",
        "execute",
        "written-no-execute",
        "first-object-only",
    ];

    /// Header name of the section.
    pub fn name(&self) -> &'static str {
        match self {
            Section::Read => "read",
            Section::Write => "write",
            Section::Execute => "execute",
            Section::Rule(rule) => rule.name(),
        }
    }

    /// Parse a section header; unknown names are rejected.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "read" => Some(Section::Read),
            "write" => Some(Section::Write),
            "execute" => Some(Section::Execute),
            other => StateRule::from_name(other).map(Section::Rule),
        }
    }
}

impl From<AccessClass> for Section {
    fn from(class: AccessClass) -> Self {
        match class {
            AccessClass::Read => Section::Read,
            AccessClass::Write => Section::Write,
            AccessClass::Execute => Section::Execute,
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One `pattern = decision` line of a section.
#[derive(Clone, Debug)]
pub struct PolicyEntry {
    /// The pattern as written in the policy
    pub pattern: String,
    /// Whether a match grants access
    pub allow: bool,
    regex: Regex,
}

impl PolicyEntry {
    /// Compile an entry. The pattern is anchored at the start of the path.
    pub fn new(pattern: impl Into<String>, allow: bool) -> Result<Self, regex_lite::Error> {
        let pattern = pattern.into();
        let regex = Regex::new(&format!("^(?:{pattern})"))?;
        Ok(Self {
            pattern,
            allow,
            regex,
        })
    }

    /// Whether the pattern matches the path.
    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

/// The ordered entries of one section.
#[derive(Clone, Debug, Default)]
pub struct PolicySection {
    entries: Vec<PolicyEntry>,
}

impl PolicySection {
    /// Build a section, ordering entries by literal prefix length (longest
    /// first). The sort is stable: entries of equal prefix length keep their
    /// declaration order.
    pub fn from_entries(mut entries: Vec<PolicyEntry>) -> Self {
        entries.sort_by_key(|e| std::cmp::Reverse(literal_prefix_len(&e.pattern)));
        Self { entries }
    }

    /// The first (most specific) entry matching the path.
    pub fn lookup(&self, path: &str) -> Option<&PolicyEntry> {
        self.entries.iter().find(|e| e.matches(path))
    }

    /// Entries in matching order.
    pub fn entries(&self) -> &[PolicyEntry] {
        &self.entries
    }

    /// Whether the section has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A complete policy: one table per section.
#[derive(Clone, Debug, Default)]
pub struct Policy {
    read: PolicySection,
    write: PolicySection,
    execute: PolicySection,
    written_no_execute: PolicySection,
    first_object_only: PolicySection,
}

impl Policy {
    /// A policy with every section empty.
    ///
    /// Every request falls through to the operating system's permissions.
    pub fn new() -> Self {
        Self::default()
    }

    /// The policy used when no policy file is configured: every access class
    /// allows everything and no history rule is active.
    pub fn permissive() -> Self {
        PolicyBuilder::new()
            .allow(Section::Read, ".*")
            .allow(Section::Write, ".*")
            .allow(Section::Execute, ".*")
            .build()
    }

    /// Load a policy file.
    ///
    /// `None`, or a path that does not exist, yields [`Policy::permissive`].
    /// Recoverable problems are logged and the offending lines skipped.
    pub fn load(path: Option<&Path>) -> Result<Self, PolicyError> {
        let Some(path) = path else {
            tracing::info!("no policy file provided, using permissive default policy");
            return Ok(Self::permissive());
        };

        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    path = %path.display(),
                    "policy file does not exist, using permissive default policy"
                );
                return Ok(Self::permissive());
            }
            Err(source) => {
                return Err(PolicyError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };

        let compiled = PolicyCompiler::compile(&raw);
        for diagnostic in &compiled.diagnostics {
            tracing::warn!(path = %path.display(), "{diagnostic}, skipping");
        }
        Ok(compiled.policy)
    }

    /// The table for a section. Never fails: absent sections are empty.
    pub fn section(&self, section: Section) -> &PolicySection {
        match section {
            Section::Read => &self.read,
            Section::Write => &self.write,
            Section::Execute => &self.execute,
            Section::Rule(StateRule::WrittenNoExecute) => &self.written_no_execute,
            Section::Rule(StateRule::FirstObjectOnly) => &self.first_object_only,
        }
    }

    fn section_mut(&mut self, section: Section) -> &mut PolicySection {
        match section {
            Section::Read => &mut self.read,
            Section::Write => &mut self.write,
            Section::Execute => &mut self.execute,
            Section::Rule(StateRule::WrittenNoExecute) => &mut self.written_no_execute,
            Section::Rule(StateRule::FirstObjectOnly) => &mut self.first_object_only,
        }
    }
}

/// Builder for creating policies with a fluent API.
///
/// Patterns that do not compile are logged and skipped.
///
/// # Example
///
/// ```rust
/// use sbacfs::policy::{PolicyBuilder, Section};
/// use sbacfs::rules::StateRule;
///
/// let policy = PolicyBuilder::new()
///     .allow(Section::Read, "^/.*$")
///     .deny(Section::Read, "^/secret$")
///     .allow(Section::Rule(StateRule::FirstObjectOnly), "^/scratch/.*")
///     .build();
/// assert_eq!(policy.section(Section::Read).entries().len(), 2);
/// ```
#[derive(Clone, Debug, Default)]
pub struct PolicyBuilder {
    entries: Vec<(Section, PolicyEntry)>,
}

impl PolicyBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant access to paths matching the pattern in a section.
    pub fn allow(self, section: Section, pattern: &str) -> Self {
        self.entry(section, pattern, true)
    }

    /// Deny access to paths matching the pattern in a section.
    pub fn deny(self, section: Section, pattern: &str) -> Self {
        self.entry(section, pattern, false)
    }

    /// Add an entry with an explicit decision.
    pub fn entry(self, section: Section, pattern: &str, allow: bool) -> Self {
        match PolicyEntry::new(pattern, allow) {
            Ok(entry) => return self.push(section, entry),
            Err(e) => {
                tracing::warn!(%section, pattern, error = %e, "invalid policy pattern, skipping");
            }
        }
        self
    }

    /// Add an already compiled entry.
    pub fn push(mut self, section: Section, entry: PolicyEntry) -> Self {
        self.entries.push((section, entry));
        self
    }

    /// Build the policy, sorting every section.
    pub fn build(self) -> Policy {
        let mut grouped: Vec<(Section, Vec<PolicyEntry>)> =
            Section::ALL.iter().map(|s| (*s, Vec::new())).collect();
        for (section, entry) in self.entries {
            if let Some((_, bucket)) = grouped.iter_mut().find(|(s, _)| *s == section) {
                bucket.push(entry);
            }
        }

        let mut policy = Policy::new();
        for (section, entries) in grouped {
            *policy.section_mut(section) = PolicySection::from_entries(entries);
        }
        policy
    }
}
