//! Policy file compiler.
//!
//! Policy files are INI-style:
//!
//! ```text
//! [read]
//! ^/home/user/.* = allow
//! ^/home/user/.ssh/.* = deny
//!
//! [first-object-only]
//! ^/home/user/Downloads/.* = allow
//! ```
//!
//! Keys are regex path patterns, values one of `allow`, `true`, `1`, `deny`,
//! `false`, `0` (case-insensitive). Compilation never fails as a whole:
//! problems are collected as diagnostics and the offending line skipped.

use std::collections::HashSet;

use super::{Policy, PolicyBuilder, PolicyEntry, PolicyError, Section};

const ALLOW_VALUES: [&str; 3] = ["allow", "true", "1"];
const DENY_VALUES: [&str; 3] = ["deny", "false", "0"];

/// Characters that end a pattern's literal prefix when not escaped.
const METACHARACTERS: [char; 10] = ['(', '[', '{', '?', '*', '+', '|', '.', '$', '^'];

/// Result of compiling a policy source.
#[derive(Debug)]
pub struct CompiledPolicy {
    /// The policy built from every valid entry
    pub policy: Policy,
    /// Everything that was skipped, in source order
    pub diagnostics: Vec<PolicyError>,
}

/// Compiles policy sources into a [`Policy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyCompiler;

impl PolicyCompiler {
    /// Compile a policy source.
    pub fn compile(raw: &str) -> CompiledPolicy {
        let mut builder = PolicyBuilder::new();
        let mut diagnostics = Vec::new();
        // `None` while inside an unknown section: its entries are dropped.
        let mut current: Option<Option<Section>> = None;
        let mut seen: HashSet<(&'static str, String)> = HashSet::new();

        for (idx, line) in raw.lines().enumerate() {
            let line_no = idx + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let name = name.trim();
                let section = Section::from_name(name);
                if section.is_none() {
                    diagnostics.push(PolicyError::UnknownSection(name.to_string()));
                }
                current = Some(section);
                continue;
            }

            let Some((pattern, value)) = split_entry(line) else {
                diagnostics.push(PolicyError::MalformedLine {
                    line: line_no,
                    text: line.to_string(),
                });
                continue;
            };

            let section = match current {
                None => {
                    diagnostics.push(PolicyError::OrphanEntry { line: line_no });
                    continue;
                }
                Some(None) => continue,
                Some(Some(section)) => section,
            };

            let Some(allow) = parse_decision(value) else {
                diagnostics.push(PolicyError::InvalidDecision {
                    section: section.name().to_string(),
                    pattern: pattern.to_string(),
                    value: value.to_string(),
                });
                continue;
            };

            if !seen.insert((section.name(), pattern.to_string())) {
                diagnostics.push(PolicyError::DuplicatePattern {
                    section: section.name().to_string(),
                    pattern: pattern.to_string(),
                });
                continue;
            }

            match PolicyEntry::new(pattern, allow) {
                Ok(entry) => builder = builder.push(section, entry),
                Err(e) => diagnostics.push(PolicyError::InvalidPattern {
                    section: section.name().to_string(),
                    pattern: pattern.to_string(),
                    reason: e.to_string(),
                }),
            }
        }

        CompiledPolicy {
            policy: builder.build(),
            diagnostics,
        }
    }
}

/// Split `pattern = value` on the last `=`, or on the last `:` when the line
/// has no `=`. Decision values never contain either character.
fn split_entry(line: &str) -> Option<(&str, &str)> {
    let (pattern, value) = line.rsplit_once('=').or_else(|| line.rsplit_once(':'))?;
    let (pattern, value) = (pattern.trim(), value.trim());
    if pattern.is_empty() {
        return None;
    }
    Some((pattern, value))
}

fn parse_decision(value: &str) -> Option<bool> {
    let value = value.to_ascii_lowercase();
    if ALLOW_VALUES.contains(&value.as_str()) {
        Some(true)
    } else if DENY_VALUES.contains(&value.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Length in characters of the literal text a pattern starts with.
///
/// The prefix ends at the first metacharacter not preceded by a backslash.
/// A single leading `^` anchor is skipped, since every pattern is matched
/// from the start of the path anyway.
pub fn literal_prefix_len(pattern: &str) -> usize {
    let body = pattern.strip_prefix('^').unwrap_or(pattern);
    let mut prev = None;
    for (count, c) in body.chars().enumerate() {
        if METACHARACTERS.contains(&c) && prev != Some('\\') {
            return count;
        }
        prev = Some(c);
    }
    body.chars().count()
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::rules::StateRule;

    #[test]
    fn test_literal_prefix_len() {
        assert_eq!(literal_prefix_len("/home/user/.*"), 11);
        assert_eq!(literal_prefix_len("^/home/user/.*"), 11);
        assert_eq!(literal_prefix_len("^/secret$"), 7);
        assert_eq!(literal_prefix_len("^/.*$"), 1);
        assert_eq!(literal_prefix_len(".*"), 0);
        assert_eq!(literal_prefix_len("/plain/path"), 11);
        assert_eq!(literal_prefix_len(r"/file\.txt"), 10);
        assert_eq!(literal_prefix_len(r"/file\.t*"), 8);
    }

    #[test]
    fn test_compile_sections() {
        let raw = "\
# comment
[read]
^/secret$ = deny
^/.*$ = allow

[execute]
/usr/bin/.* = TRUE

[first-object-only]
^/scratch/.* = allow
";
        let compiled = PolicyCompiler::compile(raw);
        assert!(compiled.diagnostics.is_empty(), "{:?}", compiled.diagnostics);

        let read = compiled.policy.section(Section::Read);
        assert_eq!(read.entries().len(), 2);
        assert!(!read.lookup("/secret").unwrap().allow);
        assert!(read.lookup("/public").unwrap().allow);

        let exec = compiled.policy.section(Section::Execute);
        assert!(exec.lookup("/usr/bin/env").unwrap().allow);
        assert!(exec.lookup("/opt/tool").is_none());

        let foo = compiled
            .policy
            .section(Section::Rule(StateRule::FirstObjectOnly));
        assert!(foo.lookup("/scratch/x").unwrap().allow);
        assert!(compiled.policy.section(Section::Write).is_empty());
    }

    #[test]
    fn test_unknown_section_is_skipped() {
        let raw = "[reed]\n/.* = allow\n[write]\n/tmp/.* = allow\n";
        let compiled = PolicyCompiler::compile(raw);

        assert_eq!(compiled.diagnostics.len(), 1);
        assert!(matches!(
            &compiled.diagnostics[0],
            PolicyError::UnknownSection(name) if name == "reed"
        ));
        assert!(compiled.policy.section(Section::Read).is_empty());
        assert_eq!(compiled.policy.section(Section::Write).entries().len(), 1);
    }

    #[test]
    fn test_invalid_decision_is_skipped() {
        let raw = "[read]\n/a = maybe\n/b = Deny\n/c = 1\n";
        let compiled = PolicyCompiler::compile(raw);

        assert_eq!(compiled.diagnostics.len(), 1);
        assert!(matches!(
            &compiled.diagnostics[0],
            PolicyError::InvalidDecision { value, .. } if value == "maybe"
        ));
        let read = compiled.policy.section(Section::Read);
        assert_eq!(read.entries().len(), 2);
        assert!(!read.lookup("/b").unwrap().allow);
        assert!(read.lookup("/c").unwrap().allow);
    }

    #[test]
    fn test_invalid_regex_is_skipped() {
        let raw = "[write]\n/tmp/[ = allow\n/tmp/.* = allow\n";
        let compiled = PolicyCompiler::compile(raw);

        assert_eq!(compiled.diagnostics.len(), 1);
        assert!(matches!(
            &compiled.diagnostics[0],
            PolicyError::InvalidPattern { pattern, .. } if pattern == "/tmp/["
        ));
        assert_eq!(compiled.policy.section(Section::Write).entries().len(), 1);
    }

    #[test]
    fn test_orphan_duplicate_and_malformed_lines() {
        let raw = "/early = allow\n[read]\n/x = allow\n/x = deny\nnot an entry\n";
        let compiled = PolicyCompiler::compile(raw);

        assert_eq!(compiled.diagnostics.len(), 3);
        assert!(matches!(
            compiled.diagnostics[0],
            PolicyError::OrphanEntry { line: 1 }
        ));
        assert!(matches!(
            compiled.diagnostics[1],
            PolicyError::DuplicatePattern { .. }
        ));
        assert!(matches!(
            compiled.diagnostics[2],
            PolicyError::MalformedLine { line: 5, .. }
        ));
        assert!(compiled.policy.section(Section::Read).lookup("/x").unwrap().allow);
    }

    #[test]
    fn test_colon_separator() {
        let compiled = PolicyCompiler::compile("[read]\n/notes: deny\n");
        assert!(compiled.diagnostics.is_empty());
        assert!(!compiled.policy.section(Section::Read).lookup("/notes").unwrap().allow);
    }
}
