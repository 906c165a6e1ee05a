//! History-sensitive rules.
//!
//! A rule can only veto a request the static policy already granted. Each
//! rule is scoped by its own policy section: it runs for a path only when the
//! first entry of that section matching the path is an `allow` entry. A
//! matching `deny` entry exempts the path, no match leaves it unscoped.

use std::fmt;

use crate::history::{HistoryLog, RecordField};
use crate::policy::{Policy, Section};
use crate::request::{AccessRequest, Mode, parent_dir};

/// The known history-sensitive rules, in evaluation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StateRule {
    /// Deny executing an object that was successfully written before.
    WrittenNoExecute,
    /// Once an object under a directory has been accessed, deny every other
    /// object in that directory.
    FirstObjectOnly,
}

impl StateRule {
    /// Every rule, in the order they are evaluated.
    pub const ALL: [StateRule; 2] = [StateRule::WrittenNoExecute, StateRule::FirstObjectOnly];

    /// Section name of the rule.
    pub fn name(&self) -> &'static str {
        match self {
            StateRule::WrittenNoExecute => "written-no-execute",
            StateRule::FirstObjectOnly => "first-object-only",
        }
    }

    /// Parse a rule name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "written-no-execute" => Some(StateRule::WrittenNoExecute),
            "first-object-only" => Some(StateRule::FirstObjectOnly),
            _ => None,
        }
    }

    /// Whether the policy scopes this rule to the path.
    pub fn applies_to(&self, policy: &Policy, path: &str) -> bool {
        policy
            .section(Section::Rule(*self))
            .lookup(path)
            .is_some_and(|entry| entry.allow)
    }

    /// Evaluate the rule; `false` denies the request.
    pub fn evaluate(&self, history: &HistoryLog, request: &AccessRequest) -> bool {
        match self {
            StateRule::WrittenNoExecute => written_no_execute(history, request),
            StateRule::FirstObjectOnly => first_object_only(history, request),
        }
    }
}

impl fmt::Display for StateRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Run every rule scoped to the request's path. Returns the first rule that
/// denies, if any.
pub fn check_state(
    policy: &Policy,
    history: &HistoryLog,
    request: &AccessRequest,
) -> Option<StateRule> {
    for rule in StateRule::ALL {
        if !rule.applies_to(policy, &request.path) {
            tracing::trace!(%rule, path = %request.path, "rule not scoped to path");
            continue;
        }
        if !rule.evaluate(history, request) {
            return Some(rule);
        }
        tracing::debug!(%rule, path = %request.path, "rule allows access");
    }
    None
}

fn written_no_execute(history: &HistoryLog, request: &AccessRequest) -> bool {
    if !request.exec_intent {
        return true;
    }
    match history
        .query(RecordField::Path, &request.path)
        .into_iter()
        .find(|r| r.access == Mode::Write)
    {
        Some(written) => {
            tracing::info!(
                path = %request.path,
                written_at = %written.time,
                "execution denied, object was written before"
            );
            false
        }
        None => true,
    }
}

fn first_object_only(history: &HistoryLog, request: &AccessRequest) -> bool {
    let path = request.path.as_str();
    if !history.query(RecordField::Path, path).is_empty() {
        tracing::debug!(path, "object already selected");
        return true;
    }

    let prefix = parent_dir(path);
    if prefix == path {
        // The root has no directory to select it from.
        tracing::debug!(path, "root path, nothing to select");
        return true;
    }

    if let Some(selected) = history.query(RecordField::Prefix, prefix).first() {
        tracing::info!(
            path,
            prefix,
            selected = %selected.path,
            "another object was already selected under this prefix"
        );
        return false;
    }

    tracing::debug!(path, prefix, "first object selected under prefix");
    true
}
