//! Delegation of access decisions to remote authorities.
//!
//! The authority table is a TOML document whose top-level keys are path
//! patterns. Each pattern maps to one of three scopes:
//!
//! ```toml
//! # one endpoint for every operation
//! "^/shared/.*" = { IP = "10.0.0.5", PORT = 2233 }
//!
//! # one endpoint per operation
//! ["^/projects/.*".open]
//! IP = "10.0.0.6"
//! PORT = 2233
//!
//! # several endpoints per operation, all of which must agree
//! ["^/vault/.*".read.primary]
//! IP = "10.0.0.7"
//! PORT = 2233
//! ["^/vault/.*".read.backup]
//! IP = "10.0.0.8"
//! PORT = 2233
//! ```
//!
//! Every pattern matching a path contributes its scope; scopes are merged in
//! file order with later keys replacing earlier ones. A path no pattern
//! covers, or an operation the merged scope does not mention, is not
//! delegated.

mod client;

use std::path::Path;

use regex_lite::Regex;
use thiserror::Error;

use crate::request::Mode;

pub use client::{
    DEFAULT_TIMEOUT, Endpoint, RemoteAuthorizer, TcpAuthorizer, TransportError, Verdict,
};

/// Errors from loading an authority table.
#[derive(Debug, Error)]
pub enum AuthorityConfigError {
    /// The file could not be read
    #[error("failed to read authority table {path}: {source}")]
    Io {
        /// The authority table path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// The document is not valid TOML
    #[error("invalid authority table: {0}")]
    Parse(#[from] toml::de::Error),
    /// A pattern maps to something other than a table; the pattern is skipped
    #[error("authority entry '{pattern}' is not a table")]
    InvalidEntry {
        /// The offending pattern
        pattern: String,
    },
    /// A pattern is not a valid regular expression; it only matches literally
    #[error("invalid authority pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The offending pattern
        pattern: String,
        /// Regex compiler message
        reason: String,
    },
}

#[derive(Debug, Clone)]
struct AuthorityEntry {
    pattern: String,
    regex: Option<Regex>,
    scope: toml::Table,
}

impl AuthorityEntry {
    fn matches(&self, path: &str) -> bool {
        path == self.pattern || self.regex.as_ref().is_some_and(|re| re.is_match(path))
    }
}

/// Which remote authorities must be asked about a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// No authority covers the request
    Unconfigured,
    /// One authority decides
    Single(Endpoint),
    /// Every listed authority must allow, asked in order
    Quorum(Vec<(String, Endpoint)>),
    /// The merged scope is malformed
    Invalid(String),
}

/// Parsed authority table.
#[derive(Debug, Clone, Default)]
pub struct RemoteAuthorityConfig {
    entries: Vec<AuthorityEntry>,
}

impl RemoteAuthorityConfig {
    /// Load an authority table from a file.
    pub fn load(path: &Path) -> Result<Self, AuthorityConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| AuthorityConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::parse(&raw)?;
        tracing::info!(
            path = %path.display(),
            patterns = config.len(),
            "loaded authority table"
        );
        Ok(config)
    }

    /// Parse an authority table.
    ///
    /// Entries that are not tables are skipped; patterns that do not compile
    /// are kept for exact comparison. Both are logged.
    pub fn parse(raw: &str) -> Result<Self, AuthorityConfigError> {
        let table: toml::Table = raw.parse()?;
        let mut entries = Vec::with_capacity(table.len());

        for (pattern, value) in table {
            let toml::Value::Table(scope) = value else {
                let err = AuthorityConfigError::InvalidEntry { pattern };
                tracing::warn!(error = %err, "skipping authority entry");
                continue;
            };
            let regex = match Regex::new(&format!("^(?:{pattern})")) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    let err = AuthorityConfigError::InvalidPattern {
                        pattern: pattern.clone(),
                        reason: e.to_string(),
                    };
                    tracing::warn!(error = %err, "authority pattern only matches literally");
                    None
                }
            };
            entries.push(AuthorityEntry {
                pattern,
                regex,
                scope,
            });
        }

        Ok(Self { entries })
    }

    /// Number of patterns in the table.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no patterns.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Patterns in file order.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.pattern.as_str())
    }

    /// Work out which authorities decide `mode` on `path`.
    pub fn resolve(&self, path: &str, mode: Mode) -> Resolution {
        let mut merged = toml::Table::new();
        for entry in self.entries.iter().filter(|e| e.matches(path)) {
            tracing::trace!(pattern = %entry.pattern, path, "authority pattern matches");
            merged.extend(entry.scope.clone());
        }

        if merged.is_empty() {
            return Resolution::Unconfigured;
        }
        if is_endpoint(&merged) {
            return single(merged);
        }

        match merged.remove(mode.as_str()) {
            None => Resolution::Unconfigured,
            Some(toml::Value::Table(scope)) if is_endpoint(&scope) => single(scope),
            Some(toml::Value::Table(servers)) => {
                let mut quorum = Vec::with_capacity(servers.len());
                for (id, server) in servers {
                    match toml::Value::try_into::<Endpoint>(server) {
                        Ok(endpoint) => quorum.push((id, endpoint)),
                        Err(e) => {
                            return Resolution::Invalid(format!(
                                "server '{id}' for {mode}: {}",
                                e.message()
                            ));
                        }
                    }
                }
                Resolution::Quorum(quorum)
            }
            Some(other) => Resolution::Invalid(format!(
                "scope for {mode} is a {}, not a table",
                other.type_str()
            )),
        }
    }
}

fn is_endpoint(table: &toml::Table) -> bool {
    table.contains_key("IP") && table.contains_key("PORT")
}

fn single(scope: toml::Table) -> Resolution {
    match toml::Value::Table(scope).try_into::<Endpoint>() {
        Ok(endpoint) => Resolution::Single(endpoint),
        Err(e) => Resolution::Invalid(e.message().to_string()),
    }
}

/// Ask the authorities `config` assigns to `mode` on `path`.
///
/// Uncovered requests are allowed. With several authorities the first one
/// that does not allow ends the round with a denial. A malformed scope
/// denies.
pub fn authorize_remote(
    config: &RemoteAuthorityConfig,
    authorizer: &dyn RemoteAuthorizer,
    path: &str,
    mode: Mode,
) -> Verdict {
    match config.resolve(path, mode) {
        Resolution::Unconfigured => {
            tracing::debug!(path, %mode, "no remote authority configured");
            Verdict::Allow
        }
        Resolution::Single(endpoint) => authorizer.authorize(path, mode, &endpoint),
        Resolution::Quorum(servers) => {
            for (id, endpoint) in &servers {
                let verdict = authorizer.authorize(path, mode, endpoint);
                tracing::debug!(path, %mode, server = %id, ?verdict, "quorum member answered");
                match verdict {
                    Verdict::Allow => {}
                    Verdict::Deny(reason) | Verdict::Indeterminate(reason) => {
                        return Verdict::Deny(format!("server '{id}': {reason}"));
                    }
                }
            }
            Verdict::Allow
        }
        Resolution::Invalid(reason) => {
            tracing::warn!(path, %mode, %reason, "malformed authority scope");
            Verdict::Deny(format!("malformed authority scope: {reason}"))
        }
    }
}
