//! What the decision point grants.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from loading an allowlist.
#[derive(Debug, Error)]
pub enum AllowlistError {
    /// The file could not be read
    #[error("failed to read allowlist {path}: {source}")]
    Io {
        /// The allowlist path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// The file is not a valid allowlist
    #[error("invalid allowlist: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Peers, paths and operations that are granted.
///
/// ```toml
/// peers = ["127.0.0.1"]
/// paths = ["/foo", "/foo/a"]
/// modes = ["open", "read"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Allowlist {
    /// Client addresses allowed to be granted anything
    pub peers: Vec<IpAddr>,
    /// Exact paths that may be granted
    pub paths: Vec<String>,
    /// Operation names that may be granted
    pub modes: Vec<String>,
}

impl Default for Allowlist {
    /// Local clients, a handful of demo paths, and the common operations.
    fn default() -> Self {
        Self {
            peers: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            paths: ["/foo", "/foo/a", "/foo/b", "/foo2", "/file.txt", "/file.c"]
                .map(String::from)
                .to_vec(),
            modes: ["open", "read", "write", "readdir"]
                .map(String::from)
                .to_vec(),
        }
    }
}

impl Allowlist {
    /// Load an allowlist from a TOML file.
    pub fn load(path: &Path) -> Result<Self, AllowlistError> {
        let raw = std::fs::read_to_string(path).map_err(|source| AllowlistError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&raw)?)
    }

    /// Whether `peer` may perform `mode` on `path`.
    pub fn permits(&self, peer: IpAddr, path: &str, mode: &str) -> bool {
        self.peers.contains(&peer)
            && self.paths.iter().any(|p| p == path)
            && self.modes.iter().any(|m| m == mode)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allowlist() {
        let allowlist = Allowlist::default();
        let local = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert!(allowlist.permits(local, "/foo/a", "open"));
        assert!(!allowlist.permits(local, "/foo/a", "unlink"));
        assert!(!allowlist.permits(local, "/foo/c", "open"));
        assert!(!allowlist.permits("10.0.0.1".parse().unwrap(), "/foo/a", "open"));
    }

    #[test]
    fn test_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allowlist.toml");
        std::fs::write(
            &path,
            "peers = [\"127.0.0.1\", \"::1\"]\npaths = [\"/data\"]\nmodes = [\"read\"]\n",
        )
        .unwrap();

        let allowlist = Allowlist::load(&path).unwrap();
        assert!(allowlist.permits("::1".parse().unwrap(), "/data", "read"));
        assert!(!allowlist.permits("::1".parse().unwrap(), "/data", "write"));

        std::fs::write(&path, "peers = [\"not an ip\"]\npaths = []\nmodes = []\n").unwrap();
        assert!(matches!(
            Allowlist::load(&path),
            Err(AllowlistError::Parse(_))
        ));
    }
}
