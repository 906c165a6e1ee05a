//! Settings for assembling an access engine.
//!
//! ```toml
//! policy = "/etc/sbacfs/policy.ini"
//! authorities = "/etc/sbacfs/authorities.toml"
//! state = "/var/lib/sbacfs/state.jsonl"
//! remote_timeout_ms = 3000
//! ```
//!
//! Every key is optional. Without `policy` the permissive policy is used,
//! without `authorities` nothing is delegated. The history is loaded from and
//! appended to `state`; without it, a fresh timestamped file in `audit_dir`
//! records decisions; without either, history lives in memory only.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::AccessEngine;
use crate::history::{HistoryError, HistoryLog};
use crate::policy::{Policy, PolicyError};
use crate::remote::{
    AuthorityConfigError, DEFAULT_TIMEOUT, RemoteAuthorityConfig, TcpAuthorizer,
};

/// Errors from loading settings or the files they name.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file could not be read
    #[error("failed to read settings {path}: {source}")]
    Io {
        /// The settings path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// The settings file is not valid
    #[error("invalid settings: {0}")]
    Parse(#[from] toml::de::Error),
    /// The policy file could not be loaded
    #[error(transparent)]
    Policy(#[from] PolicyError),
    /// The authority table could not be loaded
    #[error(transparent)]
    Authorities(#[from] AuthorityConfigError),
    /// The history file could not be opened
    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Where the engine's inputs live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Policy file (INI)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<PathBuf>,
    /// Remote authority table (TOML)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorities: Option<PathBuf>,
    /// History file to resume from and append to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<PathBuf>,
    /// Directory for per-run audit files, used when `state` is unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_dir: Option<PathBuf>,
    /// Connect and read timeout for remote authorities
    #[serde(rename = "remote_timeout_ms", with = "duration_ms")]
    pub remote_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            policy: None,
            authorities: None,
            state: None,
            audit_dir: None,
            remote_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&raw)?)
    }

    /// Open the history log these settings describe.
    pub fn open_history(&self) -> Result<HistoryLog, HistoryError> {
        if let Some(state) = &self.state {
            return HistoryLog::open(state);
        }
        if let Some(dir) = &self.audit_dir {
            let name = format!(
                "{}-sbacfs.jsonl",
                chrono::Local::now().format("%Y-%m-%d_%H:%M:%S")
            );
            let path = dir.join(name);
            tracing::info!(path = %path.display(), "recording decisions to audit file");
            return HistoryLog::audit_only(&path);
        }
        Ok(HistoryLog::in_memory())
    }

    /// Load the policy, authority table and history, and assemble an engine.
    pub fn build_engine(&self) -> Result<AccessEngine, SettingsError> {
        let policy = Policy::load(self.policy.as_deref())?;
        let history = self.open_history()?;

        let mut builder = AccessEngine::builder()
            .policy(policy)
            .history(Arc::new(history))
            .authorizer(Arc::new(TcpAuthorizer::new(self.remote_timeout)));
        if let Some(path) = &self.authorities {
            builder = builder.authorities(RemoteAuthorityConfig::load(path)?);
        }
        Ok(builder.build())
    }
}

/// Helper for serializing Duration as milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // TOML integers are 64-bit.
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::request::{AccessClass, AccessRequest, Mode};

    #[test]
    fn test_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.remote_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_parse_settings() {
        let settings: Settings = toml::from_str(
            r#"
policy = "/etc/sbacfs/policy.ini"
state = "/var/lib/sbacfs/state.jsonl"
remote_timeout_ms = 250
"#,
        )
        .unwrap();
        assert_eq!(settings.policy, Some(PathBuf::from("/etc/sbacfs/policy.ini")));
        assert_eq!(settings.authorities, None);
        assert_eq!(settings.remote_timeout, Duration::from_millis(250));

        let round_trip: Settings = toml::from_str(&toml::to_string(&settings).unwrap()).unwrap();
        assert_eq!(round_trip, settings);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(toml::from_str::<Settings>("polcy = \"/x\"").is_err());
    }

    #[test]
    fn test_build_engine_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let policy = dir.path().join("policy.ini");
        std::fs::write(&policy, "[read]\n^/secret = deny\n.* = allow\n").unwrap();
        let state = dir.path().join("state.jsonl");

        let settings_path = dir.path().join("sbacfs.toml");
        std::fs::write(
            &settings_path,
            format!(
                "policy = {:?}\nstate = {:?}\n",
                policy.display().to_string(),
                state.display().to_string()
            ),
        )
        .unwrap();

        let settings = Settings::load(&settings_path).unwrap();
        let engine = settings.build_engine().unwrap();
        let os = |_: &str, _: AccessClass| true;
        assert!(
            !engine
                .decide(&AccessRequest::new("/secret", Mode::Read), &os)
                .is_granted()
        );
        assert!(
            engine
                .decide(&AccessRequest::new("/public", Mode::Read), &os)
                .is_granted()
        );
        drop(engine);

        let resumed = settings.open_history().unwrap();
        assert_eq!(resumed.len(), 2);
    }

    #[test]
    fn test_authorities_enable_delegation() {
        let dir = tempfile::tempdir().unwrap();
        let authorities = dir.path().join("authorities.toml");
        std::fs::write(&authorities, "\"^/vault/.*\" = { IP = \"127.0.0.1\", PORT = 2233 }\n")
            .unwrap();

        let engine = Settings::default().build_engine().unwrap();
        assert!(engine.authorities().is_none());

        let settings = Settings {
            authorities: Some(authorities),
            ..Settings::default()
        };
        let engine = settings.build_engine().unwrap();
        assert_eq!(engine.authorities().map(|a| a.len()), Some(1));
    }

    #[test]
    fn test_audit_dir_starts_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            audit_dir: Some(dir.path().to_path_buf()),
            ..Settings::default()
        };
        let history = settings.open_history().unwrap();
        history.append("/a", "/", Mode::Read, true);

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_missing_settings_file() {
        let err = Settings::load(Path::new("/nonexistent/sbacfs.toml")).unwrap_err();
        assert!(matches!(err, SettingsError::Io { .. }));
    }
}
