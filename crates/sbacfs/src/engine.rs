//! The access decision pipeline.
//!
//! Every request goes through the same steps:
//!
//! 1. The request's policy section is searched for the most specific entry
//!    matching the path.
//! 2. A matching `deny` entry denies.
//! 3. History-sensitive rules scoped to the path may veto.
//! 4. Remote authorities covering the path and operation may veto.
//! 5. Otherwise the request is granted.
//!
//! Exactly one history record is appended per decision, with `Success` set
//! to the outcome.
//!
//! # Failure modes
//!
//! The two ends of the pipeline fail in opposite directions. When the policy
//! has no entry for a path the engine defers to the operating system: the
//! request is granted and the passthrough call meets the ordinary file
//! permissions, which are what the history records as the outcome. When a
//! remote authority is configured for a request and cannot be reached, or
//! its answer cannot be understood, the request is denied.

use std::sync::Arc;

use crate::history::HistoryLog;
use crate::policy::{Policy, Section};
use crate::remote::{
    RemoteAuthorityConfig, RemoteAuthorizer, TcpAuthorizer, Verdict, authorize_remote,
};
use crate::request::{AccessClass, AccessRequest};
use crate::rules::{StateRule, check_state};

/// Answers whether the operating system would permit an access.
///
/// Consulted only when the policy has nothing to say about a path.
pub trait PermissionOracle {
    /// Whether `class` access to the mount-relative `path` is permitted.
    fn os_permits(&self, path: &str, class: AccessClass) -> bool;
}

impl<F> PermissionOracle for F
where
    F: Fn(&str, AccessClass) -> bool,
{
    fn os_permits(&self, path: &str, class: AccessClass) -> bool {
        self(path, class)
    }
}

/// Why a request was granted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Grant {
    /// An `allow` entry matched and nothing vetoed
    Policy {
        /// The matching pattern
        pattern: String,
    },
    /// No entry matched; the operating system has the final word
    OsFallback {
        /// What the operating system answered
        os_permits: bool,
    },
}

/// Why a request was denied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Denial {
    /// A `deny` entry matched
    Policy {
        /// The matching pattern
        pattern: String,
    },
    /// A history-sensitive rule vetoed
    Rule(StateRule),
    /// A remote authority refused or could not be asked
    Remote(String),
}

impl std::fmt::Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Denial::Policy { pattern } => write!(f, "denied by policy entry '{pattern}'"),
            Denial::Rule(rule) => write!(f, "denied by rule {rule}"),
            Denial::Remote(reason) => write!(f, "denied by remote authority: {reason}"),
        }
    }
}

/// Outcome of [`AccessEngine::decide`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccessDecision {
    /// The operation may be forwarded
    Granted(Grant),
    /// The operation must fail with `EPERM`
    Denied(Denial),
}

impl AccessDecision {
    /// Returns true if the request was granted.
    pub fn is_granted(&self) -> bool {
        matches!(self, AccessDecision::Granted(_))
    }

    /// The denial, if denied.
    pub fn denial(&self) -> Option<&Denial> {
        match self {
            AccessDecision::Granted(_) => None,
            AccessDecision::Denied(denial) => Some(denial),
        }
    }
}

/// Decides requests against a policy, the access history and the remote
/// authorities.
///
/// Shared across dispatcher threads; all mutable state lives in the
/// [`HistoryLog`].
#[derive(Debug)]
pub struct AccessEngine {
    policy: Policy,
    history: Arc<HistoryLog>,
    authorities: Option<RemoteAuthorityConfig>,
    authorizer: Arc<dyn RemoteAuthorizer>,
}

impl AccessEngine {
    /// Start building an engine.
    pub fn builder() -> AccessEngineBuilder {
        AccessEngineBuilder::default()
    }

    /// The compiled policy.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// The access history.
    pub fn history(&self) -> &Arc<HistoryLog> {
        &self.history
    }

    /// The authority table, if remote authorization is enabled.
    pub fn authorities(&self) -> Option<&RemoteAuthorityConfig> {
        self.authorities.as_ref()
    }

    /// Decide a request and record the outcome.
    pub fn decide(&self, request: &AccessRequest, oracle: &dyn PermissionOracle) -> AccessDecision {
        let path = request.path.as_str();
        let section = Section::from(request.class);

        let Some(entry) = self.policy.section(section).lookup(path) else {
            let os_permits = oracle.os_permits(path, request.class);
            tracing::debug!(
                path,
                mode = %request.mode,
                %section,
                os_permits,
                "no policy entry, deferring to the operating system"
            );
            self.record(request, os_permits);
            return AccessDecision::Granted(Grant::OsFallback { os_permits });
        };

        if !entry.allow {
            tracing::info!(path, mode = %request.mode, pattern = %entry.pattern, "denied by policy");
            self.record(request, false);
            return AccessDecision::Denied(Denial::Policy {
                pattern: entry.pattern.clone(),
            });
        }

        if let Some(rule) = check_state(&self.policy, &self.history, request) {
            tracing::info!(path, mode = %request.mode, %rule, "denied by state rule");
            self.record(request, false);
            return AccessDecision::Denied(Denial::Rule(rule));
        }

        if let Some(authorities) = &self.authorities {
            match authorize_remote(authorities, self.authorizer.as_ref(), path, request.mode) {
                Verdict::Allow => {}
                Verdict::Deny(reason) | Verdict::Indeterminate(reason) => {
                    tracing::info!(path, mode = %request.mode, %reason, "denied by remote authority");
                    self.record(request, false);
                    return AccessDecision::Denied(Denial::Remote(reason));
                }
            }
        }

        tracing::debug!(path, mode = %request.mode, pattern = %entry.pattern, "access granted");
        self.record(request, true);
        AccessDecision::Granted(Grant::Policy {
            pattern: entry.pattern.clone(),
        })
    }

    fn record(&self, request: &AccessRequest, success: bool) {
        if !self
            .history
            .append(&request.path, request.prefix(), request.mode, success)
        {
            tracing::warn!(path = %request.path, "decision could not be recorded");
        }
    }
}

/// Builder for [`AccessEngine`].
#[derive(Debug, Default)]
pub struct AccessEngineBuilder {
    policy: Option<Policy>,
    history: Option<Arc<HistoryLog>>,
    authorities: Option<RemoteAuthorityConfig>,
    authorizer: Option<Arc<dyn RemoteAuthorizer>>,
}

impl AccessEngineBuilder {
    /// Policy to enforce. Defaults to [`Policy::permissive`].
    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// History to record into and query. Defaults to an in-memory log.
    pub fn history(mut self, history: Arc<HistoryLog>) -> Self {
        self.history = Some(history);
        self
    }

    /// Enable remote authorization with this authority table.
    pub fn authorities(mut self, authorities: RemoteAuthorityConfig) -> Self {
        self.authorities = Some(authorities);
        self
    }

    /// Client used to reach remote authorities. Defaults to a
    /// [`TcpAuthorizer`] with the default timeout.
    pub fn authorizer(mut self, authorizer: Arc<dyn RemoteAuthorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Build the engine.
    pub fn build(self) -> AccessEngine {
        AccessEngine {
            policy: self.policy.unwrap_or_else(Policy::permissive),
            history: self
                .history
                .unwrap_or_else(|| Arc::new(HistoryLog::in_memory())),
            authorities: self.authorities,
            authorizer: self
                .authorizer
                .unwrap_or_else(|| Arc::new(TcpAuthorizer::default())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::history::{AccessRecord, RecordField};
    use crate::policy::PolicyBuilder;
    use crate::remote::Endpoint;
    use crate::request::{FMODE_EXEC, Mode};

    fn os_allows(_: &str, _: AccessClass) -> bool {
        true
    }

    fn os_refuses(_: &str, _: AccessClass) -> bool {
        false
    }

    /// Always gives the same verdict and checks that the history is usable
    /// while it is being asked.
    #[derive(Debug)]
    struct FixedAuthorizer {
        verdict: Verdict,
        history: Arc<HistoryLog>,
        asked: Mutex<Vec<(String, Mode, Endpoint)>>,
    }

    impl FixedAuthorizer {
        fn new(verdict: Verdict, history: &Arc<HistoryLog>) -> Arc<Self> {
            Arc::new(Self {
                verdict,
                history: Arc::clone(history),
                asked: Mutex::default(),
            })
        }
    }

    impl RemoteAuthorizer for FixedAuthorizer {
        fn authorize(&self, path: &str, mode: Mode, endpoint: &Endpoint) -> Verdict {
            // Would deadlock if the engine held the history lock here.
            let _ = self.history.query(RecordField::Path, path);
            self.asked
                .lock()
                .unwrap()
                .push((path.to_string(), mode, endpoint.clone()));
            self.verdict.clone()
        }
    }

    fn last_record(history: &HistoryLog) -> AccessRecord {
        history.records().pop().unwrap()
    }

    #[test]
    fn test_empty_policy_defers_to_os() {
        let engine = AccessEngine::builder().policy(Policy::new()).build();

        let decision = engine.decide(&AccessRequest::new("/etc/passwd", Mode::Write), &os_refuses);
        assert_eq!(
            decision,
            AccessDecision::Granted(Grant::OsFallback { os_permits: false })
        );
        assert!(!last_record(engine.history()).success);

        let decision = engine.decide(&AccessRequest::new("/etc/hosts", Mode::Read), &os_allows);
        assert!(decision.is_granted());
        assert!(last_record(engine.history()).success);
    }

    #[test]
    fn test_default_policy_allows_everything() {
        let engine = AccessEngine::builder().build();
        for mode in [Mode::Open, Mode::Read, Mode::Write, Mode::Unlink, Mode::Mkdir] {
            let decision = engine.decide(&AccessRequest::new("/any/where", mode), &os_refuses);
            assert_eq!(
                decision,
                AccessDecision::Granted(Grant::Policy {
                    pattern: ".*".to_string()
                })
            );
        }
        let exec = AccessRequest::open("/bin/sh", FMODE_EXEC);
        assert!(engine.decide(&exec, &os_refuses).is_granted());
    }

    #[test]
    fn test_secret_denied_public_allowed() {
        let policy = PolicyBuilder::new()
            .deny(Section::Read, "^/secret$")
            .allow(Section::Read, "^/.*$")
            .build();
        let engine = AccessEngine::builder().policy(policy).build();

        let decision = engine.decide(&AccessRequest::new("/secret", Mode::Read), &os_allows);
        assert_eq!(
            decision,
            AccessDecision::Denied(Denial::Policy {
                pattern: "^/secret$".to_string()
            })
        );
        assert!(!last_record(engine.history()).success);

        let decision = engine.decide(&AccessRequest::new("/public", Mode::Read), &os_allows);
        assert!(decision.is_granted());
        assert_eq!(decision.denial(), None);
        assert!(last_record(engine.history()).success);
    }

    #[test]
    fn test_written_then_executed() {
        let policy = PolicyBuilder::new()
            .allow(Section::Read, "/.*")
            .allow(Section::Write, "/.*")
            .allow(Section::Execute, "/.*")
            .allow(Section::Rule(StateRule::WrittenNoExecute), "/tmp/.*")
            .build();
        let engine = AccessEngine::builder().policy(policy).build();

        assert!(
            engine
                .decide(&AccessRequest::new("/tmp/payload", Mode::Write), &os_allows)
                .is_granted()
        );
        assert!(
            engine
                .decide(&AccessRequest::open("/tmp/payload", libc::O_RDONLY), &os_allows)
                .is_granted()
        );
        assert_eq!(
            engine.decide(&AccessRequest::open("/tmp/payload", FMODE_EXEC), &os_allows),
            AccessDecision::Denied(Denial::Rule(StateRule::WrittenNoExecute))
        );

        // Outside the rule's scope a written file stays executable.
        engine.decide(&AccessRequest::new("/opt/tool", Mode::Write), &os_allows);
        assert!(
            engine
                .decide(&AccessRequest::open("/opt/tool", FMODE_EXEC), &os_allows)
                .is_granted()
        );
    }

    #[test]
    fn test_first_object_only_scenario() {
        let policy = PolicyBuilder::new()
            .allow(Section::Read, "/.*")
            .allow(Section::Rule(StateRule::FirstObjectOnly), "^/scratch/.*")
            .build();
        let engine = AccessEngine::builder().policy(policy).build();

        let x = AccessRequest::open("/scratch/x", libc::O_RDONLY);
        let y = AccessRequest::open("/scratch/y", libc::O_RDONLY);

        assert!(engine.decide(&x, &os_allows).is_granted());
        assert_eq!(
            engine.decide(&y, &os_allows).denial(),
            Some(&Denial::Rule(StateRule::FirstObjectOnly))
        );
        assert!(engine.decide(&x, &os_allows).is_granted());
    }

    #[test]
    fn test_one_record_per_decision() {
        let policy = PolicyBuilder::new()
            .allow(Section::Read, "^/scratch/.*")
            .deny(Section::Read, "^/secret")
            .allow(Section::Rule(StateRule::FirstObjectOnly), "^/scratch/.*")
            .build();
        let engine = AccessEngine::builder().policy(policy).build();

        let requests = [
            ("/scratch/a", true),
            ("/scratch/b", false),
            ("/secret", false),
            ("/elsewhere", true),
            ("/scratch/a", true),
        ];
        for (path, _) in requests {
            engine.decide(&AccessRequest::new(path, Mode::Read), &os_allows);
        }

        let records = engine.history().records();
        assert_eq!(records.len(), requests.len());
        for (record, (path, success)) in records.iter().zip(requests) {
            assert_eq!(record.path, path);
            assert_eq!(record.success, success, "{path}");
            assert_eq!(record.access, Mode::Read);
        }
        assert_eq!(records[0].prefix, "/scratch");
    }

    #[test]
    fn test_remote_authority_vetoes() {
        let authorities = RemoteAuthorityConfig::parse(
            r#""^/remote/.*" = { IP = "127.0.0.1", PORT = 9 }"#,
        )
        .unwrap();
        let history = Arc::new(HistoryLog::in_memory());

        let denying = FixedAuthorizer::new(Verdict::Deny("no".to_string()), &history);
        let engine = AccessEngine::builder()
            .history(Arc::clone(&history))
            .authorities(authorities.clone())
            .authorizer(denying.clone())
            .build();

        assert_eq!(
            engine.decide(&AccessRequest::new("/remote/f", Mode::Read), &os_allows),
            AccessDecision::Denied(Denial::Remote("no".to_string()))
        );
        assert!(!last_record(&history).success);
        assert!(
            engine
                .decide(&AccessRequest::new("/local/f", Mode::Read), &os_allows)
                .is_granted()
        );
        assert_eq!(
            denying.asked.lock().unwrap().clone(),
            vec![(
                "/remote/f".to_string(),
                Mode::Read,
                Endpoint::new("127.0.0.1", 9)
            )]
        );

        let unreachable =
            FixedAuthorizer::new(Verdict::Indeterminate("timed out".to_string()), &history);
        let engine = AccessEngine::builder()
            .history(Arc::clone(&history))
            .authorities(authorities.clone())
            .authorizer(unreachable)
            .build();
        assert!(matches!(
            engine.decide(&AccessRequest::new("/remote/f", Mode::Read), &os_allows),
            AccessDecision::Denied(Denial::Remote(_))
        ));

        let allowing = FixedAuthorizer::new(Verdict::Allow, &history);
        let engine = AccessEngine::builder()
            .history(Arc::clone(&history))
            .authorities(authorities)
            .authorizer(allowing)
            .build();
        assert!(
            engine
                .decide(&AccessRequest::new("/remote/f", Mode::Read), &os_allows)
                .is_granted()
        );
        assert!(last_record(&history).success);
    }

    #[test]
    fn test_remote_not_asked_after_local_denial() {
        let authorities =
            RemoteAuthorityConfig::parse(r#"".*" = { IP = "127.0.0.1", PORT = 9 }"#).unwrap();
        let policy = PolicyBuilder::new().deny(Section::Write, "/.*").build();
        let history = Arc::new(HistoryLog::in_memory());
        let authorizer = FixedAuthorizer::new(Verdict::Allow, &history);
        let engine = AccessEngine::builder()
            .policy(policy)
            .history(Arc::clone(&history))
            .authorities(authorities)
            .authorizer(authorizer.clone())
            .build();

        assert!(
            !engine
                .decide(&AccessRequest::new("/f", Mode::Write), &os_allows)
                .is_granted()
        );
        assert!(authorizer.asked.lock().unwrap().is_empty());
    }

    #[test]
    fn test_engine_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AccessEngine>();
    }
}
