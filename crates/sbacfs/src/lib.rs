//! sbacfs: state-based access control for a passthrough filesystem
//!
//! sbacfs decides every file operation a FUSE dispatcher forwards. A request
//! is matched against a per-access-class policy, then vetoed by
//! history-sensitive rules ("never execute what was written",
//! "only one object per directory") and optionally by remote authorities
//! reached over TCP. Granted operations are forwarded to a directory on the
//! host; denied ones fail with `EPERM`. Every decision is appended to a
//! history log that the rules consult.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sbacfs::{AccessEngine, Filesystem, GuardedFs, PassthroughFs, Policy};
//!
//! let policy = Policy::load(Some("policy.ini".as_ref()))?;
//! let engine = Arc::new(AccessEngine::builder().policy(policy).build());
//! let fs = GuardedFs::new(Arc::new(PassthroughFs::new("/srv/data")), engine);
//! fs.readdir("/")?;
//! ```

pub mod config;
pub mod engine;
pub mod history;
pub mod passthrough;
pub mod policy;
pub mod remote;
pub mod request;
pub mod rules;

pub use config::{Settings, SettingsError};
pub use engine::{
    AccessDecision, AccessEngine, AccessEngineBuilder, Denial, Grant, PermissionOracle,
};
pub use history::{AccessRecord, HistoryError, HistoryLog, RecordField};
pub use passthrough::{
    DirEntry, Filesystem, FsError, FsResult, GuardedFs, Metadata, PassthroughFs, StatFs,
};
pub use policy::{CompiledPolicy, Policy, PolicyBuilder, PolicyCompiler, PolicyError, Section};
pub use remote::{
    AuthorityConfigError, Endpoint, RemoteAuthorityConfig, RemoteAuthorizer, Resolution,
    TcpAuthorizer, TransportError, Verdict, authorize_remote,
};
pub use request::{AccessClass, AccessRequest, FMODE_EXEC, Mode};
pub use rules::StateRule;
