//! End-to-end scenarios: policy file, history file and a guarded passthrough
//! filesystem on a scratch directory.

#![allow(clippy::unwrap_used)] // unwrap is acceptable in tests

use std::sync::Arc;

use sbacfs::{
    Filesystem, FsError, GuardedFs, HistoryLog, PassthroughFs, RecordField, Settings, FMODE_EXEC,
};

const POLICY: &str = "\
# sandbox policy
[read]
.* = allow

[write]
^/scratch/.* = allow
.* = deny

[execute]
.* = allow

[written-no-execute]
.* = allow

[first-object-only]
^/scratch/.* = allow
^/scratch/shared/.* = deny
";

struct Sandbox {
    dir: tempfile::TempDir,
    settings: Settings,
}

impl Sandbox {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir_all(root.join("scratch/shared")).unwrap();
        std::fs::write(root.join("scratch/one"), b"1").unwrap();
        std::fs::write(root.join("scratch/two"), b"2").unwrap();
        std::fs::write(root.join("scratch/shared/x"), b"x").unwrap();
        std::fs::write(root.join("scratch/shared/y"), b"y").unwrap();
        std::fs::write(root.join("tool"), b"#!/bin/sh\n").unwrap();

        let policy = dir.path().join("policy.ini");
        std::fs::write(&policy, POLICY).unwrap();

        let settings = Settings {
            policy: Some(policy),
            state: Some(dir.path().join("state.jsonl")),
            ..Settings::default()
        };
        Self { dir, settings }
    }

    fn mount(&self) -> GuardedFs<PassthroughFs> {
        let engine = self.settings.build_engine().unwrap();
        GuardedFs::new(
            Arc::new(PassthroughFs::new(self.dir.path().join("root"))),
            Arc::new(engine),
        )
    }
}

fn denied<T: std::fmt::Debug>(result: Result<T, FsError>) -> bool {
    matches!(result, Err(FsError::PermissionDenied(_)))
}

#[test]
fn test_selection_survives_restart() {
    let sandbox = Sandbox::new();

    {
        let fs = sandbox.mount();
        let fh = fs.open("/scratch/one", libc::O_RDONLY).unwrap();
        fs.release("/scratch/one", fh).unwrap();
        assert!(denied(fs.open("/scratch/two", libc::O_RDONLY)));
    }

    let fs = sandbox.mount();
    assert!(denied(fs.open("/scratch/two", libc::O_RDONLY)));
    let fh = fs.open("/scratch/one", libc::O_RDONLY).unwrap();
    assert_eq!(fs.read("/scratch/one", fh, 0, 8).unwrap(), b"1");
}

#[test]
fn test_exempt_directory_allows_every_object() {
    let sandbox = Sandbox::new();
    let fs = sandbox.mount();

    for path in ["/scratch/shared/x", "/scratch/shared/y"] {
        let fh = fs.open(path, libc::O_RDONLY).unwrap();
        fs.release(path, fh).unwrap();
    }
}

#[test]
fn test_written_file_cannot_be_executed() {
    let sandbox = Sandbox::new();
    let fs = sandbox.mount();

    let fh = fs.create("/scratch/dropper", 0o755).unwrap();
    fs.write("/scratch/dropper", fh, 0, b"#!/bin/sh\n").unwrap();
    fs.release("/scratch/dropper", fh).unwrap();

    assert!(denied(fs.open("/scratch/dropper", libc::O_RDONLY | FMODE_EXEC)));

    let fh = fs.open("/tool", libc::O_RDONLY | FMODE_EXEC).unwrap();
    fs.release("/tool", fh).unwrap();
}

#[test]
fn test_writes_outside_scratch_are_denied() {
    let sandbox = Sandbox::new();
    let fs = sandbox.mount();

    assert!(denied(fs.unlink("/tool")));
    assert!(denied(fs.mkdir("/new", 0o755)));
    assert!(denied(fs.rename("/scratch/one", "/one")));
    assert!(sandbox.dir.path().join("root/tool").exists());

    fs.mkdir("/scratch/new", 0o755).unwrap();
}

#[test]
fn test_every_decision_is_persisted() {
    let sandbox = Sandbox::new();
    {
        let fs = sandbox.mount();
        let _ = fs.unlink("/tool");
        let _ = fs.readdir("/scratch");
    }

    let history = HistoryLog::open(sandbox.settings.state.as_deref().unwrap()).unwrap();
    let records = history.records();
    assert_eq!(records.len(), 2);
    assert!(!records[0].success);
    assert!(records[1].success);
    assert_eq!(history.query(RecordField::Path, "/scratch").len(), 1);
}
