//! Policy Enforcement Example
//!
//! Demonstrates a guarded passthrough filesystem over a scratch directory:
//! a static policy, the written-no-execute rule and the first-object-only
//! rule, and the history they leave behind.
//!
//! Run with: cargo run -p sbacfs --example policy_enforcement

use std::sync::Arc;

use sbacfs::{AccessEngine, FMODE_EXEC, Filesystem, GuardedFs, PassthroughFs, PolicyCompiler};

const POLICY: &str = "\
[read]
.* = allow

[write]
^/inbox/.* = allow
.* = deny

[execute]
.* = allow

[written-no-execute]
.* = allow

[first-object-only]
^/inbox/.* = allow
";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Policy Enforcement Example ===\n");

    let root = tempfile::tempdir()?;
    std::fs::create_dir(root.path().join("inbox"))?;
    std::fs::write(root.path().join("inbox/report.pdf"), b"%PDF")?;
    std::fs::write(root.path().join("inbox/invoice.pdf"), b"%PDF")?;
    std::fs::write(root.path().join("README"), b"read me")?;

    let compiled = PolicyCompiler::compile(POLICY);
    for diagnostic in &compiled.diagnostics {
        println!("policy warning: {diagnostic}");
    }

    let engine = AccessEngine::builder().policy(compiled.policy).build();
    let fs = GuardedFs::new(Arc::new(PassthroughFs::new(root.path())), Arc::new(engine));

    // === Static policy ===
    println!("--- Static policy ---");
    report("unlink /README", fs.unlink("/README"));
    report("mkdir /inbox/drafts", fs.mkdir("/inbox/drafts", 0o755));

    // === First object only ===
    println!("\n--- First object only ---");
    // /inbox/drafts above already selected the inbox.
    report(
        "open /inbox/report.pdf",
        fs.open("/inbox/report.pdf", libc::O_RDONLY),
    );

    // === Written, never executed ===
    println!("\n--- Written, never executed ---");
    match fs.create("/inbox/drafts/run.sh", 0o755) {
        Ok(fh) => {
            println!("create /inbox/drafts/run.sh: OK");
            fs.write("/inbox/drafts/run.sh", fh, 0, b"#!/bin/sh\n")?;
            fs.release("/inbox/drafts/run.sh", fh)?;
        }
        Err(e) => println!("create /inbox/drafts/run.sh: {e}"),
    }
    report(
        "exec /inbox/drafts/run.sh",
        fs.open("/inbox/drafts/run.sh", libc::O_RDONLY | FMODE_EXEC),
    );

    // === History ===
    println!("\n--- History ---");
    for record in fs.engine().history().records() {
        println!(
            "  {} {:<8} {:<24} {}",
            record.time.format("%H:%M:%S"),
            record.access.as_str(),
            record.path,
            if record.success { "granted" } else { "denied" }
        );
    }

    Ok(())
}

fn report<T>(what: &str, result: sbacfs::FsResult<T>) {
    match result {
        Ok(_) => println!("{what}: OK"),
        Err(e) => println!("{what}: {e} (errno {})", e.errno()),
    }
}
