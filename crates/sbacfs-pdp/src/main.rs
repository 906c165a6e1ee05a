//! sbacfs decision point
//!
//! Answers remote authorization requests from sbacfs according to an
//! allowlist of peers, paths and operations.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use sbacfs_pdp::{Allowlist, PdpServer};

/// sbacfs decision point - remote authorization over TCP
#[derive(Parser, Debug)]
#[command(name = "sbacfs-pdp")]
#[command(about = "Reference remote policy decision point for sbacfs")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:2233")]
    addr: SocketAddr,

    /// Allowlist file (TOML with `peers`, `paths` and `modes`)
    #[arg(long)]
    allowlist: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    let allowlist = match &args.allowlist {
        Some(path) => Allowlist::load(path)
            .with_context(|| format!("loading allowlist {}", path.display()))?,
        None => {
            tracing::warn!("No allowlist given, using the built-in demo allowlist");
            Allowlist::default()
        }
    };

    PdpServer::new(allowlist)
        .run(args.addr)
        .await
        .with_context(|| format!("serving on {}", args.addr))?;

    Ok(())
}
