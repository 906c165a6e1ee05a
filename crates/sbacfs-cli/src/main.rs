//! sbacfs CLI - inspect policies and try out access decisions
//!
//! Usage:
//!   sbacfs check open /docs/a.txt --root /srv/data   Decide one request
//!   sbacfs policy                                    Print the compiled policy
//!   sbacfs history --path /docs/a.txt                Print recorded decisions

use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use sbacfs::history::load_records;
use sbacfs::{
    AccessDecision, AccessRequest, Grant, Mode, PassthroughFs, Policy, Section, Settings,
};

/// sbacfs - state-based access control for a passthrough filesystem
#[derive(Parser, Debug)]
#[command(name = "sbacfs")]
#[command(about = "Inspect sbacfs policies and decisions")]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Policy file, overriding the settings
    #[arg(long, global = true)]
    policy: Option<PathBuf>,

    /// Remote authority table, overriding the settings
    #[arg(long, global = true)]
    authorities: Option<PathBuf>,

    /// History file, overriding the settings
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    /// More log output (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decide one request and record it in the history
    Check {
        /// Operation (open, read, readdir, write, create, truncate, unlink,
        /// mkdir, rmdir, rename, symlink)
        mode: Mode,
        /// Mount-relative path, e.g. /docs/a.txt
        path: String,
        /// open(2) flags for `open`; 32 (FMODE_EXEC) marks an exec
        #[arg(long, default_value_t = 0)]
        flags: i32,
        /// Directory the path is resolved against when the OS is consulted
        #[arg(long, default_value = "/")]
        root: PathBuf,
    },
    /// Print the compiled policy in match order
    Policy,
    /// Print recorded decisions, most recent last
    History {
        /// Only records for this path
        #[arg(long)]
        path: Option<String>,
    },
}

impl Cli {
    /// Settings from `--config`, with command-line overrides applied.
    fn settings(&self) -> anyhow::Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::load(path)
                .with_context(|| format!("loading settings {}", path.display()))?,
            None => Settings::default(),
        };
        if let Some(policy) = &self.policy {
            settings.policy = Some(policy.clone());
        }
        if let Some(authorities) = &self.authorities {
            settings.authorities = Some(authorities.clone());
        }
        if let Some(state) = &self.state {
            settings.state = Some(state.clone());
        }
        Ok(settings)
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let settings = cli.settings()?;

    match &cli.command {
        Command::Check {
            mode,
            path,
            flags,
            root,
        } => {
            let engine = settings.build_engine()?;
            tracing::info!(
                authorities = engine.authorities().map_or(0, |a| a.len()),
                "access engine ready"
            );
            let request = match mode {
                Mode::Open => AccessRequest::open(path.as_str(), *flags),
                other => AccessRequest::new(path.as_str(), *other),
            };
            let oracle = PassthroughFs::new(root);
            let decision = engine.decide(&request, &oracle);
            println!("{}", describe(&request, &decision));
            Ok(if decision.is_granted() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Policy => {
            let policy = Policy::load(settings.policy.as_deref())?;
            print!("{}", render_policy(&policy));
            Ok(ExitCode::SUCCESS)
        }
        Command::History { path } => {
            let state = settings
                .state
                .context("no history file; pass --state or set `state` in the settings")?;
            for record in load_records(&state)
                .into_iter()
                .filter(|r| path.as_ref().is_none_or(|p| &r.path == p))
            {
                println!("{}", serde_json::to_string(&record)?);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn describe(request: &AccessRequest, decision: &AccessDecision) -> String {
    let subject = format!("{} {} ({})", request.mode, request.path, request.class);
    match decision {
        AccessDecision::Granted(Grant::Policy { pattern }) => {
            format!("granted: {subject} by policy entry '{pattern}'")
        }
        AccessDecision::Granted(Grant::OsFallback { os_permits }) => {
            let os = if *os_permits { "permits" } else { "refuses" };
            format!("granted: {subject}, no policy entry, the OS {os} it")
        }
        AccessDecision::Denied(denial) => format!("denied: {subject}, {denial}"),
    }
}

fn render_policy(policy: &Policy) -> String {
    let mut out = String::new();
    for section in Section::ALL {
        let entries = policy.section(section).entries();
        if entries.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        let _ = writeln!(out, "[{section}]");
        for entry in entries {
            let decision = if entry.allow { "allow" } else { "deny" };
            let _ = writeln!(out, "{} = {decision}", entry.pattern);
        }
    }
    out
}
