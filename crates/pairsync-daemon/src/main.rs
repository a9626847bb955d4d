//! Headless pairsync link.
//!
//! Runs one side of a pair and takes line commands on stdin:
//!
//!   pairsync --role host --workspace ~/proj
//!   pairsync --role peer --workspace ~/proj --open-command "code --goto {path}:{line}:{column}"

mod bridge;
mod config;
mod console;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use pairsync_link::{FocusChain, LinkEvent, LinkHandle, PairStore, Role};
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use crate::bridge::{CommandBridge, CommandFocuser};
use crate::config::{FileConfig, Overrides, Settings};

/// Keep two editors on the same file and hand focus between them.
#[derive(Parser, Debug)]
#[command(name = "pairsync", version, about)]
struct Args {
    /// TOML config file.
    #[arg(short, long, env = "PAIRSYNC_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "PAIRSYNC_ROLE", value_parser = parse_role)]
    role: Option<Role>,

    /// Tag attached to outbound state; defaults to the role name.
    #[arg(long, env = "PAIRSYNC_IDENTITY")]
    identity: Option<String>,

    /// Workspace path announced to the peer.
    #[arg(short, long, env = "PAIRSYNC_WORKSPACE")]
    workspace: Option<String>,

    #[arg(long, env = "PAIRSYNC_DISCOVERY_PORT")]
    discovery_port: Option<u16>,

    #[arg(long, env = "PAIRSYNC_BIND_HOST")]
    bind_host: Option<String>,

    #[arg(long)]
    no_auto_reconnect: bool,

    /// Pair history file; defaults to the per-user config directory.
    #[arg(long, env = "PAIRSYNC_STORE")]
    store: Option<PathBuf>,

    /// Keep pair history in memory only.
    #[arg(long, conflicts_with = "store")]
    ephemeral: bool,

    /// Command used to open a file, with {path}, {line} and {column}.
    #[arg(long, env = "PAIRSYNC_OPEN_COMMAND")]
    open_command: Option<String>,

    /// Start disabled; use `enable` on stdin.
    #[arg(long)]
    idle: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn parse_role(raw: &str) -> Result<Role, String> {
    match raw {
        "host" => Ok(Role::Host),
        "peer" => Ok(Role::Peer),
        other => Err(format!("expected `host` or `peer`, got `{other}`")),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default = if args.verbose { "pairsync=debug" } else { "pairsync=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default.parse()?))
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(start(args));
    // A pending stdin read cannot be cancelled; don't wait for it.
    runtime.shutdown_background();
    result
}

async fn start(args: Args) -> anyhow::Result<()> {
    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let ephemeral = args.ephemeral;
    let idle = args.idle;
    let settings = Settings::resolve(
        file,
        Overrides {
            role: args.role,
            identity: args.identity,
            workspace: args.workspace,
            discovery_port: args.discovery_port,
            bind_host: args.bind_host,
            no_auto_reconnect: args.no_auto_reconnect,
            store_path: args.store,
            open_command: args.open_command,
        },
    )?;

    let store = match settings.store_path.clone().or_else(pairsync_link::default_store_path) {
        Some(path) if !ephemeral => PairStore::open(path),
        _ => PairStore::in_memory(),
    };
    if let Some(path) = store.path() {
        tracing::info!(path = %path.display(), pairs = store.history().pairs.len(), "pair history");
    }

    let mut focus = FocusChain::new();
    for template in &settings.focus_commands {
        focus.push(Box::new(CommandFocuser::new(template.clone())));
    }
    let bridge = Arc::new(CommandBridge::new(settings.open_command.clone()));

    tracing::info!(
        role = ?settings.link.role,
        workspace = %settings.link.workspace,
        discovery_port = settings.link.discovery_port,
        "starting pairsync"
    );
    let link = pairsync_link::spawn(settings.link, store, bridge, focus);
    tokio::spawn(report_events(link.clone()));

    if !idle {
        if let Err(e) = link.enable().await {
            tracing::error!(error = %e, "could not enable link");
        }
    }

    let stdin = BufReader::new(tokio::io::stdin());
    tokio::select! {
        result = console::run(&link, stdin) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }

    link.shutdown().await?;
    Ok(())
}

async fn report_events(link: LinkHandle) {
    let mut events = link.subscribe();
    loop {
        match events.recv().await {
            Ok(LinkEvent::IncomingState(state)) => tracing::info!(
                path = %state.file_path,
                line = state.line,
                column = state.column,
                source = %state.source,
                switch = state.is_switch(),
                "peer moved"
            ),
            Ok(LinkEvent::FocusRequested) => tracing::info!("peer handed over focus"),
            Ok(LinkEvent::PeerHello { path }) => tracing::info!(peer = %path, "peer workspace"),
            Ok(LinkEvent::Status(status)) => tracing::info!(
                state = ?status.state,
                port = ?status.assigned_port,
                reconnecting = status.reconnecting,
                "link status"
            ),
            Ok(LinkEvent::Notice(message)) => tracing::warn!("{message}"),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "event reporter lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}
