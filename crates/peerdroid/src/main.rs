#![forbid(unsafe_code)]

use peerdroid::config::{load_config, Cli, Commands, LinkConfig};
use peerdroid::keypair::WalletIdentity;
use peerdroid::link::parse_link_payload;
use peerdroid::store::{PeerStore, TomlPeerStore};
use peerdroid::types::PeerId;

use clap::Parser;
use std::io::IsTerminal;
use tracing::debug;
use tracing_subscriber::EnvFilter;

// ── ANSI style helpers ──────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const CYAN: &str = "\x1b[36m";

fn tty() -> bool {
    std::io::stdout().is_terminal()
}

fn style(code: &'static str) -> &'static str {
    if tty() {
        code
    } else {
        ""
    }
}

fn init_tracing(cli: &Cli) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match cli.verbose {
            0 => "peerdroid=info",
            1 => "peerdroid=debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load(cli: &Cli) -> anyhow::Result<LinkConfig> {
    let config = load_config(cli.config.as_deref())?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;
    debug!(relay = %config.relay, "configuration loaded");
    Ok(config)
}

// ── Commands ────────────────────────────────────────────────────────

fn cmd_identity(config: &LinkConfig) -> anyhow::Result<()> {
    let identity = WalletIdentity::load_or_create(&config.identity_file())?;
    if tty() {
        println!(
            "{}Link key{}  {}{}{}",
            style(DIM),
            style(RESET),
            style(CYAN),
            identity.public_key_hex(),
            style(RESET)
        );
    } else {
        println!("{}", identity.public_key_hex());
    }
    Ok(())
}

fn cmd_peers(config: &LinkConfig) -> anyhow::Result<()> {
    let store = TomlPeerStore::open(config.store_file())?;
    let mut records = store.load()?;
    if records.is_empty() {
        println!("{}No linked peers.{}", style(DIM), style(RESET));
        return Ok(());
    }
    records.sort_by(|a, b| a.display_name.cmp(&b.display_name));
    println!(
        "{}{:<36}  {:<20}  CONNECTION{}",
        style(BOLD),
        "ID",
        "NAME",
        style(RESET)
    );
    for record in records {
        println!(
            "{:<36}  {:<20}  {}{}{}",
            record.id,
            record.display_name,
            style(DIM),
            record.secret().connection_id(),
            style(RESET)
        );
    }
    Ok(())
}

fn cmd_forget(config: &LinkConfig, id: &str) -> anyhow::Result<()> {
    let id: PeerId = id
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid peer id {id:?}: {e}"))?;
    let store = TomlPeerStore::open(config.store_file())?;
    store.delete(&id)?;
    println!("{}✓{} forgot {id}", style(GREEN), style(RESET));
    Ok(())
}

fn cmd_inspect(payload: &str) -> anyhow::Result<()> {
    match parse_link_payload(payload) {
        Ok(link) => {
            println!(
                "{}Connection{}  {}",
                style(DIM),
                style(RESET),
                link.connection_id()
            );
            println!(
                "{}Purpose{}     {}",
                style(DIM),
                style(RESET),
                serde_json::to_value(link.purpose)?
                    .as_str()
                    .unwrap_or("unknown")
            );
            println!(
                "{}Remote key{}  {}{}{}",
                style(DIM),
                style(RESET),
                style(CYAN),
                link.remote_public_key_hex(),
                style(RESET)
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("{}✗{} {e}", style(RED), style(RESET));
            Err(e.into())
        }
    }
}

fn cmd_config(config: &LinkConfig) -> anyhow::Result<()> {
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = load(&cli)?;
    match &cli.command {
        Commands::Identity => cmd_identity(&config),
        Commands::Peers => cmd_peers(&config),
        Commands::Forget { id } => cmd_forget(&config, id),
        Commands::Inspect { payload } => cmd_inspect(payload),
        Commands::Config => cmd_config(&config),
    }
}
