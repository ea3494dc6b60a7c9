//! CLI entry point for the overlay messenger.
//!
//! This binary provides a command-line interface for the messenger library,
//! supporting identity inspection, configuration management, invite tokens
//! and running a node.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose, Engine};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use overlay_messenger::{
    crypto::{IdentityStore, PeerId},
    network::{BootstrapSync, HttpRendezvous, NullDht, PeerCache, PortMapping, SyncSettings},
    storage::FileStore,
    utils::{MessengerConfig, StaticServers, DEFAULT_CONFIG_FILE},
    Message, Node,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::watch;

/// Overlay Messenger - peer-to-peer end-to-end encrypted messaging
#[derive(Parser)]
#[command(name = "messenger")]
#[command(about = "A peer-to-peer messenger over a DHT overlay with end-to-end encryption")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    /// Data directory for the identity, DHT table and undelivered messages
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the node identity, creating it on first use
    Identity {
        /// Display format (pretty, hex, base64, json)
        #[arg(short, long, default_value = "pretty")]
        format: String,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Request an invite token from the rendezvous servers
    Invite {
        /// Hours until the token expires
        #[arg(short = 't', long, default_value = "24")]
        hours: u32,
    },
    /// Run the messenger node
    Run {
        /// Port for the message socket and the DHT listener
        #[arg(short, long)]
        port: Option<u16>,
        /// Rendezvous server base URIs, added to the configured ones
        #[arg(short, long)]
        rendezvous: Vec<String>,
        /// Read `<peer-id> <text>` lines from stdin and print the inbox
        #[arg(short, long)]
        interactive: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show current configuration
    Show {
        /// Show only specific section
        #[arg(short, long)]
        section: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = MessengerConfig::load(cli.config.as_deref())?;
    setup_logging(cli.verbose, cli.quiet, &config.logging.level);

    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }

    match cli.command {
        Commands::Identity { format } => handle_identity_command(&format, &config).await,
        Commands::Config { action } => handle_config_commands(action, &config),
        Commands::Invite { hours } => handle_invite_command(hours, &config).await,
        Commands::Run {
            port,
            rendezvous,
            interactive,
        } => handle_run_command(port, rendezvous, interactive, config, cli.config).await,
    }
}

fn setup_logging(verbose: u8, quiet: bool, configured: &str) {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();
}

async fn handle_identity_command(format: &str, config: &MessengerConfig) -> Result<()> {
    config.ensure_directories()?;
    let store = Arc::new(FileStore::new(&config.storage.data_dir));
    let identity = IdentityStore::new(store)
        .ensure_identity()
        .await
        .context("cannot load or create the node identity")?;
    let public_key = identity.public_key().to_bytes();

    match format {
        "hex" => println!("{}", hex::encode(public_key)),
        "base64" => println!("{}", general_purpose::STANDARD.encode(public_key)),
        "json" => {
            let value = serde_json::json!({
                "peer_id": identity.peer_id().to_string(),
                "public_key": hex::encode(public_key),
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        "pretty" => {
            println!("Node Identity");
            println!("=============");
            println!("Peer ID:    {}", identity.peer_id());
            println!("Public Key: {}", hex::encode(public_key));
            println!("Stored in:  {}", config.storage.data_dir.display());
        }
        other => bail!("unknown format '{}', expected pretty, hex, base64 or json", other),
    }
    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &MessengerConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            MessengerConfig::default().save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let config_to_validate = match file {
                Some(path) => MessengerConfig::from_file(path)?,
                None => config.clone(),
            };
            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show { section } => {
            let rendered = match section {
                Some(name) => {
                    let value = toml::Value::try_from(config)?;
                    let Some(part) = value.get(&name) else {
                        bail!("no section '{}' in the configuration", name);
                    };
                    let mut table = toml::map::Map::new();
                    table.insert(name, part.clone());
                    toml::to_string_pretty(&table)?
                }
                None => config.to_toml_string()?,
            };
            println!("{}", rendered);
        }
    }
    Ok(())
}

async fn handle_invite_command(hours: u32, config: &MessengerConfig) -> Result<()> {
    if config.network.rendezvous_servers.is_empty() {
        bail!("no rendezvous servers configured");
    }

    config.ensure_directories()?;
    let store = Arc::new(FileStore::new(&config.storage.data_dir));
    let identity = IdentityStore::new(store).ensure_identity().await?;
    let (_, port) = watch::channel(PortMapping::LocalOnly(config.network.listen_port));

    let bootstrap = BootstrapSync::new(
        identity,
        Arc::new(PeerCache::new()),
        Arc::new(NullDht),
        Arc::new(HttpRendezvous::new(config.timing.http_timeout())?),
        Arc::new(StaticServers(config.network.rendezvous_servers.clone())),
        SyncSettings::from(&config.timing),
        port,
    );

    let token = bootstrap.request_invite(hours).await?;
    println!("{}", token);
    Ok(())
}

async fn handle_run_command(
    port: Option<u16>,
    rendezvous: Vec<String>,
    interactive: bool,
    mut config: MessengerConfig,
    config_path: Option<PathBuf>,
) -> Result<()> {
    if let Some(port) = port {
        config.network.listen_port = port;
    }

    // Servers given on the command line would be lost on a re-read
    let live_path = if rendezvous.is_empty() {
        config_path.filter(|path| path.exists())
    } else {
        None
    };
    for server in rendezvous {
        if !config.network.rendezvous_servers.contains(&server) {
            config.network.rendezvous_servers.push(server);
        }
    }

    let node = Node::start(config, live_path).await?;
    info!("Node {} running, public port {}", node.peer_id(), node.public_port());

    let Some(mut inbox) = node.take_inbox() else {
        bail!("inbox already taken");
    };
    let printer = tokio::spawn(async move {
        while let Some(message) = inbox.recv().await {
            print_message(&message);
        }
    });

    if interactive {
        println!("Messenger running. Type '<peer-id> <text>' to send, 'quit' to exit.");
        println!("Your peer id: {}", node.peer_id());
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line == "quit" || line == "exit" {
                            break;
                        }
                        if !line.is_empty() {
                            send_line(&node, line);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Could not read stdin: {}", e);
                        break;
                    }
                },
                _ = signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }
    } else if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for the shutdown signal: {}", e);
    } else {
        info!("Shutdown signal received");
    }

    node.shutdown().await;
    printer.abort();
    Ok(())
}

fn send_line(node: &Node, line: &str) {
    let Some((peer, text)) = line.split_once(char::is_whitespace) else {
        println!("usage: <peer-id> <text>");
        return;
    };

    match peer.parse::<PeerId>() {
        Ok(peer) => match node.send_text(peer, text.trim()) {
            Ok(call_id) => println!("→ queued {} for {}", call_id, peer),
            Err(e) => println!("✗ {}", e),
        },
        Err(e) => println!("✗ {}", e),
    }
}

fn print_message(message: &Message) {
    let marker = if message.is_system() {
        "ℹ"
    } else if message.decrypted {
        "🔒"
    } else {
        "⚠"
    };
    println!(
        "{} [{}] {} ({}): {}",
        marker,
        message.signed_on.format("%H:%M:%S"),
        message.sender.display_name,
        message.sender.peer_id,
        message.content
    );
}
