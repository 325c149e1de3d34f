// LANlink CLI — run the overlay client, relay, or control plane, and manage
// parties from the command line.

mod daemon;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use lanlink_core::config::Config;
use lanlink_core::control::{ControlPlane, HttpControlClient, RelayRegistration};
use lanlink_core::modsync::{ModManifest, SyncMode, SyncPlanner};
use lanlink_core::nat::NatProbe;
use lanlink_core::relay::{RelayServer, RelayServerConfig};
use lanlink_core::tasks::{TaskRegistry, DEFAULT_CANCEL_DEADLINE};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "lanlink", version, about = "Virtual LAN for games")]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the overlay client daemon
    Up {
        /// Party to join; a new party is created when omitted
        #[arg(long)]
        party: Option<String>,
        /// Display name shown to other peers
        #[arg(long, default_value = "player")]
        name: String,
    },
    /// Run a stateless relay server
    Relay {
        /// UDP port to listen on
        #[arg(long)]
        port: Option<u16>,
        /// Region tag announced to the control plane
        #[arg(long, default_value = "global")]
        region: String,
        /// Skip registering with the control plane
        #[arg(long)]
        no_register: bool,
    },
    /// Run the control-plane server
    Control {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long, default_value_t = 8667)]
        port: u16,
    },
    /// Party management
    Party {
        #[command(subcommand)]
        command: PartyCommand,
    },
    /// Probe the local NAT via STUN
    Nat,
    /// Plan a mod sync against a manifest
    ModSync {
        /// Manifest JSON file
        manifest: PathBuf,
        /// Local mod directory
        root: PathBuf,
        #[arg(long, default_value = "managed")]
        mode: String,
        #[arg(long)]
        native_provider: Option<String>,
        /// Peer mod-server base URLs
        #[arg(long)]
        peer_source: Vec<String>,
    },
    /// Show configuration
    Config,
}

#[derive(Subcommand)]
enum PartyCommand {
    /// Show a party's roster
    Status { party_id: String },
    /// Leave a party
    Leave { party_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.verbose)?;

    match cli.command {
        Command::Up { party, name } => {
            let config = Config::load()?;
            daemon::run(config, party, name).await
        }
        Command::Relay {
            port,
            region,
            no_register,
        } => run_relay(port, region, no_register).await,
        Command::Control { host, port } => run_control(host, port).await,
        Command::Party { command } => run_party(command).await,
        Command::Nat => run_nat_probe().await,
        Command::ModSync {
            manifest,
            root,
            mode,
            native_provider,
            peer_source,
        } => run_mod_sync(manifest, root, &mode, native_provider.as_deref(), peer_source),
        Command::Config => show_config(),
    }
}

fn init_logging(verbose: bool) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let log_dir = dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("lanlink");
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, "lanlink.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    Ok(guard)
}

async fn run_relay(port: Option<u16>, region: String, no_register: bool) -> Result<()> {
    let config = Config::load()?;
    let port = port.unwrap_or(config.relay_port);

    let mut server_config = RelayServerConfig::default();
    server_config.bind_addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server = RelayServer::new(server_config);

    println!("{}", "LANlink Relay Server".bold());
    println!("listening on 0.0.0.0:{port}");

    let registry = Arc::new(TaskRegistry::new());
    registry.spawn("relay_eviction", server.clone().eviction_loop());
    registry.spawn("relay_stats", server.clone().stats_loop());

    if !no_register {
        if let Err(e) = register_relay(&config, port, &region).await {
            println!(
                "{} control-plane registration failed: {e} (relay still runs)",
                "⚠".yellow()
            );
        } else {
            println!("{} registered with control plane ({region})", "✓".green());
        }
    }

    let run = {
        let server = server.clone();
        tokio::spawn(server.run())
    };

    tokio::signal::ctrl_c().await?;
    println!("\nshutting down...");
    run.abort();
    registry.cancel_all(DEFAULT_CANCEL_DEADLINE).await;
    Ok(())
}

async fn register_relay(config: &Config, port: u16, region: &str) -> Result<()> {
    let public_ip = config
        .relay_public_ip
        .as_deref()
        .context("relay_public_ip not configured")?
        .parse()
        .context("relay_public_ip is not a valid IPv4 address")?;

    let relay_id = format!("relay-{}", hex::encode(rand::random::<[u8; 4]>()));
    let client = HttpControlClient::new(&config.control_url);
    client.register_peer(&relay_id).await?;
    client
        .register_relay(RelayRegistration {
            relay_id,
            public_ip,
            port,
            region: region.to_string(),
            capacity: 100,
        })
        .await?;
    Ok(())
}

async fn run_control(host: String, port: u16) -> Result<()> {
    let config = Config::load()?;
    let store = Arc::new(
        lanlink_core::control::ControlStore::open(&config.config_dir.join("control_plane"))
            .context("failed to open control-plane store")?,
    );

    let registry = Arc::new(TaskRegistry::new());
    registry.spawn(
        "control_reaper",
        store.clone().reaper_loop(Duration::from_secs(60)),
    );

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("invalid control listen address")?;

    println!("{}", "LANlink Control Plane".bold());
    println!("listening on {addr}");

    tokio::select! {
        result = lanlink_core::control::serve(store, addr) => {
            result.context("control-plane server error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\nshutting down...");
        }
    }

    registry.cancel_all(DEFAULT_CANCEL_DEADLINE).await;
    Ok(())
}

async fn run_party(command: PartyCommand) -> Result<()> {
    let config = Config::load()?;
    let peer_id = daemon::local_peer_id(&config)?;
    let client = HttpControlClient::new(&config.control_url);
    client.register_peer(&peer_id).await?;

    match command {
        PartyCommand::Status { party_id } => {
            let Some(party) = client.get_party(&party_id).await? else {
                println!("{} party {} not found", "✗".red(), party_id);
                return Ok(());
            };
            println!("{} ({})", party.name.bold(), party.party_id);
            println!("host: {}", party.host_id);
            for (id, peer) in &party.peers {
                let marker = if *id == party.host_id { "★" } else { "•" };
                println!(
                    "  {} {} [{}] {}:{} nat={}",
                    marker, peer.name, id, peer.public_ip, peer.public_port, peer.nat_type
                );
            }
        }
        PartyCommand::Leave { party_id } => {
            let outcome = client.leave_party(&party_id, &peer_id).await?;
            println!("{} left party ({outcome:?})", "✓".green());
        }
    }
    Ok(())
}

async fn run_nat_probe() -> Result<()> {
    let config = Config::load()?;
    let result = NatProbe::new(config.stun_servers)
        .probe()
        .await
        .context("NAT probe failed")?;

    println!("NAT type:    {}", result.nat_type.to_string().bold());
    println!("Public:      {}:{}", result.public_ip, result.public_port);
    println!("Local:       {}:{}", result.local_ip, result.local_port);
    Ok(())
}

fn run_mod_sync(
    manifest_path: PathBuf,
    root: PathBuf,
    mode: &str,
    native_provider: Option<&str>,
    peer_sources: Vec<String>,
) -> Result<()> {
    let mode: SyncMode = mode.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    let raw = std::fs::read_to_string(&manifest_path)
        .with_context(|| format!("failed to read {}", manifest_path.display()))?;
    let manifest: ModManifest = serde_json::from_str(&raw).context("invalid manifest")?;

    let plan = SyncPlanner::build_plan(mode, &manifest, &root, native_provider, &peer_sources)?;

    if plan.ready {
        println!("{} all artifacts present", "✓".green());
    } else {
        println!(
            "{} {} artifact(s) needed",
            "⚠".yellow(),
            plan.needed_artifacts.len()
        );
    }
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

fn show_config() -> Result<()> {
    let config = Config::load()?;
    println!("config file: {}", config.config_file().display());
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
