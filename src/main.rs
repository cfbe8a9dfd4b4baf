//! gamelink CLI - Share a local game server with a friend
//!
//! The host exposes a local service; the guest gets a local port that
//! tunnels to it.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use gamelink_lib::{AcceptMode, TunnelConfig, TunnelEngine, TunnelRole};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// gamelink - Tunnel local TCP services between two peers
#[derive(Parser, Debug)]
#[command(name = "gamelink")]
#[command(about = "gamelink - Tunnel local TCP services between two peers")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Load settings from a YAML or JSON file; flags override it
    #[arg(short, long, global = true, env = "GAMELINK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Host a local service for guests
    #[command(long_about = r#"
Listen for guests and forward their connections to a service running on
this machine. Connections to 127.0.0.1:<target-port> are opened on demand.

EXAMPLES:
  # Share a Minecraft server running on port 25565
  gamelink host --target-port 25565

  # Listen for guests on a specific address
  gamelink host --target-port 7777 --listen 0.0.0.0:27015

ENVIRONMENT VARIABLES:
  GAMELINK_TARGET_PORT  Local port of the hosted service
  GAMELINK_LISTEN       Address guests connect to
    "#)]
    Host {
        /// Port of the local service to share
        #[arg(long, env = "GAMELINK_TARGET_PORT")]
        target_port: Option<u16>,

        /// Address to accept guests on
        #[arg(long, env = "GAMELINK_LISTEN")]
        listen: Option<SocketAddr>,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Join a host and expose its service on a local port
    #[command(long_about = r#"
Connect to a host and open a local port. Every connection to that port is
tunneled to the host's service. Reconnects automatically when the link drops.

EXAMPLES:
  # Join a host and play on localhost:8888
  gamelink join --peer 203.0.113.7:27015

  # Use the game's default port and one connection at a time
  gamelink join --peer 203.0.113.7:27015 --local-port 25565 --single

ENVIRONMENT VARIABLES:
  GAMELINK_PEER        Host address
  GAMELINK_LOCAL_PORT  Local port to open
    "#)]
    Join {
        /// Host to connect to (host:port)
        #[arg(long, env = "GAMELINK_PEER")]
        peer: Option<String>,

        /// Local port to open
        #[arg(long, env = "GAMELINK_LOCAL_PORT")]
        local_port: Option<u16>,

        /// Local address to bind
        #[arg(long, env = "GAMELINK_BIND")]
        bind: Option<IpAddr>,

        /// Serve one local connection at a time
        #[arg(long)]
        single: bool,

        /// Reconnection attempts before giving up
        #[arg(long, env = "GAMELINK_RETRIES")]
        retries: Option<u32>,

        /// Seconds to wait for each connection attempt
        #[arg(long)]
        connect_timeout: Option<u64>,

        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Identity announced to the peer (generated if not specified)
    #[arg(long, env = "GAMELINK_IDENTITY")]
    identity: Option<String>,

    /// Milliseconds allowed for opening the local service connection
    #[arg(long)]
    dial_timeout: Option<u64>,
}

fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn apply_common(config: &mut TunnelConfig, common: CommonArgs) {
    if let Some(identity) = common.identity {
        config.identity = identity;
    }
    if let Some(millis) = common.dial_timeout {
        config.dial_timeout = Duration::from_millis(millis);
    }
}

fn build_config(base: Option<PathBuf>, command: Commands) -> Result<TunnelConfig> {
    let mut config = match base {
        Some(path) => TunnelConfig::from_file(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => TunnelConfig::default(),
    };

    match command {
        Commands::Host {
            target_port,
            listen,
            common,
        } => {
            config.role = TunnelRole::Host;
            if target_port.is_some() {
                config.local_target_port = target_port;
            }
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            apply_common(&mut config, common);
        }
        Commands::Join {
            peer,
            local_port,
            bind,
            single,
            retries,
            connect_timeout,
            common,
        } => {
            config.role = TunnelRole::Guest;
            if peer.is_some() {
                config.peer = peer;
            }
            if let Some(port) = local_port {
                config.local_port = port;
            }
            if let Some(bind) = bind {
                config.local_bind = bind;
            }
            if single {
                config.accept_mode = AcceptMode::Single;
            }
            if let Some(retries) = retries {
                config.retry_budget = retries;
            }
            if let Some(secs) = connect_timeout {
                config.connect_timeout = Duration::from_secs(secs);
            }
            apply_common(&mut config, common);
        }
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = build_config(cli.config, cli.command)?;
    match config.role {
        TunnelRole::Host => info!(
            "Hosting 127.0.0.1:{} for guests on {}",
            config.local_target_port.unwrap_or_default(),
            config.listen_addr
        ),
        TunnelRole::Guest => info!(
            "Joining {} and opening {}:{}",
            config.peer.as_deref().unwrap_or_default(),
            config.local_bind,
            config.local_port
        ),
    }

    let (engine, _channel, events) =
        TunnelEngine::with_tcp(config).context("Failed to create tunnel")?;

    let mut run = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(events).await })
    };

    tokio::select! {
        result = &mut run => {
            match result.context("Tunnel task panicked")? {
                Ok(()) => info!("Tunnel closed"),
                Err(e) => {
                    error!("Tunnel failed: {}", e);
                    return Err(e.into());
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            engine.shutdown();
            let _ = run.await;
        }
    }

    Ok(())
}
