//! meshcoord - control-plane coordinator for the tunnel mesh
//!
//! Accepts TCP connections from agents and clients, classifies each one by its
//! opening handshake frame and hands it to the coordinator. With the `memory`
//! propagation backend every listen address gets its own coordinator instance
//! and the instances exchange updates over an in-process bus.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use meshcoord_control::{Coordinator, CoordinatorConfig, MemoryBus};
use meshcoord_proto::{read_handshake, Handshake};
use serde::{Deserialize, Serialize};
use std::fs;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_LISTEN: &str = "0.0.0.0:7070";
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// meshcoord - broker node descriptors between tunnel agents and clients
#[derive(Parser, Debug)]
#[command(name = "meshcoord")]
#[command(about = "Control-plane coordinator for the tunnel mesh")]
#[command(version)]
#[command(long_version = concat!(
    env!("GIT_TAG"),
    "\nCommit: ",
    env!("GIT_HASH"),
    "\nBuilt: ",
    env!("BUILD_TIME")
))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log filter (trace, debug, info, warn, error or a full EnvFilter directive)
    #[arg(long, global = true, env = "MESHCOORD_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept agent and client connections and coordinate them
    #[command(long_about = r#"
Listen for agent and client connections. Every connection opens with a
handshake frame naming its role and identity; the coordinator then keeps
each client up to date with its agent's node, and each agent up to date
with the nodes of every client bound to it.

EXAMPLES:
  # Listen on the default address
  meshcoord serve

  # Listen on a custom address with a config file
  meshcoord serve --listen 127.0.0.1:7070 --config meshcoord.yaml

  # Two linked coordinator instances in one process
  meshcoord serve --listen 127.0.0.1:7070,127.0.0.1:7071 --propagation memory

ENVIRONMENT VARIABLES:
  MESHCOORD_LISTEN       Addresses to listen on (comma-separated)
  MESHCOORD_PROPAGATION  Propagation backend (none, memory)
  MESHCOORD_LOG_LEVEL    Log filter
    "#)]
    Serve {
        /// Addresses to listen on (default 0.0.0.0:7070)
        #[arg(long, env = "MESHCOORD_LISTEN", value_delimiter = ',')]
        listen: Vec<String>,

        /// How coordinator instances exchange node updates
        #[arg(long, value_enum, env = "MESHCOORD_PROPAGATION")]
        propagation: Option<PropagationBackend>,

        /// Configuration file (YAML)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// How long a new connection may take to send its handshake
        #[arg(long)]
        handshake_timeout_ms: Option<u64>,
    },

    /// Validate a configuration file and print the effective settings
    CheckConfig {
        /// Configuration file (YAML)
        #[arg(long, short = 'c')]
        config: PathBuf,
    },
}

/// How coordinator instances in this process exchange node updates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
enum PropagationBackend {
    /// One coordinator shared by every listener
    #[default]
    None,
    /// One coordinator per listener, linked by an in-process bus
    Memory,
}

/// A single address or a list of them
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum ListenAddrs {
    One(String),
    Many(Vec<String>),
}

impl ListenAddrs {
    fn into_vec(self) -> Vec<String> {
        match self {
            ListenAddrs::One(addr) => vec![addr],
            ListenAddrs::Many(addrs) => addrs,
        }
    }
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    /// Addresses to listen on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    listen: Option<ListenAddrs>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    propagation: Option<PropagationBackend>,

    /// Handshake deadline for new connections, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    handshake_timeout_ms: Option<u64>,

    /// Coordinator tuning
    #[serde(default)]
    coordinator: CoordinatorConfig,
}

/// Effective settings after merging flags over the config file
#[derive(Debug, Clone, PartialEq)]
struct ServeSettings {
    listen: Vec<String>,
    propagation: PropagationBackend,
    handshake_timeout: Duration,
    coordinator: CoordinatorConfig,
}

/// Setup logging; an explicit filter wins over `--verbose`
fn setup_logging(log_level: Option<&str>, verbose: bool) -> Result<()> {
    let log_level = log_level.unwrap_or(if verbose { "debug" } else { "info" });

    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from YAML file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge CLI args with the config file, giving precedence to CLI args
fn build_settings(
    listen: Vec<String>,
    propagation: Option<PropagationBackend>,
    config: Option<&Path>,
    handshake_timeout_ms: Option<u64>,
) -> Result<ServeSettings> {
    let file = match config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    let mut listen = if listen.is_empty() {
        file.listen.map(ListenAddrs::into_vec).unwrap_or_default()
    } else {
        listen
    };
    listen.retain(|addr| !addr.trim().is_empty());
    if listen.is_empty() {
        listen.push(DEFAULT_LISTEN.to_string());
    }
    let propagation = propagation.or(file.propagation).unwrap_or_default();
    let handshake_timeout_ms = handshake_timeout_ms
        .or(file.handshake_timeout_ms)
        .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_MS);

    if handshake_timeout_ms == 0 {
        anyhow::bail!("handshake_timeout_ms must be greater than zero");
    }
    file.coordinator
        .validate()
        .context("Invalid coordinator configuration")?;

    Ok(ServeSettings {
        listen,
        propagation,
        handshake_timeout: Duration::from_millis(handshake_timeout_ms),
        coordinator: file.coordinator,
    })
}

/// Accept connections until `shutdown` resolves, then close the coordinator
async fn run_listener<F>(
    listener: TcpListener,
    coordinator: Coordinator,
    handshake_timeout: Duration,
    shutdown: F,
) where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tokio::spawn(handle_connection(
                        coordinator.clone(),
                        stream,
                        addr,
                        handshake_timeout,
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                }
            },
        }
    }

    info!("Closing all peer sessions");
    coordinator.close_and_wait().await;
}

/// Classify one raw connection and serve it until it closes
async fn handle_connection(
    coordinator: Coordinator,
    mut stream: TcpStream,
    addr: SocketAddr,
    handshake_timeout: Duration,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(remote = %addr, error = %e, "Failed to set TCP_NODELAY");
    }

    let handshake =
        match tokio::time::timeout(handshake_timeout, read_handshake(&mut stream)).await {
            Ok(Ok(handshake)) => handshake,
            Ok(Err(e)) => {
                warn!(remote = %addr, error = %e, "Rejected connection: invalid handshake");
                return;
            }
            Err(_) => {
                warn!(remote = %addr, "Rejected connection: handshake timed out");
                return;
            }
        };

    info!(
        remote = %addr,
        role = %handshake.role(),
        peer_id = %handshake.peer_id(),
        "Accepted peer connection"
    );

    let result = match handshake {
        Handshake::Agent { id } => coordinator.serve_agent(stream, id).await,
        Handshake::Client { id, agent } => coordinator.serve_client(stream, id, agent).await,
    };

    match result {
        Ok(()) => debug!(remote = %addr, "Connection finished"),
        Err(e) => warn!(remote = %addr, error = %e, "Connection ended with error"),
    }
}

/// One coordinator per listen address, in listen order.
///
/// Without propagation every listener shares a single instance. Must be
/// called from within a Tokio runtime.
fn build_coordinators(settings: &ServeSettings) -> Vec<Coordinator> {
    match settings.propagation {
        PropagationBackend::None => {
            let coordinator = Coordinator::new(settings.coordinator.clone());
            vec![coordinator; settings.listen.len()]
        }
        PropagationBackend::Memory => {
            let bus = MemoryBus::new();
            settings
                .listen
                .iter()
                .map(|_| {
                    Coordinator::with_propagation(
                        settings.coordinator.clone(),
                        Arc::new(bus.clone()),
                    )
                })
                .collect()
        }
    }
}

async fn serve(settings: ServeSettings) -> Result<()> {
    let mut listeners = Vec::with_capacity(settings.listen.len());
    for addr in &settings.listen {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        listeners.push(listener);
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut servers = Vec::with_capacity(listeners.len());
    for (listener, coordinator) in listeners.into_iter().zip(build_coordinators(&settings)) {
        let local_addr = listener
            .local_addr()
            .context("Failed to read listener address")?;
        let config = coordinator.config();
        info!(
            address = %local_addr,
            instance_id = %coordinator.instance_id(),
            max_frame_size = config.max_frame_size,
            write_timeout = ?config.write_timeout(),
            "Coordinator listening"
        );

        let mut stop = stop_rx.clone();
        servers.push(tokio::spawn(run_listener(
            listener,
            coordinator,
            settings.handshake_timeout,
            async move {
                let _ = stop.changed().await;
            },
        )));
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down..."),
        Err(e) => {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
    let _ = stop_tx.send(true);

    for server in servers {
        if let Err(e) = server.await {
            warn!(error = %e, "Listener task failed");
        }
    }

    info!("Coordinator stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.log_level.as_deref(), cli.verbose)?;

    match cli.command {
        Commands::Serve {
            listen,
            propagation,
            config,
            handshake_timeout_ms,
        } => {
            info!("meshcoord starting...");
            let settings =
                build_settings(listen, propagation, config.as_deref(), handshake_timeout_ms)?;
            info!("Listen addresses: {}", settings.listen.join(", "));
            info!("Propagation: {:?}", settings.propagation);
            serve(settings).await
        }
        Commands::CheckConfig { config } => {
            let settings = build_settings(Vec::new(), None, Some(&config), None)?;
            let effective = ConfigFile {
                listen: Some(ListenAddrs::Many(settings.listen)),
                propagation: Some(settings.propagation),
                handshake_timeout_ms: Some(settings.handshake_timeout.as_millis() as u64),
                coordinator: settings.coordinator,
            };
            let rendered =
                serde_yaml::to_string(&effective).context("Failed to render configuration")?;
            println!("{}", rendered);
            Ok(())
        }
    }
}
