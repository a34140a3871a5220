use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clusterhub::config::{Config, ConfigError};
use clusterhub::core::{AddMirrorsRequest, MakeClusterRequest};
use clusterhub::server::{HubClient, HubRequest, HubServer};
use clusterhub::stream::progress::ProgressTracker;
use clusterhub::tls::{Credentials, PemCredentials};
use clusterhub::Hub;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "clusterhub")]
#[command(about = "Provision and extend multi-host segmented database clusters")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config/hub.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub service
    Hub,
    /// Create a new cluster from a request file
    Init {
        /// TOML file describing the coordinator, segments and cluster parameters
        request: PathBuf,
    },
    /// Add mirrors to a running mirrorless cluster
    AddMirrors {
        /// TOML file listing the mirrors to add
        request: PathBuf,
    },
    /// Show the agent status on every host
    Status,
    /// Stop the agent on every host
    StopAgents,
    /// Stop the hub service
    Stop,
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
        /// Hosts running an agent
        #[arg(long, value_delimiter = ',', required = true)]
        hostnames: Vec<String>,
    },
    /// Validate configuration file
    Validate,
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Hub => run_hub(&cli.config).await,
        Commands::Init { request } => {
            let request: MakeClusterRequest = load_request(&request)?;
            send_request(&cli.config, HubRequest::MakeCluster(request)).await
        }
        Commands::AddMirrors { request } => {
            let request: AddMirrorsRequest = load_request(&request)?;
            send_request(&cli.config, HubRequest::AddMirrors(request)).await
        }
        Commands::Status => send_request(&cli.config, HubRequest::StatusAgents).await,
        Commands::StopAgents => send_request(&cli.config, HubRequest::StopAgents).await,
        Commands::Stop => send_request(&cli.config, HubRequest::Stop).await,
        Commands::Config { output, hostnames } => generate_config(&output, hostnames),
        Commands::Validate => validate_config(&cli.config),
        Commands::Version => {
            show_version();
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load_from_file(path).with_context(|| format!("Failed to load config from {:?}", path))
}

fn load_request<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read request {:?}", path))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse request {:?}", path))
}

async fn run_hub(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    init_logging(&config)?;

    info!("Starting clusterhub v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", config_path);

    let acceptor = PemCredentials::from_config(&config.tls).server_acceptor()?;
    let hub = Arc::new(Hub::from_config(config)?);
    let server = HubServer::new(hub, acceptor);
    let listener = server.bind().await?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            on_signal.cancel();
        }
    });

    server.serve(listener, shutdown).await?;
    Ok(())
}

async fn send_request(config_path: &Path, request: HubRequest) -> Result<()> {
    let config = load_config(config_path)?;
    init_logging(&config)?;

    let credentials: Arc<dyn Credentials> = Arc::new(PemCredentials::from_config(&config.tls));
    let client = HubClient::new("localhost", config.hub.port, credentials);
    let mut tracker = ProgressTracker::new();

    let statuses = client.request(&request, &mut tracker).await?;
    if !statuses.is_empty() {
        println!("{:<20}{:<12}{:<24}{}", "HOST", "STATUS", "UPTIME", "PID");
        for status in statuses {
            println!(
                "{:<20}{:<12}{:<24}{}",
                status.host, status.status, status.uptime, status.pid
            );
        }
    }
    Ok(())
}

fn generate_config(output: &Path, hostnames: Vec<String>) -> Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(output, hostnames).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  clusterhub --config {:?} hub", output);

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Hub port: {}", config.hub.port);
            println!("  Agent port: {}", config.hub.agent_port);
            println!("  Installation root: {:?}", config.hub.gphome);
            println!("  Agent hosts: {}", config.hub.hostnames.len());
            for (i, host) in config.hub.hostnames.iter().enumerate() {
                println!("    {}: {}", i + 1, host);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            Err(e.into())
        }
    }
}

fn show_version() {
    println!("clusterhub v{}", env!("CARGO_PKG_VERSION"));
    println!("Provision and extend multi-host segmented database clusters");
    println!();
    println!(
        "Built with Rust {}",
        option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown")
    );
    println!("Target: {}", std::env::consts::ARCH);
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if config.logging.format == "compact" {
        builder.compact().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized at level: {}", config.logging.level);
    Ok(())
}
