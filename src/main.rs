//! Telemetry node - main entry point
//!
//! Loads the device configuration, then samples sensors and reports to the
//! broker until SIGINT or SIGTERM.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use telemetry_node::config::DeviceConfig;
use telemetry_node::controller::Controller;
use telemetry_node::observability::init_default_logging;
use telemetry_node::sensors::SensorPoller;
use telemetry_node::shutdown::{self, ShutdownTrigger};
use telemetry_node::transport::MqttConnector;
use tokio::signal;
use tracing::{error, info};

/// Resilient MQTT telemetry node
#[derive(Parser)]
#[command(name = "telemetry-node")]
#[command(about = "Samples environmental sensors and reports them to an MQTT broker")]
#[command(version)]
struct Cli {
    /// Configuration file path (TOML, or JSON when it ends in .json)
    #[arg(short, long, value_name = "FILE", env = "TELEMETRY_NODE_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sampling loop
    Run,
    /// Validate configuration
    Config {
        /// Print the effective configuration (password omitted)
        #[arg(long)]
        show: bool,
    },
}

/// Searched in order when no `--config` is given
const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config.toml",
    "config.json",
    "/etc/telemetry-node/config.toml",
];

fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_default_logging(cli.verbose) {
        eprintln!("Logging already initialized: {e}");
    }

    info!("Starting telemetry node v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_node(config),
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: Option<&Path>,
) -> Result<DeviceConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(DeviceConfig::load_from_file(path)?);
    }

    let path = DEFAULT_CONFIG_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
        .ok_or("no configuration file found; pass -c/--config or create config.toml")?;

    info!("Loading configuration from: {}", path.display());
    Ok(DeviceConfig::load_from_file(&path)?)
}

/// Single-threaded runtime: the loop is cooperative, the only other task is the signal listener
fn run_node(config: DeviceConfig) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let (trigger, signal) = shutdown::channel();
        spawn_signal_listener(trigger)?;

        let poller = SensorPoller::from_config(&config);
        let mut controller = Controller::new(&config, MqttConnector::new(), poller, signal);

        info!(identity = %controller.identity(), "Node configured");
        controller.run().await?;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

fn spawn_signal_listener(trigger: ShutdownTrigger) -> std::io::Result<()> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        }
        trigger.trigger();
    });

    Ok(())
}

fn handle_config_command(
    config: &DeviceConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Effective configuration:");
        println!("{}", toml::to_string_pretty(config)?);
        if config.identity_is_ephemeral() {
            println!(
                "# client identity: random per start (set location or device_id for a stable id)"
            );
        } else {
            println!("# client identity: {}", config.identity());
        }
        println!("# check-in interval: {}s", config.check_in_interval().as_secs());
    }

    info!("Configuration validation complete");
    Ok(())
}
