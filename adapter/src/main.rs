//! # Print Host Adapter Runtime
//!
//! The executable wires the adapter core to a real printer: it opens the
//! configured serial port, starts the supervisor and runs until a
//! termination signal arrives, then tears everything down in order.
//!
//! ## Collaborators
//!
//! The HTTP surface, the cloud client and the file-based print sources
//! are separate services; this binary provides them the core over its
//! library interface and ships with inert placeholders so the adapter is
//! usable against a bare printer.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::runtime::Runtime;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use printhost_adapter::commands::{FilePrinter, LocalStorage, Telemetry};
use printhost_adapter::config::Settings;
use printhost_adapter::supervisor::{Collaborators, Supervisor};
use printhost_adapter::ADAPTER_VERSION;

// Command-Line Interface Definition

/// Print host adapter - serial G-code printer bridge
#[derive(Parser, Debug)]
#[command(name = "printhost-adapter")]
#[command(version = ADAPTER_VERSION)]
#[command(about = "Host-side adapter between a serial G-code printer and orchestration")]
struct Cli {
    /// Adapter configuration file
    #[arg(short, long, value_name = "FILE", default_value = "/etc/printhost/adapter.toml")]
    config: PathBuf,

    /// Serial port override
    #[arg(long, value_name = "DEVICE")]
    port: Option<String>,

    /// Baud rate override
    #[arg(long)]
    baud: Option<u32>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Base directory for local G-code files
    #[arg(long, default_value = "/var/printhost/gcodes")]
    gcode_dir: PathBuf,
}

// Placeholder Collaborators

/// Local print source stub; the real file printer is its own service.
struct UnavailableFilePrinter;

#[async_trait::async_trait]
impl FilePrinter for UnavailableFilePrinter {
    fn is_printing(&self) -> bool {
        false
    }
    fn gcode_number(&self) -> Option<u64> {
        None
    }
    async fn start(&self, _os_path: &std::path::Path) -> Result<()> {
        anyhow::bail!("no file printer service is attached")
    }
    async fn pause(&self) {}
    async fn stop(&self) {}
}

/// Maps virtual storage paths straight under a base directory.
struct DirectoryStorage {
    base: PathBuf,
}

impl LocalStorage for DirectoryStorage {
    fn os_path(&self, virtual_path: &str) -> Option<PathBuf> {
        let relative = virtual_path.trim_start_matches('/');
        let candidate = self.base.join(relative);
        candidate.exists().then_some(candidate)
    }
}

/// Telemetry placeholder until the observers populate real values.
struct NoTelemetry;

impl Telemetry for NoTelemetry {
    fn nozzle_temperature(&self) -> Option<f64> {
        None
    }
}

// Initialization Sequence

/// Initializes the logging system.
fn init_logging(log_level: &str, log_file: Option<PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_new(log_level).context("Invalid log level")?;
    let subscriber = tracing_subscriber::registry().with(filter);

    if let Some(file_path) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)
            .context("Failed to open log file")?;
        let file_layer = fmt::layer().with_writer(Arc::new(file)).with_ansi(false);
        subscriber.with(file_layer).init();
    } else {
        let stdout_layer = fmt::layer().with_writer(std::io::stdout);
        subscriber.with(stdout_layer).init();
    }
    Ok(())
}

fn create_runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("printhost-adapter")
        .build()
        .context("Failed to build async runtime")
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = if cli.config.exists() {
        info!("loading configuration from {}", cli.config.display());
        Settings::from_file(&cli.config).context("Failed to load adapter configuration")?
    } else {
        warn!(
            "configuration file {} not found, using defaults",
            cli.config.display()
        );
        Settings::default()
    };

    if let Some(port) = &cli.port {
        settings.serial.port = port.clone();
    }
    if let Some(baud) = cli.baud {
        settings.serial.baud = baud;
    }
    settings
        .validate()
        .context("Adapter configuration validation failed")?;
    Ok(settings)
}

// Main Execution Flow

async fn run_adapter(cli: Cli) -> Result<()> {
    let settings = load_settings(&cli)?;
    info!(
        port = settings.serial.port,
        baud = settings.serial.baud,
        "connecting to the printer"
    );

    let supervisor = Supervisor::connect(&settings).await?;
    let _context = supervisor.command_context(Collaborators {
        file_printer: Arc::new(UnavailableFilePrinter),
        storage: Arc::new(DirectoryStorage {
            base: cli.gcode_dir.clone(),
        }),
        telemetry: Arc::new(NoTelemetry),
    });

    wait_for_termination().await;
    supervisor.shutdown().await;
    Ok(())
}

/// Blocks until SIGTERM or SIGINT.
async fn wait_for_termination() {
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            error!(%err, "failed to install the SIGTERM handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!("received SIGTERM");
        }
        result = signal::ctrl_c() => {
            if let Err(err) = result {
                error!(%err, "failed to wait for SIGINT");
            } else {
                info!("received SIGINT");
            }
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_logging(&cli.log_level, cli.log_file.clone()) {
        eprintln!("Failed to initialize logging: {err}");
        return ExitCode::FAILURE;
    }

    info!("print host adapter v{ADAPTER_VERSION}");

    let runtime = match create_runtime() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "failed to create the async runtime");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async {
        match run_adapter(cli).await {
            Ok(()) => {
                info!("adapter shutdown complete");
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!(?err, "adapter error");
                ExitCode::FAILURE
            }
        }
    })
}
