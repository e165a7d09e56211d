//! CLI Entry Point for volt-daq
//!
//! Provides command-line access to a serial measurement instrument:
//! - Listing serial ports
//! - Printing the effective configuration
//! - Querying the attached device's identity
//! - Recording a session to CSV
//!
//! # Usage
//!
//! ```bash
//! volt-daq ports
//! volt-daq config
//! volt-daq identify --port /dev/ttyACM0
//! volt-daq record --port /dev/ttyACM0 --period 10ms --range Auto --duration 30s
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use humantime_serde::re::humantime;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use volt_daq::command::parse_period;
use volt_daq::config::AppConfig;
use volt_daq::export::{default_file_name, export_to_file};
use volt_daq::serial::{list_ports, SerialPortOpener};
use volt_daq::store::{EventStream, StoreEvent};
use volt_daq::{tracing_setup, ConnectionManager, Store};

#[derive(Parser)]
#[command(name = "volt-daq")]
#[command(about = "Serial measurement acquisition", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = volt_daq::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,

    /// Print the effective configuration (file + environment) as TOML
    Config,

    /// Ask the device for its identity
    Identify {
        /// Serial port (overrides config)
        #[arg(long)]
        port: Option<String>,

        /// Baud rate (overrides config)
        #[arg(long)]
        baud: Option<u32>,
    },

    /// Record a session and export it as CSV
    Record {
        /// Serial port (overrides config)
        #[arg(long)]
        port: Option<String>,

        /// Baud rate (overrides config)
        #[arg(long)]
        baud: Option<u32>,

        /// Sampling period label to configure (e.g. 10ms, 1s, Manual)
        #[arg(long)]
        period: Option<String>,

        /// Input range label sent with --period
        #[arg(long, default_value = "Auto")]
        range: String,

        /// Stop after this long (e.g. 30s, 5min); default runs until Ctrl-C
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,

        /// CSV output path (default: <export.output_dir>/session_<timestamp>.csv)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Print records as JSON lines instead of text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    config.validate()?;
    tracing_setup::init_from_config(&config)?;

    match cli.command {
        Commands::Ports => print_ports(),
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Identify { port, baud } => {
            apply_overrides(&mut config, port, baud);
            identify(&config).await
        }
        Commands::Record {
            port,
            baud,
            period,
            range,
            duration,
            output,
            json,
        } => {
            apply_overrides(&mut config, port, baud);
            let request = RecordRequest {
                period,
                range,
                duration,
                output,
                json,
            };
            record(&config, request).await
        }
    }
}

fn apply_overrides(config: &mut AppConfig, port: Option<String>, baud: Option<u32>) {
    if let Some(port) = port {
        config.serial.port = port;
    }
    if let Some(baud) = baud {
        config.serial.baud_rate = baud;
    }
}

fn print_ports() -> Result<()> {
    let ports = list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{:<24} {}", port.name, port.description);
    }
    Ok(())
}

fn manager_for(config: &AppConfig, store: Store) -> Result<ConnectionManager> {
    Ok(ConnectionManager::new(
        Arc::new(SerialPortOpener),
        config.acquisition_settings()?,
        store,
    ))
}

async fn identify(config: &AppConfig) -> Result<()> {
    let manager = manager_for(config, Store::new())?;
    manager.open(&config.connect_options()).await?;

    let result = manager.identify(config.serial.identify_timeout).await;
    manager.close().await;

    let device = result?;
    println!(
        "{} ({})",
        device.name,
        device.id.as_deref().unwrap_or("no id")
    );
    Ok(())
}

struct RecordRequest {
    period: Option<String>,
    range: String,
    duration: Option<Duration>,
    output: Option<PathBuf>,
    json: bool,
}

async fn record(config: &AppConfig, request: RecordRequest) -> Result<()> {
    let RecordRequest {
        period,
        range,
        duration,
        output,
        json,
    } = request;

    let store = Store::new();
    let manager = manager_for(config, store.clone())?;

    let mut options = config.connect_options();
    if let Some(period) = &period {
        options.sampling_mode = manager.codebook().sampling_mode(period)?;
        check_duration(duration, period)?;
    }

    manager.open(&options).await?;
    if let Some(period) = &period {
        if let Err(e) = manager.configure(period, &range).await {
            // A lost session is already torn down and keeps its error status
            if !e.is_session_fatal() {
                manager.close().await;
            }
            return Err(e.into());
        }
    }

    let _printer = store.subscribe(move |event| match event {
        StoreEvent::Latest(record) if json => match serde_json::to_string(record) {
            Ok(line) => println!("{line}"),
            Err(e) => eprintln!("Failed to encode record: {e}"),
        },
        StoreEvent::Latest(record) => println!("{record}"),
        StoreEvent::Notice(message) => eprintln!("{message}"),
        _ => {}
    });
    let mut events = store.watch();

    manager.start_acquisition().await?;
    println!("Recording from {} (Ctrl-C to stop)", options.serial.port);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sleep_or_forever(duration) => {}
        _ = until_disconnected(&mut events) => {}
    }

    manager.stop_acquisition().await;
    let mode = manager.sampling_mode().await;

    let path = output.unwrap_or_else(|| config.export.output_dir.join(default_file_name()));
    let written = store.with_history(|history| export_to_file(&path, history, mode))?;
    println!("Saved {} records to {}", store.history_len(), written.display());

    manager.close().await;
    Ok(())
}

/// Reject a recording too short to see a single periodic sample.
fn check_duration(duration: Option<Duration>, period: &str) -> Result<()> {
    if let (Some(duration), Some(interval)) = (duration, parse_period(period)) {
        if duration < interval {
            bail!(
                "--duration {} is shorter than the sampling period {period}",
                humantime::format_duration(duration)
            );
        }
    }
    Ok(())
}

async fn sleep_or_forever(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

async fn until_disconnected(events: &mut EventStream) {
    while let Some(event) = events.next().await {
        if let StoreEvent::Status(status) = event {
            if !status.connected {
                return;
            }
        }
    }
}
