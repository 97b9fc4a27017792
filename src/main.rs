//! dps150 - Command-line control for the DPS-150 bench power supply
//!
//! Connects over the USB serial link, runs one command and disconnects.

mod commands;
mod config;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use config::Config;
use dps150_client::{Client, SimulatedDevice};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dps150")]
#[command(about = "Command-line control for the DPS-150 bench power supply")]
#[command(version)]
struct Cli {
    /// YAML config file (defaults to $DPS150_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port (overrides config and DPS150_PORT)
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate (overrides config and DPS150_BAUD)
    #[arg(short, long)]
    baud: Option<u32>,

    /// Request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Talk to a simulated device instead of a serial port
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the full device state
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show model name and versions
    Info,

    /// Show a memory-group preset
    Group {
        /// Group number (1-6)
        n: u8,
    },

    /// Set the output voltage
    SetVoltage {
        /// Volts
        volts: f32,
    },

    /// Set the current limit
    SetCurrent {
        /// Amps
        amps: f32,
    },

    /// Store a memory-group preset
    SetGroup {
        /// Group number (1-6)
        n: u8,
        /// Volts
        volts: f32,
        /// Amps
        amps: f32,
    },

    /// Write a raw value to a type code
    Set {
        /// Type code (e.g. 193 for the voltage setpoint)
        type_code: u8,
        /// Value to write
        value: String,
        /// Write a single byte instead of a float
        #[arg(long)]
        byte: bool,
    },

    /// Switch the output on
    On,

    /// Switch the output off
    Off,

    /// Start or stop capacity/energy metering
    Metering {
        #[arg(value_enum)]
        action: MeteringAction,
    },

    /// Stream state updates as JSON lines until Ctrl+C
    Watch {
        /// Also poll the full state every N milliseconds
        #[arg(long)]
        poll_ms: Option<u64>,
    },

    /// Run a command script (V <volts>, I <amps>, ON, OFF, SLEEP <ms>)
    Run {
        /// Script file
        script: PathBuf,

        /// Parse and print the script without connecting
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum MeteringAction {
    Start,
    Stop,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Dry runs need no device
    if let Commands::Run {
        script,
        dry_run: true,
    } = &cli.command
    {
        match commands::dry_run(script) {
            Ok(output) => println!("{}", output),
            Err(e) => {
                eprintln!("{}: {}", "Error".red(), e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.serial.port = port;
    }
    if let Some(baud) = cli.baud {
        config.serial.baud_rate = baud;
    }
    if let Some(ms) = cli.timeout_ms {
        config.session.request_timeout_ms = ms;
    }
    config.validate()?;
    tracing::debug!("Using {} at {} baud", config.serial.port, config.serial.baud_rate);

    let client = Client::new(config.connection_config());

    // Kept alive for the whole session
    let simulated = cli.simulate.then(SimulatedDevice::new);
    let connected = match &simulated {
        Some(device) => client.connect_stream(device.stream()).await,
        None => client.connect().await,
    };
    if let Err(e) = connected {
        eprintln!("{}: {}", "Connection failed".red(), e);
        std::process::exit(1);
    }

    let result = match cli.command {
        Commands::Watch { poll_ms } => commands::watch(&client, poll_ms).await,
        Commands::Run { script, .. } => commands::run_script(&client, &script).await,
        cmd => commands::execute(&client, cmd).await,
    };

    let failed = match result {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
            false
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            true
        }
    };

    client.disconnect().await?;
    if failed {
        std::process::exit(1);
    }
    Ok(())
}
