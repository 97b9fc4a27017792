//! Command execution.

use crate::{Commands, MeteringAction};
use colored::Colorize;
use dps150_client::{parse_script, Client, ClientError, QueueCommand};
use dps150_protocol::{DeviceState, FieldValue, FIELD_TABLE};
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Interval;

type CommandResult = Result<String, Box<dyn std::error::Error>>;

/// How often `watch` checks that the session is still up.
const LIVENESS_INTERVAL: Duration = Duration::from_millis(500);

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> CommandResult {
    match cmd {
        Commands::Status { json } => {
            client.get_all().await?;
            let state = client.snapshot();
            if json {
                Ok(serde_json::to_string_pretty(&state)?)
            } else {
                Ok(format_state(&state))
            }
        }

        Commands::Info => {
            let info = client.device_info().await?;
            Ok(format!(
                "{}\n  Hardware: {}\n  Firmware: {}",
                info.model_name.bold(),
                info.hardware_version,
                info.firmware_version
            ))
        }

        Commands::Group { n } => {
            let group = client.get_group(n).await?;
            Ok(format!(
                "{} {}: {:.3} V / {:.3} A",
                "Group".bold(),
                n,
                group.set_voltage,
                group.set_current
            ))
        }

        Commands::SetVoltage { volts } => {
            client.set_voltage(volts).await?;
            Ok(format!("{} voltage to {:.3} V", "Set".green(), volts))
        }

        Commands::SetCurrent { amps } => {
            client.set_current(amps).await?;
            Ok(format!("{} current to {:.3} A", "Set".green(), amps))
        }

        Commands::SetGroup { n, volts, amps } => {
            client.set_group(n, volts, amps).await?;
            Ok(format!(
                "{} group {} to {:.3} V / {:.3} A",
                "Stored".green(),
                n,
                volts,
                amps
            ))
        }

        Commands::Set {
            type_code,
            value,
            byte,
        } => {
            let invalid = || ClientError::InvalidArgument(format!("invalid value: {}", value));
            if byte {
                let v: u8 = value.parse().map_err(|_| invalid())?;
                client.set_byte(type_code, v).await?;
            } else {
                let v: f32 = value.parse().map_err(|_| invalid())?;
                client.set_float(type_code, v).await?;
            }
            Ok(format!(
                "{} type {} to {}",
                "Wrote".green(),
                type_code.to_string().cyan(),
                value
            ))
        }

        Commands::On => {
            client.enable().await?;
            Ok(format!("Output {}", "ON".green().bold()))
        }

        Commands::Off => {
            client.disable().await?;
            Ok(format!("Output {}", "OFF".yellow().bold()))
        }

        Commands::Metering { action } => match action {
            MeteringAction::Start => {
                client.start_metering().await?;
                Ok(format!("Metering {}", "started".green()))
            }
            MeteringAction::Stop => {
                client.stop_metering().await?;
                Ok(format!("Metering {}", "stopped".yellow()))
            }
        },

        // Streaming commands are handled by their own functions
        Commands::Watch { .. } | Commands::Run { .. } => unreachable!(),
    }
}

/// Streams state updates as JSON lines until Ctrl+C or link loss.
pub async fn watch(client: &Client, poll_ms: Option<u64>) -> CommandResult {
    let mut updates = client.subscribe();
    let mut poll = poll_ms.map(|ms| tokio::time::interval(Duration::from_millis(ms.max(1))));
    let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);

    eprintln!("{} device updates", "Watching".green());
    eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

    loop {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Ok(update) => println!("{}", serde_json::to_string(&update)?),
                    Err(RecvError::Lagged(n)) => {
                        eprintln!("{}: lagged {} updates", "Warning".yellow(), n);
                    }
                    Err(RecvError::Closed) => {
                        eprintln!("{}", "Connection closed".red());
                        break;
                    }
                }
            }
            _ = tick(&mut poll) => {
                match client.get_all().await {
                    Ok(_) => {}
                    Err(e) if e.is_retryable() => {
                        tracing::warn!("Full-state poll failed: {}", e);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            _ = liveness.tick() => {
                if !client.is_connected() {
                    eprintln!("{}", "Connection closed".red());
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n{}", "Stopping watch...".dimmed());
                break;
            }
        }
    }

    Ok(String::new())
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Runs a script file as a command queue. Ctrl+C aborts it.
pub async fn run_script(client: &Client, path: &Path) -> CommandResult {
    let commands = load_script(path)?;
    eprintln!(
        "{} {} commands from {}",
        "Running".green(),
        commands.len(),
        path.display()
    );

    let run = client.execute(&commands, |remaining| {
        if remaining > 0 {
            eprintln!("  {} remaining", remaining.to_string().cyan());
        }
    });
    tokio::pin!(run);

    let outcome = tokio::select! {
        outcome = &mut run => outcome?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\n{}", "Aborting, output will be switched off...".yellow());
            client.abort();
            run.await?
        }
    };

    let status = if outcome.aborted {
        "Aborted".yellow()
    } else if outcome.failed > 0 {
        "Finished with errors".red()
    } else {
        "Finished".green()
    };
    Ok(format!(
        "{}: {} executed, {} failed",
        status, outcome.executed, outcome.failed
    ))
}

/// Parses a script and lists its commands.
pub fn dry_run(path: &Path) -> CommandResult {
    let commands = load_script(path)?;
    if commands.is_empty() {
        return Ok("Script is empty".yellow().to_string());
    }

    let mut output = String::new();
    for (i, command) in commands.iter().enumerate() {
        output.push_str(&format!("[{:>3}] {}\n", (i + 1).to_string().cyan(), command));
    }
    Ok(output.trim_end().to_string())
}

fn load_script(path: &Path) -> Result<Vec<QueueCommand>, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read script '{}': {}", path.display(), e))?;
    Ok(parse_script(&content)?)
}

/// Formats the device state as an aligned table, in table order.
fn format_state(state: &DeviceState) -> String {
    let mut output = String::new();
    for spec in FIELD_TABLE.iter() {
        let Some(value) = state.get(spec.field) else {
            continue;
        };
        output.push_str(&format!(
            "  {:<28} {}\n",
            spec.name,
            format_value(spec.name, value)
        ));
    }
    output.trim_end().to_string()
}

fn format_value(name: &str, value: &FieldValue) -> String {
    match value {
        FieldValue::Float(v) => format!("{:.3} {}", v, unit(name)).trim_end().to_string(),
        FieldValue::Bool(true) if name == "output_enabled" => "ON".green().to_string(),
        FieldValue::Bool(false) if name == "output_enabled" => "OFF".yellow().to_string(),
        FieldValue::Protection(p) if p.is_tripped() => p.to_string().red().bold().to_string(),
        FieldValue::Protection(_) => "-".dimmed().to_string(),
        other => other.to_string(),
    }
}

/// Unit suffix derived from the field name.
fn unit(name: &str) -> &'static str {
    if name.contains("voltage") {
        "V"
    } else if name.contains("current") {
        "A"
    } else if name.contains("power") {
        "W"
    } else if name.contains("temperature") {
        "°C"
    } else if name.contains("capacity") {
        "Ah"
    } else if name.contains("energy") {
        "Wh"
    } else {
        ""
    }
}
