//! Command queues: ordered, abortable sequences of setpoint changes.
//!
//! Text form, one command per line:
//!
//! ```text
//! # ramp to 5 V with a 0.5 A limit
//! V 5.0
//! I 0.5
//! ON
//! SLEEP 250
//! OFF
//! ```

use crate::connection::Connection;
use crate::error::ClientError;
use dps150_protocol::{codes, Frame};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// One queue entry.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueCommand {
    SetVoltage(f32),
    SetCurrent(f32),
    OutputOn,
    OutputOff,
    Sleep(Duration),
}

impl QueueCommand {
    /// Frame written for this command, `None` for sleeps.
    pub fn to_frame(&self) -> Result<Option<Frame>, ClientError> {
        let frame = match self {
            QueueCommand::SetVoltage(v) => Frame::set_f32(codes::VOLTAGE_SET, check_setpoint(*v)?),
            QueueCommand::SetCurrent(i) => Frame::set_f32(codes::CURRENT_SET, check_setpoint(*i)?),
            QueueCommand::OutputOn => Frame::set_byte(codes::OUTPUT_ENABLE, 1),
            QueueCommand::OutputOff => Frame::set_byte(codes::OUTPUT_ENABLE, 0),
            QueueCommand::Sleep(_) => return Ok(None),
        };
        Ok(Some(frame))
    }
}

impl fmt::Display for QueueCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueCommand::SetVoltage(v) => write!(f, "V {}", v),
            QueueCommand::SetCurrent(i) => write!(f, "I {}", i),
            QueueCommand::OutputOn => f.write_str("ON"),
            QueueCommand::OutputOff => f.write_str("OFF"),
            QueueCommand::Sleep(d) => write!(f, "SLEEP {}", d.as_millis()),
        }
    }
}

impl FromStr for QueueCommand {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let keyword = parts
            .next()
            .ok_or_else(|| ClientError::InvalidArgument("empty command".to_string()))?
            .to_ascii_uppercase();
        let arg = parts.next();
        if parts.next().is_some() {
            return Err(ClientError::InvalidArgument(format!(
                "too many arguments: {}",
                s.trim()
            )));
        }

        let command = match (keyword.as_str(), arg) {
            ("V", Some(v)) => QueueCommand::SetVoltage(parse_setpoint(v)?),
            ("I", Some(i)) => QueueCommand::SetCurrent(parse_setpoint(i)?),
            ("ON", None) => QueueCommand::OutputOn,
            ("OFF", None) => QueueCommand::OutputOff,
            ("SLEEP", Some(ms)) => {
                let ms: u64 = ms
                    .parse()
                    .map_err(|_| ClientError::InvalidArgument(format!("invalid sleep: {}", ms)))?;
                QueueCommand::Sleep(Duration::from_millis(ms))
            }
            _ => {
                return Err(ClientError::InvalidArgument(format!(
                    "unknown command: {}",
                    s.trim()
                )))
            }
        };
        Ok(command)
    }
}

fn parse_setpoint(s: &str) -> Result<f32, ClientError> {
    s.parse::<f32>()
        .map_err(|_| ClientError::InvalidArgument(format!("invalid setpoint: {}", s)))
        .and_then(check_setpoint)
}

fn check_setpoint(value: f32) -> Result<f32, ClientError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(ClientError::InvalidArgument(format!(
            "invalid setpoint: {}",
            value
        )))
    }
}

/// Parses a script, skipping blank lines and `#` comments.
///
/// Errors name the offending line (1-based).
pub fn parse_script(script: &str) -> Result<Vec<QueueCommand>, ClientError> {
    let mut commands = Vec::new();
    for (n, line) in script.lines().enumerate() {
        let line = match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        };
        if line.trim().is_empty() {
            continue;
        }
        let command = line.parse().map_err(|e| match e {
            ClientError::InvalidArgument(msg) => {
                ClientError::InvalidArgument(format!("line {}: {}", n + 1, msg))
            }
            other => other,
        })?;
        commands.push(command);
    }
    Ok(commands)
}

/// Summary of one queue run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOutcome {
    /// Entries that completed successfully.
    pub executed: usize,
    /// Entries whose write failed.
    pub failed: usize,
    pub aborted: bool,
}

/// Busy flag and abort signal shared by a session's queue runs.
pub(crate) struct QueueControl {
    running: AtomicBool,
    abort: watch::Sender<bool>,
}

impl QueueControl {
    pub(crate) fn new() -> Self {
        let (abort, _) = watch::channel(false);
        Self {
            running: AtomicBool::new(false),
            abort,
        }
    }

    fn start(&self) -> Result<RunGuard<'_>, ClientError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ClientError::QueueBusy);
        }
        self.abort.send_replace(false);
        Ok(RunGuard { control: self })
    }

    /// Signals the running queue, if any, to stop. Returns whether one was
    /// running.
    pub(crate) fn abort(&self) -> bool {
        self.abort.send_replace(true);
        self.running.load(Ordering::SeqCst)
    }
}

struct RunGuard<'a> {
    control: &'a QueueControl,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.control.running.store(false, Ordering::SeqCst);
    }
}

/// Runs `commands` in order on `conn`.
///
/// `progress` receives the number of entries remaining before each entry
/// (N down to 1) and 0 when the run ends. Failed entries are logged and
/// skipped. On abort the output is switched off before returning.
pub(crate) async fn run<P>(
    conn: &Connection,
    control: &QueueControl,
    commands: &[QueueCommand],
    mut progress: P,
) -> Result<QueueOutcome, ClientError>
where
    P: FnMut(usize) + Send,
{
    let _guard = control.start()?;
    let mut abort = control.abort.subscribe();
    let mut outcome = QueueOutcome::default();

    tracing::debug!("running command queue ({} entries)", commands.len());

    for (i, command) in commands.iter().enumerate() {
        let aborted = *abort.borrow();
        if aborted {
            outcome.aborted = true;
            break;
        }
        progress(commands.len() - i);

        let result = match command {
            QueueCommand::Sleep(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(*duration) => Ok(()),
                    _ = abort.wait_for(|aborted| *aborted) => {
                        outcome.aborted = true;
                        break;
                    }
                }
            }
            other => match other.to_frame() {
                Ok(Some(frame)) => conn.send(&frame).await,
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            },
        };

        match result {
            Ok(()) => outcome.executed += 1,
            Err(e) => {
                tracing::warn!("queue entry '{}' failed: {}", command, e);
                outcome.failed += 1;
            }
        }
    }

    // an abort may land while the last entry is still in flight
    let aborted = *abort.borrow();
    if aborted {
        outcome.aborted = true;
    }

    if outcome.aborted {
        tracing::info!("command queue aborted, disabling output");
        if let Err(e) = conn.send(&Frame::set_byte(codes::OUTPUT_ENABLE, 0)).await {
            tracing::debug!("could not disable output after abort: {}", e);
        }
    }

    progress(0);
    Ok(outcome)
}
