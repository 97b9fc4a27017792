//! # dps150-client
//!
//! Async client library for the DPS-150 bench power supply.
//!
//! This crate provides:
//! - Serial and in-memory transports
//! - A session controller with a single read loop and serialized writes
//! - Request/response correlation by type code
//! - Update sinks and a broadcast channel for streamed device state
//! - Abortable command queues
//! - A simulated device for tests and demos

pub mod client;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod queue;
pub mod sim;
pub mod sink;
pub mod transport;

pub use client::{Client, DeviceInfo};
pub use connection::{Connection, ConnectionConfig, SessionState};
pub use error::ClientError;
pub use queue::{parse_script, QueueCommand, QueueOutcome};
pub use sim::SimulatedDevice;
pub use sink::UpdateSink;
pub use transport::{open_serial, DeviceStream, SerialConfig};
