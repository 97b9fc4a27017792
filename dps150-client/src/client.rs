//! High-level client API.

use crate::connection::{Connection, ConnectionConfig, SessionState};
use crate::error::ClientError;
use crate::queue::{QueueCommand, QueueOutcome};
use crate::sink::UpdateSink;
use crate::transport::DeviceStream;
use dps150_protocol::{
    codes, AllData, DeviceField, DeviceState, FieldEncoding, Frame, GroupValue, Reading,
    StateUpdate,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Identification strings reported by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub model_name: String,
    pub hardware_version: String,
    pub firmware_version: String,
}

/// High-level client for one DPS-150.
pub struct Client {
    conn: Arc<Connection>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
        }
    }

    /// Opens the configured serial port and initializes the session.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await
    }

    /// Initializes a session over an already open transport.
    pub async fn connect_stream(&self, stream: DeviceStream) -> Result<(), ClientError> {
        self.conn.connect_stream(stream).await
    }

    /// Closes the session.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.conn.disconnect().await
    }

    pub fn state(&self) -> SessionState {
        self.conn.state()
    }

    /// Returns whether the session is streaming.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Returns the underlying session.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    /// Copy of the latest known device state.
    pub fn snapshot(&self) -> DeviceState {
        self.conn.snapshot()
    }

    /// Subscribes to state updates.
    pub fn subscribe(&self) -> broadcast::Receiver<StateUpdate> {
        self.conn.subscribe()
    }

    /// Registers a sink called for every state update.
    pub fn add_sink<S>(&self, sink: S)
    where
        S: UpdateSink + 'static,
    {
        self.conn.add_sink(sink)
    }

    // =========================================================================
    // Output and metering
    // =========================================================================

    /// Switches the output on.
    pub async fn enable(&self) -> Result<(), ClientError> {
        self.set_byte(codes::OUTPUT_ENABLE, 1).await
    }

    /// Switches the output off.
    pub async fn disable(&self) -> Result<(), ClientError> {
        self.set_byte(codes::OUTPUT_ENABLE, 0).await
    }

    pub async fn start_metering(&self) -> Result<(), ClientError> {
        self.set_byte(codes::METERING_ENABLE, 1).await
    }

    pub async fn stop_metering(&self) -> Result<(), ClientError> {
        self.set_byte(codes::METERING_ENABLE, 0).await
    }

    // =========================================================================
    // Setpoints
    // =========================================================================

    /// Writes a float value to `type_code`.
    ///
    /// Known type codes must carry a float; unknown codes are written as-is.
    pub async fn set_float(&self, type_code: u8, value: f32) -> Result<(), ClientError> {
        if !value.is_finite() {
            return Err(ClientError::InvalidArgument(format!(
                "value for type {} is not finite",
                type_code
            )));
        }
        check_encoding(type_code, |e| e == FieldEncoding::F32)?;
        self.conn.send(&Frame::set_f32(type_code, value)).await
    }

    /// Writes a single byte to `type_code`.
    pub async fn set_byte(&self, type_code: u8, value: u8) -> Result<(), ClientError> {
        check_encoding(type_code, |e| {
            !matches!(e, FieldEncoding::F32 | FieldEncoding::Text)
        })?;
        self.conn.send(&Frame::set_byte(type_code, value)).await
    }

    pub async fn set_voltage(&self, volts: f32) -> Result<(), ClientError> {
        self.set_float(codes::VOLTAGE_SET, volts).await
    }

    pub async fn set_current(&self, amps: f32) -> Result<(), ClientError> {
        self.set_float(codes::CURRENT_SET, amps).await
    }

    /// Stores a voltage/current preset in memory group 1-6.
    pub async fn set_group(&self, group: u8, volts: f32, amps: f32) -> Result<(), ClientError> {
        let (voltage_code, current_code) = codes::group_codes(group)?;
        self.set_float(voltage_code, volts).await?;
        self.set_float(current_code, amps).await
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Polls the full device state.
    pub async fn get_all(&self) -> Result<AllData, ClientError> {
        match self.conn.request(codes::ALL_DATA).await? {
            Reading::All(all) => Ok(*all),
            _ => Err(ClientError::UnexpectedResponse(codes::ALL_DATA)),
        }
    }

    /// Reads the preset of memory group 1-6 from a full-state poll.
    pub async fn get_group(&self, group: u8) -> Result<GroupValue, ClientError> {
        codes::group_codes(group)?;
        self.get_all()
            .await?
            .group(group)
            .ok_or(ClientError::UnexpectedResponse(codes::ALL_DATA))
    }

    /// Reads the first float carried by `type_code`.
    pub async fn get_float(&self, type_code: u8) -> Result<f32, ClientError> {
        let reading = self.conn.request(type_code).await?;
        reading
            .first()
            .and_then(|v| v.as_f32())
            .ok_or(ClientError::UnexpectedResponse(type_code))
    }

    /// Reads a text field such as the model name.
    pub async fn get_text(&self, type_code: u8) -> Result<String, ClientError> {
        let reading = self.conn.request(type_code).await?;
        reading
            .first()
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or(ClientError::UnexpectedResponse(type_code))
    }

    /// Identification strings, from the snapshot when already known.
    pub async fn device_info(&self) -> Result<DeviceInfo, ClientError> {
        Ok(DeviceInfo {
            model_name: self.text_field(DeviceField::ModelName).await?,
            hardware_version: self.text_field(DeviceField::HardwareVersion).await?,
            firmware_version: self.text_field(DeviceField::FirmwareVersion).await?,
        })
    }

    async fn text_field(&self, field: DeviceField) -> Result<String, ClientError> {
        if let Some(text) = self.conn.field(field).and_then(|v| v.as_str().map(str::to_string)) {
            return Ok(text);
        }
        let type_code = field
            .type_code()
            .ok_or_else(|| ClientError::InvalidArgument(format!("{} has no type code", field)))?;
        self.get_text(type_code).await
    }

    // =========================================================================
    // Command queues
    // =========================================================================

    /// Runs a command queue. `progress` receives the remaining count before
    /// each entry and 0 at the end.
    pub async fn execute<P>(
        &self,
        commands: &[QueueCommand],
        progress: P,
    ) -> Result<QueueOutcome, ClientError>
    where
        P: FnMut(usize) + Send,
    {
        self.conn.execute(commands, progress).await
    }

    /// Aborts the running command queue. Returns whether one was running.
    pub fn abort(&self) -> bool {
        self.conn.abort()
    }
}

/// Rejects writes whose payload shape does not match a known type code.
fn check_encoding<F>(type_code: u8, accepts: F) -> Result<(), ClientError>
where
    F: Fn(FieldEncoding) -> bool,
{
    let mismatch = DeviceField::for_type_code(type_code)
        .filter_map(|spec| spec.push_encoding())
        .any(|encoding| !accepts(encoding));
    if mismatch {
        return Err(ClientError::InvalidArgument(format!(
            "wrong value type for type {}",
            type_code
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedDevice;
    use crate::transport::SerialConfig;
    use dps150_protocol::{Command, FieldValue};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn config() -> ConnectionConfig {
        ConnectionConfig::new(SerialConfig::new("sim"))
            .with_request_timeout(Duration::from_millis(200))
            .with_settle_delay(Duration::from_millis(1))
    }

    async fn connected(device: &SimulatedDevice) -> Client {
        let client = Client::new(config());
        client.connect_stream(device.stream()).await.unwrap();
        client
    }

    fn sets(device: &SimulatedDevice) -> Vec<Frame> {
        device
            .received()
            .into_iter()
            .filter(|f| f.command == Command::Set)
            .collect()
    }

    #[tokio::test]
    async fn test_set_voltage_bytes() {
        let device = SimulatedDevice::new();
        let client = connected(&device).await;

        client.set_voltage(5.0).await.unwrap();
        let frame = sets(&device).pop().unwrap();
        assert_eq!(
            &frame.encode().unwrap()[..],
            &[0xF1, 0xB1, 0xC1, 0x04, 0x00, 0x00, 0xA0, 0x40, 0xA5]
        );
        assert_eq!(device.state().f32(DeviceField::SetVoltage), Some(5.0));
    }

    #[tokio::test]
    async fn test_enable_disable() {
        let device = SimulatedDevice::new();
        let client = connected(&device).await;

        client.set_voltage(12.0).await.unwrap();
        client.enable().await.unwrap();
        assert_eq!(device.state().bool(DeviceField::OutputEnabled), Some(true));
        assert_eq!(client.get_float(codes::OUTPUT_VOLTAGE_CURRENT_POWER).await.unwrap(), 12.0);

        client.disable().await.unwrap();
        assert_eq!(device.state().bool(DeviceField::OutputEnabled), Some(false));
    }

    #[tokio::test]
    async fn test_metering() {
        let device = SimulatedDevice::new();
        let client = connected(&device).await;

        client.start_metering().await.unwrap();
        assert_eq!(device.state().bool(DeviceField::MeteringClosed), Some(false));
        client.stop_metering().await.unwrap();
        assert_eq!(device.state().bool(DeviceField::MeteringClosed), Some(true));
    }

    #[tokio::test]
    async fn test_value_type_checks() {
        let device = SimulatedDevice::new();
        let client = connected(&device).await;

        assert!(matches!(
            client.set_float(codes::OUTPUT_ENABLE, 1.0).await,
            Err(ClientError::InvalidArgument(_))
        ));
        assert!(matches!(
            client.set_byte(codes::VOLTAGE_SET, 1).await,
            Err(ClientError::InvalidArgument(_))
        ));
        assert!(matches!(
            client.set_voltage(f32::NAN).await,
            Err(ClientError::InvalidArgument(_))
        ));
        client.set_byte(codes::BRIGHTNESS, 7).await.unwrap();
        assert_eq!(
            device.state().get(DeviceField::Brightness),
            Some(&FieldValue::Byte(7))
        );
    }

    #[tokio::test]
    async fn test_groups() {
        let device = SimulatedDevice::new();
        let client = connected(&device).await;

        let group = client.get_group(3).await.unwrap();
        assert_eq!(group.set_voltage, 9.0);
        assert_eq!(group.set_current, 1.0);

        client.set_group(3, 10.5, 0.75).await.unwrap();
        let group = client.get_group(3).await.unwrap();
        assert_eq!(group.set_voltage, 10.5);
        assert_eq!(group.set_current, 0.75);

        assert!(matches!(
            client.get_group(7).await,
            Err(ClientError::Protocol(_))
        ));
        assert!(matches!(
            client.set_group(0, 1.0, 1.0).await,
            Err(ClientError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_get_all_and_info() {
        let device = SimulatedDevice::new();
        let client = connected(&device).await;

        let all = client.get_all().await.unwrap();
        assert_eq!(all.input_voltage, 20.0);
        assert_eq!(all.upper_limit_current, 5.1);

        let info = client.device_info().await.unwrap();
        assert_eq!(info.model_name, "DPS-150");
        assert_eq!(info.firmware_version, "V1.1");
        assert_eq!(client.get_text(codes::HARDWARE_VERSION).await.unwrap(), "V1.0");
    }

    #[tokio::test]
    async fn test_get_all_timeout() {
        let device = SimulatedDevice::new();
        let client = connected(&device).await;
        device.mute(codes::ALL_DATA);

        assert!(matches!(client.get_all().await, Err(ClientError::Timeout)));
        device.unmute(codes::ALL_DATA);
        assert!(client.get_all().await.is_ok());
    }

    #[tokio::test]
    async fn test_execute_runs_in_order() {
        let device = SimulatedDevice::new();
        let client = connected(&device).await;
        let before = sets(&device).len();

        let commands = crate::queue::parse_script("V 3.3\nI 0.2\nON\nSLEEP 5\nOFF\n").unwrap();
        let progress = Arc::new(Mutex::new(Vec::new()));
        let captured = progress.clone();
        let outcome = client
            .execute(&commands, move |n| captured.lock().push(n))
            .await
            .unwrap();

        assert_eq!(outcome.executed, 5);
        assert_eq!(outcome.failed, 0);
        assert!(!outcome.aborted);
        assert_eq!(*progress.lock(), vec![5, 4, 3, 2, 1, 0]);

        let written: Vec<u8> = sets(&device)[before..].iter().map(|f| f.type_code).collect();
        assert_eq!(
            written,
            vec![
                codes::VOLTAGE_SET,
                codes::CURRENT_SET,
                codes::OUTPUT_ENABLE,
                codes::OUTPUT_ENABLE
            ]
        );
        assert_eq!(device.state().bool(DeviceField::OutputEnabled), Some(false));
    }

    #[tokio::test]
    async fn test_abort_disables_output() {
        let device = SimulatedDevice::new();
        let client = Arc::new(connected(&device).await);

        let commands = crate::queue::parse_script("ON\nSLEEP 10000\nV 30\n").unwrap();
        let runner = {
            let client = client.clone();
            tokio::spawn(async move { client.execute(&commands, |_| {}).await })
        };

        while device.state().bool(DeviceField::OutputEnabled) != Some(true) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(matches!(
            client.execute(&[], |_| {}).await,
            Err(ClientError::QueueBusy)
        ));
        assert!(client.abort());

        let outcome = runner.await.unwrap().unwrap();
        assert!(outcome.aborted);
        assert_eq!(outcome.executed, 1);
        assert_eq!(device.state().bool(DeviceField::OutputEnabled), Some(false));
        assert_eq!(device.state().f32(DeviceField::SetVoltage), Some(5.0));
    }

    #[tokio::test]
    async fn test_abort_during_last_entry_disables_output() {
        let device = SimulatedDevice::new();
        let client = Client::new(config().with_settle_delay(Duration::from_millis(300)));
        client.connect_stream(device.stream()).await.unwrap();
        let client = Arc::new(client);

        let runner = {
            let client = client.clone();
            tokio::spawn(async move { client.execute(&[QueueCommand::OutputOn], |_| {}).await })
        };
        // the device has the frame; the run is inside its settle delay
        while device.state().bool(DeviceField::OutputEnabled) != Some(true) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(client.abort());

        let outcome = runner.await.unwrap().unwrap();
        assert!(outcome.aborted);
        assert_eq!(outcome.executed, 1);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while device.state().bool(DeviceField::OutputEnabled) != Some(false) {
            assert!(tokio::time::Instant::now() < deadline, "output left on");
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn test_disconnect_aborts_queue() {
        let device = SimulatedDevice::new();
        let client = Arc::new(connected(&device).await);

        let commands = crate::queue::parse_script("ON\nSLEEP 10000\n").unwrap();
        let runner = {
            let client = client.clone();
            tokio::spawn(async move { client.execute(&commands, |_| {}).await })
        };
        while device.state().bool(DeviceField::OutputEnabled) != Some(true) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        client.disconnect().await.unwrap();
        let outcome = runner.await.unwrap().unwrap();
        assert!(outcome.aborted);
        assert_eq!(client.state(), SessionState::Disconnected);

        device.wait_for_close().await;
        assert_eq!(device.state().bool(DeviceField::OutputEnabled), Some(false));
    }

    #[tokio::test]
    async fn test_queue_continues_after_failure() {
        let device = SimulatedDevice::new();
        let client = connected(&device).await;

        let commands = vec![
            QueueCommand::SetVoltage(f32::INFINITY),
            QueueCommand::SetCurrent(0.3),
        ];
        let outcome = client.execute(&commands, |_| {}).await.unwrap();
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.executed, 1);
        assert!(!outcome.aborted);
        assert_eq!(device.state().f32(DeviceField::SetCurrent), Some(0.3));
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let client = Client::new(config());
        assert!(matches!(client.enable().await, Err(ClientError::NotConnected)));
        assert!(matches!(client.get_all().await, Err(ClientError::NotConnected)));
        assert!(matches!(
            client.execute(&[QueueCommand::OutputOn], |_| {}).await,
            Err(ClientError::NotConnected)
        ));
        assert!(!client.abort());
    }
}
