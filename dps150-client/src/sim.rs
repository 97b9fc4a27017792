//! In-memory device simulator.
//!
//! Answers GETs and applies SETs using [`FIELD_TABLE`], over a
//! [`tokio::io::duplex`] pipe. Used by the test suites, the benches and the
//! CLI's `--simulate` mode.

use crate::transport::DeviceStream;
use dps150_protocol::{
    codes, AllData, Command, Decoder, DeviceField, DeviceState, FieldValue, Frame, OutputMode,
    ProtectionState, FIELD_TABLE,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const PIPE_CAPACITY: usize = 4096;

/// Simulated device state shared with the serving task.
struct Device {
    state: DeviceState,
    received: Vec<Frame>,
    muted: HashSet<u8>,
}

impl Device {
    /// Handles one host frame, returning encoded replies.
    fn handle(&mut self, frame: Frame) -> Vec<Vec<u8>> {
        self.received.push(frame.clone());

        let reply_type = match frame.command {
            Command::Get => Some(frame.type_code),
            Command::Set => {
                self.apply(frame.type_code, &frame.payload);
                Some(frame.type_code)
            }
            Command::Session | Command::SelectBaud => None,
        };

        reply_type
            .filter(|type_code| !self.muted.contains(type_code))
            .and_then(|type_code| {
                let payload = self.payload_for(type_code)?;
                Frame::response(type_code, payload).encode().ok()
            })
            .map(|encoded| vec![encoded.to_vec()])
            .unwrap_or_default()
    }

    fn apply(&mut self, type_code: u8, payload: &[u8]) {
        for spec in DeviceField::for_type_code(type_code) {
            let Some(slot) = spec.push else { continue };
            if let Some(value) = slot.encoding.decode(payload, slot.offset) {
                self.state.set(spec.field, value);
            }
        }

        if type_code == codes::OUTPUT_ENABLE {
            let enabled = self.state.bool(DeviceField::OutputEnabled).unwrap_or(false);
            let voltage = if enabled {
                self.state.f32(DeviceField::SetVoltage).unwrap_or(0.0)
            } else {
                0.0
            };
            self.state
                .set(DeviceField::OutputVoltage, FieldValue::Float(voltage));
        }
    }

    fn payload_for(&self, type_code: u8) -> Option<Vec<u8>> {
        if type_code == codes::ALL_DATA {
            return AllData::from_state(&self.state).map(|all| all.encode().to_vec());
        }

        let mut payload = Vec::new();
        for spec in DeviceField::for_type_code(type_code) {
            let slot = spec.push?;
            let bytes = slot.encoding.encode(self.state.get(spec.field)?)?;
            let end = slot.offset + bytes.len();
            if payload.len() < end {
                payload.resize(end, 0);
            }
            payload[slot.offset..end].copy_from_slice(&bytes);
        }
        (!payload.is_empty()).then_some(payload)
    }
}

/// A simulated power supply.
pub struct SimulatedDevice {
    device: Arc<Mutex<Device>>,
    pushes: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedDevice {
    /// A device with plausible default readings.
    pub fn new() -> Self {
        Self::with_state(default_state())
    }

    pub fn with_state(state: DeviceState) -> Self {
        Self {
            device: Arc::new(Mutex::new(Device {
                state,
                received: Vec::new(),
                muted: HashSet::new(),
            })),
            pushes: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Starts serving and returns the host side of the link.
    ///
    /// Must be called inside a tokio runtime. A previous link is dropped.
    pub fn stream(&self) -> DeviceStream {
        let (host, device_side) = tokio::io::duplex(PIPE_CAPACITY);
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(serve(self.device.clone(), device_side, rx));
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
        *self.pushes.lock() = Some(tx);

        DeviceStream::from(host)
    }

    /// Sends an unsolicited device frame.
    pub async fn push(&self, frame: Frame) {
        if let Ok(encoded) = frame.encode() {
            self.push_raw(&encoded).await;
        }
    }

    /// Sends raw bytes to the host.
    pub async fn push_raw(&self, bytes: &[u8]) {
        if let Some(tx) = self.pushes.lock().as_ref() {
            let _ = tx.send(bytes.to_vec());
        }
        tokio::task::yield_now().await;
    }

    /// Stops answering GETs for `type_code`.
    pub fn mute(&self, type_code: u8) {
        self.device.lock().muted.insert(type_code);
    }

    pub fn unmute(&self, type_code: u8) {
        self.device.lock().muted.remove(&type_code);
    }

    /// Frames received from the host, in order.
    pub fn received(&self) -> Vec<Frame> {
        self.device.lock().received.clone()
    }

    /// Current simulated state.
    pub fn state(&self) -> DeviceState {
        self.device.lock().state.clone()
    }

    /// Drops the link, as if the cable were pulled.
    pub fn hang_up(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        *self.pushes.lock() = None;
    }

    /// Waits until the host closes its side of the link.
    pub async fn wait_for_close(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

async fn serve(
    device: Arc<Mutex<Device>>,
    mut stream: DuplexStream,
    mut pushes: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let mut decoder = Decoder::host();
    let mut buf = [0u8; 256];

    loop {
        tokio::select! {
            result = stream.read(&mut buf) => {
                let n = match result {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                decoder.extend(&buf[..n]);
                for frame in decoder.decode_all() {
                    let replies = device.lock().handle(frame);
                    for reply in replies {
                        if stream.write_all(&reply).await.is_err() {
                            return;
                        }
                    }
                }
            }
            Some(bytes) = pushes.recv() => {
                if stream.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// A complete, idle device state.
pub fn default_state() -> DeviceState {
    use DeviceField as F;
    use FieldValue::{Bool, Byte, Float, Mode, Protection, Text};

    let mut state = DeviceState::new();
    let floats = [
        (F::InputVoltage, 20.0),
        (F::SetVoltage, 5.0),
        (F::SetCurrent, 1.0),
        (F::OutputVoltage, 0.0),
        (F::OutputCurrent, 0.0),
        (F::OutputPower, 0.0),
        (F::Temperature, 25.0),
        (F::OverVoltageProtection, 31.0),
        (F::OverCurrentProtection, 5.2),
        (F::OverPowerProtection, 155.0),
        (F::OverTemperatureProtection, 80.0),
        (F::LowVoltageProtection, 4.5),
        (F::OutputCapacity, 0.0),
        (F::OutputEnergy, 0.0),
        (F::UpperLimitVoltage, 30.0),
        (F::UpperLimitCurrent, 5.1),
    ];
    for (field, value) in floats {
        state.set(field, Float(value));
    }

    let presets = [(3.3, 0.5), (5.0, 1.0), (9.0, 1.0), (12.0, 2.0), (15.0, 2.0), (24.0, 3.0)];
    for (n, (voltage, current)) in (1..).zip(presets) {
        if let (Some(v), Some(c)) = (F::group_voltage(n), F::group_current(n)) {
            state.set(v, Float(voltage));
            state.set(c, Float(current));
        }
    }

    state.set(F::Brightness, Byte(10));
    state.set(F::Volume, Byte(5));
    state.set(F::MeteringClosed, Bool(true));
    state.set(F::OutputEnabled, Bool(false));
    state.set(F::ProtectionState, Protection(ProtectionState::None));
    state.set(F::Mode, Mode(OutputMode::ConstantVoltage));
    state.set(F::ModelName, Text("DPS-150".to_string()));
    state.set(F::HardwareVersion, Text("V1.0".to_string()));
    state.set(F::FirmwareVersion, Text("V1.1".to_string()));

    debug_assert_eq!(state.len(), FIELD_TABLE.len());
    state
}
