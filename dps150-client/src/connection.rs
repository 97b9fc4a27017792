//! Session management.

use crate::correlator::{Correlator, Reply};
use crate::error::ClientError;
use crate::queue::{self, QueueCommand, QueueControl, QueueOutcome};
use crate::sink::UpdateSink;
use crate::transport::{open_serial, DeviceStream, SerialConfig};
use dps150_protocol::{
    codes, project, Command, Decoder, DeviceField, DeviceState, Direction, FieldValue, Frame,
    StateUpdate,
};
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Default read buffer size (1 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Minimum read buffer size (64 bytes).
pub const MIN_READ_BUFFER_SIZE: usize = 64;

/// Maximum read buffer size (64 KiB).
pub const MAX_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Capacity of the state-update broadcast channel.
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Serial port settings.
    pub serial: SerialConfig,
    /// Deadline for correlated requests.
    pub request_timeout: Duration,
    /// Pause after every write before the next one may start.
    pub settle_delay: Duration,
    /// Read buffer size for transport reads.
    pub read_buffer_size: usize,
    /// How long disconnect waits for the read loop to stop.
    pub teardown_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(serial: SerialConfig) -> Self {
        Self {
            serial,
            request_timeout: Duration::from_millis(1000),
            settle_delay: Duration::from_millis(50),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            teardown_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.serial.baud_rate = baud_rate;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }
}

/// Session lifecycle.
///
/// `Disconnected -> Opening -> Initializing -> Streaming -> Closing -> Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Opening,
    Initializing,
    Streaming,
    Closing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Opening => "opening",
            SessionState::Initializing => "initializing",
            SessionState::Streaming => "streaming",
            SessionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Whether a write belongs to a streaming session or to session setup and
/// teardown. Session writes re-check the state once the writer is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Session,
    Control,
}

struct ReaderTask {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// A session with one device.
pub struct Connection {
    config: ConnectionConfig,
    state: RwLock<SessionState>,
    /// Write half of the transport. Held across write + settle delay.
    writer: Mutex<Option<WriteHalf<DeviceStream>>>,
    /// Accumulation buffer, fed only by the read loop.
    decoder: SyncMutex<Decoder>,
    correlator: Correlator,
    snapshot: RwLock<DeviceState>,
    updates: broadcast::Sender<StateUpdate>,
    sinks: RwLock<Vec<Arc<dyn UpdateSink>>>,
    reader: SyncMutex<Option<ReaderTask>>,
    queue: QueueControl,
}

impl Connection {
    /// Creates a new session (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            config,
            state: RwLock::new(SessionState::Disconnected),
            writer: Mutex::new(None),
            decoder: SyncMutex::new(Decoder::device()),
            correlator: Correlator::new(),
            snapshot: RwLock::new(DeviceState::new()),
            updates,
            sinks: RwLock::new(Vec::new()),
            reader: SyncMutex::new(None),
            queue: QueueControl::new(),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Returns whether the session is streaming.
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Streaming
    }

    /// Copy of the current device state.
    pub fn snapshot(&self) -> DeviceState {
        self.snapshot.read().clone()
    }

    /// Current value of one field.
    pub fn field(&self, field: DeviceField) -> Option<FieldValue> {
        self.snapshot.read().get(field).cloned()
    }

    /// Subscribes to state updates.
    pub fn subscribe(&self) -> broadcast::Receiver<StateUpdate> {
        self.updates.subscribe()
    }

    /// Registers a sink called for every state update.
    pub fn add_sink<S>(&self, sink: S)
    where
        S: UpdateSink + 'static,
    {
        self.sinks.write().push(Arc::new(sink));
    }

    /// Opens the configured serial port and initializes the session.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        codes::baud_rate_index(self.config.serial.baud_rate)?;
        self.transition(SessionState::Disconnected, SessionState::Opening)?;

        tracing::debug!(
            "Opening {} at {} baud",
            self.config.serial.path,
            self.config.serial.baud_rate
        );
        let port = match open_serial(&self.config.serial) {
            Ok(port) => port,
            Err(e) => {
                tracing::debug!("Open failed: {}", e);
                self.set_state(SessionState::Disconnected);
                return Err(e.into());
            }
        };

        self.start(DeviceStream::from(port)).await
    }

    /// Initializes a session over an already open transport.
    pub async fn connect_stream(self: &Arc<Self>, stream: DeviceStream) -> Result<(), ClientError> {
        codes::baud_rate_index(self.config.serial.baud_rate)?;
        self.transition(SessionState::Disconnected, SessionState::Opening)?;
        self.start(stream).await
    }

    async fn start(self: &Arc<Self>, stream: DeviceStream) -> Result<(), ClientError> {
        let (read_half, write_half) = tokio::io::split(stream);
        *self.writer.lock().await = Some(write_half);
        self.decoder.lock().clear();
        self.snapshot.write().clear();

        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(self.clone().read_loop(read_half, shutdown_rx));
        *self.reader.lock() = Some(ReaderTask { shutdown, handle });

        self.transition(SessionState::Opening, SessionState::Initializing)
            .map_err(|_| ClientError::ConnectionClosed)?;

        if let Err(e) = self.initialize().await {
            tracing::warn!("Session initialization failed: {}", e);
            self.abandon().await;
            return Err(e);
        }

        self.transition(SessionState::Initializing, SessionState::Streaming)
            .map_err(|_| ClientError::ConnectionClosed)?;
        tracing::info!("Session established");
        Ok(())
    }

    /// Fixed setup sequence: open session, select baud rate, ask for the
    /// identification strings, then poll the full state.
    async fn initialize(&self) -> Result<(), ClientError> {
        let baud_index = codes::baud_rate_index(self.config.serial.baud_rate)?;

        self.write_frame(
            &Frame::with_byte(Direction::HostToDevice, Command::Session, 0, 1),
            WriteMode::Control,
        )
        .await?;
        self.write_frame(
            &Frame::with_byte(Direction::HostToDevice, Command::SelectBaud, 0, baud_index),
            WriteMode::Control,
        )
        .await?;

        for type_code in [
            codes::MODEL_NAME,
            codes::HARDWARE_VERSION,
            codes::FIRMWARE_VERSION,
        ] {
            self.write_frame(&Frame::get(type_code), WriteMode::Control)
                .await?;
        }

        match self
            .request_frame(codes::ALL_DATA, self.config.request_timeout, WriteMode::Control)
            .await
        {
            Ok(_) => {}
            Err(ClientError::Timeout) => {
                tracing::warn!("No response to the initial full-state poll, continuing")
            }
            Err(e) => return Err(e),
        }

        Ok(())
    }

    /// Closes the session.
    ///
    /// Always completes: failures while sending the closing frames are
    /// logged. Disconnecting an idle session is a no-op.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        if !self.begin_closing() {
            tracing::debug!("disconnect() called with no active session");
            return Ok(());
        }
        tracing::debug!("Closing session...");

        if self.queue.abort() {
            if let Err(e) = self
                .write_frame(&Frame::set_byte(codes::OUTPUT_ENABLE, 0), WriteMode::Control)
                .await
            {
                tracing::warn!("Failed to disable output after queue abort: {}", e);
            }
        }

        if let Err(e) = self
            .write_frame(
                &Frame::with_byte(Direction::HostToDevice, Command::Session, 0, 0),
                WriteMode::Control,
            )
            .await
        {
            tracing::warn!("Failed to send session close: {}", e);
        }

        self.stop_reader().await;
        self.release().await;
        tracing::debug!("Session closed");
        Ok(())
    }

    /// Writes a frame. Requires a streaming session.
    pub async fn send(&self, frame: &Frame) -> Result<(), ClientError> {
        self.ensure_streaming()?;
        let result = self.write_frame(frame, WriteMode::Session).await;
        self.check_transport(result).await
    }

    /// Sends a GET for `type_code` and waits for the matching response.
    pub async fn request(&self, type_code: u8) -> Reply {
        self.request_with_timeout(type_code, self.config.request_timeout)
            .await
    }

    pub async fn request_with_timeout(&self, type_code: u8, timeout: Duration) -> Reply {
        self.ensure_streaming()?;
        let result = self
            .request_frame(type_code, timeout, WriteMode::Session)
            .await;
        self.check_transport(result).await
    }

    /// Runs a command queue. Only one queue runs at a time.
    pub async fn execute<P>(
        &self,
        commands: &[QueueCommand],
        progress: P,
    ) -> Result<QueueOutcome, ClientError>
    where
        P: FnMut(usize) + Send,
    {
        self.ensure_streaming()?;
        queue::run(self, &self.queue, commands, progress).await
    }

    /// Aborts the running command queue. Returns whether one was running.
    pub fn abort(&self) -> bool {
        self.queue.abort()
    }

    /// Returns the number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Frames dropped by the decoder for checksum mismatches.
    pub fn rejected_frames(&self) -> u64 {
        self.decoder.lock().rejected_frames()
    }

    async fn request_frame(&self, type_code: u8, timeout: Duration, mode: WriteMode) -> Reply {
        let (ticket, rx) = self.correlator.register(type_code);
        if let Err(e) = self.write_frame(&Frame::get(type_code), mode).await {
            self.correlator.remove(&ticket);
            return Err(e);
        }
        self.correlator.wait(ticket, rx, timeout).await
    }

    async fn write_frame(&self, frame: &Frame, mode: WriteMode) -> Result<(), ClientError> {
        let encoded = frame.encode()?;

        let mut writer_guard = self.writer.lock().await;
        // the session may have started closing while this write waited
        if mode == WriteMode::Session {
            self.ensure_streaming()?;
        }
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        tracing::debug!(
            "Sent {:?} type={} ({} bytes)",
            frame.command,
            frame.type_code,
            encoded.len()
        );

        tokio::time::sleep(self.config.settle_delay).await;
        Ok(())
    }

    /// Tears the session down when a write hit a transport error.
    async fn check_transport<T>(&self, result: Result<T, ClientError>) -> Result<T, ClientError> {
        if let Err(ClientError::Io(ref e)) = result {
            tracing::warn!("Transport write failed: {}", e);
            self.abandon().await;
        }
        result
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: ReadHalf<DeviceStream>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        tracing::debug!("read_loop started");
        let mut buf = vec![0u8; self.config.read_buffer_size];

        loop {
            let n = tokio::select! {
                _ = &mut shutdown => {
                    tracing::debug!("read_loop: stopped");
                    return;
                }
                result = reader.read(&mut buf) => match result {
                    Ok(0) => {
                        tracing::debug!("read_loop: transport closed");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!("read_loop: read failed: {}", e);
                        break;
                    }
                },
            };

            tracing::trace!("read_loop: received {} bytes", n);
            self.handle_bytes(&buf[..n]);
        }

        self.on_link_lost().await;
    }

    fn handle_bytes(&self, data: &[u8]) {
        let frames = {
            let mut decoder = self.decoder.lock();
            decoder.extend(data);
            decoder.decode_all()
        };
        for frame in frames {
            self.dispatch(frame);
        }
    }

    /// Projects one frame, publishes its fields and resolves any waiter.
    fn dispatch(&self, frame: Frame) {
        let reading = project(frame.type_code, &frame.payload);
        let fields = reading.fields();

        if fields.is_empty() {
            tracing::trace!(
                "Type {} carried no known fields ({} bytes)",
                frame.type_code,
                frame.payload.len()
            );
        } else {
            self.snapshot.write().merge(&fields);
            let update = StateUpdate::new(frame.type_code, fields);

            let sinks: Vec<Arc<dyn UpdateSink>> = self.sinks.read().clone();
            for sink in &sinks {
                sink.on_update(&update);
            }
            let _ = self.updates.send(update);
        }

        if self.correlator.resolve(frame.type_code, reading) {
            tracing::debug!("Resolved request for type {}", frame.type_code);
        }
    }

    /// Read loop saw EOF or a read error.
    async fn on_link_lost(&self) {
        if !self.begin_closing() {
            return;
        }
        tracing::warn!("Device link lost");
        self.queue.abort();
        // Called from the read loop itself; detach instead of joining.
        drop(self.reader.lock().take());
        self.release().await;
    }

    /// Teardown without the closing frame.
    async fn abandon(&self) {
        if !self.begin_closing() {
            return;
        }
        self.queue.abort();
        self.stop_reader().await;
        self.release().await;
    }

    async fn stop_reader(&self) {
        let task = self.reader.lock().take();
        if let Some(task) = task {
            let _ = task.shutdown.send(());
            let mut handle = task.handle;
            if tokio::time::timeout(self.config.teardown_timeout, &mut handle)
                .await
                .is_err()
            {
                tracing::warn!("read_loop did not stop in time, aborting");
                handle.abort();
            }
        }
    }

    /// Releases the transport and resets per-session state.
    async fn release(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }

        let rejected = self.correlator.reject_all();
        if rejected > 0 {
            tracing::debug!("Rejected {} pending requests", rejected);
        }
        self.decoder.lock().clear();
        self.snapshot.write().clear();
        self.set_state(SessionState::Disconnected);
    }

    fn ensure_streaming(&self) -> Result<(), ClientError> {
        match self.state() {
            SessionState::Streaming => Ok(()),
            SessionState::Disconnected => Err(ClientError::NotConnected),
            other => Err(ClientError::InvalidState(other)),
        }
    }

    fn transition(&self, from: SessionState, to: SessionState) -> Result<(), ClientError> {
        let mut state = self.state.write();
        if *state != from {
            return Err(ClientError::InvalidState(*state));
        }
        tracing::debug!("Session {} -> {}", from, to);
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: SessionState) {
        let mut state = self.state.write();
        tracing::debug!("Session {} -> {}", *state, to);
        *state = to;
    }

    /// Moves an active session to `Closing`. Returns false if it was already
    /// closing or disconnected.
    fn begin_closing(&self) -> bool {
        let mut state = self.state.write();
        match *state {
            SessionState::Disconnected | SessionState::Closing => false,
            from => {
                tracing::debug!("Session {} -> {}", from, SessionState::Closing);
                *state = SessionState::Closing;
                true
            }
        }
    }
}
