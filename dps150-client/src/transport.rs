//! Transport abstraction for serial ports and in-memory links.

use dps150_protocol::DEFAULT_BAUD_RATE;
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

/// Serial link settings.
///
/// Data bits, stop bits, parity and flow control are fixed by the device
/// (8N1, hardware flow control); only the port and baud rate vary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port path, e.g. `/dev/ttyACM0` or `COM3`.
    pub path: String,
    pub baud_rate: u32,
}

impl SerialConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }
}

/// Opens the serial port with the device's fixed line settings.
pub fn open_serial(config: &SerialConfig) -> Result<SerialStream, tokio_serial::Error> {
    #[allow(unused_mut)]
    let mut port = tokio_serial::new(&config.path, config.baud_rate)
        .data_bits(DataBits::Eight)
        .stop_bits(StopBits::One)
        .parity(Parity::None)
        .flow_control(FlowControl::Hardware)
        .open_native_async()?;

    #[cfg(unix)]
    port.set_exclusive(true)?;

    Ok(port)
}

pin_project! {
    /// A device link: a serial port or an in-memory pipe.
    #[project = DeviceStreamProj]
    pub enum DeviceStream {
        Serial { #[pin] stream: SerialStream },
        Memory { #[pin] stream: DuplexStream },
    }
}

impl From<SerialStream> for DeviceStream {
    fn from(stream: SerialStream) -> Self {
        DeviceStream::Serial { stream }
    }
}

impl From<DuplexStream> for DeviceStream {
    fn from(stream: DuplexStream) -> Self {
        DeviceStream::Memory { stream }
    }
}

impl AsyncRead for DeviceStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            DeviceStreamProj::Serial { stream } => stream.poll_read(cx, buf),
            DeviceStreamProj::Memory { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DeviceStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            DeviceStreamProj::Serial { stream } => stream.poll_write(cx, buf),
            DeviceStreamProj::Memory { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            DeviceStreamProj::Serial { stream } => stream.poll_flush(cx),
            DeviceStreamProj::Memory { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            DeviceStreamProj::Serial { stream } => stream.poll_shutdown(cx),
            DeviceStreamProj::Memory { stream } => stream.poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_serial_config_defaults() {
        let config = SerialConfig::new("/dev/ttyACM0");
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.with_baud_rate(9600).baud_rate, 9600);
    }

    #[tokio::test]
    async fn test_memory_stream() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut stream = DeviceStream::from(a);
        assert!(matches!(stream, DeviceStream::Memory { .. }));

        stream.write_all(&[1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 3];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }
}
