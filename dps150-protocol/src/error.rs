//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur while building or interpreting frames.
///
/// Checksum mismatches are not represented here: the decoder recovers from
/// them locally by resynchronizing and never surfaces them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("unknown direction byte: {0:#04x}")]
    UnknownDirection(u8),

    #[error("unknown command byte: {0:#04x}")]
    UnknownCommand(u8),

    #[error("invalid memory group: {0} (expected 1-6)")]
    InvalidGroup(u8),

    #[error("unsupported baud rate: {0}")]
    UnsupportedBaudRate(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::PayloadTooLarge { size: 300, max: 255 };
        assert!(err.to_string().contains("300"));
        assert!(err.to_string().contains("255"));

        let err = ProtocolError::UnknownDirection(0xAB);
        assert!(err.to_string().contains("0xab"));

        let err = ProtocolError::UnknownCommand(0x10);
        assert!(err.to_string().contains("0x10"));

        let err = ProtocolError::InvalidGroup(7);
        assert!(err.to_string().contains('7'));

        let err = ProtocolError::UnsupportedBaudRate(4800);
        assert!(err.to_string().contains("4800"));
    }
}
