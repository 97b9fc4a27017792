//! # dps150-protocol
//!
//! Wire protocol implementation for the DPS-150 bench power supply.
//!
//! This crate provides:
//! - Frame encoding with the additive single-byte checksum
//! - A restartable stream decoder that resynchronizes after corrupt frames
//! - The static type-code table shared by encoders, projectors and simulators
//! - Projection of decoded frames onto named device-state fields

pub mod codec;
pub mod codes;
pub mod error;
pub mod fields;
pub mod frame;
pub mod projection;

pub use codec::{decode_frames, DecodeOutcome, Decoder};
pub use error::ProtocolError;
pub use fields::{
    DeviceField, FieldEncoding, FieldSpec, FieldUpdate, FieldValue, OutputMode, ProtectionState,
    FIELD_TABLE,
};
pub use frame::{checksum, Command, Direction, Frame, FRAME_OVERHEAD, MAX_PAYLOAD_LEN};
pub use projection::{project, AllData, DeviceState, GroupValue, Reading, StateUpdate};

/// Default serial baud rate used by the device.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Number of memory groups (preset voltage/current pairs) on the device.
pub const GROUP_COUNT: u8 = 6;
