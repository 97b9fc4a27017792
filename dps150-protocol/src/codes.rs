//! Type codes carried in the third byte of every frame.
//!
//! Floats are little-endian IEEE-754 single precision unless noted.

use crate::error::ProtocolError;

pub const INPUT_VOLTAGE: u8 = 192;
pub const VOLTAGE_SET: u8 = 193;
pub const CURRENT_SET: u8 = 194;
/// Output voltage, current and power as three floats at offsets 0/4/8.
pub const OUTPUT_VOLTAGE_CURRENT_POWER: u8 = 195;
pub const TEMPERATURE: u8 = 196;

pub const GROUP1_VOLTAGE_SET: u8 = 197;
pub const GROUP1_CURRENT_SET: u8 = 198;
pub const GROUP2_VOLTAGE_SET: u8 = 199;
pub const GROUP2_CURRENT_SET: u8 = 200;
pub const GROUP3_VOLTAGE_SET: u8 = 201;
pub const GROUP3_CURRENT_SET: u8 = 202;
pub const GROUP4_VOLTAGE_SET: u8 = 203;
pub const GROUP4_CURRENT_SET: u8 = 204;
pub const GROUP5_VOLTAGE_SET: u8 = 205;
pub const GROUP5_CURRENT_SET: u8 = 206;
pub const GROUP6_VOLTAGE_SET: u8 = 207;
pub const GROUP6_CURRENT_SET: u8 = 208;

pub const OVP: u8 = 209;
pub const OCP: u8 = 210;
pub const OPP: u8 = 211;
pub const OTP: u8 = 212;
pub const LVP: u8 = 213;

/// Single byte.
pub const BRIGHTNESS: u8 = 214;
/// Single byte.
pub const VOLUME: u8 = 215;
/// Single byte, 1 starts metering.
pub const METERING_ENABLE: u8 = 216;
pub const OUTPUT_CAPACITY: u8 = 217;
pub const OUTPUT_ENERGY: u8 = 218;
/// Single byte, 1 enables the output.
pub const OUTPUT_ENABLE: u8 = 219;
/// Single byte index into the protection-state name list.
pub const PROTECTION_STATE: u8 = 220;
/// Single byte, 0 = CC, 1 = CV.
pub const MODE_CC_CV: u8 = 221;
/// ASCII text.
pub const MODEL_NAME: u8 = 222;
/// ASCII text.
pub const HARDWARE_VERSION: u8 = 223;
/// ASCII text.
pub const FIRMWARE_VERSION: u8 = 224;
/// Observed on the wire, meaning unknown.
pub const UNKNOWN_225: u8 = 225;
pub const UPPER_LIMIT_VOLTAGE: u8 = 226;
pub const UPPER_LIMIT_CURRENT: u8 = 227;
/// Composite full-state frame.
pub const ALL_DATA: u8 = 255;

/// Payload length of the ALL_DATA frame.
pub const ALL_DATA_LEN: usize = 139;

/// Baud rates understood by the `SelectBaud` init command, in index order.
pub const BAUD_RATES: [u32; 5] = [9600, 19200, 38400, 57600, 115_200];

/// Returns the `SelectBaud` payload byte for a baud rate (1-based index).
pub fn baud_rate_index(baud: u32) -> Result<u8, ProtocolError> {
    BAUD_RATES
        .iter()
        .position(|&b| b == baud)
        .map(|i| i as u8 + 1)
        .ok_or(ProtocolError::UnsupportedBaudRate(baud))
}

/// Type codes for the voltage and current presets of a memory group (1-6).
pub fn group_codes(group: u8) -> Result<(u8, u8), ProtocolError> {
    if !(1..=crate::GROUP_COUNT).contains(&group) {
        return Err(ProtocolError::InvalidGroup(group));
    }
    let voltage = GROUP1_VOLTAGE_SET + (group - 1) * 2;
    Ok((voltage, voltage + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baud_rate_index() {
        assert_eq!(baud_rate_index(9600).unwrap(), 1);
        assert_eq!(baud_rate_index(115_200).unwrap(), 5);
        assert_eq!(
            baud_rate_index(4800),
            Err(ProtocolError::UnsupportedBaudRate(4800))
        );
    }

    #[test]
    fn test_group_codes() {
        assert_eq!(group_codes(1).unwrap(), (197, 198));
        assert_eq!(group_codes(3).unwrap(), (201, 202));
        assert_eq!(group_codes(6).unwrap(), (207, 208));
        assert!(matches!(group_codes(0), Err(ProtocolError::InvalidGroup(0))));
        assert!(matches!(group_codes(7), Err(ProtocolError::InvalidGroup(7))));
    }
}
