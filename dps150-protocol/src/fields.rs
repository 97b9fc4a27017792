//! Device-state fields and the static table describing where each one lives
//! on the wire.
//!
//! Every field has at most one push location (a type code plus an offset in
//! that frame's payload) and at most one offset inside the ALL_DATA frame.
//! Encoders, the projector and device simulators all read this table.

use crate::codes;
use crate::frame::read_f32;
use serde::{Serialize, Serializer};
use std::fmt;

/// A named device-state field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceField {
    InputVoltage,
    SetVoltage,
    SetCurrent,
    OutputVoltage,
    OutputCurrent,
    OutputPower,
    Temperature,
    Group1Voltage,
    Group1Current,
    Group2Voltage,
    Group2Current,
    Group3Voltage,
    Group3Current,
    Group4Voltage,
    Group4Current,
    Group5Voltage,
    Group5Current,
    Group6Voltage,
    Group6Current,
    OverVoltageProtection,
    OverCurrentProtection,
    OverPowerProtection,
    OverTemperatureProtection,
    LowVoltageProtection,
    Brightness,
    Volume,
    MeteringClosed,
    OutputCapacity,
    OutputEnergy,
    OutputEnabled,
    ProtectionState,
    Mode,
    ModelName,
    HardwareVersion,
    FirmwareVersion,
    UpperLimitVoltage,
    UpperLimitCurrent,
}

impl DeviceField {
    /// Returns the table entry for this field.
    pub fn spec(self) -> &'static FieldSpec {
        // rows are in declaration order; checked by tests
        &FIELD_TABLE[self as usize]
    }

    /// Stable snake_case name.
    pub fn name(self) -> &'static str {
        self.spec().name
    }

    /// Looks a field up by its snake_case name.
    pub fn from_name(name: &str) -> Option<Self> {
        FIELD_TABLE
            .iter()
            .find(|spec| spec.name == name)
            .map(|spec| spec.field)
    }

    /// Type code this field is pushed with and written to, if any.
    pub fn type_code(self) -> Option<u8> {
        self.spec().push.map(|slot| slot.type_code)
    }

    /// Fields carried by a single type code, in payload order.
    pub fn for_type_code(type_code: u8) -> impl Iterator<Item = &'static FieldSpec> {
        FIELD_TABLE
            .iter()
            .filter(move |spec| spec.push.map_or(false, |slot| slot.type_code == type_code))
    }

    /// Voltage preset field of memory group 1-6.
    pub fn group_voltage(group: u8) -> Option<Self> {
        let (voltage, _) = codes::group_codes(group).ok()?;
        Self::for_type_code(voltage).next().map(|spec| spec.field)
    }

    /// Current preset field of memory group 1-6.
    pub fn group_current(group: u8) -> Option<Self> {
        let (_, current) = codes::group_codes(group).ok()?;
        Self::for_type_code(current).next().map(|spec| spec.field)
    }
}

impl fmt::Display for DeviceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Protection state reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtectionState {
    #[default]
    None,
    Ovp,
    Ocp,
    Opp,
    Otp,
    Lvp,
    Rep,
    /// Index outside the known list.
    Unknown(u8),
}

impl ProtectionState {
    /// Names in wire index order.
    pub const NAMES: [&'static str; 7] = ["", "OVP", "OCP", "OPP", "OTP", "LVP", "REP"];

    pub fn from_index(index: u8) -> Self {
        match index {
            0 => ProtectionState::None,
            1 => ProtectionState::Ovp,
            2 => ProtectionState::Ocp,
            3 => ProtectionState::Opp,
            4 => ProtectionState::Otp,
            5 => ProtectionState::Lvp,
            6 => ProtectionState::Rep,
            other => ProtectionState::Unknown(other),
        }
    }

    pub fn index(self) -> u8 {
        match self {
            ProtectionState::None => 0,
            ProtectionState::Ovp => 1,
            ProtectionState::Ocp => 2,
            ProtectionState::Opp => 3,
            ProtectionState::Otp => 4,
            ProtectionState::Lvp => 5,
            ProtectionState::Rep => 6,
            ProtectionState::Unknown(i) => i,
        }
    }

    /// Display name; empty when no protection has tripped.
    pub fn name(self) -> &'static str {
        Self::NAMES.get(self.index() as usize).copied().unwrap_or("?")
    }

    pub fn is_tripped(self) -> bool {
        self != ProtectionState::None
    }
}

impl fmt::Display for ProtectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtectionState::Unknown(i) => write!(f, "UNKNOWN({})", i),
            other => f.write_str(other.name()),
        }
    }
}

impl Serialize for ProtectionState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Regulation mode of the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OutputMode {
    #[serde(rename = "CC")]
    ConstantCurrent,
    #[serde(rename = "CV")]
    ConstantVoltage,
}

impl OutputMode {
    pub fn from_byte(byte: u8) -> Self {
        if byte == 0 {
            OutputMode::ConstantCurrent
        } else {
            OutputMode::ConstantVoltage
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            OutputMode::ConstantCurrent => 0,
            OutputMode::ConstantVoltage => 1,
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputMode::ConstantCurrent => f.write_str("CC"),
            OutputMode::ConstantVoltage => f.write_str("CV"),
        }
    }
}

/// Value of a device-state field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Float(f32),
    Byte(u8),
    Bool(bool),
    Text(String),
    Protection(ProtectionState),
    Mode(OutputMode),
}

impl FieldValue {
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            FieldValue::Byte(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_protection(&self) -> Option<ProtectionState> {
        match self {
            FieldValue::Protection(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_mode(&self) -> Option<OutputMode> {
        match self {
            FieldValue::Mode(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{:.3}", v),
            FieldValue::Byte(v) => write!(f, "{}", v),
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::Text(v) => f.write_str(v),
            FieldValue::Protection(v) => write!(f, "{}", v),
            FieldValue::Mode(v) => write!(f, "{}", v),
        }
    }
}

/// A single field assignment produced by the projector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldUpdate {
    pub field: DeviceField,
    pub value: FieldValue,
}

impl FieldUpdate {
    pub fn new(field: DeviceField, value: FieldValue) -> Self {
        Self { field, value }
    }
}

/// How a field's bytes are laid out at one location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldEncoding {
    /// Little-endian IEEE-754 single precision.
    F32,
    /// Raw byte.
    Byte,
    /// Byte, non-zero means `true`.
    Flag,
    /// Byte, zero means `true`.
    InvertedFlag,
    /// Byte index into [`ProtectionState::NAMES`].
    Protection,
    /// Byte, 0 = CC, otherwise CV.
    Mode,
    /// Remaining payload bytes as text.
    Text,
}

impl FieldEncoding {
    /// Decodes the value at `offset`, or `None` if the payload is too short.
    pub fn decode(self, payload: &[u8], offset: usize) -> Option<FieldValue> {
        match self {
            FieldEncoding::F32 => read_f32(payload, offset).map(FieldValue::Float),
            FieldEncoding::Text => {
                let bytes = payload.get(offset..)?;
                let text: String = bytes.iter().map(|&b| b as char).collect();
                Some(FieldValue::Text(text.trim_end_matches('\0').to_string()))
            }
            FieldEncoding::Byte => payload.get(offset).map(|&b| FieldValue::Byte(b)),
            FieldEncoding::Flag => payload.get(offset).map(|&b| FieldValue::Bool(b != 0)),
            FieldEncoding::InvertedFlag => payload.get(offset).map(|&b| FieldValue::Bool(b == 0)),
            FieldEncoding::Protection => payload
                .get(offset)
                .map(|&b| FieldValue::Protection(ProtectionState::from_index(b))),
            FieldEncoding::Mode => payload
                .get(offset)
                .map(|&b| FieldValue::Mode(OutputMode::from_byte(b))),
        }
    }

    /// Encodes `value` into its wire bytes, if the value matches this encoding.
    pub fn encode(self, value: &FieldValue) -> Option<Vec<u8>> {
        match (self, value) {
            (FieldEncoding::F32, FieldValue::Float(v)) => Some(v.to_le_bytes().to_vec()),
            (FieldEncoding::Byte, FieldValue::Byte(v)) => Some(vec![*v]),
            (FieldEncoding::Flag, FieldValue::Bool(v)) => Some(vec![u8::from(*v)]),
            (FieldEncoding::InvertedFlag, FieldValue::Bool(v)) => Some(vec![u8::from(!*v)]),
            (FieldEncoding::Protection, FieldValue::Protection(v)) => Some(vec![v.index()]),
            (FieldEncoding::Mode, FieldValue::Mode(v)) => Some(vec![v.as_byte()]),
            (FieldEncoding::Text, FieldValue::Text(v)) => {
                Some(v.chars().map(|c| c as u32 as u8).collect())
            }
            _ => None,
        }
    }
}

/// A field's location inside the payload of its own type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushSlot {
    pub type_code: u8,
    pub offset: usize,
    pub encoding: FieldEncoding,
}

/// A field's location inside the ALL_DATA payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllDataSlot {
    pub offset: usize,
    pub encoding: FieldEncoding,
}

/// One row of [`FIELD_TABLE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub field: DeviceField,
    pub name: &'static str,
    pub push: Option<PushSlot>,
    pub all_data: Option<AllDataSlot>,
}

impl FieldSpec {
    /// Encoding used when the field is written with its own type code.
    pub fn push_encoding(&self) -> Option<FieldEncoding> {
        self.push.map(|slot| slot.encoding)
    }
}

const fn row(
    field: DeviceField,
    name: &'static str,
    push: Option<(u8, usize, FieldEncoding)>,
    all_data: Option<(usize, FieldEncoding)>,
) -> FieldSpec {
    FieldSpec {
        field,
        name,
        push: match push {
            Some((type_code, offset, encoding)) => Some(PushSlot {
                type_code,
                offset,
                encoding,
            }),
            None => None,
        },
        all_data: match all_data {
            Some((offset, encoding)) => Some(AllDataSlot { offset, encoding }),
            None => None,
        },
    }
}

use DeviceField as F;
use FieldEncoding as E;

/// Every device-state field with its push and ALL_DATA locations.
///
/// ALL_DATA bytes 110 and 119-138 carry values of unknown meaning and are not
/// mapped.
pub static FIELD_TABLE: [FieldSpec; 37] = [
    row(F::InputVoltage, "input_voltage", Some((codes::INPUT_VOLTAGE, 0, E::F32)), Some((0, E::F32))),
    row(F::SetVoltage, "set_voltage", Some((codes::VOLTAGE_SET, 0, E::F32)), Some((4, E::F32))),
    row(F::SetCurrent, "set_current", Some((codes::CURRENT_SET, 0, E::F32)), Some((8, E::F32))),
    row(F::OutputVoltage, "output_voltage", Some((codes::OUTPUT_VOLTAGE_CURRENT_POWER, 0, E::F32)), Some((12, E::F32))),
    row(F::OutputCurrent, "output_current", Some((codes::OUTPUT_VOLTAGE_CURRENT_POWER, 4, E::F32)), Some((16, E::F32))),
    row(F::OutputPower, "output_power", Some((codes::OUTPUT_VOLTAGE_CURRENT_POWER, 8, E::F32)), Some((20, E::F32))),
    row(F::Temperature, "temperature", Some((codes::TEMPERATURE, 0, E::F32)), Some((24, E::F32))),
    row(F::Group1Voltage, "group1_voltage", Some((codes::GROUP1_VOLTAGE_SET, 0, E::F32)), Some((28, E::F32))),
    row(F::Group1Current, "group1_current", Some((codes::GROUP1_CURRENT_SET, 0, E::F32)), Some((32, E::F32))),
    row(F::Group2Voltage, "group2_voltage", Some((codes::GROUP2_VOLTAGE_SET, 0, E::F32)), Some((36, E::F32))),
    row(F::Group2Current, "group2_current", Some((codes::GROUP2_CURRENT_SET, 0, E::F32)), Some((40, E::F32))),
    row(F::Group3Voltage, "group3_voltage", Some((codes::GROUP3_VOLTAGE_SET, 0, E::F32)), Some((44, E::F32))),
    row(F::Group3Current, "group3_current", Some((codes::GROUP3_CURRENT_SET, 0, E::F32)), Some((48, E::F32))),
    row(F::Group4Voltage, "group4_voltage", Some((codes::GROUP4_VOLTAGE_SET, 0, E::F32)), Some((52, E::F32))),
    row(F::Group4Current, "group4_current", Some((codes::GROUP4_CURRENT_SET, 0, E::F32)), Some((56, E::F32))),
    row(F::Group5Voltage, "group5_voltage", Some((codes::GROUP5_VOLTAGE_SET, 0, E::F32)), Some((60, E::F32))),
    row(F::Group5Current, "group5_current", Some((codes::GROUP5_CURRENT_SET, 0, E::F32)), Some((64, E::F32))),
    row(F::Group6Voltage, "group6_voltage", Some((codes::GROUP6_VOLTAGE_SET, 0, E::F32)), Some((68, E::F32))),
    row(F::Group6Current, "group6_current", Some((codes::GROUP6_CURRENT_SET, 0, E::F32)), Some((72, E::F32))),
    row(F::OverVoltageProtection, "over_voltage_protection", Some((codes::OVP, 0, E::F32)), Some((76, E::F32))),
    row(F::OverCurrentProtection, "over_current_protection", Some((codes::OCP, 0, E::F32)), Some((80, E::F32))),
    row(F::OverPowerProtection, "over_power_protection", Some((codes::OPP, 0, E::F32)), Some((84, E::F32))),
    row(F::OverTemperatureProtection, "over_temperature_protection", Some((codes::OTP, 0, E::F32)), Some((88, E::F32))),
    row(F::LowVoltageProtection, "low_voltage_protection", Some((codes::LVP, 0, E::F32)), Some((92, E::F32))),
    row(F::Brightness, "brightness", Some((codes::BRIGHTNESS, 0, E::Byte)), Some((96, E::Byte))),
    row(F::Volume, "volume", Some((codes::VOLUME, 0, E::Byte)), Some((97, E::Byte))),
    // the push carries the enable flag, ALL_DATA the closed flag
    row(F::MeteringClosed, "metering_closed", Some((codes::METERING_ENABLE, 0, E::InvertedFlag)), Some((98, E::Flag))),
    row(F::OutputCapacity, "output_capacity", Some((codes::OUTPUT_CAPACITY, 0, E::F32)), Some((99, E::F32))),
    row(F::OutputEnergy, "output_energy", Some((codes::OUTPUT_ENERGY, 0, E::F32)), Some((103, E::F32))),
    row(F::OutputEnabled, "output_enabled", Some((codes::OUTPUT_ENABLE, 0, E::Flag)), Some((107, E::Flag))),
    row(F::ProtectionState, "protection_state", Some((codes::PROTECTION_STATE, 0, E::Protection)), Some((108, E::Protection))),
    row(F::Mode, "mode", Some((codes::MODE_CC_CV, 0, E::Mode)), Some((109, E::Mode))),
    row(F::ModelName, "model_name", Some((codes::MODEL_NAME, 0, E::Text)), None),
    row(F::HardwareVersion, "hardware_version", Some((codes::HARDWARE_VERSION, 0, E::Text)), None),
    row(F::FirmwareVersion, "firmware_version", Some((codes::FIRMWARE_VERSION, 0, E::Text)), None),
    row(F::UpperLimitVoltage, "upper_limit_voltage", Some((codes::UPPER_LIMIT_VOLTAGE, 0, E::F32)), Some((111, E::F32))),
    row(F::UpperLimitCurrent, "upper_limit_current", Some((codes::UPPER_LIMIT_CURRENT, 0, E::F32)), Some((115, E::F32))),
];
