//! Projection of decoded frames onto device-state fields.

use crate::codes::{self, ALL_DATA_LEN};
use crate::fields::{
    DeviceField, FieldUpdate, FieldValue, OutputMode, ProtectionState, FIELD_TABLE,
};
use bytes::Bytes;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

/// Result of projecting one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    /// One or more fields from a targeted frame.
    Fields(Vec<FieldUpdate>),
    /// The composite full-state frame.
    All(Box<AllData>),
    /// Unknown type code, or a payload too short for its layout. Carries no
    /// state fields.
    Raw(Bytes),
}

impl Reading {
    /// Field assignments carried by this reading.
    pub fn fields(&self) -> Vec<FieldUpdate> {
        match self {
            Reading::Fields(fields) => fields.clone(),
            Reading::All(all) => all.fields(),
            Reading::Raw(_) => Vec::new(),
        }
    }

    /// Value of `field` in this reading, if present.
    pub fn value(&self, field: DeviceField) -> Option<FieldValue> {
        match self {
            Reading::Fields(fields) => fields
                .iter()
                .find(|u| u.field == field)
                .map(|u| u.value.clone()),
            Reading::All(all) => all
                .fields()
                .into_iter()
                .find(|u| u.field == field)
                .map(|u| u.value),
            Reading::Raw(_) => None,
        }
    }

    /// First value of a targeted reading.
    pub fn first(&self) -> Option<&FieldValue> {
        match self {
            Reading::Fields(fields) => fields.first().map(|u| &u.value),
            _ => None,
        }
    }
}

/// Maps a frame's type code and payload to state fields.
///
/// Never fails: unknown codes and short payloads become [`Reading::Raw`].
pub fn project(type_code: u8, payload: &[u8]) -> Reading {
    if type_code == codes::ALL_DATA {
        return match AllData::decode(payload) {
            Some(all) => Reading::All(Box::new(all)),
            None => Reading::Raw(Bytes::copy_from_slice(payload)),
        };
    }

    let decoded: Option<Vec<FieldUpdate>> = DeviceField::for_type_code(type_code)
        .map(|spec| {
            let slot = spec.push?;
            let value = slot.encoding.decode(payload, slot.offset)?;
            Some(FieldUpdate::new(spec.field, value))
        })
        .collect();

    match decoded {
        Some(fields) if !fields.is_empty() => Reading::Fields(fields),
        _ => Reading::Raw(Bytes::copy_from_slice(payload)),
    }
}

/// Preset voltage and current of one memory group.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct GroupValue {
    pub set_voltage: f32,
    pub set_current: f32,
}

/// Decoded ALL_DATA frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllData {
    pub input_voltage: f32,
    pub set_voltage: f32,
    pub set_current: f32,
    pub output_voltage: f32,
    pub output_current: f32,
    pub output_power: f32,
    pub temperature: f32,
    /// Memory groups 1-6.
    pub groups: [GroupValue; 6],
    pub over_voltage_protection: f32,
    pub over_current_protection: f32,
    pub over_power_protection: f32,
    pub over_temperature_protection: f32,
    pub low_voltage_protection: f32,
    pub brightness: u8,
    pub volume: u8,
    pub metering_closed: bool,
    pub output_capacity: f32,
    pub output_energy: f32,
    pub output_enabled: bool,
    pub protection_state: ProtectionState,
    pub mode: OutputMode,
    pub upper_limit_voltage: f32,
    pub upper_limit_current: f32,
}

impl AllData {
    /// Shortest payload holding every mapped field (through upper-limit current).
    pub const MIN_LEN: usize = 119;

    /// Decodes an ALL_DATA payload using the ALL_DATA offsets of [`FIELD_TABLE`].
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < Self::MIN_LEN {
            return None;
        }
        let mut state = DeviceState::new();
        for spec in FIELD_TABLE.iter() {
            if let Some(slot) = spec.all_data {
                state.set(spec.field, slot.encoding.decode(payload, slot.offset)?);
            }
        }
        Self::from_state(&state)
    }

    /// Builds the composite from a snapshot holding every ALL_DATA field.
    pub fn from_state(state: &DeviceState) -> Option<Self> {
        use DeviceField as F;

        let mut groups = [GroupValue::default(); 6];
        for (i, group) in groups.iter_mut().enumerate() {
            let n = i as u8 + 1;
            group.set_voltage = state.f32(DeviceField::group_voltage(n)?)?;
            group.set_current = state.f32(DeviceField::group_current(n)?)?;
        }

        Some(Self {
            input_voltage: state.f32(F::InputVoltage)?,
            set_voltage: state.f32(F::SetVoltage)?,
            set_current: state.f32(F::SetCurrent)?,
            output_voltage: state.f32(F::OutputVoltage)?,
            output_current: state.f32(F::OutputCurrent)?,
            output_power: state.f32(F::OutputPower)?,
            temperature: state.f32(F::Temperature)?,
            groups,
            over_voltage_protection: state.f32(F::OverVoltageProtection)?,
            over_current_protection: state.f32(F::OverCurrentProtection)?,
            over_power_protection: state.f32(F::OverPowerProtection)?,
            over_temperature_protection: state.f32(F::OverTemperatureProtection)?,
            low_voltage_protection: state.f32(F::LowVoltageProtection)?,
            brightness: state.u8(F::Brightness)?,
            volume: state.u8(F::Volume)?,
            metering_closed: state.bool(F::MeteringClosed)?,
            output_capacity: state.f32(F::OutputCapacity)?,
            output_energy: state.f32(F::OutputEnergy)?,
            output_enabled: state.bool(F::OutputEnabled)?,
            protection_state: state.protection()?,
            mode: state.mode()?,
            upper_limit_voltage: state.f32(F::UpperLimitVoltage)?,
            upper_limit_current: state.f32(F::UpperLimitCurrent)?,
        })
    }

    /// Preset values of memory group 1-6.
    pub fn group(&self, group: u8) -> Option<GroupValue> {
        let index = usize::from(group).checked_sub(1)?;
        self.groups.get(index).copied()
    }

    /// The same field assignments targeted frames would produce.
    pub fn fields(&self) -> Vec<FieldUpdate> {
        use DeviceField as F;
        use FieldValue::{Bool, Byte, Float, Mode, Protection};

        let mut fields = vec![
            FieldUpdate::new(F::InputVoltage, Float(self.input_voltage)),
            FieldUpdate::new(F::SetVoltage, Float(self.set_voltage)),
            FieldUpdate::new(F::SetCurrent, Float(self.set_current)),
            FieldUpdate::new(F::OutputVoltage, Float(self.output_voltage)),
            FieldUpdate::new(F::OutputCurrent, Float(self.output_current)),
            FieldUpdate::new(F::OutputPower, Float(self.output_power)),
            FieldUpdate::new(F::Temperature, Float(self.temperature)),
        ];
        for (i, group) in self.groups.iter().enumerate() {
            let n = i as u8 + 1;
            if let (Some(v), Some(c)) = (DeviceField::group_voltage(n), DeviceField::group_current(n)) {
                fields.push(FieldUpdate::new(v, Float(group.set_voltage)));
                fields.push(FieldUpdate::new(c, Float(group.set_current)));
            }
        }
        fields.extend([
            FieldUpdate::new(F::OverVoltageProtection, Float(self.over_voltage_protection)),
            FieldUpdate::new(F::OverCurrentProtection, Float(self.over_current_protection)),
            FieldUpdate::new(F::OverPowerProtection, Float(self.over_power_protection)),
            FieldUpdate::new(
                F::OverTemperatureProtection,
                Float(self.over_temperature_protection),
            ),
            FieldUpdate::new(F::LowVoltageProtection, Float(self.low_voltage_protection)),
            FieldUpdate::new(F::Brightness, Byte(self.brightness)),
            FieldUpdate::new(F::Volume, Byte(self.volume)),
            FieldUpdate::new(F::MeteringClosed, Bool(self.metering_closed)),
            FieldUpdate::new(F::OutputCapacity, Float(self.output_capacity)),
            FieldUpdate::new(F::OutputEnergy, Float(self.output_energy)),
            FieldUpdate::new(F::OutputEnabled, Bool(self.output_enabled)),
            FieldUpdate::new(F::ProtectionState, Protection(self.protection_state)),
            FieldUpdate::new(F::Mode, Mode(self.mode)),
            FieldUpdate::new(F::UpperLimitVoltage, Float(self.upper_limit_voltage)),
            FieldUpdate::new(F::UpperLimitCurrent, Float(self.upper_limit_current)),
        ]);
        fields
    }

    /// Encodes the composite into a 139-byte ALL_DATA payload.
    ///
    /// Unmapped bytes are zero.
    pub fn encode(&self) -> [u8; ALL_DATA_LEN] {
        let mut buf = [0u8; ALL_DATA_LEN];
        for update in self.fields() {
            let Some(slot) = update.field.spec().all_data else {
                continue;
            };
            if let Some(bytes) = slot.encoding.encode(&update.value) {
                buf[slot.offset..slot.offset + bytes.len()].copy_from_slice(&bytes);
            }
        }
        buf
    }
}

/// Partial state published for one decoded frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateUpdate {
    pub type_code: u8,
    #[serde(serialize_with = "serialize_fields")]
    pub fields: Vec<FieldUpdate>,
}

impl StateUpdate {
    pub fn new(type_code: u8, fields: Vec<FieldUpdate>) -> Self {
        Self { type_code, fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, field: DeviceField) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|u| u.field == field)
            .map(|u| &u.value)
    }
}

#[allow(clippy::ptr_arg)]
fn serialize_fields<S: Serializer>(
    fields: &Vec<FieldUpdate>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(fields.len()))?;
    for update in fields {
        map.serialize_entry(&update.field, &update.value)?;
    }
    map.end()
}

/// Field-level snapshot of device state.
///
/// Updates only ever overwrite individual fields; nothing is removed until
/// [`DeviceState::clear`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DeviceState {
    values: BTreeMap<DeviceField, FieldValue>,
}

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, field: DeviceField, value: FieldValue) {
        self.values.insert(field, value);
    }

    /// Merges a batch of field assignments, later entries winning.
    pub fn merge(&mut self, fields: &[FieldUpdate]) {
        for update in fields {
            self.values.insert(update.field, update.value.clone());
        }
    }

    pub fn get(&self, field: DeviceField) -> Option<&FieldValue> {
        self.values.get(&field)
    }

    pub fn f32(&self, field: DeviceField) -> Option<f32> {
        self.get(field)?.as_f32()
    }

    pub fn u8(&self, field: DeviceField) -> Option<u8> {
        self.get(field)?.as_u8()
    }

    pub fn bool(&self, field: DeviceField) -> Option<bool> {
        self.get(field)?.as_bool()
    }

    pub fn text(&self, field: DeviceField) -> Option<&str> {
        self.get(field)?.as_str()
    }

    pub fn protection(&self) -> Option<ProtectionState> {
        self.get(DeviceField::ProtectionState)?.as_protection()
    }

    pub fn mode(&self) -> Option<OutputMode> {
        self.get(DeviceField::Mode)?.as_mode()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DeviceField, &FieldValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_f32(buf: &mut [u8], offset: usize, value: f32) {
        buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// ALL_DATA payload written with literal offsets, independent of the table.
    fn sample_all_data_payload() -> [u8; ALL_DATA_LEN] {
        let mut p = [0u8; ALL_DATA_LEN];
        put_f32(&mut p, 0, 19.8);
        put_f32(&mut p, 4, 5.0);
        put_f32(&mut p, 8, 1.25);
        put_f32(&mut p, 12, 4.98);
        put_f32(&mut p, 16, 0.51);
        put_f32(&mut p, 20, 2.54);
        put_f32(&mut p, 24, 31.5);
        for g in 0..6 {
            put_f32(&mut p, 28 + g * 8, (g + 1) as f32);
            put_f32(&mut p, 32 + g * 8, (g + 1) as f32 / 10.0);
        }
        put_f32(&mut p, 76, 31.0);
        put_f32(&mut p, 80, 5.2);
        put_f32(&mut p, 84, 155.0);
        put_f32(&mut p, 88, 80.0);
        put_f32(&mut p, 92, 4.5);
        p[96] = 4;
        p[97] = 2;
        p[98] = 1;
        put_f32(&mut p, 99, 0.125);
        put_f32(&mut p, 103, 0.75);
        p[107] = 1;
        p[108] = 2;
        p[109] = 1;
        p[110] = 0xAA;
        put_f32(&mut p, 111, 30.0);
        put_f32(&mut p, 115, 5.1);
        put_f32(&mut p, 119, 99.0);
        p
    }

    #[test]
    fn test_project_all_data() {
        let payload = sample_all_data_payload();
        let Reading::All(all) = project(codes::ALL_DATA, &payload) else {
            panic!("expected ALL_DATA reading");
        };

        assert_eq!(all.input_voltage, 19.8);
        assert_eq!(all.set_voltage, 5.0);
        assert_eq!(all.set_current, 1.25);
        assert_eq!(all.output_voltage, 4.98);
        assert_eq!(all.output_current, 0.51);
        assert_eq!(all.output_power, 2.54);
        assert_eq!(all.temperature, 31.5);
        for g in 1..=6u8 {
            let group = all.group(g).unwrap();
            assert_eq!(group.set_voltage, g as f32);
            assert_eq!(group.set_current, g as f32 / 10.0);
        }
        assert_eq!(all.over_voltage_protection, 31.0);
        assert_eq!(all.over_current_protection, 5.2);
        assert_eq!(all.over_power_protection, 155.0);
        assert_eq!(all.over_temperature_protection, 80.0);
        assert_eq!(all.low_voltage_protection, 4.5);
        assert_eq!(all.brightness, 4);
        assert_eq!(all.volume, 2);
        assert!(all.metering_closed);
        assert_eq!(all.output_capacity, 0.125);
        assert_eq!(all.output_energy, 0.75);
        assert!(all.output_enabled);
        assert_eq!(all.protection_state, ProtectionState::Ocp);
        assert_eq!(all.mode, OutputMode::ConstantVoltage);
        assert_eq!(all.upper_limit_voltage, 30.0);
        assert_eq!(all.upper_limit_current, 5.1);
    }

    #[test]
    fn test_all_data_matches_targeted_fields() {
        let payload = sample_all_data_payload();
        let reading = project(codes::ALL_DATA, &payload);

        let mut from_all = DeviceState::new();
        from_all.merge(&reading.fields());

        let mut from_pushes = DeviceState::new();
        for spec in FIELD_TABLE.iter() {
            let (Some(slot), Some(push)) = (spec.all_data, spec.push) else {
                continue;
            };
            let value = slot.encoding.decode(&payload, slot.offset).unwrap();
            let bytes = push.encoding.encode(&value).unwrap();
            let mut frame_payload = vec![0u8; push.offset];
            frame_payload.extend(bytes);
            from_pushes.merge(&project(push.type_code, &frame_payload).fields());
        }

        // 195 pushes three fields; the partial payloads above leave the
        // neighbours zeroed, so compare field by field
        for (field, value) in from_all.iter() {
            let pushed = DeviceField::for_type_code(field.type_code().unwrap()).count() == 1;
            if pushed {
                assert_eq!(from_pushes.get(*field), Some(value), "{}", field);
            }
        }
        assert_eq!(from_all.len(), 34);
    }

    #[test]
    fn test_all_data_encode_roundtrip() {
        let all = AllData::decode(&sample_all_data_payload()).unwrap();
        let encoded = all.encode();
        assert_eq!(AllData::decode(&encoded).unwrap(), all);
        // unmapped bytes are not reproduced
        assert_eq!(encoded[110], 0);
        assert_eq!(&encoded[119..], &[0u8; 20][..]);
    }

    #[test]
    fn test_short_all_data_is_raw() {
        let payload = [0u8; 100];
        assert!(matches!(project(codes::ALL_DATA, &payload), Reading::Raw(_)));
        // bytes past 118 are optional
        assert!(matches!(
            project(codes::ALL_DATA, &[0u8; AllData::MIN_LEN]),
            Reading::All(_)
        ));
    }

    #[test]
    fn test_project_output_triplet() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&12.0f32.to_le_bytes());
        payload.extend_from_slice(&0.5f32.to_le_bytes());
        payload.extend_from_slice(&6.0f32.to_le_bytes());

        let reading = project(codes::OUTPUT_VOLTAGE_CURRENT_POWER, &payload);
        assert_eq!(
            reading,
            Reading::Fields(vec![
                FieldUpdate::new(DeviceField::OutputVoltage, FieldValue::Float(12.0)),
                FieldUpdate::new(DeviceField::OutputCurrent, FieldValue::Float(0.5)),
                FieldUpdate::new(DeviceField::OutputPower, FieldValue::Float(6.0)),
            ])
        );
    }

    #[test]
    fn test_project_byte_fields() {
        assert_eq!(
            project(codes::OUTPUT_ENABLE, &[1]).first(),
            Some(&FieldValue::Bool(true))
        );
        assert_eq!(
            project(codes::PROTECTION_STATE, &[5]).first(),
            Some(&FieldValue::Protection(ProtectionState::Lvp))
        );
        assert_eq!(
            project(codes::MODE_CC_CV, &[0]).first(),
            Some(&FieldValue::Mode(OutputMode::ConstantCurrent))
        );
        assert_eq!(
            project(codes::METERING_ENABLE, &[1]).value(DeviceField::MeteringClosed),
            Some(FieldValue::Bool(false))
        );
        assert_eq!(
            project(codes::BRIGHTNESS, &[7]).first(),
            Some(&FieldValue::Byte(7))
        );
    }

    #[test]
    fn test_project_text() {
        let reading = project(codes::FIRMWARE_VERSION, b"V1.2");
        assert_eq!(
            reading.value(DeviceField::FirmwareVersion),
            Some(FieldValue::Text("V1.2".to_string()))
        );
    }

    #[test]
    fn test_unknown_and_short_are_raw() {
        let reading = project(codes::UNKNOWN_225, &[3]);
        assert_eq!(reading, Reading::Raw(Bytes::from_static(&[3])));
        assert!(reading.fields().is_empty());

        assert!(matches!(project(codes::INPUT_VOLTAGE, &[1, 2]), Reading::Raw(_)));
        assert!(matches!(project(codes::OUTPUT_ENABLE, &[]), Reading::Raw(_)));
        assert!(matches!(project(0, &[]), Reading::Raw(_)));
    }

    #[test]
    fn test_device_state_merge_and_json() {
        let mut state = DeviceState::new();
        state.merge(&project(codes::INPUT_VOLTAGE, &20.0f32.to_le_bytes()).fields());
        state.merge(&project(codes::MODE_CC_CV, &[1]).fields());
        state.merge(&project(codes::INPUT_VOLTAGE, &19.5f32.to_le_bytes()).fields());

        assert_eq!(state.len(), 2);
        assert_eq!(state.f32(DeviceField::InputVoltage), Some(19.5));
        assert_eq!(state.mode(), Some(OutputMode::ConstantVoltage));

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["input_voltage"], 19.5);
        assert_eq!(json["mode"], "CV");
    }

    #[test]
    fn test_state_update_json() {
        let update = StateUpdate::new(
            codes::OUTPUT_ENABLE,
            vec![FieldUpdate::new(DeviceField::OutputEnabled, FieldValue::Bool(true))],
        );
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type_code"], 219);
        assert_eq!(json["fields"]["output_enabled"], true);
        assert_eq!(
            update.get(DeviceField::OutputEnabled),
            Some(&FieldValue::Bool(true))
        );
    }
}
