//! Spindle and VFD settings
//!
//! [`VfdSettings`] is persisted through an opaque [`SettingsStore`] as a
//! postcard blob followed by a CRC-16 trailer. Anything that fails to load,
//! decode or validate is replaced by defaults, which are written back at once.
//!
//! ## Defaults
//!
//! | Setting | Default |
//! |---------|---------|
//! | Bus address | 1 |
//! | RPM per Hz | 60 |
//! | Run/stop register | 0x2000 |
//! | Set frequency register | 0x2001 |
//! | Get frequency register | 0x2103 |
//! | CW / CCW / stop command | 0x12 / 0x22 / 0x01 |
//! | RPM input multiplier / divider | 50 / 60 |
//! | RPM output multiplier / divider | 60 / 100 |

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::adu::{crc16, verify_crc};
use crate::constants::{CRC_LEN, MAX_SLAVE_ADDRESS, VFD_ADDRESS, VFD_N_ADDRESSES};
use crate::error::{SettingsError, SettingsResult};

/// Core spindle settings shared by all drivers
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpindleSettings {
    /// At-speed window half-width in percent, zero disables the check
    pub at_speed_tolerance: f32,
    /// Swap in the null spindle when retries are exhausted
    pub disable_on_failure: bool,
}

impl Default for SpindleSettings {
    fn default() -> Self {
        Self {
            at_speed_tolerance: 0.0,
            disable_on_failure: false,
        }
    }
}

impl SpindleSettings {
    pub fn with_at_speed_tolerance(mut self, percent: f32) -> Self {
        self.at_speed_tolerance = percent;
        self
    }

    pub fn with_disable_on_failure(mut self, disable: bool) -> Self {
        self.disable_on_failure = disable;
        self
    }
}

/// Status of a settings store transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferResult {
    Ok,
    Failed,
}

/// Byte store provided by the platform
pub trait SettingsStore {
    fn load(&mut self) -> Result<Vec<u8>, TransferResult>;

    fn save(&mut self, data: &[u8]) -> TransferResult;
}

/// Persisted VFD configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VfdSettings {
    /// One address per VFD spindle, in registration order
    pub modbus_address: [u8; VFD_N_ADDRESSES],
    pub vfd_rpm_hz: u16,
    pub runstop_reg: u16,
    pub set_freq_reg: u16,
    pub get_freq_reg: u16,
    pub run_cw_cmd: u16,
    pub run_ccw_cmd: u16,
    pub stop_cmd: u16,
    pub in_multiplier: f32,
    pub in_divider: f32,
    pub out_multiplier: f32,
    pub out_divider: f32,
}

impl Default for VfdSettings {
    fn default() -> Self {
        Self {
            modbus_address: [VFD_ADDRESS; VFD_N_ADDRESSES],
            vfd_rpm_hz: 60,
            runstop_reg: 0x2000,
            set_freq_reg: 0x2001,
            get_freq_reg: 0x2103,
            run_cw_cmd: 0x12,
            run_ccw_cmd: 0x22,
            stop_cmd: 0x01,
            in_multiplier: 50.0,
            in_divider: 60.0,
            out_multiplier: 60.0,
            out_divider: 100.0,
        }
    }
}

impl VfdSettings {
    /// Bus address for the VFD registered in `slot`, slot 0 when out of range
    pub fn address(&self, slot: usize) -> u8 {
        self.modbus_address
            .get(slot)
            .copied()
            .unwrap_or(self.modbus_address[0])
    }

    pub fn validate(&self) -> SettingsResult<()> {
        for &address in &self.modbus_address {
            if address == 0 || address > MAX_SLAVE_ADDRESS {
                return Err(SettingsError::invalid(
                    "modbus_address",
                    format!("{} outside 1..={}", address, MAX_SLAVE_ADDRESS),
                ));
            }
        }
        if !(1..=3000).contains(&self.vfd_rpm_hz) {
            return Err(SettingsError::invalid("vfd_rpm_hz", "must be 1..=3000"));
        }
        for (name, value) in [
            ("in_multiplier", self.in_multiplier),
            ("in_divider", self.in_divider),
            ("out_multiplier", self.out_multiplier),
            ("out_divider", self.out_divider),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(SettingsError::invalid(name, "must be a positive number"));
            }
        }
        Ok(())
    }

    pub fn encode(&self) -> SettingsResult<Vec<u8>> {
        let mut blob =
            postcard::to_allocvec(self).map_err(|e| SettingsError::corrupt(e.to_string()))?;
        let crc = crc16(&blob);
        blob.extend_from_slice(&crc.to_le_bytes());
        Ok(blob)
    }

    pub fn decode(bytes: &[u8]) -> SettingsResult<Self> {
        if bytes.len() <= CRC_LEN || !verify_crc(bytes) {
            return Err(SettingsError::corrupt("checksum mismatch"));
        }
        let body = &bytes[..bytes.len() - CRC_LEN];
        let settings: Self =
            postcard::from_bytes(body).map_err(|e| SettingsError::corrupt(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, store: &mut dyn SettingsStore) -> SettingsResult<()> {
        let blob = self.encode()?;
        match store.save(&blob) {
            TransferResult::Ok => Ok(()),
            status => Err(SettingsError::Transfer { status }),
        }
    }

    /// Load from `store`, restoring defaults on any failure
    pub fn load(store: &mut dyn SettingsStore) -> Self {
        let loaded = match store.load() {
            Ok(bytes) => Self::decode(&bytes),
            Err(status) => Err(SettingsError::Transfer { status }),
        };

        match loaded {
            Ok(settings) => settings,
            Err(e) => {
                warn!("VFD settings unusable ({}), restoring defaults", e);
                Self::restore(store)
            }
        }
    }

    /// Write defaults back to `store` and return them
    pub fn restore(store: &mut dyn SettingsStore) -> Self {
        let defaults = Self::default();
        match defaults.save(store) {
            Ok(()) => info!("VFD settings restored to defaults"),
            Err(e) => warn!("Failed to write default VFD settings: {}", e),
        }
        defaults
    }

    /// Apply a single setting by id, validating the result
    pub fn set(&mut self, id: SettingId, value: f32) -> SettingsResult<()> {
        if !value.is_finite() {
            return Err(SettingsError::invalid(setting_name(id), "must be a finite number"));
        }
        if let Some(d) = describe(id) {
            if value < d.min || value > d.max {
                return Err(SettingsError::invalid(
                    d.name,
                    format!("{} outside {}..={}", value, d.min, d.max),
                ));
            }
        }

        let mut updated = self.clone();
        match id {
            SettingId::ModbusAddress(slot) => {
                let Some(address) = updated.modbus_address.get_mut(slot as usize) else {
                    return Err(SettingsError::invalid("modbus_address", "no such slot"));
                };
                *address = integer("modbus_address", value)?;
            }
            SettingId::RpmPerHz => updated.vfd_rpm_hz = integer("vfd_rpm_hz", value)?,
            SettingId::RunStopRegister => updated.runstop_reg = integer("runstop_reg", value)?,
            SettingId::SetFrequencyRegister => {
                updated.set_freq_reg = integer("set_freq_reg", value)?
            }
            SettingId::GetFrequencyRegister => {
                updated.get_freq_reg = integer("get_freq_reg", value)?
            }
            SettingId::RunCwCommand => updated.run_cw_cmd = integer("run_cw_cmd", value)?,
            SettingId::RunCcwCommand => updated.run_ccw_cmd = integer("run_ccw_cmd", value)?,
            SettingId::StopCommand => updated.stop_cmd = integer("stop_cmd", value)?,
            SettingId::InMultiplier => updated.in_multiplier = value,
            SettingId::InDivider => updated.in_divider = value,
            SettingId::OutMultiplier => updated.out_multiplier = value,
            SettingId::OutDivider => updated.out_divider = value,
        }
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

/// Round to the nearest integer and convert without truncation
fn integer<T: TryFrom<i64>>(name: &'static str, value: f32) -> SettingsResult<T> {
    let rounded = value.round() as i64;
    T::try_from(rounded)
        .map_err(|_| SettingsError::invalid(name, format!("{} does not fit the setting", value)))
}

fn setting_name(id: SettingId) -> &'static str {
    describe(id).map_or("setting", |d| d.name)
}

/// Addressable VFD settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingId {
    ModbusAddress(u8),
    RpmPerHz,
    RunStopRegister,
    SetFrequencyRegister,
    GetFrequencyRegister,
    RunCwCommand,
    RunCcwCommand,
    StopCommand,
    InMultiplier,
    InDivider,
    OutMultiplier,
    OutDivider,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingFormat {
    Integer,
    Decimal,
}

/// Help text and bounds for one setting
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettingDescriptor {
    pub id: SettingId,
    pub name: &'static str,
    pub description: &'static str,
    pub format: SettingFormat,
    pub min: f32,
    pub max: f32,
}

const fn descriptor(
    id: SettingId,
    name: &'static str,
    description: &'static str,
    format: SettingFormat,
    min: f32,
    max: f32,
) -> SettingDescriptor {
    SettingDescriptor {
        id,
        name,
        description,
        format,
        min,
        max,
    }
}

/// All VFD settings with their bounds
pub const VFD_SETTINGS: &[SettingDescriptor] = &[
    descriptor(SettingId::ModbusAddress(0), "ModBus address", "VFD ModBus address", SettingFormat::Integer, 1.0, 247.0),
    descriptor(SettingId::ModbusAddress(1), "ModBus address 2", "Second VFD ModBus address", SettingFormat::Integer, 1.0, 247.0),
    descriptor(SettingId::ModbusAddress(2), "ModBus address 3", "Third VFD ModBus address", SettingFormat::Integer, 1.0, 247.0),
    descriptor(SettingId::ModbusAddress(3), "ModBus address 4", "Fourth VFD ModBus address", SettingFormat::Integer, 1.0, 247.0),
    descriptor(SettingId::RpmPerHz, "RPM per Hz", "RPM/Hz value for GS20 and YL620A", SettingFormat::Integer, 1.0, 3000.0),
    descriptor(SettingId::RunStopRegister, "Run/Stop Register", "MODVFD register for run/stop", SettingFormat::Integer, 0.0, 65535.0),
    descriptor(SettingId::SetFrequencyRegister, "Set Frequency Register", "MODVFD set frequency register", SettingFormat::Integer, 0.0, 65535.0),
    descriptor(SettingId::GetFrequencyRegister, "Get Frequency Register", "MODVFD get frequency register", SettingFormat::Integer, 0.0, 65535.0),
    descriptor(SettingId::RunCwCommand, "Run CW Command", "MODVFD command word for CW", SettingFormat::Integer, 0.0, 65535.0),
    descriptor(SettingId::RunCcwCommand, "Run CCW Command", "MODVFD command word for CCW", SettingFormat::Integer, 0.0, 65535.0),
    descriptor(SettingId::StopCommand, "Stop Command", "MODVFD command word for stop", SettingFormat::Integer, 0.0, 65535.0),
    descriptor(SettingId::InMultiplier, "RPM input Multiplier", "MODVFD RPM value multiplier for programming RPM", SettingFormat::Decimal, 0.001, 100_000.0),
    descriptor(SettingId::InDivider, "RPM input Divider", "MODVFD RPM value divider for programming RPM", SettingFormat::Decimal, 0.001, 100_000.0),
    descriptor(SettingId::OutMultiplier, "RPM output Multiplier", "MODVFD RPM value multiplier for reading RPM", SettingFormat::Decimal, 0.001, 100_000.0),
    descriptor(SettingId::OutDivider, "RPM output Divider", "MODVFD RPM value divider for reading RPM", SettingFormat::Decimal, 0.001, 100_000.0),
];

pub fn describe(id: SettingId) -> Option<&'static SettingDescriptor> {
    VFD_SETTINGS.iter().find(|d| d.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::MemoryStore;

    #[test]
    fn test_encode_decode() {
        let mut settings = VfdSettings::default();
        settings.vfd_rpm_hz = 50;
        settings.modbus_address[1] = 7;

        let blob = settings.encode().unwrap();
        assert_eq!(VfdSettings::decode(&blob).unwrap(), settings);
    }

    #[test]
    fn test_corrupt_blob_restores_defaults() {
        let mut settings = VfdSettings::default();
        settings.vfd_rpm_hz = 24;
        let mut blob = settings.encode().unwrap();
        blob[2] ^= 0xFF;

        let mut store = MemoryStore::with_contents(blob);
        let loaded = VfdSettings::load(&mut store);

        assert_eq!(loaded, VfdSettings::default());
        assert_eq!(store.saves(), 1);
        assert_eq!(
            VfdSettings::decode(&store.contents().unwrap()).unwrap(),
            VfdSettings::default()
        );
    }

    #[test]
    fn test_missing_blob_restores_defaults() {
        let mut store = MemoryStore::new();
        let loaded = VfdSettings::load(&mut store);
        assert_eq!(loaded, VfdSettings::default());
        assert!(store.contents().is_some());
    }

    #[test]
    fn test_load_keeps_valid_settings() {
        let mut settings = VfdSettings::default();
        settings.run_cw_cmd = 0x0001;
        let mut store = MemoryStore::new();
        settings.save(&mut store).unwrap();

        assert_eq!(VfdSettings::load(&mut store), settings);
        assert_eq!(store.saves(), 1);
    }

    #[test]
    fn test_validate_rejects_zero_divider() {
        let mut settings = VfdSettings::default();
        settings.in_divider = 0.0;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::Invalid { name: "in_divider", .. })
        ));
    }

    #[test]
    fn test_set_by_id() {
        let mut settings = VfdSettings::default();
        settings.set(SettingId::RpmPerHz, 24.0).unwrap();
        settings.set(SettingId::ModbusAddress(2), 9.0).unwrap();
        assert_eq!(settings.vfd_rpm_hz, 24);
        assert_eq!(settings.address(2), 9);

        assert!(settings.set(SettingId::RpmPerHz, 0.0).is_err());
        assert!(settings.set(SettingId::ModbusAddress(0), 300.0).is_err());
        assert_eq!(settings.vfd_rpm_hz, 24);
    }

    #[test]
    fn test_set_rounds_instead_of_truncating() {
        let mut settings = VfdSettings::default();
        settings.set(SettingId::RpmPerHz, 59.6).unwrap();
        assert_eq!(settings.vfd_rpm_hz, 60);

        assert!(settings.set(SettingId::StopCommand, f32::NAN).is_err());
        assert_eq!(integer::<u8>("modbus_address", 255.4).unwrap(), 255);
        assert!(integer::<u8>("modbus_address", 256.0).is_err());
        assert!(integer::<u16>("runstop_reg", -1.0).is_err());
        assert!(integer::<u16>("runstop_reg", 70_000.0).is_err());
    }

    #[test]
    fn test_address_slot_fallback() {
        let mut settings = VfdSettings::default();
        settings.modbus_address[0] = 3;
        assert_eq!(settings.address(VFD_N_ADDRESSES + 1), 3);
    }

    #[test]
    fn test_every_setting_is_described() {
        assert_eq!(VFD_SETTINGS.len(), VFD_N_ADDRESSES + 11);
        assert!(describe(SettingId::OutDivider).is_some());
    }
}
