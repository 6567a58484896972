//! H-100 protocol
//!
//! Run and direction are coils, frequency is a holding register in 0.1 Hz.
//! The drive's frequency limits (F011 lower, F005 upper) are read on
//! selection and clamp every speed command.

use super::{requests, to_word, Decoded, Requests, VfdProtocol};
use crate::error::ModbusResult;
use crate::message::{Context, ModbusMessage, Reply};
use crate::spindle::{PluginInfo, SpindleState};

const COIL_RUN_FWD: u16 = 0x0049;
const COIL_RUN_REV: u16 = 0x004A;
const COIL_STOP: u16 = 0x004B;

const REG_FREQUENCY: u16 = 0x0200;
const REG_OUTPUT_FREQUENCY: u16 = 0x0000;
const REG_MIN_FREQUENCY: u16 = 0x000B;
const REG_MAX_FREQUENCY: u16 = 0x0005;

/// 0.1 Hz on a two-pole spindle
const RPM_PER_UNIT: f32 = 6.0;

#[derive(Debug, Clone, Default)]
pub struct H100 {
    freq_min: u16,
    freq_max: u16,
}

impl H100 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frequency limits in 0.1 Hz
    pub fn limits(&self) -> (u16, u16) {
        (self.freq_min, self.freq_max)
    }

    fn frequency(&self, rpm: f32) -> u16 {
        let freq = to_word(rpm / RPM_PER_UNIT);
        if self.freq_max > self.freq_min {
            freq.clamp(self.freq_min, self.freq_max)
        } else {
            freq
        }
    }
}

impl VfdProtocol for H100 {
    fn plugin(&self) -> PluginInfo {
        PluginInfo {
            name: "H-100 VFD",
            version: "0.02",
        }
    }

    fn run_command(&self, slave: u8, state: SpindleState, rpm: f32) -> ModbusResult<ModbusMessage> {
        let coil = if !state.on || rpm == 0.0 {
            COIL_STOP
        } else if state.ccw {
            COIL_RUN_REV
        } else {
            COIL_RUN_FWD
        };
        ModbusMessage::write_coil(Context::SetStatus, slave, coil, true)
            .map(ModbusMessage::without_crc_check)
    }

    fn speed_command(&self, slave: u8, rpm: f32) -> ModbusResult<ModbusMessage> {
        ModbusMessage::write_register(Context::SetRpm, slave, REG_FREQUENCY, self.frequency(rpm))
            .map(ModbusMessage::without_crc_check)
    }

    fn status_queries(&self, slave: u8) -> ModbusResult<Requests> {
        requests([ModbusMessage::read_input_registers(
            Context::GetRpm,
            slave,
            REG_OUTPUT_FREQUENCY,
            2,
        )
        .map(ModbusMessage::without_crc_check)])
    }

    fn interrogation(&mut self, slave: u8) -> ModbusResult<Requests> {
        requests([
            ModbusMessage::read_holding_registers(Context::GetMinRpm, slave, REG_MIN_FREQUENCY, 1)
                .map(ModbusMessage::without_crc_check),
            ModbusMessage::read_holding_registers(Context::GetMaxRpm, slave, REG_MAX_FREQUENCY, 1)
                .map(ModbusMessage::without_crc_check),
        ])
    }

    fn decode(&mut self, reply: &Reply) -> Decoded {
        let value = match reply.context {
            Context::GetRpm | Context::GetMinRpm | Context::GetMaxRpm => match reply.u16_at(3) {
                Some(value) => value,
                None => return Decoded::Invalid,
            },
            _ => return Decoded::Ack,
        };

        match reply.context {
            Context::GetMinRpm => {
                self.freq_min = value;
                Decoded::RpmMin(value as f32 * RPM_PER_UNIT)
            }
            Context::GetMaxRpm => {
                self.freq_max = value;
                Decoded::RpmMax(value as f32 * RPM_PER_UNIT)
            }
            _ => Decoded::Rpm(value as f32 * RPM_PER_UNIT),
        }
    }
}
