//! Durapulse GS20 protocol
//!
//! Delta-style command block at 0x2000. Frequency is in 0.01 Hz and scaled
//! through the configured RPM per Hz.

use super::{requests, to_word, Decoded, Requests, VfdProtocol};
use crate::error::ModbusResult;
use crate::message::{Context, ModbusMessage, Reply};
use crate::settings::VfdSettings;
use crate::spindle::{PluginInfo, SpindleState};

pub(crate) const REG_CONTROL: u16 = 0x2000;
pub(crate) const REG_FREQUENCY: u16 = 0x2001;
const REG_OUTPUT_FREQUENCY: u16 = 0x2103;

const RUN: u16 = 0x02;
const STOP: u16 = 0x01;
const FORWARD: u16 = 0x10;
const REVERSE: u16 = 0x20;

/// Direction and run bits shared by the Delta-derived drives
pub(crate) fn control_word(state: SpindleState, rpm: f32) -> u16 {
    let direction = if state.ccw { REVERSE } else { FORWARD };
    let runstop = if !state.on || rpm == 0.0 { STOP } else { RUN };
    direction | runstop
}

#[derive(Debug, Clone)]
pub struct Gs20 {
    rpm_hz: f32,
}

impl Gs20 {
    pub fn new(settings: &VfdSettings) -> Self {
        Self {
            rpm_hz: settings.vfd_rpm_hz as f32,
        }
    }

    pub fn rpm_per_hz(&self) -> f32 {
        self.rpm_hz
    }
}

impl Default for Gs20 {
    fn default() -> Self {
        Self::new(&VfdSettings::default())
    }
}

impl VfdProtocol for Gs20 {
    fn plugin(&self) -> PluginInfo {
        PluginInfo {
            name: "Durapulse GS20",
            version: "0.05",
        }
    }

    fn run_command(&self, slave: u8, state: SpindleState, rpm: f32) -> ModbusResult<ModbusMessage> {
        ModbusMessage::write_register(Context::SetStatus, slave, REG_CONTROL, control_word(state, rpm))
            .map(ModbusMessage::without_crc_check)
    }

    fn speed_command(&self, slave: u8, rpm: f32) -> ModbusResult<ModbusMessage> {
        let data = to_word(rpm * 100.0 / self.rpm_hz);
        ModbusMessage::write_register(Context::SetRpm, slave, REG_FREQUENCY, data)
            .map(ModbusMessage::without_crc_check)
    }

    fn status_queries(&self, slave: u8) -> ModbusResult<Requests> {
        requests([ModbusMessage::read_holding_registers(
            Context::GetRpm,
            slave,
            REG_OUTPUT_FREQUENCY,
            1,
        )
        .map(ModbusMessage::without_crc_check)])
    }

    fn decode(&mut self, reply: &Reply) -> Decoded {
        match reply.context {
            Context::GetRpm => reply
                .u16_at(3)
                .map_or(Decoded::Invalid, |f| Decoded::Rpm(f as f32 * self.rpm_hz / 100.0)),
            _ => Decoded::Ack,
        }
    }

    fn apply_settings(&mut self, settings: &VfdSettings) {
        self.rpm_hz = settings.vfd_rpm_hz as f32;
    }
}
