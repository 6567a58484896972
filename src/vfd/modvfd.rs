//! User-configurable VFD
//!
//! Registers, command words and RPM scaling all come from [`VfdSettings`], so
//! any drive with a single run/stop register and a frequency register pair
//! can be driven without a dedicated adapter.

use super::{requests, to_word, Decoded, Requests, VfdProtocol};
use crate::error::ModbusResult;
use crate::message::{Context, ModbusMessage, Reply};
use crate::settings::VfdSettings;
use crate::spindle::{PluginInfo, SpindleState};

#[derive(Debug, Clone)]
pub struct ModVfd {
    config: VfdSettings,
}

impl ModVfd {
    pub fn new(settings: &VfdSettings) -> Self {
        Self {
            config: settings.clone(),
        }
    }

    pub fn config(&self) -> &VfdSettings {
        &self.config
    }

    fn to_rpm(&self, value: u16) -> f32 {
        value as f32 * (self.config.out_multiplier / self.config.out_divider)
    }
}

impl Default for ModVfd {
    fn default() -> Self {
        Self::new(&VfdSettings::default())
    }
}

impl VfdProtocol for ModVfd {
    fn plugin(&self) -> PluginInfo {
        PluginInfo {
            name: "MODVFD",
            version: "0.03",
        }
    }

    fn run_command(&self, slave: u8, state: SpindleState, rpm: f32) -> ModbusResult<ModbusMessage> {
        let cmd = if !state.on || rpm == 0.0 {
            self.config.stop_cmd
        } else if state.ccw {
            self.config.run_ccw_cmd
        } else {
            self.config.run_cw_cmd
        };
        // run/stop is the only command whose reply CRC is verified
        ModbusMessage::write_register(Context::SetStatus, slave, self.config.runstop_reg, cmd)
    }

    fn speed_command(&self, slave: u8, rpm: f32) -> ModbusResult<ModbusMessage> {
        let data = to_word(rpm / self.config.in_divider * self.config.in_multiplier);
        ModbusMessage::write_register(Context::SetRpm, slave, self.config.set_freq_reg, data)
            .map(ModbusMessage::without_crc_check)
    }

    fn status_queries(&self, slave: u8) -> ModbusResult<Requests> {
        requests([ModbusMessage::read_holding_registers(
            Context::GetRpm,
            slave,
            self.config.get_freq_reg,
            1,
        )
        .map(ModbusMessage::without_crc_check)])
    }

    fn decode(&mut self, reply: &Reply) -> Decoded {
        match reply.context {
            Context::GetRpm => reply
                .u16_at(3)
                .map_or(Decoded::Invalid, |f| Decoded::Rpm(self.to_rpm(f))),
            _ => Decoded::Ack,
        }
    }

    fn apply_settings(&mut self, settings: &VfdSettings) {
        self.config = settings.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adu::Adu;

    #[test]
    fn test_default_map_matches_gs20_layout() {
        let protocol = ModVfd::default();
        let run = protocol.run_command(1, SpindleState::cw(), 3000.0).unwrap();
        assert_eq!(run.adu.as_slice(), &[0x01, 0x06, 0x20, 0x00, 0x00, 0x12]);

        // 3000 / 60 * 50
        let speed = protocol.speed_command(1, 3000.0).unwrap();
        assert_eq!(speed.adu.u16_at(4), Some(2500));
    }

    #[test]
    fn test_reconfigured_registers() {
        let mut protocol = ModVfd::default();
        let settings = VfdSettings {
            runstop_reg: 0x1000,
            set_freq_reg: 0x1001,
            get_freq_reg: 0x3000,
            stop_cmd: 0x05,
            in_multiplier: 1.0,
            in_divider: 1.0,
            out_multiplier: 1.0,
            out_divider: 2.0,
            ..VfdSettings::default()
        };
        protocol.apply_settings(&settings);

        let stop = protocol.run_command(7, SpindleState::OFF, 0.0).unwrap();
        assert_eq!(stop.adu.as_slice(), &[0x07, 0x06, 0x10, 0x00, 0x00, 0x05]);

        let speed = protocol.speed_command(7, 1234.0).unwrap();
        assert_eq!(speed.adu.u16_at(2), Some(0x1001));
        assert_eq!(speed.adu.u16_at(4), Some(1234));

        let reply = Reply {
            context: Context::GetRpm,
            adu: Adu::from_slice(&[0x07, 0x03, 0x02, 0x03, 0xE8, 0x00, 0x00]).unwrap(),
        };
        assert_eq!(protocol.decode(&reply), Decoded::Rpm(500.0));
    }
}
