//! Yalang YL620A protocol
//!
//! Same control word layout as the GS20, frequency in 0.1 Hz.
//!
//! Drive parameters to set before use:
//!
//! | Parameter | Value | Meaning |
//! |-----------|-------|---------|
//! | P00.01 | 3 | command source: RS485 |
//! | P03.00 | 3 | baud rate 19200 |
//! | P03.01 | 1 | slave address |
//! | P07.08 | 5 | frequency source: RS485 |

use super::gs20::{control_word, REG_CONTROL, REG_FREQUENCY};
use super::{requests, to_word, Decoded, Requests, VfdProtocol};
use crate::error::ModbusResult;
use crate::message::{Context, ModbusMessage, Reply};
use crate::settings::VfdSettings;
use crate::spindle::{PluginInfo, SpindleState};

const REG_OUTPUT_FREQUENCY: u16 = 0x200B;

#[derive(Debug, Clone)]
pub struct Yl620 {
    rpm_hz: f32,
}

impl Yl620 {
    pub fn new(settings: &VfdSettings) -> Self {
        Self {
            rpm_hz: settings.vfd_rpm_hz as f32,
        }
    }
}

impl Default for Yl620 {
    fn default() -> Self {
        Self::new(&VfdSettings::default())
    }
}

impl VfdProtocol for Yl620 {
    fn plugin(&self) -> PluginInfo {
        PluginInfo {
            name: "Yalang VFD YL620A",
            version: "0.02",
        }
    }

    fn run_command(&self, slave: u8, state: SpindleState, rpm: f32) -> ModbusResult<ModbusMessage> {
        ModbusMessage::write_register(Context::SetStatus, slave, REG_CONTROL, control_word(state, rpm))
            .map(ModbusMessage::without_crc_check)
    }

    fn speed_command(&self, slave: u8, rpm: f32) -> ModbusResult<ModbusMessage> {
        let data = to_word(rpm * 10.0 / self.rpm_hz);
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
                .map_or(Decoded::Invalid, |f| Decoded::Rpm(f as f32 * self.rpm_hz / 10.0)),
            _ => Decoded::Ack,
        }
    }

    fn apply_settings(&mut self, settings: &VfdSettings) {
        self.rpm_hz = settings.vfd_rpm_hz as f32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adu::Adu;

    #[test]
    fn test_speed_in_tenth_hz() {
        let protocol = Yl620::default();
        // 12000 RPM at 60 RPM/Hz is 200.0 Hz
        let msg = protocol.speed_command(1, 12_000.0).unwrap();
        assert_eq!(msg.adu.u16_at(2), Some(REG_FREQUENCY));
        assert_eq!(msg.adu.u16_at(4), Some(2000));
    }

    #[test]
    fn test_decode_output_frequency() {
        let mut protocol = Yl620::default();
        let reply = Reply {
            context: Context::GetRpm,
            adu: Adu::from_slice(&[0x01, 0x03, 0x02, 0x07, 0xD0, 0x00, 0x00]).unwrap(),
        };
        assert_eq!(protocol.decode(&reply), Decoded::Rpm(12_000.0));
    }

    #[test]
    fn test_status_reads_output_frequency() {
        let queries = Yl620::default().status_queries(3).unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].adu.as_slice(), &[0x03, 0x03, 0x20, 0x0B, 0x00, 0x01]);
        assert_eq!(queries[0].rx_length, 7);
    }
}
