//! Huanyang P2A protocol
//!
//! Standard FC03/FC06 register access. Speed is programmed as a fraction of
//! the drive's maximum RPM in units of 0.01 %, so the maximum is read back on
//! selection. P2A firmware is known to emit bad checksums; CRC verification is
//! disabled for every request.

use super::{requests, to_word, Decoded, Requests, VfdProtocol};
use crate::error::ModbusResult;
use crate::message::{Context, ModbusMessage, Reply};
use crate::spindle::{PluginInfo, SpindleState};

const REG_SPEED: u16 = 0x1000;
const REG_CONTROL: u16 = 0x2000;
const REG_RPM: u16 = 0x700C;
const REG_MAX_RPM: u16 = 0xB005;

const CMD_RUN_FWD: u16 = 1;
const CMD_RUN_REV: u16 = 2;
const CMD_STOP: u16 = 6;

const DEFAULT_MAX_RPM: f32 = 24_000.0;

#[derive(Debug, Clone)]
pub struct HuanyangP2a {
    rpm_max: f32,
}

impl HuanyangP2a {
    pub fn new() -> Self {
        Self {
            rpm_max: DEFAULT_MAX_RPM,
        }
    }

    pub fn rpm_max(&self) -> f32 {
        self.rpm_max
    }
}

impl Default for HuanyangP2a {
    fn default() -> Self {
        Self::new()
    }
}

impl VfdProtocol for HuanyangP2a {
    fn plugin(&self) -> PluginInfo {
        PluginInfo {
            name: "HUANYANG P2A VFD",
            version: "0.12",
        }
    }

    fn run_command(&self, slave: u8, state: SpindleState, rpm: f32) -> ModbusResult<ModbusMessage> {
        let cmd = if !state.on || rpm == 0.0 {
            CMD_STOP
        } else if state.ccw {
            CMD_RUN_REV
        } else {
            CMD_RUN_FWD
        };
        Ok(ModbusMessage::write_register(Context::SetStatus, slave, REG_CONTROL, cmd)?.without_crc_check())
    }

    fn speed_command(&self, slave: u8, rpm: f32) -> ModbusResult<ModbusMessage> {
        let data = to_word(rpm * 10_000.0 / self.rpm_max);
        Ok(ModbusMessage::write_register(Context::SetRpm, slave, REG_SPEED, data)?.without_crc_check())
    }

    fn status_queries(&self, slave: u8) -> ModbusResult<Requests> {
        requests([ModbusMessage::read_holding_registers(Context::GetRpm, slave, REG_RPM, 1)
            .map(ModbusMessage::without_crc_check)])
    }

    fn interrogation(&mut self, slave: u8) -> ModbusResult<Requests> {
        requests([
            ModbusMessage::read_holding_registers(Context::GetMaxRpm, slave, REG_MAX_RPM, 1)
                .map(ModbusMessage::without_crc_check),
        ])
    }

    fn decode(&mut self, reply: &Reply) -> Decoded {
        match reply.context {
            Context::GetRpm => reply
                .u16_at(3)
                .map_or(Decoded::Invalid, |value| Decoded::Rpm(value as f32)),
            Context::GetMaxRpm => match reply.u16_at(3) {
                Some(value) if value > 0 => {
                    self.rpm_max = value as f32;
                    Decoded::Ack
                }
                _ => Decoded::Invalid,
            },
            _ => Decoded::Ack,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedVfd;
    use crate::spindle::SpindleDriver;
    use crate::vfd::testing::Harness;
    use crate::vfd::VfdSpindle;

    #[test]
    fn test_requests_skip_crc_check() {
        let protocol = HuanyangP2a::new();
        let run = protocol.run_command(1, SpindleState::ccw(), 100.0).unwrap();
        assert!(!run.crc_check);
        assert_eq!(run.adu.as_slice(), &[0x01, 0x06, 0x20, 0x00, 0x00, 0x02]);

        let stop = protocol.run_command(1, SpindleState::OFF, 100.0).unwrap();
        assert_eq!(stop.adu.u16_at(4), Some(CMD_STOP));
    }

    #[test]
    fn test_speed_relative_to_max_rpm() {
        let device = SimulatedVfd::new(1).with_register(REG_MAX_RPM, 18_000).shared();
        let mut harness = Harness::with_device(&device);
        let mut spindle = VfdSpindle::new(HuanyangP2a::new());

        harness.run(&mut spindle, |s, ctx| s.on_selected(ctx, 1));
        assert_eq!(spindle.protocol().rpm_max(), 18_000.0);

        harness.run(&mut spindle, |s, ctx| s.set_state(ctx, SpindleState::cw(), 9_000.0));
        let writes = device.borrow().writes().to_vec();
        assert_eq!(writes, vec![(REG_CONTROL, CMD_RUN_FWD), (REG_SPEED, 5_000)]);
    }

    #[test]
    fn test_zero_max_rpm_keeps_default() {
        let mut protocol = HuanyangP2a::new();
        let reply = Reply {
            context: Context::GetMaxRpm,
            adu: crate::adu::Adu::from_slice(&[0x01, 0x03, 0x02, 0x00, 0x00, 0xB8, 0x44]).unwrap(),
        };
        assert_eq!(protocol.decode(&reply), Decoded::Invalid);
        assert_eq!(protocol.rpm_max(), DEFAULT_MAX_RPM);
    }
}
