//! Nowforever protocol
//!
//! All writes use FC16. Frequency is in 0.01 Hz; the drive reports its
//! configured maximum and minimum frequency as a register pair at 0x0007.

use super::{requests, to_word, Decoded, Requests, VfdProtocol};
use crate::error::ModbusResult;
use crate::message::{Context, ModbusMessage, Reply};
use crate::spindle::{PluginInfo, SpindleState};

const REG_CONTROL: u16 = 0x0900;
const REG_FREQUENCY: u16 = 0x0901;
const REG_OUTPUT_FREQUENCY: u16 = 0x0502;
const REG_FREQUENCY_RANGE: u16 = 0x0007;

const CMD_STOP: u16 = 0x00;
const CMD_RUN_FWD: u16 = 0x01;
const CMD_RUN_REV: u16 = 0x03;

const RPM_PER_UNIT: f32 = 0.6;

#[derive(Debug, Clone, Default)]
pub struct Nowforever {
    freq_min: u16,
    freq_max: u16,
}

impl Nowforever {
    pub fn new() -> Self {
        Self::default()
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

impl VfdProtocol for Nowforever {
    fn plugin(&self) -> PluginInfo {
        PluginInfo {
            name: "Nowforever VFD",
            version: "0.01",
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
        ModbusMessage::write_registers(Context::SetStatus, slave, REG_CONTROL, &[cmd])
            .map(ModbusMessage::without_crc_check)
    }

    fn speed_command(&self, slave: u8, rpm: f32) -> ModbusResult<ModbusMessage> {
        ModbusMessage::write_registers(Context::SetRpm, slave, REG_FREQUENCY, &[self.frequency(rpm)])
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

    fn interrogation(&mut self, slave: u8) -> ModbusResult<Requests> {
        requests([ModbusMessage::read_holding_registers(
            Context::GetRpmRange,
            slave,
            REG_FREQUENCY_RANGE,
            2,
        )
        .map(ModbusMessage::without_crc_check)])
    }

    fn decode(&mut self, reply: &Reply) -> Decoded {
        match reply.context {
            Context::GetRpm => reply
                .u16_at(3)
                .map_or(Decoded::Invalid, |f| Decoded::Rpm(f as f32 * RPM_PER_UNIT)),
            Context::GetRpmRange => match (reply.u16_at(3), reply.u16_at(5)) {
                (Some(max), Some(min)) => {
                    self.freq_max = max;
                    self.freq_min = min;
                    Decoded::RpmRange {
                        min: min as f32 * RPM_PER_UNIT,
                        max: max as f32 * RPM_PER_UNIT,
                    }
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
    fn test_writes_use_fc16() {
        let protocol = Nowforever::new();
        let run = protocol.run_command(1, SpindleState::ccw(), 100.0).unwrap();
        assert_eq!(
            run.adu.as_slice(),
            &[0x01, 0x10, 0x09, 0x00, 0x00, 0x01, 0x02, 0x00, 0x03]
        );
        assert_eq!(run.rx_length, 8);

        let speed = protocol.speed_command(1, 18_000.0).unwrap();
        assert_eq!(speed.adu.u16_at(7), Some(30_000));
    }

    #[test]
    fn test_range_read_and_clamp() {
        let device = SimulatedVfd::new(1)
            .with_register(REG_FREQUENCY_RANGE, 40_000)
            .with_register(REG_FREQUENCY_RANGE + 1, 10_000)
            .shared();
        let mut harness = Harness::with_device(&device);
        let mut spindle = VfdSpindle::new(Nowforever::new());

        harness.run(&mut spindle, |s, ctx| s.on_selected(ctx, 1));

        let descriptor = *spindle.descriptor();
        assert!((descriptor.rpm_min - 6_000.0).abs() < 0.1);
        assert!((descriptor.rpm_max - 24_000.0).abs() < 0.1);

        harness.run(&mut spindle, |s, ctx| s.set_state(ctx, SpindleState::cw(), 30_000.0));
        assert_eq!(device.borrow().register(REG_CONTROL), CMD_RUN_FWD);
        assert_eq!(device.borrow().register(REG_FREQUENCY), 40_000);
    }
}
