//! Huanyang v1 protocol
//!
//! The original Huanyang drives predate the Modbus register model and reuse
//! standard function codes with their own payload layouts:
//!
//! | Function | Payload | Meaning |
//! |----------|---------|---------|
//! | 0x01 | `03 PD 00 00` | read parameter `PD` |
//! | 0x03 | `01 cmd` | control word |
//! | 0x04 | `03 item 00 00` | read status item |
//! | 0x05 | `02 hi lo` | set frequency, 0.01 Hz |
//!
//! Frequencies are scaled through PD144, the configured RPM at 50 Hz.

use tracing::debug;

use super::{requests, to_word, Decoded, Requests, VfdProtocol};
use crate::error::ModbusResult;
use crate::message::{Context, ModbusMessage, Reply};
use crate::spindle::{PluginInfo, SpindleState};
use crate::transport::SilenceTimeout;

const FC_READ_PARAMETER: u8 = 0x01;
const FC_CONTROL: u8 = 0x03;
const FC_READ_STATUS: u8 = 0x04;
const FC_WRITE_FREQUENCY: u8 = 0x05;

/// PD144, rated motor speed at 50 Hz
const PD_RPM_AT_50HZ: u8 = 0x90;
/// PD011, lower frequency limit
const PD_MIN_FREQUENCY: u8 = 0x0B;
/// PD005, maximum operating frequency
const PD_MAX_FREQUENCY: u8 = 0x05;
/// PD142, rated motor current in 0.1 A
const PD_RATED_AMPS: u8 = 0x8E;

const STATUS_FREQUENCY: u8 = 0x01;
const STATUS_AMPS: u8 = 0x02;

const CMD_RUN_FWD: u8 = 0x01;
const CMD_STOP: u8 = 0x08;
const CMD_RUN_REV: u8 = 0x11;

const DEFAULT_RPM_AT_50HZ: f32 = 3000.0;

/// Huanyang drives need a longer gap at the faster baud rates
pub const HUANYANG_SILENCE: SilenceTimeout = SilenceTimeout {
    b2400: 16,
    b4800: 8,
    b9600: 6,
    b19200: 6,
    b38400: 6,
    b115200: 6,
};

#[derive(Debug, Clone)]
pub struct Huanyang {
    rpm_at_50hz: f32,
    amps: f32,
    amps_max: f32,
}

impl Huanyang {
    pub fn new() -> Self {
        Self {
            rpm_at_50hz: DEFAULT_RPM_AT_50HZ,
            amps: 0.0,
            amps_max: 0.0,
        }
    }

    pub fn rpm_at_50hz(&self) -> f32 {
        self.rpm_at_50hz
    }

    pub fn amps(&self) -> f32 {
        self.amps
    }

    fn read_parameter(context: Context, slave: u8, pd: u8) -> ModbusResult<ModbusMessage> {
        ModbusMessage::raw(context, slave, FC_READ_PARAMETER, &[0x03, pd, 0x00, 0x00], 8)
            .map(ModbusMessage::without_crc_check)
    }

    fn read_status(context: Context, slave: u8, item: u8) -> ModbusResult<ModbusMessage> {
        ModbusMessage::raw(context, slave, FC_READ_STATUS, &[0x03, item, 0x00, 0x00], 8)
            .map(ModbusMessage::without_crc_check)
    }

    /// 0.01 Hz units back to RPM
    fn to_rpm(&self, value: u16) -> f32 {
        value as f32 * self.rpm_at_50hz / 5000.0
    }
}

impl Default for Huanyang {
    fn default() -> Self {
        Self::new()
    }
}

impl VfdProtocol for Huanyang {
    fn plugin(&self) -> PluginInfo {
        PluginInfo {
            name: "HUANYANG VFD",
            version: "0.11",
        }
    }

    fn silence(&self) -> Option<SilenceTimeout> {
        Some(HUANYANG_SILENCE)
    }

    fn run_command(&self, slave: u8, state: SpindleState, rpm: f32) -> ModbusResult<ModbusMessage> {
        let cmd = if !state.on || rpm == 0.0 {
            CMD_STOP
        } else if state.ccw {
            CMD_RUN_REV
        } else {
            CMD_RUN_FWD
        };
        ModbusMessage::raw(Context::SetStatus, slave, FC_CONTROL, &[0x01, cmd], 6)
            .map(ModbusMessage::without_crc_check)
    }

    fn speed_command(&self, slave: u8, rpm: f32) -> ModbusResult<ModbusMessage> {
        let data = to_word(rpm * 5000.0 / self.rpm_at_50hz);
        let [hi, lo] = data.to_be_bytes();
        ModbusMessage::raw(Context::SetRpm, slave, FC_WRITE_FREQUENCY, &[0x02, hi, lo], 7)
            .map(ModbusMessage::without_crc_check)
    }

    fn status_queries(&self, slave: u8) -> ModbusResult<Requests> {
        requests([
            Self::read_status(Context::GetRpm, slave, STATUS_FREQUENCY),
            Self::read_status(Context::GetAmps, slave, STATUS_AMPS),
        ])
    }

    fn interrogation(&mut self, slave: u8) -> ModbusResult<Requests> {
        // scaling must come from the drive, fallback only if it stays silent
        self.rpm_at_50hz = 0.0;
        requests([
            Self::read_parameter(Context::GetRpmAt50Hz, slave, PD_RPM_AT_50HZ),
            Self::read_parameter(Context::GetMinRpm, slave, PD_MIN_FREQUENCY),
            Self::read_parameter(Context::GetMaxRpm, slave, PD_MAX_FREQUENCY),
            Self::read_parameter(Context::GetMaxAmps, slave, PD_RATED_AMPS),
        ])
    }

    fn interrogation_done(&mut self) {
        if self.rpm_at_50hz <= 0.0 {
            debug!("PD144 unavailable, assuming {} RPM at 50 Hz", DEFAULT_RPM_AT_50HZ);
            self.rpm_at_50hz = DEFAULT_RPM_AT_50HZ;
        }
    }

    fn decode(&mut self, reply: &Reply) -> Decoded {
        let value = match reply.context {
            Context::SetRpm | Context::SetStatus => return Decoded::Ack,
            _ => match reply.u16_at(4) {
                Some(value) => value,
                None => return Decoded::Invalid,
            },
        };

        match reply.context {
            Context::GetRpm => Decoded::Rpm(self.to_rpm(value)),
            Context::GetMinRpm => Decoded::RpmMin(self.to_rpm(value)),
            Context::GetMaxRpm => Decoded::RpmMax(self.to_rpm(value)),
            Context::GetRpmAt50Hz => {
                self.rpm_at_50hz = value as f32;
                Decoded::Ack
            }
            Context::GetMaxAmps => {
                self.amps_max = value as f32 / 10.0;
                Decoded::Ack
            }
            Context::GetAmps => {
                self.amps = value as f32 / 10.0;
                Decoded::Ack
            }
            _ => Decoded::Ack,
        }
    }

    fn load(&self) -> Option<f32> {
        if self.amps_max > 0.0 {
            Some(self.amps / self.amps_max * 100.0)
        } else {
            Some(0.0)
        }
    }

    fn has_load(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::frame;
    use crate::spindle::SpindleDriver;
    use crate::vfd::testing::Harness;
    use crate::vfd::VfdSpindle;

    /// Answers the Huanyang framing from a fixed parameter table
    fn huanyang_device(request: &[u8]) -> Option<Vec<u8>> {
        let body = &request[..request.len() - 2];
        match (body[1], body.get(3).copied()) {
            (0x01, Some(PD_RPM_AT_50HZ)) => Some(frame(&[1, 0x01, 0x03, 0x90, 0x0B, 0xB8])),
            (0x01, Some(PD_MIN_FREQUENCY)) => Some(frame(&[1, 0x01, 0x03, 0x0B, 0x03, 0xE8])),
            (0x01, Some(PD_MAX_FREQUENCY)) => Some(frame(&[1, 0x01, 0x03, 0x05, 0x13, 0x88])),
            (0x01, Some(PD_RATED_AMPS)) => Some(frame(&[1, 0x01, 0x03, 0x8E, 0x00, 0x50])),
            (0x03, _) => Some(frame(&[1, 0x03, 0x01, body[3]])),
            (0x04, Some(STATUS_FREQUENCY)) => Some(frame(&[1, 0x04, 0x03, 0x01, 0x13, 0x88])),
            (0x04, Some(STATUS_AMPS)) => Some(frame(&[1, 0x04, 0x03, 0x02, 0x00, 0x28])),
            (0x05, _) => Some(request.to_vec()),
            _ => None,
        }
    }

    #[test]
    fn test_run_command_encoding() {
        let protocol = Huanyang::new();

        let run = protocol.run_command(1, SpindleState::cw(), 1000.0).unwrap();
        assert_eq!(run.adu.as_slice(), &[0x01, 0x03, 0x01, CMD_RUN_FWD]);
        assert_eq!(run.rx_length, 6);

        let rev = protocol.run_command(1, SpindleState::ccw(), 1000.0).unwrap();
        assert_eq!(rev.adu.as_slice()[3], CMD_RUN_REV);

        // zero speed stops even when on
        let zero = protocol.run_command(1, SpindleState::cw(), 0.0).unwrap();
        assert_eq!(zero.adu.as_slice()[3], CMD_STOP);
    }

    #[test]
    fn test_speed_scaled_by_rpm_at_50hz() {
        let protocol = Huanyang::new();
        let msg = protocol.speed_command(1, 1500.0).unwrap();
        // 1500 of 3000 RPM at 50 Hz is 25.00 Hz
        assert_eq!(msg.adu.as_slice(), &[0x01, 0x05, 0x02, 0x09, 0xC4]);
    }

    #[test]
    fn test_selection_interrogates_drive() {
        let mut harness = Harness::with_responder(Box::new(huanyang_device));
        let mut spindle = VfdSpindle::new(Huanyang::new());

        harness.run(&mut spindle, |s, ctx| s.on_selected(ctx, 1));

        assert_eq!(harness.engine.silence_ms(), 6);
        assert_eq!(spindle.protocol().rpm_at_50hz(), 3000.0);
        let descriptor = spindle.descriptor();
        // 10.00 Hz and 50.00 Hz at 3000 RPM per 50 Hz
        assert!((descriptor.rpm_min - 600.0).abs() < 0.01);
        assert!((descriptor.rpm_max - 3000.0).abs() < 0.01);
        assert!(descriptor.rpm_range_locked);
        assert_eq!(harness.transport.requests().len(), 4);
    }

    #[test]
    fn test_silent_drive_falls_back_to_default_scaling() {
        let mut harness = Harness::with_responder(Box::new(|_req: &[u8]| None));
        let mut spindle = VfdSpindle::with_policy(
            Huanyang::new(),
            crate::retry::RetryPolicy::default().with_max_retries(1),
        );

        harness.run(&mut spindle, |s, ctx| s.on_selected(ctx, 1));

        assert_eq!(spindle.protocol().rpm_at_50hz(), DEFAULT_RPM_AT_50HZ);
        assert!(!spindle.descriptor().rpm_range_locked);
        // two attempts at PD144, then the chain stops
        assert_eq!(harness.transport.requests().len(), 2);
    }

    #[test]
    fn test_load_from_amps() {
        let mut harness = Harness::with_responder(Box::new(huanyang_device));
        let mut spindle = VfdSpindle::new(Huanyang::new());

        harness.run(&mut spindle, |s, ctx| s.on_selected(ctx, 1));
        harness.run(&mut spindle, |s, ctx| s.get_state(ctx));
        harness.settle(&mut spindle, 20);

        // 4.0 A of 8.0 A rated
        assert!(spindle.has_load());
        assert_eq!(spindle.get_load(), Some(50.0));
        assert!((spindle.data().rpm - 3000.0).abs() < 0.01);
    }
}
