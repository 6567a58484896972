//! Spindle capability contract
//!
//! The motion core drives every spindle, VFD or not, through
//! [`SpindleDriver`]. Drivers never own the bus, alarm channel or settings;
//! the registry lends them for the duration of one call via [`SpindleContext`].

use crate::alarm::AlarmChannel;
use crate::constants::RPM_INVALID;
use crate::engine::{Completion, ModbusBus};
use crate::message::{Context, Failure, Reply};
use crate::settings::{SpindleSettings, VfdSettings};

/// Stable registry identifier
pub type SpindleId = u8;

/// Kind of spindle implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpindleType {
    Basic,
    Pwm,
    Vfd,
    Stepper,
}

/// Capability flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpindleCaps {
    pub variable: bool,
    pub direction: bool,
    pub at_speed: bool,
    /// Controlled by bus commands rather than GPIO
    pub cmd_controlled: bool,
}

impl SpindleCaps {
    pub const NONE: Self = Self {
        variable: false,
        direction: false,
        at_speed: false,
        cmd_controlled: false,
    };

    pub const VFD: Self = Self {
        variable: true,
        direction: true,
        at_speed: true,
        cmd_controlled: true,
    };
}

/// Static capability record, only the RPM range changes after registration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpindleDescriptor {
    pub kind: SpindleType,
    pub caps: SpindleCaps,
    pub rpm_min: f32,
    pub rpm_max: f32,
    /// Range was read back from the device and overrides settings
    pub rpm_range_locked: bool,
}

impl SpindleDescriptor {
    pub fn vfd() -> Self {
        Self {
            kind: SpindleType::Vfd,
            caps: SpindleCaps::VFD,
            rpm_min: 0.0,
            rpm_max: 24_000.0,
            rpm_range_locked: false,
        }
    }

    pub fn with_caps(mut self, caps: SpindleCaps) -> Self {
        self.caps = caps;
        self
    }

    pub fn with_range(mut self, rpm_min: f32, rpm_max: f32) -> Self {
        self.rpm_min = rpm_min;
        self.rpm_max = rpm_max;
        self
    }
}

/// Identification line for option reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: &'static str,
    pub version: &'static str,
}

impl PluginInfo {
    pub fn report_line(&self) -> String {
        format!("[PLUGIN:{} v{}]", self.name, self.version)
    }
}

/// On/off, direction and at-speed flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpindleState {
    pub on: bool,
    pub ccw: bool,
    pub at_speed: bool,
}

impl SpindleState {
    pub const OFF: Self = Self {
        on: false,
        ccw: false,
        at_speed: false,
    };

    pub fn cw() -> Self {
        Self {
            on: true,
            ..Self::OFF
        }
    }

    pub fn ccw() -> Self {
        Self {
            on: true,
            ccw: true,
            at_speed: false,
        }
    }
}

/// What the caller of [`SpindleDriver::get_data`] is after
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRequest {
    Rpm,
    AngularPosition,
    Counters,
}

/// Cached speed data
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpindleData {
    /// Last confirmed speed
    pub rpm: f32,
    /// Last commanded speed, [`RPM_INVALID`] forces the next write
    pub rpm_programmed: f32,
    pub rpm_low_limit: f32,
    pub rpm_high_limit: f32,
    pub state_programmed: SpindleState,
    pub angular_position: f32,
    pub index_count: u32,
    pub pulse_count: u32,
}

impl Default for SpindleData {
    fn default() -> Self {
        Self {
            rpm: 0.0,
            rpm_programmed: RPM_INVALID,
            rpm_low_limit: 0.0,
            rpm_high_limit: 0.0,
            state_programmed: SpindleState::OFF,
            angular_position: 0.0,
            index_count: 0,
            pulse_count: 0,
        }
    }
}

impl SpindleData {
    /// Derive the at-speed window from a commanded speed.
    /// `tolerance` is in percent.
    pub fn set_at_speed_range(&mut self, rpm: f32, tolerance: f32) {
        self.rpm_programmed = rpm;
        if tolerance > 0.0 {
            let t = tolerance / 100.0;
            self.rpm_low_limit = rpm * (1.0 - t);
            self.rpm_high_limit = rpm * (1.0 + t);
        } else {
            self.rpm_low_limit = rpm;
            self.rpm_high_limit = rpm;
        }
    }

    /// Tolerance of zero or less disables the window
    pub fn is_at_speed(&self, measured: f32, tolerance: f32) -> bool {
        tolerance <= 0.0 || (measured >= self.rpm_low_limit && measured <= self.rpm_high_limit)
    }
}

/// Higher resolution speed source, typically a spindle encoder
pub trait EncoderFeed {
    fn data(&mut self, request: DataRequest) -> SpindleData;
}

/// Shared resources lent to a driver for one call
pub struct SpindleContext<'a> {
    pub spindle: SpindleId,
    pub bus: &'a mut dyn ModbusBus,
    pub alarms: &'a mut AlarmChannel,
    pub settings: &'a SpindleSettings,
    pub encoder: Option<&'a mut Box<dyn EncoderFeed>>,
}

impl SpindleContext<'_> {
    /// Encoder-derived speed when a feed is attached
    pub fn encoder_rpm(&mut self) -> Option<f32> {
        self.encoder
            .as_mut()
            .map(|encoder| encoder.data(DataRequest::Rpm).rpm)
    }
}

/// Uniform spindle operations consumed by the motion core
pub trait SpindleDriver: Completion {
    fn descriptor(&self) -> &SpindleDescriptor;

    fn plugin(&self) -> Option<PluginInfo> {
        None
    }

    /// Whether the spindle can be driven right now; idempotent
    fn config(&mut self, ctx: &mut SpindleContext<'_>) -> bool;

    fn set_state(&mut self, ctx: &mut SpindleContext<'_>, state: SpindleState, rpm: f32);

    /// Cached state, never waits on the device
    fn get_state(&mut self, ctx: &mut SpindleContext<'_>) -> SpindleState;

    fn update_rpm(&mut self, ctx: &mut SpindleContext<'_>, rpm: f32);

    fn get_data(&mut self, ctx: &mut SpindleContext<'_>, request: DataRequest) -> SpindleData;

    /// Load in percent of rated current
    fn get_load(&self) -> Option<f32> {
        None
    }

    fn has_load(&self) -> bool {
        false
    }

    /// Engage the spindle at bus `address`
    fn on_selected(&mut self, _ctx: &mut SpindleContext<'_>, _address: u8) {}

    fn on_deselected(&mut self, _ctx: &mut SpindleContext<'_>) {}

    fn on_driver_reset(&mut self, _ctx: &mut SpindleContext<'_>) {}

    fn on_settings_changed(&mut self, _spindle: &SpindleSettings, _vfd: &VfdSettings) {}
}

/// Inert spindle substituted when a failing one is disabled
#[derive(Debug, Clone)]
pub struct NullSpindle {
    descriptor: SpindleDescriptor,
}

impl NullSpindle {
    pub fn new() -> Self {
        Self {
            descriptor: SpindleDescriptor {
                kind: SpindleType::Basic,
                caps: SpindleCaps::NONE,
                rpm_min: 0.0,
                rpm_max: 0.0,
                rpm_range_locked: true,
            },
        }
    }
}

impl Default for NullSpindle {
    fn default() -> Self {
        Self::new()
    }
}

impl Completion for NullSpindle {
    fn on_reply(&mut self, _ctx: &mut SpindleContext<'_>, _reply: &Reply) {}

    fn on_exception(&mut self, _ctx: &mut SpindleContext<'_>, _failure: Failure, _context: Context) {}
}

impl SpindleDriver for NullSpindle {
    fn descriptor(&self) -> &SpindleDescriptor {
        &self.descriptor
    }

    fn config(&mut self, _ctx: &mut SpindleContext<'_>) -> bool {
        true
    }

    fn set_state(&mut self, _ctx: &mut SpindleContext<'_>, _state: SpindleState, _rpm: f32) {}

    fn get_state(&mut self, _ctx: &mut SpindleContext<'_>) -> SpindleState {
        SpindleState::OFF
    }

    fn update_rpm(&mut self, _ctx: &mut SpindleContext<'_>, _rpm: f32) {}

    fn get_data(&mut self, _ctx: &mut SpindleContext<'_>, _request: DataRequest) -> SpindleData {
        SpindleData::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_speed_window() {
        let mut data = SpindleData::default();
        data.set_at_speed_range(3000.0, 5.0);

        assert!((data.rpm_low_limit - 2850.0).abs() < 0.01);
        assert!((data.rpm_high_limit - 3150.0).abs() < 0.01);
        assert!(data.is_at_speed(3000.0, 5.0));
        assert!(data.is_at_speed(2900.0, 5.0));
        assert!(!data.is_at_speed(2800.0, 5.0));
        assert!(!data.is_at_speed(3200.0, 5.0));
    }

    #[test]
    fn test_zero_tolerance_always_at_speed() {
        let mut data = SpindleData::default();
        data.set_at_speed_range(12_000.0, 0.0);
        assert!(data.is_at_speed(0.0, 0.0));
        assert!(data.is_at_speed(50_000.0, -1.0));
    }

    #[test]
    fn test_default_data_forces_first_write() {
        assert_eq!(SpindleData::default().rpm_programmed, RPM_INVALID);
    }

    #[test]
    fn test_plugin_report_line() {
        let info = PluginInfo {
            name: "Durapulse GS20",
            version: "0.05",
        };
        assert_eq!(info.report_line(), "[PLUGIN:Durapulse GS20 v0.05]");
    }

    #[test]
    fn test_state_constructors() {
        assert!(SpindleState::cw().on && !SpindleState::cw().ccw);
        assert!(SpindleState::ccw().on && SpindleState::ccw().ccw);
        assert_eq!(SpindleState::default(), SpindleState::OFF);
    }

    #[test]
    fn test_null_spindle_has_no_caps() {
        let null = NullSpindle::new();
        assert_eq!(null.descriptor().caps, SpindleCaps::NONE);
        assert!(!null.has_load());
    }
}
