//! # VFD Spindle Adapters
//!
//! Every drive family is a [`VfdProtocol`]: a table of request encodings and
//! a reply decoder. [`VfdSpindle`] wraps any protocol with the behaviour all
//! families share, so retries, busy guards, at-speed tracking and encoder
//! preference are implemented once.
//!
//! ## Supported Families
//!
//! | Family | Run/stop | Speed | Status read |
//! |--------|----------|-------|-------------|
//! | Huanyang v1 | proprietary FC03 | proprietary FC05 | proprietary FC04 |
//! | Huanyang P2A | FC06 0x2000 | FC06 0x1000 | FC03 0x700C |
//! | Durapulse GS20 | FC06 0x2000 | FC06 0x2001 | FC03 0x2103 |
//! | H-100 | FC05 coils 0x49-0x4B | FC06 0x0200 | FC04 0x0000 |
//! | Yalang YL620A | FC06 0x2000 | FC06 0x2001 | FC03 0x200B |
//! | Nowforever | FC16 0x0900 | FC16 0x0901 | FC03 0x0502 |
//! | MODVFD | configured | configured | configured |
//!
//! ## Operation Order
//!
//! `set_state` sends the run/stop command blocking and retried, and only
//! when that succeeds the speed command. `update_rpm` is non-blocking and is
//! dropped while a previous speed write is still in flight: the newer value
//! supersedes it, and the next call after completion carries the latest speed.

pub mod gs20;
pub mod h100;
pub mod huanyang;
pub mod huanyang_p2a;
pub mod modvfd;
pub mod nowforever;
pub mod yl620;

pub use gs20::Gs20;
pub use h100::H100;
pub use huanyang::Huanyang;
pub use huanyang_p2a::HuanyangP2a;
pub use modvfd::ModVfd;
pub use nowforever::Nowforever;
pub use yl620::Yl620;

use heapless::Vec as HVec;
use tracing::{debug, trace, warn};

use crate::constants::{RPM_INVALID, VFD_POLL_INTERVAL_MS};
use crate::engine::Completion;
use crate::error::ModbusResult;
use crate::message::{Context, Failure, ModbusMessage, Reply, TransactionOutcome};
use crate::retry::{RetryDecision, RetryPolicy, RetryState};
use crate::settings::{SpindleSettings, VfdSettings};
use crate::spindle::{
    DataRequest, PluginInfo, SpindleContext, SpindleData, SpindleDescriptor, SpindleDriver,
    SpindleState,
};
use crate::transport::SilenceTimeout;

/// Requests issued as one batch
pub type Requests = HVec<ModbusMessage, 4>;

/// What a reply meant
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decoded {
    /// Write acknowledged or nothing to record
    Ack,
    Rpm(f32),
    RpmMin(f32),
    RpmMax(f32),
    RpmRange { min: f32, max: f32 },
    /// Reply did not carry what the context promised
    Invalid,
}

/// Wire encoding for one VFD family
pub trait VfdProtocol {
    fn plugin(&self) -> PluginInfo;

    /// Silence table applied when selected
    fn silence(&self) -> Option<SilenceTimeout> {
        None
    }

    /// Run/stop and direction command, tagged [`Context::SetStatus`]
    fn run_command(&self, slave: u8, state: SpindleState, rpm: f32) -> ModbusResult<ModbusMessage>;

    /// Speed command, tagged [`Context::SetRpm`]
    fn speed_command(&self, slave: u8, rpm: f32) -> ModbusResult<ModbusMessage>;

    /// Periodic status reads
    fn status_queries(&self, slave: u8) -> ModbusResult<Requests>;

    /// One-time reads on selection, sent in order and stopped at the first failure
    fn interrogation(&mut self, _slave: u8) -> ModbusResult<Requests> {
        Ok(Requests::new())
    }

    /// Runs after the interrogation sequence, whether or not it completed
    fn interrogation_done(&mut self) {}

    fn decode(&mut self, reply: &Reply) -> Decoded;

    /// Load in percent of rated current
    fn load(&self) -> Option<f32> {
        None
    }

    fn has_load(&self) -> bool {
        false
    }

    fn apply_settings(&mut self, _settings: &VfdSettings) {}
}

/// Push into a request batch
pub(crate) fn requests<I>(messages: I) -> ModbusResult<Requests>
where
    I: IntoIterator<Item = ModbusResult<ModbusMessage>>,
{
    let mut batch = Requests::new();
    for message in messages {
        if batch.push(message?).is_err() {
            return Err(crate::error::ModbusError::protocol("request batch full"));
        }
    }
    Ok(batch)
}

/// Rounded, saturating conversion of a scaled value to a register word
#[inline]
pub(crate) fn to_word(value: f32) -> u16 {
    value.round().clamp(0.0, u16::MAX as f32) as u16
}

/// A VFD spindle driven through protocol `P`
pub struct VfdSpindle<P: VfdProtocol> {
    protocol: P,
    descriptor: SpindleDescriptor,
    retry: RetryState,
    state: SpindleState,
    data: SpindleData,
    address: u8,
    selected: bool,
    /// Non-blocking speed write outstanding
    busy: bool,
    /// Exclusion flag around `set_state`
    in_set_state: bool,
    /// Last run/stop command was acknowledged
    run_confirmed: bool,
    polls_in_flight: u8,
    last_poll: Option<u64>,
}

impl<P: VfdProtocol> VfdSpindle<P> {
    pub fn new(protocol: P) -> Self {
        Self::with_policy(protocol, RetryPolicy::default())
    }

    pub fn with_policy(protocol: P, policy: RetryPolicy) -> Self {
        Self {
            protocol,
            descriptor: SpindleDescriptor::vfd(),
            retry: RetryState::new(policy),
            state: SpindleState::OFF,
            data: SpindleData::default(),
            address: 0,
            selected: false,
            busy: false,
            in_set_state: false,
            run_confirmed: false,
            polls_in_flight: 0,
            last_poll: None,
        }
    }

    pub fn with_descriptor(mut self, descriptor: SpindleDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn state(&self) -> SpindleState {
        self.state
    }

    pub fn data(&self) -> &SpindleData {
        &self.data
    }

    pub fn retry(&self) -> &RetryState {
        &self.retry
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    fn name(&self) -> &'static str {
        self.protocol.plugin().name
    }

    /// Blocking send with retries; true once a valid reply was decoded
    fn command(&mut self, ctx: &mut SpindleContext<'_>, message: ModbusMessage) -> bool {
        let context = message.context;

        loop {
            let failure = match ctx.bus.transact(message.clone()) {
                Err(e) => {
                    warn!("{}: {:?} not sent: {}", self.name(), context, e);
                    return false;
                }
                Ok(TransactionOutcome::Reply(reply)) => {
                    if self.accept(ctx, &reply) {
                        return true;
                    }
                    Failure::BadFrame
                }
                Ok(TransactionOutcome::Failed { failure, .. }) => failure,
            };

            match self.retry.record_failure(context) {
                RetryDecision::Retry { attempt } => {
                    debug!(
                        "{}: {:?} failed (0x{:02X}), retry {}",
                        self.name(),
                        context,
                        failure.code(),
                        attempt
                    );
                }
                RetryDecision::Exhausted => {
                    self.escalate(ctx, context, failure);
                    return false;
                }
            }
        }
    }

    /// Decode and apply a reply, false when it carried nothing usable
    fn accept(&mut self, ctx: &mut SpindleContext<'_>, reply: &Reply) -> bool {
        let decoded = self.protocol.decode(reply);
        let tolerance = ctx.settings.at_speed_tolerance;

        match decoded {
            Decoded::Invalid => {
                debug!("{}: undecodable {:?} reply", self.name(), reply.context);
                return false;
            }
            Decoded::Ack => {}
            Decoded::Rpm(rpm) => {
                self.data.rpm = rpm;
                self.state.at_speed = self.data.is_at_speed(rpm, tolerance);
            }
            Decoded::RpmMin(min) => self.descriptor.rpm_min = min,
            // an unset limit reads back as zero and must not lock the range
            Decoded::RpmMax(max) if max > 0.0 => {
                self.descriptor.rpm_max = max;
                self.descriptor.rpm_range_locked = true;
            }
            Decoded::RpmRange { min, max } if max > min => {
                self.descriptor.rpm_min = min;
                self.descriptor.rpm_max = max;
                self.descriptor.rpm_range_locked = true;
            }
            Decoded::RpmMax(_) | Decoded::RpmRange { .. } => {
                debug!("{}: drive reports no usable speed range", self.name());
            }
        }

        self.retry.record_success(reply.context);
        true
    }

    /// Non-blocking failure path
    fn on_failure(&mut self, ctx: &mut SpindleContext<'_>, context: Context, failure: Failure) {
        match self.retry.record_failure(context) {
            RetryDecision::Retry { attempt } => {
                debug!(
                    "{}: {:?} failed (0x{:02X}), attempt {}",
                    self.name(),
                    context,
                    failure.code(),
                    attempt
                );
                // status reads are retried by the next poll
                if context == Context::SetRpm && self.selected && self.data.rpm_programmed >= 0.0 {
                    let rpm = self.data.rpm_programmed;
                    self.write_rpm(ctx, rpm, false);
                }
            }
            RetryDecision::Exhausted => {
                if context == Context::SetRpm {
                    self.data.rpm_programmed = RPM_INVALID;
                }
                self.escalate(ctx, context, failure);
            }
        }
    }

    fn escalate(&mut self, ctx: &mut SpindleContext<'_>, context: Context, failure: Failure) {
        warn!(
            "{}: {:?} failed after {} retries (0x{:02X})",
            self.name(),
            context,
            self.retry.policy().max_retries,
            failure.code()
        );
        ctx.alarms
            .escalate(ctx.spindle, ctx.settings.disable_on_failure);
    }

    fn set_rpm(&mut self, ctx: &mut SpindleContext<'_>, rpm: f32, block: bool) -> bool {
        if rpm == self.data.rpm_programmed {
            return true;
        }
        if !block && self.busy {
            trace!("{}: speed {} dropped, previous write in flight", self.name(), rpm);
            return false;
        }
        self.write_rpm(ctx, rpm, block)
    }

    fn write_rpm(&mut self, ctx: &mut SpindleContext<'_>, rpm: f32, block: bool) -> bool {
        let message = match self.protocol.speed_command(self.address, rpm) {
            Ok(message) => message,
            Err(e) => {
                warn!("{}: cannot encode speed {}: {}", self.name(), rpm, e);
                return false;
            }
        };

        self.state.at_speed = false;
        self.data
            .set_at_speed_range(rpm, ctx.settings.at_speed_tolerance);

        let sent = if block {
            self.command(ctx, message)
        } else {
            match ctx.bus.submit(message, ctx.spindle) {
                Ok(()) => {
                    self.busy = true;
                    true
                }
                Err(e) => {
                    warn!("{}: speed write not queued: {}", self.name(), e);
                    false
                }
            }
        };

        if !sent {
            self.data.rpm_programmed = RPM_INVALID;
        }
        sent
    }

    fn interrogate(&mut self, ctx: &mut SpindleContext<'_>) {
        match self.protocol.interrogation(self.address) {
            Ok(queries) => {
                for query in queries {
                    if !self.command(ctx, query) {
                        break;
                    }
                }
            }
            Err(e) => warn!("{}: cannot build interrogation: {}", self.name(), e),
        }
        self.protocol.interrogation_done();
    }

    fn valid_rpm(&self, rpm: f32) -> bool {
        if rpm.is_finite() && rpm >= 0.0 {
            true
        } else {
            warn!("{}: rejected speed {}", self.name(), rpm);
            false
        }
    }
}

impl<P: VfdProtocol> Completion for VfdSpindle<P> {
    fn on_reply(&mut self, ctx: &mut SpindleContext<'_>, reply: &Reply) {
        match reply.context {
            Context::SetRpm => self.busy = false,
            Context::GetRpm | Context::GetAmps => {
                self.polls_in_flight = self.polls_in_flight.saturating_sub(1)
            }
            _ => {}
        }
        if !self.accept(ctx, reply) {
            self.on_failure(ctx, reply.context, Failure::BadFrame);
        }
    }

    fn on_exception(&mut self, ctx: &mut SpindleContext<'_>, failure: Failure, context: Context) {
        match context {
            Context::SetRpm => self.busy = false,
            Context::GetRpm | Context::GetAmps => {
                self.polls_in_flight = self.polls_in_flight.saturating_sub(1)
            }
            _ => {}
        }
        self.on_failure(ctx, context, failure);
    }
}

impl<P: VfdProtocol> SpindleDriver for VfdSpindle<P> {
    fn descriptor(&self) -> &SpindleDescriptor {
        &self.descriptor
    }

    fn plugin(&self) -> Option<PluginInfo> {
        Some(self.protocol.plugin())
    }

    fn config(&mut self, ctx: &mut SpindleContext<'_>) -> bool {
        ctx.bus.is_up()
    }

    fn set_state(&mut self, ctx: &mut SpindleContext<'_>, state: SpindleState, rpm: f32) {
        if !self.selected || !self.valid_rpm(rpm) {
            return;
        }
        if self.in_set_state {
            debug!("{}: set_state re-entered, ignored", self.name());
            return;
        }

        if self.run_confirmed
            && state.on == self.state.on
            && state.ccw == self.state.ccw
            && rpm == self.data.rpm_programmed
        {
            return;
        }

        self.in_set_state = true;

        if state.ccw != self.state.ccw {
            self.data.rpm_programmed = RPM_INVALID;
        }
        self.state.on = state.on;
        self.state.ccw = state.ccw;
        self.data.state_programmed = SpindleState {
            on: state.on,
            ccw: state.ccw,
            at_speed: false,
        };

        match self.protocol.run_command(self.address, state, rpm) {
            Ok(message) => {
                self.run_confirmed = self.command(ctx, message);
                if self.run_confirmed {
                    self.set_rpm(ctx, rpm, true);
                }
            }
            Err(e) => {
                warn!("{}: cannot encode run command: {}", self.name(), e);
                self.run_confirmed = false;
            }
        }

        self.in_set_state = false;
    }

    fn get_state(&mut self, ctx: &mut SpindleContext<'_>) -> SpindleState {
        if self.selected && ctx.bus.is_up() && self.polls_in_flight == 0 {
            let now = ctx.bus.now_ms();
            let due = self
                .last_poll
                .map_or(true, |last| now.saturating_sub(last) >= VFD_POLL_INTERVAL_MS);

            if due {
                self.last_poll = Some(now);
                match self.protocol.status_queries(self.address) {
                    Ok(queries) => {
                        for query in queries {
                            if ctx.bus.submit(query, ctx.spindle).is_ok() {
                                self.polls_in_flight += 1;
                            }
                        }
                    }
                    Err(e) => warn!("{}: cannot build status query: {}", self.name(), e),
                }
            }
        }

        if let Some(rpm) = ctx.encoder_rpm() {
            self.state.at_speed = self
                .data
                .is_at_speed(rpm, ctx.settings.at_speed_tolerance);
        }

        self.state
    }

    fn update_rpm(&mut self, ctx: &mut SpindleContext<'_>, rpm: f32) {
        if !self.selected || !self.valid_rpm(rpm) {
            return;
        }
        if !self.state.on {
            debug!("{}: speed update while off ignored", self.name());
            return;
        }
        self.set_rpm(ctx, rpm, false);
    }

    fn get_data(&mut self, ctx: &mut SpindleContext<'_>, request: DataRequest) -> SpindleData {
        match ctx.encoder.as_mut() {
            Some(encoder) => {
                let mut data = encoder.data(request);
                data.rpm_low_limit = self.data.rpm_low_limit;
                data.rpm_high_limit = self.data.rpm_high_limit;
                data.rpm_programmed = self.data.rpm_programmed;
                data.state_programmed = self.data.state_programmed;
                data
            }
            None => self.data,
        }
    }

    fn get_load(&self) -> Option<f32> {
        self.protocol.load()
    }

    fn has_load(&self) -> bool {
        self.protocol.has_load()
    }

    fn on_selected(&mut self, ctx: &mut SpindleContext<'_>, address: u8) {
        self.address = address;
        self.selected = true;
        self.busy = false;
        self.run_confirmed = false;
        self.polls_in_flight = 0;
        self.last_poll = None;
        self.data.rpm_programmed = RPM_INVALID;

        ctx.bus.set_silence(self.protocol.silence());
        self.interrogate(ctx);
    }

    fn on_deselected(&mut self, _ctx: &mut SpindleContext<'_>) {
        self.selected = false;
        self.busy = false;
        self.run_confirmed = false;
    }

    fn on_driver_reset(&mut self, ctx: &mut SpindleContext<'_>) {
        self.retry.reset_all();
        self.busy = false;
        self.polls_in_flight = 0;
        if self.selected {
            ctx.bus.set_silence(self.protocol.silence());
            self.interrogate(ctx);
        }
    }

    fn on_settings_changed(&mut self, spindle: &SpindleSettings, vfd: &VfdSettings) {
        self.protocol.apply_settings(vfd);
        if self.data.rpm_programmed >= 0.0 {
            let rpm = self.data.rpm_programmed;
            self.data.set_at_speed_range(rpm, spindle.at_speed_tolerance);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Harness wiring a single adapter to the simulated bus

    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::alarm::AlarmChannel;
    use crate::engine::{deliver, ModbusBus, ModbusConfig, ModbusEngine};
    use crate::settings::SpindleSettings;
    use crate::sim::{ManualClock, RecordingAlarms, Responder, SimTransport, SimulatedVfd};
    use crate::spindle::{SpindleContext, SpindleDriver};

    pub struct Harness {
        pub clock: ManualClock,
        pub transport: SimTransport,
        pub engine: ModbusEngine<SimTransport, ManualClock>,
        pub alarms: AlarmChannel,
        pub sink: RecordingAlarms,
        pub settings: SpindleSettings,
    }

    impl Harness {
        pub fn with_responder(responder: Responder) -> Self {
            let clock = ManualClock::new();
            let transport = SimTransport::new(clock.clone(), responder);
            let engine = ModbusEngine::new(transport.clone(), clock.clone(), ModbusConfig::default());
            let sink = RecordingAlarms::new();
            let mut alarms = AlarmChannel::new(Box::new(sink.clone()));
            alarms.system_started();
            Self {
                clock,
                transport,
                engine,
                alarms,
                sink,
                settings: SpindleSettings::default(),
            }
        }

        pub fn with_device(device: &Rc<RefCell<SimulatedVfd>>) -> Self {
            Self::with_responder(SimulatedVfd::responder(device))
        }

        pub fn run<D: SpindleDriver, R>(
            &mut self,
            driver: &mut D,
            op: impl FnOnce(&mut D, &mut SpindleContext<'_>) -> R,
        ) -> R {
            let mut ctx = SpindleContext {
                spindle: 0,
                bus: &mut self.engine,
                alarms: &mut self.alarms,
                settings: &self.settings,
                encoder: None,
            };
            op(driver, &mut ctx)
        }

        /// Let time pass and route every completion to `driver`
        pub fn settle<D: SpindleDriver>(&mut self, driver: &mut D, ms: u64) {
            for _ in 0..ms {
                self.clock.advance(1);
                self.engine.poll();
                while let Some(done) = self.engine.next_completed() {
                    let mut ctx = SpindleContext {
                        spindle: done.owner,
                        bus: &mut self.engine,
                        alarms: &mut self.alarms,
                        settings: &self.settings,
                        encoder: None,
                    };
                    deliver(done.outcome, driver, &mut ctx);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crc_flags<P: VfdProtocol>(mut protocol: P) -> Vec<(Context, bool)> {
        let mut messages = vec![
            protocol.run_command(1, SpindleState::cw(), 3000.0).unwrap(),
            protocol.speed_command(1, 3000.0).unwrap(),
        ];
        messages.extend(protocol.status_queries(1).unwrap().iter().cloned());
        messages.extend(protocol.interrogation(1).unwrap().iter().cloned());
        messages.iter().map(|m| (m.context, m.crc_check)).collect()
    }

    #[test]
    fn test_reply_crc_check_per_family() {
        let families = [
            ("HUANYANG", crc_flags(Huanyang::new())),
            ("P2A", crc_flags(HuanyangP2a::new())),
            ("GS20", crc_flags(Gs20::default())),
            ("H100", crc_flags(H100::new())),
            ("YL620", crc_flags(Yl620::default())),
            ("NOWFOREVER", crc_flags(Nowforever::new())),
            ("MODVFD", crc_flags(ModVfd::default())),
        ];
        for (family, flags) in families {
            assert!(flags.len() >= 3, "{}", family);
            for (context, checked) in flags {
                // only the MODVFD run/stop write verifies the reply checksum
                let expected = family == "MODVFD" && context == Context::SetStatus;
                assert_eq!(checked, expected, "{} {:?}", family, context);
            }
        }
    }
}
