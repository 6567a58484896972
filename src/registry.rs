//! # Spindle Registry
//!
//! The registry owns the bus, the alarm channel, the settings and every
//! registered driver, and lends them to the active driver for each call.
//!
//! ## Lifecycle
//!
//! ```text
//! register ──► Registered ──select──► Selected ──select other──► Registered
//!                                        │
//!                                        └─ all spindle operations reachable
//! ```
//!
//! Exactly one spindle is active at a time. Before a new one is engaged the
//! previous one is commanded off and deselected. When retries are exhausted
//! with "disable on failure" set, the failing spindle is swapped for the
//! null spindle on the next registry call.

use tracing::{debug, info, warn};

use crate::alarm::AlarmChannel;
use crate::constants::{SPINDLE_MAX, VFD_N_ADDRESSES};
use crate::engine::{deliver, Completed, ModbusBus};
use crate::error::{SettingsResult, SpindleError, SpindleResult};
use crate::hooks::{Hooks, OptionsReport, RealtimeReport, SettingsChanged, SpindleSelected};
use crate::settings::{SpindleSettings, VfdSettings};
use crate::spindle::{
    DataRequest, EncoderFeed, NullSpindle, SpindleContext, SpindleData, SpindleDescriptor,
    SpindleDriver, SpindleId, SpindleState, SpindleType,
};

/// Hook name of the shared load report
const LOAD_REPORT: &str = "spindle load";

struct Entry {
    id: SpindleId,
    name: String,
    driver: Box<dyn SpindleDriver>,
    /// Index into the configured VFD addresses
    vfd_slot: Option<usize>,
}

pub struct SpindleRegistry<B: ModbusBus> {
    bus: B,
    alarms: AlarmChannel,
    settings: SpindleSettings,
    vfd_settings: VfdSettings,
    spindles: Vec<Entry>,
    active: Option<SpindleId>,
    encoder: Option<Box<dyn EncoderFeed>>,
    hooks: Hooks,
    vfd_count: usize,
    null_id: Option<SpindleId>,
}

impl<B: ModbusBus> SpindleRegistry<B> {
    pub fn new(bus: B, alarms: AlarmChannel) -> Self {
        Self {
            bus,
            alarms,
            settings: SpindleSettings::default(),
            vfd_settings: VfdSettings::default(),
            spindles: Vec::new(),
            active: None,
            encoder: None,
            hooks: Hooks::default(),
            vfd_count: 0,
            null_id: None,
        }
    }

    pub fn with_settings(mut self, settings: SpindleSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_vfd_settings(mut self, settings: VfdSettings) -> Self {
        self.vfd_settings = settings;
        self
    }

    // ========================================================================
    // Registration
    // ========================================================================

    pub fn register<D>(&mut self, driver: D, name: &str) -> SpindleResult<SpindleId>
    where
        D: SpindleDriver + 'static,
    {
        self.register_boxed(Box::new(driver), name)
    }

    pub fn register_boxed(
        &mut self,
        mut driver: Box<dyn SpindleDriver>,
        name: &str,
    ) -> SpindleResult<SpindleId> {
        if self.spindles.len() >= SPINDLE_MAX {
            return Err(SpindleError::RegistryFull {
                capacity: SPINDLE_MAX,
            });
        }

        let id = self.spindles.len() as SpindleId;
        let kind = driver.descriptor().kind;

        let vfd_slot = (kind == SpindleType::Vfd).then(|| {
            let slot = self.vfd_count;
            self.vfd_count += 1;
            if slot >= VFD_N_ADDRESSES {
                warn!(
                    "VFD \"{}\" has no address slot of its own, using the first one",
                    name
                );
            }
            slot
        });

        driver.on_settings_changed(&self.settings, &self.vfd_settings);

        if let Some(plugin) = driver.plugin() {
            if !self.hooks.on_report_options.contains(plugin.name) {
                self.hooks
                    .on_report_options
                    .install(plugin.name, move |report: &mut OptionsReport| {
                        if !report.newopt {
                            report.lines.push(plugin.report_line());
                        }
                    });
            }
        }

        if driver.has_load() && !self.hooks.on_realtime_report.contains(LOAD_REPORT) {
            self.hooks
                .on_realtime_report
                .install(LOAD_REPORT, |report: &mut RealtimeReport| {
                    if let Some(load) = report.load {
                        report.line.push_str(&format!("|Sl:{:.1}", load));
                    }
                });
        }

        info!("Registered spindle {} \"{}\" ({:?})", id, name, kind);
        self.spindles.push(Entry {
            id,
            name: name.to_string(),
            driver,
            vfd_slot,
        });
        Ok(id)
    }

    /// Register the inert spindle used when a failing one is disabled
    pub fn register_null(&mut self) -> SpindleResult<SpindleId> {
        if let Some(id) = self.null_id {
            return Ok(id);
        }
        let id = self.register(NullSpindle::new(), "Null")?;
        self.null_id = Some(id);
        Ok(id)
    }

    // ========================================================================
    // Selection
    // ========================================================================

    pub fn select(&mut self, id: SpindleId) -> SpindleResult<()> {
        if !self.spindles.iter().any(|entry| entry.id == id) {
            return Err(SpindleError::UnknownSpindle { id });
        }
        if let Some(previous) = self.active.take() {
            self.deactivate(previous, true);
        }
        self.engage(id);
        self.apply_disable_request();
        Ok(())
    }

    fn deactivate(&mut self, id: SpindleId, stop: bool) {
        self.with_spindle(id, |driver, ctx| {
            if stop {
                driver.set_state(ctx, SpindleState::OFF, 0.0);
            }
            driver.on_deselected(ctx);
        });
    }

    fn engage(&mut self, id: SpindleId) {
        let Some(entry) = self.spindles.iter().find(|entry| entry.id == id) else {
            return;
        };
        let address = entry
            .vfd_slot
            .map_or(0, |slot| self.vfd_settings.address(slot));
        let descriptor = *entry.driver.descriptor();
        let name = entry.name.clone();

        self.active = Some(id);
        self.with_spindle(id, |driver, ctx| driver.on_selected(ctx, address));

        info!("Spindle {} \"{}\" selected, address {}", id, name, address);
        let mut event = SpindleSelected {
            id,
            name,
            kind: descriptor.kind,
            caps: descriptor.caps,
        };
        self.hooks.on_spindle_selected.dispatch(&mut event);
    }

    fn apply_disable_request(&mut self) {
        let Some(failed) = self.alarms.take_disable_request() else {
            return;
        };
        if self.active != Some(failed) || self.active == self.null_id {
            return;
        }

        let null = match self.register_null() {
            Ok(id) => id,
            Err(e) => {
                self.alarms
                    .warning(&format!("Cannot disable spindle {}: {}", failed, e));
                return;
            }
        };
        warn!("Spindle {} disabled after repeated failures", failed);
        self.active = None;
        // the device is not answering, no point commanding it off
        self.deactivate(failed, false);
        self.engage(null);
    }

    /// Lend the shared resources to one driver
    fn with_spindle<R>(
        &mut self,
        id: SpindleId,
        op: impl FnOnce(&mut dyn SpindleDriver, &mut SpindleContext<'_>) -> R,
    ) -> Option<R> {
        let Self {
            bus,
            alarms,
            settings,
            spindles,
            encoder,
            ..
        } = self;
        let entry = spindles.iter_mut().find(|entry| entry.id == id)?;
        let mut ctx = SpindleContext {
            spindle: id,
            bus,
            alarms,
            settings,
            encoder: encoder.as_mut(),
        };
        Some(op(entry.driver.as_mut(), &mut ctx))
    }

    fn with_active<R>(
        &mut self,
        op: impl FnOnce(&mut dyn SpindleDriver, &mut SpindleContext<'_>) -> R,
    ) -> Option<R> {
        let id = self.active?;
        self.with_spindle(id, op)
    }

    // ========================================================================
    // Operations on the active spindle
    // ========================================================================

    pub fn config(&mut self) -> bool {
        self.with_active(|driver, ctx| driver.config(ctx))
            .unwrap_or(false)
    }

    pub fn set_state(&mut self, state: SpindleState, rpm: f32) {
        self.with_active(|driver, ctx| driver.set_state(ctx, state, rpm));
        self.apply_disable_request();
    }

    pub fn update_rpm(&mut self, rpm: f32) {
        self.with_active(|driver, ctx| driver.update_rpm(ctx, rpm));
        self.apply_disable_request();
    }

    pub fn get_state(&mut self) -> SpindleState {
        self.with_active(|driver, ctx| driver.get_state(ctx))
            .unwrap_or(SpindleState::OFF)
    }

    pub fn get_data(&mut self, request: DataRequest) -> SpindleData {
        self.with_active(|driver, ctx| driver.get_data(ctx, request))
            .unwrap_or_default()
    }

    /// Pump the bus and route finished transactions to the spindles that sent them
    pub fn poll(&mut self) {
        self.bus.poll();
        while let Some(Completed { owner, outcome }) = self.bus.next_completed() {
            let routed = self.with_spindle(owner, |driver, ctx| deliver(outcome, driver, ctx));
            if routed.is_none() {
                debug!("Completion for unknown spindle {} dropped", owner);
            }
        }
        self.apply_disable_request();
    }

    // ========================================================================
    // System events
    // ========================================================================

    /// Lines contributed by plugins to an options report
    pub fn report_options(&mut self, newopt: bool) -> Vec<String> {
        let mut report = OptionsReport::new(newopt);
        self.hooks.on_report_options.dispatch(&mut report);
        report.lines
    }

    /// Real-time report fragment, e.g. `|Sl:42.0` for spindle load
    pub fn realtime_report(&mut self) -> Option<String> {
        let load = self
            .active
            .and_then(|id| self.spindles.iter().find(|entry| entry.id == id))
            .filter(|entry| entry.driver.has_load())
            .and_then(|entry| entry.driver.get_load());

        let mut report = RealtimeReport {
            load,
            line: String::new(),
        };
        self.hooks.on_realtime_report.dispatch(&mut report);
        (!report.line.is_empty()).then_some(report.line)
    }

    /// Apply new settings to every spindle, rejecting invalid VFD settings
    pub fn settings_changed(&mut self, spindle: SpindleSettings, vfd: VfdSettings) -> SettingsResult<()> {
        vfd.validate()?;

        let vfd_changed = vfd != self.vfd_settings;
        self.settings = spindle;
        self.vfd_settings = vfd;

        for entry in self.spindles.iter_mut() {
            entry
                .driver
                .on_settings_changed(&self.settings, &self.vfd_settings);
        }

        let mut event = SettingsChanged {
            spindle: self.settings,
            vfd: self.vfd_settings.clone(),
            vfd_changed,
        };
        self.hooks.on_settings_changed.dispatch(&mut event);
        Ok(())
    }

    /// Warm reset: clear retry state and re-interrogate the active device
    pub fn driver_reset(&mut self) {
        let ids: Vec<SpindleId> = self.spindles.iter().map(|entry| entry.id).collect();
        for id in ids {
            self.with_spindle(id, |driver, ctx| driver.on_driver_reset(ctx));
        }
        self.apply_disable_request();
    }

    /// End of cold start, returns the number of deferred alarms delivered
    pub fn system_started(&mut self) -> usize {
        self.alarms.system_started()
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn active(&self) -> Option<SpindleId> {
        self.active
    }

    pub fn null_id(&self) -> Option<SpindleId> {
        self.null_id
    }

    pub fn descriptor(&self, id: SpindleId) -> Option<SpindleDescriptor> {
        self.spindles
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| *entry.driver.descriptor())
    }

    pub fn name(&self, id: SpindleId) -> Option<&str> {
        self.spindles
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.name.as_str())
    }

    /// Registered spindles in id order
    pub fn spindles(&self) -> impl Iterator<Item = (SpindleId, &str)> + '_ {
        self.spindles
            .iter()
            .map(|entry| (entry.id, entry.name.as_str()))
    }

    pub fn len(&self) -> usize {
        self.spindles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spindles.is_empty()
    }

    pub fn set_encoder(&mut self, encoder: Option<Box<dyn EncoderFeed>>) {
        self.encoder = encoder;
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut Hooks {
        &mut self.hooks
    }

    pub fn alarms(&self) -> &AlarmChannel {
        &self.alarms
    }

    pub fn settings(&self) -> &SpindleSettings {
        &self.settings
    }

    pub fn vfd_settings(&self) -> &VfdSettings {
        &self.vfd_settings
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::engine::{Completion, ModbusConfig, ModbusEngine};
    use crate::message::{Context, Failure, Reply};
    use crate::retry::RetryPolicy;
    use crate::sim::{ManualClock, RecordingAlarms, SimTransport, SimulatedVfd};
    use crate::spindle::SpindleCaps;
    use crate::vfd::{Gs20, H100, ModVfd, VfdSpindle};

    type TestRegistry = SpindleRegistry<ModbusEngine<SimTransport, ManualClock>>;

    fn registry(device: &Rc<RefCell<SimulatedVfd>>) -> (TestRegistry, ManualClock, RecordingAlarms) {
        let clock = ManualClock::new();
        let transport = SimTransport::new(clock.clone(), SimulatedVfd::responder(device));
        let engine = ModbusEngine::new(transport, clock.clone(), ModbusConfig::default());
        let sink = RecordingAlarms::new();
        let alarms = AlarmChannel::new(Box::new(sink.clone()));
        (SpindleRegistry::new(engine, alarms), clock, sink)
    }

    fn quick_gs20() -> VfdSpindle<Gs20> {
        VfdSpindle::with_policy(Gs20::default(), RetryPolicy::default().with_max_retries(1))
    }

    /// Fixed-load spindle for report tests
    struct LoadSpindle {
        descriptor: SpindleDescriptor,
    }

    impl Completion for LoadSpindle {
        fn on_reply(&mut self, _ctx: &mut SpindleContext<'_>, _reply: &Reply) {}
        fn on_exception(&mut self, _ctx: &mut SpindleContext<'_>, _f: Failure, _c: Context) {}
    }

    impl SpindleDriver for LoadSpindle {
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
        fn get_data(&mut self, _ctx: &mut SpindleContext<'_>, _r: DataRequest) -> SpindleData {
            SpindleData::default()
        }
        fn get_load(&self) -> Option<f32> {
            Some(42.0)
        }
        fn has_load(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_select_unknown_spindle() {
        let device = SimulatedVfd::new(1).shared();
        let (mut registry, _, _) = registry(&device);
        assert_eq!(
            registry.select(3),
            Err(SpindleError::UnknownSpindle { id: 3 })
        );
        assert_eq!(registry.active(), None);
    }

    #[test]
    fn test_address_resolved_per_vfd_slot() {
        let device = SimulatedVfd::new(2).shared();
        let (registry, _, _) = registry(&device);
        let mut registry = registry.with_vfd_settings(VfdSettings {
            modbus_address: [1, 2, 1, 1],
            ..VfdSettings::default()
        });

        registry.register(quick_gs20(), "GS20 left").unwrap();
        let right = registry.register(quick_gs20(), "GS20 right").unwrap();
        registry.select(right).unwrap();
        registry.set_state(SpindleState::cw(), 3000.0);

        assert_eq!(device.borrow().register(0x2000), 0x12);
        assert_eq!(device.borrow().register(0x2001), 5000);
    }

    #[test]
    fn test_previous_spindle_stopped_on_switch() {
        let device = SimulatedVfd::new(1).shared();
        let (mut registry, _, _) = registry(&device);
        let first = registry.register(quick_gs20(), "GS20").unwrap();
        let second = registry.register(quick_gs20(), "GS20 spare").unwrap();

        registry.select(first).unwrap();
        registry.set_state(SpindleState::cw(), 3000.0);
        registry.select(second).unwrap();

        let writes = device.borrow().writes().to_vec();
        assert_eq!(&writes[writes.len() - 2..], &[(0x2000, 0x11), (0x2001, 0)]);
        assert_eq!(registry.active(), Some(second));
    }

    #[test]
    fn test_selection_hooks_fire_in_order() {
        let device = SimulatedVfd::new(1).shared();
        let (mut registry, _, _) = registry(&device);
        let id = registry.register(quick_gs20(), "GS20").unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        for tag in ["outer", "inner"] {
            let seen = Rc::clone(&seen);
            registry
                .hooks_mut()
                .on_spindle_selected
                .install(tag, move |event: &mut SpindleSelected| {
                    seen.borrow_mut().push((tag, event.id, event.name.clone()));
                });
        }

        registry.select(id).unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("outer", id, "GS20".to_string()));
        assert_eq!(seen[1].0, "inner");
    }

    #[test]
    fn test_plugin_lines_reported_once_per_family() {
        let device = SimulatedVfd::new(1).shared();
        let (mut registry, _, _) = registry(&device);
        registry.register(quick_gs20(), "GS20").unwrap();
        registry.register(VfdSpindle::new(H100::new()), "H-100").unwrap();
        registry.register(quick_gs20(), "GS20 spare").unwrap();

        assert_eq!(
            registry.report_options(false),
            vec!["[PLUGIN:Durapulse GS20 v0.05]", "[PLUGIN:H-100 VFD v0.02]"]
        );
        assert!(registry.report_options(true).is_empty());
    }

    #[test]
    fn test_load_report_for_active_spindle() {
        let device = SimulatedVfd::new(1).shared();
        let (mut registry, _, _) = registry(&device);
        let plain = registry.register(quick_gs20(), "GS20").unwrap();
        let loaded = registry
            .register(
                LoadSpindle {
                    descriptor: SpindleDescriptor::vfd().with_caps(SpindleCaps::VFD),
                },
                "Loaded",
            )
            .unwrap();
        registry.register(LoadSpindle { descriptor: SpindleDescriptor::vfd() }, "Loaded 2").unwrap();

        assert_eq!(registry.hooks().on_realtime_report.len(), 1);
        assert_eq!(registry.realtime_report(), None);

        registry.select(plain).unwrap();
        assert_eq!(registry.realtime_report(), None);

        registry.select(loaded).unwrap();
        assert_eq!(registry.realtime_report().as_deref(), Some("|Sl:42.0"));
    }

    #[test]
    fn test_failing_spindle_replaced_by_null() {
        let device = SimulatedVfd::new(1).silent().shared();
        let (registry, _, sink) = registry(&device);
        let mut registry =
            registry.with_settings(SpindleSettings::default().with_disable_on_failure(true));
        let id = registry.register(quick_gs20(), "GS20").unwrap();
        registry.select(id).unwrap();
        registry.system_started();

        registry.set_state(SpindleState::cw(), 1000.0);

        let null = registry.null_id().unwrap();
        assert_eq!(registry.active(), Some(null));
        assert_eq!(registry.descriptor(null).unwrap().caps, SpindleCaps::NONE);
        assert_eq!(sink.alarms().len(), 1);
        // null spindle ignores further commands
        registry.set_state(SpindleState::cw(), 1000.0);
        assert_eq!(sink.alarms().len(), 1);
    }

    #[test]
    fn test_settings_change_reaches_adapters() {
        let device = SimulatedVfd::new(1).shared();
        let (mut registry, _, _) = registry(&device);
        let id = registry.register(VfdSpindle::new(ModVfd::default()), "MODVFD").unwrap();

        let changed = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&changed);
        registry
            .hooks_mut()
            .on_settings_changed
            .install("observer", move |event: &mut SettingsChanged| {
                *sink.borrow_mut() = Some(event.vfd_changed);
            });

        let vfd = VfdSettings {
            runstop_reg: 0x0100,
            run_cw_cmd: 0x0001,
            ..VfdSettings::default()
        };
        registry.settings_changed(SpindleSettings::default(), vfd).unwrap();
        assert_eq!(*changed.borrow(), Some(true));

        registry.select(id).unwrap();
        registry.set_state(SpindleState::cw(), 3000.0);
        assert_eq!(device.borrow().register(0x0100), 0x0001);
    }

    #[test]
    fn test_invalid_vfd_settings_rejected() {
        let device = SimulatedVfd::new(1).shared();
        let (mut registry, _, _) = registry(&device);
        let bad = VfdSettings {
            in_divider: 0.0,
            ..VfdSettings::default()
        };
        assert!(registry.settings_changed(SpindleSettings::default(), bad).is_err());
        assert_eq!(registry.vfd_settings(), &VfdSettings::default());
    }

    #[test]
    fn test_poll_routes_completions() {
        let device = SimulatedVfd::new(1).with_mirror(0x2001, 0x2103).shared();
        let (mut registry, clock, _) = registry(&device);
        let id = registry.register(quick_gs20(), "GS20").unwrap();
        registry.select(id).unwrap();
        registry.set_state(SpindleState::cw(), 3000.0);

        registry.get_state();
        for _ in 0..10 {
            clock.advance(1);
            registry.poll();
        }

        let data = registry.get_data(DataRequest::Rpm);
        assert!((data.rpm - 3000.0).abs() < 0.01);
        assert!(registry.config());
    }

    #[test]
    fn test_switching_leaves_previous_spindle_untouched() {
        let device = SimulatedVfd::new(1).with_mirror(0x2001, 0x2103).shared();
        let (mut registry, clock, _) = registry(&device);
        let first = registry.register(quick_gs20(), "GS20").unwrap();
        let second = registry.register(quick_gs20(), "GS20 spare").unwrap();
        let settle = |registry: &mut TestRegistry| {
            registry.get_state();
            for _ in 0..10 {
                clock.advance(1);
                registry.poll();
            }
        };

        registry.select(first).unwrap();
        registry.set_state(SpindleState::cw(), 3000.0);
        settle(&mut registry);
        registry.select(second).unwrap();

        let snapshot = |registry: &mut TestRegistry| {
            registry
                .with_spindle(first, |driver, ctx| {
                    (driver.get_data(ctx, DataRequest::Rpm), driver.get_state(ctx))
                })
                .unwrap()
        };
        let before = snapshot(&mut registry);
        assert!((before.0.rpm - 3000.0).abs() < 0.01);
        assert!(!before.1.on);

        registry.set_state(SpindleState::ccw(), 6000.0);
        settle(&mut registry);

        let data = registry.get_data(DataRequest::Rpm);
        assert_eq!(data.rpm_programmed, 6000.0);
        assert!((data.rpm - 6000.0).abs() < 0.01);
        assert_eq!(snapshot(&mut registry), before);
    }

    #[test]
    fn test_disable_with_full_registry_warns() {
        let device = SimulatedVfd::new(1).silent().shared();
        let (registry, _, sink) = registry(&device);
        let mut registry =
            registry.with_settings(SpindleSettings::default().with_disable_on_failure(true));
        let ids: Vec<SpindleId> = (0..SPINDLE_MAX)
            .map(|_| registry.register(quick_gs20(), "GS20").unwrap())
            .collect();
        let last = ids[SPINDLE_MAX - 1];
        registry.select(last).unwrap();
        registry.system_started();

        registry.set_state(SpindleState::cw(), 1000.0);

        assert_eq!(sink.alarms().len(), 1);
        assert_eq!(sink.warnings().len(), 1);
        assert_eq!(registry.active(), Some(last));
        assert_eq!(registry.null_id(), None);
    }
}
