//! # VFD Spindle - Modbus RTU Spindle Control
//!
//! Drives variable-frequency spindle drives over a half-duplex Modbus RTU bus
//! from a single cooperative control loop. Nothing in the crate blocks the
//! caller except the explicitly blocking command path used for run/stop.
//!
//! ## Layers
//!
//! | Layer | Module | Role |
//! |-------|--------|------|
//! | Framing | [`adu`] | ADU builder, CRC-16/MODBUS |
//! | Transactions | [`engine`] | tick-driven RTU master, request queue |
//! | Policy | [`retry`], [`alarm`] | bounded retries, escalation, cold-start alarms |
//! | Adapters | [`vfd`] | one protocol per VFD family over a shared spindle core |
//! | Composition | [`registry`], [`hooks`] | selection, plugin event chains |
//!
//! ## Supported Drives
//!
//! | Family | Adapter |
//! |--------|---------|
//! | Huanyang (original protocol) | [`vfd::Huanyang`] |
//! | Huanyang P2A | [`vfd::HuanyangP2a`] |
//! | Durapulse GS20 | [`vfd::Gs20`] |
//! | H-100 | [`vfd::H100`] |
//! | Yalang YL620A | [`vfd::Yl620`] |
//! | Nowforever | [`vfd::Nowforever`] |
//! | Any single-register drive | [`vfd::ModVfd`] |
//!
//! ## Quick Start
//!
//! ```rust
//! # #[cfg(feature = "sim")] {
//! use vfd_spindle::sim::{ManualClock, RecordingAlarms, SimTransport, SimulatedVfd};
//! use vfd_spindle::vfd::{Gs20, VfdSpindle};
//! use vfd_spindle::{AlarmChannel, ModbusConfig, ModbusEngine, SpindleRegistry, SpindleState};
//!
//! let device = SimulatedVfd::new(1).with_mirror(0x2001, 0x2103).shared();
//! let clock = ManualClock::new();
//! let transport = SimTransport::new(clock.clone(), SimulatedVfd::responder(&device));
//! let engine = ModbusEngine::new(transport, clock.clone(), ModbusConfig::default());
//!
//! let mut registry = SpindleRegistry::new(engine, AlarmChannel::new(Box::new(RecordingAlarms::new())));
//! let id = registry.register(VfdSpindle::new(Gs20::default()), "Durapulse GS20").unwrap();
//! registry.select(id).unwrap();
//! registry.system_started();
//!
//! registry.set_state(SpindleState::cw(), 3000.0);
//! assert_eq!(device.borrow().register(0x2001), 5000);
//! # }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Modbus RTU and spindle constants
pub mod constants;

/// Stack-allocated RTU frames and CRC
pub mod adu;

/// Requests, correlation contexts and transaction outcomes
pub mod message;

/// Byte transport and clock seams, bus statistics
pub mod transport;

/// Cooperative Modbus RTU master
pub mod engine;

// ============================================================================
// Spindle layer
// ============================================================================

/// Retry counters and escalation decisions
pub mod retry;

/// Alarm routing with cold-start deferral
pub mod alarm;

/// Spindle capability contract
pub mod spindle;

/// Spindle and VFD settings, persistence
pub mod settings;

/// Event chains for plugins
pub mod hooks;

/// Spindle registration and selection
pub mod registry;

/// Vendor protocol adapters
pub mod vfd;

/// In-memory bus and devices for tests and demos
#[cfg(any(test, feature = "sim"))]
pub mod sim;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Error handling ===
pub use error::{
    ModbusError, ModbusResult, SettingsError, SettingsResult, SpindleError, SpindleResult,
};

// === Transactions ===
pub use adu::{Adu, AduBuilder};
pub use engine::{ModbusBus, ModbusConfig, ModbusEngine, ModbusState};
pub use message::{Context, Failure, ModbusMessage, Reply, TransactionOutcome};
pub use transport::{BusStats, Clock, SilenceTimeout, SystemClock, Transport};

// === Spindles ===
pub use alarm::{Alarm, AlarmChannel, AlarmSink};
pub use registry::SpindleRegistry;
pub use retry::{RetryDecision, RetryPolicy};
pub use settings::{SettingsStore, SpindleSettings, VfdSettings};
pub use spindle::{
    DataRequest, SpindleCaps, SpindleData, SpindleDescriptor, SpindleDriver, SpindleId,
    SpindleState, SpindleType,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("VFD Spindle v{} - Modbus RTU spindle drivers", VERSION)
}
