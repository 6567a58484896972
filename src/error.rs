//! Error types for the transaction engine, spindle registry and settings
//!
//! Bus-level failures (timeouts, exception replies, bad frames) are not errors
//! here: they are delivered as [`Failure`](crate::message::Failure) outcomes so
//! the retry policy can act on them. The types below cover requests that are
//! rejected before they ever reach the wire.

use thiserror::Error;

use crate::settings::TransferResult;

/// Result alias for frame building and engine submission
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Result alias for registry operations
pub type SpindleResult<T> = Result<T, SpindleError>;

/// Result alias for settings persistence
pub type SettingsResult<T> = Result<T, SettingsError>;

/// Errors raised while building or submitting a Modbus ADU
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModbusError {
    /// Frame does not fit protocol limits
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Function code outside the supported set
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Payload or expected lengths are inconsistent
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Frame-level encoding problem
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Engine or transport misconfiguration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Non-blocking queue has no room left
    #[error("Transaction queue full ({capacity} pending)")]
    QueueFull { capacity: usize },

    /// Transport has not been brought up
    #[error("Modbus bus is not up")]
    NotReady,
}

impl ModbusError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    pub fn frame(message: impl Into<String>) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

/// Errors raised by the spindle registry
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpindleError {
    #[error("Unknown spindle id {id}")]
    UnknownSpindle { id: u8 },

    #[error("Spindle registry full ({capacity} spindles)")]
    RegistryFull { capacity: usize },

    #[error(transparent)]
    Modbus(#[from] ModbusError),
}

/// Errors raised while loading or storing VFD settings
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("Settings transfer failed: {status:?}")]
    Transfer { status: TransferResult },

    #[error("Settings blob corrupt: {message}")]
    Corrupt { message: String },

    #[error("Invalid setting {name}: {message}")]
    Invalid { name: &'static str, message: String },
}

impl SettingsError {
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }

    pub fn invalid(name: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            name,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            ModbusError::invalid_function(0x42).to_string(),
            "Invalid function code: 0x42"
        );
        assert_eq!(
            ModbusError::QueueFull { capacity: 8 }.to_string(),
            "Transaction queue full (8 pending)"
        );
        assert_eq!(
            SettingsError::invalid("vfd_rpm_hz", "must be 1..=3000").to_string(),
            "Invalid setting vfd_rpm_hz: must be 1..=3000"
        );
    }

    #[test]
    fn test_spindle_error_from_modbus() {
        let err: SpindleError = ModbusError::NotReady.into();
        assert!(matches!(err, SpindleError::Modbus(ModbusError::NotReady)));
    }
}
