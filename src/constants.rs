//! Modbus RTU and VFD spindle constants
//!
//! Frame limits are sized for the short request/reply exchanges VFDs use:
//! the longest request any adapter builds is a single-register FC16 write
//! (9 bytes + CRC), the longest reply a two-register read (7 bytes + CRC).

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Maximum ADU size handled by the transaction engine
///
/// Address(1) + Function(1) + payload, plus the trailing CRC(2).
/// Sixteen bytes leaves headroom over the longest VFD exchange.
pub const MAX_ADU_SIZE: usize = 16;

/// CRC trailer length
pub const CRC_LEN: usize = 2;

/// Smallest valid RTU frame: address + function + CRC
pub const MIN_FRAME_LEN: usize = 4;

/// Exception reply: address + (function | 0x80) + exception code + CRC
pub const EXCEPTION_FRAME_LEN: usize = 5;

/// Highest addressable RTU slave (248..=255 are reserved)
pub const MAX_SLAVE_ADDRESS: u8 = 247;

/// Depth of the non-blocking transaction queue
pub const MODBUS_QUEUE_LENGTH: usize = 8;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Coils (FC01)
pub const FC_READ_COILS: u8 = 0x01;

/// Read Discrete Inputs (FC02)
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Read Input Registers (FC04)
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

/// Write Single Coil (FC05)
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Write Multiple Registers (FC16)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Exception flag set on the echoed function code
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Modbus Exception Codes
// ============================================================================

/// Illegal Function
pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;

/// Illegal Data Address
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// Illegal Data Value
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Server Device Failure
pub const EXCEPTION_SERVER_DEVICE_FAILURE: u8 = 0x04;

/// Acknowledge
pub const EXCEPTION_ACKNOWLEDGE: u8 = 0x05;

/// Server Device Busy
pub const EXCEPTION_SERVER_DEVICE_BUSY: u8 = 0x06;

/// Memory Parity Error
pub const EXCEPTION_MEMORY_PARITY_ERROR: u8 = 0x08;

/// Sentinel reported to completions when the device never answered
pub const EXCEPTION_NO_RESPONSE: u8 = 0xFF;

/// Sentinel reported when a reply arrived but failed length, echo or CRC checks
pub const EXCEPTION_BAD_FRAME: u8 = 0xFE;

// ============================================================================
// Spindle Timing and Retry
// ============================================================================

/// Consecutive failures tolerated per context before escalating
pub const VFD_RETRIES: u16 = 25;

/// Minimum interval between status polls, in milliseconds
pub const VFD_POLL_INTERVAL_MS: u64 = 100;

/// Number of VFD device addresses that can be configured
pub const VFD_N_ADDRESSES: usize = 4;

/// Default VFD bus address
pub const VFD_ADDRESS: u8 = 1;

/// Cached "programmed RPM" sentinel that never matches a real request
pub const RPM_INVALID: f32 = -1.0;

/// Spindles the registry can hold, the null spindle included
pub const SPINDLE_MAX: usize = 8;

/// Alarms held back during cold start
pub const ALARM_QUEUE_LENGTH: usize = 8;
