//! Transactions, correlation tags and outcomes
//!
//! Modbus replies carry no semantic tag of their own, so every request travels
//! with a [`Context`] naming the logical operation it belongs to. The engine
//! hands the same tag back with the outcome and the adapter decodes the reply
//! by it.

use crate::adu::{Adu, AduBuilder};
use crate::constants::{
    CRC_LEN, EXCEPTION_BAD_FRAME, EXCEPTION_FLAG, EXCEPTION_NO_RESPONSE,
    FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS, MAX_ADU_SIZE, MAX_SLAVE_ADDRESS,
    MIN_FRAME_LEN,
};
use crate::error::{ModbusError, ModbusResult};

/// Logical operation a transaction belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Context {
    GetRpm,
    SetRpm,
    GetMinRpm,
    GetMaxRpm,
    GetRpmRange,
    GetRpmAt50Hz,
    SetStatus,
    GetMaxAmps,
    GetAmps,
}

impl Context {
    /// Number of distinct contexts
    pub const COUNT: usize = 9;

    /// Dense index for per-context tables
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// True for one-time device interrogation reads issued on selection
    pub fn is_interrogation(self) -> bool {
        matches!(
            self,
            Self::GetMinRpm
                | Self::GetMaxRpm
                | Self::GetRpmRange
                | Self::GetRpmAt50Hz
                | Self::GetMaxAmps
        )
    }
}

/// One outbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusMessage {
    pub context: Context,
    /// `address | function | payload`, CRC appended at transmit time
    pub adu: Adu,
    /// Expected reply length including CRC
    pub rx_length: usize,
    /// Verify the reply CRC before accepting it
    pub crc_check: bool,
}

impl ModbusMessage {
    pub fn new(context: Context, adu: Adu, rx_length: usize) -> Self {
        Self {
            context,
            adu,
            rx_length,
            crc_check: true,
        }
    }

    /// Skip reply CRC validation, for devices with broken checksums
    pub fn without_crc_check(mut self) -> Self {
        self.crc_check = false;
        self
    }

    /// Request length on the wire including CRC
    #[inline]
    pub fn tx_length(&self) -> usize {
        self.adu.len() + CRC_LEN
    }

    #[inline]
    pub fn slave(&self) -> u8 {
        self.adu.address().unwrap_or(0)
    }

    #[inline]
    pub fn function(&self) -> u8 {
        self.adu.function_code().unwrap_or(0)
    }

    /// Reject frames that can never produce a valid exchange
    pub fn validate(&self) -> ModbusResult<()> {
        if self.adu.len() < 2 {
            return Err(ModbusError::invalid_data("ADU has no function code"));
        }
        let slave = self.slave();
        if slave == 0 || slave > MAX_SLAVE_ADDRESS {
            return Err(ModbusError::invalid_data(format!(
                "slave address {} outside 1..={}",
                slave, MAX_SLAVE_ADDRESS
            )));
        }
        let fc = self.function();
        if fc == 0 || fc & EXCEPTION_FLAG != 0 {
            return Err(ModbusError::invalid_function(fc));
        }
        if self.tx_length() > MAX_ADU_SIZE {
            return Err(ModbusError::protocol(format!(
                "request of {} bytes exceeds {}",
                self.tx_length(),
                MAX_ADU_SIZE
            )));
        }
        if !(MIN_FRAME_LEN..=MAX_ADU_SIZE).contains(&self.rx_length) {
            return Err(ModbusError::invalid_data(format!(
                "expected reply length {} outside {}..={}",
                self.rx_length, MIN_FRAME_LEN, MAX_ADU_SIZE
            )));
        }
        Ok(())
    }

    /// FC03 read, reply is `addr fc count data.. crc`
    pub fn read_holding_registers(
        context: Context,
        slave: u8,
        start: u16,
        quantity: u16,
    ) -> ModbusResult<Self> {
        let adu = AduBuilder::build_read_request(slave, FC_READ_HOLDING_REGISTERS, start, quantity)?;
        Ok(Self::new(context, adu, 5 + 2 * quantity as usize))
    }

    /// FC04 read
    pub fn read_input_registers(
        context: Context,
        slave: u8,
        start: u16,
        quantity: u16,
    ) -> ModbusResult<Self> {
        let adu = AduBuilder::build_read_request(slave, FC_READ_INPUT_REGISTERS, start, quantity)?;
        Ok(Self::new(context, adu, 5 + 2 * quantity as usize))
    }

    /// FC06 write, reply echoes the request
    pub fn write_register(context: Context, slave: u8, register: u16, value: u16) -> ModbusResult<Self> {
        let adu = AduBuilder::build_write_single_register(slave, register, value)?;
        Ok(Self::new(context, adu, 8))
    }

    /// FC05 write, reply echoes the request
    pub fn write_coil(context: Context, slave: u8, address: u16, on: bool) -> ModbusResult<Self> {
        let adu = AduBuilder::build_write_single_coil(slave, address, on)?;
        Ok(Self::new(context, adu, 8))
    }

    /// FC16 write, reply is `addr fc start qty crc`
    pub fn write_registers(
        context: Context,
        slave: u8,
        register: u16,
        values: &[u16],
    ) -> ModbusResult<Self> {
        let adu = AduBuilder::build_write_multiple_registers(slave, register, values)?;
        Ok(Self::new(context, adu, 8))
    }

    /// Vendor framing that does not follow the standard function layouts
    pub fn raw(
        context: Context,
        slave: u8,
        function: u8,
        payload: &[u8],
        rx_length: usize,
    ) -> ModbusResult<Self> {
        let adu = AduBuilder::new(slave)
            .function_code(function)?
            .data(payload)?
            .build();
        Ok(Self::new(context, adu, rx_length))
    }
}

/// A validated reply frame, CRC included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub context: Context,
    pub adu: Adu,
}

impl Reply {
    #[inline]
    pub fn byte(&self, index: usize) -> Option<u8> {
        self.adu.as_slice().get(index).copied()
    }

    /// Big-endian register value at byte offset `index`
    #[inline]
    pub fn u16_at(&self, index: usize) -> Option<u16> {
        self.adu.u16_at(index)
    }
}

/// Why a transaction produced no usable reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Failure {
    /// Device answered with an exception code
    Exception(u8),
    /// Nothing arrived within the response window
    NoResponse,
    /// Reply failed length, echo or CRC validation
    BadFrame,
}

impl Failure {
    /// Exception code handed to completions, with sentinels for transport failures
    pub fn code(self) -> u8 {
        match self {
            Self::Exception(code) => code,
            Self::NoResponse => EXCEPTION_NO_RESPONSE,
            Self::BadFrame => EXCEPTION_BAD_FRAME,
        }
    }
}

/// Result of one resolved transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutcome {
    Reply(Reply),
    Failed { context: Context, failure: Failure },
}

impl TransactionOutcome {
    pub fn context(&self) -> Context {
        match self {
            Self::Reply(reply) => reply.context,
            Self::Failed { context, .. } => *context,
        }
    }

    pub fn is_reply(&self) -> bool {
        matches!(self, Self::Reply(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_lengths() {
        let msg = ModbusMessage::read_holding_registers(Context::GetRpm, 1, 0x2103, 1).unwrap();
        assert_eq!(msg.tx_length(), 8);
        assert_eq!(msg.rx_length, 7);

        let msg = ModbusMessage::read_input_registers(Context::GetRpm, 1, 0x0000, 2).unwrap();
        assert_eq!(msg.rx_length, 9);
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_broadcast_and_bad_lengths() {
        let msg = ModbusMessage::write_register(Context::SetRpm, 0, 0x2001, 1).unwrap();
        assert!(msg.validate().is_err());

        let mut msg = ModbusMessage::write_register(Context::SetRpm, 1, 0x2001, 1).unwrap();
        msg.rx_length = 2;
        assert!(msg.validate().is_err());

        msg.rx_length = MAX_ADU_SIZE + 1;
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_request() {
        let payload = [0u8; MAX_ADU_SIZE - 2];
        let msg = ModbusMessage::raw(Context::SetStatus, 1, 0x03, &payload, 6).unwrap();
        assert!(matches!(msg.validate(), Err(ModbusError::Protocol { .. })));
    }

    #[test]
    fn test_failure_codes() {
        assert_eq!(Failure::Exception(0x02).code(), 0x02);
        assert_eq!(Failure::NoResponse.code(), EXCEPTION_NO_RESPONSE);
        assert_eq!(Failure::BadFrame.code(), EXCEPTION_BAD_FRAME);
    }

    #[test]
    fn test_context_index_dense() {
        assert_eq!(Context::GetAmps.index(), Context::COUNT - 1);
        assert!(Context::GetRpmAt50Hz.is_interrogation());
        assert!(!Context::SetRpm.is_interrogation());
    }
}
