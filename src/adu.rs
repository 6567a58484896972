//! Modbus RTU application data unit
//!
//! An [`Adu`] is a fixed-size stack buffer holding `address | function | payload`.
//! The CRC trailer is only appended when the frame goes out on the wire
//! ([`Adu::to_frame`]) and is checked with [`verify_crc`] on the way back in.
//!
//! ## Wire Layout
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0 | Slave address |
//! | 1 | Function code (bit 7 set on exception replies) |
//! | 2.. | Payload |
//! | n-2, n-1 | CRC-16/MODBUS, low byte first |

use crc::{Crc, CRC_16_MODBUS};
use tracing::debug;

use crate::constants::{
    CRC_LEN, EXCEPTION_FLAG, FC_READ_COILS, FC_READ_INPUT_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER, MAX_ADU_SIZE,
};
use crate::error::{ModbusError, ModbusResult};

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16/MODBUS over `data`
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Check the little-endian CRC trailer of a complete RTU frame
pub fn verify_crc(frame: &[u8]) -> bool {
    if frame.len() < CRC_LEN + 1 {
        return false;
    }
    let (body, trailer) = frame.split_at(frame.len() - CRC_LEN);
    let received = u16::from_le_bytes([trailer[0], trailer[1]]);
    crc16(body) == received
}

/// Stack-allocated RTU frame without CRC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adu {
    /// Fixed-size buffer (stack)
    data: [u8; MAX_ADU_SIZE],
    /// Actual data length
    len: usize,
}

impl Adu {
    /// Create an empty ADU
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_ADU_SIZE],
            len: 0,
        }
    }

    /// Create an ADU from a byte slice
    pub fn from_slice(data: &[u8]) -> ModbusResult<Self> {
        if data.len() > MAX_ADU_SIZE {
            return Err(ModbusError::protocol(format!(
                "ADU too large: {} bytes (max {})",
                data.len(),
                MAX_ADU_SIZE
            )));
        }

        let mut adu = Self::new();
        adu.data[..data.len()].copy_from_slice(data);
        adu.len = data.len();
        Ok(adu)
    }

    /// Push a single byte
    #[inline]
    pub fn push(&mut self, byte: u8) -> ModbusResult<()> {
        if self.len >= MAX_ADU_SIZE {
            return Err(ModbusError::protocol("ADU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> ModbusResult<()> {
        self.push((value >> 8) as u8)?;
        self.push((value & 0xFF) as u8)?;
        Ok(())
    }

    /// Extend with a byte slice
    pub fn extend(&mut self, data: &[u8]) -> ModbusResult<()> {
        if self.len + data.len() > MAX_ADU_SIZE {
            return Err(ModbusError::protocol(format!(
                "ADU would exceed max size: {} + {} > {}",
                self.len,
                data.len(),
                MAX_ADU_SIZE
            )));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slave address (first byte)
    #[inline]
    pub fn address(&self) -> Option<u8> {
        self.as_slice().first().copied()
    }

    /// Function code (second byte)
    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        self.as_slice().get(1).copied()
    }

    /// Check if exception response
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & EXCEPTION_FLAG != 0)
            .unwrap_or(false)
    }

    /// Get exception code
    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() {
            self.as_slice().get(2).copied()
        } else {
            None
        }
    }

    /// Big-endian u16 starting at `index`
    #[inline]
    pub fn u16_at(&self, index: usize) -> Option<u16> {
        let bytes = self.as_slice();
        match (bytes.get(index), bytes.get(index + 1)) {
            (Some(&hi), Some(&lo)) => Some(u16::from_be_bytes([hi, lo])),
            _ => None,
        }
    }

    /// Wire frame: this ADU followed by its CRC, low byte first
    pub fn to_frame(&self) -> ModbusResult<Adu> {
        let mut frame = self.clone();
        let crc = crc16(self.as_slice());
        frame.extend(&crc.to_le_bytes())?;
        Ok(frame)
    }

    /// Get human-readable function code description
    pub fn function_code_description(fc: u8) -> &'static str {
        match fc & !EXCEPTION_FLAG {
            0x01 => "Read Coils",
            0x02 => "Read Discrete Inputs",
            0x03 => "Read Holding Registers",
            0x04 => "Read Input Registers",
            0x05 => "Write Single Coil",
            0x06 => "Write Single Register",
            0x10 => "Write Multiple Registers",
            _ => "Unknown Function",
        }
    }
}

impl Default for Adu {
    fn default() -> Self {
        Self::new()
    }
}

/// ADU builder - fluent API
pub struct AduBuilder {
    adu: Adu,
}

impl AduBuilder {
    /// Start a frame addressed to `slave`
    #[inline]
    pub fn new(slave: u8) -> Self {
        let mut adu = Adu::new();
        adu.data[0] = slave;
        adu.len = 1;
        Self { adu }
    }

    /// Set function code
    #[inline]
    pub fn function_code(mut self, fc: u8) -> ModbusResult<Self> {
        self.adu.push(fc)?;
        Ok(self)
    }

    /// Add register or coil address
    #[inline]
    pub fn address(mut self, addr: u16) -> ModbusResult<Self> {
        self.adu.push_u16(addr)?;
        Ok(self)
    }

    /// Add quantity
    #[inline]
    pub fn quantity(mut self, qty: u16) -> ModbusResult<Self> {
        self.adu.push_u16(qty)?;
        Ok(self)
    }

    /// Add a big-endian register value
    #[inline]
    pub fn value(mut self, value: u16) -> ModbusResult<Self> {
        self.adu.push_u16(value)?;
        Ok(self)
    }

    /// Add a byte
    #[inline]
    pub fn byte(mut self, b: u8) -> ModbusResult<Self> {
        self.adu.push(b)?;
        Ok(self)
    }

    /// Add data
    #[inline]
    pub fn data(mut self, data: &[u8]) -> ModbusResult<Self> {
        self.adu.extend(data)?;
        Ok(self)
    }

    /// Build the ADU
    pub fn build(self) -> Adu {
        if let Some(fc) = self.adu.function_code() {
            debug!(
                "ADU built: slave={} FC={:02X} ({}), len={}",
                self.adu.data[0],
                fc,
                Adu::function_code_description(fc),
                self.adu.len()
            );
        }
        self.adu
    }

    /// Build a read request for FC01-04
    pub fn build_read_request(
        slave: u8,
        fc: u8,
        start_address: u16,
        quantity: u16,
    ) -> ModbusResult<Adu> {
        if !(FC_READ_COILS..=FC_READ_INPUT_REGISTERS).contains(&fc) {
            return Err(ModbusError::invalid_function(fc));
        }
        Ok(AduBuilder::new(slave)
            .function_code(fc)?
            .address(start_address)?
            .quantity(quantity)?
            .build())
    }

    /// Build a write single coil request (FC05)
    pub fn build_write_single_coil(slave: u8, address: u16, value: bool) -> ModbusResult<Adu> {
        let coil_value: u16 = if value { 0xFF00 } else { 0x0000 };
        Ok(AduBuilder::new(slave)
            .function_code(FC_WRITE_SINGLE_COIL)?
            .address(address)?
            .value(coil_value)?
            .build())
    }

    /// Build a write single register request (FC06)
    pub fn build_write_single_register(slave: u8, address: u16, value: u16) -> ModbusResult<Adu> {
        Ok(AduBuilder::new(slave)
            .function_code(FC_WRITE_SINGLE_REGISTER)?
            .address(address)?
            .value(value)?
            .build())
    }

    /// Build a write multiple registers request (FC16)
    pub fn build_write_multiple_registers(
        slave: u8,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<Adu> {
        let byte_count = u8::try_from(values.len() * 2)
            .map_err(|_| ModbusError::invalid_data("too many registers"))?;

        let mut builder = AduBuilder::new(slave)
            .function_code(FC_WRITE_MULTIPLE_REGISTERS)?
            .address(address)?
            .quantity(values.len() as u16)?
            .byte(byte_count)?;

        for &value in values {
            builder = builder.value(value)?;
        }

        Ok(builder.build())
    }
}
