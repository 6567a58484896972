//! # Transport Contract
//!
//! The transaction engine never touches a UART directly. It talks to a
//! byte-oriented half-duplex channel through [`Transport`] and reads time
//! through [`Clock`], so the same state machine runs against real RS-485
//! hardware, the in-memory [`sim`](crate::sim) bus, or a test double.
//!
//! ## Inter-frame Silence
//!
//! RTU frames are delimited by bus silence of at least 3.5 character times.
//! Some drives need considerably more, so silence is a per-baud table that an
//! adapter may override on selection:
//!
//! | Baud | Default (ms) | Huanyang (ms) |
//! |------|--------------|---------------|
//! | 2400 | 16 | 16 |
//! | 4800 | 8 | 8 |
//! | 9600 | 4 | 6 |
//! | 19200 | 2 | 6 |
//! | 38400 | 2 | 6 |
//! | 115200 | 2 | 6 |

use std::time::Instant;

use tracing::info;

/// Byte-oriented half-duplex serial channel
pub trait Transport {
    /// Reconfigure the line speed
    fn set_baud(&mut self, baud: u32) -> bool;

    /// Drive the RS-485 direction line, `true` for transmit.
    /// Hardware with automatic direction control keeps the default.
    fn set_direction(&mut self, _tx: bool) {}

    /// Queue bytes for transmission
    fn write(&mut self, data: &[u8]);

    /// Pop one received byte
    fn read(&mut self) -> Option<u8>;

    /// Bytes waiting in the receive buffer
    fn rx_count(&self) -> usize;

    /// Bytes not yet shifted out of the transmit buffer
    fn tx_count(&self) -> usize;

    fn flush_rx(&mut self);

    fn flush_tx(&mut self);
}

/// Millisecond time source for the engine
pub trait Clock {
    fn now_ms(&self) -> u64;

    /// Called on every spin of a blocking wait
    fn idle(&self) {}
}

/// Wall clock anchored at construction
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn idle(&self) {
        std::hint::spin_loop();
    }
}

/// Inter-frame silence per baud rate, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SilenceTimeout {
    pub b2400: u16,
    pub b4800: u16,
    pub b9600: u16,
    pub b19200: u16,
    pub b38400: u16,
    pub b115200: u16,
}

impl SilenceTimeout {
    pub const DEFAULT: Self = Self {
        b2400: 16,
        b4800: 8,
        b9600: 4,
        b19200: 2,
        b38400: 2,
        b115200: 2,
    };

    /// Slowest entry that still covers `baud`
    pub fn for_baud(&self, baud: u32) -> u64 {
        let ms = match baud {
            0..=2400 => self.b2400,
            2401..=4800 => self.b4800,
            4801..=9600 => self.b9600,
            9601..=19200 => self.b19200,
            19201..=38400 => self.b38400,
            _ => self.b115200,
        };
        ms as u64
    }
}

impl Default for SilenceTimeout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Bus traffic statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub exceptions: u64,
    pub timeouts: u64,
    pub frame_errors: u64,
    pub rejected: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl BusStats {
    /// Share of sent requests that got a valid reply, in percent
    pub fn success_rate(&self) -> f64 {
        if self.requests_sent == 0 {
            return 0.0;
        }
        self.responses_received as f64 / self.requests_sent as f64 * 100.0
    }
}

pub(crate) fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Log packet with direction and slave
pub(crate) fn log_packet(direction: &str, data: &[u8], slave: Option<u8>) {
    let hex_string = format_hex_packet(data);
    match slave {
        Some(id) => info!("[MODBUS-RTU] {} slave:{} {}", direction, id, hex_string),
        None => info!("[MODBUS-RTU] {} {}", direction, hex_string),
    }
}
