//! In-memory bus for tests, benches and the demo
//!
//! [`SimTransport`] loops requests through a responder closure and delivers
//! the reply after a configurable latency measured on a shared
//! [`ManualClock`]. [`SimulatedVfd`] is a small register-map device that
//! answers the standard function codes. Handles are `Rc`-backed so a test can
//! keep a clone after moving the transport into the engine.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::adu::{crc16, verify_crc};
use crate::alarm::{Alarm, AlarmSink};
use crate::constants::{
    EXCEPTION_FLAG, EXCEPTION_ILLEGAL_FUNCTION, FC_READ_HOLDING_REGISTERS,
    FC_READ_INPUT_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL,
    FC_WRITE_SINGLE_REGISTER,
};
use crate::settings::{SettingsStore, TransferResult};
use crate::transport::{Clock, Transport};

/// Reply generator, `None` means the device stays silent
pub type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>>>;

/// Clock advanced by hand; every blocking spin moves it forward one step
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
    step: u64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Rc::new(Cell::new(0)),
            step: 1,
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }

    pub fn set(&self, ms: u64) {
        self.now.set(ms);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn idle(&self) {
        self.advance(self.step);
    }
}

struct SimBus {
    clock: ManualClock,
    responder: Responder,
    latency_ms: u64,
    baud: u32,
    rx: VecDeque<u8>,
    scheduled: Option<(u64, Vec<u8>)>,
    requests: Vec<Vec<u8>>,
    direction: Vec<bool>,
    transmitting: bool,
    overlaps: usize,
}

impl SimBus {
    fn deliver_due(&mut self) {
        let now = self.clock.now_ms();
        if matches!(self.scheduled, Some((at, _)) if at <= now) {
            if let Some((_, reply)) = self.scheduled.take() {
                self.rx.extend(reply);
            }
        }
    }
}

/// Loopback transport driven by a [`Responder`]
#[derive(Clone)]
pub struct SimTransport {
    inner: Rc<RefCell<SimBus>>,
}

impl SimTransport {
    pub fn new(clock: ManualClock, responder: Responder) -> Self {
        Self {
            inner: Rc::new(RefCell::new(SimBus {
                clock,
                responder,
                latency_ms: 0,
                baud: 0,
                rx: VecDeque::new(),
                scheduled: None,
                requests: Vec::new(),
                direction: Vec::new(),
                transmitting: false,
                overlaps: 0,
            })),
        }
    }

    /// Delay between a request and its reply becoming readable
    pub fn with_latency(self, ms: u64) -> Self {
        self.inner.borrow_mut().latency_ms = ms;
        self
    }

    /// Every frame written so far, CRC included
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.inner.borrow().requests.clone()
    }

    /// Direction line history, `true` for transmit
    pub fn direction_changes(&self) -> Vec<bool> {
        self.inner.borrow().direction.clone()
    }

    /// Writes issued while a previous reply was still outstanding, or with the line in receive mode
    pub fn overlaps(&self) -> usize {
        self.inner.borrow().overlaps
    }

    pub fn baud(&self) -> u32 {
        self.inner.borrow().baud
    }

    pub fn clear_requests(&self) {
        self.inner.borrow_mut().requests.clear();
    }
}

impl Transport for SimTransport {
    fn set_baud(&mut self, baud: u32) -> bool {
        self.inner.borrow_mut().baud = baud;
        baud > 0
    }

    fn set_direction(&mut self, tx: bool) {
        let mut bus = self.inner.borrow_mut();
        bus.transmitting = tx;
        bus.direction.push(tx);
    }

    fn write(&mut self, data: &[u8]) {
        let mut bus = self.inner.borrow_mut();
        bus.deliver_due();
        if bus.scheduled.is_some() || !bus.rx.is_empty() || !bus.transmitting {
            bus.overlaps += 1;
        }
        bus.requests.push(data.to_vec());

        let reply = (bus.responder)(data);
        let at = bus.clock.now_ms() + bus.latency_ms;
        bus.scheduled = reply.map(|reply| (at, reply));
        bus.deliver_due();
    }

    fn read(&mut self) -> Option<u8> {
        let mut bus = self.inner.borrow_mut();
        bus.deliver_due();
        bus.rx.pop_front()
    }

    fn rx_count(&self) -> usize {
        let mut bus = self.inner.borrow_mut();
        bus.deliver_due();
        bus.rx.len()
    }

    fn tx_count(&self) -> usize {
        0
    }

    fn flush_rx(&mut self) {
        self.inner.borrow_mut().rx.clear();
    }

    fn flush_tx(&mut self) {}
}

/// Append the Modbus CRC to `body`
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut out = body.to_vec();
    out.extend_from_slice(&crc16(body).to_le_bytes());
    out
}

/// Register-map VFD answering FC03/04/05/06/16
#[derive(Debug, Clone, Default)]
pub struct SimulatedVfd {
    pub address: u8,
    registers: HashMap<u16, u16>,
    coils: HashMap<u16, bool>,
    /// Writes to `.0` are copied to `.1`, e.g. set frequency to output frequency
    mirrors: Vec<(u16, u16)>,
    fail_with: Option<u8>,
    silent: bool,
    writes: Vec<(u16, u16)>,
}

impl SimulatedVfd {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }

    pub fn with_register(mut self, register: u16, value: u16) -> Self {
        self.registers.insert(register, value);
        self
    }

    pub fn with_mirror(mut self, from: u16, to: u16) -> Self {
        self.mirrors.push((from, to));
        self
    }

    /// Answer every request with this exception code
    pub fn failing_with(mut self, code: u8) -> Self {
        self.fail_with = Some(code);
        self
    }

    /// Never answer
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn set_failing(&mut self, code: Option<u8>) {
        self.fail_with = code;
    }

    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    pub fn register(&self, register: u16) -> u16 {
        self.registers.get(&register).copied().unwrap_or(0)
    }

    pub fn set_register(&mut self, register: u16, value: u16) {
        self.registers.insert(register, value);
    }

    pub fn coil(&self, address: u16) -> bool {
        self.coils.get(&address).copied().unwrap_or(false)
    }

    /// Register writes in arrival order
    pub fn writes(&self) -> &[(u16, u16)] {
        &self.writes
    }

    pub fn shared(self) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(self))
    }

    pub fn responder(device: &Rc<RefCell<Self>>) -> Responder {
        let device = Rc::clone(device);
        Box::new(move |request: &[u8]| device.borrow_mut().respond(request))
    }

    fn write_register(&mut self, register: u16, value: u16) {
        self.registers.insert(register, value);
        self.writes.push((register, value));
        for &(from, to) in &self.mirrors {
            if from == register {
                self.registers.insert(to, value);
            }
        }
    }

    fn exception(&self, fc: u8, code: u8) -> Option<Vec<u8>> {
        Some(frame(&[self.address, fc | EXCEPTION_FLAG, code]))
    }

    pub fn respond(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        if self.silent || request.len() < 4 || !verify_crc(request) || request[0] != self.address {
            return None;
        }
        let fc = request[1];
        if let Some(code) = self.fail_with {
            return self.exception(fc, code);
        }

        let word = |i: usize| u16::from_be_bytes([request[i], request[i + 1]]);
        let body = &request[..request.len() - 2];

        match fc {
            FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS if body.len() == 6 => {
                let start = word(2);
                let quantity = word(4);
                let mut reply = vec![self.address, fc, (quantity * 2) as u8];
                for offset in 0..quantity {
                    reply.extend_from_slice(&self.register(start + offset).to_be_bytes());
                }
                Some(frame(&reply))
            }
            FC_WRITE_SINGLE_REGISTER if body.len() == 6 => {
                self.write_register(word(2), word(4));
                Some(request.to_vec())
            }
            FC_WRITE_SINGLE_COIL if body.len() == 6 => {
                self.coils.insert(word(2), word(4) == 0xFF00);
                Some(request.to_vec())
            }
            FC_WRITE_MULTIPLE_REGISTERS if body.len() >= 7 => {
                let start = word(2);
                let quantity = word(4);
                for offset in 0..quantity as usize {
                    let index = 7 + offset * 2;
                    if index + 1 < body.len() {
                        self.write_register(start + offset as u16, word(index));
                    }
                }
                Some(frame(&body[..6]))
            }
            _ => self.exception(fc, EXCEPTION_ILLEGAL_FUNCTION),
        }
    }
}

/// Alarm sink that records what it receives
#[derive(Debug, Clone, Default)]
pub struct RecordingAlarms {
    alarms: Rc<RefCell<Vec<Alarm>>>,
    warnings: Rc<RefCell<Vec<String>>>,
}

impl RecordingAlarms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alarms(&self) -> Vec<Alarm> {
        self.alarms.borrow().clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.borrow().clone()
    }
}

impl AlarmSink for RecordingAlarms {
    fn raise(&mut self, alarm: Alarm) {
        self.alarms.borrow_mut().push(alarm);
    }

    fn warning(&mut self, message: &str) {
        self.warnings.borrow_mut().push(message.to_string());
    }
}

/// Settings store backed by a byte vector
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    contents: Option<Vec<u8>>,
    saves: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(contents: Vec<u8>) -> Self {
        Self {
            contents: Some(contents),
            saves: 0,
        }
    }

    pub fn contents(&self) -> Option<Vec<u8>> {
        self.contents.clone()
    }

    pub fn saves(&self) -> usize {
        self.saves
    }
}

impl SettingsStore for MemoryStore {
    fn load(&mut self) -> Result<Vec<u8>, TransferResult> {
        self.contents.clone().ok_or(TransferResult::Failed)
    }

    fn save(&mut self, data: &[u8]) -> TransferResult {
        self.contents = Some(data.to_vec());
        self.saves += 1;
        TransferResult::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_vfd_read_write() {
        let mut vfd = SimulatedVfd::new(1).with_mirror(0x2001, 0x2103);

        let write = frame(&[0x01, 0x06, 0x20, 0x01, 0x13, 0x88]);
        assert_eq!(vfd.respond(&write), Some(write.clone()));
        assert_eq!(vfd.register(0x2103), 5000);

        let read = frame(&[0x01, 0x03, 0x21, 0x03, 0x00, 0x01]);
        assert_eq!(
            vfd.respond(&read),
            Some(frame(&[0x01, 0x03, 0x02, 0x13, 0x88]))
        );
    }

    #[test]
    fn test_simulated_vfd_ignores_other_slaves() {
        let mut vfd = SimulatedVfd::new(2);
        let read = frame(&[0x01, 0x03, 0x21, 0x03, 0x00, 0x01]);
        assert_eq!(vfd.respond(&read), None);
    }

    #[test]
    fn test_simulated_vfd_unknown_function() {
        let mut vfd = SimulatedVfd::new(1);
        let request = frame(&[0x01, 0x2B, 0x00, 0x00]);
        assert_eq!(vfd.respond(&request), Some(frame(&[0x01, 0xAB, 0x01])));
    }

    #[test]
    fn test_latency_holds_reply() {
        let clock = ManualClock::new();
        let mut transport =
            SimTransport::new(clock.clone(), Box::new(|_req: &[u8]| Some(vec![1, 2, 3]))).with_latency(5);

        transport.set_direction(true);
        transport.write(&[0x01]);
        assert_eq!(transport.rx_count(), 0);
        clock.advance(5);
        assert_eq!(transport.rx_count(), 3);
        assert_eq!(transport.read(), Some(1));
    }
}
