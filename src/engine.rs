//! # Transaction Engine
//!
//! A cooperative, tick-driven Modbus RTU master. The control loop calls
//! [`ModbusEngine::poll`] every iteration; nothing in here blocks except
//! [`ModbusBus::transact`], which spins the same state machine until its own
//! transaction resolves.
//!
//! ```text
//! Idle → Silent → Transmitting → AwaitingReply ─┬→ GotReply  ─┐
//!                                               ├→ Timeout   ─┼→ Idle
//!                                               └→ Exception ─┘
//! ```
//!
//! Only one transaction is ever on the wire. Non-blocking requests wait in a
//! bounded FIFO and their outcomes are parked in a completion queue until the
//! owner drains them with [`ModbusBus::next_completed`].

use heapless::{Deque, Vec as HVec};
use tracing::{debug, trace, warn};

use crate::adu::{verify_crc, Adu};
use crate::constants::{
    EXCEPTION_FLAG, EXCEPTION_FRAME_LEN, FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS,
    MAX_ADU_SIZE, MODBUS_QUEUE_LENGTH,
};
use crate::error::{ModbusError, ModbusResult};
use crate::message::{Context, Failure, ModbusMessage, Reply, TransactionOutcome};
use crate::spindle::{SpindleContext, SpindleId};
use crate::transport::{log_packet, BusStats, Clock, SilenceTimeout, Transport};

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ModbusState {
    Idle,
    Silent,
    Transmitting,
    AwaitingReply,
    GotReply,
    Timeout,
    Exception,
}

/// Serial line and timing configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModbusConfig {
    pub baud_rate: u32,
    /// Response window after the last request byte leaves the line
    pub rx_timeout_ms: u64,
    /// Hex-dump every frame at info level
    pub packet_logging: bool,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            baud_rate: 19200,
            rx_timeout_ms: 50,
            packet_logging: false,
        }
    }
}

impl ModbusConfig {
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_rx_timeout_ms(mut self, ms: u64) -> Self {
        self.rx_timeout_ms = ms;
        self
    }

    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }
}

/// Outcome of a non-blocking transaction, tagged with the spindle that sent it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    pub owner: SpindleId,
    pub outcome: TransactionOutcome,
}

/// Receiver of transaction outcomes
pub trait Completion {
    fn on_reply(&mut self, ctx: &mut SpindleContext<'_>, reply: &Reply);

    /// `failure.code()` carries the device exception or a no-response/bad-frame sentinel
    fn on_exception(&mut self, ctx: &mut SpindleContext<'_>, failure: Failure, context: Context);
}

/// Route an outcome to the matching completion callback
pub fn deliver<C: Completion + ?Sized>(
    outcome: TransactionOutcome,
    target: &mut C,
    ctx: &mut SpindleContext<'_>,
) {
    match outcome {
        TransactionOutcome::Reply(reply) => target.on_reply(ctx, &reply),
        TransactionOutcome::Failed { context, failure } => target.on_exception(ctx, failure, context),
    }
}

/// Half-duplex bus as seen by spindle adapters
pub trait ModbusBus {
    fn is_up(&self) -> bool;

    /// Queue a request; its outcome surfaces later through [`next_completed`](Self::next_completed)
    fn submit(&mut self, message: ModbusMessage, owner: SpindleId) -> ModbusResult<()>;

    /// Send a request and spin until it resolves. Queued traffic goes first.
    fn transact(&mut self, message: ModbusMessage) -> ModbusResult<TransactionOutcome>;

    /// Advance the state machine
    fn poll(&mut self);

    fn next_completed(&mut self) -> Option<Completed>;

    /// Apply an adapter's silence table, `None` for the engine default
    fn set_silence(&mut self, silence: Option<SilenceTimeout>);

    fn now_ms(&self) -> u64;

    fn state(&self) -> ModbusState;
}

struct Pending {
    message: ModbusMessage,
    /// `None` for blocking transactions
    owner: Option<SpindleId>,
}

/// Modbus RTU master over a [`Transport`]
pub struct ModbusEngine<T: Transport, C: Clock> {
    transport: T,
    clock: C,
    config: ModbusConfig,
    up: bool,
    state: ModbusState,
    silence: SilenceTimeout,
    silence_ms: u64,
    deadline: u64,
    queue: Deque<Pending, MODBUS_QUEUE_LENGTH>,
    current: Option<Pending>,
    rx: HVec<u8, MAX_ADU_SIZE>,
    rx_overflow: bool,
    outcome: Option<TransactionOutcome>,
    blocking_result: Option<TransactionOutcome>,
    completed: Deque<Completed, { MODBUS_QUEUE_LENGTH + 1 }>,
    stats: BusStats,
}

impl<T: Transport, C: Clock> ModbusEngine<T, C> {
    pub fn new(mut transport: T, clock: C, config: ModbusConfig) -> Self {
        let up = transport.set_baud(config.baud_rate);
        if !up {
            warn!("Modbus transport rejected {} baud", config.baud_rate);
        }
        transport.set_direction(false);
        let silence = SilenceTimeout::DEFAULT;

        Self {
            transport,
            clock,
            config,
            up,
            state: ModbusState::Idle,
            silence,
            silence_ms: silence.for_baud(config.baud_rate),
            deadline: 0,
            queue: Deque::new(),
            current: None,
            rx: HVec::new(),
            rx_overflow: false,
            outcome: None,
            blocking_result: None,
            completed: Deque::new(),
            stats: BusStats::default(),
        }
    }

    pub fn config(&self) -> &ModbusConfig {
        &self.config
    }

    pub fn stats(&self) -> &BusStats {
        &self.stats
    }

    pub fn silence_ms(&self) -> u64 {
        self.silence_ms
    }

    /// Requests waiting behind the one on the wire
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Reconfigure the line speed, the bus stays down if the transport refuses it
    pub fn set_baud(&mut self, baud: u32) -> ModbusResult<()> {
        self.up = self.transport.set_baud(baud);
        if !self.up {
            return Err(ModbusError::configuration(format!(
                "transport rejected {} baud",
                baud
            )));
        }
        self.config.baud_rate = baud;
        self.silence_ms = self.silence.for_baud(baud);
        Ok(())
    }

    /// Time to shift `bytes` out at the configured baud rate, 11 bits per character
    fn frame_time_ms(&self, bytes: usize) -> u64 {
        let bits = bytes as u64 * 11 * 1000;
        bits.div_ceil(self.config.baud_rate.max(1) as u64)
    }

    fn step(&mut self) {
        let now = self.clock.now_ms();

        match self.state {
            ModbusState::Idle => {
                if let Some(next) = self.queue.pop_front() {
                    self.begin(next, now);
                }
            }
            ModbusState::Silent => {
                if now >= self.deadline {
                    self.transmit(now);
                }
            }
            ModbusState::Transmitting => {
                if self.transport.tx_count() == 0 {
                    self.transport.set_direction(false);
                    self.deadline = now + self.config.rx_timeout_ms;
                    self.state = ModbusState::AwaitingReply;
                } else if now >= self.deadline {
                    self.abort_transmit();
                }
            }
            ModbusState::AwaitingReply => self.receive(now),
            ModbusState::GotReply | ModbusState::Timeout | ModbusState::Exception => {
                self.resolve()
            }
        }
    }

    fn begin(&mut self, pending: Pending, now: u64) {
        self.transport.flush_rx();
        self.rx.clear();
        self.rx_overflow = false;
        self.current = Some(pending);
        self.deadline = now + self.silence_ms;
        self.state = ModbusState::Silent;
    }

    fn transmit(&mut self, now: u64) {
        let Some(pending) = self.current.as_ref() else {
            self.state = ModbusState::Idle;
            return;
        };
        let context = pending.message.context;

        let frame = match pending.message.adu.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping unframeable {:?} request: {}", context, e);
                self.fail(ModbusState::Exception, context, Failure::BadFrame);
                return;
            }
        };

        if self.config.packet_logging {
            log_packet("send", frame.as_slice(), frame.address());
        }

        self.transport.set_direction(true);
        self.transport.write(frame.as_slice());
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;
        self.deadline = now + self.frame_time_ms(frame.len()) + self.config.rx_timeout_ms;
        self.state = ModbusState::Transmitting;
    }

    /// Transmit buffer never drained
    fn abort_transmit(&mut self) {
        let context = match self.current.as_ref() {
            Some(pending) => pending.message.context,
            None => {
                self.state = ModbusState::Idle;
                return;
            }
        };
        warn!(
            "Transmit of {:?} stalled with {} bytes pending",
            context,
            self.transport.tx_count()
        );
        self.transport.flush_tx();
        self.transport.set_direction(false);
        self.fail(ModbusState::Timeout, context, Failure::NoResponse);
    }

    fn receive(&mut self, now: u64) {
        let Some(pending) = self.current.as_ref() else {
            self.state = ModbusState::Idle;
            return;
        };
        let message = &pending.message;
        let context = message.context;

        while let Some(byte) = self.transport.read() {
            self.stats.bytes_received += 1;
            if self.rx.push(byte).is_err() {
                self.rx_overflow = true;
            }
        }

        let rx = self.rx.as_slice();

        if rx.len() >= EXCEPTION_FRAME_LEN && rx[1] & EXCEPTION_FLAG != 0 {
            self.log_rx();
            let frame = &rx[..EXCEPTION_FRAME_LEN];
            let failure = if !message.crc_check || verify_crc(frame) {
                Failure::Exception(frame[2])
            } else {
                Failure::BadFrame
            };
            debug!("Exception reply for {:?}: {:?}", context, failure);
            self.fail(ModbusState::Exception, context, failure);
            return;
        }

        if self.rx_overflow || rx.len() > message.rx_length {
            self.log_rx();
            debug!(
                "Reply for {:?} overran: {} bytes, expected {}",
                context,
                rx.len(),
                message.rx_length
            );
            self.fail(ModbusState::Exception, context, Failure::BadFrame);
            return;
        }

        if rx.len() == message.rx_length {
            self.log_rx();
            match validate_reply(message, rx) {
                Ok(()) => match Adu::from_slice(rx) {
                    Ok(adu) => {
                        self.stats.responses_received += 1;
                        self.outcome = Some(TransactionOutcome::Reply(Reply { context, adu }));
                        self.state = ModbusState::GotReply;
                    }
                    Err(_) => self.fail(ModbusState::Exception, context, Failure::BadFrame),
                },
                Err(e) => {
                    debug!("Rejected reply for {:?}: {}", context, e);
                    self.fail(ModbusState::Exception, context, Failure::BadFrame);
                }
            }
            return;
        }

        if now >= self.deadline {
            let failure = if rx.is_empty() {
                Failure::NoResponse
            } else {
                self.log_rx();
                Failure::BadFrame
            };
            debug!("Timeout waiting for {:?} reply ({} bytes)", context, self.rx.len());
            self.fail(ModbusState::Timeout, context, failure);
        }
    }

    fn log_rx(&self) {
        if self.config.packet_logging {
            log_packet("recv", &self.rx, self.rx.first().copied());
        }
    }

    fn fail(&mut self, state: ModbusState, context: Context, failure: Failure) {
        match failure {
            Failure::Exception(_) => self.stats.exceptions += 1,
            Failure::NoResponse => self.stats.timeouts += 1,
            Failure::BadFrame => self.stats.frame_errors += 1,
        }
        self.outcome = Some(TransactionOutcome::Failed { context, failure });
        self.state = state;
    }

    fn resolve(&mut self) {
        self.state = ModbusState::Idle;
        let (Some(pending), Some(outcome)) = (self.current.take(), self.outcome.take()) else {
            return;
        };

        match pending.owner {
            Some(owner) => {
                if self.completed.is_full() {
                    if let Some(stale) = self.completed.pop_front() {
                        warn!(
                            "Completion queue full, dropping {:?} outcome for spindle {}",
                            stale.outcome.context(),
                            stale.owner
                        );
                    }
                }
                let _ = self.completed.push_back(Completed { owner, outcome });
            }
            None => self.blocking_result = Some(outcome),
        }
    }

    fn accept(&mut self, message: &ModbusMessage) -> ModbusResult<()> {
        if !self.up {
            self.stats.rejected += 1;
            return Err(ModbusError::NotReady);
        }
        message.validate().inspect_err(|e| {
            self.stats.rejected += 1;
            warn!("Rejected {:?} request: {}", message.context, e);
        })
    }
}

/// Echo and byte-count checks on a reply of the expected length
fn validate_reply(message: &ModbusMessage, rx: &[u8]) -> ModbusResult<()> {
    if rx[0] != message.slave() {
        return Err(ModbusError::frame(format!(
            "slave mismatch: expected {}, got {}",
            message.slave(),
            rx[0]
        )));
    }
    if rx[1] != message.function() {
        return Err(ModbusError::frame(format!(
            "function mismatch: expected 0x{:02X}, got 0x{:02X}",
            message.function(),
            rx[1]
        )));
    }
    if matches!(rx[1], FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS)
        && rx.len().checked_sub(5) != Some(rx[2] as usize)
    {
        return Err(ModbusError::frame(format!(
            "byte count {} does not match {} byte reply",
            rx[2],
            rx.len()
        )));
    }
    if message.crc_check && !verify_crc(rx) {
        return Err(ModbusError::frame("CRC mismatch"));
    }
    Ok(())
}

impl<T: Transport, C: Clock> ModbusBus for ModbusEngine<T, C> {
    fn is_up(&self) -> bool {
        self.up
    }

    fn submit(&mut self, message: ModbusMessage, owner: SpindleId) -> ModbusResult<()> {
        self.accept(&message)?;
        let context = message.context;
        if self.queue.push_back(Pending { message, owner: Some(owner) }).is_err() {
            self.stats.rejected += 1;
            warn!("Modbus queue full, {:?} request dropped", context);
            return Err(ModbusError::QueueFull {
                capacity: MODBUS_QUEUE_LENGTH,
            });
        }
        trace!("Queued {:?} for spindle {}", context, owner);
        self.poll();
        Ok(())
    }

    fn transact(&mut self, message: ModbusMessage) -> ModbusResult<TransactionOutcome> {
        self.accept(&message)?;

        while self.state != ModbusState::Idle || !self.queue.is_empty() {
            self.poll();
            self.clock.idle();
        }

        self.blocking_result = None;
        let now = self.clock.now_ms();
        self.begin(Pending { message, owner: None }, now);

        loop {
            self.poll();
            if let Some(outcome) = self.blocking_result.take() {
                return Ok(outcome);
            }
            self.clock.idle();
        }
    }

    fn poll(&mut self) {
        loop {
            let before = self.state;
            self.step();
            if self.state == before {
                break;
            }
            // blocking results are collected by the caller between steps
            if self.blocking_result.is_some() {
                break;
            }
        }
    }

    fn next_completed(&mut self) -> Option<Completed> {
        self.completed.pop_front()
    }

    fn set_silence(&mut self, silence: Option<SilenceTimeout>) {
        self.silence = silence.unwrap_or(SilenceTimeout::DEFAULT);
        self.silence_ms = self.silence.for_baud(self.config.baud_rate);
        debug!(
            "Inter-frame silence {} ms at {} baud",
            self.silence_ms, self.config.baud_rate
        );
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn state(&self) -> ModbusState {
        self.state
    }
}
