//! Alarm channel
//!
//! Escalations from the retry policy end up here. While the system is still
//! cold-starting the real-time alarm path is not drained yet, so alarms are
//! parked and delivered by [`AlarmChannel::system_started`].

use heapless::Vec as HVec;
use tracing::{error, warn};

use crate::constants::ALARM_QUEUE_LENGTH;
use crate::spindle::SpindleId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Alarm {
    /// Spindle stopped responding or kept rejecting commands
    Spindle,
}

/// Receiver of raised alarms, fire-and-forget
pub trait AlarmSink {
    fn raise(&mut self, alarm: Alarm);

    fn warning(&mut self, message: &str) {
        warn!("{}", message);
    }
}

/// Alarm routing with cold-start deferral
pub struct AlarmChannel {
    sink: Box<dyn AlarmSink>,
    cold_start: bool,
    deferred: HVec<Alarm, ALARM_QUEUE_LENGTH>,
    disable_requested: Option<SpindleId>,
}

impl AlarmChannel {
    /// Channels start in cold-start mode
    pub fn new(sink: Box<dyn AlarmSink>) -> Self {
        Self {
            sink,
            cold_start: true,
            deferred: HVec::new(),
            disable_requested: None,
        }
    }

    pub fn is_cold_start(&self) -> bool {
        self.cold_start
    }

    /// Deliver immediately
    pub fn raise(&mut self, alarm: Alarm) {
        self.sink.raise(alarm);
    }

    /// Deliver once cold start is over. Alarms beyond the queue depth are dropped.
    pub fn queue(&mut self, alarm: Alarm) {
        if self.cold_start {
            if self.deferred.push(alarm).is_err() {
                warn!("Cold-start alarm queue full, {:?} dropped", alarm);
            }
        } else {
            self.sink.raise(alarm);
        }
    }

    pub fn warning(&mut self, message: &str) {
        self.sink.warning(message);
    }

    /// Retries exhausted for `spindle`
    pub fn escalate(&mut self, spindle: SpindleId, disable: bool) {
        error!(
            "Spindle {} failed{}",
            spindle,
            if disable { ", disabling" } else { "" }
        );
        if self.cold_start {
            self.queue(Alarm::Spindle);
        } else {
            self.raise(Alarm::Spindle);
        }
        if disable {
            self.disable_requested = Some(spindle);
        }
    }

    /// Leave cold start and flush deferred alarms, returning how many were delivered
    pub fn system_started(&mut self) -> usize {
        self.cold_start = false;
        let deferred = std::mem::take(&mut self.deferred);
        let count = deferred.len();
        for alarm in deferred {
            self.sink.raise(alarm);
        }
        count
    }

    pub fn deferred(&self) -> &[Alarm] {
        &self.deferred
    }

    pub(crate) fn take_disable_request(&mut self) -> Option<SpindleId> {
        self.disable_requested.take()
    }
}
