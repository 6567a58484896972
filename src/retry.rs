//! Retry and escalation policy
//!
//! Failures are counted per [`Context`] so a flaky status poll does not eat
//! into the budget of a speed write. With `max_retries = N` an operation is
//! attempted at most `N + 1` times; the failure after the last retry resets
//! the counter and reports [`RetryDecision::Exhausted`].

use crate::constants::VFD_RETRIES;
use crate::message::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u16,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: VFD_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u16) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-issue the operation, `attempt` counts from 1
    Retry { attempt: u16 },
    /// Budget spent; counter already reset
    Exhausted,
}

/// Consecutive failure counters for one adapter
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    counters: [u16; Context::COUNT],
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            counters: [0; Context::COUNT],
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    #[inline]
    pub fn count(&self, context: Context) -> u16 {
        self.counters[context.index()]
    }

    pub fn record_success(&mut self, context: Context) {
        self.counters[context.index()] = 0;
    }

    pub fn record_failure(&mut self, context: Context) -> RetryDecision {
        let counter = &mut self.counters[context.index()];
        *counter = counter.saturating_add(1);
        if *counter > self.policy.max_retries {
            *counter = 0;
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry { attempt: *counter }
        }
    }

    pub fn reset_all(&mut self) {
        self.counters = [0; Context::COUNT];
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausts_after_max_retries() {
        let mut state = RetryState::new(RetryPolicy::default().with_max_retries(3));

        for attempt in 1..=3 {
            assert_eq!(
                state.record_failure(Context::SetRpm),
                RetryDecision::Retry { attempt }
            );
        }
        assert_eq!(state.record_failure(Context::SetRpm), RetryDecision::Exhausted);
        assert_eq!(state.count(Context::SetRpm), 0);
    }

    #[test]
    fn test_success_resets_only_its_context() {
        let mut state = RetryState::default();
        state.record_failure(Context::SetRpm);
        state.record_failure(Context::GetRpm);
        state.record_success(Context::GetRpm);

        assert_eq!(state.count(Context::SetRpm), 1);
        assert_eq!(state.count(Context::GetRpm), 0);

        state.reset_all();
        assert_eq!(state.count(Context::SetRpm), 0);
    }

    #[test]
    fn test_zero_retries_escalates_on_first_failure() {
        let mut state = RetryState::new(RetryPolicy { max_retries: 0 });
        assert_eq!(state.record_failure(Context::SetStatus), RetryDecision::Exhausted);
    }
}
