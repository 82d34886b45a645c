// ── Integration setup retry ──
//
// Backoff for re-attempting zone/policy setup from the watcher. Time is
// passed in so the transitions can be driven without real timers.

use std::time::{Duration, Instant};

/// Delay before the next attempt, indexed by attempts made so far and
/// clamped to the last entry.
pub const DEFAULT_BACKOFF: [Duration; 3] = [
    Duration::ZERO,
    Duration::from_secs(5),
    Duration::from_secs(10),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    Retrying {
        attempt: u32,
        next_eligible_at: Instant,
    },
    Succeeded,
    /// Credential known invalid; nothing is attempted until cleared.
    Degraded,
}

#[derive(Debug, Clone)]
pub struct RetryMachine {
    state: RetryState,
    backoff: Vec<Duration>,
}

impl Default for RetryMachine {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF.to_vec())
    }
}

impl RetryMachine {
    pub fn new(backoff: Vec<Duration>) -> Self {
        Self {
            state: RetryState::Idle,
            backoff,
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    pub fn is_degraded(&self) -> bool {
        self.state == RetryState::Degraded
    }

    /// Claim the next attempt if one is due at `now`, returning its
    /// 1-based number.
    pub fn begin_attempt(&mut self, now: Instant) -> Option<u32> {
        let attempt = match self.state {
            RetryState::Degraded => return None,
            RetryState::Retrying {
                next_eligible_at, ..
            } if now < next_eligible_at => return None,
            RetryState::Retrying { attempt, .. } => attempt.saturating_add(1),
            RetryState::Idle | RetryState::Succeeded => 1,
        };
        self.state = RetryState::Retrying {
            attempt,
            next_eligible_at: now + self.delay_after(attempt),
        };
        Some(attempt)
    }

    /// Setup is established; the next failure starts from zero delay.
    pub fn succeed(&mut self) {
        if !self.is_degraded() {
            self.state = RetryState::Succeeded;
        }
    }

    pub fn degrade(&mut self) {
        self.state = RetryState::Degraded;
    }

    /// Leave degraded mode after a new credential is accepted.
    pub fn reset(&mut self) {
        self.state = RetryState::Idle;
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        let index = usize::try_from(attempt).unwrap_or(usize::MAX);
        self.backoff
            .get(index)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn backoff_grows_then_plateaus() {
        let mut retry = RetryMachine::default();
        let t0 = Instant::now();

        assert_eq!(retry.begin_attempt(t0), Some(1));
        assert_eq!(retry.begin_attempt(t0 + Duration::from_secs(4)), None);
        assert_eq!(retry.begin_attempt(t0 + Duration::from_secs(5)), Some(2));

        let t2 = t0 + Duration::from_secs(5);
        assert_eq!(retry.begin_attempt(t2 + Duration::from_secs(9)), None);
        assert_eq!(retry.begin_attempt(t2 + Duration::from_secs(10)), Some(3));

        let t3 = t2 + Duration::from_secs(10);
        assert_eq!(retry.begin_attempt(t3 + Duration::from_secs(10)), Some(4));
    }

    #[test]
    fn success_resets_to_immediate() {
        let mut retry = RetryMachine::default();
        let t0 = Instant::now();
        retry.begin_attempt(t0).unwrap();
        retry.begin_attempt(t0 + Duration::from_secs(5)).unwrap();
        retry.succeed();
        assert_eq!(retry.state(), RetryState::Succeeded);
        assert_eq!(retry.begin_attempt(t0 + Duration::from_secs(6)), Some(1));
    }

    #[test]
    fn degraded_suppresses_until_reset() {
        let mut retry = RetryMachine::default();
        let t0 = Instant::now();
        retry.degrade();
        assert_eq!(retry.begin_attempt(t0), None);
        assert_eq!(retry.begin_attempt(t0 + Duration::from_secs(3600)), None);
        retry.succeed();
        assert!(retry.is_degraded());

        retry.reset();
        assert_eq!(retry.begin_attempt(t0), Some(1));
    }
}
