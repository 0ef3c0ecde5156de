use rand::{Rng, RngCore};
use std::time::Duration;

/// Exponential schedule for retrying referral credits.
///
/// Each delay is drawn from `[backoff/2, backoff]` so retries from restarted
/// tables spread out.
pub(crate) struct RetrySchedule {
    initial: Duration,
    max: Duration,
    backoff: Duration,
    next_at_ms: Option<u64>,
}

impl RetrySchedule {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            backoff: initial,
            next_at_ms: None,
        }
    }

    /// Arm the schedule if nothing is pending yet. Returns true when a retry
    /// is due at `now_ms`.
    pub(crate) fn due(&mut self, now_ms: u64, rng: &mut impl RngCore) -> bool {
        match self.next_at_ms {
            None => {
                self.next_at_ms = Some(now_ms.saturating_add(jittered_ms(rng, self.backoff)));
                false
            }
            Some(at) => now_ms >= at,
        }
    }

    /// Retry succeeded for everything outstanding.
    pub(crate) fn reset(&mut self) {
        self.backoff = self.initial;
        self.next_at_ms = None;
    }

    /// Retry left work behind: double the backoff and schedule again.
    pub(crate) fn failed(&mut self, now_ms: u64, rng: &mut impl RngCore) -> Duration {
        self.backoff = self.backoff.saturating_mul(2).min(self.max);
        let delay = jittered_ms(rng, self.backoff);
        self.next_at_ms = Some(now_ms.saturating_add(delay));
        Duration::from_millis(delay)
    }
}

fn jittered_ms(rng: &mut impl RngCore, backoff: Duration) -> u64 {
    let backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX);
    if backoff_ms <= 1 {
        return backoff_ms;
    }
    let half_ms = backoff_ms / 2;
    half_ms.saturating_add(rng.gen_range(0..=half_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_schedule_backs_off_and_resets() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut schedule = RetrySchedule::new(Duration::from_secs(1), Duration::from_secs(4));

        // First call only arms the timer.
        assert!(!schedule.due(0, &mut rng));
        assert!(!schedule.due(400, &mut rng));
        assert!(schedule.due(1_000, &mut rng));

        let delay = schedule.failed(1_000, &mut rng);
        assert!(delay >= Duration::from_secs(1) && delay <= Duration::from_secs(2));
        schedule.failed(1_000, &mut rng);
        let delay = schedule.failed(1_000, &mut rng);
        assert!(delay >= Duration::from_secs(2) && delay <= Duration::from_secs(4));

        schedule.reset();
        assert!(!schedule.due(10_000, &mut rng));
        assert!(schedule.due(11_000, &mut rng));
    }
}
