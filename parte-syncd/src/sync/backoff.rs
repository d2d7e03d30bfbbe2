use rand::Rng;
use std::time::Duration;
use time::OffsetDateTime;

/// Longest wait before a retry, whether computed or asked for by the server.
pub const MAX_RETRY_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Exponential retry delay for transiently failed outbox operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    /// Retries become eligible on the next cycle.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, false)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter && exp > 0 {
            rng.gen_range(exp / 2..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }

    /// When an operation that has already failed `attempt` times may run
    /// again. A server-supplied `Retry-After` wins over the computed delay and
    /// either is capped at `MAX_RETRY_WAIT`; `None` means no wait at all.
    pub fn retry_at(
        &self,
        now: OffsetDateTime,
        attempt: u32,
        retry_after_secs: Option<u64>,
    ) -> Option<OffsetDateTime> {
        let wait = match retry_after_secs {
            Some(secs) => Duration::from_secs(secs),
            None => self.delay(attempt),
        }
        .min(MAX_RETRY_WAIT);
        if wait.is_zero() {
            return None;
        }
        time::Duration::try_from(wait)
            .ok()
            .and_then(|wait| now.checked_add(wait))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(60), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn backoff_without_jitter_is_exponential() {
        let backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(800),
            false,
        );
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<_> = (0..5)
            .map(|attempt| backoff.delay_with_rng(attempt, &mut rng).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 800]);
    }

    #[test]
    fn jitter_stays_within_upper_half() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(800), true);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..32 {
            let delay = backoff.delay_with_rng(2, &mut rng);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(400));
        }
    }

    #[test]
    fn retry_after_header_overrides_backoff() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), false);
        let now = OffsetDateTime::UNIX_EPOCH;
        assert_eq!(
            backoff.retry_at(now, 0, Some(7)),
            Some(now + Duration::from_secs(7))
        );
        assert_eq!(
            backoff.retry_at(now, 2, None),
            Some(now + Duration::from_secs(4))
        );
    }

    #[test]
    fn huge_waits_are_capped() {
        let backoff = Backoff::new(Duration::from_secs(10), Duration::MAX, false);
        let now = OffsetDateTime::UNIX_EPOCH;
        assert_eq!(
            backoff.retry_at(now, 0, Some(u64::MAX / 2)),
            Some(now + MAX_RETRY_WAIT)
        );
        assert_eq!(backoff.retry_at(now, 64, None), Some(now + MAX_RETRY_WAIT));
    }

    #[test]
    fn immediate_backoff_sets_no_retry_time() {
        let backoff = Backoff::immediate();
        assert_eq!(backoff.retry_at(OffsetDateTime::UNIX_EPOCH, 5, None), None);
        assert_eq!(backoff.retry_at(OffsetDateTime::UNIX_EPOCH, 0, Some(0)), None);
    }
}
