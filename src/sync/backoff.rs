use rand::Rng;
use std::cmp;
use std::time::Duration;

/// Exponential backoff with full jitter: the nth delay is uniform in `[base, min(max, base * 2^n)]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Backoff {
            base,
            max: cmp::max(base, max),
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self
            .base
            .checked_mul(1u32 << cmp::min(self.attempt, 16))
            .map_or(self.max, |d| cmp::min(d, self.max));
        self.attempt = self.attempt.saturating_add(1);

        if ceiling <= self.base {
            return self.base;
        }
        let millis = rand::thread_rng().gen_range(self.base.as_millis() as u64..=ceiling.as_millis() as u64);
        Duration::from_millis(millis)
    }

    /// A delay the server asked for takes precedence, but never shortens the backoff.
    pub fn next_delay_at_least(&mut self, floor: Duration) -> Duration {
        cmp::max(self.next_delay(), floor)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(Duration::from_millis(200), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_within_bounds() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(2);
        let mut backoff = Backoff::new(base, max);

        for attempt in 0..20u32 {
            let delay = backoff.next_delay();
            let ceiling = cmp::min(max, base * 2u32.pow(cmp::min(attempt, 16)));
            assert!(delay >= base, "attempt {} delay {:?}", attempt, delay);
            assert!(delay <= ceiling, "attempt {} delay {:?}", attempt, delay);
        }

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), base);
    }

    #[test]
    fn server_hint_is_a_floor() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(20));
        assert!(backoff.next_delay_at_least(Duration::from_millis(500)) >= Duration::from_millis(500));
    }
}
