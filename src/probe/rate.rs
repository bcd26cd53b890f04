//! Maximum data rate enforcement.

use chrono::{DateTime, Utc};

/// Admits datums no faster than `max_per_second`.
///
/// `None` admits everything, `0` admits nothing, and a positive rate requires
/// a gap of at least `1 / rate` seconds between admitted datums.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_per_second: Option<f64>,
    last_admitted: Option<DateTime<Utc>>,
}

impl RateLimiter {
    pub fn new(max_per_second: Option<f64>) -> Self {
        Self {
            max_per_second,
            last_admitted: None,
        }
    }

    pub fn admit(&mut self, timestamp: DateTime<Utc>) -> bool {
        let admitted = match self.max_per_second {
            None => true,
            Some(rate) if rate <= 0.0 => false,
            Some(rate) => match self.last_admitted {
                None => true,
                Some(last) => {
                    let gap_us = (timestamp - last).num_microseconds().unwrap_or(i64::MAX);
                    gap_us as f64 >= 1_000_000.0 / rate
                }
            },
        };
        if admitted {
            self.last_admitted = Some(timestamp);
        }
        admitted
    }

    pub fn reset(&mut self) {
        self.last_admitted = None;
    }

    pub fn max_per_second(&self) -> Option<f64> {
        self.max_per_second
    }

    /// Change the limit. The next datum is admitted against the new rate.
    pub fn set_rate(&mut self, max_per_second: Option<f64>) {
        self.max_per_second = max_per_second;
        self.last_admitted = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_unlimited() {
        let mut limiter = RateLimiter::new(None);
        let t = Utc::now();
        assert!((0..100).all(|_| limiter.admit(t)));
    }

    #[test]
    fn test_zero_drops_everything() {
        let mut limiter = RateLimiter::new(Some(0.0));
        assert!(!limiter.admit(Utc::now()));
    }

    #[test]
    fn test_minimum_gap() {
        let mut limiter = RateLimiter::new(Some(2.0));
        let t0 = Utc::now();
        assert!(limiter.admit(t0));
        assert!(!limiter.admit(t0 + Duration::milliseconds(100)));
        assert!(!limiter.admit(t0 + Duration::milliseconds(499)));
        assert!(limiter.admit(t0 + Duration::milliseconds(500)));
    }

    #[test]
    fn test_set_rate_applies_to_next_datum() {
        let mut limiter = RateLimiter::new(Some(0.0));
        let t = Utc::now();
        assert!(!limiter.admit(t));

        limiter.set_rate(Some(1.0));
        assert_eq!(limiter.max_per_second(), Some(1.0));
        assert!(limiter.admit(t));
        assert!(!limiter.admit(t + Duration::milliseconds(500)));

        limiter.set_rate(None);
        assert!(limiter.admit(t + Duration::milliseconds(600)));
    }
}
