//! Rate limiting of inbound session creation.
//!
//! Each attempt to open a session is counted per source address in a
//! counting Bloom filter. A source is refused once its count reaches the
//! configured maximum; the filter is replaced when its lifetime ends or when
//! it fills past 10%. Accepted sessions are also paced: an attempt within
//! the minimum interval of the previous accepted one is dropped (the peer
//! retransmits).

use std::net::IpAddr;
use std::time::Instant;

use tracing::{debug, trace};

use crate::bloom::CountingBloomFilter;
use crate::config::RateLimitConfig;

/// Outcome of an inbound session attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Accepted,
    /// The source has made too many attempts this filter lifetime.
    TooManyAttempts,
    /// Too soon after the last accepted session. The opener is dropped
    /// without state; the session is only created when the peer's
    /// handshake retransmit arrives after the interval has passed.
    Paced,
}

impl RateDecision {
    pub fn is_accepted(self) -> bool {
        self == RateDecision::Accepted
    }
}

#[derive(Debug)]
pub struct IncomingRateLimiter {
    config: RateLimitConfig,
    filter: CountingBloomFilter,
    created: Instant,
    last_accept: Option<Instant>,
}

impl IncomingRateLimiter {
    pub fn new(config: RateLimitConfig, now: Instant) -> Self {
        Self {
            filter: CountingBloomFilter::new(config.filter_size),
            config,
            created: now,
            last_accept: None,
        }
    }

    pub fn filter_size(&self) -> usize {
        self.filter.size()
    }

    /// Count an attempt from `ip` at `now` and decide whether a new
    /// session may be created.
    ///
    /// Nothing waits out the pacing interval here. A [`RateDecision::Paced`]
    /// attempt is recovered by the peer retransmitting its opener, which is
    /// counted as a fresh attempt.
    pub fn check(&mut self, ip: IpAddr, now: Instant) -> RateDecision {
        if now.saturating_duration_since(self.created) > self.config.window {
            trace!(size = self.filter.size(), "rate limit filter expired");
            self.filter = CountingBloomFilter::new(self.filter.size());
            self.created = now;
        }

        let hits = match ip {
            IpAddr::V4(v4) => self.filter.add(&v4.octets()),
            IpAddr::V6(v6) => self.filter.add(&v6.octets()),
        };

        let size = self.filter.size();
        let entries = self.filter.entry_count();
        if entries > 0 && size / entries < 10 {
            let grown = size + self.config.filter_size;
            debug!(size = grown, "rate limit filter grown");
            self.filter = CountingBloomFilter::new(grown);
            self.created = now;
        }

        if hits >= self.config.max_hits {
            debug!(%ip, hits, "inbound session refused: too many attempts");
            return RateDecision::TooManyAttempts;
        }

        if let Some(last) = self.last_accept {
            if now.saturating_duration_since(last) < self.config.min_accept_interval {
                trace!(%ip, "inbound session paced");
                return RateDecision::Paced;
            }
        }
        self.last_accept = Some(now);
        RateDecision::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([192, 0, 2, last])
    }

    #[test]
    fn fifteenth_attempt_is_refused() {
        let start = Instant::now();
        let mut limiter = IncomingRateLimiter::new(RateLimitConfig::default(), start);

        let decisions: Vec<_> = (0..20u64)
            .map(|i| limiter.check(ip(1), start + Duration::from_millis(150 * i)))
            .collect();

        assert!(decisions[..14].iter().all(|d| d.is_accepted()));
        assert!(decisions[14..]
            .iter()
            .all(|d| *d == RateDecision::TooManyAttempts));
    }

    #[test]
    fn rotation_forgives_the_source() {
        let start = Instant::now();
        let mut limiter = IncomingRateLimiter::new(RateLimitConfig::default(), start);
        for i in 0..20u64 {
            limiter.check(ip(1), start + Duration::from_millis(150 * i));
        }
        let later = start + Duration::from_secs(31);
        assert_eq!(limiter.check(ip(1), later), RateDecision::Accepted);
    }

    #[test]
    fn accepts_are_paced() {
        let start = Instant::now();
        let mut limiter = IncomingRateLimiter::new(RateLimitConfig::default(), start);
        assert!(limiter.check(ip(1), start).is_accepted());
        assert_eq!(
            limiter.check(ip(2), start + Duration::from_millis(20)),
            RateDecision::Paced
        );
        assert!(limiter
            .check(ip(2), start + Duration::from_millis(120))
            .is_accepted());
    }

    #[test]
    fn paced_opener_is_accepted_on_retransmit() {
        let start = Instant::now();
        let mut limiter = IncomingRateLimiter::new(RateLimitConfig::default(), start);
        assert!(limiter.check(ip(1), start).is_accepted());

        // Retransmits inside the interval stay paced and do not move it.
        for ms in [10, 50, 90] {
            assert_eq!(
                limiter.check(ip(2), start + Duration::from_millis(ms)),
                RateDecision::Paced
            );
        }
        assert!(limiter
            .check(ip(2), start + Duration::from_millis(100))
            .is_accepted());
        assert_eq!(
            limiter.check(ip(3), start + Duration::from_millis(150)),
            RateDecision::Paced
        );
    }

    #[test]
    fn filter_grows_when_crowded() {
        let start = Instant::now();
        let config = RateLimitConfig {
            filter_size: 100,
            min_accept_interval: Duration::ZERO,
            ..RateLimitConfig::default()
        };
        let mut limiter = IncomingRateLimiter::new(config, start);
        for i in 0..11u8 {
            limiter.check(ip(i), start);
        }
        assert_eq!(limiter.filter_size(), 200);
    }
}
