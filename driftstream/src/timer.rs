//! Adaptive timer base.
//!
//! The timer base (milliseconds) is the unit from which both the retransmit
//! timeout (5/3 of the base) and the explicit-ack timeout (one base) are
//! derived. Only the side that opened the session tunes it, once per
//! statistics window:
//!
//! resend ratio >= 0.25            -> base *= 1 + ratio
//! duplicate ratio / 2 >= 0.25     -> base *= 1 + ratio / 2
//! no resends and no duplicates    -> base -= base / 10
//!
//! Results are rounded down to 10 ms and clamped to [100 ms, 15 s]. The new
//! base rides in every header; the peer adopts it and echoes it back, which
//! ends the adjustment.

use std::time::{Duration, Instant};

/// Length of one timer tick.
pub const TIMER_TICK: Duration = Duration::from_millis(25);
pub const TIMER_TICK_MS: u32 = 25;

pub const DEFAULT_TIMER_BASE: u32 = 300;
pub const MIN_TIMER_BASE: u32 = 100;
pub const MAX_TIMER_BASE: u32 = 15_000;

/// A packet resent more often than this fails the connection set.
pub const RETRANSMIT_LIMIT: u32 = 5;

/// Upper bound of a retransmit interval, in ticks (20 s).
pub const MAX_RETRANSMIT_TICKS: u32 = 20_000 / TIMER_TICK_MS;

/// A frame younger than this (in ticks) is never resent early.
pub const MIN_RETRANSMIT_TICKS: u64 = (100 / TIMER_TICK_MS) as u64;

/// Statistics window after which counters are reset.
pub const STATS_WINDOW: Duration = Duration::from_secs(30);

const ADJUST_THRESHOLD: f64 = 0.25;

/// Counters feeding one adjustment decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowStats {
    pub unique_sent: u64,
    pub resent_via_timer: u64,
    pub unique_received: u64,
    pub duplicates: u64,
}

/// Timer base state for one connection set.
#[derive(Debug, Clone)]
pub struct TimerBase {
    current: u32,
    old: u32,
    adjusting: bool,
    window: WindowStats,
    window_start: Instant,
}

impl TimerBase {
    pub fn new(now: Instant) -> Self {
        Self {
            current: DEFAULT_TIMER_BASE,
            old: DEFAULT_TIMER_BASE,
            adjusting: false,
            window: WindowStats::default(),
            window_start: now,
        }
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn is_adjusting(&self) -> bool {
        self.adjusting
    }

    pub fn window(&self) -> WindowStats {
        self.window
    }

    pub fn record_unique_sent(&mut self) {
        self.window.unique_sent += 1;
    }

    pub fn record_timer_resend(&mut self) {
        self.window.resent_via_timer += 1;
    }

    pub fn record_unique_received(&mut self) {
        self.window.unique_received += 1;
    }

    pub fn record_duplicate(&mut self) {
        self.window.duplicates += 1;
    }

    fn reset_window(&mut self, now: Instant) {
        self.window = WindowStats::default();
        self.window_start = now;
    }

    fn grow(&self, ratio: f64) -> u32 {
        let grown = (self.current as f64 * (1.0 + ratio)) as u32;
        (grown - grown % 10).min(MAX_TIMER_BASE)
    }

    /// Re-evaluate the base from the current window. Session-opening side
    /// only. Returns the new base when it changed.
    pub fn evaluate(&mut self, now: Instant) -> Option<u32> {
        if self.adjusting {
            return None;
        }

        let w = self.window;
        let mut new_base = self.current;

        if w.unique_sent > 2 {
            let resend_ratio = w.resent_via_timer as f64 / w.unique_sent as f64;
            let dup_ratio = if w.unique_received > 2 {
                w.duplicates as f64 / w.unique_received as f64 / 2.0
            } else {
                0.0
            };

            if resend_ratio >= ADJUST_THRESHOLD {
                new_base = self.grow(resend_ratio);
            } else if dup_ratio >= ADJUST_THRESHOLD {
                new_base = self.grow(dup_ratio);
            } else if w.unique_received > 2 && w.resent_via_timer == 0 && w.duplicates == 0 {
                let shrunk = self.current - self.current / 10;
                new_base = (shrunk - shrunk % 10).max(MIN_TIMER_BASE);
            }
        }

        if new_base != self.current {
            self.old = self.current;
            self.current = new_base;
            self.adjusting = true;
            self.reset_window(now);
            return Some(new_base);
        }

        if now.duration_since(self.window_start) > STATS_WINDOW {
            self.reset_window(now);
        }
        None
    }

    /// Apply the base the peer carried in a header. The opening side treats
    /// it as an echo ending the adjustment and starts a fresh stats window;
    /// the other side adopts it. Returns true when the local base changed.
    pub fn on_peer_base(&mut self, theirs: u32, outgoing: bool, now: Instant) -> bool {
        if outgoing {
            if self.adjusting && theirs == self.current {
                self.adjusting = false;
                self.old = self.current;
                self.reset_window(now);
            }
            false
        } else if theirs != self.current && theirs >= MIN_TIMER_BASE {
            self.current = theirs.min(MAX_TIMER_BASE);
            self.old = self.current;
            true
        } else {
            false
        }
    }

    /// Base used for retransmit scheduling: the larger of old and new while
    /// an adjustment is pending.
    fn retransmit_base(&self) -> u32 {
        if self.adjusting {
            self.old.max(self.current)
        } else {
            self.current
        }
    }

    /// Base used for ack-expectation scheduling: the smaller of old and new
    /// while an adjustment is pending.
    fn explicit_ack_base(&self) -> u32 {
        if self.adjusting {
            self.old.min(self.current)
        } else {
            self.current
        }
    }

    /// Retransmit interval in ticks for a packet resent `resend_count` times.
    pub fn retransmit_ticks(&self, resend_count: u32) -> u32 {
        let base = ((self.retransmit_base() * 5 / 3) / TIMER_TICK_MS).max(1);
        if resend_count == 0 {
            return base.min(MAX_RETRANSMIT_TICKS);
        }
        let span = MAX_RETRANSMIT_TICKS.saturating_sub(base);
        (base + span * resend_count / (RETRANSMIT_LIMIT - 1)).min(MAX_RETRANSMIT_TICKS)
    }

    /// Explicit-ack delay in ticks.
    pub fn explicit_ack_ticks(&self) -> u32 {
        (self.explicit_ack_base() / TIMER_TICK_MS).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lossy_window(t: &mut TimerBase, sent: u64, resent: u64) {
        for _ in 0..sent {
            t.record_unique_sent();
        }
        for _ in 0..resent {
            t.record_timer_resend();
        }
    }

    fn clean_window(t: &mut TimerBase) {
        lossy_window(t, 3, 0);
        for _ in 0..3 {
            t.record_unique_received();
        }
    }

    #[test]
    fn defaults() {
        let t = TimerBase::new(Instant::now());
        assert_eq!(t.current(), DEFAULT_TIMER_BASE);
        // 300 * 5/3 = 500ms = 20 ticks
        assert_eq!(t.retransmit_ticks(0), 20);
        assert_eq!(t.explicit_ack_ticks(), 12);
        assert_eq!(MIN_RETRANSMIT_TICKS, 4);
    }

    #[test]
    fn too_few_samples_do_nothing() {
        let now = Instant::now();
        let mut t = TimerBase::new(now);
        lossy_window(&mut t, 2, 2);
        assert_eq!(t.evaluate(now), None);
    }

    #[test]
    fn resends_grow_base_and_hold_until_echo() {
        let now = Instant::now();
        let mut t = TimerBase::new(now);
        lossy_window(&mut t, 10, 5);
        assert_eq!(t.evaluate(now), Some(450));
        assert!(t.is_adjusting());

        // Larger base for retransmits, smaller for acks, while pending.
        assert_eq!(t.retransmit_ticks(0), (450 * 5 / 3) / 25);
        assert_eq!(t.explicit_ack_ticks(), 300 / 25);

        lossy_window(&mut t, 10, 10);
        assert_eq!(t.evaluate(now), None);

        t.on_peer_base(300, true, now);
        assert!(t.is_adjusting());
        assert_eq!(t.window().resent_via_timer, 10);
        t.on_peer_base(450, true, now);
        assert!(!t.is_adjusting());
        // Samples taken under the old base do not count against the new one.
        assert_eq!(t.window(), WindowStats::default());
    }

    #[test]
    fn duplicates_grow_base_with_halved_ratio() {
        let now = Instant::now();
        let mut t = TimerBase::new(now);
        lossy_window(&mut t, 10, 1);
        for _ in 0..10 {
            t.record_unique_received();
        }
        for _ in 0..6 {
            t.record_duplicate();
        }
        // dup ratio 0.6, halved 0.3 -> 300 * 1.3 = 390
        assert_eq!(t.evaluate(now), Some(390));
    }

    #[test]
    fn clean_window_shrinks_to_floor() {
        let now = Instant::now();
        let mut t = TimerBase::new(now);
        let mut last = t.current();
        for _ in 0..40 {
            clean_window(&mut t);
            if let Some(b) = t.evaluate(now) {
                assert!(b < last);
                last = b;
                t.on_peer_base(b, true, now);
            }
        }
        assert_eq!(t.current(), MIN_TIMER_BASE);
    }

    #[test]
    fn shrinking_needs_received_samples() {
        let now = Instant::now();
        let mut t = TimerBase::new(now);
        lossy_window(&mut t, 10, 0);
        t.record_unique_received();
        t.record_unique_received();
        assert_eq!(t.evaluate(now), None);
        assert_eq!(t.current(), DEFAULT_TIMER_BASE);

        t.record_unique_received();
        assert_eq!(t.evaluate(now), Some(270));
    }

    #[test]
    fn growth_is_capped() {
        let now = Instant::now();
        let mut t = TimerBase::new(now);
        for _ in 0..40 {
            lossy_window(&mut t, 4, 4);
            if let Some(b) = t.evaluate(now) {
                assert!(b <= MAX_TIMER_BASE);
                t.on_peer_base(b, true, now);
            }
        }
        assert_eq!(t.current(), MAX_TIMER_BASE);
        assert_eq!(t.retransmit_ticks(0), MAX_RETRANSMIT_TICKS);
    }

    #[test]
    fn stale_window_resets() {
        let now = Instant::now();
        let mut t = TimerBase::new(now);
        lossy_window(&mut t, 1, 0);
        assert_eq!(t.evaluate(now + STATS_WINDOW + Duration::from_secs(1)), None);
        assert_eq!(t.window(), WindowStats::default());
    }

    #[test]
    fn base_recovers_once_loss_stops() {
        let start = Instant::now();
        let mut t = TimerBase::new(start);
        lossy_window(&mut t, 4, 4);
        let grown = t.evaluate(start).unwrap();
        assert_eq!(grown, 600);
        t.on_peer_base(grown, true, start);

        // Residual loss too small to grow on, too large to shrink on.
        lossy_window(&mut t, 9, 2);
        assert_eq!(t.evaluate(start), None);

        let later = start + STATS_WINDOW + Duration::from_secs(1);
        assert_eq!(t.evaluate(later), None);
        let mut last = grown;
        for _ in 0..20 {
            clean_window(&mut t);
            if let Some(b) = t.evaluate(later) {
                assert!(b < last);
                last = b;
                t.on_peer_base(b, true, later);
            }
        }
        assert!(t.current() < grown);
        assert!(t.current() >= MIN_TIMER_BASE);
    }

    #[test]
    fn incoming_side_adopts_peer_base() {
        let now = Instant::now();
        let mut t = TimerBase::new(now);
        assert!(t.on_peer_base(1200, false, now));
        assert_eq!(t.current(), 1200);
        assert!(!t.on_peer_base(1200, false, now));
    }

    #[test]
    fn resend_scaling_reaches_cap() {
        let t = TimerBase::new(Instant::now());
        let mut prev = 0;
        for n in 0..=RETRANSMIT_LIMIT {
            let ticks = t.retransmit_ticks(n);
            assert!(ticks >= prev);
            assert!(ticks <= MAX_RETRANSMIT_TICKS);
            prev = ticks;
        }
        assert_eq!(t.retransmit_ticks(RETRANSMIT_LIMIT - 1), MAX_RETRANSMIT_TICKS);
    }
}
