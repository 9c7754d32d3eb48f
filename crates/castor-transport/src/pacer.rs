//! # Leaky-Bucket Pacer
//!
//! Smooths the outgoing packet stream so bursts of fragments do not overrun
//! a constrained path. The budget refills at the configured byte rate and is
//! capped at a small burst allowance; when a packet does not fit, the pacer
//! reports how long the TX loop should sleep.

use std::time::Duration;

use quanta::Instant;

/// Minimum burst allowance so a handful of MTUs always fit.
const MIN_BURST_BYTES: f64 = 3.0 * 1400.0;

/// Burst allowance as a fraction of one second's budget.
const BURST_WINDOW: f64 = 0.05;

pub struct Pacer {
    rate_bytes_per_sec: f64,
    burst_bytes: f64,
    available: f64,
    last_refill: Instant,
}

impl Pacer {
    pub fn new(rate_bytes_per_sec: f64) -> Self {
        let burst = burst_for(rate_bytes_per_sec);
        Pacer {
            rate_bytes_per_sec: rate_bytes_per_sec.max(1.0),
            burst_bytes: burst,
            available: burst,
            last_refill: Instant::now(),
        }
    }

    /// Update the target rate (bytes per second).
    pub fn set_rate(&mut self, rate_bytes_per_sec: f64) {
        self.rate_bytes_per_sec = rate_bytes_per_sec.max(1.0);
        self.burst_bytes = burst_for(self.rate_bytes_per_sec);
        self.available = self.available.min(self.burst_bytes);
    }

    pub fn rate(&self) -> f64 {
        self.rate_bytes_per_sec
    }

    /// Try to spend `len` bytes of budget at `now`.
    ///
    /// Returns `None` when the packet may be sent immediately, otherwise the
    /// time to wait before the budget covers it.
    pub fn poll(&mut self, len: usize, now: Instant) -> Option<Duration> {
        self.refill(now);
        let len = len as f64;
        if self.available >= len {
            self.available -= len;
            return None;
        }
        let deficit = len - self.available;
        let wait = deficit / self.rate_bytes_per_sec;
        Some(Duration::from_secs_f64(wait))
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.available = (self.available + elapsed * self.rate_bytes_per_sec).min(self.burst_bytes);
    }
}

fn burst_for(rate: f64) -> f64 {
    (rate * BURST_WINDOW).max(MIN_BURST_BYTES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_burst_sends_immediately() {
        let mut pacer = Pacer::new(100_000.0);
        let now = Instant::now();
        assert!(pacer.poll(1400, now).is_none());
        assert!(pacer.poll(1400, now).is_none());
    }

    #[test]
    fn exhausted_budget_reports_wait() {
        let mut pacer = Pacer::new(10_000.0);
        let now = Instant::now();
        // Drain the burst allowance.
        while pacer.poll(1400, now).is_none() {}
        let wait = pacer.poll(1400, now).expect("budget exhausted");
        assert!(wait > Duration::ZERO);
        // 1400 bytes at 10 kB/s is at most 140 ms.
        assert!(wait <= Duration::from_millis(141));
    }

    #[test]
    fn budget_refills_with_time() {
        let mut pacer = Pacer::new(10_000.0);
        let base = Instant::now();
        while pacer.poll(1000, base).is_none() {}
        assert!(pacer.poll(1000, base).is_some());

        // 200 ms at 10 kB/s refills 2000 bytes.
        assert!(pacer.poll(1000, base + Duration::from_millis(200)).is_none());
    }

    #[test]
    fn sustained_rate_is_bounded() {
        let mut pacer = Pacer::new(50_000.0);
        let base = Instant::now();
        let mut sent = 0u64;
        // Walk one simulated second in 1 ms steps.
        for ms in 0..1000u64 {
            let now = base + Duration::from_millis(ms);
            while pacer.poll(500, now).is_none() {
                sent += 500;
            }
        }
        // Burst allowance on top of one second of rate.
        assert!(sent <= 50_000 + 3 * 1400 + 500, "sent {sent}");
        assert!(sent >= 45_000, "sent {sent}");
    }

    #[test]
    fn rate_change_caps_available_budget() {
        let mut pacer = Pacer::new(1_000_000.0);
        pacer.set_rate(10_000.0);
        let now = Instant::now();
        let mut immediate = 0;
        while pacer.poll(1400, now).is_none() {
            immediate += 1;
        }
        // Burst for the lowered rate is the floor of 3 MTUs.
        assert!(immediate <= 3, "immediate {immediate}");
    }
}
