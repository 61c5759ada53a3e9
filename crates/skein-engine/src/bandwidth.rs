//! Per-peer traffic accounting.
//!
//! Four running totals per session — bytes up/down, and the payload-only
//! share of each (block data and meta bytes, excluding protocol framing).
//! A heartbeat (the folder's 1 Hz tick) turns totals into rates by
//! differencing against the previous snapshot.

use std::time::Instant;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthTotals {
    pub up_bytes: u64,
    pub down_bytes: u64,
    pub up_payload: u64,
    pub down_payload: u64,
}

/// Bytes per second over the last heartbeat interval.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct BandwidthRates {
    pub up: f64,
    pub down: f64,
    pub up_payload: f64,
    pub down_payload: f64,
}

#[derive(Debug)]
pub struct BandwidthCounter {
    totals: BandwidthTotals,
    last_snapshot: BandwidthTotals,
    last_heartbeat: Instant,
    rates: BandwidthRates,
}

impl Default for BandwidthCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl BandwidthCounter {
    pub fn new() -> Self {
        Self {
            totals: BandwidthTotals::default(),
            last_snapshot: BandwidthTotals::default(),
            last_heartbeat: Instant::now(),
            rates: BandwidthRates::default(),
        }
    }

    pub fn add_up(&mut self, frame_bytes: usize, payload_bytes: usize) {
        self.totals.up_bytes += frame_bytes as u64;
        self.totals.up_payload += payload_bytes as u64;
    }

    pub fn add_down(&mut self, frame_bytes: usize, payload_bytes: usize) {
        self.totals.down_bytes += frame_bytes as u64;
        self.totals.down_payload += payload_bytes as u64;
    }

    pub fn totals(&self) -> BandwidthTotals {
        self.totals
    }

    pub fn rates(&self) -> BandwidthRates {
        self.rates
    }

    /// Recompute rates from the delta since the previous heartbeat.
    pub fn heartbeat(&mut self) -> BandwidthRates {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_heartbeat).as_secs_f64();
        if elapsed > 0.0 {
            self.rates = BandwidthRates {
                up: (self.totals.up_bytes - self.last_snapshot.up_bytes) as f64 / elapsed,
                down: (self.totals.down_bytes - self.last_snapshot.down_bytes) as f64 / elapsed,
                up_payload: (self.totals.up_payload - self.last_snapshot.up_payload) as f64
                    / elapsed,
                down_payload: (self.totals.down_payload - self.last_snapshot.down_payload) as f64
                    / elapsed,
            };
        }
        self.last_snapshot = self.totals;
        self.last_heartbeat = now;
        self.rates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_accumulate_separately() {
        let mut counter = BandwidthCounter::new();
        counter.add_up(100, 80);
        counter.add_up(20, 0);
        counter.add_down(500, 450);

        let totals = counter.totals();
        assert_eq!(totals.up_bytes, 120);
        assert_eq!(totals.up_payload, 80);
        assert_eq!(totals.down_bytes, 500);
        assert_eq!(totals.down_payload, 450);
    }

    #[test]
    fn heartbeat_differences_since_last_snapshot() {
        let mut counter = BandwidthCounter::new();
        counter.add_down(1000, 900);
        std::thread::sleep(std::time::Duration::from_millis(20));
        let rates = counter.heartbeat();
        assert!(rates.down > 0.0);
        assert!(rates.down_payload > 0.0);
        assert_eq!(rates.up, 0.0);

        // No traffic since the snapshot: rates fall to zero.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let rates = counter.heartbeat();
        assert_eq!(rates.down, 0.0);
    }
}
