//! Adaptive bitrate
//!
//! Fed one sample per second by the publishing task. When the send queue
//! backs up or drops packets the target is cut; when the link keeps up with
//! an empty queue it creeps back towards the configured maximum. The target
//! is published through a watch channel for the encoder to pick up.

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

/// Queue fill above which the link is considered congested
const CONGESTED_FILL: f64 = 0.5;
/// Queue fill below which the link has headroom
const IDLE_FILL: f64 = 0.1;
const DECREASE_FACTOR: f64 = 0.85;
const INCREASE_FACTOR: f64 = 1.05;

/// One measurement window
#[derive(Debug, Clone, Copy, Default)]
pub struct BitrateSample {
    /// Bits per second actually written
    pub measured_bps: u64,
    /// Send queue fill ratio at the end of the window
    pub queue_fill: f64,
    /// Packets dropped by the queue during the window
    pub dropped: u64,
}

pub struct BitrateAdapter {
    min_bps: u64,
    max_bps: u64,
    enabled: bool,
    last_dropped: Mutex<u64>,
    target: watch::Sender<u64>,
}

impl BitrateAdapter {
    pub fn new(max_bps: u64, min_bps: u64, enabled: bool) -> Self {
        let min_bps = min_bps.min(max_bps);
        let (target, _) = watch::channel(max_bps);
        Self {
            min_bps,
            max_bps,
            enabled,
            last_dropped: Mutex::new(0),
            target,
        }
    }

    pub fn target_bps(&self) -> u64 {
        *self.target.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.target.subscribe()
    }

    /// Start over from the maximum, e.g. on a new connection
    pub fn reset(&self) {
        *self.last_dropped.lock() = 0;
        self.target.send_replace(self.max_bps);
    }

    /// Fold in a sample and return the new target
    ///
    /// `sample.dropped` is the queue's cumulative drop counter.
    pub fn on_sample(&self, sample: BitrateSample) -> u64 {
        let new_drops = {
            let mut last = self.last_dropped.lock();
            let delta = sample.dropped.saturating_sub(*last);
            *last = sample.dropped;
            delta
        };

        if !self.enabled {
            return self.target_bps();
        }

        let current = self.target_bps();
        let next = if new_drops > 0 || sample.queue_fill > CONGESTED_FILL {
            (current as f64 * DECREASE_FACTOR) as u64
        } else if sample.queue_fill < IDLE_FILL && sample.measured_bps as f64 >= current as f64 * 0.8
        {
            (current as f64 * INCREASE_FACTOR) as u64
        } else {
            current
        };
        let next = next.clamp(self.min_bps, self.max_bps);

        self.target.send_if_modified(|target| {
            if *target == next {
                return false;
            }
            debug!("Target bitrate {} -> {} bps", *target, next);
            *target = next;
            true
        });
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_congestion_lowers_target_to_floor() {
        let adapter = BitrateAdapter::new(5_000_000, 1_000_000, true);
        let mut rx = adapter.subscribe();

        let mut dropped = 0;
        for _ in 0..50 {
            dropped += 3;
            adapter.on_sample(BitrateSample {
                measured_bps: 1_000_000,
                queue_fill: 0.9,
                dropped,
            });
        }
        assert_eq!(adapter.target_bps(), 1_000_000);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1_000_000);
    }

    #[test]
    fn test_recovers_towards_max() {
        let adapter = BitrateAdapter::new(5_000_000, 1_000_000, true);
        adapter.on_sample(BitrateSample {
            measured_bps: 0,
            queue_fill: 1.0,
            dropped: 0,
        });
        let lowered = adapter.target_bps();
        assert!(lowered < 5_000_000);

        for _ in 0..100 {
            let target = adapter.target_bps();
            adapter.on_sample(BitrateSample {
                measured_bps: target,
                queue_fill: 0.0,
                dropped: 0,
            });
        }
        assert_eq!(adapter.target_bps(), 5_000_000);
    }

    #[test]
    fn test_disabled_adapter_holds_target() {
        let adapter = BitrateAdapter::new(5_000_000, 1_000_000, false);
        adapter.on_sample(BitrateSample {
            measured_bps: 0,
            queue_fill: 1.0,
            dropped: 10,
        });
        assert_eq!(adapter.target_bps(), 5_000_000);
    }
}
