//! Log throttling
//!
//! A disconnected camera or a dead socket tends to produce the same error
//! many times per second. `LogThrottler` lets the first occurrence through,
//! counts the repeats inside the interval and reports the count with the
//! next message that passes.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Entry {
    last_logged: Instant,
    suppressed: u64,
}

/// Per-key rate limiter for log messages
///
/// ```rust
/// use livecast::utils::LogThrottler;
/// use std::time::Duration;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
/// assert_eq!(throttler.check("device_error"), Some(0));
/// assert_eq!(throttler.check("device_error"), None);
/// ```
pub struct LogThrottler {
    entries: Mutex<HashMap<String, Entry>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Check whether a message with `key` may be logged now.
    ///
    /// Returns `Some(n)` when it may, where `n` is the number of messages
    /// suppressed since the last one that passed. Returns `None` when the
    /// message should be dropped; the drop is counted.
    pub fn check(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_logged) < self.interval => {
                entry.suppressed = entry.suppressed.saturating_add(1);
                None
            }
            Some(entry) => {
                let suppressed = entry.suppressed;
                entry.last_logged = now;
                entry.suppressed = 0;
                Some(suppressed)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Boolean form of [`check`](Self::check)
    pub fn should_log(&self, key: &str) -> bool {
        self.check(key).is_some()
    }

    /// Forget a key, so the next error after a recovery is logged immediately
    pub fn clear(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for LogThrottler {
    /// 5 second interval
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `tracing::warn!`, appending the suppressed count when non-zero
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                tracing::warn!("{} (suppressed {} repeats)", format_args!($($arg)*), suppressed);
            } else {
                tracing::warn!($($arg)*);
            }
        }
    };
}

/// Throttled `tracing::error!`, appending the suppressed count when non-zero
#[macro_export]
macro_rules! error_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                tracing::error!("{} (suppressed {} repeats)", format_args!($($arg)*), suppressed);
            } else {
                tracing::error!($($arg)*);
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_repeats_counted_until_interval_passes() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert_eq!(throttler.check("rtmp://live/app"), Some(0));
        assert_eq!(throttler.check("rtmp://live/app"), None);
        assert_eq!(throttler.check("rtmp://live/app"), None);

        thread::sleep(Duration::from_millis(150));

        assert_eq!(throttler.check("rtmp://live/app"), Some(2));
        assert_eq!(throttler.check("rtmp://live/app"), None);
    }

    #[test]
    fn test_cameras_throttled_independently() {
        let throttler = LogThrottler::default();

        assert!(throttler.should_log("repeating:0"));
        assert!(throttler.should_log("repeating:1"));
        assert!(!throttler.should_log("repeating:0"));
        assert_eq!(throttler.len(), 2);
    }

    #[test]
    fn test_clear_after_recovery() {
        let throttler = LogThrottler::with_secs(60);

        assert!(throttler.should_log("send"));
        assert!(!throttler.should_log("send"));

        throttler.clear("send");
        assert_eq!(throttler.check("send"), Some(0));
        throttler.clear("send");
        assert!(throttler.is_empty());
    }

    #[test]
    fn test_macros_share_the_throttler() {
        let throttler = LogThrottler::with_secs(10);
        for i in 0..3 {
            warn_throttled!(throttler, "timeout", "attempt {}", i);
            error_throttled!(throttler, "device lost", "attempt {}", i);
        }
        assert_eq!(throttler.check("timeout"), None);
        assert_eq!(throttler.len(), 2);
    }
}
