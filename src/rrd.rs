//! Fixed-window per-second rolling counters ("RRD" — round-robin database
//! in miniature: a ring buffer of per-second buckets with a bounded
//! lookback window).
//!
//! Used for two purposes in this crate: the cache controller's overload
//! predicate (`open_attempts` / `open_wait_time` per slot) and the
//! dispatch worker's send-count / send-time
//! tracking. Both owners already serialize access externally (the cache's
//! global mutex, the dispatcher's single worker thread), so `SingleRrd`
//! itself does no internal locking.

/// A ring buffer of per-second counters covering a fixed lookback window.
#[derive(Debug, Clone)]
pub struct SingleRrd {
    buckets: Vec<u64>,
    window_secs: i64,
    last_second: i64,
}

impl SingleRrd {
    /// Creates a new RRD anchored at `now_secs`, covering `window_secs`
    /// seconds of history (clamped to at least 1).
    pub fn new(now_secs: i64, window_secs: i64) -> Self {
        let window_secs = window_secs.max(1);
        Self {
            buckets: vec![0; window_secs as usize],
            window_secs,
            last_second: now_secs,
        }
    }

    fn index(&self, second: i64) -> usize {
        second.rem_euclid(self.window_secs) as usize
    }

    /// Advances the ring to `now_secs`, zeroing any buckets the window has
    /// scrolled past since the last update.
    fn roll_to(&mut self, now_secs: i64) {
        if now_secs <= self.last_second {
            return;
        }
        let elapsed = now_secs - self.last_second;
        let to_clear = elapsed.min(self.window_secs);
        for step in 1..=to_clear {
            let idx = self.index(self.last_second + step);
            self.buckets[idx] = 0;
        }
        self.last_second = now_secs;
    }

    /// Adds `value` to the bucket for `now_secs`, rolling the window
    /// forward first if time has advanced.
    pub fn add(&mut self, now_secs: i64, value: u64) {
        self.roll_to(now_secs);
        let idx = self.index(now_secs);
        self.buckets[idx] = self.buckets[idx].saturating_add(value);
    }

    /// Sums the counters over the `period_secs` seconds ending at
    /// `now_secs` (inclusive), clamped to the RRD's own window.
    pub fn get_delta(&self, now_secs: i64, period_secs: i64) -> u64 {
        let period = period_secs.clamp(1, self.window_secs);
        let mut sum = 0u64;
        for step in 0..period {
            let second = now_secs - step;
            if second < 0 {
                break;
            }
            // A bucket only holds meaningful data if it was touched within
            // the window relative to the last roll; reading stale buckets
            // beyond `last_second - window_secs` would double count old data,
            // but callers only ever query at or after their last `add`, and
            // `roll_to` zeroes anything that scrolled out, so this is safe.
            sum = sum.saturating_add(self.buckets[self.index(second)]);
        }
        sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_within_window() {
        let mut rrd = SingleRrd::new(0, 60);
        rrd.add(0, 3);
        rrd.add(1, 4);
        rrd.add(2, 5);
        assert_eq!(rrd.get_delta(2, 10), 12);
    }

    #[test]
    fn rolls_old_buckets_out() {
        let mut rrd = SingleRrd::new(0, 5);
        rrd.add(0, 10);
        rrd.add(1, 10);
        // Advance far enough that second 0 and 1 roll out of the 5s window.
        rrd.add(10, 1);
        assert_eq!(rrd.get_delta(10, 5), 1);
    }

    #[test]
    fn period_is_clamped_to_window() {
        let mut rrd = SingleRrd::new(0, 10);
        for s in 0..10 {
            rrd.add(s, 1);
        }
        assert_eq!(rrd.get_delta(9, 1000), 10);
    }
}
