// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The average-CPU-load probe.
//!
//! The idle context polls the free-running timebase in a tight loop and
//! feeds every reading into a [`LoadEstimator`]. While the CPU is truly
//! idle, consecutive readings are a few microseconds apart; when the gap
//! is large, the time was stolen by tasks and ISRs. Summing the small
//! gaps gives the idle share of each measurement window, and the busy
//! share is published in tenths of a percent.
//!
//! The probe deliberately takes no critical section: a preemption between
//! the two reads of a sample just converts that sample's idle time into
//! busy time, a distortion of a few microseconds per window that the
//! averaging swallows. Being wrong by a hair is much better than the
//! probe perturbing the system it measures.

/// Width of the averaging window, microseconds. A binary ~1.05 s keeps
/// the divide cheap on cores without hardware division.
pub const WINDOW_US: u64 = 1 << 20;

/// Largest gap between consecutive idle-loop samples that still counts as
/// idle time. One pass of the loop costs well under a microsecond, so
/// anything beyond this was preemption.
pub const IDLE_GAP_LIMIT_US: u64 = 20;

use core::sync::atomic::{AtomicU32, Ordering};

/// The published figure, written by the idle context after each sample
/// and read by `kapi::system_load` from anywhere.
static PUBLISHED: AtomicU32 = AtomicU32::new(0);

/// Publishes the latest busy figure. Called by the idle context.
pub fn publish(busy_permille: u32) {
    PUBLISHED.store(busy_permille, Ordering::Relaxed);
}

/// The most recently published busy figure, in permille.
pub fn published() -> u32 {
    PUBLISHED.load(Ordering::Relaxed)
}

/// Estimator state. One instance lives in the idle context; `sample` is
/// the only writer and the published figure is read without locking.
#[derive(Debug)]
pub struct LoadEstimator {
    /// Timebase value at the start of the current window.
    window_start: u64,
    /// Timebase value of the previous sample.
    last_sample: u64,
    /// Microseconds of this window so far attributed to idling.
    idle_acc: u64,
    /// Most recently completed window's busy share, in permille.
    busy_permille: u32,
}

impl LoadEstimator {
    pub const fn new(now_us: u64) -> Self {
        Self {
            window_start: now_us,
            last_sample: now_us,
            idle_acc: 0,
            busy_permille: 0,
        }
    }

    /// Feeds one idle-loop reading of the timebase.
    pub fn sample(&mut self, now_us: u64) {
        let gap = now_us.wrapping_sub(self.last_sample);
        self.last_sample = now_us;
        if gap <= IDLE_GAP_LIMIT_US {
            self.idle_acc += gap;
        }

        let elapsed = now_us.wrapping_sub(self.window_start);
        if elapsed >= WINDOW_US {
            let idle = self.idle_acc.min(elapsed);
            self.busy_permille =
                ((elapsed - idle) * 1000 / elapsed) as u32;
            self.window_start = now_us;
            self.idle_acc = 0;
        }
    }

    /// The busy fraction of the last completed window, in tenths of a
    /// percent. Reads 0 until the first window completes, which is fine:
    /// nobody asks about system load in the first second after reset.
    pub fn busy_permille(&self) -> u32 {
        self.busy_permille
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs the estimator across one window with idle polls every
    /// `poll_gap` us, interleaving `steal` us of preemption every
    /// `steal_every` us of wall time.
    fn run_window(poll_gap: u64, steal_every: u64, steal: u64) -> u32 {
        let mut est = LoadEstimator::new(0);
        let mut now = 0;
        let mut next_steal = steal_every;
        while now < WINDOW_US + poll_gap {
            now += poll_gap;
            if steal_every != 0 && now >= next_steal {
                now += steal;
                next_steal += steal_every;
            }
            est.sample(now);
        }
        est.busy_permille()
    }

    #[test]
    fn fully_idle_system_reads_near_zero() {
        assert!(run_window(2, 0, 0) <= 5);
    }

    #[test]
    fn half_loaded_system_reads_near_five_hundred() {
        // 1000 us stolen out of every 2000.
        let p = run_window(2, 2000, 1000);
        assert!((450..=550).contains(&p), "permille was {p}");
    }

    #[test]
    fn heavily_loaded_system_reads_high() {
        // 9 ms stolen out of every 10.
        let p = run_window(2, 10_000, 9_000);
        assert!(p >= 850, "permille was {p}");
    }

    #[test]
    fn publishes_only_at_window_boundaries() {
        let mut est = LoadEstimator::new(0);
        for now in (0..WINDOW_US / 2).step_by(100) {
            est.sample(now);
        }
        // Mid-window: still the initial figure.
        assert_eq!(est.busy_permille(), 0);
    }

    #[test]
    fn short_distortions_are_tolerated() {
        // One giant non-monotone-looking gap (e.g. the window rolled over
        // while we were preempted for a long time) must neither panic nor
        // produce a nonsense figure above 1000.
        let mut est = LoadEstimator::new(0);
        est.sample(10);
        est.sample(WINDOW_US * 3);
        assert!(est.busy_permille() <= 1000);
    }
}
