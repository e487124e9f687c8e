// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of kernel time.
//!
//! Two clocks exist. The *tick* clock advances once per timer interrupt
//! (nominally 1 ms) and drives the event table; it is represented by
//! [`Timestamp`]. The *timebase* is a free-running monotone microsecond
//! counter read directly from the hardware; deadline budgets and the CPU
//! load probe use it, and it is handed around as a bare `u64` of
//! microseconds (see `arch::timebase_now`).

/// In-kernel tick-clock timestamp representation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Number of whole ticks since the kernel started.
    pub fn ticks(self) -> u64 {
        self.0
    }
}

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}
