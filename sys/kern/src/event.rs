// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of events, the trigger sources for task activation.
//!
//! An event is either *cyclic* (activated by the tick clock on a fixed
//! period, after an optional first-activation offset) or *software-only*
//! (activated by `trigger_event` from an ISR or a sufficiently privileged
//! task). Activation marks all bound tasks ready; at most one activation
//! can be outstanding at a time, and a trigger arriving while one is
//! outstanding is counted as an *activation loss*, never queued.

use abi::{EventStatus, Pid, Priority};

use crate::descs::EventDesc;

/// Internal representation of an event.
#[derive(Debug)]
pub struct Event {
    /// The configuration-time description.
    desc: EventDesc,
    /// Ticks remaining until the next timer-driven activation. Unused for
    /// software-only events.
    countdown: u32,
    /// Whether an activation is outstanding: set by trigger, cleared when
    /// the last bound task finishes.
    pending: bool,
    /// Saturating count of activations that were lost because one was
    /// already outstanding.
    losses: u32,
    /// Index of this event's first task in the (event-sorted) task table.
    first_task: u16,
    /// Number of consecutive tasks bound to this event.
    task_count: u16,
}

/// Outcome of offering a trigger to an event.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum Activation {
    /// The activation was accepted; bound tasks should be marked ready.
    Accepted,
    /// An activation was already outstanding; the loss counter has been
    /// bumped.
    Lost,
}

impl Event {
    /// Creates the runtime state for `desc`, whose tasks occupy
    /// `first_task .. first_task + task_count` in the task table.
    pub fn new(desc: EventDesc, first_task: u16, task_count: u16) -> Self {
        Self {
            // The first activation of a cyclic event happens a full period
            // after its offset expires.
            countdown: desc.offset_ticks.saturating_add(desc.period_ticks),
            pending: false,
            losses: 0,
            first_task,
            task_count,
            desc,
        }
    }

    pub fn priority(&self) -> Priority {
        self.desc.priority
    }

    /// Least privileged process allowed to software-trigger this event.
    pub fn min_pid(&self) -> Pid {
        self.desc.min_pid
    }

    pub fn is_cyclic(&self) -> bool {
        self.desc.period_ticks != 0
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Range of this event's tasks in the task table.
    pub fn tasks(&self) -> core::ops::Range<usize> {
        let first = usize::from(self.first_task);
        first..first + usize::from(self.task_count)
    }

    /// Advances the cycle counter by one tick. Returns `true` if the event
    /// fell due on this tick; the caller is responsible for feeding it
    /// through `trigger` and scheduling.
    pub fn tick(&mut self) -> bool {
        if !self.is_cyclic() {
            return false;
        }
        self.countdown -= 1;
        if self.countdown == 0 {
            self.countdown = self.desc.period_ticks;
            true
        } else {
            false
        }
    }

    /// Offers one trigger to this event, from the timer, an ISR, or a
    /// task. The privilege check has already happened by the time we get
    /// here.
    pub fn trigger(&mut self) -> Activation {
        if self.pending {
            self.losses = self.losses.saturating_add(1);
            Activation::Lost
        } else {
            self.pending = true;
            Activation::Accepted
        }
    }

    /// Clears the outstanding activation. Called when the last bound task
    /// of the current activation finishes (or is discarded by a process
    /// suspension).
    pub fn clear_pending(&mut self) {
        self.pending = false;
    }

    /// Saturating count of lost activations since boot.
    pub fn activation_losses(&self) -> u32 {
        self.losses
    }

    /// Snapshot for the diagnostic surface.
    pub fn status(&self, id: abi::EventId) -> EventStatus {
        EventStatus {
            id,
            pending: self.pending,
            activation_losses: self.losses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cyclic(period: u32, offset: u32) -> Event {
        Event::new(
            EventDesc {
                period_ticks: period,
                offset_ticks: offset,
                priority: Priority(2),
                min_pid: Pid(1),
            },
            0,
            1,
        )
    }

    fn software() -> Event {
        Event::new(
            EventDesc {
                period_ticks: 0,
                offset_ticks: 0,
                priority: Priority(3),
                min_pid: Pid(1),
            },
            0,
            1,
        )
    }

    /// Drives `ticks` ticks and returns how many times the event fell due,
    /// completing each accepted activation immediately.
    fn run_ticks(ev: &mut Event, ticks: u32) -> u32 {
        let mut due = 0;
        for _ in 0..ticks {
            if ev.tick() {
                if ev.trigger() == Activation::Accepted {
                    due += 1;
                    ev.clear_pending();
                }
            }
        }
        due
    }

    #[test]
    fn one_ms_event_with_offset_ten() {
        // Period 1, offset 10: nothing for the first 10 ticks, exactly one
        // activation on tick 11, then one per tick.
        let mut ev = cyclic(1, 10);
        assert_eq!(run_ticks(&mut ev, 10), 0);
        assert_eq!(run_ticks(&mut ev, 1), 1);
        let mut ev = cyclic(1, 10);
        assert_eq!(run_ticks(&mut ev, 1010), 1000);
        assert_eq!(ev.activation_losses(), 0);
    }

    #[test]
    fn seventeen_ms_event_fires_floor_of_quotient() {
        let mut ev = cyclic(17, 0);
        assert_eq!(run_ticks(&mut ev, 1000), 1000 / 17);
    }

    #[test]
    fn software_event_ignores_ticks() {
        let mut ev = software();
        assert_eq!(run_ticks(&mut ev, 1000), 0);
        assert_eq!(ev.trigger(), Activation::Accepted);
    }

    #[test]
    fn double_trigger_loses_exactly_one() {
        let mut ev = software();
        assert_eq!(ev.trigger(), Activation::Accepted);
        assert_eq!(ev.trigger(), Activation::Lost);
        assert_eq!(ev.activation_losses(), 1);

        // Completing the activation re-arms the event.
        ev.clear_pending();
        assert_eq!(ev.trigger(), Activation::Accepted);
        assert_eq!(ev.activation_losses(), 1);
    }

    #[test]
    fn trigger_while_running_is_a_loss() {
        // The pending flag stays up for the whole activation, so a trigger
        // arriving while the task runs is counted the same way.
        let mut ev = software();
        assert_eq!(ev.trigger(), Activation::Accepted);
        // ... task dispatched, now mid-run ...
        assert_eq!(ev.trigger(), Activation::Lost);
        assert_eq!(ev.trigger(), Activation::Lost);
        ev.clear_pending();
        assert_eq!(ev.activation_losses(), 2);
    }

    #[test]
    fn loss_counter_saturates() {
        let mut ev = software();
        let _ = ev.trigger();
        ev.losses = u32::MAX - 1;
        let _ = ev.trigger();
        let _ = ev.trigger();
        assert_eq!(ev.activation_losses(), u32::MAX);
    }

    #[test]
    fn losses_plus_accepted_equals_attempts() {
        let mut ev = software();
        let mut accepted = 0;
        let attempts = 1000;
        for i in 0..attempts {
            if ev.trigger() == Activation::Accepted {
                accepted += 1;
            }
            // Complete every third activation so both outcomes occur.
            if i % 3 == 0 {
                ev.clear_pending();
            }
        }
        assert_eq!(accepted + ev.activation_losses(), attempts);
    }
}
