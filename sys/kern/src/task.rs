// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks.
//!
//! A task is one entry function bound to an event and owned by a process.
//! Each activation runs the entry to completion on a fresh frame; there is
//! no blocking and no yield. The state machine is deliberately small:
//!
//! ```text
//!    Idle -> Ready -> Running -> Idle
//! ```
//!
//! `Ready` is entered when the bound event's activation is accepted.
//! `Running` is entered when the scheduler dispatches the task, and covers
//! both on-CPU execution and time spent preempted by more urgent work (the
//! run stack in `sched` knows which is which). `Idle` is re-entered when
//! the entry returns, ends its activation through `task_exit`, or is
//! aborted by the exception path.

use abi::{EventId, Pid, Priority};

use crate::descs::TaskDesc;
use crate::process::Process;

/// State used to make scheduling decisions.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum TaskState {
    /// No activation outstanding for this task.
    #[default]
    Idle,
    /// The bound event has an accepted activation; the task has not been
    /// dispatched yet.
    Ready,
    /// An activation is in progress: the task is on-CPU, or preempted
    /// somewhere on the run stack.
    Running,
}

/// Internal representation of a task.
#[repr(C)] // so location of SavedState is predictable
#[derive(Debug)]
pub struct Task {
    /// Saved machine state of the task's activation. Only meaningful while
    /// the task is `Running` and off-CPU.
    save: crate::arch::SavedState,
    // NOTE: it is critical that the above field appear first!
    /// State used to make status and scheduling decisions.
    state: TaskState,
    /// Urgency, copied out of the bound event when the tables are frozen
    /// so the scheduler doesn't chase the event table on every scan.
    priority: Priority,
    /// Timebase value sampled when the current activation was dispatched;
    /// input to the deadline check.
    started_at: u64,
    /// The configuration-time description.
    desc: TaskDesc,
}

impl Task {
    /// Creates a `Task` in its initial state, filling in fields from
    /// `desc`.
    pub fn new(desc: TaskDesc, priority: Priority) -> Self {
        Self {
            save: crate::arch::SavedState::default(),
            state: TaskState::Idle,
            priority,
            started_at: 0,
            desc,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn pid(&self) -> Pid {
        self.desc.pid
    }

    pub fn event(&self) -> EventId {
        self.desc.event
    }

    pub fn descriptor(&self) -> &TaskDesc {
        &self.desc
    }

    /// Marks the task ready, as part of an accepted activation of its
    /// event. A task that is already mid-activation stays where it is; the
    /// event-level loss accounting has already rejected that case.
    pub fn make_ready(&mut self) {
        if self.state == TaskState::Idle {
            self.state = TaskState::Ready;
        }
    }

    /// Marks the task running and records the dispatch time for the
    /// deadline check.
    pub fn begin_activation(&mut self, now_us: u64) {
        self.state = TaskState::Running;
        self.started_at = now_us;
    }

    /// Ends the current activation. Returns `true` if the activation
    /// overran its runtime budget, which the caller must charge as a
    /// deadline fault.
    pub fn end_activation(&mut self, now_us: u64) -> bool {
        self.state = TaskState::Idle;
        let budget = u64::from(self.desc.budget_us);
        budget != 0 && now_us.wrapping_sub(self.started_at) > budget
    }

    /// Discards any outstanding activation without running it, as part of
    /// process suspension or fault handling.
    pub fn reset_to_idle(&mut self) {
        self.state = TaskState::Idle;
    }

    /// Checks if this task could be dispatched: it has an undisposed
    /// activation and its process has not been halted.
    pub fn is_dispatchable(&self, processes: &[Process]) -> bool {
        self.state == TaskState::Ready
            && !processes[self.desc.pid.index()].is_halted()
    }

    /// Returns a reference to the saved machine state for the task.
    pub fn save(&self) -> &crate::arch::SavedState {
        &self.save
    }

    /// Returns a mutable reference to the saved machine state for the
    /// task.
    pub fn save_mut(&mut self) -> &mut crate::arch::SavedState {
        &mut self.save
    }
}

/// Return value for operations that can have scheduling implications. This
/// is marked `must_use` because forgetting to actually update the scheduler
/// after performing an operation that requires it would be Bad.
#[derive(Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextTask {
    /// It's fine to keep running whatever activation we were just running.
    Same,
    /// We need to re-plan; something changed that may unseat the current
    /// activation.
    Other,
    /// We need to switch, and we already know which task should run next.
    Specific(usize),
}

impl NextTask {
    pub fn combine(self, other: Self) -> Self {
        use NextTask::*; // shorthand for patterns

        match (self, other) {
            // If both agree, our job is easy.
            (x, y) if x == y => x,
            // Specific task recommendations that *don't* agree get
            // downgraded to Other.
            (Specific(_), Specific(_)) => Other,
            // If only *one* is specific, it wins.
            (Specific(x), _) | (_, Specific(x)) => Specific(x),
            // Otherwise, if either suggestion says switch, switch.
            (Other, _) | (_, Other) => Other,
            // All we have left is...
            (Same, Same) => Same,
        }
    }
}

/// Scans `tasks` for the most urgent dispatchable task, if any.
///
/// The task table is sorted by (event, slot) when the configuration is
/// frozen, and the scan takes the *first* of several equally urgent
/// candidates, so ties break toward the lower event id, and within one
/// event toward declaration order. This is the property the whole
/// activation-ordering contract rests on.
pub fn select_ready(
    tasks: &[Task],
    processes: &[Process],
) -> Option<usize> {
    let mut choice: Option<(usize, Priority)> = None;
    for (i, task) in tasks.iter().enumerate() {
        if !task.is_dispatchable(processes) {
            continue;
        }
        if let Some((_, prio)) = choice {
            if !task.priority.is_more_important_than(prio) {
                continue;
            }
        }
        choice = Some((i, task.priority));
    }
    choice.map(|(idx, _)| idx)
}
