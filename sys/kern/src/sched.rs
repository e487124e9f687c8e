// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler.
//!
//! Tasks run to completion, so in-flight activations nest like a stack:
//! dispatching requires *strictly* greater urgency than whatever is
//! currently on top, and a finished activation uncovers the one it
//! preempted. The [`RunStack`] records that nesting; an empty stack means
//! the idle context (priority 0) has the CPU.
//!
//! Everything here is plain state manipulation over the kernel tables. The
//! architecture layer calls in from the tick interrupt, the system call
//! trap, and the fault handlers, and acts on the returned decisions
//! (building entry frames, restoring saved contexts, reprogramming the
//! protection hardware). Keeping the decisions separate from the mechanics
//! is what lets the whole policy run on the host under test.

use abi::{FaultCause, FaultInfo, Pid, Priority};

use crate::event::{Activation, Event};
use crate::process::Process;
use crate::task::{self, NextTask, Task};

/// Deepest possible activation nesting: the priorities along the run stack
/// are strictly increasing, so it is bounded by the size of the task
/// priority space (plus nothing else; the idle context is represented by
/// the empty stack).
pub const MAX_NESTING: usize = Priority::MAX_TASK.0 as usize + 1;

/// The stack of in-flight activations. The top entry is the task that owns
/// the CPU whenever no ISR is running.
#[derive(Debug, Default)]
pub struct RunStack {
    stack: [u16; MAX_NESTING],
    depth: usize,
}

impl RunStack {
    pub const fn new() -> Self {
        Self {
            stack: [0; MAX_NESTING],
            depth: 0,
        }
    }

    /// Index of the task currently on-CPU, or `None` for the idle context.
    pub fn current(&self) -> Option<usize> {
        self.depth
            .checked_sub(1)
            .map(|d| usize::from(self.stack[d]))
    }

    /// Number of in-flight activations.
    pub fn depth(&self) -> usize {
        self.depth
    }

    fn push(&mut self, task: usize) {
        uassert!(self.depth < MAX_NESTING);
        self.stack[self.depth] = task as u16;
        self.depth += 1;
    }

    fn pop(&mut self) -> Option<usize> {
        self.current().map(|top| {
            self.depth -= 1;
            top
        })
    }

    /// All in-flight activations, bottom (oldest) first. The architecture
    /// layer uses this to find the stack floor when several tasks of one
    /// process are nested.
    pub fn in_flight(&self) -> impl Iterator<Item = usize> + '_ {
        self.stack[..self.depth].iter().map(|&i| usize::from(i))
    }
}

/// The kernel's runtime tables, as manufactured at each kernel entry by
/// `arch::with_tables`.
pub struct Tables<'a> {
    pub events: &'a mut [Event],
    pub tasks: &'a mut [Task],
    pub processes: &'a mut [Process],
    pub run: &'a mut RunStack,
}

/// What the architecture layer should run after the current activation
/// ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum AfterExit {
    /// Start a fresh activation of this task: build an entry frame and go.
    Start(usize),
    /// Resume this preempted task from its saved state.
    Resume(usize),
    /// Nothing left to run; return to the idle context.
    Idle,
}

/// Priority of the context currently holding the CPU: the top in-flight
/// activation, or idle. The priority-ceiling level is folded in by
/// callers, because a held ceiling makes the current context act more
/// urgent than it is.
pub fn current_priority(tasks: &[Task], run: &RunStack) -> Priority {
    run.current()
        .map(|i| tasks[i].priority())
        .unwrap_or(Priority::IDLE)
}

/// Advances the tick clock across the event table, activating every cyclic
/// event that fell due. Returns a scheduling hint: `Other` if anything was
/// activated that may outrank the current context.
pub fn handle_tick(
    events: &mut [Event],
    tasks: &mut [Task],
    processes: &[Process],
) -> NextTask {
    let mut hint = NextTask::Same;
    for e in 0..events.len() {
        if events[e].tick() {
            // Timer-driven triggers skip the privilege check; losses are
            // counted inside `activate` like any others.
            if activate(events, tasks, processes, e) == Activation::Accepted {
                hint = NextTask::Other;
            }
        }
    }
    hint
}

/// Offers one trigger to event `e` and, if accepted, readies its bound
/// tasks. Tasks of halted processes are not readied, and an activation
/// that readies nothing completes immediately (the pending flag drops
/// right away) so that triggers against halted processes keep being
/// *accepted* and the loss counters stay meaningful.
pub fn activate(
    events: &mut [Event],
    tasks: &mut [Task],
    processes: &[Process],
    e: usize,
) -> Activation {
    let outcome = events[e].trigger();
    if outcome == Activation::Accepted {
        for i in events[e].tasks() {
            if !processes[tasks[i].pid().index()].is_halted() {
                tasks[i].make_ready();
            }
        }
        settle_event(events, tasks, e);
    }
    outcome
}

/// Full trigger path for software triggers (from tasks via the system
/// call, or from kernel context / ISRs with `caller` = `Pid::KERNEL`).
///
/// Returns whether the activation was accepted, plus a scheduling hint.
/// Unknown event ids and insufficient privilege report `false` without
/// disturbing any state.
pub fn trigger_event(
    events: &mut [Event],
    tasks: &mut [Task],
    processes: &[Process],
    e: usize,
    caller: Pid,
) -> (bool, NextTask) {
    if e >= events.len() {
        return (false, NextTask::Same);
    }
    if !caller.meets_privilege_of(events[e].min_pid()) {
        return (false, NextTask::Same);
    }
    match activate(events, tasks, processes, e) {
        Activation::Accepted => (true, NextTask::Other),
        Activation::Lost => (false, NextTask::Same),
    }
}

/// If the most urgent ready activation outranks the current context (and
/// clears the held priority ceiling), dispatches it: the task becomes
/// Running, lands on the run stack, and its index is returned so the
/// architecture layer can build its entry frame.
///
/// Returns `None` when the current context should simply keep going.
pub fn maybe_preempt(
    tasks: &mut [Task],
    processes: &[Process],
    run: &mut RunStack,
    ceiling: Priority,
    now_us: u64,
) -> Option<usize> {
    let mut bar = current_priority(tasks, run);
    if ceiling.is_more_important_than(bar) {
        bar = ceiling;
    }
    let best = task::select_ready(tasks, processes)?;
    if tasks[best].priority().is_more_important_than(bar) {
        tasks[best].begin_activation(now_us);
        run.push(best);
        Some(best)
    } else {
        None
    }
}

/// Ends the current activation normally (entry returned, or `task_exit`).
///
/// `retval` is the task's result; negative values are charged as
/// user-signalled errors without affecting scheduling. The deadline budget
/// is checked here, against the dispatch timestamp.
pub fn finish_current(
    events: &mut [Event],
    tasks: &mut [Task],
    processes: &mut [Process],
    run: &mut RunStack,
    ceiling: Priority,
    retval: i32,
    now_us: u64,
) -> AfterExit {
    let Some(cur) = run.pop() else {
        // The idle context does not finish.
        crate::fail::die("finish with empty run stack");
    };
    let overran = tasks[cur].end_activation(now_us);
    let pid = tasks[cur].pid().index();
    if overran {
        processes[pid].charge(FaultCause::Deadline);
    }
    if retval < 0 {
        processes[pid].charge(FaultCause::UserAbort);
    }
    settle_event(events, tasks, tasks[cur].event().index());

    next_after_pop(tasks, processes, run, ceiling, now_us)
}

/// Aborts the current activation in response to a fault. The owning
/// process is charged with the classified cause, the task goes back to
/// Idle (re-armed for its next trigger), and the event settles as if the
/// task had finished.
pub fn abort_current(
    events: &mut [Event],
    tasks: &mut [Task],
    processes: &mut [Process],
    run: &mut RunStack,
    ceiling: Priority,
    fault: FaultInfo,
) -> AfterExit {
    let Some(cur) = run.pop() else {
        // A fault with no current task is a kernel fault; our invariants
        // are gone and the only safe thing left is to stop.
        crate::fail::die("fault in kernel context");
    };
    let pid = tasks[cur].pid().index();
    processes[pid].charge(fault.cause());
    tasks[cur].reset_to_idle();
    settle_event(events, tasks, tasks[cur].event().index());

    next_after_pop(tasks, processes, run, ceiling, 0)
}

fn next_after_pop(
    tasks: &mut [Task],
    processes: &[Process],
    run: &mut RunStack,
    ceiling: Priority,
    now_us: u64,
) -> AfterExit {
    if let Some(fresh) = maybe_preempt(tasks, processes, run, ceiling, now_us)
    {
        AfterExit::Start(fresh)
    } else {
        match run.current() {
            Some(resumed) => AfterExit::Resume(resumed),
            None => AfterExit::Idle,
        }
    }
}

/// Permanently halts a process: its ready (not yet dispatched) activations
/// are discarded, and nothing of it will ever be dispatched again. An
/// activation that is already in flight is allowed to complete, per the
/// cancellation contract.
///
/// Calling this twice is the same as calling it once.
pub fn suspend_process(
    events: &mut [Event],
    tasks: &mut [Task],
    processes: &mut [Process],
    pid: Pid,
) {
    processes[pid.index()].halt();
    for i in 0..tasks.len() {
        if tasks[i].pid() == pid
            && tasks[i].state() == crate::task::TaskState::Ready
        {
            tasks[i].reset_to_idle();
        }
    }
    // Events whose remaining work all belonged to the halted process must
    // drop their pending flag, or every future trigger would read as a
    // loss.
    for e in 0..events.len() {
        settle_event(events, tasks, e);
    }
}

/// Clears the pending flag of event `e` once none of its tasks has an
/// activation outstanding.
fn settle_event(events: &mut [Event], tasks: &[Task], e: usize) {
    if !events[e].is_pending() {
        return;
    }
    let busy = events[e].tasks().any(|i| {
        tasks[i].state() != crate::task::TaskState::Idle
    });
    if !busy {
        events[e].clear_pending();
    }
}
