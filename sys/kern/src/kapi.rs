// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The runtime API for kernel-context code: kernel tasks, drivers, and
//! registered ISRs.
//!
//! These are the `os_` entry points. They act on the same kernel tables
//! as the system call surface, but without the trap, without argument
//! marshalling, and without privilege checks beyond the ones the
//! operations themselves require. User code gets the equivalent
//! functionality through the system call table; see `syscalls`.

use abi::{EventId, FaultCause, Pid, UsageError, NUM_PROCESSES};

use crate::ceiling;
use crate::descs::{ProcessFlags, TaskEntry};
use crate::sched;
use crate::task::NextTask;

/// Marks `event` pending and, if that makes something more urgent than
/// the current context dispatchable, requests a context switch on the way
/// out of the kernel.
///
/// Returns `true` if the activation was accepted, `false` if it was lost
/// (already pending), refused by the privilege check, or the id is
/// unknown. Safe to call from ISR context.
pub fn os_trigger_event(event: EventId) -> bool {
    crate::arch::with_tables(|t| {
        let (accepted, hint) = sched::trigger_event(
            t.events,
            t.tasks,
            t.processes,
            event.index(),
            Pid::KERNEL,
        );
        if hint != NextTask::Same {
            crate::arch::pend_context_switch();
        }
        accepted
    })
}

/// Enters the all-interrupts-masked critical section. Non-nestable.
pub fn os_enter_critical() -> ceiling::CriticalToken {
    ceiling::enter_critical()
}

/// Leaves the critical section entered by `os_enter_critical`.
pub fn os_leave_critical(token: ceiling::CriticalToken) {
    ceiling::leave_critical(token)
}

/// Raises the interrupt controller's mask to `level`, for data shared
/// between kernel code and ISRs. Nestable; returns the value to hand to
/// `os_restore_priority`.
pub fn os_mask_to_priority(level: u8) -> u8 {
    ceiling::mask_to_priority(level)
}

/// Restores an interrupt mask saved by `os_mask_to_priority`.
pub fn os_restore_priority(saved: u8) {
    ceiling::restore_priority(saved)
}

/// Permanently halts a process. Idempotent. In-flight activations of the
/// process complete; nothing of it is ever dispatched again.
pub fn os_suspend_process(pid: Pid) {
    crate::arch::with_tables(|t| {
        sched::suspend_process(t.events, t.tasks, t.processes, pid);
    })
}

/// Description of a function to run synchronously in another process's
/// memory view, for OS-initiated callbacks into user code.
#[derive(Copy, Clone, Debug)]
pub struct RunTaskSpec {
    /// Process whose memory view (and fault accounting) applies.
    pub pid: Pid,
    /// Function to call.
    pub entry: TaskEntry,
}

/// Runs `spec.entry(arg)` in the target process's memory view and
/// returns its result. Kernel context only. The target must exist, be
/// running (not halted), and hold the `RUN_TASKS` permission; a fault in
/// the callee is charged to the target process.
pub fn os_run_task_in_process(
    spec: &RunTaskSpec,
    arg: u32,
) -> Result<i32, UsageError> {
    if spec.pid.is_kernel() || spec.pid.index() >= NUM_PROCESSES {
        return Err(UsageError::ProcessOutOfRange);
    }
    crate::arch::with_tables(|t| {
        let target = &t.processes[spec.pid.index()];
        if target.is_halted()
            || !target.flags().contains(ProcessFlags::RUN_TASKS)
        {
            return Err(UsageError::NotPermitted);
        }
        let rv = crate::arch::call_in_process(target, spec.entry, arg);
        if rv < 0 {
            t.processes[spec.pid.index()].charge(FaultCause::UserAbort);
        }
        Ok(rv)
    })
}

/// Minimum observed free stack space of `pid` since boot, in bytes.
pub fn os_stack_reserve(pid: Pid) -> u32 {
    crate::arch::with_tables(|t| {
        t.processes
            .get(pid.index())
            .map(|p| crate::arch::stack_reserve(p))
            .unwrap_or(0)
    })
}

/// Saturating count of lost activations of `event` since boot. Unknown
/// ids read as 0.
pub fn os_activation_loss(event: EventId) -> u32 {
    crate::arch::with_tables(|t| {
        t.events
            .get(event.index())
            .map(|e| e.activation_losses())
            .unwrap_or(0)
    })
}

/// Diagnostic snapshot of one event.
pub fn os_event_status(event: EventId) -> Option<abi::EventStatus> {
    crate::arch::with_tables(|t| {
        t.events.get(event.index()).map(|e| e.status(event))
    })
}

/// Saturating per-cause error count of `pid`.
pub fn os_process_errors(pid: Pid, cause: FaultCause) -> u32 {
    crate::arch::with_tables(|t| {
        t.processes
            .get(pid.index())
            .map(|p| p.error_count(cause))
            .unwrap_or(0)
    })
}

/// Saturating total error count of `pid`.
pub fn os_process_errors_total(pid: Pid) -> u32 {
    crate::arch::with_tables(|t| {
        t.processes
            .get(pid.index())
            .map(|p| p.total_errors())
            .unwrap_or(0)
    })
}

/// The busy fraction of the CPU over roughly the last second, in tenths
/// of a percent.
pub fn system_load() -> u32 {
    crate::load::published()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descs::{EventDesc, TaskDesc};
    use crate::event::Event;
    use crate::process::test_support::user_process;
    use crate::process::Process;
    use crate::sched::RunStack;
    use crate::task::Task;
    use abi::Priority;

    extern "C" fn entry(_arg: u32) -> i32 {
        0
    }

    extern "C" fn doubler(arg: u32) -> i32 {
        (arg * 2) as i32
    }

    extern "C" fn failing(_arg: u32) -> i32 {
        -1
    }

    /// Installs a leaked table set as this thread's kernel tables, the
    /// same wiring `start_kernel` performs on the target.
    fn install_tables(flags: ProcessFlags) {
        let events = Box::leak(Box::new([Event::new(
            EventDesc {
                period_ticks: 0,
                offset_ticks: 0,
                priority: Priority(3),
                min_pid: Pid(1),
            },
            0,
            1,
        )]));
        let tasks = Box::leak(Box::new([Task::new(
            TaskDesc {
                event: EventId(0),
                pid: Pid(1),
                entry,
                budget_us: 0,
                slot: 0,
            },
            Priority(3),
        )]));
        let processes: Vec<Process> = (0..NUM_PROCESSES as u8)
            .map(|p| user_process(Pid(p), flags))
            .collect();
        let processes = Box::leak(processes.into_boxed_slice());
        let run = Box::leak(Box::new(RunStack::new()));
        // Safety: the tables are leaked, so they live forever and nothing
        // else aliases them on this test thread.
        unsafe {
            crate::arch::set_tables(events, tasks, processes, run);
        }
    }

    #[test]
    fn kernel_api_reads_and_triggers() {
        install_tables(ProcessFlags::RUN_TASKS);

        assert!(os_trigger_event(EventId(0)));
        // Second trigger is a loss, visible through the counter API.
        assert!(!os_trigger_event(EventId(0)));
        assert_eq!(os_activation_loss(EventId(0)), 1);
        assert_eq!(os_activation_loss(EventId(40)), 0);

        assert_eq!(os_process_errors(Pid(1), FaultCause::Deadline), 0);
        assert_eq!(os_process_errors_total(Pid(1)), 0);
    }

    #[test]
    fn run_task_in_process_calls_through() {
        install_tables(ProcessFlags::RUN_TASKS);
        let spec = RunTaskSpec {
            pid: Pid(2),
            entry: doubler,
        };
        assert_eq!(os_run_task_in_process(&spec, 21), Ok(42));

        // A negative result is charged to the target.
        let spec = RunTaskSpec {
            pid: Pid(2),
            entry: failing,
        };
        assert_eq!(os_run_task_in_process(&spec, 0), Ok(-1));
        assert_eq!(os_process_errors(Pid(2), FaultCause::UserAbort), 1);
    }

    #[test]
    fn run_task_in_process_enforces_permission() {
        install_tables(ProcessFlags::empty());
        let spec = RunTaskSpec {
            pid: Pid(2),
            entry: doubler,
        };
        assert_eq!(
            os_run_task_in_process(&spec, 1),
            Err(UsageError::NotPermitted)
        );
        let spec = RunTaskSpec {
            pid: Pid::KERNEL,
            entry: doubler,
        };
        assert_eq!(
            os_run_task_in_process(&spec, 1),
            Err(UsageError::ProcessOutOfRange)
        );
    }
}
