// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent system call dispatch.
//!
//! A user task traps in with an index and up to three word arguments. The
//! dispatcher validates the index against the constant system call table,
//! brackets the handler with the interrupt-mask policy of its conformance
//! class, and turns the handler's `Result` into either a return value in
//! the caller's registers or an abort of the caller's activation.
//!
//! # System call implementations
//!
//! Handlers have the signature
//!
//! ```ignore
//! fn handler(ctx: &mut SysCallContext<'_>, args: [usize; 3]) -> Result<u32, UserError>;
//! ```
//!
//! Arguments are register-width words (`u32` on the real target). On
//! success the `u32` lands in the caller's return register. A
//! `UserError::Unrecoverable` aborts the caller and charges its process;
//! pointer arguments must go through `validate_readable`/`validate_writable`
//! before anything is dereferenced, which is where the
//! BAD_SYSTEM_CALL_ARGUMENT aborts come from.

use abi::{
    Pid, Priority, ProcessStatus, Sysnum, UsageError, NUM_PROCESSES,
    NUM_SYSCALLS,
};

use crate::ceiling;
use crate::descs::{Conformance, SysCallEntry};
use crate::err::UserError;
use crate::event::Event;
use crate::process::Process;
use crate::sched::{self, AfterExit, RunStack};
use crate::task::{NextTask, Task};
use crate::umem::USlice;

/// Everything a system call handler may touch: the kernel tables and the
/// identity of the trapping task.
pub struct SysCallContext<'a> {
    pub events: &'a mut [Event],
    pub tasks: &'a mut [Task],
    pub processes: &'a mut [Process],
    pub run: &'a mut RunStack,
    /// Index of the trapping task in `tasks`.
    pub caller: usize,
    /// Scheduling consequences accumulated by the handler.
    hint: NextTask,
}

impl<'a> SysCallContext<'a> {
    pub fn new(
        events: &'a mut [Event],
        tasks: &'a mut [Task],
        processes: &'a mut [Process],
        run: &'a mut RunStack,
        caller: usize,
    ) -> Self {
        Self {
            events,
            tasks,
            processes,
            run,
            caller,
            hint: NextTask::Same,
        }
    }

    pub fn caller_pid(&self) -> Pid {
        self.tasks[self.caller].pid()
    }

    fn caller_process(&self) -> &Process {
        &self.processes[self.caller_pid().index()]
    }

    /// Records a scheduling consequence for the dispatcher to act on once
    /// the handler is done.
    pub fn note(&mut self, hint: NextTask) {
        let prior = core::mem::replace(&mut self.hint, NextTask::Same);
        self.hint = prior.combine(hint);
    }

    /// Checks a user pointer/length pair for readability by the caller's
    /// process. This is the `is_user_readable` contract: a failure is a
    /// BAD_SYSTEM_CALL_ARGUMENT abort, and nothing gets dereferenced.
    pub fn validate_readable<T>(
        &self,
        base: usize,
        len: usize,
    ) -> Result<USlice<T>, UserError>
    where
        T: zerocopy::FromBytes,
    {
        let slice = USlice::from_raw(base, len)?;
        if self.caller_process().can_read(&slice) {
            Ok(slice)
        } else {
            Err(UsageError::SliceNotAccessible.into())
        }
    }

    /// Checks a user pointer/length pair for writability by the caller's
    /// process (`is_user_writable`).
    pub fn validate_writable<T>(
        &self,
        base: usize,
        len: usize,
    ) -> Result<USlice<T>, UserError>
    where
        T: zerocopy::FromBytes,
    {
        let slice = USlice::from_raw(base, len)?;
        if self.caller_process().can_write(&slice) {
            Ok(slice)
        } else {
            Err(UsageError::SliceNotAccessible.into())
        }
    }
}

/// Signature shared by every system call handler.
pub type SysCallFn =
    fn(&mut SysCallContext<'_>, [usize; 3]) -> Result<u32, UserError>;

/// The handler wired into unassigned table slots: succeeds, does nothing,
/// aborts nobody.
pub fn nop_handler(
    _ctx: &mut SysCallContext<'_>,
    _args: [usize; 3],
) -> Result<u32, UserError> {
    Ok(0)
}

/// The kernel-owned prefix of the system call table. Application slots
/// start out as no-ops and are filled by `config::register_syscall`.
pub(crate) const BUILTIN_TABLE: [SysCallEntry; NUM_SYSCALLS] = {
    let mut t = [SysCallEntry::NOP; NUM_SYSCALLS];
    // TaskExit is index 0. Its table entry records the conformance class,
    // but the dispatcher special-cases the control flow (the caller never
    // returns through its call chain), so the handler slot stays a no-op.
    t[Sysnum::TaskExit as usize] = SysCallEntry {
        handler: nop_handler,
        class: Conformance::Basic,
    };
    t[Sysnum::TriggerEvent as usize] = SysCallEntry {
        handler: sys_trigger_event,
        class: Conformance::Simple,
    };
    t[Sysnum::RaisePriority as usize] = SysCallEntry {
        handler: sys_raise_priority,
        class: Conformance::Basic,
    };
    t[Sysnum::RestorePriority as usize] = SysCallEntry {
        handler: sys_restore_priority,
        class: Conformance::Basic,
    };
    t[Sysnum::SuspendProcess as usize] = SysCallEntry {
        handler: sys_suspend_process,
        class: Conformance::Simple,
    };
    t[Sysnum::ReadProcessStatus as usize] = SysCallEntry {
        handler: sys_read_process_status,
        class: Conformance::Full,
    };
    t
};

/// What the architecture layer does after a system call.
#[derive(Debug)]
#[must_use]
pub enum SysCallOutcome {
    /// Deposit `retval` in the caller's return register. If
    /// `preempted_by` is set, the handler's side effects readied
    /// something more urgent: the caller stays mid-activation and the
    /// named task gets a fresh entry frame first.
    Resume {
        retval: u32,
        preempted_by: Option<usize>,
    },
    /// The caller's activation is over (task exit or abort); run this
    /// next.
    Switched(AfterExit),
}

/// The dispatcher. `nr` and `args` come raw from the trap; `now_us` is
/// the timebase at kernel entry, used for deadline accounting.
pub fn dispatch(
    mut ctx: SysCallContext<'_>,
    nr: u32,
    args: [usize; 3],
    table: &[SysCallEntry; NUM_SYSCALLS],
    now_us: u64,
) -> SysCallOutcome {
    if nr as usize >= NUM_SYSCALLS {
        // Out-of-range index: abort before consulting anything.
        return abort_caller(ctx, UsageError::BadSyscallNumber.into());
    }

    if let Ok(Sysnum::TaskExit) = Sysnum::try_from(nr) {
        // Ends the current activation without returning through the call
        // chain. BASIC class: the whole thing runs masked.
        return with_class(Conformance::Basic, || {
            SysCallOutcome::Switched(sched::finish_current(
                ctx.events,
                ctx.tasks,
                ctx.processes,
                ctx.run,
                ceiling::current(),
                args[0] as i32,
                now_us,
            ))
        });
    }

    let entry = &table[nr as usize];
    let result = with_class(entry.class, || (entry.handler)(&mut ctx, args));

    match result {
        Ok(retval) => {
            let preempted_by = match ctx.hint {
                NextTask::Same => None,
                NextTask::Specific(i) => Some(i),
                NextTask::Other => sched::maybe_preempt(
                    ctx.tasks,
                    ctx.processes,
                    ctx.run,
                    ceiling::current(),
                    now_us,
                ),
            };
            SysCallOutcome::Resume {
                retval,
                preempted_by,
            }
        }
        Err(UserError::Recoverable(code, hint)) => {
            ctx.note(hint);
            SysCallOutcome::Resume {
                retval: code,
                preempted_by: None,
            }
        }
        Err(UserError::Unrecoverable(fault)) => abort_caller(ctx, fault),
    }
}

fn abort_caller(
    ctx: SysCallContext<'_>,
    fault: abi::FaultInfo,
) -> SysCallOutcome {
    SysCallOutcome::Switched(sched::abort_current(
        ctx.events,
        ctx.tasks,
        ctx.processes,
        ctx.run,
        ceiling::current(),
        fault,
    ))
}

/// Runs `f` under the interrupt-mask policy of `class`.
///
/// BASIC masks everything; SIMPLE masks up to the kernel tick's priority
/// so the tick cannot advance underneath the handler; FULL keeps the
/// caller's own mask and takes preemption by ISRs as it comes.
fn with_class<R>(class: Conformance, f: impl FnOnce() -> R) -> R {
    match class {
        Conformance::Basic => {
            let was_enabled = crate::arch::disable_interrupts();
            let r = f();
            if was_enabled {
                crate::arch::enable_interrupts();
            }
            r
        }
        Conformance::Simple => {
            let saved =
                crate::arch::set_isr_mask(crate::arch::TICK_ISR_PRIORITY);
            let r = f();
            crate::arch::restore_isr_mask(saved);
            r
        }
        Conformance::Full => f(),
    }
}

// --- The kernel-owned handlers ---

fn sys_trigger_event(
    ctx: &mut SysCallContext<'_>,
    args: [usize; 3],
) -> Result<u32, UserError> {
    let caller = ctx.caller_pid();
    let (accepted, hint) = sched::trigger_event(
        ctx.events,
        ctx.tasks,
        ctx.processes,
        args[0],
        caller,
    );
    ctx.note(hint);
    Ok(accepted as u32)
}

fn sys_raise_priority(
    _ctx: &mut SysCallContext<'_>,
    args: [usize; 3],
) -> Result<u32, UserError> {
    let level = args[0];
    if level > usize::from(Priority::MAX_TASK.0) {
        return Err(UsageError::PriorityOutOfRange.into());
    }
    let saved = ceiling::acquire_ceiling(Priority(level as u8));
    Ok(u32::from(saved.0))
}

fn sys_restore_priority(
    ctx: &mut SysCallContext<'_>,
    args: [usize; 3],
) -> Result<u32, UserError> {
    let level = args[0];
    if level > usize::from(Priority::MAX_TASK.0) {
        return Err(UsageError::PriorityOutOfRange.into());
    }
    let saved = Priority(level as u8);
    if saved.is_more_important_than(ceiling::current()) {
        // A release can only lower the register; anything else is a
        // corrupted or forged token.
        return Err(UsageError::PriorityOutOfRange.into());
    }
    ceiling::release_ceiling(saved);
    // Dropping the ceiling may have made a blocked task dispatchable.
    ctx.note(NextTask::Other);
    Ok(0)
}

fn sys_suspend_process(
    ctx: &mut SysCallContext<'_>,
    args: [usize; 3],
) -> Result<u32, UserError> {
    let target = args[0];
    if target >= NUM_PROCESSES {
        return Err(UsageError::ProcessOutOfRange.into());
    }
    let target = Pid(target as u8);
    if target.is_kernel() {
        return Err(UsageError::NotPermitted.into());
    }
    let caller = ctx.caller_pid();
    let may = caller.is_kernel()
        || ctx
            .caller_process()
            .flags()
            .contains(crate::descs::ProcessFlags::SUSPEND_OTHERS);
    if !may {
        return Err(UsageError::NotPermitted.into());
    }
    sched::suspend_process(ctx.events, ctx.tasks, ctx.processes, target);
    Ok(0)
}

fn sys_read_process_status(
    ctx: &mut SysCallContext<'_>,
    args: [usize; 3],
) -> Result<u32, UserError> {
    let target = args[0];
    if target >= NUM_PROCESSES {
        return Err(UsageError::ProcessOutOfRange.into());
    }
    let caller = ctx.caller_pid();
    let may = caller.is_kernel()
        || caller.index() == target
        || ctx
            .caller_process()
            .flags()
            .contains(crate::descs::ProcessFlags::READ_STATUS);
    if !may {
        return Err(UsageError::NotPermitted.into());
    }

    let mut buf: USlice<u8> = ctx.validate_writable(args[1], args[2])?;

    let status = snapshot_status(&ctx.processes[target]);
    // Safety: validated writable just above; the slice is process RAM and
    // does not alias kernel memory.
    let dest = unsafe { buf.assume_writable() };
    match ssmarshal::serialize(dest, &status) {
        Ok(size) => Ok(size as u32),
        Err(ssmarshal::Error::EndOfStream) => {
            // Buffer too small: report the size that would have worked
            // and let the caller notice.
            Ok(core::mem::size_of::<ProcessStatus>() as u32)
        }
        Err(_) => Err(UsageError::InvalidSlice.into()),
    }
}

fn snapshot_status(process: &Process) -> ProcessStatus {
    process.status(crate::arch::stack_reserve(process))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descs::{
        EventDesc, ProcessDesc, ProcessFlags, RegionAttributes, RegionDesc,
        TaskDesc, REGIONS_PER_PROCESS,
    };
    use crate::process::test_support::user_process;
    use abi::{EventId, FaultCause};

    extern "C" fn entry(_arg: u32) -> i32 {
        0
    }

    struct Fixture {
        events: Vec<Event>,
        tasks: Vec<Task>,
        processes: Vec<Process>,
        run: RunStack,
        table: [SysCallEntry; NUM_SYSCALLS],
    }

    /// Three software events (priorities 2, 5, 1), one task each; the
    /// priority-2 task belongs to process 1 and is dispatched as the
    /// caller, so there is a "current" activation to trap from.
    fn fixture(caller_flags: ProcessFlags) -> Fixture {
        let mut events = Vec::new();
        let mut tasks = Vec::new();
        for (e, (prio, pid)) in
            [(2u8, 1u8), (5, 2), (1, 2)].into_iter().enumerate()
        {
            tasks.push(Task::new(
                TaskDesc {
                    event: EventId(e as u16),
                    pid: Pid(pid),
                    entry,
                    budget_us: 0,
                    slot: 0,
                },
                Priority(prio),
            ));
            events.push(Event::new(
                EventDesc {
                    period_ticks: 0,
                    offset_ticks: 0,
                    priority: Priority(prio),
                    min_pid: Pid(1),
                },
                e as u16,
                1,
            ));
        }
        let processes: Vec<Process> = (0..NUM_PROCESSES as u8)
            .map(|pid| {
                user_process(
                    Pid(pid),
                    if pid == 1 {
                        caller_flags
                    } else {
                        ProcessFlags::empty()
                    },
                )
            })
            .collect();

        let mut run = RunStack::new();
        let mut f = Fixture {
            events,
            tasks,
            processes,
            run: RunStack::new(),
            table: BUILTIN_TABLE,
        };
        let (ok, _) = sched::trigger_event(
            &mut f.events,
            &mut f.tasks,
            &f.processes,
            0,
            Pid::KERNEL,
        );
        assert!(ok);
        let t = sched::maybe_preempt(
            &mut f.tasks,
            &f.processes,
            &mut run,
            Priority::IDLE,
            0,
        );
        assert_eq!(t, Some(0));
        f.run = run;
        f
    }

    impl Fixture {
        fn dispatch(
            &mut self,
            nr: u32,
            args: [usize; 3],
        ) -> SysCallOutcome {
            let ctx = SysCallContext::new(
                &mut self.events,
                &mut self.tasks,
                &mut self.processes,
                &mut self.run,
                0,
            );
            dispatch(ctx, nr, args, &self.table, 0)
        }

        /// Swaps process 1 for one whose only region covers
        /// `base..base + size`, so handlers can really write through
        /// validated slices under test.
        fn back_caller_with(
            &mut self,
            base: usize,
            size: usize,
            flags: ProcessFlags,
        ) {
            let mut regions = [None; REGIONS_PER_PROCESS];
            regions[0] = Some(RegionDesc {
                base,
                size,
                attributes: RegionAttributes::READ
                    | RegionAttributes::WRITE,
            });
            self.processes[1] = Process::new(
                ProcessDesc {
                    pid: Pid(1),
                    stack: RegionDesc {
                        base: 0x2001_1000,
                        size: 0x400,
                        attributes: RegionAttributes::READ
                            | RegionAttributes::WRITE,
                    },
                    regions,
                    flags,
                },
                None,
                None,
            );
        }
    }

    #[test]
    fn out_of_range_index_aborts_without_any_handler() {
        fn canary(
            ctx: &mut SysCallContext<'_>,
            _args: [usize; 3],
        ) -> Result<u32, UserError> {
            // Leaves a fingerprint no test expects.
            ctx.processes[4].charge(FaultCause::Other);
            Ok(0)
        }
        let mut f = fixture(ProcessFlags::empty());
        for slot in &mut f.table {
            slot.handler = canary;
        }

        let outcome = f.dispatch(NUM_SYSCALLS as u32, [0; 3]);
        assert!(matches!(
            outcome,
            SysCallOutcome::Switched(AfterExit::Idle)
        ));
        assert_eq!(
            f.processes[1].error_count(FaultCause::BadSystemCall),
            1
        );
        assert_eq!(f.processes[4].total_errors(), 0);
    }

    #[test]
    fn unassigned_entry_is_a_harmless_nop() {
        let mut f = fixture(ProcessFlags::empty());
        let outcome = f.dispatch(abi::FIRST_APP_SYSCALL as u32, [7, 8, 9]);
        match outcome {
            SysCallOutcome::Resume {
                retval,
                preempted_by,
            } => {
                assert_eq!(retval, 0);
                assert_eq!(preempted_by, None);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(f.processes[1].total_errors(), 0);
    }

    #[test]
    fn task_exit_ends_the_activation() {
        let mut f = fixture(ProcessFlags::empty());
        let outcome = f.dispatch(Sysnum::TaskExit as u32, [0; 3]);
        assert!(matches!(
            outcome,
            SysCallOutcome::Switched(AfterExit::Idle)
        ));
        assert_eq!(f.run.depth(), 0);
        assert!(!f.events[0].is_pending());
        assert_eq!(f.processes[1].total_errors(), 0);
    }

    #[test]
    fn task_exit_with_negative_code_counts_user_abort() {
        let mut f = fixture(ProcessFlags::empty());
        let _ = f.dispatch(
            Sysnum::TaskExit as u32,
            [(-5i32) as u32 as usize, 0, 0],
        );
        assert_eq!(f.processes[1].error_count(FaultCause::UserAbort), 1);
    }

    #[test]
    fn trigger_event_returns_acceptance_and_preempts() {
        let mut f = fixture(ProcessFlags::empty());
        // Event 1 has priority 5, above the caller's 2: accepted and
        // preempting.
        match f.dispatch(Sysnum::TriggerEvent as u32, [1, 0, 0]) {
            SysCallOutcome::Resume {
                retval,
                preempted_by,
            } => {
                assert_eq!(retval, 1);
                assert_eq!(preempted_by, Some(1));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        // The caller is still mid-activation underneath.
        assert_eq!(f.run.depth(), 2);

        // Re-trigger: the event is pending, so this is a loss.
        match f.dispatch(Sysnum::TriggerEvent as u32, [1, 0, 0]) {
            SysCallOutcome::Resume { retval, .. } => assert_eq!(retval, 0),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(f.events[1].activation_losses(), 1);
    }

    #[test]
    fn trigger_event_below_caller_priority_does_not_preempt() {
        let mut f = fixture(ProcessFlags::empty());
        match f.dispatch(Sysnum::TriggerEvent as u32, [2, 0, 0]) {
            SysCallOutcome::Resume {
                retval,
                preempted_by,
            } => {
                assert_eq!(retval, 1);
                assert_eq!(preempted_by, None);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn trigger_event_bogus_id_reports_false_without_abort() {
        let mut f = fixture(ProcessFlags::empty());
        match f.dispatch(Sysnum::TriggerEvent as u32, [999, 0, 0]) {
            SysCallOutcome::Resume { retval, .. } => assert_eq!(retval, 0),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(f.processes[1].total_errors(), 0);
    }

    #[test]
    fn suspend_requires_permission() {
        let mut f = fixture(ProcessFlags::empty());
        let outcome = f.dispatch(Sysnum::SuspendProcess as u32, [2, 0, 0]);
        assert!(matches!(outcome, SysCallOutcome::Switched(_)));
        assert_eq!(
            f.processes[1]
                .error_count(FaultCause::BadSystemCallArgument),
            1
        );
        assert!(!f.processes[2].is_halted());
    }

    #[test]
    fn suspend_with_permission_halts_target() {
        let mut f = fixture(ProcessFlags::SUSPEND_OTHERS);
        match f.dispatch(Sysnum::SuspendProcess as u32, [2, 0, 0]) {
            SysCallOutcome::Resume { retval, .. } => assert_eq!(retval, 0),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(f.processes[2].is_halted());

        // Twice is the same as once.
        let _ = f.dispatch(Sysnum::SuspendProcess as u32, [2, 0, 0]);
        assert!(f.processes[2].is_halted());
        assert_eq!(f.processes[1].total_errors(), 0);
    }

    #[test]
    fn suspending_the_kernel_is_refused() {
        let mut f = fixture(ProcessFlags::SUSPEND_OTHERS);
        let outcome = f.dispatch(Sysnum::SuspendProcess as u32, [0, 0, 0]);
        assert!(matches!(outcome, SysCallOutcome::Switched(_)));
        assert!(!f.processes[0].is_halted());
    }

    #[test]
    fn bad_pointer_argument_aborts_before_any_side_effect() {
        // The write_serial shape: an app handler that validates a user
        // buffer, then "transmits" it. With a wild pointer the transmit
        // count must stay zero and the caller must be charged.
        use core::sync::atomic::{AtomicU32, Ordering};
        static TRANSMITTED: AtomicU32 = AtomicU32::new(0);
        fn write_serial(
            ctx: &mut SysCallContext<'_>,
            args: [usize; 3],
        ) -> Result<u32, UserError> {
            let msg: USlice<u8> = ctx.validate_readable(args[0], args[1])?;
            TRANSMITTED.fetch_add(1, Ordering::SeqCst);
            Ok(msg.len() as u32)
        }

        let mut f = fixture(ProcessFlags::empty());
        let idx = abi::FIRST_APP_SYSCALL;
        f.table[idx] = SysCallEntry {
            handler: write_serial,
            class: Conformance::Full,
        };

        let outcome = f.dispatch(idx as u32, [0xDEAD_BEEF, 10, 0]);
        assert!(matches!(outcome, SysCallOutcome::Switched(_)));
        assert_eq!(
            f.processes[1]
                .error_count(FaultCause::BadSystemCallArgument),
            1
        );
        assert_eq!(TRANSMITTED.load(Ordering::SeqCst), 0);

        // With a pointer into the caller's own region it goes through.
        let outcome = f.dispatch(idx as u32, [0x2000_1000, 10, 0]);
        match outcome {
            SysCallOutcome::Resume { retval, .. } => assert_eq!(retval, 10),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(TRANSMITTED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pointer_straddling_region_end_is_rejected() {
        use core::sync::atomic::{AtomicU32, Ordering};
        static TRANSMITTED: AtomicU32 = AtomicU32::new(0);
        fn write_serial(
            ctx: &mut SysCallContext<'_>,
            args: [usize; 3],
        ) -> Result<u32, UserError> {
            let _msg: USlice<u8> =
                ctx.validate_readable(args[0], args[1])?;
            TRANSMITTED.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }
        let mut f = fixture(ProcessFlags::empty());
        let idx = abi::FIRST_APP_SYSCALL + 1;
        f.table[idx] = SysCallEntry {
            handler: write_serial,
            class: Conformance::Full,
        };

        // Starts inside the caller's region (which ends at 0x2000_1400),
        // runs past its end into unmapped space.
        let outcome = f.dispatch(idx as u32, [0x2000_13F8, 0x10, 0]);
        assert!(matches!(outcome, SysCallOutcome::Switched(_)));
        assert_eq!(
            f.processes[1]
                .error_count(FaultCause::BadSystemCallArgument),
            1
        );
        assert_eq!(TRANSMITTED.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn conformance_classes_bracket_the_interrupt_mask() {
        fn basic_probe(
            _ctx: &mut SysCallContext<'_>,
            _args: [usize; 3],
        ) -> Result<u32, UserError> {
            assert!(crate::arch::interrupts_disabled());
            Ok(0)
        }
        fn simple_probe(
            _ctx: &mut SysCallContext<'_>,
            _args: [usize; 3],
        ) -> Result<u32, UserError> {
            assert!(!crate::arch::interrupts_disabled());
            assert_eq!(
                crate::arch::isr_mask(),
                crate::arch::TICK_ISR_PRIORITY
            );
            Ok(0)
        }
        fn full_probe(
            _ctx: &mut SysCallContext<'_>,
            _args: [usize; 3],
        ) -> Result<u32, UserError> {
            assert!(!crate::arch::interrupts_disabled());
            assert_eq!(crate::arch::isr_mask(), 0);
            Ok(0)
        }

        let mut f = fixture(ProcessFlags::empty());
        let b = abi::FIRST_APP_SYSCALL;
        f.table[b] = SysCallEntry {
            handler: basic_probe,
            class: Conformance::Basic,
        };
        f.table[b + 1] = SysCallEntry {
            handler: simple_probe,
            class: Conformance::Simple,
        };
        f.table[b + 2] = SysCallEntry {
            handler: full_probe,
            class: Conformance::Full,
        };

        for nr in [b, b + 1, b + 2] {
            let _ = f.dispatch(nr as u32, [0; 3]);
            // The mask is restored on the way out, every time.
            assert!(!crate::arch::interrupts_disabled());
            assert_eq!(crate::arch::isr_mask(), 0);
        }
    }

    #[test]
    fn status_read_serializes_into_validated_buffer() {
        let mut f = fixture(ProcessFlags::empty());
        f.processes[2].charge(FaultCause::DivideByZero);

        let mut buf = vec![0u8; 128];
        let (addr, len) = (buf.as_mut_ptr() as usize, buf.len());
        f.back_caller_with(addr, len, ProcessFlags::READ_STATUS);

        let outcome =
            f.dispatch(Sysnum::ReadProcessStatus as u32, [2, addr, len]);
        let written = match outcome {
            SysCallOutcome::Resume { retval, .. } => retval as usize,
            other => panic!("unexpected outcome {other:?}"),
        };
        assert!(written > 0 && written <= len);

        // Deserialize what the kernel wrote and check it round-trips.
        let (status, _): (ProcessStatus, usize) =
            ssmarshal::deserialize(&buf[..written]).unwrap();
        assert_eq!(status.pid, Pid(2));
        assert!(!status.halted);
        assert_eq!(status.errors[FaultCause::DivideByZero.index()], 1);
        assert_eq!(status.total_errors, 1);
    }

    #[test]
    fn status_read_needs_permission_or_self() {
        let mut buf = vec![0u8; 128];
        let (addr, len) = (buf.as_mut_ptr() as usize, buf.len());

        // Reading someone else without the permission bit: abort.
        let mut f = fixture(ProcessFlags::empty());
        f.back_caller_with(addr, len, ProcessFlags::empty());
        let outcome =
            f.dispatch(Sysnum::ReadProcessStatus as u32, [2, addr, len]);
        assert!(matches!(outcome, SysCallOutcome::Switched(_)));

        // Reading yourself is always fine.
        let mut f = fixture(ProcessFlags::empty());
        f.back_caller_with(addr, len, ProcessFlags::empty());
        let outcome =
            f.dispatch(Sysnum::ReadProcessStatus as u32, [1, addr, len]);
        assert!(matches!(outcome, SysCallOutcome::Resume { .. }));
    }

    #[test]
    fn raise_and_restore_priority_round_trip() {
        // Levels are kept at or below the caller's priority so the global
        // ceiling register never perturbs concurrently running dispatch
        // tests.
        let mut f = fixture(ProcessFlags::empty());
        let before = ceiling::current();

        let saved =
            match f.dispatch(Sysnum::RaisePriority as u32, [2, 0, 0]) {
                SysCallOutcome::Resume { retval, .. } => retval,
                other => panic!("unexpected outcome {other:?}"),
            };
        assert_eq!(ceiling::current(), Priority(2));

        match f.dispatch(
            Sysnum::RestorePriority as u32,
            [saved as usize, 0, 0],
        ) {
            SysCallOutcome::Resume { retval, .. } => assert_eq!(retval, 0),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(ceiling::current(), before);
    }

    #[test]
    fn restore_priority_rejects_forged_tokens() {
        let mut f = fixture(ProcessFlags::empty());
        // Restoring *above* the held ceiling is a forged token.
        let outcome =
            f.dispatch(Sysnum::RestorePriority as u32, [15, 0, 0]);
        assert!(matches!(outcome, SysCallOutcome::Switched(_)));
        assert_eq!(
            f.processes[1]
                .error_count(FaultCause::BadSystemCallArgument),
            1
        );
    }
}
