// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.
//!
//! The board support code brings up clocks, registers its configuration
//! through `config`, and calls [`start_kernel`]. From there: validate,
//! freeze the tables, paint stacks, run the init tasks, arm the
//! interrupt controller and the tick timer, and become the idle context.
//! The function only ever returns to report a rejected configuration.

use core::convert::Infallible;
use core::mem::MaybeUninit;

use abi::{ConfigError, Pid, NUM_PROCESSES};

use crate::config::with_config;
use crate::descs::{MAX_EVENTS, MAX_TASKS};
use crate::event::Event;
use crate::load::LoadEstimator;
use crate::process::Process;
use crate::sched::RunStack;
use crate::task::Task;

/// Backing store for the runtime tables, initialized during
/// `start_kernel` and referenced by every kernel entry thereafter.
static mut EVENT_TABLE_SPACE: MaybeUninit<[Event; MAX_EVENTS]> =
    MaybeUninit::uninit();
static mut TASK_TABLE_SPACE: MaybeUninit<[Task; MAX_TASKS]> =
    MaybeUninit::uninit();
static mut PROCESS_TABLE_SPACE: MaybeUninit<[Process; NUM_PROCESSES]> =
    MaybeUninit::uninit();
static mut RUN_STACK: RunStack = RunStack::new();

/// The main kernel entry point.
///
/// `tick_divisor` is the platform's way of converting machine time into
/// kernel ticks: CPU cycles per tick, where a tick is nominally a
/// millisecond.
///
/// On success this never returns; the calling context is reborn as the
/// idle context at priority 0. It returns only to report the first
/// configuration check that failed, in which case the kernel has not
/// started and nothing has been scheduled.
///
/// # Safety
///
/// This can be called exactly once per boot, from the single boot
/// context, after all configuration calls are done.
pub unsafe fn start_kernel(
    tick_divisor: u32,
) -> Result<Infallible, ConfigError> {
    klog!("starting: checks");
    with_config(|c| c.validate())?;

    // Freeze the descriptors into the runtime tables.
    //
    // Safety: single boot context, called once, so taking &mut to these
    // statics does not alias; the pointers are handed to `arch` below
    // and the statics are never touched by name again.
    let (events, tasks, processes) = unsafe {
        let events_space = &mut *core::ptr::addr_of_mut!(EVENT_TABLE_SPACE);
        let tasks_space = &mut *core::ptr::addr_of_mut!(TASK_TABLE_SPACE);
        let procs_space =
            &mut *core::ptr::addr_of_mut!(PROCESS_TABLE_SPACE);

        // Safety: MaybeUninit<[T; N]> -> [MaybeUninit<T>; N] is always
        // defined.
        let events_space: &mut [MaybeUninit<Event>; MAX_EVENTS] =
            &mut *(events_space as *mut _ as *mut _);
        let tasks_space: &mut [MaybeUninit<Task>; MAX_TASKS] =
            &mut *(tasks_space as *mut _ as *mut _);
        let procs_space: &mut [MaybeUninit<Process>; NUM_PROCESSES] =
            &mut *(procs_space as *mut _ as *mut _);

        let (n_events, n_tasks) = with_config(|c| {
            c.build_tables(events_space, tasks_space, procs_space)
        });

        // Safety: build_tables initialized the first n_events/n_tasks
        // entries and every process slot; shed the MaybeUninit on
        // exactly those.
        (
            core::slice::from_raw_parts_mut(
                events_space.as_mut_ptr() as *mut Event,
                n_events,
            ),
            core::slice::from_raw_parts_mut(
                tasks_space.as_mut_ptr() as *mut Task,
                n_tasks,
            ),
            core::slice::from_raw_parts_mut(
                procs_space.as_mut_ptr() as *mut Process,
                NUM_PROCESSES,
            ),
        )
    };

    klog!("starting: stacks");
    for process in processes.iter() {
        let stack = *process.stack();
        if !process.pid().is_kernel() && stack.size != 0 {
            // Safety: validation established that this is a well-formed
            // RAM region owned by exactly this process, and no task has
            // run yet, so the whole stack is dead space.
            unsafe {
                crate::process::paint_stack(&stack, stack.end_addr());
            }
        }
    }

    // Init tasks, in ascending process order. Any of them can veto
    // startup.
    klog!("starting: init tasks");
    let init_tasks: [Option<crate::descs::TaskEntry>; NUM_PROCESSES] =
        with_config(|c| {
            let mut t = [None; NUM_PROCESSES];
            for (pid, entry) in c.init_tasks() {
                t[pid.index()] = Some(entry);
            }
            t
        });
    for (i, entry) in init_tasks.iter().enumerate() {
        let Some(entry) = entry else { continue };
        let pid = Pid(i as u8);
        let rv = if pid.is_kernel() {
            entry(u32::from(pid.0))
        } else {
            crate::arch::call_in_process(
                &processes[pid.index()],
                *entry,
                u32::from(pid.0),
            )
        };
        if rv < 0 {
            return Err(ConfigError::InitTaskFailed(pid));
        }
    }

    // Hand the tables to the architecture layer; from here on, kernel
    // entries manufacture their references through `arch::with_tables`.
    //
    // Safety: the slices point into statics that live forever, and this
    // context never touches them by name again.
    unsafe {
        let run = &mut *core::ptr::addr_of_mut!(RUN_STACK);
        crate::arch::set_tables(events, tasks, processes, run);
    }

    // The boot context moves onto the process stack and becomes the
    // idle context before anything can preempt it.
    crate::arch::become_idle_context();

    // Arm the hardware: registered external interrupts first, then the
    // tick, so the first tick cannot observe a half-armed controller.
    with_config(|c| {
        for desc in c.interrupts() {
            crate::arch::enable_external_interrupt(desc);
        }
    });
    crate::arch::start_tick_timer(tick_divisor);

    klog!("starting: palisade");

    // This context is now the idle context: priority 0, interruptible,
    // and host of the CPU load probe.
    let mut load = LoadEstimator::new(crate::arch::timebase_now());
    loop {
        crate::arch::wait_for_interrupt();
        load.sample(crate::arch::timebase_now());
        crate::load::publish(load.busy_permille());
    }
}
