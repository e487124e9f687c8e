// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side stand-in for the architecture layer, used to compile and
//! unit test the kernel's policy code off-target.
//!
//! Nothing here touches hardware. The interrupt mask is a thread-local
//! shadow so tests can observe the bracketing the kernel performs; table
//! access mirrors the real backend's manufactured-reference scheme, but
//! per test thread.

use std::cell::Cell;

use crate::process::Process;
use crate::sched::{RunStack, Tables};
use crate::task::Task;
use crate::time::Timestamp;

macro_rules! klog {
    ($s:expr) => { println!($s) };
    ($s:expr, $($tt:tt)*) => { println!($s, $($tt)*) };
}

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

#[allow(unused_macros)]
macro_rules! uassert_eq {
    ($left:expr, $right:expr) => {
        assert_eq!($left, $right)
    };
}

/// Logical priority of the kernel tick's ISR, for the SIMPLE conformance
/// class mask.
pub const TICK_ISR_PRIORITY: u8 = 1;

/// Register file stand-in. The host runs no user code, so nothing is
/// ever actually saved here; the struct exists because the task table
/// embeds one per task.
#[derive(Debug, Default)]
pub struct SavedState {
    pub psp: u32,
    pub exc_return: u32,
}

#[derive(Copy, Clone)]
struct RawTables {
    events: *mut crate::event::Event,
    n_events: usize,
    tasks: *mut Task,
    n_tasks: usize,
    processes: *mut Process,
    n_processes: usize,
    run: *mut RunStack,
}

thread_local! {
    static ISR_MASK: Cell<u8> = const { Cell::new(0) };
    static INTERRUPTS_OFF: Cell<bool> = const { Cell::new(false) };
    static PENDED_SWITCHES: Cell<u32> = const { Cell::new(0) };
    static TIMEBASE: Cell<u64> = const { Cell::new(0) };
    static TICKS: Cell<u64> = const { Cell::new(0) };
    static TABLES: Cell<Option<RawTables>> = const { Cell::new(None) };
}

/// Records the kernel tables for this thread, standing in for the real
/// backend's boot-time wiring.
///
/// # Safety
///
/// The referents must outlive every later `with_tables` call on this
/// thread, and nothing else may alias them while the kernel (or a test
/// acting as the kernel) is between entries.
pub unsafe fn set_tables(
    events: &mut [crate::event::Event],
    tasks: &mut [Task],
    processes: &mut [Process],
    run: &mut RunStack,
) {
    TABLES.with(|t| {
        t.set(Some(RawTables {
            events: events.as_mut_ptr(),
            n_events: events.len(),
            tasks: tasks.as_mut_ptr(),
            n_tasks: tasks.len(),
            processes: processes.as_mut_ptr(),
            n_processes: processes.len(),
            run,
        }))
    });
}

/// Manufactures exclusive references to the kernel tables and hands them
/// to `body`. This bypasses borrow checking and must only be used once
/// per kernel entry, then passed around.
pub fn with_tables<R>(body: impl FnOnce(Tables<'_>) -> R) -> R {
    let raw = TABLES
        .with(|t| t.get())
        .expect("kernel tables not installed");
    // Safety: set_tables' contract gives us live, unaliased referents;
    // the anonymous lifetime keeps the references from escaping.
    let tables = unsafe {
        Tables {
            events: core::slice::from_raw_parts_mut(
                raw.events,
                raw.n_events,
            ),
            tasks: core::slice::from_raw_parts_mut(raw.tasks, raw.n_tasks),
            processes: core::slice::from_raw_parts_mut(
                raw.processes,
                raw.n_processes,
            ),
            run: &mut *raw.run,
        }
    };
    body(tables)
}

/// Masks all interrupts. Returns `true` if they were enabled before,
/// i.e. whether the matching restore should re-enable.
pub fn disable_interrupts() -> bool {
    INTERRUPTS_OFF.with(|c| !c.replace(true))
}

/// Unmasks all interrupts.
pub fn enable_interrupts() {
    INTERRUPTS_OFF.with(|c| c.set(false));
}

/// Whether the all-interrupts mask is currently in force.
pub fn interrupts_disabled() -> bool {
    INTERRUPTS_OFF.with(|c| c.get())
}

/// Raises the ISR priority mask to `level` if it is currently lower.
/// Returns the previous level for `restore_isr_mask`.
pub fn set_isr_mask(level: u8) -> u8 {
    ISR_MASK.with(|c| {
        let prev = c.get();
        if level > prev {
            c.set(level);
        }
        prev
    })
}

/// Restores a mask level previously returned by `set_isr_mask`.
pub fn restore_isr_mask(saved: u8) {
    ISR_MASK.with(|c| {
        uassert!(saved <= c.get());
        c.set(saved);
    });
}

/// The current logical ISR mask level.
pub fn isr_mask() -> u8 {
    ISR_MASK.with(|c| c.get())
}

/// Requests a context switch on the way out of the kernel. The host has
/// no "way out", so this just counts.
pub fn pend_context_switch() {
    PENDED_SWITCHES.with(|c| c.set(c.get() + 1));
}

/// Number of context switches requested on this thread; test hook.
pub fn pended_switches() -> u32 {
    PENDED_SWITCHES.with(|c| c.get())
}

/// Reads the tick clock.
pub fn now() -> Timestamp {
    TICKS.with(|c| c.get()).into()
}

/// Reads the free-running microsecond timebase.
pub fn timebase_now() -> u64 {
    TIMEBASE.with(|c| c.get())
}

/// Advances the fake timebase; test hook.
pub fn advance_timebase(us: u64) {
    TIMEBASE.with(|c| c.set(c.get() + us));
}

/// Memory protection is a no-op on the host: there is no unprivileged
/// code to protect against.
pub fn apply_memory_protection(_process: &Process) {}

/// Runs `entry` directly; the host has no memory views to switch.
pub fn call_in_process(
    _process: &Process,
    entry: crate::descs::TaskEntry,
    arg: u32,
) -> i32 {
    entry(arg)
}

/// Stack painting never happens on the host, so there is nothing to
/// measure.
pub fn stack_reserve(_process: &Process) -> u32 {
    0
}

pub fn enable_external_interrupt(_desc: &crate::descs::InterruptDesc) {}

pub fn become_idle_context() {}

pub fn start_tick_timer(_tick_divisor: u32) {}

pub fn wait_for_interrupt() {}
