// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Descriptor types, used to statically define the application's events,
//! tasks, processes, interrupts, and system calls.
//!
//! Descriptors are filled in by the configuration API (`config`) before
//! `start_kernel` and are immutable afterwards; the mutable runtime state
//! derived from them lives in `event`, `task`, and `process`.

use abi::{EventId, IsrPriority, Pid, Priority};

/// Capacity of the event table.
pub const MAX_EVENTS: usize = 32;

/// Capacity of the task table, across all events.
pub const MAX_TASKS: usize = 64;

/// Greatest number of tasks that may be bound to one event.
pub const MAX_TASKS_PER_EVENT: usize = 4;

/// Number of region slots per process. Needs to be less than or equal to
/// the number of regions the protection hardware can map at once, minus the
/// slots the kernel spends on the shared region and the flash window.
pub const REGIONS_PER_PROCESS: usize = 5;

/// Capacity of the interrupt handler table.
pub const MAX_INTERRUPTS: usize = 16;

/// Entry function of a task.
///
/// The argument is the raw id of the activating event for scheduled tasks,
/// the process id for init tasks, and caller-chosen for
/// `run_task_in_process`. A negative return value is counted against the
/// owning process as a user-signalled error; it does not affect scheduling.
pub type TaskEntry = extern "C" fn(u32) -> i32;

/// First-level interrupt handler, run from ISR context.
pub type IsrHandler = fn();

/// Record describing a single event, the unit of activation.
#[derive(Copy, Clone, Debug)]
pub struct EventDesc {
    /// Cycle time in ticks; 0 makes this a software-triggered event and
    /// `offset_ticks` is ignored.
    pub period_ticks: u32,
    /// Delay, in ticks, added before the first activation of a cyclic
    /// event. The first activation occurs `offset_ticks + period_ticks`
    /// after the kernel starts.
    pub offset_ticks: u32,
    /// Urgency shared by every task bound to this event.
    pub priority: Priority,
    /// Least privileged process that may software-trigger this event.
    /// `Pid::KERNEL` restricts triggering to the kernel itself.
    pub min_pid: Pid,
}

/// Record describing a single task: one entry function bound to an event,
/// owned by a process.
#[derive(Copy, Clone, Debug)]
pub struct TaskDesc {
    /// The event whose activation runs this task.
    pub event: EventId,
    /// The process whose memory view and stack the task runs in.
    pub pid: Pid,
    /// Address the activation starts from, every time.
    pub entry: TaskEntry,
    /// Runtime budget for one activation, in timebase microseconds.
    /// 0 disables the deadline check.
    pub budget_us: u32,
    /// Position among the tasks bound to the same event; also the
    /// execution order within one activation.
    pub slot: u8,
}

/// Record describing one registered interrupt service routine.
#[derive(Copy, Clone, Debug)]
pub struct InterruptDesc {
    /// Hardware vector number being hooked.
    pub vector: u32,
    /// Priority in the interrupt controller's space.
    pub priority: IsrPriority,
    /// Whether higher-priority ISRs may preempt this one. When false, the
    /// dispatcher raises the interrupt mask to the top of the ISR space for
    /// the duration of the handler.
    pub preemptable: bool,
    /// The handler itself.
    pub handler: IsrHandler,
}

/// Description of one memory region.
///
/// A region belongs to exactly one process (or is the designated shared
/// region). Overlap between processes' regions is a configuration error,
/// which is what makes write isolation meaningful.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct RegionDesc {
    /// Address of start of region. The protection hardware has alignment
    /// requirements for this; on ARMv7-M it must be naturally aligned for
    /// the size. (`usize` is the target's `u32`; it is only wider when
    /// the kernel logic is built for host testing.)
    pub base: usize,
    /// Size of region, in bytes. On ARMv7-M this must be a power of two,
    /// 32 or larger.
    pub size: usize,
    /// Flags describing what can be done with this region.
    pub attributes: RegionAttributes,
}

impl RegionDesc {
    /// Tests whether `self` contains `addr`.
    pub fn contains(&self, addr: usize) -> bool {
        self.base <= addr && addr < self.end_addr()
    }

    /// Computes the address one past the end of this region. Regions are
    /// not allowed to butt up against the end of the address space, so this
    /// cannot wrap.
    pub fn end_addr(&self) -> usize {
        self.base.wrapping_add(self.size)
    }

    /// Checks the shape constraints the protection hardware imposes:
    /// power-of-two size of at least 32, naturally aligned base, not
    /// reaching the end of the address space.
    pub fn is_well_formed(&self) -> bool {
        self.size.is_power_of_two()
            && self.size >= 32
            && self.base % self.size == 0
            && self.base.checked_add(self.size).is_some()
    }
}

/// Compatibility with the generic coverage check in `memcore`.
impl memcore::MappedRegion for RegionDesc {
    #[inline(always)]
    fn base_addr(&self) -> usize {
        self.base
    }

    #[inline(always)]
    fn end_addr(&self) -> usize {
        self.end_addr()
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct RegionAttributes: u32 {
        /// Region can be read by the owning process.
        const READ = 1 << 0;
        /// Region can be written by the owning process.
        const WRITE = 1 << 1;
        /// Region can contain executable code.
        const EXECUTE = 1 << 2;
        /// Region contains memory mapped registers. This affects cache
        /// behavior, and the kernel will never treat it as plain memory in
        /// system call argument checks.
        const DEVICE = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Per-process permission bits, granted at registration and consulted
    /// by the privileged system call surface.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    #[repr(transparent)]
    pub struct ProcessFlags: u32 {
        /// May map and touch device regions (I/O registers).
        const DEVICE_ACCESS = 1 << 0;
        /// May permanently suspend other processes.
        const SUSPEND_OTHERS = 1 << 1;
        /// May be the target of `run_task_in_process`.
        const RUN_TASKS = 1 << 2;
        /// May read diagnostic status records of any process.
        const READ_STATUS = 1 << 3;
    }
}

/// Record describing a process: a memory protection domain.
#[derive(Copy, Clone, Debug)]
pub struct ProcessDesc {
    pub pid: Pid,
    /// The stack every task of this process runs on. Also readable and
    /// writable data, so it appears in the access table too.
    pub stack: RegionDesc,
    /// Owned RAM/flash/device regions, beyond the stack.
    pub regions: [Option<RegionDesc>; REGIONS_PER_PROCESS],
    /// Permission bits.
    pub flags: ProcessFlags,
}

impl ProcessDesc {
    /// Placeholder descriptor for a process table slot nothing was
    /// registered into. It owns no memory and holds no permissions, and
    /// validation guarantees no task references it.
    pub const fn unused(pid: Pid) -> Self {
        Self {
            pid,
            stack: RegionDesc {
                base: 0,
                size: 0,
                attributes: RegionAttributes::empty(),
            },
            regions: [None; REGIONS_PER_PROCESS],
            flags: ProcessFlags::empty(),
        }
    }
}

/// How the dispatcher treats interrupts while a system call handler runs.
///
/// This is the "conformance class" of a handler. It is a property of the
/// handler recorded next to it in the system call table, not something the
/// caller gets to choose.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Conformance {
    /// Very short, one-word state changes. Runs with every interrupt
    /// masked; may not call other kernel services.
    Basic,
    /// Short services, such as single I/O register pokes. Runs with the
    /// interrupt mask raised to the kernel tick's priority; may use the
    /// argument-validation helpers, may not suspend.
    Simple,
    /// Longer services. Runs with the caller's own interrupt mask, so ISRs
    /// preempt it freely; may not block.
    Full,
}

/// One entry of the system call table: a handler and its conformance
/// class. The table is a constant array of `abi::NUM_SYSCALLS` entries
/// living in read-only memory; unassigned entries resolve to
/// [`SysCallEntry::NOP`].
#[derive(Copy, Clone)]
pub struct SysCallEntry {
    pub handler: crate::syscalls::SysCallFn,
    pub class: Conformance,
}

impl SysCallEntry {
    /// The do-nothing handler wired into unassigned table slots. It
    /// returns 0 and does not abort the caller.
    pub const NOP: Self = Self {
        handler: crate::syscalls::nop_handler,
        class: Conformance::Basic,
    };
}
