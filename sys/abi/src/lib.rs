// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and user partitions.
//!
//! Everything in this crate is part of the contract the kernel exposes to
//! application code: identities (processes, events, priorities), the fault
//! taxonomy used for the per-process error accounting, system call numbers,
//! and the status records the supervisor can read back out of the kernel.

#![no_std]

use serde::{Deserialize, Serialize};

/// Number of process table slots, including the kernel process at index 0.
pub const NUM_PROCESSES: usize = 5;

/// Number of user partitions (process ids 1 through `NUM_PROCESSES - 1`).
pub const NUM_USER_PROCESSES: usize = NUM_PROCESSES - 1;

/// Number of entries in the system call table. Indices at or above this
/// value are rejected before any handler is consulted.
pub const NUM_SYSCALLS: usize = 16;

/// Names a process, i.e. a memory protection domain.
///
/// Process 0 is the kernel itself and is exempt from all protection; ids 1
/// through `NUM_PROCESSES - 1` are user partitions. Larger process ids are
/// conventionally assigned to more trusted partitions, which is what the
/// minimum-privilege check on software-triggered events relies on.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Default,
)]
#[repr(transparent)]
pub struct Pid(pub u8);

impl Pid {
    /// The kernel's own process id.
    pub const KERNEL: Self = Self(0);

    /// Checks whether this is the kernel process.
    pub fn is_kernel(self) -> bool {
        self == Self::KERNEL
    }

    /// Checks whether this process clears the privilege bar `min`, i.e.
    /// whether it may software-trigger an event with that minimum privilege.
    ///
    /// The kernel clears every bar. A bar of `Pid::KERNEL` means *only* the
    /// kernel clears it; among user partitions, a numerically larger id is
    /// the more privileged one.
    pub fn meets_privilege_of(self, min: Pid) -> bool {
        self.is_kernel() || (!min.is_kernel() && self.0 >= min.0)
    }

    /// Index of this process in tables of `NUM_PROCESSES` entries.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Indicates the urgency of a task (or of the event that activates it).
///
/// Priority 0 is reserved for the idle context; real tasks use 1 through
/// `Priority::MAX_TASK`. Numerically *greater* priorities are more urgent.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves about whether `>` means more urgent
/// at a given call site; use `is_more_important_than`.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Default,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Priority of the idle context. No configured task may use this.
    pub const IDLE: Self = Self(0);

    /// Greatest priority a task may be configured with.
    pub const MAX_TASK: Self = Self(15);

    /// Checks if `self` is strictly more urgent than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 > other.0
    }
}

/// Priority of an interrupt service routine, in the interrupt controller's
/// own space (1 through 15).
///
/// This space is disjoint from task priorities: any ISR preempts any task,
/// so comparing an `IsrPriority` against a `Priority` is meaningless and the
/// types keep that from compiling.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct IsrPriority(u8);

impl IsrPriority {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 15;

    /// Makes an ISR priority, rejecting values outside 1..=15.
    pub const fn new(level: u8) -> Option<Self> {
        if level >= Self::MIN && level <= Self::MAX {
            Some(Self(level))
        } else {
            None
        }
    }

    pub const fn level(self) -> u8 {
        self.0
    }
}

/// Names an event, the trigger source for task activations. Event ids are
/// assigned densely by configuration, in registration order.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Default,
)]
#[repr(transparent)]
pub struct EventId(pub u16);

impl EventId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// The causes a process can be charged for, one saturating counter each.
///
/// The exception path is the only writer of these counters; the supervisor
/// reads them and decides policy. `index` gives the counter slot, and the
/// discriminants are stable because the supervisor may ship separately from
/// the kernel.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FaultCause {
    /// A task activation overran its runtime budget.
    Deadline = 0,
    /// Execution of an undefined or illegal instruction.
    IllegalInstruction = 1,
    /// Execution of a privileged instruction from user mode.
    PrivilegedInstruction = 2,
    /// A load or store outside the process's permitted regions.
    MemoryAccess = 3,
    /// A misaligned access the hardware refused to perform.
    MisalignedAccess = 4,
    /// Integer division by zero.
    DivideByZero = 5,
    /// Floating point unit unavailable or signalling.
    FloatingPoint = 6,
    /// A system call with an index no handler is assigned to answer.
    BadSystemCall = 7,
    /// A system call whose arguments failed validation.
    BadSystemCallArgument = 8,
    /// The task signalled failure itself, by returning a negative value or
    /// passing one to `task_exit`.
    UserAbort = 9,
    /// A task ran off the bottom of its call chain instead of ending its
    /// activation.
    ReturnedFromTask = 10,
    /// Everything the hardware reports that fits no other bucket.
    Other = 11,
}

impl FaultCause {
    /// Number of distinct causes, i.e. counters per process.
    pub const COUNT: usize = 12;

    /// All causes, in counter-slot order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Deadline,
        Self::IllegalInstruction,
        Self::PrivilegedInstruction,
        Self::MemoryAccess,
        Self::MisalignedAccess,
        Self::DivideByZero,
        Self::FloatingPoint,
        Self::BadSystemCall,
        Self::BadSystemCallArgument,
        Self::UserAbort,
        Self::ReturnedFromTask,
        Self::Other,
    ];

    /// Counter slot for this cause.
    pub fn index(self) -> usize {
        self as usize
    }
}

/// A record describing a fault taken by a user task, as classified by the
/// exception path. This carries more detail than the counted `FaultCause`
/// (notably faulting addresses, where the hardware provides them); `cause`
/// collapses it into the counter taxonomy.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FaultInfo {
    /// The task violated memory access rules. Either the protection
    /// hardware intercepted it directly (`source` `User`), or the kernel
    /// caught the task asking it to touch memory outside the task's regions
    /// (`source` `Kernel`).
    MemoryAccess {
        /// Problematic address, where the fault reporting registers provide
        /// one.
        address: Option<u32>,
        /// Origin of the fault.
        source: FaultSource,
    },
    /// The task's stack pointer left its stack region.
    StackOverflow { address: u32 },
    /// A misaligned access the hardware refused.
    MisalignedAccess { address: Option<u32> },
    /// Execution of an undefined instruction.
    IllegalInstruction,
    /// Execution of a privileged instruction while unprivileged.
    PrivilegedInstruction,
    /// Integer divide by zero.
    DivideByZero,
    /// FPU unavailable or FPU exception.
    FloatingPoint,
    /// The task misused the system call interface.
    SyscallUsage(UsageError),
    /// The task's current activation exceeded its runtime budget.
    DeadlineOverrun,
    /// The task signalled failure with a negative result code.
    UserAbort(i32),
    /// The task returned through the bottom of its entry frame.
    ReturnedFromTask,
    /// Hardware-reported condition that fits no other variant; the payload
    /// is the architecture's raw fault status.
    InvalidOperation(u32),
}

impl FaultInfo {
    /// Collapses this record into the per-process counter taxonomy.
    pub fn cause(&self) -> FaultCause {
        match self {
            Self::MemoryAccess { .. } | Self::StackOverflow { .. } => {
                FaultCause::MemoryAccess
            }
            Self::MisalignedAccess { .. } => FaultCause::MisalignedAccess,
            Self::IllegalInstruction => FaultCause::IllegalInstruction,
            Self::PrivilegedInstruction => FaultCause::PrivilegedInstruction,
            Self::DivideByZero => FaultCause::DivideByZero,
            Self::FloatingPoint => FaultCause::FloatingPoint,
            Self::SyscallUsage(e) => e.cause(),
            Self::DeadlineOverrun => FaultCause::Deadline,
            Self::UserAbort(_) => FaultCause::UserAbort,
            Self::ReturnedFromTask => FaultCause::ReturnedFromTask,
            Self::InvalidOperation(_) => FaultCause::Other,
        }
    }
}

impl From<UsageError> for FaultInfo {
    fn from(e: UsageError) -> Self {
        Self::SyscallUsage(e)
    }
}

/// A kernel-defined fault, arising from how a user task used the system
/// call interface.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum UsageError {
    /// A program used a system call index at or past `NUM_SYSCALLS`.
    BadSyscallNumber,
    /// A program passed a pointer/length pair that is patently invalid:
    /// misaligned for its type, or wrapping the end of the address space.
    InvalidSlice,
    /// A program passed memory it has no right to read or write.
    SliceNotAccessible,
    /// A program named an event id that was never configured.
    EventOutOfRange,
    /// A program named a process id outside the process table.
    ProcessOutOfRange,
    /// A program asked for an operation its permission bits don't allow.
    NotPermitted,
    /// A priority argument outside the representable mask range.
    PriorityOutOfRange,
}

impl UsageError {
    pub fn cause(self) -> FaultCause {
        match self {
            Self::BadSyscallNumber => FaultCause::BadSystemCall,
            _ => FaultCause::BadSystemCallArgument,
        }
    }
}

/// Origin of a memory fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FaultSource {
    /// User code did something that was intercepted by the processor.
    User,
    /// User code asked the kernel to do something bad on its behalf.
    Kernel,
}

/// Enumeration of the kernel-owned system call numbers.
///
/// Application-defined system calls occupy `FIRST_APP_SYSCALL` through
/// `NUM_SYSCALLS - 1`.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Sysnum {
    TaskExit = 0,
    TriggerEvent = 1,
    RaisePriority = 2,
    RestorePriority = 3,
    SuspendProcess = 4,
    ReadProcessStatus = 5,
}

/// First system call index available to application-defined handlers.
pub const FIRST_APP_SYSCALL: usize = 6;

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` because the kernel doesn't currently depend on
/// `num-traits` and this seems okay.
impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::TaskExit),
            1 => Ok(Self::TriggerEvent),
            2 => Ok(Self::RaisePriority),
            3 => Ok(Self::RestorePriority),
            4 => Ok(Self::SuspendProcess),
            5 => Ok(Self::ReadProcessStatus),
            _ => Err(()),
        }
    }
}

/// Snapshot of one process's diagnostic state, as serialized to a
/// supervisor through the `ReadProcessStatus` system call.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProcessStatus {
    /// Which process this snapshot describes.
    pub pid: Pid,
    /// Whether the process has been permanently suspended.
    pub halted: bool,
    /// Sum of all per-cause counters (itself saturating).
    pub total_errors: u32,
    /// Per-cause counters, indexed by `FaultCause::index`.
    pub errors: [u32; FaultCause::COUNT],
    /// Minimum observed free stack space since boot, in bytes.
    pub stack_reserve: u32,
}

/// Snapshot of one event's diagnostic state.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EventStatus {
    pub id: EventId,
    /// Whether an activation is currently pending (or running).
    pub pending: bool,
    /// Saturating count of lost activations since boot.
    pub activation_losses: u32,
}

/// Reasons `start_kernel` can reject a configuration instead of starting.
///
/// These are deliberately fine-grained: the configuration code runs exactly
/// once at boot and the discriminant is the only diagnostic the integrator
/// gets.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ConfigError {
    /// The event table is full.
    TooManyEvents,
    /// The task table is full.
    TooManyTasks,
    /// An event already has its maximum number of bound tasks.
    TooManyTasksForEvent,
    /// A task priority of 0 (idle) or above `Priority::MAX_TASK`.
    PriorityOutOfRange,
    /// A task was registered against an event id that does not exist.
    UnknownEvent,
    /// A process id outside the process table.
    UnknownProcess,
    /// A kernel task was bound to an event user processes may trigger.
    KernelTaskOnUserEvent,
    /// An event's minimum trigger privilege names a nonexistent process.
    BadMinimumPrivilege,
    /// An event was configured but no task was ever bound to it.
    EventWithoutTasks,
    /// A process owns a task or region but was never registered.
    ProcessNotRegistered,
    /// A process was registered twice.
    ProcessAlreadyRegistered,
    /// Two processes own overlapping RAM regions (other than the shared
    /// region).
    OverlappingRegions,
    /// A region's base/size does not meet the protection hardware's
    /// alignment rules, or wraps the address space.
    MalformedRegion,
    /// A process has more regions than the protection hardware can map.
    TooManyRegions,
    /// A process stack too small to hold a single activation frame, or
    /// misaligned.
    BadStackRegion,
    /// An interrupt vector was registered twice, or collides with the
    /// kernel's own vectors.
    VectorInUse,
    /// An ISR priority outside 1..=15.
    IsrPriorityOutOfRange,
    /// The interrupt table is full.
    TooManyInterrupts,
    /// An application system call entry targets a kernel-reserved index or
    /// one at/past `NUM_SYSCALLS`.
    BadSyscallIndex,
    /// A second init task was registered for the same process.
    DuplicateInitTask,
    /// A process declared a device region without holding the
    /// device-access permission.
    DeviceRegionNotPermitted,
    /// A configuration call arrived after `start_kernel`.
    AlreadyStarted,
    /// An init task vetoed startup by returning a negative value; the
    /// payload is the process it ran in.
    InitTaskFailed(Pid),
    /// No shared region was configured although user processes exist.
    NoSharedRegion,
}
