// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The configuration-time registration API.
//!
//! Everything the kernel schedules or protects is declared through this
//! module before `start_kernel`, into fixed-capacity tables; there is no
//! registration, and no heap, afterwards. Registration calls do their own
//! local checks; the cross-cutting checks (region overlap, dangling
//! references, events nothing is bound to) run in [`KernelConfig::validate`]
//! when the kernel starts, and any failure is reported out of
//! `start_kernel` as a [`ConfigError`] instead of a running system.

use core::mem::MaybeUninit;

use abi::{
    ConfigError, EventId, IsrPriority, Pid, Priority, NUM_PROCESSES,
    NUM_SYSCALLS,
};

use crate::descs::{
    Conformance, EventDesc, InterruptDesc, IsrHandler, ProcessDesc,
    RegionAttributes, RegionDesc, SysCallEntry, TaskDesc, TaskEntry,
    MAX_EVENTS, MAX_INTERRUPTS, MAX_TASKS, MAX_TASKS_PER_EVENT,
    REGIONS_PER_PROCESS,
};
use crate::event::Event;
use crate::process::Process;
use crate::task::Task;

/// The whole pre-start configuration, in one place.
pub struct KernelConfig {
    events: [Option<EventDesc>; MAX_EVENTS],
    n_events: usize,
    tasks: [Option<TaskDesc>; MAX_TASKS],
    n_tasks: usize,
    processes: [Option<ProcessDesc>; NUM_PROCESSES],
    shared: Option<RegionDesc>,
    ram_window: Option<RegionDesc>,
    interrupts: [Option<InterruptDesc>; MAX_INTERRUPTS],
    n_interrupts: usize,
    init_tasks: [Option<TaskEntry>; NUM_PROCESSES],
    syscalls: [SysCallEntry; NUM_SYSCALLS],
    started: bool,
}

impl KernelConfig {
    pub const fn new() -> Self {
        Self {
            events: [None; MAX_EVENTS],
            n_events: 0,
            tasks: [None; MAX_TASKS],
            n_tasks: 0,
            processes: [None; NUM_PROCESSES],
            shared: None,
            ram_window: None,
            interrupts: [None; MAX_INTERRUPTS],
            n_interrupts: 0,
            init_tasks: [None; NUM_PROCESSES],
            syscalls: crate::syscalls::BUILTIN_TABLE,
            started: false,
        }
    }

    fn check_not_started(&self) -> Result<(), ConfigError> {
        if self.started {
            Err(ConfigError::AlreadyStarted)
        } else {
            Ok(())
        }
    }

    /// Declares an event. Returns its dense id, assigned in registration
    /// order.
    pub fn create_event(
        &mut self,
        period_ticks: u32,
        offset_ticks: u32,
        priority: Priority,
        min_pid: Pid,
    ) -> Result<EventId, ConfigError> {
        self.check_not_started()?;
        if priority == Priority::IDLE
            || priority.is_more_important_than(Priority::MAX_TASK)
        {
            return Err(ConfigError::PriorityOutOfRange);
        }
        if min_pid.index() >= NUM_PROCESSES {
            return Err(ConfigError::BadMinimumPrivilege);
        }
        if self.n_events == MAX_EVENTS {
            return Err(ConfigError::TooManyEvents);
        }
        let id = EventId(self.n_events as u16);
        self.events[self.n_events] = Some(EventDesc {
            period_ticks,
            offset_ticks,
            priority,
            min_pid,
        });
        self.n_events += 1;
        Ok(id)
    }

    /// Binds a task to an event, in activation order.
    pub fn register_task(
        &mut self,
        event: EventId,
        pid: Pid,
        entry: TaskEntry,
        budget_us: u32,
    ) -> Result<(), ConfigError> {
        self.check_not_started()?;
        let Some(ev) = self
            .events
            .get(event.index())
            .and_then(|slot| slot.as_ref())
        else {
            return Err(ConfigError::UnknownEvent);
        };
        if pid.index() >= NUM_PROCESSES {
            return Err(ConfigError::UnknownProcess);
        }
        if pid.is_kernel() && !ev.min_pid.is_kernel() {
            // Kernel tasks may only hang off events user code cannot
            // trigger; anything else would let a user partition schedule
            // privileged code.
            return Err(ConfigError::KernelTaskOnUserEvent);
        }
        let slot = self.tasks_of(event).count();
        if slot == MAX_TASKS_PER_EVENT {
            return Err(ConfigError::TooManyTasksForEvent);
        }
        if self.n_tasks == MAX_TASKS {
            return Err(ConfigError::TooManyTasks);
        }
        self.tasks[self.n_tasks] = Some(TaskDesc {
            event,
            pid,
            entry,
            budget_us,
            slot: slot as u8,
        });
        self.n_tasks += 1;
        Ok(())
    }

    /// Declares a user process: its stack, its owned regions, and its
    /// permission bits.
    pub fn register_process(
        &mut self,
        pid: Pid,
        stack: RegionDesc,
        regions: &[RegionDesc],
        flags: crate::descs::ProcessFlags,
    ) -> Result<(), ConfigError> {
        self.check_not_started()?;
        if pid.is_kernel() || pid.index() >= NUM_PROCESSES {
            return Err(ConfigError::UnknownProcess);
        }
        if self.processes[pid.index()].is_some() {
            return Err(ConfigError::ProcessAlreadyRegistered);
        }
        if regions.len() > REGIONS_PER_PROCESS {
            return Err(ConfigError::TooManyRegions);
        }
        if !stack.is_well_formed() || stack.size < 256 {
            return Err(ConfigError::BadStackRegion);
        }
        let mut region_slots = [None; REGIONS_PER_PROCESS];
        for (slot, region) in region_slots.iter_mut().zip(regions) {
            if !region.is_well_formed() {
                return Err(ConfigError::MalformedRegion);
            }
            if region.attributes.contains(RegionAttributes::DEVICE)
                && !flags
                    .contains(crate::descs::ProcessFlags::DEVICE_ACCESS)
            {
                return Err(ConfigError::DeviceRegionNotPermitted);
            }
            *slot = Some(*region);
        }
        self.processes[pid.index()] = Some(ProcessDesc {
            pid,
            stack,
            regions: region_slots,
            flags,
        });
        Ok(())
    }

    /// Declares the one RAM region every process may write: the sanctioned
    /// cross-process channel.
    pub fn set_shared_region(
        &mut self,
        region: RegionDesc,
    ) -> Result<(), ConfigError> {
        self.check_not_started()?;
        if !region.is_well_formed() {
            return Err(ConfigError::MalformedRegion);
        }
        self.shared = Some(region);
        Ok(())
    }

    /// Declares the read-only window over all of RAM: user processes may
    /// read anything inside it (diagnostics, lookup tables in another
    /// partition), but writes stay confined to owned regions. Optional;
    /// without it, foreign memory is not even readable.
    pub fn set_ram_window(
        &mut self,
        region: RegionDesc,
    ) -> Result<(), ConfigError> {
        self.check_not_started()?;
        if !region.is_well_formed()
            || region.attributes != RegionAttributes::READ
        {
            return Err(ConfigError::MalformedRegion);
        }
        self.ram_window = Some(region);
        Ok(())
    }

    /// Hooks an interrupt vector.
    pub fn register_interrupt_handler(
        &mut self,
        vector: u32,
        priority: u8,
        preemptable: bool,
        handler: IsrHandler,
    ) -> Result<(), ConfigError> {
        self.check_not_started()?;
        let Some(priority) = IsrPriority::new(priority) else {
            return Err(ConfigError::IsrPriorityOutOfRange);
        };
        if self
            .interrupts
            .iter()
            .flatten()
            .any(|d| d.vector == vector)
        {
            return Err(ConfigError::VectorInUse);
        }
        if self.n_interrupts == MAX_INTERRUPTS {
            return Err(ConfigError::TooManyInterrupts);
        }
        self.interrupts[self.n_interrupts] = Some(InterruptDesc {
            vector,
            priority,
            preemptable,
            handler,
        });
        self.n_interrupts += 1;
        Ok(())
    }

    /// Registers the once-before-start init task of a process. A negative
    /// return from it vetoes kernel startup.
    pub fn register_init_task(
        &mut self,
        pid: Pid,
        entry: TaskEntry,
    ) -> Result<(), ConfigError> {
        self.check_not_started()?;
        if pid.index() >= NUM_PROCESSES {
            return Err(ConfigError::UnknownProcess);
        }
        if self.init_tasks[pid.index()].is_some() {
            return Err(ConfigError::DuplicateInitTask);
        }
        self.init_tasks[pid.index()] = Some(entry);
        Ok(())
    }

    /// Installs an application-defined system call. Kernel-reserved
    /// indices and out-of-table indices are rejected.
    pub fn register_syscall(
        &mut self,
        index: usize,
        handler: crate::syscalls::SysCallFn,
        class: Conformance,
    ) -> Result<(), ConfigError> {
        self.check_not_started()?;
        if !(abi::FIRST_APP_SYSCALL..NUM_SYSCALLS).contains(&index) {
            return Err(ConfigError::BadSyscallIndex);
        }
        self.syscalls[index] = SysCallEntry { handler, class };
        Ok(())
    }

    /// The frozen system call table.
    pub fn syscall_table(&self) -> &[SysCallEntry; NUM_SYSCALLS] {
        &self.syscalls
    }

    /// The registered interrupt descriptors.
    pub fn interrupts(&self) -> impl Iterator<Item = &InterruptDesc> {
        self.interrupts.iter().flatten()
    }

    /// The registered init tasks, in ascending process order.
    pub fn init_tasks(
        &self,
    ) -> impl Iterator<Item = (Pid, TaskEntry)> + '_ {
        self.init_tasks
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.map(|t| (Pid(i as u8), t)))
    }

    fn tasks_of(
        &self,
        event: EventId,
    ) -> impl Iterator<Item = &TaskDesc> {
        self.tasks
            .iter()
            .flatten()
            .filter(move |t| t.event == event)
    }

    /// The cross-cutting checks that can only run once everything has
    /// been registered.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Every event must do something.
        for e in 0..self.n_events {
            if self.tasks_of(EventId(e as u16)).next().is_none() {
                return Err(ConfigError::EventWithoutTasks);
            }
        }

        // Every task and init task must run somewhere that exists.
        for task in self.tasks.iter().flatten() {
            if !task.pid.is_kernel()
                && self.processes[task.pid.index()].is_none()
            {
                return Err(ConfigError::ProcessNotRegistered);
            }
        }
        for (pid, _) in self.init_tasks() {
            if !pid.is_kernel() && self.processes[pid.index()].is_none() {
                return Err(ConfigError::ProcessNotRegistered);
            }
        }

        // User partitions communicate through the shared region only; if
        // any exist, it must too.
        if self.processes.iter().any(Option::is_some)
            && self.shared.is_none()
        {
            return Err(ConfigError::NoSharedRegion);
        }

        // Region disjointness across processes is the heart of the
        // write-isolation guarantee. The shared region is deliberately
        // not part of this: it is the one sanctioned overlap.
        let mut all_regions =
            [(Pid::KERNEL, None::<RegionDesc>); NUM_PROCESSES
                * (REGIONS_PER_PROCESS + 1)];
        let mut n = 0;
        for desc in self.processes.iter().flatten() {
            all_regions[n] = (desc.pid, Some(desc.stack));
            n += 1;
            for region in desc.regions.iter().flatten() {
                all_regions[n] = (desc.pid, Some(*region));
                n += 1;
            }
        }
        for i in 0..n {
            for j in i + 1..n {
                let (pid_a, Some(a)) = all_regions[i] else { continue };
                let (pid_b, Some(b)) = all_regions[j] else { continue };
                if pid_a != pid_b
                    && a.base < b.end_addr()
                    && b.base < a.end_addr()
                {
                    return Err(ConfigError::OverlappingRegions);
                }
            }
        }

        Ok(())
    }

    /// Freezes the configuration into the kernel's runtime tables.
    ///
    /// Tasks are laid out event by event, in declaration order within
    /// each event; the rest of the kernel relies on that layout for its
    /// tie-breaking rules. Returns `(event_count, task_count)`.
    ///
    /// Call `validate` first; this does no checking of its own.
    pub fn build_tables(
        &mut self,
        events_out: &mut [MaybeUninit<Event>; MAX_EVENTS],
        tasks_out: &mut [MaybeUninit<Task>; MAX_TASKS],
        procs_out: &mut [MaybeUninit<Process>; NUM_PROCESSES],
    ) -> (usize, usize) {
        self.started = true;

        let mut next_task = 0usize;
        for e in 0..self.n_events {
            let id = EventId(e as u16);
            let desc = self.events[e].unwrap_or_else(|| {
                crate::fail::die("event table hole")
            });
            let first = next_task;
            for task in self.tasks_of(id) {
                tasks_out[next_task]
                    .write(Task::new(*task, desc.priority));
                next_task += 1;
            }
            events_out[e].write(Event::new(
                desc,
                first as u16,
                (next_task - first) as u16,
            ));
        }

        for (i, slot) in procs_out.iter_mut().enumerate() {
            let desc = self.processes[i]
                .unwrap_or(ProcessDesc::unused(Pid(i as u8)));
            let shared = if desc.pid.is_kernel() {
                None
            } else {
                self.shared
            };
            slot.write(Process::new(desc, shared, self.ram_window));
        }

        (self.n_events, next_task)
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel's one configuration instance.
///
/// Safety: configuration runs on the single boot context before the
/// scheduler exists, and every mutator rejects calls after start, so
/// plain single-threaded access is sound. The wrapper only exists to give
/// the static a `Sync` home.
struct ConfigCell(core::cell::UnsafeCell<KernelConfig>);

// Safety: see above; all access is funneled through `with_config`, before
// interrupts are live.
unsafe impl Sync for ConfigCell {}

static CONFIG: ConfigCell =
    ConfigCell(core::cell::UnsafeCell::new(KernelConfig::new()));

/// Runs `f` against the configuration instance.
///
/// Public only within the crate; applications use the free functions
/// below.
pub(crate) fn with_config<R>(f: impl FnOnce(&mut KernelConfig) -> R) -> R {
    // Safety: single boot context, see ConfigCell.
    f(unsafe { &mut *CONFIG.0.get() })
}

/// The frozen system call table, for the dispatcher's use after start.
///
/// Safety-wise this is fine: the `started` flag makes the table immutable
/// before anything can race on it.
pub(crate) fn frozen_syscalls() -> &'static [SysCallEntry; NUM_SYSCALLS] {
    // Safety: shared reference into the config static; no mutation is
    // possible after start (see above).
    unsafe { &(*CONFIG.0.get()).syscalls }
}

/// The frozen interrupt descriptors, for ISR dispatch after start.
pub(crate) fn frozen_interrupts(
) -> &'static [Option<InterruptDesc>; MAX_INTERRUPTS] {
    // Safety: as for `frozen_syscalls`.
    unsafe { &(*CONFIG.0.get()).interrupts }
}

/// See [`KernelConfig::create_event`].
pub fn create_event(
    period_ticks: u32,
    offset_ticks: u32,
    priority: Priority,
    min_pid: Pid,
) -> Result<EventId, ConfigError> {
    with_config(|c| c.create_event(period_ticks, offset_ticks, priority, min_pid))
}

/// See [`KernelConfig::register_task`].
pub fn register_task(
    event: EventId,
    pid: Pid,
    entry: TaskEntry,
    budget_us: u32,
) -> Result<(), ConfigError> {
    with_config(|c| c.register_task(event, pid, entry, budget_us))
}

/// See [`KernelConfig::register_process`].
pub fn register_process(
    pid: Pid,
    stack: RegionDesc,
    regions: &[RegionDesc],
    flags: crate::descs::ProcessFlags,
) -> Result<(), ConfigError> {
    with_config(|c| c.register_process(pid, stack, regions, flags))
}

/// See [`KernelConfig::set_shared_region`].
pub fn set_shared_region(region: RegionDesc) -> Result<(), ConfigError> {
    with_config(|c| c.set_shared_region(region))
}

/// See [`KernelConfig::set_ram_window`].
pub fn set_ram_window(region: RegionDesc) -> Result<(), ConfigError> {
    with_config(|c| c.set_ram_window(region))
}

/// See [`KernelConfig::register_interrupt_handler`].
pub fn register_interrupt_handler(
    vector: u32,
    priority: u8,
    preemptable: bool,
    handler: IsrHandler,
) -> Result<(), ConfigError> {
    with_config(|c| {
        c.register_interrupt_handler(vector, priority, preemptable, handler)
    })
}

/// See [`KernelConfig::register_init_task`].
pub fn register_init_task(
    pid: Pid,
    entry: TaskEntry,
) -> Result<(), ConfigError> {
    with_config(|c| c.register_init_task(pid, entry))
}

/// See [`KernelConfig::register_syscall`].
pub fn register_syscall(
    index: usize,
    handler: crate::syscalls::SysCallFn,
    class: Conformance,
) -> Result<(), ConfigError> {
    with_config(|c| c.register_syscall(index, handler, class))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descs::ProcessFlags;

    extern "C" fn entry(_arg: u32) -> i32 {
        0
    }

    fn ram(base: usize, size: usize) -> RegionDesc {
        RegionDesc {
            base,
            size,
            attributes: RegionAttributes::READ | RegionAttributes::WRITE,
        }
    }

    fn minimal() -> KernelConfig {
        let mut c = KernelConfig::new();
        c.register_process(
            Pid(1),
            ram(0x2000_0000, 0x400),
            &[ram(0x2000_1000, 0x400)],
            ProcessFlags::empty(),
        )
        .unwrap();
        c.set_shared_region(ram(0x2002_0000, 0x100)).unwrap();
        let e = c
            .create_event(1, 0, Priority(2), Pid(1))
            .unwrap();
        c.register_task(e, Pid(1), entry, 0).unwrap();
        c
    }

    #[test]
    fn minimal_config_validates() {
        assert_eq!(minimal().validate(), Ok(()));
    }

    #[test]
    fn event_ids_are_dense_and_ordered() {
        let mut c = KernelConfig::new();
        let a = c.create_event(1, 0, Priority(1), Pid(1)).unwrap();
        let b = c.create_event(0, 0, Priority(2), Pid(1)).unwrap();
        assert_eq!(a, EventId(0));
        assert_eq!(b, EventId(1));
    }

    #[test]
    fn priority_bounds_are_enforced() {
        let mut c = KernelConfig::new();
        assert_eq!(
            c.create_event(1, 0, Priority::IDLE, Pid(1)),
            Err(ConfigError::PriorityOutOfRange)
        );
        assert_eq!(
            c.create_event(1, 0, Priority(16), Pid(1)),
            Err(ConfigError::PriorityOutOfRange)
        );
    }

    #[test]
    fn task_against_unknown_event_is_rejected() {
        let mut c = KernelConfig::new();
        assert_eq!(
            c.register_task(EventId(9), Pid(1), entry, 0),
            Err(ConfigError::UnknownEvent)
        );
    }

    #[test]
    fn event_task_slots_are_bounded() {
        let mut c = minimal();
        let e = EventId(0);
        for _ in 1..MAX_TASKS_PER_EVENT {
            c.register_task(e, Pid(1), entry, 0).unwrap();
        }
        assert_eq!(
            c.register_task(e, Pid(1), entry, 0),
            Err(ConfigError::TooManyTasksForEvent)
        );
    }

    #[test]
    fn kernel_tasks_require_kernel_only_events() {
        let mut c = KernelConfig::new();
        let user_ev = c.create_event(1, 0, Priority(1), Pid(1)).unwrap();
        assert_eq!(
            c.register_task(user_ev, Pid::KERNEL, entry, 0),
            Err(ConfigError::KernelTaskOnUserEvent)
        );
        let kern_ev = c
            .create_event(1, 0, Priority(1), Pid::KERNEL)
            .unwrap();
        assert_eq!(
            c.register_task(kern_ev, Pid::KERNEL, entry, 0),
            Ok(())
        );
    }

    #[test]
    fn event_without_tasks_fails_validation() {
        let mut c = minimal();
        let _ = c.create_event(5, 0, Priority(3), Pid(1)).unwrap();
        assert_eq!(c.validate(), Err(ConfigError::EventWithoutTasks));
    }

    #[test]
    fn task_in_unregistered_process_fails_validation() {
        let mut c = minimal();
        let e = c.create_event(1, 0, Priority(2), Pid(2)).unwrap();
        c.register_task(e, Pid(2), entry, 0).unwrap();
        assert_eq!(c.validate(), Err(ConfigError::ProcessNotRegistered));
    }

    #[test]
    fn overlapping_regions_fail_validation() {
        let mut c = minimal();
        // P2's region overlaps P1's.
        c.register_process(
            Pid(2),
            ram(0x2003_0000, 0x400),
            &[ram(0x2000_1000, 0x400)],
            ProcessFlags::empty(),
        )
        .unwrap();
        assert_eq!(c.validate(), Err(ConfigError::OverlappingRegions));
    }

    #[test]
    fn missing_shared_region_fails_validation() {
        let mut c = KernelConfig::new();
        c.register_process(
            Pid(1),
            ram(0x2000_0000, 0x400),
            &[],
            ProcessFlags::empty(),
        )
        .unwrap();
        let e = c.create_event(1, 0, Priority(2), Pid(1)).unwrap();
        c.register_task(e, Pid(1), entry, 0).unwrap();
        assert_eq!(c.validate(), Err(ConfigError::NoSharedRegion));
    }

    #[test]
    fn malformed_regions_are_rejected_at_registration() {
        let mut c = KernelConfig::new();
        // Size not a power of two.
        assert_eq!(
            c.register_process(
                Pid(1),
                ram(0x2000_0000, 0x400),
                &[ram(0x2000_1000, 0x300)],
                ProcessFlags::empty(),
            ),
            Err(ConfigError::MalformedRegion)
        );
        // Misaligned base.
        assert_eq!(
            c.register_process(
                Pid(1),
                ram(0x2000_0000, 0x400),
                &[ram(0x2000_1010, 0x400)],
                ProcessFlags::empty(),
            ),
            Err(ConfigError::MalformedRegion)
        );
        // Tiny stack.
        assert_eq!(
            c.register_process(
                Pid(1),
                ram(0x2000_0000, 0x80),
                &[],
                ProcessFlags::empty(),
            ),
            Err(ConfigError::BadStackRegion)
        );
    }

    #[test]
    fn device_regions_require_permission() {
        let mut c = KernelConfig::new();
        let dev = RegionDesc {
            base: 0x4000_0000,
            size: 0x400,
            attributes: RegionAttributes::READ
                | RegionAttributes::WRITE
                | RegionAttributes::DEVICE,
        };
        assert_eq!(
            c.register_process(
                Pid(1),
                ram(0x2000_0000, 0x400),
                &[dev],
                ProcessFlags::empty(),
            ),
            Err(ConfigError::DeviceRegionNotPermitted)
        );
        assert_eq!(
            c.register_process(
                Pid(1),
                ram(0x2000_0000, 0x400),
                &[dev],
                ProcessFlags::DEVICE_ACCESS,
            ),
            Ok(())
        );
    }

    #[test]
    fn ram_window_must_be_read_only() {
        let mut c = KernelConfig::new();
        assert_eq!(
            c.set_ram_window(ram(0x2000_0000, 0x8_0000)),
            Err(ConfigError::MalformedRegion)
        );
        let window = RegionDesc {
            base: 0x2000_0000,
            size: 0x8_0000,
            attributes: RegionAttributes::READ,
        };
        assert_eq!(c.set_ram_window(window), Ok(()));
    }

    #[test]
    fn duplicate_registrations_are_rejected() {
        let mut c = minimal();
        assert_eq!(
            c.register_process(
                Pid(1),
                ram(0x2004_0000, 0x400),
                &[],
                ProcessFlags::empty(),
            ),
            Err(ConfigError::ProcessAlreadyRegistered)
        );
        c.register_init_task(Pid(1), entry).unwrap();
        assert_eq!(
            c.register_init_task(Pid(1), entry),
            Err(ConfigError::DuplicateInitTask)
        );
        c.register_interrupt_handler(40, 7, true, || ()).unwrap();
        assert_eq!(
            c.register_interrupt_handler(40, 3, false, || ()),
            Err(ConfigError::VectorInUse)
        );
    }

    #[test]
    fn isr_priorities_are_range_checked() {
        let mut c = KernelConfig::new();
        assert_eq!(
            c.register_interrupt_handler(40, 0, true, || ()),
            Err(ConfigError::IsrPriorityOutOfRange)
        );
        assert_eq!(
            c.register_interrupt_handler(40, 16, true, || ()),
            Err(ConfigError::IsrPriorityOutOfRange)
        );
        assert_eq!(c.register_interrupt_handler(40, 15, true, || ()), Ok(()));
    }

    #[test]
    fn app_syscalls_cannot_shadow_kernel_entries() {
        let mut c = KernelConfig::new();
        for bad in [0, 1, abi::FIRST_APP_SYSCALL - 1, NUM_SYSCALLS, 99] {
            assert_eq!(
                c.register_syscall(
                    bad,
                    crate::syscalls::nop_handler,
                    Conformance::Basic
                ),
                Err(ConfigError::BadSyscallIndex)
            );
        }
        assert_eq!(
            c.register_syscall(
                abi::FIRST_APP_SYSCALL,
                crate::syscalls::nop_handler,
                Conformance::Full
            ),
            Ok(())
        );
    }

    #[test]
    fn nothing_registers_after_start() {
        let mut c = minimal();
        let mut events = uninit_events();
        let mut tasks = uninit_tasks();
        let mut procs = uninit_procs();
        let _ = c.build_tables(&mut events, &mut tasks, &mut procs);
        assert_eq!(
            c.create_event(1, 0, Priority(1), Pid(1)),
            Err(ConfigError::AlreadyStarted)
        );
        assert_eq!(
            c.register_task(EventId(0), Pid(1), entry, 0),
            Err(ConfigError::AlreadyStarted)
        );
        assert_eq!(
            c.register_interrupt_handler(41, 2, true, || ()),
            Err(ConfigError::AlreadyStarted)
        );
    }

    #[test]
    fn build_tables_groups_tasks_by_event() {
        let mut c = KernelConfig::new();
        c.register_process(
            Pid(1),
            ram(0x2000_0000, 0x400),
            &[],
            ProcessFlags::empty(),
        )
        .unwrap();
        c.set_shared_region(ram(0x2002_0000, 0x100)).unwrap();
        let a = c.create_event(1, 0, Priority(1), Pid(1)).unwrap();
        let b = c.create_event(2, 0, Priority(2), Pid(1)).unwrap();
        // Interleave registration across events; the freeze must
        // un-interleave it.
        c.register_task(a, Pid(1), entry, 0).unwrap();
        c.register_task(b, Pid(1), entry, 0).unwrap();
        c.register_task(a, Pid(1), entry, 0).unwrap();

        let mut events = uninit_events();
        let mut tasks = uninit_tasks();
        let mut procs = uninit_procs();
        let (ne, nt) = c.build_tables(&mut events, &mut tasks, &mut procs);
        assert_eq!((ne, nt), (2, 3));

        // Safety: build_tables initialized the first `ne`/`nt` entries.
        let events = unsafe {
            core::slice::from_raw_parts(
                events.as_ptr() as *const Event,
                ne,
            )
        };
        let tasks = unsafe {
            core::slice::from_raw_parts(tasks.as_ptr() as *const Task, nt)
        };
        assert_eq!(events[0].tasks(), 0..2);
        assert_eq!(events[1].tasks(), 2..3);
        assert_eq!(tasks[0].event(), a);
        assert_eq!(tasks[0].descriptor().slot, 0);
        assert_eq!(tasks[1].event(), a);
        assert_eq!(tasks[1].descriptor().slot, 1);
        assert_eq!(tasks[2].event(), b);
        assert_eq!(tasks[2].priority(), Priority(2));
    }

    fn uninit_events() -> [MaybeUninit<Event>; MAX_EVENTS] {
        // Safety: an array of MaybeUninit is allowed to be uninitialized.
        unsafe { MaybeUninit::uninit().assume_init() }
    }

    fn uninit_tasks() -> [MaybeUninit<Task>; MAX_TASKS] {
        // Safety: as above.
        unsafe { MaybeUninit::uninit().assume_init() }
    }

    fn uninit_procs() -> [MaybeUninit<Process>; NUM_PROCESSES] {
        // Safety: as above.
        unsafe { MaybeUninit::uninit().assume_init() }
    }
}
