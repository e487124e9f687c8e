// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M.
//!
//! # Context model
//!
//! Every schedulable context -- task activations and the idle context --
//! runs in thread mode on the process stack (PSP). The kernel runs in
//! handler mode on the main stack. A context's callee-saved registers,
//! PSP, and EXC_RETURN live in its `SavedState`; the global
//! `CURRENT_SAVE_PTR` names the save area of whichever context owns the
//! CPU, and the entry/exit assembly below spills into and reloads from
//! whatever that pointer designates. Retargeting the pointer between the
//! spill and the reload *is* the context switch.
//!
//! Tasks of one process share that process's stack: a fresh activation's
//! frame is built just below the deepest in-flight activation of the same
//! process (or at the stack top if there is none). The idle context
//! counts as process 0 for this purpose and keeps using the boot stack.
//!
//! # Interrupt priority map
//!
//! Fault handlers run at hardware priority 0 (never masked). Everything
//! that enters the kernel proper -- SVCall, PendSV, SysTick -- runs at
//! the bottom of the priority range, so the kernel is never preempted by
//! itself. Registered external interrupts sit in between: logical level
//! L in 1..=15 maps to hardware priority `(16 - L) << 4`, so BASEPRI can
//! mask "everything at or below L" without ever masking the faults.
//!
//! # Tick and timebase
//!
//! The SysTick interrupt advances the tick clock (`TICKS`). The
//! microsecond timebase is derived from the tick count plus the SysTick
//! down-counter, which costs no extra hardware and no extra interrupts;
//! the one-tick race at the rollover boundary is tolerable for deadline
//! accounting and explicitly tolerated by the load probe.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use abi::{FaultInfo, FaultSource, Pid};

use crate::event::Event;
use crate::process::Process;
use crate::sched::{self, RunStack, Tables};
use crate::task::Task;
use crate::time::Timestamp;
use zerocopy::FromBytes;

/// Log things from kernel context. Selected by feature: ITM, semihosting,
/// or stubbed out entirely.
#[cfg(not(any(feature = "klog-semihosting", feature = "klog-itm")))]
macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}

#[cfg(feature = "klog-itm")]
macro_rules! klog {
    ($s:expr) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::PTR.cast_mut()).stim[0];
            cortex_m::iprintln!(stim, $s);
        }
    };
    ($s:expr, $($tt:tt)*) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::PTR.cast_mut()).stim[0];
            cortex_m::iprintln!(stim, $s, $($tt)*);
        }
    };
}

#[cfg(feature = "klog-semihosting")]
macro_rules! klog {
    ($s:expr) => {
        let _ = cortex_m_semihosting::hprintln!($s);
    };
    ($s:expr, $($tt:tt)*) => {
        let _ = cortex_m_semihosting::hprintln!($s, $($tt)*);
    };
}

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

macro_rules! uassert_eq {
    ($cond1:expr, $cond2:expr) => {
        if !($cond1 == $cond2) {
            panic!("Assertion failed!");
        }
    };
}

/// Logical priority of the kernel tick's ISR. The SIMPLE conformance
/// class masks up to here.
pub const TICK_ISR_PRIORITY: u8 = 1;

/// ARMv7-M volatile registers that must be saved across context
/// switches, plus the stack pointer and exception-return word.
///
/// The system call trap passes its operands in callee-saved registers so
/// they arrive here rather than in the hardware-stacked frame: index in
/// r11, arguments in r4-r6, return value back in r4.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SavedState {
    // NOTE: the following fields must be kept contiguous and in order;
    // the entry/exit assembly stores them with a single stm.
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    pub psp: u32,
    pub exc_return: u32,
    // NOTE: the above fields must be kept contiguous and in order!
}

impl SavedState {
    fn syscall_number(&self) -> u32 {
        self.r11
    }

    fn syscall_args(&self) -> [usize; 3] {
        [self.r4 as usize, self.r5 as usize, self.r6 as usize]
    }

    fn set_syscall_return(&mut self, v: u32) {
        self.r4 = v;
    }
}

/// Stuff placed on the stack at exception entry whether or not an FPU is
/// present.
#[derive(Debug, FromBytes, Default)]
#[repr(C)]
struct BaseExceptionFrame {
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

/// Extended version for FPU.
#[derive(Debug, FromBytes, Default)]
#[repr(C)]
struct ExtendedExceptionFrame {
    base: BaseExceptionFrame,
    fpu_regs: [u32; 16],
    fpscr: u32,
    reserved: u32,
}

/// Initially we just set the Thumb Mode bit, the minimum required.
const INITIAL_PSR: u32 = 1 << 24;

/// We don't really care about the initial FPU mode; 0 is reasonable.
const INITIAL_FPSCR: u32 = 0;

/// EXC_RETURN value selecting thread mode, process stack, FPU frame.
const EXC_RETURN_THREAD_PSP_FP: u32 = 0xFFFF_FFED;

/// Link register value planted at the bottom of every entry frame. A
/// task that runs off the end of its call chain instead of ending its
/// activation branches here, faults, and gets counted for it.
const RETURN_TRAP: u32 = 0xFFFF_FFFF;

// Kernel table positions, recorded once at startup.
static mut EVENT_TABLE: Option<(NonNull<Event>, usize)> = None;
static mut TASK_TABLE: Option<(NonNull<Task>, usize)> = None;
static mut PROCESS_TABLE: Option<(NonNull<Process>, usize)> = None;
static mut RUN_STACK_PTR: Option<NonNull<RunStack>> = None;

/// The task that owns the CPU, or `None` for the idle context.
static mut CURRENT_TASK_PTR: Option<NonNull<Task>> = None;

/// Save area of the idle context (the reborn boot context).
static mut IDLE_CONTEXT: SavedState = SavedState {
    r4: 0,
    r5: 0,
    r6: 0,
    r7: 0,
    r8: 0,
    r9: 0,
    r10: 0,
    r11: 0,
    psp: 0,
    exc_return: EXC_RETURN_THREAD_PSP_FP,
};

/// Save area of the context that owns the CPU; the entry/exit assembly
/// spills and reloads through this. Points at a `Task`'s save field, or
/// at `IDLE_CONTEXT`. Null only until `become_idle_context` runs, which
/// is before any interrupt is armed.
#[no_mangle]
static mut CURRENT_SAVE_PTR: *mut SavedState = core::ptr::null_mut();

/// Records the kernel tables at startup.
///
/// # Safety
///
/// Call exactly once, before interrupts are live. This stashes the
/// referents without revoking your access, so the caller must not touch
/// them again except through `with_tables`.
pub unsafe fn set_tables(
    events: &mut [Event],
    tasks: &mut [Task],
    processes: &mut [Process],
    run: &mut RunStack,
) {
    // Safety: single boot context, per our contract.
    unsafe {
        let prev = EVENT_TABLE
            .replace((NonNull::from(&mut events[0]), events.len()));
        uassert_eq!(prev, None);
        let prev =
            TASK_TABLE.replace((NonNull::from(&mut tasks[0]), tasks.len()));
        uassert_eq!(prev, None);
        let prev = PROCESS_TABLE
            .replace((NonNull::from(&mut processes[0]), processes.len()));
        uassert_eq!(prev, None);
        let prev = RUN_STACK_PTR.replace(NonNull::from(run));
        uassert_eq!(prev, None);
    }
}

/// Manufactures exclusive references to the kernel tables and hands them
/// to `body`. This bypasses borrow checking and should only be used at
/// kernel entry points, exactly once, then passed around.
///
/// Because the lifetime of the references passed into `body` is
/// anonymous, they can't easily be stored, which is deliberate.
pub fn with_tables<R>(body: impl FnOnce(Tables<'_>) -> R) -> R {
    // Safety: as long as the entry points respect the once-per-entry
    // rule, these references never alias.
    unsafe {
        let (events, n_events) = EVENT_TABLE.expect("kernel not started");
        let (tasks, n_tasks) = TASK_TABLE.expect("kernel not started");
        let (processes, n_processes) =
            PROCESS_TABLE.expect("kernel not started");
        let run = RUN_STACK_PTR.expect("kernel not started");
        body(Tables {
            events: core::slice::from_raw_parts_mut(
                events.as_ptr(),
                n_events,
            ),
            tasks: core::slice::from_raw_parts_mut(tasks.as_ptr(), n_tasks),
            processes: core::slice::from_raw_parts_mut(
                processes.as_ptr(),
                n_processes,
            ),
            run: &mut *run.as_ptr(),
        })
    }
}

/// Retargets the current-context pointer at `task` (or at the idle
/// context for `None`). The switch takes effect when the innermost
/// kernel entry returns and reloads registers.
///
/// # Safety
///
/// `index` must be in range for the task table, and the caller must be
/// on a kernel entry path that will return through the exit assembly.
unsafe fn set_current(index: Option<usize>) {
    // Safety: pointer arithmetic within the live task table; the save
    // field is the first field of Task (repr(C)).
    unsafe {
        match index {
            Some(i) => {
                let (tasks, n) = TASK_TABLE.expect("kernel not started");
                uassert!(i < n);
                let task = tasks.as_ptr().add(i);
                CURRENT_TASK_PTR = Some(NonNull::new_unchecked(task));
                CURRENT_SAVE_PTR = task as *mut SavedState;
                let pid = (*task).pid();
                set_thread_privilege(pid);
            }
            None => {
                CURRENT_TASK_PTR = None;
                CURRENT_SAVE_PTR = core::ptr::addr_of_mut!(IDLE_CONTEXT);
                set_thread_privilege(Pid::KERNEL);
            }
        }
    }
}

/// Sets thread-mode privilege for the next context: kernel contexts run
/// privileged, user partitions do not. (SPSEL is carried by EXC_RETURN,
/// not by this write.)
fn set_thread_privilege(pid: Pid) {
    let mut control = cortex_m::register::control::read();
    control.set_npriv(if pid.is_kernel() {
        cortex_m::register::control::Npriv::Privileged
    } else {
        cortex_m::register::control::Npriv::Unprivileged
    });
    // Safety: changing thread-mode privilege from handler mode only
    // takes effect on exception return, which is exactly the semantics
    // the context switch wants.
    unsafe {
        cortex_m::register::control::write(control);
    }
    cortex_m::asm::isb();
}

/// Builds a fresh entry frame for `tasks[index]` on its process's stack
/// and points the task's saved state at it.
///
/// The frame goes just below the deepest in-flight activation of the
/// same process, because tasks of one process share its stack. The idle
/// context counts as process 0.
fn prepare_activation(tables: &mut Tables<'_>, index: usize) {
    let task = &tables.tasks[index];
    let pid = task.pid();

    let mut floor = if pid.is_kernel() {
        // Safety: IDLE_CONTEXT is only written by the entry assembly and
        // this code, both of which run in the non-preemptible kernel.
        unsafe { (*core::ptr::addr_of!(IDLE_CONTEXT)).psp }
    } else {
        tables.processes[pid.index()].stack().end_addr() as u32
    };
    for i in tables.run.in_flight() {
        if i != index && tables.tasks[i].pid() == pid {
            let psp = tables.tasks[i].save().psp;
            if psp < floor {
                floor = psp;
            }
        }
    }

    // 8-byte alignment per AAPCS, then room for the frame.
    let floor = floor & !0x7;
    let frame_addr = (floor as usize)
        - core::mem::size_of::<ExtendedExceptionFrame>();

    // Safety: validation sized the stack for at least one frame, and the
    // space below `floor` is dead by construction of the run stack.
    let frame = unsafe { &mut *(frame_addr as *mut ExtendedExceptionFrame) };
    *frame = ExtendedExceptionFrame::default();
    frame.base.pc = task.descriptor().entry as usize as u32 | 1; // thumb
    frame.base.r0 = u32::from(task.event().0);
    frame.base.xpsr = INITIAL_PSR;
    frame.base.lr = RETURN_TRAP;
    frame.fpscr = INITIAL_FPSCR;

    let save = tables.tasks[index].save_mut();
    *save = SavedState::default();
    save.psp = frame_addr as u32;
    save.exc_return = EXC_RETURN_THREAD_PSP_FP;
}

/// Acts on a scheduler decision: makes the chosen context current,
/// building its frame first if it is a fresh activation.
fn act_on(tables: &mut Tables<'_>, after: sched::AfterExit) {
    let next = match after {
        sched::AfterExit::Start(i) => {
            prepare_activation(tables, i);
            Some(i)
        }
        sched::AfterExit::Resume(i) => Some(i),
        sched::AfterExit::Idle => None,
    };
    match next {
        Some(i) => apply_memory_protection(&tables.processes
            [tables.tasks[i].pid().index()]),
        None => apply_memory_protection(&tables.processes[0]),
    }
    // Safety: indices come from the scheduler, which only hands out
    // table-valid ones, and we are on a kernel entry path.
    unsafe {
        set_current(next);
    }
}

// --- Interrupt masking ---

/// Masks all external interrupts via PRIMASK. Returns `true` if they
/// were enabled before.
pub fn disable_interrupts() -> bool {
    let was_enabled = cortex_m::register::primask::read().is_active();
    cortex_m::interrupt::disable();
    was_enabled
}

/// Unmasks external interrupts.
pub fn enable_interrupts() {
    // Safety: only ever called to undo `disable_interrupts`, never
    // inside someone else's critical section (the non-nesting rule is
    // enforced one layer up, in `ceiling`).
    unsafe {
        cortex_m::interrupt::enable();
    }
}

pub fn interrupts_disabled() -> bool {
    !cortex_m::register::primask::read().is_active()
}

/// Encodes a logical ISR priority (1..=15, 0 = no masking) as a BASEPRI
/// value. Higher logical level = more urgent = numerically lower
/// hardware priority.
fn basepri_for_level(level: u8) -> u8 {
    if level == 0 {
        0
    } else {
        (16 - level) << 4
    }
}

fn level_for_basepri(raw: u8) -> u8 {
    if raw == 0 {
        0
    } else {
        16 - (raw >> 4)
    }
}

fn write_basepri(raw: u8) {
    // The safety classification of this register write has flip-flopped
    // across cortex-m releases; it cannot violate memory safety either
    // way (the worst case is masking too much).
    #[allow(unused_unsafe)]
    unsafe {
        cortex_m::register::basepri::write(raw)
    }
}

/// Raises the ISR priority mask to `level` if it is currently lower.
/// Returns the previous logical level for `restore_isr_mask`.
pub fn set_isr_mask(level: u8) -> u8 {
    let prev = level_for_basepri(cortex_m::register::basepri::read());
    if level > prev {
        write_basepri(basepri_for_level(level));
    }
    prev
}

/// Restores a mask level previously returned by `set_isr_mask`.
pub fn restore_isr_mask(saved: u8) {
    write_basepri(basepri_for_level(saved));
}

/// The current logical ISR mask level.
pub fn isr_mask() -> u8 {
    level_for_basepri(cortex_m::register::basepri::read())
}

/// Requests a context switch when the current ISR (and any chained ones)
/// finish: sets PendSV pending.
pub fn pend_context_switch() {
    cortex_m::peripheral::SCB::set_pendsv();
}

// --- Clocks ---

/// Kernel tick count. Split into two 32-bit halves because ARMv7-M has
/// no 64-bit atomics; `TICKS[0]` is the least significant part. Written
/// only by the SysTick handler, which all other kernel entries cannot
/// preempt.
static TICKS: [AtomicU32; 2] = [AtomicU32::new(0), AtomicU32::new(0)];

/// SysTick reload value, i.e. CPU cycles per tick, kept for the
/// timebase derivation.
static TICK_RELOAD: AtomicU32 = AtomicU32::new(1);

fn advance_ticks() {
    let t0 = TICKS[0].load(Ordering::Relaxed);
    if let Some(t0p) = t0.checked_add(1) {
        TICKS[0].store(t0p, Ordering::Relaxed);
    } else {
        let t1 = TICKS[1].load(Ordering::Relaxed);
        TICKS[0].store(0, Ordering::Relaxed);
        TICKS[1].store(t1 + 1, Ordering::Relaxed);
    }
}

/// Reads the tick clock.
pub fn now() -> Timestamp {
    loop {
        let hi = TICKS[1].load(Ordering::Relaxed);
        let lo = TICKS[0].load(Ordering::Relaxed);
        // Re-read to catch a carry racing past us. Cheap, and almost
        // never loops in practice.
        if TICKS[1].load(Ordering::Relaxed) == hi {
            return (u64::from(hi) << 32 | u64::from(lo)).into();
        }
    }
}

/// Reads the free-running microsecond timebase, derived from the tick
/// clock plus the SysTick down-counter. Monotone except for a bounded
/// wobble at tick rollover, which every consumer (deadline accounting,
/// the load probe) tolerates.
pub fn timebase_now() -> u64 {
    let ticks = u64::from(now());
    let reload = TICK_RELOAD.load(Ordering::Relaxed);
    let current = cortex_m::peripheral::SYST::get_current();
    let cycles_into_tick = reload.saturating_sub(current);
    // reload cycles == one tick == 1000 us.
    ticks * 1_000
        + u64::from(cycles_into_tick) * 1_000 / u64::from(reload.max(1))
}

// --- Memory protection ---

pub fn apply_memory_protection(process: &Process) {
    // We are manufacturing authority to interact with the MPU here,
    // because we can't thread a cortex-specific peripheral through an
    // architecture-independent API.
    let mpu = unsafe {
        // Safety: at least by not taking a &mut we're confident we're
        // not violating aliasing....
        &*cortex_m::peripheral::MPU::PTR
    };

    // Slot 0 is the board's read-only RAM window, if any; the specific
    // regions follow in the higher-numbered (higher-precedence) slots,
    // so an owned read-write region overrides the window where they
    // overlap.
    let table = process.access_table();
    for slot in 0..crate::process::MAX_ACCESS_REGIONS + 1 {
        let entry = if slot == 0 {
            process.ram_window()
        } else {
            table.get(slot - 1)
        };
        let rbar;
        let rasr;
        if let Some(region) = entry {
            use crate::descs::RegionAttributes;

            rbar = (slot as u32)  // region number
                | (1 << 4)        // honor the region number
                | region.base as u32;
            let ratts = region.attributes;
            let xn = !ratts.contains(RegionAttributes::EXECUTE);
            // These AP encodings are chosen such that we never deny
            // *privileged* code (i.e. us) access to the memory.
            let ap = if ratts.contains(RegionAttributes::WRITE) {
                0b011
            } else if ratts.contains(RegionAttributes::READ) {
                0b010
            } else {
                0b001
            };
            let (tex, scb) = if ratts.contains(RegionAttributes::DEVICE) {
                (0b000, 0b111)
            } else {
                (0b001, 0b111)
            };
            // Validation established power-of-two sizing, so this is
            // exact.
            let l2size = 31 - (region.size as u32).leading_zeros();
            rasr = (xn as u32) << 28
                | ap << 24
                | tex << 19
                | scb << 16
                | (l2size - 1) << 1
                | (1 << 0); // enable
        } else {
            // Unused slot: leave the region number programmed and the
            // enable bit clear.
            rbar = (slot as u32) | (1 << 4);
            rasr = 0;
        }
        // Safety: MPU region programming; affects only unprivileged
        // access thanks to PRIVDEFENA, so the kernel cannot lock itself
        // out.
        unsafe {
            mpu.rbar.write(rbar);
            mpu.rasr.write(rasr);
        }
    }
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

/// Runs `entry(arg)` under the target process's memory view, then
/// restores the current context's view.
///
/// Note that on this architecture the callee keeps kernel privilege (the
/// MPU does not constrain privileged code while PRIVDEFENA is set), so
/// this is a structured convention for OS-initiated callbacks rather
/// than a hard isolation boundary; faults in the callee are still
/// attributed to the target process by the caller.
pub fn call_in_process(
    process: &Process,
    entry: crate::descs::TaskEntry,
    arg: u32,
) -> i32 {
    apply_memory_protection(process);
    let rv = entry(arg);

    // Put the current context's protection back.
    //
    // Safety: reading table/current pointers from kernel context, where
    // they are stable.
    unsafe {
        let (processes, _) = PROCESS_TABLE.expect("kernel not started");
        let pid = match CURRENT_TASK_PTR {
            Some(task) => task.as_ref().pid(),
            None => Pid::KERNEL,
        };
        apply_memory_protection(&*processes.as_ptr().add(pid.index()));
    }
    rv
}

/// Measures the stack reserve of `process` from its painted stack.
pub fn stack_reserve(process: &Process) -> u32 {
    if process.stack().size == 0 {
        return 0;
    }
    // Safety: the stack region was validated and painted at startup.
    unsafe { crate::process::measure_stack_reserve(process) }
}

// --- Hardware bring-up ---

/// Programs the NVIC for one registered external interrupt.
pub fn enable_external_interrupt(desc: &crate::descs::InterruptDesc) {
    let nvic = unsafe {
        // Safety: shared reference to the NVIC register block.
        &*cortex_m::peripheral::NVIC::PTR
    };
    let n = desc.vector as usize;
    let hw_prio = basepri_for_level(desc.priority.level());
    unsafe {
        // Safety: priority then enable; the handler is registered in the
        // frozen config table before this runs.
        nvic.ipr[n].write(hw_prio);
        nvic.iser[n / 32].write(1 << (n % 32));
    }
}

/// Switches the boot context onto the process stack, making it the idle
/// context. Must run before the first kernel entry.
pub fn become_idle_context() {
    // Move SP to PSP and select it for thread mode; handler mode keeps
    // using MSP, which from here on is exclusively the kernel's.
    unsafe {
        // Safety: straight out of the ARMv7-M thread/process stack
        // switch recipe; we are in privileged thread mode with
        // interrupts not yet live.
        let sp: u32;
        core::arch::asm!("mov {0}, sp", out(reg) sp);
        cortex_m::register::psp::write(sp);
        let mut control = cortex_m::register::control::read();
        control.set_spsel(cortex_m::register::control::Spsel::Psp);
        cortex_m::register::control::write(control);
        cortex_m::asm::isb();
        // Record where idle's stack lives, for kernel-task frame
        // placement, and make idle the current context.
        (*core::ptr::addr_of_mut!(IDLE_CONTEXT)).psp = sp;
        CURRENT_SAVE_PTR = core::ptr::addr_of_mut!(IDLE_CONTEXT);
    }
}

/// Sets exception priorities, enables the configurable faults, arms the
/// SysTick timer at `tick_divisor` cycles per tick, and turns the MPU
/// on.
pub fn start_tick_timer(tick_divisor: u32) {
    unsafe {
        // Safety: purely lowering priorities from their reset defaults
        // and enabling fault reporting; nothing here can cause surprise
        // preemption, but the register writes are `unsafe` in the
        // cortex_m API.
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // MemManage, BusFault, UsageFault on.
        scb.shcsr.modify(|x| x | 0b111 << 16);
        // Their priorities to 0 (highest configurable)...
        scb.shpr[0].write(0x00);
        scb.shpr[1].write(0x00);
        scb.shpr[2].write(0x00);
        // ...and SVCall, PendSV, SysTick to the bottom of the range.
        scb.shpr[7].write(0xF0);
        scb.shpr[10].write(0xF0);
        scb.shpr[11].write(0xF0);
    }

    unsafe {
        // Safety: SysTick programming, safe in practice but unsafe in
        // API.
        let syst = &*cortex_m::peripheral::SYST::PTR;
        TICK_RELOAD.store(tick_divisor, Ordering::Relaxed);
        syst.rvr.write(tick_divisor - 1);
        syst.cvr.write(0);
        // Processor clock, interrupt, enable.
        syst.csr.modify(|v| v | 0b111);
    }

    const ENABLE: u32 = 0b001;
    const PRIVDEFENA: u32 = 0b100;
    let mpu = unsafe {
        // Safety: shared reference, as in apply_memory_protection.
        &*cortex_m::peripheral::MPU::PTR
    };
    unsafe {
        // Safety: the worst this can do is fault us, which is safe.
        mpu.ctrl.write(ENABLE | PRIVDEFENA);
    }
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

/// Idles the CPU until the next interrupt.
pub fn wait_for_interrupt() {
    cortex_m::asm::wfi();
}

// --- Kernel entry veneers ---
//
// Every path into the kernel that can switch contexts spills the current
// context through CURRENT_SAVE_PTR, runs a Rust handler that may
// retarget that pointer, and reloads through it on the way out.

core::arch::global_asm!(
    "
    .syntax unified
    .section .text.SVCall,\"ax\"
    .globl SVCall
    .type SVCall,%function
    .thumb_func
    SVCall:
        @ spill the current context.
        movw r0, #:lower16:CURRENT_SAVE_PTR
        movt r0, #:upper16:CURRENT_SAVE_PTR
        ldr r1, [r0]
        mrs r12, PSP
        stm r1, {{r4-r12, lr}}

        bl syscall_entry

        @ we're returning into *some* context, maybe not the same one.
        movw r0, #:lower16:CURRENT_SAVE_PTR
        movt r0, #:upper16:CURRENT_SAVE_PTR
        ldr r0, [r0]
        ldm r0, {{r4-r12, lr}}
        msr PSP, r12
        bx lr

    .section .text.PendSV,\"ax\"
    .globl PendSV
    .type PendSV,%function
    .thumb_func
    PendSV:
        movw r0, #:lower16:CURRENT_SAVE_PTR
        movt r0, #:upper16:CURRENT_SAVE_PTR
        ldr r1, [r0]
        mrs r12, PSP
        stm r1, {{r4-r12, lr}}

        bl pendsv_entry

        movw r0, #:lower16:CURRENT_SAVE_PTR
        movt r0, #:upper16:CURRENT_SAVE_PTR
        ldr r0, [r0]
        ldm r0, {{r4-r12, lr}}
        msr PSP, r12
        bx lr
    "
);

macro_rules! fault_veneer {
    ($name:literal, $class:literal) => {
        core::arch::global_asm!(concat!(
            "
    .syntax unified
    .section .text.",
            $name,
            ",\"ax\"
    .globl ",
            $name,
            "
    .type ",
            $name,
            ",%function
    .thumb_func
    ",
            $name,
            ":
        movw r0, #:lower16:CURRENT_SAVE_PTR
        movt r0, #:upper16:CURRENT_SAVE_PTR
        ldr r1, [r0]
        mrs r12, PSP
        stm r1, {{r4-r12, lr}}

        mov r0, lr
        movs r1, #",
            $class,
            "
        bl handle_fault

        movw r0, #:lower16:CURRENT_SAVE_PTR
        movt r0, #:upper16:CURRENT_SAVE_PTR
        ldr r0, [r0]
        ldm r0, {{r4-r12, lr}}
        msr PSP, r12
        bx lr
    "
        ));
    };
}

fault_veneer!("MemoryManagement", "0");
fault_veneer!("BusFault", "1");
fault_veneer!("UsageFault", "2");
fault_veneer!("HardFault", "3");

/// Rust side of the system call trap.
///
/// # Safety
///
/// Called only from the SVCall veneer, which has spilled the caller's
/// context.
#[no_mangle]
unsafe extern "C" fn syscall_entry() {
    // Safety: kernel entry; the veneer guarantees a current task (SVC
    // from the idle context does not occur -- the kernel never issues
    // one).
    let current = unsafe { CURRENT_TASK_PTR };
    let Some(task) = current else {
        crate::fail::die("SVC from kernel context");
    };

    let now_us = timebase_now();
    with_tables(|mut tables| {
        let idx = task_index(&tables, task);
        let (nr, args) = {
            let save = tables.tasks[idx].save();
            (save.syscall_number(), save.syscall_args())
        };

        let ctx = crate::syscalls::SysCallContext::new(
            &mut *tables.events,
            &mut *tables.tasks,
            &mut *tables.processes,
            &mut *tables.run,
            idx,
        );
        let outcome = crate::syscalls::dispatch(
            ctx,
            nr,
            args,
            crate::config::frozen_syscalls(),
            now_us,
        );

        match outcome {
            crate::syscalls::SysCallOutcome::Resume {
                retval,
                preempted_by,
            } => {
                tables.tasks[idx].save_mut().set_syscall_return(retval);
                if let Some(next) = preempted_by {
                    prepare_activation(&mut tables, next);
                    apply_memory_protection(
                        &tables.processes
                            [tables.tasks[next].pid().index()],
                    );
                    // Safety: scheduler-provided index, kernel entry
                    // path.
                    unsafe {
                        set_current(Some(next));
                    }
                }
            }
            crate::syscalls::SysCallOutcome::Switched(after) => {
                act_on(&mut tables, after);
            }
        }
    });
}

/// Rust side of the deferred context switch.
#[no_mangle]
unsafe extern "C" fn pendsv_entry() {
    let now_us = timebase_now();
    with_tables(|mut tables| {
        if let Some(next) = sched::maybe_preempt(
            tables.tasks,
            tables.processes,
            tables.run,
            crate::ceiling::current(),
            now_us,
        ) {
            prepare_activation(&mut tables, next);
            apply_memory_protection(
                &tables.processes[tables.tasks[next].pid().index()],
            );
            // Safety: scheduler-provided index, kernel entry path.
            unsafe {
                set_current(Some(next));
            }
        }
    });
}

/// Handler that gets linked into the vector table for the System Tick
/// Timer. Advances the tick clock and the event table; any resulting
/// dispatch is deferred to PendSV, because this entry sequence doesn't
/// save context.
#[allow(non_snake_case)]
#[no_mangle]
extern "C" fn SysTick() {
    advance_ticks();
    let hint = with_tables(|tables| {
        sched::handle_tick(tables.events, tables.tasks, tables.processes)
    });
    if hint != crate::task::NextTask::Same {
        pend_context_switch();
    }
}

/// Handler for all unassigned vectors: dispatches registered external
/// interrupts, and dies on anything unexpected.
#[allow(non_snake_case)]
#[no_mangle]
extern "C" fn DefaultHandler() {
    use cortex_m::peripheral::scb::VectActive;

    match cortex_m::peripheral::SCB::vect_active() {
        VectActive::Interrupt { irqn } => {
            let irqn = u32::from(irqn);
            let entry = crate::config::frozen_interrupts()
                .iter()
                .flatten()
                .find(|d| d.vector == irqn);
            match entry {
                Some(desc) if !desc.preemptable => {
                    // Hold off the entire ISR space for the duration.
                    let saved = set_isr_mask(abi::IsrPriority::MAX);
                    (desc.handler)();
                    restore_isr_mask(saved);
                }
                Some(desc) => (desc.handler)(),
                None => crate::fail::die("unhandled IRQ"),
            }
        }
        other => {
            let _ = other;
            crate::fail::die("unexpected exception");
        }
    }
}

/// Fault classes passed by the fault veneers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
enum FaultType {
    MemoryManagement = 0,
    BusFault = 1,
    UsageFault = 2,
    HardFault = 3,
}

bitflags::bitflags! {
    /// Bits in the Configurable Fault Status Register.
    #[repr(transparent)]
    struct Cfsr: u32 {
        // Bits 0-7: MMFSR (Memory Management Fault Status Register)
        const IACCVIOL = 1 << 0;
        const DACCVIOL = 1 << 1;
        const MUNSTKERR = 1 << 3;
        const MSTKERR = 1 << 4;
        const MLSPERR = 1 << 5;
        const MMARVALID = 1 << 7;

        // Bits 8-15: BFSR (Bus Fault Status Register)
        const IBUSERR = 1 << (8 + 0);
        const PRECISERR = 1 << (8 + 1);
        const IMPRECISERR = 1 << (8 + 2);
        const UNSTKERR = 1 << (8 + 3);
        const STKERR = 1 << (8 + 4);
        const LSPERR = 1 << (8 + 5);
        const BFARVALID = 1 << (8 + 7);

        // Bits 16-31: UFSR (Usage Fault Status Register)
        const UNDEFINSTR = 1 << (16 + 0);
        const INVSTATE = 1 << (16 + 1);
        const INVPC = 1 << (16 + 2);
        const NOCP = 1 << (16 + 3);
        const UNALIGNED = 1 << (16 + 8);
        const DIVBYZERO = 1 << (16 + 9);
    }
}

/// The System Control Space: supervisor registers. A user-mode access
/// here is classified as a privileged-instruction violation rather than
/// a plain memory fault, because that is what the access *means*.
const SCS_BASE: u32 = 0xE000_0000;
const SCS_END: u32 = 0xE010_0000;

/// Rust side of the fault veneers.
///
/// # Safety
///
/// Called only from the fault veneers, which have spilled the faulting
/// context.
#[no_mangle]
unsafe extern "C" fn handle_fault(exc_return: u32, class: u32) {
    // Safety: shared reference to the SCB register block.
    let scb = unsafe { &*cortex_m::peripheral::SCB::PTR };
    let cfsr = Cfsr::from_bits_truncate(scb.cfsr.read());
    let mmfar = scb.mmfar.read();
    let bfar = scb.bfar.read();

    let from_thread_mode = exc_return & 0b1000 != 0;
    // Safety: kernel entry, pointer stable.
    let current = unsafe { CURRENT_TASK_PTR };

    if !from_thread_mode || current.is_none() {
        // A fault in the kernel itself, or in the idle loop: our
        // invariants are suspect and the only safe move is to stop and
        // let the watchdog take over.
        crate::fail::die("kernel fault");
    }

    let fault_type = match class {
        0 => FaultType::MemoryManagement,
        1 => FaultType::BusFault,
        2 => FaultType::UsageFault,
        _ => FaultType::HardFault,
    };

    let fault = match fault_type {
        FaultType::MemoryManagement => {
            if cfsr.contains(Cfsr::MSTKERR) {
                // The stack pointer itself is out of bounds; we can't
                // even store an exception frame through it.
                let psp = cortex_m::register::psp::read();
                FaultInfo::StackOverflow { address: psp }
            } else if cfsr.contains(Cfsr::MMARVALID)
                && (SCS_BASE..SCS_END).contains(&mmfar)
            {
                FaultInfo::PrivilegedInstruction
            } else {
                FaultInfo::MemoryAccess {
                    address: if cfsr.contains(Cfsr::MMARVALID) {
                        Some(mmfar)
                    } else {
                        None
                    },
                    source: FaultSource::User,
                }
            }
        }
        FaultType::BusFault => FaultInfo::MemoryAccess {
            address: if cfsr.contains(Cfsr::BFARVALID) {
                Some(bfar)
            } else {
                None
            },
            source: FaultSource::User,
        },
        FaultType::UsageFault => {
            if cfsr.contains(Cfsr::DIVBYZERO) {
                FaultInfo::DivideByZero
            } else if cfsr.contains(Cfsr::UNDEFINSTR) {
                FaultInfo::IllegalInstruction
            } else if cfsr.contains(Cfsr::UNALIGNED) {
                FaultInfo::MisalignedAccess { address: None }
            } else if cfsr.contains(Cfsr::NOCP) {
                FaultInfo::FloatingPoint
            } else if cfsr.contains(Cfsr::INVPC) {
                // The characteristic signature of branching through the
                // poisoned link register at the bottom of an entry
                // frame.
                FaultInfo::ReturnedFromTask
            } else {
                FaultInfo::InvalidOperation(cfsr.bits())
            }
        }
        FaultType::HardFault => FaultInfo::InvalidOperation(cfsr.bits()),
    };

    // We are responsible for clearing recorded fault status; it is
    // write-one-to-clear.
    //
    // Safety: W1C register, no memory safety implications.
    unsafe {
        scb.cfsr.write(cfsr.bits());
    }

    with_tables(|mut tables| {
        let after = sched::abort_current(
            tables.events,
            tables.tasks,
            tables.processes,
            tables.run,
            crate::ceiling::current(),
            fault,
        );
        act_on(&mut tables, after);
    });
}

fn task_index(tables: &Tables<'_>, task: NonNull<Task>) -> usize {
    let base = tables.tasks.as_ptr() as usize;
    (task.as_ptr() as usize - base) / core::mem::size_of::<Task>()
}
