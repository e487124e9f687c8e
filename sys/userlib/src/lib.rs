// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User-partition interface to the kernel.
//!
//! Everything in here funnels through one trap: the system call index
//! travels in r11, up to three word arguments in r4-r6, and the result
//! comes back in r4. Those are callee-saved registers, which is the
//! whole trick -- the kernel finds them in the spilled context rather
//! than in the hardware-stacked frame, so the stub just has to park the
//! operands and issue `svc`.
//!
//! Task entry functions run to completion, once per activation. Ending
//! an activation by returning from the entry function works only if the
//! frame's poisoned link register is never reached, so entries should
//! finish through [`task_exit`] (or be declared with [`task_entry!`],
//! which arranges that). Falling off the end of the call chain is
//! trapped by the kernel and counted against the process.

#![no_std]

use abi::{EventId, Pid, ProcessStatus, Sysnum};

#[cfg(target_arch = "arm")]
core::arch::global_asm!(
    "
    .syntax unified
    .section .text.__palisade_syscall,\"ax\"
    .globl __palisade_syscall
    .type __palisade_syscall,%function
    .thumb_func
    __palisade_syscall:
        @ r0 = index, r1-r3 = arguments. Park the operands in the
        @ callee-saved registers the kernel reads them from.
        push {{r4-r6, r11, lr}}
        mov r11, r0
        mov r4, r1
        mov r5, r2
        mov r6, r3

        svc #0

        @ Result arrives in r4.
        mov r0, r4
        pop {{r4-r6, r11, pc}}
    "
);

#[cfg(target_arch = "arm")]
extern "C" {
    fn __palisade_syscall(nr: u32, a0: usize, a1: usize, a2: usize) -> u32;
}

/// Issues system call `nr` with up to three word arguments.
///
/// Invalid indices or arguments do not "fail" from the caller's point of
/// view: the kernel aborts the offending activation outright, so this
/// only returns on success (or for recoverable conditions encoded in the
/// return value, such as a lost trigger).
#[inline(always)]
pub fn sys_call(nr: u32, args: [usize; 3]) -> u32 {
    #[cfg(target_arch = "arm")]
    {
        // Safety: the stub clobbers nothing the compiler relies on (it
        // saves/restores the registers it parks operands in), and the
        // trap itself is always memory-safe from the caller's side.
        return unsafe {
            __palisade_syscall(nr, args[0], args[1], args[2])
        };
    }
    #[cfg(not(target_arch = "arm"))]
    {
        let _ = (nr, args);
        unimplemented!("system calls require the real target");
    }
}

/// Ends the current activation without returning through the call
/// chain. A negative `code` is counted against the process as a
/// user-signalled error.
pub fn task_exit(code: i32) -> ! {
    let _ = sys_call(Sysnum::TaskExit as u32, [code as u32 as usize, 0, 0]);
    // The kernel tears the activation down during the trap; it never
    // resumes us. Spin for form's sake (and for the host build).
    loop {
        core::hint::spin_loop();
    }
}

/// Software-triggers `event`. Returns `true` if the activation was
/// accepted, `false` if it was lost, refused by the privilege check, or
/// the id is unknown.
pub fn sys_trigger_event(event: EventId) -> bool {
    sys_call(Sysnum::TriggerEvent as u32, [event.index(), 0, 0]) != 0
}

/// Raises the current priority to `level`, keeping every task at or
/// below that level off the CPU until the matching
/// [`sys_restore_priority`]. This is the priority-ceiling protocol;
/// `level` must be the maximum priority of all tasks sharing the
/// protected data. Nestable, as long as every call is balanced with its
/// saved value in LIFO order.
pub fn sys_mask_to_priority(level: u8) -> u8 {
    sys_call(Sysnum::RaisePriority as u32, [usize::from(level), 0, 0]) as u8
}

/// Restores the priority saved by the matching [`sys_mask_to_priority`].
pub fn sys_restore_priority(saved: u8) {
    let _ =
        sys_call(Sysnum::RestorePriority as u32, [usize::from(saved), 0, 0]);
}

/// Permanently suspends `pid`. Requires the suspend-others permission;
/// without it, the *caller* is aborted.
pub fn sys_suspend_process(pid: Pid) {
    let _ = sys_call(Sysnum::SuspendProcess as u32, [pid.index(), 0, 0]);
}

/// Reads the diagnostic status record of `pid` into `buf`, returning the
/// number of bytes the kernel wrote (or would need, if `buf` is too
/// small). Callers need the read-status permission unless reading their
/// own process.
pub fn sys_read_process_status(pid: Pid, buf: &mut [u8]) -> usize {
    sys_call(
        Sysnum::ReadProcessStatus as u32,
        [pid.index(), buf.as_mut_ptr() as usize, buf.len()],
    ) as usize
}

/// Typed convenience wrapper around [`sys_read_process_status`].
///
/// Returns `None` if the record did not fit the scratch buffer or could
/// not be decoded, which only happens if userlib and kernel disagree
/// about the ABI.
pub fn read_process_status(pid: Pid) -> Option<ProcessStatus> {
    let mut buf = [0u8; 80];
    let len = sys_read_process_status(pid, &mut buf);
    if len == 0 || len > buf.len() {
        return None;
    }
    ssmarshal::deserialize(&buf[..len]).ok().map(|(s, _)| s)
}

/// Declares a task entry point: a `#[no_mangle]` wrapper that runs
/// `$body` and ends the activation through `task_exit` with its result,
/// so the frame's poisoned return address is never reached.
///
/// ```ignore
/// fn blink(_event: u32) -> i32 { /* ... */ 0 }
/// task_entry!(blink_task, blink);
/// ```
#[macro_export]
macro_rules! task_entry {
    ($name:ident, $body:path) => {
        #[no_mangle]
        pub extern "C" fn $name(arg: u32) -> i32 {
            let code: i32 = $body(arg);
            $crate::task_exit(code)
        }
    };
}
