// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel halt path.
//!
//! Faults in *user* tasks are charged to the owning process and survived;
//! that whole machinery lives in `sched::abort_current`. This module is
//! for the other kind: a fault in the kernel itself or in an ISR, a run
//! stack that doesn't match reality, a table hole that validation should
//! have made impossible. Once one of those is observed, the scheduler's
//! invariants cannot be trusted, so the only acceptable action is to mask
//! external interrupts and stop; the external watchdog is expected to
//! drive the system into its safe state from there.
//!
//! Stopping silently would make the post-mortem miserable, so [`die`]
//! first leaves a record for the debugger:
//!
//! - `kern::fail::KERNEL_HALTED` is a word that reads `HALT_MAGIC` once
//!   the kernel has gone through `die` (explicitly or via `panic!`). Any
//!   other nonzero value means memory was corrupted on the way down,
//!   which is itself worth knowing.
//!
//! - `kern::fail::KERNEL_HALT_REASON` holds the reason as NUL-padded
//!   UTF-8, truncated to fit.
//!
//! On the host build `die` panics instead, so a kernel-fault path reached
//! from a unit test fails that test loudly rather than wedging the
//! runner.

use core::fmt::Display;

/// The value `KERNEL_HALTED` takes on an orderly halt: "HALT" in ASCII,
/// chosen to be recognizable in a hex dump and improbable as stray data.
#[cfg(target_os = "none")]
pub const HALT_MAGIC: u32 = 0x4841_4C54;

#[cfg(target_os = "none")]
const REASON_LEN: usize = 128;

#[cfg(target_os = "none")]
#[used]
static mut KERNEL_HALTED: u32 = 0;

#[cfg(target_os = "none")]
#[used]
static mut KERNEL_HALT_REASON: [u8; REASON_LEN] = [0; REASON_LEN];

/// Halts the kernel, recording `reason` for the debugger. Never returns;
/// external interrupts are masked before anything else happens.
#[inline(always)]
pub fn die(reason: impl Display) -> ! {
    #[cfg(not(target_os = "none"))]
    {
        panic!("kernel fault: {reason}");
    }
    #[cfg(target_os = "none")]
    {
        die_impl(&reason)
    }
}

#[cfg(target_os = "none")]
#[inline(never)]
fn die_impl(reason: &dyn Display) -> ! {
    // From here on nothing may preempt us, not even the tick.
    let _ = crate::arch::disable_interrupts();

    // Safety: interrupts are masked and this function never returns, so
    // the only way a second writer exists is a fault *inside this path*
    // re-entering it. The magic check catches that case and leaves the
    // first record untouched, since it describes the original problem.
    unsafe {
        let halted = core::ptr::addr_of_mut!(KERNEL_HALTED);
        if halted.read() != HALT_MAGIC {
            halted.write(HALT_MAGIC);
            use core::fmt::Write;
            let mut cursor = ReasonCursor { pos: 0 };
            write!(cursor, "{reason}").ok();
        }
    }

    loop {
        // Sleep until the watchdog pulls the plug. With PRIMASK set the
        // core wakes on interrupt but never takes one, so this cannot
        // re-enter the kernel.
        cortex_m::asm::wfi();
    }
}

/// Byte-at-a-time writer into `KERNEL_HALT_REASON` that drops everything
/// past the end of the buffer.
#[cfg(target_os = "none")]
struct ReasonCursor {
    pos: usize,
}

#[cfg(target_os = "none")]
impl core::fmt::Write for ReasonCursor {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        // Safety: `die_impl` admits one writer per boot, see above.
        let buf = unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_HALT_REASON) };
        for &byte in s.as_bytes() {
            let Some(slot) = buf.get_mut(self.pos) else {
                // Truncate; a partial reason still names the culprit.
                break;
            };
            *slot = byte;
            self.pos += 1;
        }
        Ok(())
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}
