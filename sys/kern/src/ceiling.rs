// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Priority-ceiling mutual exclusion and the hardware-interrupt critical
//! sections.
//!
//! Three disjoint protection domains exist, and each gets its own
//! primitive:
//!
//! - between tasks: the priority-ceiling protocol below, nestable;
//! - between tasks and ISRs: `mask_to_priority`/`restore_priority`,
//!   nestable, operating on the interrupt controller's mask;
//! - kernel-internal, the hardest lock: `enter_critical`/`leave_critical`,
//!   which masks all external interrupts and must not be nested.
//!
//! The ceiling for a shared datum is the maximum priority of all tasks
//! touching it. Holding a ceiling makes the current context *act* that
//! urgent: the scheduler refuses to dispatch any task at or below the held
//! level, which is exactly the mutual exclusion the protocol promises.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use abi::Priority;

/// The task-space current-priority register.
///
/// Its value is written only by `acquire` and `release`; everything else
/// (notably the scheduler) just reads it. On a balanced
/// acquire/release sequence the value returns exactly to what it was
/// before the outermost acquire.
#[derive(Debug)]
pub struct CeilingRegister(AtomicU8);

impl CeilingRegister {
    pub const fn new() -> Self {
        Self(AtomicU8::new(Priority::IDLE.0))
    }

    /// Reads the currently held ceiling.
    pub fn current(&self) -> Priority {
        Priority(self.0.load(Ordering::SeqCst))
    }

    /// Raises the ceiling to `level` if it is currently lower, and returns
    /// the previous value for the matching `release`. Acquiring at or
    /// below the current level is a no-op (the caller already excludes
    /// every sharer), which is what makes nesting free.
    pub fn acquire(&self, level: Priority) -> Priority {
        let prev = self.current();
        if level.is_more_important_than(prev) {
            self.0.store(level.0, Ordering::SeqCst);
        }
        prev
    }

    /// Restores the ceiling to the value returned by the matching
    /// `acquire`. The register only ever moves down here.
    pub fn release(&self, saved: Priority) {
        uassert!(!saved.is_more_important_than(self.current()));
        self.0.store(saved.0, Ordering::SeqCst);
    }
}

impl Default for CeilingRegister {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel's single task-space ceiling register.
static TASK_CEILING: CeilingRegister = CeilingRegister::new();

/// Reads the held ceiling, for the scheduler's dispatch decision.
pub fn current() -> Priority {
    TASK_CEILING.current()
}

/// Raw acquire on the kernel register. Callers must hand the returned
/// value back to `release_ceiling`, in LIFO order; prefer
/// [`with_ceiling`], which cannot get this wrong.
pub fn acquire_ceiling(level: Priority) -> Priority {
    TASK_CEILING.acquire(level)
}

/// Raw release. If the ceiling actually drops, a task at or below the old
/// level may have become dispatchable, so a context switch is requested.
pub fn release_ceiling(saved: Priority) {
    let lowered = saved != TASK_CEILING.current();
    TASK_CEILING.release(saved);
    if lowered {
        crate::arch::pend_context_switch();
    }
}

/// Scoped form of the ceiling protocol: the returned guard restores the
/// previous level when it goes out of scope, so acquire and release cannot
/// be unbalanced by construction.
pub fn with_ceiling(level: Priority) -> CeilingGuard {
    CeilingGuard {
        saved: acquire_ceiling(level),
    }
}

/// Guard returned by [`with_ceiling`].
#[must_use = "dropping the guard immediately releases the ceiling"]
pub struct CeilingGuard {
    saved: Priority,
}

impl Drop for CeilingGuard {
    fn drop(&mut self) {
        release_ceiling(self.saved);
    }
}

/// Raises the interrupt controller's mask so that ISRs at or below
/// `level` are held off, returning the previous mask level for
/// `restore_priority`. Nestable; used for data shared between tasks and
/// ISRs.
pub fn mask_to_priority(level: u8) -> u8 {
    crate::arch::set_isr_mask(level)
}

/// Restores an interrupt mask level saved by `mask_to_priority`.
pub fn restore_priority(saved: u8) {
    crate::arch::restore_isr_mask(saved);
}

/// Set while the all-interrupts critical section is held, to catch
/// illegal nesting.
static IN_CRITICAL: AtomicBool = AtomicBool::new(false);

/// Token to be passed back to `leave_critical`.
pub struct CriticalToken {
    // Whether interrupts were enabled when we entered.
    reenable: bool,
}

/// Enters the hardest critical section: all external interrupts masked.
/// Not nestable; this is for short kernel-internal sequences only.
pub fn enter_critical() -> CriticalToken {
    let reenable = crate::arch::disable_interrupts();
    uassert!(!IN_CRITICAL.swap(true, Ordering::SeqCst));
    CriticalToken { reenable }
}

/// Leaves the critical section entered by the matching `enter_critical`.
pub fn leave_critical(token: CriticalToken) {
    IN_CRITICAL.store(false, Ordering::SeqCst);
    if token.reenable {
        crate::arch::enable_interrupts();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_pairs_restore_exactly() {
        let reg = CeilingRegister::new();
        assert_eq!(reg.current(), Priority(0));

        let saved = reg.acquire(Priority(5));
        assert_eq!(reg.current(), Priority(5));
        reg.release(saved);
        assert_eq!(reg.current(), Priority(0));
    }

    #[test]
    fn acquire_release_is_a_noop_on_observable_state() {
        let reg = CeilingRegister::new();
        let outer = reg.acquire(Priority(4));
        let before = reg.current();
        let saved = reg.acquire(Priority(9));
        reg.release(saved);
        assert_eq!(reg.current(), before);
        reg.release(outer);
    }

    #[test]
    fn nested_acquires_unwind_in_order() {
        let reg = CeilingRegister::new();
        let a = reg.acquire(Priority(3));
        let b = reg.acquire(Priority(7));
        let c = reg.acquire(Priority(9));
        assert_eq!(reg.current(), Priority(9));
        reg.release(c);
        assert_eq!(reg.current(), Priority(7));
        reg.release(b);
        assert_eq!(reg.current(), Priority(3));
        reg.release(a);
        assert_eq!(reg.current(), Priority(0));
    }

    #[test]
    fn acquire_below_current_is_a_noop() {
        let reg = CeilingRegister::new();
        let a = reg.acquire(Priority(8));
        // A sharer set needing only level 3: the caller already holds 8,
        // so nothing moves.
        let b = reg.acquire(Priority(3));
        assert_eq!(reg.current(), Priority(8));
        assert_eq!(b, Priority(8));
        reg.release(b);
        assert_eq!(reg.current(), Priority(8));
        reg.release(a);
        assert_eq!(reg.current(), Priority(0));
    }

    #[test]
    fn equal_level_reacquire_is_a_noop() {
        let reg = CeilingRegister::new();
        let a = reg.acquire(Priority(6));
        let b = reg.acquire(Priority(6));
        assert_eq!(b, Priority(6));
        reg.release(b);
        assert_eq!(reg.current(), Priority(6));
        reg.release(a);
    }
}
