// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of processes, the memory protection domains.
//!
//! A process owns a stack, a handful of memory regions, some permission
//! bits, and the error counters the exception path charges when one of its
//! tasks misbehaves. The kernel process (pid 0) is special: it is exempt
//! from every check in this module.
//!
//! The per-cause error counters have exactly one writer, `charge`, which is
//! reached only from the exception/abort path; everything else reads.

use abi::{FaultCause, Pid, ProcessStatus};

use crate::descs::{
    ProcessDesc, ProcessFlags, RegionAttributes, RegionDesc,
    REGIONS_PER_PROCESS,
};
use crate::umem::USlice;

/// Greatest number of entries in a process's access table: its stack, its
/// owned regions, and the shared region.
pub const MAX_ACCESS_REGIONS: usize = REGIONS_PER_PROCESS + 2;

/// Pattern the kernel paints stacks with at startup, so the diagnostic
/// surface can measure how deep each stack has ever grown.
pub const STACK_FILL_WORD: u32 = 0xBADD_CAFE;

/// Internal representation of a process.
#[derive(Debug)]
pub struct Process {
    /// The configuration-time description.
    desc: ProcessDesc,
    /// The regions this process may touch, sorted by base address: stack,
    /// owned regions, and the shared region. This is both what the
    /// protection hardware gets programmed with on context switch and what
    /// system call argument validation consults.
    access: [RegionDesc; MAX_ACCESS_REGIONS],
    /// Number of live entries in `access`.
    access_len: usize,
    /// The board's read-only RAM window, if configured: everything in it
    /// is readable (never writable) even when not owned. Programmed into
    /// the lowest-precedence protection slot, underneath the specific
    /// regions.
    window: Option<RegionDesc>,
    /// Once set, no task of this process may ever be dispatched again.
    halted: bool,
    /// Per-cause fault counters, indexed by `FaultCause::index`.
    errors: [u32; FaultCause::COUNT],
    /// Sum of the above, kept separately (and also saturating).
    total_errors: u32,
}

impl Process {
    /// Builds the runtime state for `desc`. `shared` is the system-wide
    /// shared region, granted to every user process, and `window` is the
    /// optional read-only view of all RAM; the configuration layer passes
    /// `None` for both on the kernel process.
    ///
    /// The access table is sorted here so the coverage scan and the
    /// protection hardware never have to care about registration order.
    pub fn new(
        desc: ProcessDesc,
        shared: Option<RegionDesc>,
        window: Option<RegionDesc>,
    ) -> Self {
        let mut access = [RegionDesc {
            base: 0,
            size: 0,
            attributes: RegionAttributes::empty(),
        }; MAX_ACCESS_REGIONS];
        let mut access_len = 0;

        let mut push = |r: RegionDesc| {
            access[access_len] = r;
            access_len += 1;
        };

        if !desc.pid.is_kernel() {
            push(desc.stack);
            for region in desc.regions.iter().flatten() {
                push(*region);
            }
            if let Some(shared) = shared {
                push(shared);
            }
        }

        access[..access_len].sort_unstable_by_key(|r| r.base);

        Self {
            desc,
            access,
            access_len,
            window: if desc.pid.is_kernel() { None } else { window },
            halted: false,
            errors: [0; FaultCause::COUNT],
            total_errors: 0,
        }
    }

    pub fn pid(&self) -> Pid {
        self.desc.pid
    }

    pub fn flags(&self) -> ProcessFlags {
        self.desc.flags
    }

    pub fn stack(&self) -> &RegionDesc {
        &self.desc.stack
    }

    /// The sorted table of regions this process may touch. The kernel
    /// process's table is empty, because it is not subject to checking.
    pub fn access_table(&self) -> &[RegionDesc] {
        &self.access[..self.access_len]
    }

    /// The read-only RAM window, if the board configured one.
    pub fn ram_window(&self) -> Option<&RegionDesc> {
        self.window.as_ref()
    }

    /// Tests whether this process has access to `slice` as normal memory
    /// with *all* of the attributes in `atts`. Device regions never pass:
    /// system calls do not dereference I/O space on a task's behalf.
    ///
    /// The kernel process passes unconditionally. A read-only request
    /// also passes if the slice sits entirely inside the RAM window,
    /// which is how "all other RAM is readable but not writable" works.
    ///
    /// This function is `must_use` because calling it without checking its
    /// return value is incredibly suspicious.
    #[must_use]
    pub fn can_access<T>(
        &self,
        slice: &USlice<T>,
        atts: RegionAttributes,
    ) -> bool {
        if self.desc.pid.is_kernel() {
            return true;
        }
        if memcore::span_covered(slice, self.access_table(), |r| {
            r.attributes.contains(atts)
                && !r.attributes.contains(RegionAttributes::DEVICE)
        }) {
            return true;
        }
        if RegionAttributes::READ.contains(atts) {
            if let Some(w) = &self.window {
                return !slice.is_empty()
                    && w.contains(slice.base_addr())
                    && slice.end_addr() <= w.end_addr();
            }
        }
        false
    }

    /// Tests whether this process may read `slice`. This is the
    /// `is_user_readable` check of the system call argument contract.
    #[must_use]
    pub fn can_read<T>(&self, slice: &USlice<T>) -> bool {
        self.can_access(slice, RegionAttributes::READ)
    }

    /// Tests whether this process may write `slice`. This is the
    /// `is_user_writable` check of the system call argument contract.
    #[must_use]
    pub fn can_write<T>(&self, slice: &USlice<T>) -> bool {
        self.can_access(slice, RegionAttributes::WRITE)
    }

    /// Obtains the memory backing `slice` as a kernel slice, if the
    /// process is allowed to read it.
    pub fn try_read<'s, T>(
        &self,
        slice: &'s USlice<T>,
    ) -> Result<&'s [T], abi::FaultInfo>
    where
        T: zerocopy::FromBytes,
    {
        if self.can_read(slice) {
            // Safety: assume_readable requires us to have validated that
            // the slice refers to readable process memory, which is what
            // the line above did.
            Ok(unsafe { slice.assume_readable() })
        } else {
            Err(abi::FaultInfo::MemoryAccess {
                address: Some(slice.base_addr() as u32),
                source: abi::FaultSource::Kernel,
            })
        }
    }

    /// Obtains the memory backing `slice` as a mutable kernel slice, if
    /// the process is allowed to write it.
    pub fn try_write<'s, T>(
        &self,
        slice: &'s mut USlice<T>,
    ) -> Result<&'s mut [T], abi::FaultInfo>
    where
        T: zerocopy::FromBytes,
    {
        if self.can_write(slice) {
            // Safety: assume_writable requires us to have validated that
            // the slice refers to writable process memory, which is what
            // the line above did.
            Ok(unsafe { slice.assume_writable() })
        } else {
            Err(abi::FaultInfo::MemoryAccess {
                address: Some(slice.base_addr() as u32),
                source: abi::FaultSource::Kernel,
            })
        }
    }

    /// Charges this process for a classified fault. This is the *only*
    /// writer of the error counters; it is reached from the exception and
    /// abort paths and from nowhere else.
    pub fn charge(&mut self, cause: FaultCause) {
        let slot = &mut self.errors[cause.index()];
        *slot = slot.saturating_add(1);
        self.total_errors = self.total_errors.saturating_add(1);
    }

    pub fn error_count(&self, cause: FaultCause) -> u32 {
        self.errors[cause.index()]
    }

    pub fn total_errors(&self) -> u32 {
        self.total_errors
    }

    /// Sets the halted flag. Use `sched::suspend_process`, which also
    /// discards ready work, rather than calling this directly.
    pub fn halt(&mut self) {
        self.halted = true;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Snapshot for the diagnostic surface. `stack_reserve` is measured by
    /// the caller (it requires touching the actual stack memory).
    pub fn status(&self, stack_reserve: u32) -> ProcessStatus {
        ProcessStatus {
            pid: self.desc.pid,
            halted: self.halted,
            total_errors: self.total_errors,
            errors: self.errors,
            stack_reserve,
        }
    }
}

/// Counts how many words at the bottom of a painted stack have never been
/// overwritten. The stack grows downward, so the prefix of the region that
/// still carries the fill pattern is exactly the space no activation has
/// ever needed.
pub fn painted_words(stack: &[u32]) -> usize {
    stack.iter().take_while(|&&w| w == STACK_FILL_WORD).count()
}

/// Measures the minimum observed free stack space of `process`, in bytes.
///
/// # Safety
///
/// The process's stack region must be real, readable RAM, which is true
/// once `start_kernel` has validated and painted it.
pub unsafe fn measure_stack_reserve(process: &Process) -> u32 {
    let stack = process.stack();
    // Safety: per our own contract, the region is readable RAM; painting
    // initialized every word, so reading them as u32 is defined.
    let words = unsafe {
        core::slice::from_raw_parts(stack.base as *const u32, stack.size / 4)
    };
    (painted_words(words) * 4) as u32
}

/// Paints the not-currently-in-use part of a stack region with the fill
/// pattern, from the bottom of the region up to `floor` (exclusive).
///
/// # Safety
///
/// The region must be real, writable RAM, and `floor` must not point into
/// live stack data below the current stack pointer.
pub unsafe fn paint_stack(region: &RegionDesc, floor: usize) {
    let base = region.base;
    let words = floor.saturating_sub(base) / 4;
    // Safety: per our own contract, base..floor is writable RAM with no
    // live data in it.
    unsafe {
        let p = base as *mut u32;
        for i in 0..words {
            p.add(i).write_volatile(STACK_FILL_WORD);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A process with a plausible one-region memory map, for scheduler and
    /// system call tests.
    pub fn user_process(pid: Pid, flags: ProcessFlags) -> Process {
        let mut regions = [None; REGIONS_PER_PROCESS];
        regions[0] = Some(RegionDesc {
            base: 0x2000_0000 + usize::from(pid.0) * 0x1000,
            size: 0x400,
            attributes: RegionAttributes::READ | RegionAttributes::WRITE,
        });
        let desc = ProcessDesc {
            pid,
            stack: RegionDesc {
                base: 0x2001_0000 + usize::from(pid.0) * 0x1000,
                size: 0x400,
                attributes: RegionAttributes::READ | RegionAttributes::WRITE,
            },
            regions,
            flags,
        };
        let shared = RegionDesc {
            base: 0x2002_0000,
            size: 0x100,
            attributes: RegionAttributes::READ | RegionAttributes::WRITE,
        };
        Process::new(
            desc,
            if pid.is_kernel() { None } else { Some(shared) },
            None,
        )
    }
}
