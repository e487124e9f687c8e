// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Palisade kernel.
//!
//! This is the application-independent portion of the operating system: a
//! preemptive, priority-driven scheduler plus the protection layer that
//! keeps mutually distrusting partitions ("processes") away from each other
//! and from the kernel. A small, trusted supervisory task shares one CPU
//! with a much larger body of lower-integrity application code, and keeps
//! its timing and its memory no matter how the application code misbehaves.
//!
//! The code outside of the `arch` module is *intended* to be portable to
//! any 32-bit single-core machine with memory protection, but it is only
//! being actively developed for ARMv7-M, so it's entirely possible that
//! some ARM-isms have unintentionally leaked into the portable parts.
//!
//! # Design principles
//!
//! While this isn't a *deeply* principled kernel, there are some basic
//! ideas that appear consistently.
//!
//! 1. Static configuration. Events, tasks, processes, interrupt handlers,
//!    and system calls are all declared before `start_kernel` and frozen
//!    thereafter. There is no heap.
//! 2. A strong preference for safe code where reasonable; `unsafe` is
//!    confined to the architecture layer and the user-memory window.
//! 3. A preference for simple and clear algorithms over fast and clever
//!    algorithms. Tables are small and linear scans are fine.
//! 4. Faults in user code are charged and survived; faults in kernel code
//!    halt the machine, because our own invariants are no longer trustworthy.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod arch;

pub mod ceiling;
pub mod config;
pub mod descs;
pub mod err;
pub mod event;
pub mod fail;
pub mod kapi;
pub mod load;
pub mod process;
pub mod sched;
pub mod startup;
pub mod syscalls;
pub mod task;
pub mod time;
pub mod umem;
