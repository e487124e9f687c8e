// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here
//! in the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the
//! same set of names: the `SavedState` type, the interrupt mask and
//! table-access primitives, the context-switch and protection hooks, the
//! two clocks, and the `klog!`/`uassert!` macros.
//!
//! Anything that is not an ARMv7-M target gets the `fake` backend, which
//! exists so that the kernel's policy code can be compiled and unit
//! tested on a development host. It performs no privileged operation;
//! its interrupt mask is a thread-local shadow and its "context
//! switches" are bookkeeping only.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        #[macro_use]
        pub mod arm_m;
        pub use arm_m::*;
    } else {
        #[macro_use]
        pub mod fake;
        pub use fake::*;
    }
}
