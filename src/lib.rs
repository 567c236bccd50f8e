// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `st-util`: a GDB Remote Serial Protocol server that bridges a GDB
//! client over TCP to an ARM Cortex-M target through a debug probe.

pub mod arm_debug;
pub mod breakpoints;
pub mod cache;
pub mod cli;
pub mod flash;
pub mod memory_map;
pub mod probe;
pub mod registers;
pub mod rsp_framing;
pub mod session;
pub mod watchpoints;

#[cfg(test)]
pub mod testing;
