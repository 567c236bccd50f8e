// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Flash Patch & Breakpoint (FPB) engine: allocation, programming and
//! the v1/v2 revision quirk (spec.md §4.2).

use anyhow::{bail, Result};

use crate::arm_debug::{self, FpCtrl};
use crate::probe::Probe;

pub const MAX_BREAKPOINTS: usize = 15;

const LOW: u32 = 0x01;
const HIGH: u32 = 0x02;
const REMAP: u32 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpbRevision {
    V1,
    V2,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    /// Comparator slot address (`fpb_addr`); meaningless while `kind == 0`.
    addr: u32,
    /// Bitset of LOW/HIGH/REMAP; zero means the slot is free.
    kind: u32,
}

impl Default for Entry {
    fn default() -> Self {
        Entry { addr: 0, kind: 0 }
    }
}

pub struct BreakpointEngine {
    revision: FpbRevision,
    num_slots: usize,
    entries: [Entry; MAX_BREAKPOINTS],
}

impl BreakpointEngine {
    /// Enables the FPB, reads its geometry and revision, and zeroes every
    /// comparator (spec.md §4.2 "Init").
    pub fn init(probe: &mut dyn Probe) -> Result<Self> {
        probe.write_debug32(
            arm_debug::FP_CTRL,
            (FpCtrl::KEY | FpCtrl::ENABLE).bits(),
        )?;
        let raw = probe.read_debug32(arm_debug::FP_CTRL)?;
        let num_slots = (FpCtrl::num_code(raw) as usize).min(MAX_BREAKPOINTS);
        let revision = if FpCtrl::revision(raw) == 0 {
            FpbRevision::V1
        } else {
            FpbRevision::V2
        };

        let cpuid = probe.read_debug32(arm_debug::CPUID)?;
        if (cpuid >> 4) & 0xFFF == arm_debug::CORTEX_M7_PART_NO {
            probe.write_debug32(arm_debug::FP_LAR, arm_debug::FP_LAR_KEY)?;
        }

        let mut entries = [Entry::default(); MAX_BREAKPOINTS];
        for (i, entry) in entries.iter_mut().enumerate().take(num_slots) {
            *entry = Entry::default();
            probe.write_debug32(arm_debug::fp_compn(i), 0)?;
        }

        Ok(BreakpointEngine {
            revision,
            num_slots,
            entries,
        })
    }

    pub fn has_breakpoint(&self, addr: u32) -> bool {
        self.entries[..self.num_slots]
            .iter()
            .any(|e| e.kind != 0 && e.addr == addr)
    }

    fn slot_for(&self, addr: u32) -> (u32, u32) {
        match self.revision {
            FpbRevision::V1 => {
                let fpb_addr = addr & 0x1FFF_FFFC;
                let sub = if addr & 2 != 0 { HIGH } else { LOW };
                (fpb_addr, sub)
            }
            FpbRevision::V2 => (addr, REMAP),
        }
    }

    /// Inserts (`set = true`) or removes a hardware breakpoint at `addr`.
    ///
    /// Two breakpoints that land on the same FPB v1 word share one slot;
    /// removing a breakpoint that was never set is a no-op success.
    pub fn update(
        &mut self,
        probe: &mut dyn Probe,
        addr: u32,
        set: bool,
    ) -> Result<()> {
        if addr & 1 != 0 {
            bail!("update_code_breakpoint: unaligned address {addr:#010x}");
        }

        let (fpb_addr, sub) = self.slot_for(addr);

        let id = self.entries[..self.num_slots]
            .iter()
            .position(|e| e.addr == fpb_addr && e.kind != 0)
            .or_else(|| {
                if set {
                    self.entries[..self.num_slots]
                        .iter()
                        .position(|e| e.kind == 0)
                } else {
                    None
                }
            });

        let id = match id {
            Some(id) => id,
            None => {
                if set {
                    bail!("no free hardware breakpoint slot");
                } else {
                    return Ok(()); // already removed
                }
            }
        };

        let entry = &mut self.entries[id];
        entry.addr = fpb_addr;
        if set {
            entry.kind |= sub;
        } else {
            entry.kind &= !sub;
        }

        // DDI0403E, p.759: FP_COMPn layout is {REPLACE[31:30], COMP[28:2], 0, ENABLE}.
        let reg = if entry.kind == 0 {
            0
        } else {
            ((entry.kind & 0x3) << 30) | entry.addr | 1
        };
        probe.write_debug32(arm_debug::fp_compn(id), reg)?;

        Ok(())
    }
}
