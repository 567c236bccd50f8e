// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Data Watchpoint & Trace (DWT) engine: four comparators, allocated
//! first-free (spec.md §4.3).

use anyhow::{bail, Result};

use crate::arm_debug::{self, Demcr};
use crate::probe::Probe;

pub const NUM_WATCHPOINTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchFunction {
    Disabled,
    Read,
    Write,
    Access,
}

impl WatchFunction {
    fn encode(self) -> u32 {
        match self {
            WatchFunction::Disabled => 0,
            WatchFunction::Read => 5,
            WatchFunction::Write => 6,
            WatchFunction::Access => 7,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    addr: u32,
    mask: u32,
    function: WatchFunction,
}

impl Default for Entry {
    fn default() -> Self {
        Entry {
            addr: 0,
            mask: 0,
            function: WatchFunction::Disabled,
        }
    }
}

pub struct WatchpointEngine {
    entries: [Entry; NUM_WATCHPOINTS],
}

impl WatchpointEngine {
    /// Sets `DEMCR.TRCENA` and clears every `DWT_FUNn` (spec.md §4.3 "Init").
    pub fn init(probe: &mut dyn Probe) -> Result<Self> {
        let demcr = probe.read_debug32(arm_debug::DEMCR)?;
        probe.write_debug32(arm_debug::DEMCR, demcr | Demcr::TRCENA.bits())?;

        for i in 0..NUM_WATCHPOINTS {
            probe.write_debug32(arm_debug::dwt_funn(i), 0)?;
        }

        Ok(WatchpointEngine {
            entries: [Entry::default(); NUM_WATCHPOINTS],
        })
    }

    /// `mask = min{m : (1 << m) >= len}`; rejects when `mask >= 16`.
    fn length_mask(len: u32) -> Option<u32> {
        if len == 0 {
            return Some(0);
        }
        let mut mask = 0u32;
        while (1u32 << mask) < len {
            mask += 1;
        }
        if mask < 16 {
            Some(mask)
        } else {
            None
        }
    }

    pub fn insert(
        &mut self,
        probe: &mut dyn Probe,
        function: WatchFunction,
        addr: u32,
        len: u32,
    ) -> Result<()> {
        let mask = match Self::length_mask(len) {
            Some(m) => m,
            None => bail!("watchpoint length {len} is out of range"),
        };

        let slot = self
            .entries
            .iter()
            .position(|e| e.function == WatchFunction::Disabled);
        let Some(slot) = slot else {
            bail!("no free hardware watchpoint slot");
        };

        probe.write_debug32(arm_debug::dwt_compn(slot), addr)?;
        probe.write_debug32(arm_debug::dwt_maskn(slot), mask)?;
        probe.write_debug32(arm_debug::dwt_funn(slot), function.encode())?;
        // Clear the matched bit left over from programming.
        let _ = probe.read_debug32(arm_debug::dwt_funn(slot))?;

        self.entries[slot] = Entry {
            addr,
            mask,
            function,
        };
        Ok(())
    }

    pub fn remove(&mut self, probe: &mut dyn Probe, addr: u32) -> Result<()> {
        let slot = self
            .entries
            .iter()
            .position(|e| e.addr == addr && e.function != WatchFunction::Disabled);
        let Some(slot) = slot else {
            bail!("no watchpoint set at {addr:#010x}");
        };

        self.entries[slot].function = WatchFunction::Disabled;
        probe.write_debug32(arm_debug::dwt_funn(slot), 0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProbe;

    #[test]
    fn mask_law_matches_spec_table() {
        assert_eq!(WatchpointEngine::length_mask(1), Some(0));
        assert_eq!(WatchpointEngine::length_mask(2), Some(1));
        assert_eq!(WatchpointEngine::length_mask(3), Some(2));
        assert_eq!(WatchpointEngine::length_mask(4), Some(2));
        assert_eq!(WatchpointEngine::length_mask(5), Some(3));
        assert_eq!(WatchpointEngine::length_mask(8), Some(3));
        assert_eq!(WatchpointEngine::length_mask(32768), Some(15));
        assert_eq!(WatchpointEngine::length_mask(32769), None);
    }

    #[test]
    fn insert_and_remove_round_trip() {
        let mut probe = FakeProbe::new();
        let mut wps = WatchpointEngine::init(&mut probe).unwrap();

        wps.insert(&mut probe, WatchFunction::Write, 0x2000_0000, 4)
            .unwrap();
        assert_eq!(probe.debug32[&arm_debug::dwt_funn(0)], 6);

        wps.remove(&mut probe, 0x2000_0000).unwrap();
        assert_eq!(probe.debug32[&arm_debug::dwt_funn(0)], 0);
    }

    #[test]
    fn removing_unset_address_is_an_error() {
        let mut probe = FakeProbe::new();
        let mut wps = WatchpointEngine::init(&mut probe).unwrap();
        assert!(wps.remove(&mut probe, 0x2000_0000).is_err());
    }

    #[test]
    fn allocation_is_first_free() {
        let mut probe = FakeProbe::new();
        let mut wps = WatchpointEngine::init(&mut probe).unwrap();
        for i in 0..NUM_WATCHPOINTS as u32 {
            wps.insert(&mut probe, WatchFunction::Access, 0x1000 * i, 4)
                .unwrap();
        }
        assert!(wps
            .insert(&mut probe, WatchFunction::Access, 0x9999, 4)
            .is_err());
    }
}
