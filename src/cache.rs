// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cortex-M7 cache coherency: discover the D-cache/I-cache geometry once
//! per attach, then flush by set/way after every debugger memory write
//! before the target is allowed to run again (spec.md §4.5).

use anyhow::Result;

use crate::arm_debug::{self, Ccr};
use crate::probe::Probe;

#[derive(Debug, Clone, Copy, Default)]
struct LevelDesc {
    nways: u32,
    log2_nways: u32,
    width: u32,
}

fn ceil_log2(v: u32) -> u32 {
    let mut res = 0;
    while (1u32 << res) < v {
        res += 1;
    }
    res
}

pub struct CacheDescriptor {
    used: bool,
    dminline: u32,
    louu: u32,
    dcache: [LevelDesc; 7],
    modified: bool,
}

impl CacheDescriptor {
    /// Reads `CTR`; if the target has no cache, everything past this is a
    /// no-op for the life of the session.
    pub fn init(probe: &mut dyn Probe) -> Result<Self> {
        let ctr = probe.read_debug32(arm_debug::CM7_CTR)?;
        if ctr >> 29 != 0b100 {
            return Ok(CacheDescriptor {
                used: false,
                dminline: 0,
                louu: 0,
                dcache: [LevelDesc::default(); 7],
                modified: false,
            });
        }

        let dminline = 4 << ((ctr >> 16) & 0x0f);
        let clidr = probe.read_debug32(arm_debug::CM7_CLIDR)?;
        let louu = (clidr >> 27) & 7;

        let mut dcache = [LevelDesc::default(); 7];
        for (i, level) in dcache.iter_mut().enumerate() {
            let ct = (clidr >> (3 * i)) & 0x07;
            // 2=data-only, 3=separate, 4=unified: all three expose a D-side.
            if ct == 2 || ct == 3 || ct == 4 {
                probe.write_debug32(arm_debug::CM7_CSSELR, (i as u32) << 1)?;
                let ccsidr = probe.read_debug32(arm_debug::CM7_CCSIDR)?;
                let nsets = ((ccsidr >> 13) & 0x3fff) + 1;
                let nways = ((ccsidr >> 3) & 0x1ff) + 1;
                let log2_nways = ceil_log2(nways);
                let width = 4 + (ccsidr & 7) + ceil_log2(nsets);
                *level = LevelDesc {
                    nways,
                    log2_nways,
                    width,
                };
            }
        }

        Ok(CacheDescriptor {
            used: true,
            dminline,
            louu,
            dcache,
            modified: false,
        })
    }

    /// Marks the cache dirty; called after any debugger write of `len > 0`
    /// bytes.
    pub fn note_write(&mut self, len: u32) {
        if len > 0 {
            self.modified = true;
        }
    }

    /// Flushes D-cache by set/way from `LoUU-1` down to 0 and invalidates
    /// I-cache, but only if something was written since the last sync.
    /// Must run before every halt-to-run transition (`c`, `s`, `monitor
    /// resume`, semihosting resume).
    pub fn sync(&mut self, probe: &mut dyn Probe) -> Result<()> {
        if !self.used || !self.modified {
            return Ok(());
        }
        self.modified = false;

        let ccr = Ccr::from_bits_retain(probe.read_debug32(arm_debug::CM7_CCR)?);
        if !ccr.intersects(Ccr::IC | Ccr::DC) {
            return Ok(());
        }

        if ccr.contains(Ccr::DC) {
            for level in (0..self.louu as usize).rev() {
                let desc = self.dcache[level];
                let way_shift = 32 - desc.log2_nways;
                let max_addr = 1u32 << desc.width;
                let mut addr = (level as u32) << 1;
                while addr < max_addr {
                    for way in 0..desc.nways {
                        probe.write_debug32(
                            arm_debug::CM7_DCCSW,
                            addr | (way << way_shift),
                        )?;
                    }
                    addr += self.dminline;
                }
            }
        }

        if ccr.contains(Ccr::IC) {
            probe.write_debug32(arm_debug::CM7_ICIALLU, 0)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProbe;

    #[test]
    fn absent_cache_is_inert() {
        let mut probe = FakeProbe::new();
        probe.ctr = 0; // top bits != 0b100
        let mut cache = CacheDescriptor::init(&mut probe).unwrap();
        cache.note_write(4);
        cache.sync(&mut probe).unwrap(); // must not touch DCCSW/ICIALLU
        assert!(!probe.debug32.contains_key(&arm_debug::CM7_DCCSW));
        assert!(!probe.debug32.contains_key(&arm_debug::CM7_ICIALLU));
    }

    #[test]
    fn sync_is_a_no_op_without_a_write() {
        let mut probe = FakeProbe::new();
        probe.ctr = 0b100 << 29;
        probe.ccr = (Ccr::IC | Ccr::DC).bits();
        let mut cache = CacheDescriptor::init(&mut probe).unwrap();
        cache.sync(&mut probe).unwrap();
        assert!(!probe.debug32.contains_key(&arm_debug::CM7_ICIALLU));
    }

    #[test]
    fn sync_clears_the_dirty_flag_and_touches_icache() {
        let mut probe = FakeProbe::new();
        probe.ctr = 0b100 << 29;
        probe.ccr = Ccr::IC.bits();
        let mut cache = CacheDescriptor::init(&mut probe).unwrap();
        cache.note_write(4);
        cache.sync(&mut probe).unwrap();
        assert_eq!(probe.debug32[&arm_debug::CM7_ICIALLU], 0);
        assert!(!cache.modified);

        // Second sync without an intervening write does nothing further.
        probe.debug32.remove(&arm_debug::CM7_ICIALLU);
        cache.sync(&mut probe).unwrap();
        assert!(!probe.debug32.contains_key(&arm_debug::CM7_ICIALLU));
    }
}
