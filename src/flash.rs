// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flash staging: accumulates erase ranges and write payloads from the
//! `vFlash*` sequence, then commits them through the flash loader in one
//! shot (spec.md §4.4).

use anyhow::{bail, Result};
use log::{info, warn};

use crate::probe::{ConnectMode, Probe, ResetKind};

const FLASH_BASE: u32 = 0x0800_0000;

struct Block {
    addr: u32,
    data: Vec<u8>,
}

impl Block {
    fn end(&self) -> u32 {
        self.addr + self.data.len() as u32
    }
}

/// A vector of staged blocks, per the Design Note in spec.md §9 ("a
/// linked-list staging can become an index-based vector"); overlap search
/// stays linear, which is fine for the handful of blocks a flash session
/// ever accumulates.
#[derive(Default)]
pub struct FlashStaging {
    blocks: Vec<Block>,
}

impl FlashStaging {
    pub fn new() -> Self {
        FlashStaging { blocks: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// `vFlashErase:<addr>,<len>` — validates bounds and page alignment,
    /// then appends a fresh block pre-filled with the erased-flash pattern.
    pub fn add_block(
        &mut self,
        probe: &mut dyn Probe,
        addr: u32,
        len: u32,
    ) -> Result<()> {
        let flash_size = probe.chip().flash_size;
        if addr < FLASH_BASE || addr.checked_add(len).map_or(true, |end| end > FLASH_BASE + flash_size)
        {
            bail!("flash_add_block: incorrect bounds {addr:#010x}+{len:#x}");
        }

        let page_size = probe.calculate_pagesize(addr)?;
        if page_size == 0 || addr % page_size != 0 || len % page_size != 0 {
            bail!("flash_add_block: unaligned block {addr:#010x}+{len:#x}");
        }

        let pattern = probe.erased_pattern();
        self.blocks.push(Block {
            addr,
            data: vec![pattern; len as usize],
        });
        Ok(())
    }

    /// `vFlashWrite:<addr>:<data>` — overlays `data` onto every staged
    /// block it intersects. No matching block is an error; partial
    /// coverage is only a warning (GDB is allowed to over-send).
    pub fn populate(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let a = addr;
        let b = addr + data.len() as u32;

        let mut fit_blocks = 0u32;
        let mut fit_length = 0u32;

        for block in &mut self.blocks {
            let x = block.addr;
            let y = block.end();
            if a < y && b > x {
                let start = a.max(x) - x;
                let end = b.min(y) - x;
                let src_start = a.max(x) - a;
                let len = (end - start) as usize;
                block.data[start as usize..end as usize]
                    .copy_from_slice(&data[src_start as usize..src_start as usize + len]);
                fit_blocks += 1;
                fit_length += len as u32;
            }
        }

        if fit_blocks == 0 {
            bail!("flash_populate: unfit data block {addr:#010x} -> {:#06x}", data.len());
        }
        if fit_length != data.len() as u32 {
            warn!(
                "flash_populate: data block {addr:#010x} -> {:#06x} truncated to {fit_length:#06x} (not an error, just a GDB glitch)",
                data.len()
            );
        }

        Ok(())
    }

    /// `vFlashDone` — erase every page, write every page, stop the loader,
    /// soft-reset-and-halt. Stages are always drained, win or lose.
    pub fn commit(&mut self, probe: &mut dyn Probe, connect_mode: ConnectMode) -> Result<()> {
        let result = self.commit_inner(probe, connect_mode);
        self.blocks.clear();
        result
    }

    fn commit_inner(&mut self, probe: &mut dyn Probe, connect_mode: ConnectMode) -> Result<()> {
        probe.connect(connect_mode)?;
        probe.force_debug()?;

        for block in &self.blocks {
            info!("flash_erase: block {:#010x} -> {:#06x}", block.addr, block.data.len());
            let mut page = block.addr;
            while page < block.end() {
                let page_size = probe.calculate_pagesize(page)?;
                info!("flash_erase: page {page:#010x}");
                probe.erase_flash_page(page)?;
                page += page_size;
            }
        }

        probe.flashloader_start()?;

        for block in &self.blocks {
            info!("flash_do: block {:#010x} -> {:#06x}", block.addr, block.data.len());
            let mut page = block.addr;
            while page < block.end() {
                let page_size = probe.calculate_pagesize(page)?;
                let offset = (page - block.addr) as usize;
                let remaining = block.data.len() - offset;
                let len = remaining.min(page_size as usize);
                info!("flash_do: page {page:#010x}");
                probe.flashloader_write(page, &block.data[offset..offset + len])?;
                page += page_size;
            }
        }

        probe.flashloader_stop()?;
        probe.reset(ResetKind::SoftAndHalt)?;
        Ok(())
    }
}
