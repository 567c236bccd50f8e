// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory [`Probe`] double used only by tests (both the per-module
//! unit tests throughout this crate and the dispatcher-level integration
//! tests in `session.rs`). Exercises the breakpoint/watchpoint engines,
//! flash staging and cache sync without real hardware.

use std::collections::HashMap;

use anyhow::{bail, Result};

use crate::probe::{
    ChipInfo, ConnectMode, Probe, RegisterFile, ResetKind, TargetStatus,
};

pub struct FakeProbe {
    pub regs: RegisterFile,
    pub debug32: HashMap<u32, u32>,
    pub mem: HashMap<u32, u8>,
    pub status: TargetStatus,

    pub fp_ctrl_raw: u32,
    pub ctr: u32,
    pub ccr: u32,

    pub page_size: u32,
    pub erased_pattern: u8,
    pub erased_pages: Vec<u32>,
    pub loader_writes: Vec<(u32, usize)>,
    pub loader_running: bool,

    pub fail_erase: bool,
    pub fail_write: bool,
    pub fail_step: bool,
    pub fail_read_mem: bool,

    pub connect_calls: u32,
    pub run_calls: u32,
    pub force_debug_calls: u32,
    pub reopen_count: u32,

    pub semihost_calls: Vec<(u32, u32)>,
    pub semihost_reply: u32,
}

impl FakeProbe {
    pub fn new() -> Self {
        FakeProbe {
            regs: RegisterFile::default(),
            debug32: HashMap::new(),
            mem: HashMap::new(),
            status: TargetStatus::Halted,

            fp_ctrl_raw: 6 << 4, // 6 comparator slots, FPB rev v1
            ctr: 0,              // no cache by default
            ccr: 0,

            page_size: 0x400,
            erased_pattern: 0xff,
            erased_pages: Vec::new(),
            loader_writes: Vec::new(),
            loader_running: false,

            fail_erase: false,
            fail_write: false,
            fail_step: false,
            fail_read_mem: false,

            connect_calls: 0,
            run_calls: 0,
            force_debug_calls: 0,
            reopen_count: 0,

            semihost_calls: Vec::new(),
            semihost_reply: 0,
        }
    }

    pub fn write_mem_direct(&mut self, addr: u32, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            self.mem.insert(addr + i as u32, b);
        }
    }
}

impl Default for FakeProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for FakeProbe {
    fn connect(&mut self, _mode: ConnectMode) -> Result<()> {
        self.connect_calls += 1;
        Ok(())
    }

    fn force_debug(&mut self) -> Result<()> {
        self.force_debug_calls += 1;
        self.status = TargetStatus::Halted;
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        self.run_calls += 1;
        self.status = TargetStatus::Running;
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        if self.fail_step {
            bail!("fake step failure");
        }
        Ok(())
    }

    fn status(&mut self) -> Result<TargetStatus> {
        Ok(self.status)
    }

    fn reset(&mut self, _kind: ResetKind) -> Result<()> {
        self.status = TargetStatus::Halted;
        Ok(())
    }

    fn exit_debug_mode(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_all_regs(&mut self) -> Result<RegisterFile> {
        Ok(self.regs)
    }

    fn read_reg(&mut self, i: u32) -> Result<u32> {
        match i {
            0..=15 => Ok(self.regs.r[i as usize]),
            16 => Ok(self.regs.xpsr),
            17 => Ok(self.regs.main_sp),
            18 => Ok(self.regs.process_sp),
            _ => bail!("read_reg: index {i} out of range"),
        }
    }

    fn read_unsupported_reg(&mut self, id: u32) -> Result<u32> {
        match id {
            0x1c => Ok(self.regs.control),
            0x1d => Ok(self.regs.faultmask),
            0x1e => Ok(self.regs.basepri),
            0x1f => Ok(self.regs.primask),
            0x20..=0x3f => Ok(self.regs.s[(id - 0x20) as usize]),
            0x40 => Ok(self.regs.fpscr),
            _ => bail!("read_unsupported_reg: id {id:#x} out of range"),
        }
    }

    fn write_reg(&mut self, value: u32, i: u32) -> Result<()> {
        match i {
            0..=15 => self.regs.r[i as usize] = value,
            16 => self.regs.xpsr = value,
            17 => self.regs.main_sp = value,
            18 => self.regs.process_sp = value,
            _ => bail!("write_reg: index {i} out of range"),
        }
        Ok(())
    }

    fn write_unsupported_reg(&mut self, value: u32, id: u32) -> Result<()> {
        match id {
            0x1c => self.regs.control = value,
            0x1d => self.regs.faultmask = value,
            0x1e => self.regs.basepri = value,
            0x1f => self.regs.primask = value,
            0x20..=0x3f => self.regs.s[(id - 0x20) as usize] = value,
            0x40 => self.regs.fpscr = value,
            _ => bail!("write_unsupported_reg: id {id:#x} out of range"),
        }
        Ok(())
    }

    fn read_mem32(&mut self, addr: u32, len: u32) -> Result<Vec<u8>> {
        if self.fail_read_mem {
            bail!("fake read_mem32 failure");
        }
        Ok((0..len)
            .map(|i| *self.mem.get(&(addr + i)).unwrap_or(&0))
            .collect())
    }

    fn write_mem32(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.write_mem_direct(addr, data);
        Ok(())
    }

    fn write_mem8(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.write_mem_direct(addr, data);
        Ok(())
    }

    fn read_debug32(&mut self, addr: u32) -> Result<u32> {
        if addr == crate::arm_debug::CM7_CTR {
            return Ok(self.ctr);
        }
        if addr == crate::arm_debug::CM7_CCR {
            return Ok(self.ccr);
        }
        if addr == crate::arm_debug::FP_CTRL {
            return Ok(self.fp_ctrl_raw);
        }
        Ok(*self.debug32.get(&addr).unwrap_or(&0))
    }

    fn write_debug32(&mut self, addr: u32, val: u32) -> Result<()> {
        self.debug32.insert(addr, val);
        Ok(())
    }

    fn calculate_pagesize(&mut self, _addr: u32) -> Result<u32> {
        Ok(self.page_size)
    }

    fn erased_pattern(&self) -> u8 {
        self.erased_pattern
    }

    fn erase_flash_page(&mut self, addr: u32) -> Result<()> {
        if self.fail_erase {
            bail!("fake erase failure");
        }
        self.erased_pages.push(addr);
        Ok(())
    }

    fn flashloader_start(&mut self) -> Result<()> {
        self.loader_running = true;
        Ok(())
    }

    fn flashloader_write(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        if self.fail_write {
            bail!("fake flashloader_write failure");
        }
        self.loader_writes.push((addr, data.len()));
        Ok(())
    }

    fn flashloader_stop(&mut self) -> Result<()> {
        self.loader_running = false;
        Ok(())
    }

    fn semihost(&mut self, r0: u32, r1: u32) -> Result<u32> {
        self.semihost_calls.push((r0, r1));
        Ok(self.semihost_reply)
    }

    fn chip(&self) -> ChipInfo {
        ChipInfo {
            chip_id: 0x413,
            core_id: 0,
            flash_size: 0x10_0000,
            sram_size: 0x2_0000,
            flash_pgsz: self.page_size,
            sys_base: 0x1fff_0000,
            sys_size: 0x7800,
        }
    }
}
