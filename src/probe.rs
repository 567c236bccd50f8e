// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The synchronous probe facade (§6.3): everything the session dispatcher
//! needs from the USB debug probe, chip-ID tables and flash loader. Those
//! are out of scope for this crate; `Probe` is the seam a real
//! implementation plugs into.

use anyhow::Result;

/// How the target is brought under debug control on attach/reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// Reset the target, then attach.
    Normal,
    /// Attach without touching the reset line.
    HotPlug,
    /// Assert reset, attach, and keep the target held in reset.
    UnderReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    Hard,
    SoftAndHalt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus {
    Halted,
    Running,
}

/// Everything `p`/`P`/`g`/`G` need, read or written in one shot.
///
/// Field names follow the GDB register numbering in spec.md §3: `r[0..16]`
/// are the core registers, and the rest are reached through GDB ids
/// 0x19..0x40.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterFile {
    pub r: [u32; 16],
    pub xpsr: u32,
    pub main_sp: u32,
    pub process_sp: u32,
    pub control: u32,
    pub faultmask: u32,
    pub basepri: u32,
    pub primask: u32,
    pub s: [u32; 32],
    pub fpscr: u32,
}

/// Static identity of the attached chip, as reported by the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipInfo {
    pub chip_id: u32,
    pub core_id: u32,
    pub flash_size: u32,
    pub sram_size: u32,
    /// Initial flash page size; the true value is address-dependent on
    /// STM32 and must be refreshed with `calculate_pagesize` before use.
    pub flash_pgsz: u32,
    pub sys_base: u32,
    pub sys_size: u32,
}

/// Parameters needed to (re-)open a probe; stored by the session so that
/// `k` (kill) can close and reopen the same physical probe in place.
#[derive(Debug, Clone)]
pub struct ProbeOpenParams {
    pub logging_level: i32,
    pub connect_mode: ConnectMode,
    pub serial: Option<String>,
    pub freq_hz: Option<u32>,
}

/// Synchronous per-call access to one attached target.
///
/// Every method blocks until the probe transaction completes or fails.
/// Memory-write methods borrow the data for the duration of the call only:
/// no implementation may retain a reference to a passed-in slice after
/// returning, and callers are free to reuse or drop their buffer
/// immediately afterward (resolving the shared-buffer question noted in
/// spec.md §9).
pub trait Probe {
    fn connect(&mut self, mode: ConnectMode) -> Result<()>;
    fn force_debug(&mut self) -> Result<()>;
    /// Resume normal (free) execution.
    fn run(&mut self) -> Result<()>;
    fn step(&mut self) -> Result<()>;
    fn status(&mut self) -> Result<TargetStatus>;
    fn reset(&mut self, kind: ResetKind) -> Result<()>;
    fn exit_debug_mode(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;

    fn read_all_regs(&mut self) -> Result<RegisterFile>;
    /// Read register `i`: 0..16 are the core registers `r0..r15`; 16..19
    /// additionally reach `xpsr`/`msp`/`psp`, which GDB addresses as ids
    /// 0x19/0x1a/0x1b but which the probe still treats as "regular" reads.
    fn read_reg(&mut self, i: u32) -> Result<u32>;
    /// Read a register only reachable through the GDB-id path (0x19..0x40).
    fn read_unsupported_reg(&mut self, id: u32) -> Result<u32>;
    fn write_reg(&mut self, value: u32, i: u32) -> Result<()>;
    fn write_unsupported_reg(&mut self, value: u32, id: u32) -> Result<()>;

    fn read_mem32(&mut self, addr: u32, len: u32) -> Result<Vec<u8>>;
    fn write_mem32(&mut self, addr: u32, data: &[u8]) -> Result<()>;
    fn write_mem8(&mut self, addr: u32, data: &[u8]) -> Result<()>;

    fn read_debug32(&mut self, addr: u32) -> Result<u32>;
    fn write_debug32(&mut self, addr: u32, val: u32) -> Result<()>;

    /// Page size at `addr`; address-dependent on STM32 families.
    fn calculate_pagesize(&mut self, addr: u32) -> Result<u32>;
    fn erased_pattern(&self) -> u8;
    fn erase_flash_page(&mut self, addr: u32) -> Result<()>;
    fn flashloader_start(&mut self) -> Result<()>;
    fn flashloader_write(&mut self, addr: u32, data: &[u8]) -> Result<()>;
    fn flashloader_stop(&mut self) -> Result<()>;

    /// Dispatch one semihosting call; returns the value to write into r0.
    fn semihost(&mut self, r0: u32, r1: u32) -> Result<u32>;

    fn chip(&self) -> ChipInfo;
}

/// Opens a fresh probe connection; supplied by the binary's entry point so
/// that `Session` can reopen the same physical probe on `k` without this
/// crate depending on the concrete transport.
pub type ProbeFactory = Box<dyn Fn(&ProbeOpenParams) -> Result<Box<dyn Probe>>>;
