// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The session dispatcher (spec.md §4.1): owns one client's debug-session
//! state and demultiplexes RSP packets onto the breakpoint/watchpoint
//! engines, flash staging, cache sync and the semihosting trap loop. This
//! is the "process-wide tables are session state in disguise" module the
//! Design Notes call out — every piece of mutable state the original
//! `st-util` kept as file-scope globals lives as a field of [`Session`].

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};
use log::{debug, error, info, warn};

use crate::breakpoints::BreakpointEngine;
use crate::cache::CacheDescriptor;
use crate::flash::FlashStaging;
use crate::memory_map;
use crate::probe::{
    ConnectMode, Probe, ProbeFactory, ProbeOpenParams, ResetKind, TargetStatus,
};
use crate::registers;
use crate::rsp_framing;
use crate::watchpoints::{WatchFunction, WatchpointEngine};

const SEMIHOST_BKPT: u16 = 0xBEAB;
const SEMIHOST_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How often [`serve`]'s per-packet loop wakes up to recheck the shutdown
/// flag while the client is otherwise idle (spec.md §5 cancellation (b)).
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// What the per-packet loop in [`serve`] should do after one `dispatch`.
pub enum DispatchOutcome {
    /// Send this payload back to the client and keep serving.
    Reply(Vec<u8>),
    /// `k`: no reply is sent at all.
    NoReply,
    /// Send this payload, then close the client connection (step failure).
    CriticalClose(Vec<u8>),
    /// `k`'s probe reopen failed: the whole process must clean up and exit.
    Fatal,
    /// A process shutdown signal arrived while servicing this packet (or
    /// the `c` trap loop); the caller must leave the target running, exit
    /// debug mode, close the probe, and exit the process.
    ShutdownRequested,
}

/// What [`serve`] returned control to its caller for.
pub enum ServeOutcome {
    /// The client disconnected (or a transport/critical error closed it).
    Disconnected,
    /// A `k` reopen failure; the caller must clean up and exit the process.
    Fatal,
    /// A process shutdown signal arrived; the caller must clean up (leave
    /// the target running, exit debug mode, close the probe) and exit.
    ShutdownRequested,
}

pub struct Session {
    probe: Box<dyn Probe>,
    bp: BreakpointEngine,
    wp: WatchpointEngine,
    cache: CacheDescriptor,
    flash: FlashStaging,

    connect_mode: ConnectMode,
    pub persistent: bool,
    semihosting_enabled: bool,
    attached: bool,
    memory_map_xml: String,

    open_params: ProbeOpenParams,
    probe_factory: ProbeFactory,
}

impl Session {
    /// Target-connect, initialise the BP/WP tables and the cache
    /// descriptor, and build the memory map — the per-accept setup
    /// sequence from spec.md §2's control-flow summary.
    pub fn new(
        mut probe: Box<dyn Probe>,
        connect_mode: ConnectMode,
        persistent: bool,
        semihosting_enabled: bool,
        open_params: ProbeOpenParams,
        probe_factory: ProbeFactory,
    ) -> Result<Session> {
        probe.connect(connect_mode)?;
        probe.force_debug()?;

        let bp = BreakpointEngine::init(probe.as_mut())?;
        let wp = WatchpointEngine::init(probe.as_mut())?;
        let cache = CacheDescriptor::init(probe.as_mut())?;
        let memory_map_xml = memory_map::build(&probe.chip());

        info!("GDB connected.");

        Ok(Session {
            probe,
            bp,
            wp,
            cache,
            flash: FlashStaging::new(),
            connect_mode,
            persistent,
            semihosting_enabled,
            attached: true,
            memory_map_xml,
            open_params,
            probe_factory,
        })
    }

    /// Reclaims the probe handle so the next accepted client (in
    /// persistent/`-m` mode) can reuse the same physical connection
    /// instead of the binary reopening it from scratch.
    pub fn into_probe(self) -> Box<dyn Probe> {
        self.probe
    }

    fn reinit_bp_wp(&mut self) -> Result<()> {
        self.bp = BreakpointEngine::init(self.probe.as_mut())?;
        self.wp = WatchpointEngine::init(self.probe.as_mut())?;
        Ok(())
    }

    pub fn dispatch(
        &mut self,
        packet: &[u8],
        stream: &mut TcpStream,
        shutdown: &AtomicBool,
    ) -> DispatchOutcome {
        if packet.is_empty() {
            return DispatchOutcome::Reply(Vec::new());
        }
        debug!("recv: {}", String::from_utf8_lossy(packet));

        match packet[0] {
            b'?' => {
                let reply = if self.attached { "S05" } else { "OK" };
                DispatchOutcome::Reply(reply.into())
            }
            b'!' => {
                self.persistent = true;
                DispatchOutcome::Reply(b"OK".to_vec())
            }
            b'g' => self.cmd_read_all_regs(),
            b'G' => self.cmd_write_all_regs(packet),
            b'p' => self.cmd_read_one_reg(packet),
            b'P' => self.cmd_write_one_reg(packet),
            b'm' => self.cmd_read_mem(packet),
            b'M' => self.cmd_write_mem(packet),
            b'c' => self.cmd_continue(stream, shutdown),
            b's' => self.cmd_step(),
            b'Z' => self.cmd_insert_point(packet),
            b'z' => self.cmd_remove_point(packet),
            b'R' => self.cmd_reset(),
            b'k' => self.cmd_kill(),
            b'q' => self.cmd_query(packet),
            b'v' => self.cmd_v(packet),
            _ => DispatchOutcome::Reply(Vec::new()),
        }
    }

    // ---- g / G / p / P ---------------------------------------------

    fn cmd_read_all_regs(&mut self) -> DispatchOutcome {
        match self.probe.read_all_regs() {
            Ok(regs) => DispatchOutcome::Reply(registers::encode_all(&regs).into_bytes()),
            Err(e) => {
                error!("g: read_all_regs failed: {e:#}");
                DispatchOutcome::Reply(b"E00".to_vec())
            }
        }
    }

    fn cmd_write_all_regs(&mut self, packet: &[u8]) -> DispatchOutcome {
        let hex = String::from_utf8_lossy(&packet[1..]);
        let regs = match registers::decode_all(&hex) {
            Ok(r) => r,
            Err(_) => return DispatchOutcome::Reply(b"E00".to_vec()),
        };
        for (i, &v) in regs.iter().enumerate() {
            if let Err(e) = self.probe.write_reg(v, i as u32) {
                error!("G: write_reg failed: {e:#}");
            }
        }
        DispatchOutcome::Reply(b"OK".to_vec())
    }

    fn cmd_read_one_reg(&mut self, packet: &[u8]) -> DispatchOutcome {
        let text = String::from_utf8_lossy(&packet[1..]);
        let Ok(id) = u32::from_str_radix(text.trim(), 16) else {
            return DispatchOutcome::Reply(b"E00".to_vec());
        };
        match registers::read_by_id(self.probe.as_mut(), id) {
            Ok(value) => DispatchOutcome::Reply(format!("{value:08x}").into_bytes()),
            Err(e) => {
                debug!("p: could not read register {id:#x}: {e:#}");
                DispatchOutcome::Reply(b"E00".to_vec())
            }
        }
    }

    fn cmd_write_one_reg(&mut self, packet: &[u8]) -> DispatchOutcome {
        let text = String::from_utf8_lossy(&packet[1..]);
        let Some((id_str, value_str)) = text.split_once('=') else {
            return DispatchOutcome::Reply(b"E00".to_vec());
        };
        let (Ok(id), Ok(value)) = (
            u32::from_str_radix(id_str, 16),
            u32::from_str_radix(value_str.trim(), 16),
        ) else {
            return DispatchOutcome::Reply(b"E00".to_vec());
        };
        match registers::write_by_id(self.probe.as_mut(), id, value) {
            Ok(()) => DispatchOutcome::Reply(b"OK".to_vec()),
            Err(e) => {
                debug!("P: could not write register {id:#x}: {e:#}");
                DispatchOutcome::Reply(b"E00".to_vec())
            }
        }
    }

    // ---- m / M --------------------------------------------------------

    fn cmd_read_mem(&mut self, packet: &[u8]) -> DispatchOutcome {
        let text = String::from_utf8_lossy(&packet[1..]);
        let Some((addr_str, len_str)) = text.split_once(',') else {
            return DispatchOutcome::Reply(Vec::new());
        };
        let (Ok(start), Ok(mut len)) = (
            u32::from_str_radix(addr_str, 16),
            u32::from_str_radix(len_str.trim(), 16),
        ) else {
            return DispatchOutcome::Reply(Vec::new());
        };

        let adj = start % 4;
        let start_aligned = start - adj;
        let mut count_rnd = (len + adj).div_ceil(4) * 4;

        let page_size = self.probe.calculate_pagesize(start).unwrap_or(0x400);
        count_rnd = count_rnd.min(page_size).min(0x1800);
        if count_rnd < len {
            len = count_rnd;
        }

        let bytes = match self.probe.read_mem32(start_aligned, count_rnd) {
            Ok(b) => b,
            Err(e) => {
                error!("m: read_mem32 failed: {e:#}");
                Vec::new()
            }
        };

        let mut hex = String::new();
        if bytes.len() as u32 >= adj + len {
            for &b in &bytes[adj as usize..(adj + len) as usize] {
                hex.push_str(&format!("{b:02x}"));
            }
        }
        DispatchOutcome::Reply(hex.into_bytes())
    }

    fn cmd_write_mem(&mut self, packet: &[u8]) -> DispatchOutcome {
        let Some(colon) = packet.iter().position(|&b| b == b':') else {
            return DispatchOutcome::Reply(b"E00".to_vec());
        };
        let header = String::from_utf8_lossy(&packet[1..colon]);
        let Some((addr_str, len_str)) = header.split_once(',') else {
            return DispatchOutcome::Reply(b"E00".to_vec());
        };
        let (Ok(mut start), Ok(mut count)) = (
            u32::from_str_radix(addr_str, 16),
            u32::from_str_radix(len_str.trim(), 16),
        ) else {
            return DispatchOutcome::Reply(b"E00".to_vec());
        };

        let hexdata = String::from_utf8_lossy(&packet[colon + 1..]);
        let Ok(data) = unhexify(&hexdata) else {
            return DispatchOutcome::Reply(b"E00".to_vec());
        };
        count = count.min(data.len() as u32);
        let mut cursor = 0usize;
        let mut err = false;

        if start % 4 != 0 {
            let mut align_count = 4 - (start % 4);
            align_count = align_count.min(count);
            let chunk = &data[cursor..cursor + align_count as usize];
            if self.probe.write_mem8(start, chunk).is_err() {
                err = true;
            }
            self.cache.note_write(align_count);
            start += align_count;
            count -= align_count;
            cursor += align_count as usize;
        }

        let aligned_count = count - count % 4;
        if aligned_count > 0 {
            let chunk = &data[cursor..cursor + aligned_count as usize];
            if self.probe.write_mem32(start, chunk).is_err() {
                err = true;
            }
            self.cache.note_write(aligned_count);
            start += aligned_count;
            count -= aligned_count;
            cursor += aligned_count as usize;
        }

        if count > 0 {
            let chunk = &data[cursor..cursor + count as usize];
            if self.probe.write_mem8(start, chunk).is_err() {
                err = true;
            }
            self.cache.note_write(count);
        }

        DispatchOutcome::Reply(if err { b"E00".to_vec() } else { b"OK".to_vec() })
    }

    // ---- c / s ----------------------------------------------------------

    fn cmd_continue(&mut self, stream: &mut TcpStream, shutdown: &AtomicBool) -> DispatchOutcome {
        if let Err(e) = self.cache.sync(self.probe.as_mut()) {
            error!("c: cache_sync failed: {e:#}");
        }
        if let Err(e) = self.probe.run() {
            debug!("Semihost: run failed: {e:#}");
        }

        loop {
            if shutdown.load(Ordering::SeqCst) {
                // Target is already running free; leave it that way and
                // let the caller's cleanup path exit debug mode and close
                // the probe (spec.md §5 cancellation (b)).
                return DispatchOutcome::ShutdownRequested;
            }

            match rsp_framing::check_for_interrupt(stream) {
                Ok(true) => {
                    let _ = self.probe.force_debug();
                    return DispatchOutcome::Reply(b"S05".to_vec());
                }
                Ok(false) => {}
                Err(e) => {
                    error!("cannot check for interrupt: {e:#}");
                    return DispatchOutcome::CriticalClose(Vec::new());
                }
            }

            let status = self.probe.status();
            if let Err(e) = &status {
                debug!("Semihost: status failed: {e:#}");
            }

            if matches!(status, Ok(TargetStatus::Halted)) {
                if !self.semihosting_enabled {
                    return DispatchOutcome::Reply(b"S05".to_vec());
                }

                match self.try_service_semihosting() {
                    Ok(true) => {} // serviced; loop again
                    Ok(false) => return DispatchOutcome::Reply(b"S05".to_vec()),
                    Err(e) => {
                        debug!("Semihost: servicing failed: {e:#}");
                        return DispatchOutcome::Reply(b"S05".to_vec());
                    }
                }
            }

            thread::sleep(SEMIHOST_POLL_INTERVAL);
        }
    }

    /// Services one `BKPT #0xAB` if the target is sitting on one; returns
    /// `Ok(true)` if it resumed the target, `Ok(false)` if the halt was a
    /// real stop GDB should see (spec.md §4.6).
    fn try_service_semihosting(&mut self) -> Result<bool> {
        let regs = self.probe.read_all_regs()?;
        let pc = regs.r[15];
        let offset = pc % 4;
        let addr = pc - offset;
        let read_len = if offset > 2 { 8 } else { 4 };

        let buf = self.probe.read_mem32(addr, read_len)?;
        let insn = u16::from_le_bytes([buf[offset as usize], buf[offset as usize + 1]]);

        if insn != SEMIHOST_BKPT || self.bp.has_breakpoint(addr) {
            return Ok(false);
        }

        let new_r0 = self.probe.semihost(regs.r[0], regs.r[1])?;
        self.probe.write_reg(new_r0, 0)?;
        self.probe.write_reg(pc + 2, 15)?;
        self.cache.sync(self.probe.as_mut())?;
        self.probe.run()?;
        Ok(true)
    }

    fn cmd_step(&mut self) -> DispatchOutcome {
        if let Err(e) = self.cache.sync(self.probe.as_mut()) {
            error!("s: cache_sync failed: {e:#}");
        }
        match self.probe.step() {
            Ok(()) => DispatchOutcome::Reply(b"S05".to_vec()),
            Err(e) => {
                error!("Step: cannot send step request: {e:#}");
                DispatchOutcome::CriticalClose(b"E00".to_vec())
            }
        }
    }

    // ---- Z / z ------------------------------------------------------------

    fn cmd_insert_point(&mut self, packet: &[u8]) -> DispatchOutcome {
        let Some((kind, addr, len)) = parse_point(packet) else {
            return DispatchOutcome::Reply(Vec::new());
        };
        let result = match kind {
            b'1' => self.bp.update(self.probe.as_mut(), addr, true),
            b'2' => self
                .wp
                .insert(self.probe.as_mut(), WatchFunction::Write, addr, len),
            b'3' => self
                .wp
                .insert(self.probe.as_mut(), WatchFunction::Read, addr, len),
            b'4' => self
                .wp
                .insert(self.probe.as_mut(), WatchFunction::Access, addr, len),
            _ => return DispatchOutcome::Reply(Vec::new()),
        };
        DispatchOutcome::Reply(ok_or_e00(result))
    }

    fn cmd_remove_point(&mut self, packet: &[u8]) -> DispatchOutcome {
        let Some((kind, addr, _len)) = parse_point(packet) else {
            return DispatchOutcome::Reply(Vec::new());
        };
        let result = match kind {
            b'1' => self.bp.update(self.probe.as_mut(), addr, false),
            b'2' | b'3' | b'4' => self.wp.remove(self.probe.as_mut(), addr),
            _ => return DispatchOutcome::Reply(Vec::new()),
        };
        DispatchOutcome::Reply(ok_or_e00(result))
    }

    // ---- R / k --------------------------------------------------------

    fn cmd_reset(&mut self) -> DispatchOutcome {
        if let Err(e) = self.probe.reset(ResetKind::SoftAndHalt) {
            debug!("R packet: reset failed: {e:#}");
        }
        if let Err(e) = self.reinit_bp_wp() {
            error!("R packet: re-init BP/WP failed: {e:#}");
        }
        self.attached = true;
        DispatchOutcome::Reply(b"OK".to_vec())
    }

    fn cmd_kill(&mut self) -> DispatchOutcome {
        if let Err(e) = self.probe.run() {
            debug!("Kill: run failed: {e:#}");
        }
        if let Err(e) = self.probe.exit_debug_mode() {
            debug!("Kill: exit_debug_mode failed: {e:#}");
        }
        let _ = self.probe.close();

        match (self.probe_factory)(&self.open_params) {
            Ok(mut new_probe) => {
                if let Err(e) = new_probe.force_debug() {
                    debug!("Kill: force_debug failed: {e:#}");
                }
                self.probe = new_probe;
                if let Err(e) = self.cache_and_bp_wp_reinit() {
                    error!("Kill: re-init after reopen failed: {e:#}");
                    return DispatchOutcome::Fatal;
                }
                DispatchOutcome::NoReply
            }
            Err(e) => {
                error!("Kill: reopening probe failed: {e:#}");
                DispatchOutcome::Fatal
            }
        }
    }

    fn cache_and_bp_wp_reinit(&mut self) -> Result<()> {
        self.cache = CacheDescriptor::init(self.probe.as_mut())?;
        self.reinit_bp_wp()
    }

    // ---- q ------------------------------------------------------------

    fn cmd_query(&mut self, packet: &[u8]) -> DispatchOutcome {
        let rest = String::from_utf8_lossy(&packet[1..]).into_owned();

        // `qP`/`qC`/`qL` reply empty, matching the original's early check on
        // the byte right after 'q' before any general parsing happens.
        if rest.starts_with('P') || rest.starts_with('C') || rest.starts_with('L') {
            return DispatchOutcome::Reply(Vec::new());
        }

        let (name, params) = match rest.split_once(':') {
            Some((n, p)) => (n, p),
            None => (rest.as_str(), ""),
        };

        if name == "Supported" {
            return DispatchOutcome::Reply(
                b"PacketSize=3fff;qXfer:memory-map:read+;qXfer:features:read+".to_vec(),
            );
        }

        if name == "Xfer" {
            return self.cmd_xfer(params);
        }

        // Open Question (spec.md §9): the original's `strncmp(name, "Rcmd,",
        // 4)` compares only 4 of the 5 literal characters; we match the
        // full 5-char prefix as the spec resolves that ambiguity.
        if name.starts_with("Rcmd,") || rest.starts_with("Rcmd,") {
            let hex_part = if let Some(stripped) = rest.strip_prefix("Rcmd,") {
                stripped
            } else {
                ""
            };
            return self.cmd_monitor(hex_part);
        }

        DispatchOutcome::Reply(Vec::new())
    }

    fn cmd_xfer(&mut self, params: &str) -> DispatchOutcome {
        let mut parts = params.splitn(4, ':');
        let ty = parts.next().unwrap_or("");
        let op = parts.next().unwrap_or("");
        let _annex = parts.next().unwrap_or("");
        let addr_len = parts.next().unwrap_or("");

        if op != "read" {
            return DispatchOutcome::Reply(Vec::new());
        }

        let Some((addr_str, len_str)) = addr_len.split_once(',') else {
            return DispatchOutcome::Reply(Vec::new());
        };
        let (Ok(addr), Ok(len)) = (
            u32::from_str_radix(addr_str, 16),
            u32::from_str_radix(len_str.trim(), 16),
        ) else {
            return DispatchOutcome::Reply(Vec::new());
        };

        let doc: &str = match ty {
            "memory-map" => &self.memory_map_xml,
            "features" => registers::target_description_xml(),
            _ => return DispatchOutcome::Reply(Vec::new()),
        };

        DispatchOutcome::Reply(memory_map::xfer_chunk(doc, addr, len).into_bytes())
    }

    fn cmd_monitor(&mut self, hex: &str) -> DispatchOutcome {
        let Ok(raw) = unhexify(hex) else {
            return DispatchOutcome::Reply(Vec::new());
        };
        let cmd = String::from_utf8_lossy(&raw).into_owned();
        let cmd = cmd.trim_end_matches('\0');
        debug!("unhexified Rcmd: '{cmd}'");

        if let Some(rest) = cmd.strip_prefix("resume") {
            let _ = rest;
            if let Err(e) = self.cache.sync(self.probe.as_mut()) {
                error!("Rcmd resume: cache_sync failed: {e:#}");
            }
            return DispatchOutcome::Reply(ok_or_e00(self.probe.run()));
        }
        if cmd.starts_with("halt") {
            return DispatchOutcome::Reply(ok_or_e00(self.probe.force_debug()));
        }
        if cmd.starts_with("jtag_reset") {
            let mut result = self.probe.reset(ResetKind::Hard);
            if result.is_ok() {
                result = self.probe.force_debug();
            }
            return DispatchOutcome::Reply(ok_or_e00(result));
        }
        if cmd.starts_with("reset") {
            let mut result = self.probe.force_debug();
            if result.is_ok() {
                result = self.probe.reset(ResetKind::SoftAndHalt);
            }
            if let Err(e) = self.reinit_bp_wp() {
                error!("Rcmd reset: re-init BP/WP failed: {e:#}");
                result = Err(e);
            }
            return DispatchOutcome::Reply(ok_or_e00(result));
        }
        if let Some(arg) = cmd.strip_prefix("semihosting ") {
            let arg = arg.trim_start();
            if arg.starts_with("enable") || arg.starts_with('1') {
                self.semihosting_enabled = true;
                return DispatchOutcome::Reply(b"OK".to_vec());
            }
            if arg.starts_with("disable") || arg.starts_with('0') {
                self.semihosting_enabled = false;
                return DispatchOutcome::Reply(b"OK".to_vec());
            }
            warn!("Rcmd: unknown semihosting arg: '{arg}'");
            return DispatchOutcome::Reply(Vec::new());
        }

        debug!("Rcmd: {cmd}");
        DispatchOutcome::Reply(Vec::new())
    }

    // ---- v ------------------------------------------------------------

    fn cmd_v(&mut self, packet: &[u8]) -> DispatchOutcome {
        // `vFlashWrite:<addr>:<binary>` carries raw (non-UTF8-safe) binary
        // after its second colon, so find the command name and the first
        // colon at the byte level before decoding anything as text.
        let first_colon = packet.iter().position(|&b| b == b':' || b == b';');
        let name_end = first_colon.unwrap_or(packet.len());
        let name = String::from_utf8_lossy(&packet[1..name_end]).into_owned();
        let rest = &packet[name_end.min(packet.len())..];
        let params = if rest.is_empty() { &[][..] } else { &rest[1..] };

        match name.as_str() {
            "FlashErase" => self.cmd_flash_erase(params),
            "FlashWrite" => self.cmd_flash_write(params),
            "FlashDone" => self.cmd_flash_done(),
            "Kill" => {
                self.attached = false;
                DispatchOutcome::Reply(b"OK".to_vec())
            }
            _ => DispatchOutcome::Reply(Vec::new()),
        }
    }

    fn cmd_flash_erase(&mut self, params: &[u8]) -> DispatchOutcome {
        let text = String::from_utf8_lossy(params);
        let Some((addr_str, len_str)) = text.split_once(',') else {
            return DispatchOutcome::Reply(b"E00".to_vec());
        };
        let (Ok(addr), Ok(len)) = (
            u32::from_str_radix(addr_str, 16),
            u32::from_str_radix(len_str.trim(), 16),
        ) else {
            return DispatchOutcome::Reply(b"E00".to_vec());
        };
        info!("FlashErase: addr:{addr:#010x},len:{len:#06x}");
        DispatchOutcome::Reply(ok_or_e00(self.flash.add_block(self.probe.as_mut(), addr, len)))
    }

    fn cmd_flash_write(&mut self, params: &[u8]) -> DispatchOutcome {
        let Some(colon) = params.iter().position(|&b| b == b':') else {
            return DispatchOutcome::Reply(b"E00".to_vec());
        };
        let addr_str = String::from_utf8_lossy(&params[..colon]);
        let Ok(addr) = u32::from_str_radix(&addr_str, 16) else {
            return DispatchOutcome::Reply(b"E00".to_vec());
        };
        let decoded = rsp_framing::binary_unescape(&params[colon + 1..]);
        DispatchOutcome::Reply(ok_or_e00(self.flash.populate(addr, &decoded)))
    }

    fn cmd_flash_done(&mut self) -> DispatchOutcome {
        match self.flash.commit(self.probe.as_mut(), self.connect_mode) {
            Ok(()) => DispatchOutcome::Reply(b"OK".to_vec()),
            Err(e) => {
                error!("FlashDone: commit failed: {e:#}");
                DispatchOutcome::Reply(b"E08".to_vec())
            }
        }
    }
}

fn ok_or_e00(result: Result<()>) -> Vec<u8> {
    match result {
        Ok(()) => b"OK".to_vec(),
        Err(_) => b"E00".to_vec(),
    }
}

/// Parses `Z<kind>,<addr>,<len>` / `z<kind>,<addr>,<len>`.
fn parse_point(packet: &[u8]) -> Option<(u8, u32, u32)> {
    if packet.len() < 3 {
        return None;
    }
    let kind = packet[1];
    let text = String::from_utf8_lossy(&packet[3..]);
    let (addr_str, len_str) = text.split_once(',')?;
    let addr = u32::from_str_radix(addr_str, 16).ok()?;
    let len = u32::from_str_radix(len_str.trim(), 16).ok()?;
    Some((kind, addr, len))
}

/// Decodes a `hex` string (two hex digits per byte) into raw bytes; used
/// both for `M`'s payload and `qRcmd,<hex>`'s monitor command text.
fn unhexify(hex: &str) -> Result<Vec<u8>> {
    let hex = hex.trim();
    if hex.len() % 2 != 0 {
        bail!("unhexify: odd-length hex string");
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    let mut i = 0;
    while i < hex.len() {
        out.push(u8::from_str_radix(&hex[i..i + 2], 16)?);
        i += 2;
    }
    Ok(out)
}

/// Wraps a live [`Session`] so a panic or early return while serving a
/// client still releases the target: run-normal, exit debug mode, close.
/// `Session` itself carries no `Drop` impl (so [`Session::into_probe`] can
/// move the handle out cleanly on the happy path via `k`'s reopen and the
/// end of a persistent accept loop); this guard supplies the unwind-safety
/// net spec.md §5/§9 calls for around the part of main that actually drives
/// a session to completion.
pub struct SessionGuard(Option<Session>);

impl SessionGuard {
    pub fn new(session: Session) -> Self {
        SessionGuard(Some(session))
    }

    pub fn get_mut(&mut self) -> &mut Session {
        self.0.as_mut().expect("SessionGuard used after being consumed")
    }

    /// Disarms the guard and reclaims the probe handle for reuse by the
    /// next accepted client.
    pub fn into_probe(mut self) -> Box<dyn Probe> {
        self.0.take().expect("SessionGuard used after being consumed").into_probe()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(session) = self.0.take() {
            let mut probe = session.probe;
            let _ = probe.run();
            let _ = probe.exit_debug_mode();
            let _ = probe.close();
        }
    }
}

/// Drives one client's packet loop: recv, dispatch, reply, repeat, until
/// the client disconnects or a critical/fatal outcome ends the session
/// (spec.md §2 control flow, §7 error propagation). `shutdown` is checked
/// at every loop boundary — between packets (via a bounded read timeout
/// on `stream`, since a blocking read with no timeout would never notice
/// it) and inside the `c` trap loop — so a process signal arriving while a
/// client is connected doesn't hang the session on a blocking read
/// (spec.md §5 cancellation (b)).
pub fn serve(
    stream: &mut TcpStream,
    session: &mut Session,
    shutdown: &AtomicBool,
) -> Result<ServeOutcome> {
    stream.set_read_timeout(Some(SHUTDOWN_POLL_INTERVAL))?;

    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(ServeOutcome::ShutdownRequested);
        }

        let packet = match rsp_framing::recv_packet(stream)? {
            rsp_framing::RecvOutcome::Packet(p) => p,
            rsp_framing::RecvOutcome::Disconnected => return Ok(ServeOutcome::Disconnected),
            rsp_framing::RecvOutcome::TimedOut => continue,
        };

        match session.dispatch(&packet, stream, shutdown) {
            DispatchOutcome::Reply(reply) => {
                debug!("send: {}", String::from_utf8_lossy(&reply));
                rsp_framing::send_packet(stream, &reply)?;
            }
            DispatchOutcome::NoReply => {}
            DispatchOutcome::CriticalClose(reply) => {
                if !reply.is_empty() {
                    rsp_framing::send_packet(stream, &reply)?;
                }
                return Ok(ServeOutcome::Disconnected);
            }
            DispatchOutcome::Fatal => return Ok(ServeOutcome::Fatal),
            DispatchOutcome::ShutdownRequested => return Ok(ServeOutcome::ShutdownRequested),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeOpenParams;
    use crate::testing::FakeProbe;
    use std::net::{TcpListener, TcpStream};

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    fn test_session() -> Session {
        let probe: Box<dyn Probe> = Box::new(FakeProbe::new());
        let factory: ProbeFactory = Box::new(|_| Ok(Box::new(FakeProbe::new())));
        Session::new(
            probe,
            ConnectMode::Normal,
            false,
            false,
            ProbeOpenParams {
                logging_level: 0,
                connect_mode: ConnectMode::Normal,
                serial: None,
                freq_hz: None,
            },
            factory,
        )
        .unwrap()
    }

    #[test]
    fn q_supported_matches_literal_scenario() {
        let mut session = test_session();
        let (mut server, _client) = loopback_pair();
        let shutdown = AtomicBool::new(false);
        match session.dispatch(b"qSupported", &mut server, &shutdown) {
            DispatchOutcome::Reply(r) => {
                assert_eq!(
                    r,
                    b"PacketSize=3fff;qXfer:memory-map:read+;qXfer:features:read+"
                );
            }
            _ => panic!("expected a reply"),
        }
    }

    #[test]
    fn insert_then_remove_breakpoint_clears_shadow_table() {
        let mut session = test_session();
        let (mut server, _client) = loopback_pair();
        let shutdown = AtomicBool::new(false);

        match session.dispatch(b"Z1,08000124,2", &mut server, &shutdown) {
            DispatchOutcome::Reply(r) => assert_eq!(r, b"OK"),
            _ => panic!(),
        }
        assert!(session.bp.has_breakpoint(0x0800_0124));

        match session.dispatch(b"z1,08000124,2", &mut server, &shutdown) {
            DispatchOutcome::Reply(r) => assert_eq!(r, b"OK"),
            _ => panic!(),
        }
        assert!(!session.bp.has_breakpoint(0x0800_0124));
    }

    #[test]
    fn misaligned_memory_write_round_trips() {
        let mut session = test_session();
        let (mut server, _client) = loopback_pair();
        let shutdown = AtomicBool::new(false);

        match session.dispatch(b"M20000001,3:AABBCC", &mut server, &shutdown) {
            DispatchOutcome::Reply(r) => assert_eq!(r, b"OK"),
            _ => panic!(),
        }
        match session.dispatch(b"m20000001,3", &mut server, &shutdown) {
            DispatchOutcome::Reply(r) => assert_eq!(r, b"aabbcc"),
            _ => panic!(),
        }
    }

    #[test]
    fn flash_sequence_round_trips() {
        let mut session = test_session();
        let (mut server, _client) = loopback_pair();
        let shutdown = AtomicBool::new(false);

        match session.dispatch(b"vFlashErase:08000000,400", &mut server, &shutdown) {
            DispatchOutcome::Reply(r) => assert_eq!(r, b"OK"),
            _ => panic!(),
        }

        let mut packet = b"vFlashWrite:08000000:".to_vec();
        packet.extend(vec![0xAB; 0x400]);
        match session.dispatch(&packet, &mut server, &shutdown) {
            DispatchOutcome::Reply(r) => assert_eq!(r, b"OK"),
            _ => panic!(),
        }

        match session.dispatch(b"vFlashDone", &mut server, &shutdown) {
            DispatchOutcome::Reply(r) => assert_eq!(r, b"OK"),
            _ => panic!(),
        }
        assert!(session.flash.is_empty());
    }

    #[test]
    fn unknown_command_replies_empty() {
        let mut session = test_session();
        let (mut server, _client) = loopback_pair();
        let shutdown = AtomicBool::new(false);
        match session.dispatch(b"Qfoo", &mut server, &shutdown) {
            DispatchOutcome::Reply(r) => assert!(r.is_empty()),
            _ => panic!(),
        }
    }

    #[test]
    fn register_write_then_read_round_trips() {
        let mut session = test_session();
        let (mut server, _client) = loopback_pair();
        let shutdown = AtomicBool::new(false);
        match session.dispatch(b"P19=0000abcd", &mut server, &shutdown) {
            DispatchOutcome::Reply(r) => assert_eq!(r, b"OK"),
            _ => panic!(),
        }
        match session.dispatch(b"p19", &mut server, &shutdown) {
            DispatchOutcome::Reply(r) => assert_eq!(r, b"0000abcd"),
            _ => panic!(),
        }
    }

    #[test]
    fn extended_mode_sets_persistent() {
        let mut session = test_session();
        let (mut server, _client) = loopback_pair();
        let shutdown = AtomicBool::new(false);
        assert!(!session.persistent);
        match session.dispatch(b"!", &mut server, &shutdown) {
            DispatchOutcome::Reply(r) => assert_eq!(r, b"OK"),
            _ => panic!(),
        }
        assert!(session.persistent);
    }

    #[test]
    fn continue_honors_shutdown_flag_without_halting() {
        let mut session = test_session();
        let (mut server, _client) = loopback_pair();
        let shutdown = AtomicBool::new(true);
        match session.dispatch(b"c", &mut server, &shutdown) {
            DispatchOutcome::ShutdownRequested => {}
            _ => panic!("expected ShutdownRequested"),
        }
    }
}
