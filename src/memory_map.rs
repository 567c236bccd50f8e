// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Builds the `qXfer:memory-map:read` XML document from the attached
//! chip's descriptor (spec.md §4.7). Template selection is a pure function
//! of `(chip_id, core_id)`, matching the original `st-util`'s `if`/`else if`
//! chain order — first match wins.

use crate::probe::ChipInfo;

// Chip/core identifiers as reported by the probe facade. Only the values
// this module switches on are named; the full chip-ID table is out of
// scope (§1) and owned by the probe's chip-identification collaborator.
const CHIPID_F4: u32 = 0x413;
const CHIPID_F446: u32 = 0x421;
const CHIPID_F411XX: u32 = 0x431;
const CHIPID_F4_DE: u32 = 0x419;
const CHIPID_F4_HD: u32 = 0x416;
const CHIPID_F2: u32 = 0x411;
const CHIPID_H74XXX: u32 = 0x450;
const CHIPID_H72X: u32 = 0x483;
const CHIPID_L4: u32 = 0x415;
const CHIPID_L43X_L44X: u32 = 0x435;
const CHIPID_L45X_L46X: u32 = 0x462;
const CHIPID_L496X_L4A6X: u32 = 0x461;
const CORE_ID_M7F_SWD: u32 = 0x5ba0_2477;

fn xml_header() -> &'static str {
    "<?xml version=\"1.0\"?><!DOCTYPE memory-map PUBLIC \"+//IDN gnu.org//DTD GDB Memory Map V1.0//EN\" \"http://sourceware.org/gdb/gdb-memory-map.dtd\">"
}

/// F2's flash is split into a run of small (16/64KB) sectors followed by a
/// run of uniform 128KB sectors; the boundary between them is fixed at
/// this offset (original `make_memory_map`'s F2 template, gdb-server.c
/// :370-374, passes `flash_size - 0x20000` as the second region's length).
const F2_SMALL_SECTOR_SPAN: u32 = 0x20000;
const F2_LARGE_SECTOR_SIZE: u32 = 0x20000;

/// Builds the per-family memory-map document; cached by the session for
/// the lifetime of the connection.
pub fn build(chip: &ChipInfo) -> String {
    let mut map = String::from(xml_header());
    map.push_str("<memory-map>");

    // These families all template out to the same shape (flash, then
    // SRAM, no separate system-memory region); the original's per-family
    // `.h` templates differ only in the literal header comment, not the
    // regions they declare, for this set.
    let flash_and_sram_only = chip.chip_id == CHIPID_F4
        || chip.chip_id == CHIPID_F446
        || chip.chip_id == CHIPID_F411XX
        || chip.chip_id == CHIPID_F4_DE
        || chip.core_id == CORE_ID_M7F_SWD
        || chip.chip_id == CHIPID_H74XXX
        || chip.chip_id == CHIPID_F4_HD
        || chip.chip_id == CHIPID_L4
        || chip.chip_id == CHIPID_L43X_L44X
        || chip.chip_id == CHIPID_L45X_L46X
        || chip.chip_id == CHIPID_L496X_L4A6X
        || chip.chip_id == CHIPID_H72X;

    if flash_and_sram_only {
        push_region(&mut map, "flash", FLASH_BASE, chip.flash_size, Some(chip.flash_pgsz));
        push_region(&mut map, "ram", SRAM_BASE, chip.sram_size, None);
    } else if chip.chip_id == CHIPID_F2 {
        let small_span = F2_SMALL_SECTOR_SPAN.min(chip.flash_size);
        push_region(&mut map, "flash", FLASH_BASE, small_span, Some(chip.flash_pgsz));
        push_region(
            &mut map,
            "flash",
            FLASH_BASE + small_span,
            chip.flash_size.saturating_sub(F2_SMALL_SECTOR_SPAN),
            Some(F2_LARGE_SECTOR_SIZE),
        );
        push_region(&mut map, "ram", SRAM_BASE, chip.sram_size, None);
        push_region(&mut map, "ram", chip.sys_base, chip.sys_size, None);
    } else {
        // Generic fallback: flash, SRAM, and the family's system memory.
        push_region(&mut map, "flash", FLASH_BASE, chip.flash_size, Some(chip.flash_pgsz));
        push_region(&mut map, "ram", SRAM_BASE, chip.sram_size, None);
        push_region(&mut map, "ram", chip.sys_base, chip.sys_size, None);
    }

    map.push_str("</memory-map>");
    map
}

const FLASH_BASE: u32 = 0x0800_0000;
const SRAM_BASE: u32 = 0x2000_0000;

fn push_region(map: &mut String, kind: &str, start: u32, length: u32, block_size: Option<u32>) {
    if length == 0 {
        return;
    }
    map.push_str(&format!(
        "<memory type=\"{kind}\" start=\"{start:#x}\" length=\"{length:#x}\">"
    ));
    if let Some(block_size) = block_size {
        map.push_str(&format!(
            "<property name=\"blocksize\">{block_size:#x}</property>"
        ));
    }
    map.push_str("</memory>");
}

/// Slices `[addr, addr+len)` of `doc`, prefixed per the `qXfer` convention:
/// `m` if more remains, `l` if this is the final (possibly empty) chunk.
pub fn xfer_chunk(doc: &str, addr: u32, len: u32) -> String {
    let bytes = doc.as_bytes();
    let addr = addr as usize;
    if addr >= bytes.len() {
        return "l".to_string();
    }
    let end = (addr + len as usize).min(bytes.len());
    let slice = &bytes[addr..end];
    let more = end < bytes.len();
    let mut out = String::with_capacity(slice.len() + 1);
    out.push(if more { 'm' } else { 'l' });
    out.push_str(&String::from_utf8_lossy(slice));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chip(chip_id: u32) -> ChipInfo {
        ChipInfo {
            chip_id,
            core_id: 0,
            flash_size: 0x10_0000,
            sram_size: 0x2_0000,
            flash_pgsz: 0x4000,
            sys_base: 0x1FFF_0000,
            sys_size: 0x7800,
        }
    }

    #[test]
    fn generic_fallback_includes_system_memory() {
        let doc = build(&chip(0xdead_beef));
        assert!(doc.contains("flash"));
        assert!(doc.contains("0x8000000"));
        assert!(doc.contains("0x1fff0000"));
    }

    #[test]
    fn f4_doesnt_include_a_separate_system_region() {
        let doc = build(&chip(CHIPID_F4));
        assert!(!doc.contains("0x1fff0000"));
    }

    #[test]
    fn f2_splits_flash_at_the_sector_size_boundary() {
        let doc = build(&chip(CHIPID_F2));
        // First region: small sectors, 0x20000 bytes starting at FLASH_BASE.
        assert!(doc.contains("start=\"0x8000000\" length=\"0x20000\""));
        // Second region: the rest of flash, starting right after it.
        assert!(doc.contains("start=\"0x8020000\" length=\"0xe0000\""));
        assert!(doc.contains("0x1fff0000"));
    }

    #[test]
    fn xfer_chunk_marks_last_chunk() {
        let doc = "0123456789";
        assert_eq!(xfer_chunk(doc, 0, 5), "m01234");
        assert_eq!(xfer_chunk(doc, 5, 5), "l56789");
        assert_eq!(xfer_chunk(doc, 10, 5), "l");
    }
}
