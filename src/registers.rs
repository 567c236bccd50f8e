// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! GDB register-id mapping and wire encoding (spec.md §3 "Register view").
//! `g`/`G` move all 16 core registers; `p`/`P` move one register addressed
//! by a GDB id that may land on the core bank or on the "unsupported"
//! (xPSR/FP) bank reached through `read_unsupported_reg`/
//! `write_unsupported_reg`.

use anyhow::{bail, Result};

use crate::probe::{Probe, RegisterFile};

/// The static `qXfer:features:read` document: an ARM m-profile target
/// description naming every register `p`/`P`/`g`/`G` can reach, in GDB's
/// `regnum` numbering. Reproduced verbatim from the original `st-util`
/// target description (spec.md §3, §6.1).
pub fn target_description_xml() -> &'static str {
    concat!(
        "<?xml version=\"1.0\"?>",
        "<!DOCTYPE target SYSTEM \"gdb-target.dtd\">",
        "<target version=\"1.0\">",
        "   <architecture>arm</architecture>",
        "   <feature name=\"org.gnu.gdb.arm.m-profile\">",
        "       <reg name=\"r0\" bitsize=\"32\"/>",
        "       <reg name=\"r1\" bitsize=\"32\"/>",
        "       <reg name=\"r2\" bitsize=\"32\"/>",
        "       <reg name=\"r3\" bitsize=\"32\"/>",
        "       <reg name=\"r4\" bitsize=\"32\"/>",
        "       <reg name=\"r5\" bitsize=\"32\"/>",
        "       <reg name=\"r6\" bitsize=\"32\"/>",
        "       <reg name=\"r7\" bitsize=\"32\"/>",
        "       <reg name=\"r8\" bitsize=\"32\"/>",
        "       <reg name=\"r9\" bitsize=\"32\"/>",
        "       <reg name=\"r10\" bitsize=\"32\"/>",
        "       <reg name=\"r11\" bitsize=\"32\"/>",
        "       <reg name=\"r12\" bitsize=\"32\"/>",
        "       <reg name=\"sp\" bitsize=\"32\" type=\"data_ptr\"/>",
        "       <reg name=\"lr\" bitsize=\"32\"/>",
        "       <reg name=\"pc\" bitsize=\"32\" type=\"code_ptr\"/>",
        "       <reg name=\"xpsr\" bitsize=\"32\" regnum=\"25\"/>",
        "       <reg name=\"msp\" bitsize=\"32\" regnum=\"26\" type=\"data_ptr\" group=\"general\" />",
        "       <reg name=\"psp\" bitsize=\"32\" regnum=\"27\" type=\"data_ptr\" group=\"general\" />",
        "       <reg name=\"control\" bitsize=\"8\" regnum=\"28\" type=\"int\" group=\"general\" />",
        "       <reg name=\"faultmask\" bitsize=\"8\" regnum=\"29\" type=\"int\" group=\"general\" />",
        "       <reg name=\"basepri\" bitsize=\"8\" regnum=\"30\" type=\"int\" group=\"general\" />",
        "       <reg name=\"primask\" bitsize=\"8\" regnum=\"31\" type=\"int\" group=\"general\" />",
        "       <reg name=\"s0\" bitsize=\"32\" regnum=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s1\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s2\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s3\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s4\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s5\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s6\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s7\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s8\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s9\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s10\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s11\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s12\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s13\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s14\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s15\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s16\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s17\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s18\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s19\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s20\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s21\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s22\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s23\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s24\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s25\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s26\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s27\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s28\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s29\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s30\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"s31\" bitsize=\"32\" type=\"float\" group=\"float\" />",
        "       <reg name=\"fpscr\" bitsize=\"32\" type=\"int\" group=\"float\" />",
        "   </feature>",
        "</target>"
    )
}

/// Reads the register GDB addresses as id `id` (spec.md §3: 0x00-0x0f are
/// `r0..r15`, then xPSR/MSP/PSP/CONTROL/FAULTMASK/BASEPRI/PRIMASK, then
/// `s0..s31`, then `fpscr`).
///
/// `xpsr`/`msp`/`psp` (ids 0x19-0x1b) still come back through `read_reg`
/// with indices 16/17/18, matching the original `st-util`'s
/// `stlink_read_reg(sl, 16|17|18, &regp)` calls; everything from `control`
/// (0x1c) onward only exists on the "unsupported" read/write path.
pub fn read_by_id(probe: &mut dyn Probe, id: u32) -> Result<u32> {
    match id {
        0..=15 => probe.read_reg(id),
        0x19 => probe.read_reg(16), // xpsr
        0x1a => probe.read_reg(17), // msp
        0x1b => probe.read_reg(18), // psp
        0x1c..=0x40 => probe.read_unsupported_reg(id),
        _ => bail!("read_by_id: register id {id:#x} out of range"),
    }
}

pub fn write_by_id(probe: &mut dyn Probe, id: u32, value: u32) -> Result<()> {
    match id {
        0..=15 => probe.write_reg(value, id),
        0x19 => probe.write_reg(value, 16),
        0x1a => probe.write_reg(value, 17),
        0x1b => probe.write_reg(value, 18),
        0x1c..=0x40 => probe.write_unsupported_reg(value, id),
        _ => bail!("write_by_id: register id {id:#x} out of range"),
    }
}

/// `g` reply: 16 core registers, 8 big-endian hex digits each.
pub fn encode_all(regs: &RegisterFile) -> String {
    let mut out = String::with_capacity(16 * 8);
    for r in regs.r {
        out.push_str(&format!("{r:08x}"));
    }
    out
}

/// `G` request body: the inverse of [`encode_all`].
pub fn decode_all(hex: &str) -> Result<[u32; 16]> {
    if hex.len() < 16 * 8 {
        bail!("G packet: expected 128 hex digits, got {}", hex.len());
    }
    let mut regs = [0u32; 16];
    for (i, r) in regs.iter_mut().enumerate() {
        *r = u32::from_str_radix(&hex[i * 8..i * 8 + 8], 16)?;
    }
    Ok(regs)
}
