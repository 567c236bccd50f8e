// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ARMv7-M debug and cache-control register layout: addresses and bit
//! layouts for the Flash Patch & Breakpoint unit, the Data Watchpoint &
//! Trace unit, and the Cortex-M7 cache-identification/maintenance
//! registers. Everything here is read or written through
//! [`crate::probe::Probe::read_debug32`]/`write_debug32`.

use bitflags::bitflags;

pub const FP_CTRL: u32 = 0xE000_2000;
pub const FP_COMP0: u32 = 0xE000_2008;
pub const CPUID: u32 = 0xE000_ED00;

/// Cortex-M7 Lock Access Register: some revisions require this key before
/// FP_* registers accept writes (IHI0029D, p.48).
pub const FP_LAR: u32 = 0xE000_2FB0;
pub const FP_LAR_KEY: u32 = 0xC5AC_CE55;

/// CPUID `PartNo` field for the Cortex-M7.
pub const CORTEX_M7_PART_NO: u32 = 0xC27;

pub fn fp_compn(index: usize) -> u32 {
    FP_COMP0 + 4 * index as u32
}

bitflags! {
    /// FP_CTRL — Flash Patch Control Register.
    #[derive(PartialEq, Eq, Copy, Clone)]
    pub struct FpCtrl: u32 {
        const ENABLE = 1 << 0;
        const KEY = 1 << 1;
        const _ = !0;
    }
}

impl FpCtrl {
    pub fn num_code(raw: u32) -> u32 {
        (raw >> 4) & 0xf
    }
    pub fn num_lit(raw: u32) -> u32 {
        (raw >> 8) & 0xf
    }
    pub fn revision(raw: u32) -> u32 {
        (raw >> 28) & 0xf
    }
}

pub const DEMCR: u32 = 0xE000_EDFC;

bitflags! {
    /// DEMCR — Debug Exception and Monitor Control Register.
    #[derive(PartialEq, Eq, Copy, Clone)]
    pub struct Demcr: u32 {
        const TRCENA = 1 << 24;
    }
}

pub const DWT_COMP0: u32 = 0xE000_1020;
pub const DWT_MASK0: u32 = 0xE000_1024;
pub const DWT_FUN0: u32 = 0xE000_1028;
const DWT_STRIDE: u32 = 0x10;

pub fn dwt_compn(index: usize) -> u32 {
    DWT_COMP0 + DWT_STRIDE * index as u32
}
pub fn dwt_maskn(index: usize) -> u32 {
    DWT_MASK0 + DWT_STRIDE * index as u32
}
pub fn dwt_funn(index: usize) -> u32 {
    DWT_FUN0 + DWT_STRIDE * index as u32
}

pub const CM7_CTR: u32 = 0xE000_ED7C;
pub const CM7_CLIDR: u32 = 0xE000_ED78;
pub const CM7_CCSIDR: u32 = 0xE000_ED80;
pub const CM7_CSSELR: u32 = 0xE000_ED84;
pub const CM7_CCR: u32 = 0xE000_ED14;
pub const CM7_DCCSW: u32 = 0xE000_EF6C;
pub const CM7_ICIALLU: u32 = 0xE000_EF50;

bitflags! {
    /// CCR — Configuration and Control Register (cache-enable bits only).
    #[derive(PartialEq, Eq, Copy, Clone)]
    pub struct Ccr: u32 {
        const IC = 1 << 17;
        const DC = 1 << 16;
        const _ = !0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fp_compn_is_word_spaced() {
        assert_eq!(fp_compn(0), FP_COMP0);
        assert_eq!(fp_compn(1), FP_COMP0 + 4);
        assert_eq!(fp_compn(14), FP_COMP0 + 4 * 14);
    }

    #[test]
    fn fp_ctrl_fields_decode() {
        // num_code=6, num_lit=2, revision=1
        let raw: u32 = (1 << 28) | (2 << 8) | (6 << 4);
        assert_eq!(FpCtrl::num_code(raw), 6);
        assert_eq!(FpCtrl::num_lit(raw), 2);
        assert_eq!(FpCtrl::revision(raw), 1);
    }

    #[test]
    fn dwt_registers_are_16_bytes_apart() {
        assert_eq!(dwt_compn(1) - dwt_compn(0), 0x10);
        assert_eq!(dwt_maskn(1) - dwt_maskn(0), 0x10);
        assert_eq!(dwt_funn(1) - dwt_funn(0), 0x10);
    }
}
