// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command-line front end (spec.md §5 / §1 "ambient concerns"). Flag names
//! and defaults mirror the original `st-util`'s `getopt_long` table.

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::probe::ConnectMode;

#[derive(Debug, Parser)]
#[clap(
    name = "st-util",
    about = "GDB Remote Serial Protocol server for ARM Cortex-M targets",
    version
)]
pub struct Args {
    /// Increase verbosity; repeat for more (-v, -vv, -vvv), or pass an
    /// explicit level with -v=N.
    #[clap(short, long, parse(from_occurrences))]
    pub verbose: u8,

    /// TCP port to listen on.
    #[clap(short = 'p', long = "listen_port", default_value = "4242")]
    pub listen_port: u16,

    /// Multi-mode: restart the GDB server after a client disconnects
    /// instead of exiting.
    #[clap(short, long)]
    pub multi: bool,

    /// Connect without resetting the target ("hot-plug").
    #[clap(short = 'n', long = "hot-plug")]
    pub hot_plug: bool,

    /// Connect while holding the target in reset.
    #[clap(short = 'u', long = "connect-under-reset")]
    pub connect_under_reset: bool,

    /// SWD/JTAG clock frequency, e.g. "1800k" or "4M" (bare numbers are Hz).
    #[clap(short = 'F', long = "freq")]
    pub freq: Option<String>,

    /// Serve `BKPT 0xAB` semihosting calls.
    #[clap(long)]
    pub semihosting: bool,

    /// Probe serial number to open, as `<USB_BUS>:<USB_ADDR>` (falls back
    /// to the `STLINK_DEVICE` environment variable).
    #[clap(long)]
    pub serial: Option<String>,
}

impl Args {
    pub fn connect_mode(&self) -> ConnectMode {
        if self.connect_under_reset {
            ConnectMode::UnderReset
        } else if self.hot_plug {
            ConnectMode::HotPlug
        } else {
            ConnectMode::Normal
        }
    }

    pub fn serial_or_env(&self) -> Option<String> {
        self.serial
            .clone()
            .or_else(|| std::env::var("STLINK_DEVICE").ok())
    }

    pub fn freq_hz(&self) -> Result<Option<u32>> {
        self.freq.as_deref().map(parse_freq).transpose()
    }
}

/// Parses a frequency argument: a bare number is Hz, a `k`/`K` suffix is
/// kHz, an `m`/`M` suffix is MHz (mirrors the original's `arg_parse_freq`).
fn parse_freq(s: &str) -> Result<u32> {
    let s = s.trim();
    if let Some(digits) = s.strip_suffix(['k', 'K']) {
        return digits
            .parse::<u32>()
            .map(|v| v * 1_000)
            .context("invalid frequency");
    }
    if let Some(digits) = s.strip_suffix(['m', 'M']) {
        return digits
            .parse::<u32>()
            .map(|v| v * 1_000_000)
            .context("invalid frequency");
    }
    let value: u32 = s.parse().context("invalid frequency")?;
    if value == 0 {
        bail!("frequency must be nonzero");
    }
    Ok(value)
}
