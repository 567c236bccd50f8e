// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `st-util` entry point: parse arguments, open the probe, install the
//! signal-driven shutdown flag, and drive the persistent accept loop
//! (spec.md §2, §5, §6.2).

use std::net::TcpListener;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info, warn};

use stlink_gdb_server::cli::Args;
use stlink_gdb_server::probe::{Probe, ProbeFactory, ProbeOpenParams};
use stlink_gdb_server::session::{serve, ServeOutcome, Session, SessionGuard};

fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(verbosity_to_level(args.verbose))
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn verbosity_to_level(v: u8) -> log::LevelFilter {
    match v {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

fn run(args: Args) -> Result<()> {
    let open_params = ProbeOpenParams {
        logging_level: args.verbose as i32,
        connect_mode: args.connect_mode(),
        serial: args.serial_or_env(),
        freq_hz: args.freq_hz()?,
    };

    let listener = TcpListener::bind(("0.0.0.0", args.listen_port))
        .with_context(|| format!("failed to listen on port {}", args.listen_port))?;
    info!("Listening on port {}.", args.listen_port);

    let mut probe = open_probe(&open_params).context("failed to open probe")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))
            .context("failed to install signal handler")?;
    }

    loop {
        if shutdown.load(Ordering::SeqCst) {
            info!("Shutdown requested; exiting.");
            break;
        }

        let (mut stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                error!("accept failed: {e:#}");
                continue;
            }
        };
        info!("Connection from {peer}.");

        let factory: ProbeFactory = Box::new(move |params| open_probe(params));
        let session = match Session::new(
            probe,
            open_params.connect_mode,
            args.multi,
            args.semihosting,
            open_params.clone(),
            factory,
        ) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to start session: {e:#}");
                break;
            }
        };

        let mut guard = SessionGuard::new(session);
        let outcome = serve(&mut stream, guard.get_mut(), &shutdown);

        if matches!(outcome, Ok(ServeOutcome::ShutdownRequested)) {
            info!("Shutdown requested; leaving target running and closing probe.");
            // `guard` is dropped here without `into_probe`: its `Drop` impl
            // runs run()/exit_debug_mode()/close() for us (spec.md §5
            // cancellation (b)).
            return Ok(());
        }

        probe = guard.into_probe();

        match outcome {
            Ok(ServeOutcome::Disconnected) => {
                info!("GDB disconnected.");
                if let Err(e) = probe.run() {
                    warn!("failed to resume target after disconnect: {e:#}");
                }
            }
            Ok(ServeOutcome::Fatal) => {
                bail!("probe reopen failed during kill; exiting");
            }
            Ok(ServeOutcome::ShutdownRequested) => unreachable!("handled above"),
            Err(e) => {
                error!("session ended with an error: {e:#}");
            }
        }

        if !args.multi {
            break;
        }
    }

    Ok(())
}

/// Opens the physical probe transport. Out of scope for this crate
/// (spec.md §1): a real implementation plugs a concrete USB/JTAG/SWD
/// backend in here behind the `Probe` trait.
fn open_probe(_params: &ProbeOpenParams) -> Result<Box<dyn Probe>> {
    bail!("no probe transport is linked into this build")
}
