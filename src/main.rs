// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The `make_beam` binary: parse arguments, set up logging, run the
//! beamforming pipeline over the requested window.

use clap::Parser;
use crossbeam_utils::atomic::AtomicCell;
use log::{debug, info};

use mwa_beamform::{run, BeamArgs, BeamformError};

fn setup_logging(level: u8) -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                message
            ))
        })
        .level(match level {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        })
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}

fn try_main() -> Result<(), BeamformError> {
    let args = BeamArgs::parse();
    setup_logging(args.verbosity).expect("Failed to initialise logging.");
    info!(
        "make_beam {} (mwa_beamform)",
        env!("CARGO_PKG_VERSION")
    );
    debug!("{args:#?}");

    let params = args.into_params()?;
    let cancel = AtomicCell::new(false);
    run(&params, &cancel)?;
    Ok(())
}

fn main() {
    if let Err(e) = try_main() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
