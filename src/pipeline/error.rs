// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors from the per-second scheduler and from digesting user arguments.

use std::path::PathBuf;

use thiserror::Error;

use crate::cal::CalibrationError;
use crate::io::ContainerError;
use crate::levels::LevelError;
use crate::voltage::VoltageReadError;

/// Anything that can abort a run once it has started. All of these are
/// fatal: the partial second is not written and the process exits non-zero.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Voltage(#[from] VoltageReadError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Level(#[from] LevelError),

    #[error(transparent)]
    Container(#[from] ContainerError),
}

/// Problems with the requested configuration, caught before any data is
/// touched.
#[derive(Error, Debug)]
pub enum InvalidParamsError {
    #[error("Begin GPS second {begin} is after end GPS second {end}")]
    BadWindow { begin: u64, end: u64 },

    #[error("The antenna count, channel count and sample rate must all be non-zero")]
    EmptyDimensions,

    #[error("Mode '{mode}' forms a coherent beam and needs at least one phases file (-c)")]
    MissingPhases { mode: String },

    #[error("Inverting the channeliser with 'full-128' needs a FIR prototype filter file (-m)")]
    MissingFilter,

    #[error("The partial inversion works on a 128-channel coarse channel, not {num_chans}")]
    BadPartialChans { num_chans: usize },

    #[error("Mode 'detected-incoherent' discards phase; phases and Jones files don't apply")]
    IncoherentWithCalibration,

    #[error("Stokes 'i' output is only for the incoherent mode; coherent detection makes IQUV")]
    StokesIWithCoherent,

    #[error("Couldn't read the filter file {file}: {err}")]
    FilterUnreadable { file: PathBuf, err: String },
}
