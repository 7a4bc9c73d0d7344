// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors when reading the per-second calibration streams.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("Ran out of data reading {what} from {file}: wanted {expected} values, got {got}")]
    Unparseable {
        file: String,
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Couldn't parse '{text}' in {file} as a number")]
    ParseFloat { file: String, text: String },

    #[error("{file} holds {got} {what}, but the observation has {expected}")]
    ShapeMismatch {
        file: String,
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("The weights file flags every input (weight sum is zero); there is nothing to beamform")]
    AllInputsFlagged,

    #[error("Couldn't work out the antenna-gains format of {file}: lines have {tokens} values")]
    UnknownGainsFormat { file: String, tokens: usize },

    #[error("Couldn't open calibration file {file}: {err}")]
    Open { file: String, err: std::io::Error },

    #[error(transparent)]
    Math(#[from] crate::math::MathError),

    #[error("IO error when reading calibration data: {0}")]
    IO(#[from] std::io::Error),
}
