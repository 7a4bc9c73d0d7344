// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors when reading raw VCS voltage files.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoltageReadError {
    #[error("Raw voltage file {file} doesn't exist; refusing to interpolate over a missing second")]
    InputMissing { file: String },

    #[error("Raw voltage file {file} has {got} bytes, but one second of data is {expected} bytes")]
    InputMalformed {
        file: String,
        expected: usize,
        got: usize,
    },

    #[error("IO error when reading raw voltages: {0}")]
    IO(#[from] std::io::Error),
}
