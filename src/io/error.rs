// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors when writing output containers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Couldn't create output file {file}: {err}")]
    Create { file: String, err: std::io::Error },

    #[error("Failed writing to {file}: {err}")]
    Write { file: String, err: std::io::Error },

    #[error("Sub-integration payload is {got} bytes; the container was set up for {expected}")]
    PayloadSize { expected: usize, got: usize },
}
