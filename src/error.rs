// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for all beamformer-related errors. This should be the *only*
//! error enum that is publicly visible.

use thiserror::Error;

use crate::cal::CalibrationError;
use crate::io::ContainerError;
use crate::levels::LevelError;
use crate::pipeline::{InvalidParamsError, PipelineError};
use crate::voltage::VoltageReadError;

#[derive(Error, Debug)]
pub enum BeamformError {
    /// The requested configuration doesn't make sense.
    #[error(transparent)]
    InvalidParams(#[from] InvalidParamsError),

    /// The run started and then failed.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl From<VoltageReadError> for BeamformError {
    fn from(e: VoltageReadError) -> Self {
        Self::Pipeline(PipelineError::Voltage(e))
    }
}

impl From<CalibrationError> for BeamformError {
    fn from(e: CalibrationError) -> Self {
        Self::Pipeline(PipelineError::Calibration(e))
    }
}

impl From<LevelError> for BeamformError {
    fn from(e: LevelError) -> Self {
        Self::Pipeline(PipelineError::Level(e))
    }
}

impl From<ContainerError> for BeamformError {
    fn from(e: ContainerError) -> Self {
        Self::Pipeline(PipelineError::Container(e))
    }
}
