// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
The detected-beam container contract.

Detected spectra leave the pipeline as one sub-integration per second:
`nsblk` spectra of `npol * nchan` values each, as unsigned 8-bit
offset-binary samples or 32-bit little-endian floats, preceded by the
per-sub-integration scale and offset vectors (each `npol * nchan` floats).
Wrapping these payloads in a PSRFITS table, with the observation plan's
start MJD, centre frequency and channel spacing, is the job of a downstream
tool; the byte layout produced here is the contract it consumes.
 */

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use log::debug;
use strum_macros::{Display, EnumIter, EnumString};

use super::ContainerError;

/// The on-disk sample format of a detected stream.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, EnumIter, EnumString)]
pub enum SampleType {
    /// Unsigned 8-bit offset-binary.
    #[strum(serialize = "8bit")]
    EightBit,

    /// Little-endian 32-bit floats, no quantisation.
    #[strum(serialize = "float32")]
    Float32,
}

impl SampleType {
    pub fn bits(&self) -> usize {
        match self {
            SampleType::EightBit => 8,
            SampleType::Float32 => 32,
        }
    }
}

/// The fixed shape of every sub-integration in a stream.
#[derive(Debug, Clone, Copy)]
pub struct SubintSpec {
    /// Spectra per sub-integration (the sample rate).
    pub nsblk: usize,
    pub npol: usize,
    pub nchan: usize,
    pub sample_type: SampleType,
}

impl SubintSpec {
    pub fn bytes_per_subint(&self) -> usize {
        self.nsblk * self.npol * self.nchan * self.sample_type.bits() / 8
    }

    /// Length of the scale and offset vectors.
    pub fn scale_len(&self) -> usize {
        self.npol * self.nchan
    }
}

/// Accepts completed sub-integrations. The pipeline never retries a failed
/// write; a sink error aborts the run.
pub trait SubintSink {
    fn write_subint(
        &mut self,
        scales: &[f32],
        offsets: &[f32],
        data: &[u8],
    ) -> Result<(), ContainerError>;
}

/// Appends raw sub-integration records to a file: scales, offsets, then the
/// payload, all little-endian.
pub struct BinarySubintWriter {
    file: String,
    writer: BufWriter<File>,
    spec: SubintSpec,
}

impl BinarySubintWriter {
    pub fn create<P: AsRef<Path>>(
        path: P,
        spec: SubintSpec,
    ) -> Result<BinarySubintWriter, ContainerError> {
        let file = path.as_ref().display().to_string();
        debug!("Creating detected-beam output {file}");
        let f = File::create(path.as_ref()).map_err(|err| ContainerError::Create {
            file: file.clone(),
            err,
        })?;
        Ok(BinarySubintWriter {
            file,
            writer: BufWriter::new(f),
            spec,
        })
    }

    fn write_err(&self, err: std::io::Error) -> ContainerError {
        ContainerError::Write {
            file: self.file.clone(),
            err,
        }
    }
}

impl SubintSink for BinarySubintWriter {
    fn write_subint(
        &mut self,
        scales: &[f32],
        offsets: &[f32],
        data: &[u8],
    ) -> Result<(), ContainerError> {
        if data.len() != self.spec.bytes_per_subint() {
            return Err(ContainerError::PayloadSize {
                expected: self.spec.bytes_per_subint(),
                got: data.len(),
            });
        }
        if scales.len() != self.spec.scale_len() || offsets.len() != self.spec.scale_len() {
            return Err(ContainerError::PayloadSize {
                expected: self.spec.scale_len(),
                got: scales.len().min(offsets.len()),
            });
        }

        for &s in scales {
            self.writer
                .write_f32::<LittleEndian>(s)
                .map_err(|e| self.write_err(e))?;
        }
        for &o in offsets {
            self.writer
                .write_f32::<LittleEndian>(o)
                .map_err(|e| self.write_err(e))?;
        }
        self.writer.write_all(data).map_err(|e| self.write_err(e))?;
        self.writer.flush().map_err(|e| self.write_err(e))?;
        Ok(())
    }
}

/// Pack a second of 32-bit spectra into the float sample format.
pub fn floats_to_le_bytes(values: &[f32], out: &mut Vec<u8>) {
    out.clear();
    out.reserve_exact(values.len() * 4);
    for &v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
}
