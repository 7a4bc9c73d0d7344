// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
VDIF framed voltage output.

Each frame is a 32-byte header followed by 128 complex dual-pol time
samples, 8 bits per component, offset-binary encoded; the two polarisations
ride as the frame's two "channels". One second of reconstructed beam fills
`frame_rate` frames exactly, so the writer consumes whole seconds.

VDIF counts time as whole seconds from a half-year reference epoch. The
epoch and seconds-of-epoch come from the observation plan's start time; the
frame counter wraps every second.

Alongside the `.vdif` file sits a fixed-size ASCII `.hdr` sidecar describing
the source, coordinates, frequency and bandwidth, plus the stream's per-pol
scales and offsets; downstream folding software reads it first. The sidecar
is rewritten whenever the level tracker recomputes the scales.
 */

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use hifitime::Epoch;
use log::debug;

use super::ContainerError;
use crate::constants::{
    VDIF_BITS, VDIF_HEADER_BYTES, VDIF_NCHAN, VDIF_SAMPLES_PER_FRAME, VDIF_SIDECAR_BYTES,
};
use crate::context::ObsContext;
use crate::levels::quantise_to_offset_binary;

/// Frame geometry for one voltage stream.
#[derive(Debug, Clone, Copy)]
pub struct VdifSpec {
    /// Reconstructed time samples per second (the raw channel rate,
    /// `sample_rate * num_chans`).
    pub samples_per_second: usize,
}

impl VdifSpec {
    /// Total frame length in bytes, header included.
    pub fn frame_length(&self) -> usize {
        VDIF_NCHAN * 2 * VDIF_BITS as usize * VDIF_SAMPLES_PER_FRAME / 8 + VDIF_HEADER_BYTES
    }

    pub fn frame_rate(&self) -> usize {
        self.samples_per_second / VDIF_SAMPLES_PER_FRAME
    }

    /// Bytes of sample data per frame.
    pub fn payload_bytes(&self) -> usize {
        self.frame_length() - VDIF_HEADER_BYTES
    }

    /// Bytes per second of output, headers included.
    pub fn block_size(&self) -> usize {
        self.frame_length() * self.frame_rate()
    }

    /// Interleaved float components per second handed to the writer.
    pub fn floats_per_second(&self) -> usize {
        self.samples_per_second * VDIF_NCHAN * 2
    }
}

/// A VDIF data-frame header (version 0, not legacy).
#[derive(Debug, Clone)]
pub struct VdifHeader {
    ref_epoch: u8,
    seconds: u32,
    frame: u32,
    frame_length_8: u32,
    thread_id: u16,
    station: [u8; 2],
}

impl VdifHeader {
    pub fn new(spec: &VdifSpec, start: Epoch, station: [u8; 2]) -> VdifHeader {
        let (ref_epoch, seconds) = ref_epoch_and_seconds(start);
        VdifHeader {
            ref_epoch,
            seconds,
            frame: 0,
            frame_length_8: (spec.frame_length() / 8) as u32,
            thread_id: 0,
            station,
        }
    }

    /// Advance to the next frame, rolling the seconds counter at the frame
    /// rate.
    pub fn next_frame(&mut self, frame_rate: usize) {
        self.frame += 1;
        if self.frame as usize == frame_rate {
            self.frame = 0;
            self.seconds += 1;
        }
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        // Word 0: invalid flag (0), legacy flag (0), seconds from epoch.
        LittleEndian::write_u32(&mut buf[0..4], self.seconds & 0x3fff_ffff);
        // Word 1: reference epoch and frame number.
        LittleEndian::write_u32(
            &mut buf[4..8],
            ((self.ref_epoch as u32) << 24) | (self.frame & 0x00ff_ffff),
        );
        // Word 2: VDIF version (0), log2 channels, frame length / 8.
        let log2_chans = (VDIF_NCHAN as f64).log2() as u32;
        LittleEndian::write_u32(
            &mut buf[8..12],
            (log2_chans << 24) | (self.frame_length_8 & 0x00ff_ffff),
        );
        // Word 3: complex flag, bits per sample - 1, thread id, station id.
        let station = ((self.station[0] as u32) << 8) | self.station[1] as u32;
        LittleEndian::write_u32(
            &mut buf[12..16],
            (1 << 31) | ((VDIF_BITS - 1) << 26) | ((self.thread_id as u32) << 16) | station,
        );
        // Words 4-7: extended user data, unused.
        buf[16..VDIF_HEADER_BYTES].fill(0);
    }
}

/// VDIF reference epochs are half-years counted from 2000-01-01 UTC.
fn ref_epoch_and_seconds(start: Epoch) -> (u8, u32) {
    let (year, month, ..) = start.to_gregorian_utc();
    let ref_epoch = ((year - 2000) * 2 + i32::from(month > 6)) as u8;
    let epoch_start = Epoch::from_gregorian_utc(year, if month > 6 { 7 } else { 1 }, 1, 0, 0, 0, 0);
    let seconds = (start - epoch_start).to_seconds().round() as u32;
    (ref_epoch, seconds)
}

/// Writes one pointing's voltage beam as VDIF frames plus the ASCII sidecar.
pub struct VdifWriter {
    spec: VdifSpec,
    header: VdifHeader,
    data_path: PathBuf,
    writer: BufWriter<File>,
    quantised: Vec<u8>,
}

impl VdifWriter {
    /// `base` is the output path without an extension; `.vdif` and `.hdr`
    /// are added here.
    pub fn create<P: AsRef<Path>>(
        base: P,
        spec: VdifSpec,
        start: Epoch,
        station: [u8; 2],
    ) -> Result<VdifWriter, ContainerError> {
        let data_path = base.as_ref().with_extension("vdif");
        debug!(
            "Creating VDIF output {} (frame length {}, {} frames/s)",
            data_path.display(),
            spec.frame_length(),
            spec.frame_rate()
        );
        let f = File::create(&data_path).map_err(|err| ContainerError::Create {
            file: data_path.display().to_string(),
            err,
        })?;
        Ok(VdifWriter {
            spec,
            header: VdifHeader::new(&spec, start, station),
            data_path,
            writer: BufWriter::new(f),
            quantised: vec![],
        })
    }

    fn write_err(&self, err: std::io::Error) -> ContainerError {
        ContainerError::Write {
            file: self.data_path.display().to_string(),
            err,
        }
    }

    /// Frame and append one second of gain-applied, interleaved voltage
    /// components.
    pub fn write_second(&mut self, samples: &[f32]) -> Result<(), ContainerError> {
        if samples.len() != self.spec.floats_per_second() {
            return Err(ContainerError::PayloadSize {
                expected: self.spec.floats_per_second(),
                got: samples.len(),
            });
        }

        quantise_to_offset_binary(samples, &mut self.quantised);

        let mut header_bytes = [0u8; VDIF_HEADER_BYTES];
        let frame_rate = self.spec.frame_rate();
        for payload in self.quantised.chunks_exact(self.spec.payload_bytes()) {
            self.header.write_to(&mut header_bytes);
            self.writer
                .write_all(&header_bytes)
                .map_err(|e| self.write_err(e))?;
            self.writer.write_all(payload).map_err(|e| self.write_err(e))?;
            self.header.next_frame(frame_rate);
        }
        self.writer.flush().map_err(|e| self.write_err(e))?;
        Ok(())
    }

    /// Write the fixed-size ASCII sidecar next to the data file. `scales`
    /// and `offsets` are the stream's per-pol quantisation state (the
    /// complex standard deviation and zero, for a healthy stream).
    pub fn write_sidecar(
        &self,
        ctx: &ObsContext,
        scales: &[f32; 2],
        offsets: &[f32; 2],
    ) -> Result<(), ContainerError> {
        let path = self.data_path.with_extension("hdr");
        let mut contents = String::new();
        contents.push_str(&format!("DATAFILE {}\n", self.data_path.display()));
        contents.push_str("INSTRUMENT VDIF\n");
        contents.push_str("TELESCOPE MWA\n");
        contents.push_str("MODE PSR\n");
        contents.push_str(&format!("FREQ {:.6}\n", ctx.fctr_mhz));
        contents.push_str(&format!("BW {:.6}\n", ctx.bw_mhz));
        contents.push_str(&format!("RA {}\n", ctx.ra_str));
        contents.push_str(&format!("DEC {}\n", ctx.dec_str));
        contents.push_str(&format!("SOURCE {}\n", ctx.source));
        contents.push_str(&format!("SCALE0 {:.6e}\n", scales[0]));
        contents.push_str(&format!("SCALE1 {:.6e}\n", scales[1]));
        contents.push_str(&format!("OFFSET0 {:.6e}\n", offsets[0]));
        contents.push_str(&format!("OFFSET1 {:.6e}\n", offsets[1]));

        let mut block = contents.into_bytes();
        block.resize(VDIF_SIDECAR_BYTES, 0);

        let err = |err| ContainerError::Write {
            file: path.display().to_string(),
            err,
        };
        let mut f = File::create(&path).map_err(|e| ContainerError::Create {
            file: path.display().to_string(),
            err: e,
        })?;
        f.write_all(&block).map_err(err)?;
        Ok(())
    }
}
