// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Useful constants.

All quantisation and level-tracking constants live here so that the detected
and voltage output paths cannot drift apart.
 */

pub use std::f64::consts::{PI, TAU};

/// The number of polarisations per antenna. VCS data is always dual linear
/// pol (X then Y).
pub const NUM_POLS: usize = 2;

/// The default number of fine channels in a coarse channel.
pub const DEFAULT_NUM_CHANS: usize = 128;

/// The default number of time samples per second of VCS data (10 kHz fine
/// channels).
pub const DEFAULT_SAMPLE_RATE: usize = 10_000;

/// The number of MWA receiver coarse channels. Used when a CASA antenna-gains
/// channel index needs to be counted from the other end of the band.
pub const NUM_COARSE_CHANS: usize = 24;

/// Detected outputs are scaled so that the per-channel mean magnitude sits at
/// this level before 8-bit quantisation.
pub const DETECTED_TARGET_LEVEL: f64 = 32.0;

/// 8-bit quantisation clips to this range before conversion to offset-binary.
pub const QUANT_CLIP_MIN: f32 = -126.0;
pub const QUANT_CLIP_MAX: f32 = 127.0;

/// Step size for the voltage-quantiser occupancy gain search.
pub const GAIN_SEARCH_STEP: f64 = 0.001;

/// The occupancy gain search stops once the fraction of clipped samples drops
/// below this.
pub const GAIN_CLIP_FRACTION_LIMIT: f64 = 1e-5;

/// A scaled voltage stream whose mean real part exceeds this is broken
/// upstream; quantising it would bake the bias into the 8-bit output.
pub const VOLTAGE_MEAN_TOLERANCE: f64 = 1e-3;

/// VDIF frames carry this many time samples each.
pub const VDIF_SAMPLES_PER_FRAME: usize = 128;

/// Bits per VDIF sample component. 8 bits is all the downstream readers
/// (dspsr, DiFX) support.
pub const VDIF_BITS: u32 = 8;

/// VDIF "channels" per frame; the two polarisations are packed as channels.
pub const VDIF_NCHAN: usize = 2;

/// The size of a VDIF frame header in bytes.
pub const VDIF_HEADER_BYTES: usize = 32;

/// The size of the ASCII sidecar header written next to a VDIF file.
pub const VDIF_SIDECAR_BYTES: usize = 4096;
