// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
The per-second beamforming kernels.

One second of packed voltages is transformed into detected spectra and/or
beamformed complex voltages for each pointing. The work is data-parallel
over time samples; each worker owns scratch space for the decoded and
calibrated voltages of a single sample, so no synchronisation is needed
inside a second. Antennas are combined with a fixed pairwise tree reduction,
which keeps the output deterministic under thread-count changes and bounds
the summation error.

For every sample and channel:

1. decode the packed 4+4-bit inputs ([`crate::voltage`]);
2. apply the complex weight of the pointing, then the antenna's inverse
   Jones matrix, then (when configured) divide out the antenna gain;
3. tree-sum the calibrated voltages over antennas into the beam 2-vector;
4. accumulate the 2x2 antenna auto-covariance (the noise floor) from the
   calibrated voltages;
5. detect Stokes parameters from the beam, subtracting the noise floor, or
   stash the beam vector for the voltage path.

The incoherent sum is formed from the decoded voltages before any
calibration is applied; it is a sum of intensities and calibration phases
have nothing to act on.
 */

use marlu::c64;
use ndarray::prelude::*;
use rayon::prelude::*;

use crate::cal::CalTables;
use crate::math::tree_sum_pairs;
use crate::voltage::{decode_pair, SampleFlags};

/// What the detected-output path should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedKind {
    /// Full Stokes I, Q, U, V from the coherent beam, noise-floor debiased.
    Iquv,
    /// Stokes I only: the plain incoherent sum, no debias.
    IncoherentI,
}

/// Per-run switches for the beamforming kernels.
#[derive(Debug, Clone, Copy)]
pub struct BeamformOpts {
    pub flags: SampleFlags,
    pub apply_jones: bool,
    pub detected: Option<DetectedKind>,
    pub voltages: bool,
}

/// One second of beamformed output.
pub struct SecondOutput {
    /// Detected spectra, `[pointing][sample][pol][fine_chan]`. The pol axis
    /// has length 4 (I, Q, U, V) or 1 (incoherent I).
    pub spectra: Option<Array4<f32>>,

    /// Beamformed complex voltages, `[pointing][sample][fine_chan][pol]`,
    /// already normalised by `sqrt(wsum)`.
    pub voltages: Option<Array4<c64>>,
}

/// Per-worker scratch space: the decoded and calibrated voltages and the
/// noise-floor accumulator for one time sample.
struct Scratch {
    /// `[fine_chan][input]`
    decoded: Array2<c64>,
    /// `[fine_chan][input]`
    calibrated: Array2<c64>,
    /// `[fine_chan][4]`, row-major 2x2 Hermitian
    noise: Array2<c64>,
    /// `[fine_chan]`
    incoherent: Vec<f64>,
}

impl Scratch {
    fn new(num_chans: usize, num_inputs: usize) -> Scratch {
        Scratch {
            decoded: Array2::zeros((num_chans, num_inputs)),
            calibrated: Array2::zeros((num_chans, num_inputs)),
            noise: Array2::zeros((num_chans, 4)),
            incoherent: vec![0.0; num_chans],
        }
    }
}

/// Beamform one second of packed voltages. `raw` has layout
/// `[sample][fine_chan][input]` and its length must be a whole number of
/// samples.
pub fn beamform_second(
    raw: &[u8],
    tables: &CalTables,
    num_chans: usize,
    opts: &BeamformOpts,
) -> SecondOutput {
    let num_inputs = tables.flag_weights.len();
    let num_ants = num_inputs / 2;
    let num_pointings = tables.weights.dim().0;
    let bytes_per_sample = num_chans * num_inputs;
    debug_assert_eq!(raw.len() % bytes_per_sample, 0);
    let num_samples = raw.len() / bytes_per_sample;

    let want_stokes = opts.detected == Some(DetectedKind::Iquv);
    let want_incoherent = opts.detected == Some(DetectedKind::IncoherentI);
    let needs_coherent = want_stokes || opts.voltages;

    // Disabled outputs get a zero-length pointing axis; iterating their
    // sample axis costs nothing and keeps the parallel zip uniform.
    let spectra_dim = match opts.detected {
        Some(DetectedKind::Iquv) => (num_pointings, num_samples, 4, num_chans),
        Some(DetectedKind::IncoherentI) => (1, num_samples, 1, num_chans),
        None => (0, num_samples, 1, num_chans),
    };
    let mut spectra = Array4::<f32>::zeros(spectra_dim);
    let voltages_dim = if opts.voltages {
        (num_pointings, num_samples, num_chans, 2)
    } else {
        (0, num_samples, num_chans, 2)
    };
    let mut voltages = Array4::<c64>::zeros(voltages_dim);

    let wsum = tables.wsum;
    let inv_sqrt_wsum = 1.0 / wsum.sqrt();
    let zero = c64::new(0.0, 0.0);

    raw.par_chunks_exact(bytes_per_sample)
        .zip(spectra.axis_iter_mut(Axis(1)).into_par_iter())
        .zip(voltages.axis_iter_mut(Axis(1)).into_par_iter())
        .for_each_init(
            || Scratch::new(num_chans, num_inputs),
            |scratch, ((bytes, mut spec_s), mut volt_s)| {
                // Decode the sample, walking antenna pairs then channels.
                for i_ant in 0..num_ants {
                    let (ix, iy) = (2 * i_ant, 2 * i_ant + 1);
                    for c in 0..num_chans {
                        let (ex, ey) = decode_pair(
                            bytes[c * num_inputs + ix],
                            bytes[c * num_inputs + iy],
                            opts.flags,
                        );
                        scratch.decoded[(c, ix)] = ex;
                        scratch.decoded[(c, iy)] = ey;
                    }
                }

                if want_incoherent {
                    for c in 0..num_chans {
                        let mut sum = 0.0;
                        for i in 0..num_inputs {
                            let w = tables.flag_weights[i];
                            sum += w * w * scratch.decoded[(c, i)].norm_sqr();
                        }
                        scratch.incoherent[c] = sum / wsum;
                        spec_s[(0, 0, c)] = scratch.incoherent[c] as f32;
                    }
                }

                if !needs_coherent {
                    return;
                }

                for k in 0..num_pointings {
                    scratch.noise.fill(zero);

                    for i_ant in 0..num_ants {
                        let (ix, iy) = (2 * i_ant, 2 * i_ant + 1);
                        for c in 0..num_chans {
                            let dx = scratch.decoded[(c, ix)] * tables.weights[(k, ix, c)];
                            let dy = scratch.decoded[(c, iy)] * tables.weights[(k, iy, c)];

                            let (mut ex, mut ey) = match (opts.apply_jones, &tables.inv_jones) {
                                (true, Some(inv_jones)) => {
                                    let j = inv_jones[i_ant];
                                    (j[0] * dx + j[1] * dy, j[2] * dx + j[3] * dy)
                                }
                                _ => (dx, dy),
                            };

                            if let Some(gains) = &tables.gains {
                                ex = if gains[ix] == zero { zero } else { ex / gains[ix] };
                                ey = if gains[iy] == zero { zero } else { ey / gains[iy] };
                            }

                            scratch.calibrated[(c, ix)] = ex;
                            scratch.calibrated[(c, iy)] = ey;

                            if want_stokes {
                                scratch.noise[(c, 0)] += ex * ex.conj();
                                scratch.noise[(c, 1)] += ex * ey.conj();
                                scratch.noise[(c, 2)] += ey * ex.conj();
                                scratch.noise[(c, 3)] += ey * ey.conj();
                            }
                        }
                    }

                    for c in 0..num_chans {
                        let row = scratch
                            .calibrated
                            .row_mut(c)
                            .into_slice()
                            .expect("calibrated scratch is contiguous");
                        tree_sum_pairs(row);
                        let bx = row[0];
                        let by = row[1];

                        if want_stokes {
                            let n00 = scratch.noise[(c, 0)].re;
                            let n11 = scratch.noise[(c, 3)].re;
                            let n01 = scratch.noise[(c, 1)];

                            let i = (bx.norm_sqr() - n00 + by.norm_sqr() - n11) / wsum;
                            let q = (bx.norm_sqr() - n00 - by.norm_sqr() + n11) / wsum;
                            let cross = (bx * by.conj() - n01) / wsum;

                            spec_s[(k, 0, c)] = i as f32;
                            spec_s[(k, 1, c)] = q as f32;
                            spec_s[(k, 2, c)] = (2.0 * cross.re) as f32;
                            spec_s[(k, 3, c)] = (-2.0 * cross.im) as f32;
                        }

                        if opts.voltages {
                            volt_s[(k, c, 0)] = bx * inv_sqrt_wsum;
                            volt_s[(k, c, 1)] = by * inv_sqrt_wsum;
                        }
                    }
                }
            },
        );

    SecondOutput {
        spectra: opts.detected.map(|_| spectra),
        voltages: opts.voltages.then(|| voltages),
    }
}

#[cfg(test)]
mod tests;
