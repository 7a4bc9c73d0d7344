// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Inverting the fine channeliser for voltage output.

The voltage path wants a broad-band time series at the raw channel rate, but
the beamformer produces channelised samples. Per pointing and polarisation,
this module keeps the channelised beam stream in a buffer with an
`ntaps`-sample overlap region at its head, runs the configured inversion
over one second at a time, and copies the final `ntaps` input samples back to
the head so that the next second's reconstruction is continuous across the
boundary.

Three inversions are available:

- pass-through: no inversion, the channelised samples are emitted as-is;
- partial: an 88-channel subset of a 128-channel input, 20 channels dropped
  at each edge, inverted with a plain synthesis DFT per time step;
- full: a synthesis filterbank driven by an operator-supplied FIR prototype
  (the same coefficients the forward channeliser was built from).

All three are pure functions of their input and tap history, so a given mode
always reproduces its output byte for byte.

Whatever the mode, every reconstructed time sample is emitted as
`Re(X), Im(X), Re(Y), Im(Y)`, which is the order the voltage container
expects.
 */

use marlu::c64;
use ndarray::prelude::*;
use strum_macros::{Display, EnumIter, EnumString};

use crate::constants::TAU;

/// The number of channels kept by the partial inversion.
pub const PARTIAL_CHANS: usize = 88;

/// Channels dropped at each band edge by the partial inversion.
pub const PARTIAL_EDGE: usize = 20;

/// Which channeliser inversion the voltage path runs.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, EnumIter, EnumString)]
pub enum InvertMode {
    /// Don't invert; emit the channelised samples as-is.
    #[strum(serialize = "none")]
    None,

    /// Short-form inverse over the central 88 channels.
    #[strum(serialize = "partial-88")]
    Partial88,

    /// Full synthesis filterbank; needs a FIR prototype filter.
    #[strum(serialize = "full-128")]
    Full128,
}

/// The FIR prototype of the forward channeliser, used to run it backwards.
/// The coefficient count is padded up to a whole number of channels so the
/// tap history always covers complete time steps.
#[derive(Debug, Clone)]
pub struct SynthesisFilter {
    coeffs: Vec<f64>,
    num_chans: usize,
}

impl SynthesisFilter {
    pub fn from_coeffs(mut coeffs: Vec<f64>, num_chans: usize) -> SynthesisFilter {
        let rem = coeffs.len() % num_chans;
        if rem != 0 {
            coeffs.resize(coeffs.len() + num_chans - rem, 0.0);
        }
        SynthesisFilter { coeffs, num_chans }
    }

    /// The filter length in channelised samples; also the size of the
    /// tap-overlap region.
    pub fn num_taps(&self) -> usize {
        self.coeffs.len()
    }

    fn taps_per_chan(&self) -> usize {
        self.coeffs.len() / self.num_chans
    }
}

enum Inverter {
    PassThrough,
    Partial { edge: usize },
    Fir(SynthesisFilter),
}

/// Owns the per-pointing reconstruction state: the inversion itself and the
/// tap-overlap history for each polarisation.
pub struct VoltageRepacker {
    inverter: Inverter,
    num_chans: usize,
    samples_per_second: usize,
    ntaps: usize,
    history_x: Vec<c64>,
    history_y: Vec<c64>,
}

impl VoltageRepacker {
    /// No inversion; `sample_rate` is time samples per second.
    pub fn pass_through(num_chans: usize, sample_rate: usize) -> VoltageRepacker {
        Self::with_inverter(Inverter::PassThrough, num_chans, sample_rate, 0)
    }

    /// The 88-channel short-form inverse.
    pub fn partial(num_chans: usize, sample_rate: usize) -> VoltageRepacker {
        let edge = num_chans.saturating_sub(PARTIAL_CHANS) / 2;
        Self::with_inverter(Inverter::Partial { edge }, num_chans, sample_rate, 0)
    }

    /// The full synthesis filterbank.
    pub fn fir(filter: SynthesisFilter, sample_rate: usize) -> VoltageRepacker {
        let num_chans = filter.num_chans;
        let ntaps = filter.num_taps();
        Self::with_inverter(Inverter::Fir(filter), num_chans, sample_rate, ntaps)
    }

    fn with_inverter(
        inverter: Inverter,
        num_chans: usize,
        sample_rate: usize,
        ntaps: usize,
    ) -> VoltageRepacker {
        VoltageRepacker {
            inverter,
            num_chans,
            samples_per_second: sample_rate * num_chans,
            ntaps,
            history_x: vec![c64::new(0.0, 0.0); ntaps],
            history_y: vec![c64::new(0.0, 0.0); ntaps],
        }
    }

    /// Reconstruct one second. `beam` is the beamformed second for this
    /// pointing, `[sample][fine_chan][pol]`; the result is the interleaved
    /// `Re(X), Im(X), Re(Y), Im(Y)` stream, one quad per reconstructed time
    /// sample.
    pub fn repack_second(&mut self, beam: ArrayView3<c64>) -> Vec<f32> {
        let (num_samples, num_chans, _) = beam.dim();
        debug_assert_eq!(num_chans, self.num_chans);
        debug_assert_eq!(num_samples * num_chans, self.samples_per_second);

        let mut out = vec![0.0f32; self.samples_per_second * 4];
        match &self.inverter {
            Inverter::PassThrough => {
                for s in 0..num_samples {
                    for c in 0..num_chans {
                        let t = s * num_chans + c;
                        interleave(&mut out, t, beam[(s, c, 0)], beam[(s, c, 1)]);
                    }
                }
            }

            Inverter::Partial { edge } => {
                let mut spectrum_x = vec![c64::new(0.0, 0.0); num_chans];
                let mut spectrum_y = vec![c64::new(0.0, 0.0); num_chans];
                for s in 0..num_samples {
                    for v in spectrum_x.iter_mut() {
                        *v = c64::new(0.0, 0.0);
                    }
                    for v in spectrum_y.iter_mut() {
                        *v = c64::new(0.0, 0.0);
                    }
                    for c in *edge..num_chans - edge {
                        spectrum_x[c] = beam[(s, c, 0)];
                        spectrum_y[c] = beam[(s, c, 1)];
                    }
                    for j in 0..num_chans {
                        let x = synthesis_dft(&spectrum_x, j);
                        let y = synthesis_dft(&spectrum_y, j);
                        interleave(&mut out, s * num_chans + j, x, y);
                    }
                }
            }

            Inverter::Fir(filter) => {
                let x = invert_channeliser(&self.history_x, beam, 0, filter);
                let y = invert_channeliser(&self.history_y, beam, 1, filter);
                for (t, (x, y)) in x.into_iter().zip(y.into_iter()).enumerate() {
                    interleave(&mut out, t, x, y);
                }

                // Preserve the tap overlap across the second boundary.
                for (i, h) in self.history_x.iter_mut().enumerate() {
                    let t = self.samples_per_second - self.ntaps + i;
                    *h = beam[(t / num_chans, t % num_chans, 0)];
                }
                for (i, h) in self.history_y.iter_mut().enumerate() {
                    let t = self.samples_per_second - self.ntaps + i;
                    *h = beam[(t / num_chans, t % num_chans, 1)];
                }
            }
        }
        out
    }
}

#[inline]
fn interleave(out: &mut [f32], t: usize, x: c64, y: c64) {
    out[4 * t] = x.re as f32;
    out[4 * t + 1] = x.im as f32;
    out[4 * t + 2] = y.re as f32;
    out[4 * t + 3] = y.im as f32;
}

/// One output sample of a backward DFT over the channel spectrum
/// (unnormalised, matching the forward channeliser's conventions).
fn synthesis_dft(spectrum: &[c64], j: usize) -> c64 {
    let num_chans = spectrum.len();
    let mut acc = c64::new(0.0, 0.0);
    for (c, v) in spectrum.iter().enumerate() {
        let phase = TAU * (c * j) as f64 / num_chans as f64;
        acc += *v * c64::new(0.0, phase).exp();
    }
    acc
}

/// Run the synthesis filterbank over one second of one polarisation's
/// channelised stream, with `history` supplying the `ntaps` samples that
/// precede it. Returns the reconstructed broad-band series at the raw
/// channel rate.
///
/// Each incoming time step is first inverted to `num_chans` time-domain
/// samples with a backward DFT; the prototype filter then weights the last
/// `taps_per_chan` steps' blocks into each output sample:
///
/// `y[mC + j] = sum_q h[qC + j] * b[m - q][j]`
fn invert_channeliser(
    history: &[c64],
    beam: ArrayView3<c64>,
    pol: usize,
    filter: &SynthesisFilter,
) -> Vec<c64> {
    let num_chans = filter.num_chans;
    let taps_per_chan = filter.taps_per_chan();
    let num_steps = beam.dim().0;
    let total_steps = taps_per_chan + num_steps;

    // Backward-DFT every step once, history steps included.
    let mut blocks = vec![c64::new(0.0, 0.0); total_steps * num_chans];
    let mut spectrum = vec![c64::new(0.0, 0.0); num_chans];
    for m in 0..total_steps {
        for c in 0..num_chans {
            spectrum[c] = if m < taps_per_chan {
                history[m * num_chans + c]
            } else {
                beam[(m - taps_per_chan, c, pol)]
            };
        }
        for j in 0..num_chans {
            blocks[m * num_chans + j] = synthesis_dft(&spectrum, j);
        }
    }

    let mut out = vec![c64::new(0.0, 0.0); num_steps * num_chans];
    for m in 0..num_steps {
        // Extended step index of this output step.
        let ext = taps_per_chan + m;
        for j in 0..num_chans {
            let mut acc = c64::new(0.0, 0.0);
            for q in 0..taps_per_chan {
                acc += blocks[(ext - q) * num_chans + j] * filter.coeffs[q * num_chans + j];
            }
            out[m * num_chans + j] = acc;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::prelude::*;

    /// A second of channelised beam data with a single excited channel whose
    /// phase advances by `TAU * bin / num_chans * num_chans = TAU * bin` per
    /// step, i.e. a pure tone at that bin.
    fn tone_second(num_samples: usize, num_chans: usize, bin: usize, phase0: f64) -> Array3<c64> {
        let mut beam = Array3::zeros((num_samples, num_chans, 2));
        for s in 0..num_samples {
            // The tone's phase at the first raw sample of this step.
            let phase = phase0 + TAU * bin as f64 * s as f64;
            beam[(s, bin, 0)] = c64::new(0.0, phase).exp();
            beam[(s, bin, 1)] = c64::new(0.0, phase).exp() * 0.5;
        }
        beam
    }

    #[test]
    fn pass_through_interleaves_x_then_y() {
        let mut beam = Array3::zeros((1, 2, 2));
        beam[(0, 0, 0)] = c64::new(1.0, 2.0);
        beam[(0, 0, 1)] = c64::new(3.0, 4.0);
        beam[(0, 1, 0)] = c64::new(5.0, 6.0);
        beam[(0, 1, 1)] = c64::new(7.0, 8.0);

        let mut repacker = VoltageRepacker::pass_through(2, 1);
        let out = repacker.repack_second(beam.view());
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn partial_drops_the_edges() {
        let num_chans = 128;
        let mut beam = Array3::zeros((1, num_chans, 2));
        // An edge channel: must not appear in the output.
        beam[(0, 3, 0)] = c64::new(100.0, 0.0);
        let mut repacker = VoltageRepacker::partial(num_chans, 1);
        let out = repacker.repack_second(beam.view());
        for v in out {
            assert_abs_diff_eq!(v, 0.0);
        }
    }

    #[test]
    fn partial_keeps_the_interior() {
        let num_chans = 128;
        let mut beam = Array3::zeros((1, num_chans, 2));
        beam[(0, 64, 0)] = c64::new(1.0, 0.0);
        let mut repacker = VoltageRepacker::partial(num_chans, 1);
        let out = repacker.repack_second(beam.view());
        // A single interior bin comes out as a unit-magnitude tone.
        assert_abs_diff_eq!(out[0], 1.0, epsilon = 1e-9);
        let t = 1;
        let expected = c64::new(0.0, TAU * 64.0 * t as f64 / num_chans as f64).exp();
        assert_abs_diff_eq!(out[4 * t] as f64, expected.re, epsilon = 1e-9);
    }

    #[test]
    fn fir_modes_are_deterministic() {
        let num_chans = 4;
        let filter = SynthesisFilter::from_coeffs(vec![0.25; 8], num_chans);
        let beam = tone_second(6, num_chans, 1, 0.3);

        let mut a = VoltageRepacker::fir(filter.clone(), 6);
        let mut b = VoltageRepacker::fir(filter, 6);
        let out_a = a.repack_second(beam.view());
        let out_b = b.repack_second(beam.view());
        // Byte-for-byte equal, not merely close.
        assert_eq!(out_a, out_b);
    }

    #[test]
    fn tap_overlap_is_continuous_across_seconds() {
        // Feeding two seconds through one repacker must reproduce what a
        // single two-second call would: the tap history carries exactly the
        // state the second second needs.
        let num_chans = 4;
        let num_samples = 8;
        let filter =
            SynthesisFilter::from_coeffs(vec![0.5, 0.25, 0.125, 0.0625, 0.5, 0.25], num_chans);

        let second_a = tone_second(num_samples, num_chans, 1, 0.0);
        // The tone continues where second A left off.
        let second_b = tone_second(num_samples, num_chans, 1, TAU * 1.0 * num_samples as f64);

        let mut streamed = VoltageRepacker::fir(filter.clone(), num_samples);
        let out_a = streamed.repack_second(second_a.view());
        let out_b = streamed.repack_second(second_b.view());

        // One-shot reference over the concatenated two seconds.
        let mut both = Array3::zeros((2 * num_samples, num_chans, 2));
        both.slice_mut(s![..num_samples, .., ..]).assign(&second_a);
        both.slice_mut(s![num_samples.., .., ..]).assign(&second_b);
        let mut oneshot = VoltageRepacker::fir(filter, 2 * num_samples);
        let reference = oneshot.repack_second(both.view());

        assert_eq!(out_a.as_slice(), &reference[..out_a.len()]);
        assert_eq!(out_b.as_slice(), &reference[out_a.len()..]);
    }

    #[test]
    fn steady_tone_reaches_a_periodic_steady_state() {
        // Two identical seconds of a constant-spectrum input: after the
        // filter settles, the output of the second second must be exactly
        // periodic (no discontinuity at the boundary).
        let num_chans = 4;
        let num_samples = 8;
        let filter = SynthesisFilter::from_coeffs(vec![0.3; 8], num_chans);

        let mut beam = Array3::zeros((num_samples, num_chans, 2));
        for s in 0..num_samples {
            beam[(s, 2, 0)] = c64::new(1.0, 0.0);
            beam[(s, 2, 1)] = c64::new(0.0, 1.0);
        }

        let mut repacker = VoltageRepacker::fir(filter, num_samples);
        let _warmup = repacker.repack_second(beam.view());
        let settled = repacker.repack_second(beam.view());

        // Every step of the settled second is identical.
        let step_floats = num_chans * 4;
        for m in 1..num_samples {
            for j in 0..step_floats {
                assert_abs_diff_eq!(
                    settled[m * step_floats + j],
                    settled[j],
                    epsilon = 1e-9
                );
            }
        }
    }
}
