// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Adaptive output levels and 8-bit quantisation.

Both output paths write 8 bits per value, so each stream carries scaling
state that keeps the data inside the quantiser's range: per-channel
scale/offset vectors for detected spectra, and a single gain plus per-pol
scales for voltage streams. The state is an explicit object owned by the
scheduler, recomputed only on adaptive-period boundaries, so long runs keep
a stable scaling instead of breathing with the bandpass.

Computing scales is a pure function of the buffer: running it twice over the
same data produces the same scales, which is what makes re-scaling on
operator request safe.

The on-wire sample format for both paths is offset-binary: clip to
-126..=127, round, then XOR with 0x80.
 */

use log::debug;
use ndarray::prelude::*;
use thiserror::Error;

use crate::constants::{
    DETECTED_TARGET_LEVEL, GAIN_CLIP_FRACTION_LIMIT, GAIN_SEARCH_STEP, QUANT_CLIP_MAX,
    QUANT_CLIP_MIN, VOLTAGE_MEAN_TOLERANCE,
};

#[derive(Error, Debug)]
pub enum LevelError {
    #[error(
        "Voltage stream has a significantly non-zero mean real part ({mean:e}); \
         quantising it would bake the bias into the output"
    )]
    NonZeroMean { mean: f64 },
}

/// Clip, round and convert to offset-binary. This is the only place float
/// samples become wire bytes; overflow clips silently.
pub fn quantise_to_offset_binary(values: &[f32], out: &mut Vec<u8>) {
    out.clear();
    out.reserve_exact(values.len());
    for &v in values {
        let clipped = v.clamp(QUANT_CLIP_MIN, QUANT_CLIP_MAX);
        out.push((clipped.round() as i8 as u8) ^ 0x80);
    }
}

/// Undo [`quantise_to_offset_binary`] for one byte.
pub fn dequantise(byte: u8, scale: f32, offset: f32) -> f32 {
    ((byte ^ 0x80) as i8 as f32) * scale + offset
}

/// Per-channel, per-pol quantisation state for a detected output stream.
pub struct BandpassLevels {
    num_chans: usize,
    num_pols: usize,
    scales: Array2<f32>,
    offsets: Array2<f32>,
    chan_min: Array2<f32>,
    chan_max: Array2<f32>,
    scales_known: bool,
}

impl BandpassLevels {
    pub fn new(num_chans: usize, num_pols: usize) -> BandpassLevels {
        BandpassLevels {
            num_chans,
            num_pols,
            scales: Array2::ones((num_pols, num_chans)),
            offsets: Array2::zeros((num_pols, num_chans)),
            chan_min: Array2::zeros((num_pols, num_chans)),
            chan_max: Array2::zeros((num_pols, num_chans)),
            scales_known: false,
        }
    }

    pub fn scales_known(&self) -> bool {
        self.scales_known
    }

    /// Force a recomputation at the next second (an adaptive-period
    /// boundary, or an operator-requested re-scale).
    pub fn invalidate(&mut self) {
        self.scales_known = false;
    }

    /// Scale vector in container order (`[pol][chan]`, flattened).
    pub fn scales(&self) -> &[f32] {
        self.scales.as_slice().expect("scales are contiguous")
    }

    pub fn offsets(&self) -> &[f32] {
        self.offsets.as_slice().expect("offsets are contiguous")
    }

    /// Recompute scales from one second of spectra, `[step][pol][chan]`.
    /// The scale is the per-channel mean magnitude divided by the target
    /// level; offsets stay zero. Min/max are tracked for the logs.
    pub fn update(&mut self, data: ArrayView3<f32>) {
        let num_steps = data.dim().0;
        debug_assert_eq!(data.dim().1, self.num_pols);
        debug_assert_eq!(data.dim().2, self.num_chans);

        let mut band = Array2::<f64>::zeros((self.num_pols, self.num_chans));
        for (i_step, step) in data.outer_iter().enumerate() {
            for p in 0..self.num_pols {
                for c in 0..self.num_chans {
                    let v = step[(p, c)];
                    band[(p, c)] += v.abs() as f64;
                    if i_step == 0 || v < self.chan_min[(p, c)] {
                        self.chan_min[(p, c)] = v;
                    }
                    if i_step == 0 || v > self.chan_max[(p, c)] {
                        self.chan_max[(p, c)] = v;
                    }
                }
            }
        }

        for p in 0..self.num_pols {
            for c in 0..self.num_chans {
                self.scales[(p, c)] =
                    ((band[(p, c)] / num_steps as f64) / DETECTED_TARGET_LEVEL) as f32;
                self.offsets[(p, c)] = 0.0;
            }
        }
        self.scales_known = true;
        debug!(
            "Recomputed detected-stream scales; global min {:e}, max {:e}",
            self.chan_min.iter().copied().fold(f32::INFINITY, f32::min),
            self.chan_max
                .iter()
                .copied()
                .fold(f32::NEG_INFINITY, f32::max),
        );
    }

    /// Normalise one second of spectra in place. A zero scale means the
    /// channel carried no power when the scales were computed; its samples
    /// stay zero rather than becoming NaN.
    pub fn apply(&self, mut data: ArrayViewMut3<f32>) {
        for mut step in data.outer_iter_mut() {
            for p in 0..self.num_pols {
                for c in 0..self.num_chans {
                    let scale = self.scales[(p, c)];
                    let v = &mut step[(p, c)];
                    *v = if scale != 0.0 {
                        (*v - self.offsets[(p, c)]) / scale
                    } else {
                        0.0
                    };
                }
            }
        }
    }

    /// Quantise a normalised second into offset-binary bytes, flattened in
    /// `[step][pol][chan]` order.
    pub fn quantise(&self, data: ArrayView3<f32>, out: &mut Vec<u8>) {
        let flat = data.as_standard_layout();
        quantise_to_offset_binary(flat.as_slice().expect("standard layout"), out);
    }
}

/// Quantisation state for one voltage stream: per-pol scales (the complex
/// standard deviation) and the occupancy-searched gain.
pub struct VoltageLevels {
    scales: [f32; 2],
    offsets: [f32; 2],
    gain: f64,
    scales_known: bool,
}

impl Default for VoltageLevels {
    fn default() -> Self {
        Self::new()
    }
}

impl VoltageLevels {
    pub fn new() -> VoltageLevels {
        VoltageLevels {
            scales: [1.0; 2],
            offsets: [0.0; 2],
            gain: 1.0,
            scales_known: false,
        }
    }

    pub fn scales_known(&self) -> bool {
        self.scales_known
    }

    pub fn invalidate(&mut self) {
        self.scales_known = false;
    }

    pub fn scales(&self) -> &[f32; 2] {
        &self.scales
    }

    pub fn offsets(&self) -> &[f32; 2] {
        &self.offsets
    }

    pub fn gain(&self) -> f64 {
        self.gain
    }

    /// Recompute scales and gain from one second of interleaved
    /// re/im-interleaved voltage samples. Fails if the stream's mean real
    /// part is significantly non-zero.
    pub fn update(&mut self, data: &[f32]) -> Result<(), LevelError> {
        let num_complex = data.len() / 2;
        let mut re_total = 0.0f64;
        let mut im_total = 0.0f64;
        let mut re_sq = 0.0f64;
        let mut im_sq = 0.0f64;
        for pair in data.chunks_exact(2) {
            re_total += pair[0] as f64;
            im_total += pair[1] as f64;
            re_sq += (pair[0] as f64).powi(2);
            im_sq += (pair[1] as f64).powi(2);
        }
        let re_mean = re_total / num_complex as f64;
        let im_mean = im_total / num_complex as f64;
        // Standard deviation assuming zero mean, which the check below
        // enforces.
        let re_sigma = (re_sq / (num_complex - 1) as f64).sqrt();
        let im_sigma = (im_sq / (num_complex - 1) as f64).sqrt();
        debug!("Voltage stream mean (re, im): ({re_mean:e}, {im_mean:e}); sigma: ({re_sigma:e}, {im_sigma:e})");

        if re_mean.abs() > VOLTAGE_MEAN_TOLERANCE {
            return Err(LevelError::NonZeroMean { mean: re_mean });
        }

        self.scales = [re_sigma as f32, re_sigma as f32];
        self.offsets = [0.0, 0.0];
        self.gain = occupancy_gain(data, self.gain);
        self.scales_known = true;
        Ok(())
    }

    /// Apply the searched gain in place.
    pub fn apply(&self, data: &mut [f32]) {
        let gain = self.gain as f32;
        for v in data.iter_mut() {
            *v *= gain;
        }
    }
}

/// Search for the gain that fills the 8-bit range: back off in small steps
/// until almost nothing clips, or push up while the first 64 positive levels
/// still hold a good share of the samples. The real parts are sorted once so
/// each candidate gain costs two binary searches rather than a pass over the
/// second.
fn occupancy_gain(data: &[f32], start: f64) -> f64 {
    const MAX_ITERATIONS: usize = 200_000;

    let num_complex = data.len() / 2;
    if num_complex == 0 {
        return start;
    }
    let mut sorted_re: Vec<f32> = data.iter().step_by(2).copied().collect();
    sorted_re.sort_by(f32::total_cmp);
    let mut sorted_abs: Vec<f32> = sorted_re.iter().map(|v| v.abs()).collect();
    sorted_abs.sort_by(f32::total_cmp);
    if sorted_abs[num_complex - 1] == 0.0 {
        return start;
    }

    // Fraction of samples with |gain * re| > 127.
    let clipped_fraction = |gain: f64| -> f64 {
        let threshold = (127.0 / gain) as f32;
        let clipped = num_complex - sorted_abs.partition_point(|&v| v <= threshold);
        clipped as f64 / num_complex as f64
    };
    // Fraction of samples with 0 <= gain * re < 64.
    let low_level_occupancy = |gain: f64| -> f64 {
        let threshold = (64.0 / gain) as f32;
        let low = sorted_re.partition_point(|&v| v < threshold)
            - sorted_re.partition_point(|&v| v < 0.0);
        low as f64 / num_complex as f64
    };

    let mut gain = start.max(GAIN_SEARCH_STEP);
    for _ in 0..MAX_ITERATIONS {
        if clipped_fraction(gain) > GAIN_CLIP_FRACTION_LIMIT {
            if gain <= GAIN_SEARCH_STEP {
                break;
            }
            gain -= GAIN_SEARCH_STEP;
        } else {
            let next = gain + GAIN_SEARCH_STEP;
            if clipped_fraction(next) > GAIN_CLIP_FRACTION_LIMIT
                || low_level_occupancy(next) < 0.5
            {
                break;
            }
            gain = next;
        }
    }
    debug!(
        "Occupancy gain search settled on {gain}; {:.3}% of samples in the first 64 positive levels, {:.5}% clipped",
        low_level_occupancy(gain) * 100.0,
        clipped_fraction(gain) * 100.0,
    );
    gain
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn ramp_second(num_steps: usize, num_pols: usize, num_chans: usize) -> Array3<f32> {
        let mut data = Array3::zeros((num_steps, num_pols, num_chans));
        for s in 0..num_steps {
            for p in 0..num_pols {
                for c in 0..num_chans {
                    data[(s, p, c)] = (s as f32 + 1.0) * (c as f32 + 1.0) * (p as f32 + 1.0);
                }
            }
        }
        data
    }

    #[test]
    fn updating_twice_gives_identical_scales() {
        let data = ramp_second(16, 4, 8);
        let mut levels = BandpassLevels::new(8, 4);
        levels.update(data.view());
        let first: Vec<f32> = levels.scales().to_vec();
        levels.update(data.view());
        assert_eq!(levels.scales(), first.as_slice());
    }

    #[test]
    fn applied_data_sits_at_the_target_level() {
        let data = ramp_second(100, 1, 4);
        let mut levels = BandpassLevels::new(4, 1);
        levels.update(data.view());

        let mut normalised = data.clone();
        levels.apply(normalised.view_mut());

        // The per-channel mean magnitude must land on the target.
        for c in 0..4 {
            let mean: f32 =
                normalised.slice(s![.., 0, c]).iter().map(|v| v.abs()).sum::<f32>() / 100.0;
            assert_abs_diff_eq!(mean, DETECTED_TARGET_LEVEL as f32, epsilon = 1e-3);
        }
    }

    #[test]
    fn zero_channels_quantise_to_zero() {
        let data = Array3::<f32>::zeros((10, 1, 4));
        let mut levels = BandpassLevels::new(4, 1);
        levels.update(data.view());
        let mut normalised = data.clone();
        levels.apply(normalised.view_mut());
        let mut bytes = vec![];
        levels.quantise(normalised.view(), &mut bytes);
        for b in bytes {
            assert_eq!(dequantise(b, 1.0, 0.0), 0.0);
        }
    }

    #[test]
    fn quantise_round_trips_within_rounding() {
        // 1/16 steps are exact in binary, so the rounding errors cancel
        // exactly over the symmetric ramp.
        let values: Vec<f32> = (0..4000).map(|i| (i as f32) * 0.0625 - 125.0).collect();
        let mut bytes = vec![];
        quantise_to_offset_binary(&values, &mut bytes);

        // Per-sample error is at most half a level...
        for (v, b) in values.iter().zip(bytes.iter()) {
            assert!((dequantise(*b, 1.0, 0.0) - v).abs() <= 0.5);
        }
        // ...and the mean of the dequantised stream stays with the data.
        let mean_in: f64 = values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64;
        let mean_out: f64 = bytes
            .iter()
            .map(|&b| dequantise(b, 1.0, 0.0) as f64)
            .sum::<f64>()
            / bytes.len() as f64;
        assert!((mean_in - mean_out).abs() < 1e-3);
    }

    #[test]
    fn quantise_clips_silently() {
        let mut bytes = vec![];
        quantise_to_offset_binary(&[1e6, -1e6], &mut bytes);
        assert_eq!(dequantise(bytes[0], 1.0, 0.0), 127.0);
        assert_eq!(dequantise(bytes[1], 1.0, 0.0), -126.0);
    }

    #[test]
    fn non_zero_mean_voltages_are_rejected() {
        // All-positive real parts: the mean is way off zero.
        let data: Vec<f32> = (0..1000).flat_map(|_| [1.0f32, 0.0]).collect();
        let mut levels = VoltageLevels::new();
        assert!(matches!(
            levels.update(&data),
            Err(LevelError::NonZeroMean { .. })
        ));
    }

    #[test]
    fn gain_search_tames_a_clipping_stream() {
        // Alternate +/- 400: everything clips at unit gain.
        let data: Vec<f32> = (0..2000)
            .flat_map(|i| [if i % 2 == 0 { 400.0f32 } else { -400.0 }, 0.1])
            .collect();
        let mut levels = VoltageLevels::new();
        levels.update(&data).unwrap();
        assert!(levels.gain() < 1.0);

        let mut scaled = data;
        levels.apply(&mut scaled);
        let clipped = scaled
            .iter()
            .step_by(2)
            .filter(|v| v.abs() > 127.0)
            .count();
        assert!(
            clipped as f64 / 1000.0 <= GAIN_CLIP_FRACTION_LIMIT,
            "{clipped} samples still clip"
        );
    }

    #[test]
    fn gain_search_lifts_a_quiet_stream() {
        let data: Vec<f32> = (0..2000)
            .flat_map(|i| [if i % 2 == 0 { 0.5f32 } else { -0.5 }, 0.0])
            .collect();
        let mut levels = VoltageLevels::new();
        levels.update(&data).unwrap();
        assert!(levels.gain() > 1.0);
    }
}
