// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
The observation plan.

Everything here is constant for a run and shared read-only by every
component. Instrument metadata is handled by an upstream tool; the values
arrive on the command line (or from whatever drives the library) already
resolved.
 */

use hifitime::Epoch;

use crate::constants::NUM_POLS;

#[derive(Debug, Clone)]
pub struct ObsContext {
    /// The MWA observation ID (the GPS start second of the observation).
    pub obsid: u32,

    /// The number of antennas ("tiles").
    pub num_ants: usize,

    /// Fine channels in the coarse channel being processed.
    pub num_chans: usize,

    /// Time samples per second of VCS data.
    pub sample_rate: usize,

    /// The 0-offset receiver coarse-channel number being processed.
    pub coarse_chan: usize,

    /// First and last GPS seconds to beamform, inclusive.
    pub begin_gps: u64,
    pub end_gps: u64,

    /// Centre frequency of this coarse channel \[MHz\].
    pub fctr_mhz: f64,

    /// Bandwidth of this coarse channel \[MHz\].
    pub bw_mhz: f64,

    /// Source name and J2000 coordinates, for the output headers.
    pub source: String,
    pub ra_str: String,
    pub dec_str: String,

    /// Project identifier, used in output file names.
    pub project: String,
}

impl ObsContext {
    /// The number of antenna-polarisation inputs.
    pub fn num_inputs(&self) -> usize {
        self.num_ants * NUM_POLS
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.num_chans * self.num_inputs()
    }

    /// The exact size of a one-second raw voltage file.
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate * self.bytes_per_sample()
    }

    pub fn num_seconds(&self) -> usize {
        (self.end_gps - self.begin_gps + 1) as usize
    }

    /// Fine-channel width \[MHz\].
    pub fn df_mhz(&self) -> f64 {
        self.bw_mhz / self.num_chans as f64
    }

    /// The centre frequency of each fine channel \[MHz\]:
    /// `f_k = fctr - BW/2 + df/2 + k*df`.
    pub fn chan_freqs_mhz(&self) -> Vec<f64> {
        let df = self.df_mhz();
        let first = self.fctr_mhz - 0.5 * self.bw_mhz + 0.5 * df;
        (0..self.num_chans).map(|k| first + k as f64 * df).collect()
    }

    /// The start of the run window.
    pub fn start_epoch(&self) -> Epoch {
        Epoch::from_gpst_seconds(self.begin_gps as f64)
    }

    pub fn start_mjd(&self) -> f64 {
        self.start_epoch().as_mjd_utc_days()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn context() -> ObsContext {
        ObsContext {
            obsid: 1099414416,
            num_ants: 128,
            num_chans: 128,
            sample_rate: 10_000,
            coarse_chan: 11,
            begin_gps: 1099414416,
            end_gps: 1099414516,
            fctr_mhz: 184.96,
            bw_mhz: 1.28,
            source: "J0437-4715".to_string(),
            ra_str: "04:37:15.8".to_string(),
            dec_str: "-47:15:09.1".to_string(),
            project: "G0024".to_string(),
        }
    }

    #[test]
    fn one_second_is_exactly_one_file() {
        let ctx = context();
        assert_eq!(ctx.num_inputs(), 256);
        assert_eq!(ctx.bytes_per_second(), 10_000 * 128 * 256);
        assert_eq!(ctx.num_seconds(), 101);
    }

    #[test]
    fn fine_channel_frequencies_span_the_coarse_channel() {
        let ctx = context();
        let freqs = ctx.chan_freqs_mhz();
        assert_eq!(freqs.len(), 128);
        // First channel centre: fctr - BW/2 + df/2.
        assert_abs_diff_eq!(freqs[0], 184.96 - 0.64 + 0.005, epsilon = 1e-9);
        // Channel spacing is df everywhere.
        for pair in freqs.windows(2) {
            assert_abs_diff_eq!(pair[1] - pair[0], 0.01, epsilon = 1e-9);
        }
        // The band is symmetric about the centre frequency.
        assert_abs_diff_eq!(
            (freqs[0] + freqs[127]) / 2.0,
            184.96,
            epsilon = 1e-9
        );
    }
}
