// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Beamforming kernel tests. The small scenarios here are worked through by
//! hand: two antennas, one channel, one sample, with every antenna producing
//! eX = 1+0i and eY = 0+1i (raw bytes 0x01 and 0x10).

use approx::assert_abs_diff_eq;
use marlu::{c64, Jones};
use ndarray::prelude::*;

use super::*;
use crate::cal::CalTables;

/// Flat calibration tables: real weights only, optional inverse Jones.
fn simple_tables(
    num_ants: usize,
    num_chans: usize,
    flag_weights: Vec<f64>,
    inv_jones: Option<Vec<Jones<f64>>>,
) -> CalTables {
    let num_inputs = num_ants * 2;
    assert_eq!(flag_weights.len(), num_inputs);
    let mut weights = Array3::zeros((1, num_inputs, num_chans));
    for i in 0..num_inputs {
        weights
            .slice_mut(s![0, i, ..])
            .fill(c64::new(flag_weights[i], 0.0));
    }
    let wsum = flag_weights.iter().map(|w| w * w).sum();
    CalTables {
        weights,
        inv_jones,
        gains: None,
        flag_weights,
        wsum,
    }
}

fn iquv_opts(flags: SampleFlags) -> BeamformOpts {
    BeamformOpts {
        flags,
        apply_jones: true,
        detected: Some(DetectedKind::Iquv),
        voltages: true,
    }
}

#[test]
fn two_identical_antennas_detect_cleanly() {
    let tables = simple_tables(
        2,
        1,
        vec![1.0; 4],
        Some(vec![Jones::identity(); 2]),
    );
    let raw = [0x01, 0x10, 0x01, 0x10];
    let out = beamform_second(&raw, &tables, 1, &iquv_opts(SampleFlags::default()));

    // B = (2, 2i), normalised voltages (1, i).
    let volt = out.voltages.unwrap();
    assert_abs_diff_eq!(volt[(0, 0, 0, 0)].re, 1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(volt[(0, 0, 0, 0)].im, 0.0, epsilon = 1e-12);
    assert_abs_diff_eq!(volt[(0, 0, 0, 1)].re, 0.0, epsilon = 1e-12);
    assert_abs_diff_eq!(volt[(0, 0, 0, 1)].im, 1.0, epsilon = 1e-12);

    // With wsum = 4: N00 = N11 = 2, N01 = -2i, Bx By* = -4i, so the
    // noise-floor debias leaves I = 1, Q = 0, U = 0, V = 1.
    let spectra = out.spectra.unwrap();
    assert_abs_diff_eq!(spectra[(0, 0, 0, 0)], 1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(spectra[(0, 0, 1, 0)], 0.0, epsilon = 1e-6);
    assert_abs_diff_eq!(spectra[(0, 0, 2, 0)], 0.0, epsilon = 1e-6);
    assert_abs_diff_eq!(spectra[(0, 0, 3, 0)], 1.0, epsilon = 1e-6);
}

#[test]
fn conjugating_the_sky_flips_stokes_v() {
    let tables = simple_tables(
        2,
        1,
        vec![1.0; 4],
        Some(vec![Jones::identity(); 2]),
    );
    let raw = [0x01, 0x10, 0x01, 0x10];
    let flags = SampleFlags {
        conjugate_sky: true,
        ..Default::default()
    };
    let out = beamform_second(&raw, &tables, 1, &iquv_opts(flags));
    let spectra = out.spectra.unwrap();

    // eY becomes -i, so I is unchanged but V changes sign.
    assert_abs_diff_eq!(spectra[(0, 0, 0, 0)], 1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(spectra[(0, 0, 3, 0)], -1.0, epsilon = 1e-6);
}

#[test]
fn flagged_antenna_contributes_nothing() {
    // Antenna 1 is flagged both in the weights and with a zero inverse
    // Jones.
    let tables = simple_tables(
        2,
        1,
        vec![1.0, 1.0, 0.0, 0.0],
        Some(vec![Jones::identity(), Jones::default()]),
    );
    let raw = [0x01, 0x10, 0x01, 0x10];
    let out = beamform_second(&raw, &tables, 1, &iquv_opts(SampleFlags::default()));

    // The coherent beam is antenna 0 alone (B = (1, i), wsum = 2).
    let volt = out.voltages.unwrap();
    let inv_sqrt_wsum = 1.0 / 2.0f64.sqrt();
    assert_abs_diff_eq!(volt[(0, 0, 0, 0)].re, inv_sqrt_wsum, epsilon = 1e-12);
    assert_abs_diff_eq!(volt[(0, 0, 0, 1)].im, inv_sqrt_wsum, epsilon = 1e-12);

    // A single unflagged antenna is pure self-power, which the noise floor
    // removes entirely.
    let spectra = out.spectra.unwrap();
    for pol in 0..4 {
        assert_abs_diff_eq!(spectra[(0, 0, pol, 0)], 0.0, epsilon = 1e-6);
    }
}

#[test]
fn incoherent_sum_ignores_calibration() {
    // The incoherent sum comes from the decoded voltages; a zero inverse
    // Jones must not remove an antenna from it, but a zero weight must.
    let mut tables = simple_tables(
        2,
        1,
        vec![1.0, 1.0, 1.0, 1.0],
        Some(vec![Jones::identity(), Jones::default()]),
    );
    let raw = [0x01, 0x10, 0x01, 0x10];
    let opts = BeamformOpts {
        flags: SampleFlags::default(),
        apply_jones: false,
        detected: Some(DetectedKind::IncoherentI),
        voltages: false,
    };
    let out = beamform_second(&raw, &tables, 1, &opts);
    // All four inputs have |e|^2 = 1: sum = 4 / wsum = 1.
    assert_abs_diff_eq!(out.spectra.unwrap()[(0, 0, 0, 0)], 1.0, epsilon = 1e-6);

    // Now flag antenna 1 in the weights: the sum keeps only antenna 0's
    // inputs and the weight-sum normalisation follows.
    tables.flag_weights = vec![1.0, 1.0, 0.0, 0.0];
    tables.wsum = 2.0;
    let out = beamform_second(&raw, &tables, 1, &opts);
    assert_abs_diff_eq!(out.spectra.unwrap()[(0, 0, 0, 0)], 1.0, epsilon = 1e-6);
}

#[test]
fn zero_input_gives_exactly_zero_output() {
    let tables = simple_tables(
        2,
        2,
        vec![1.0; 4],
        Some(vec![Jones::identity(); 2]),
    );
    let raw = vec![0u8; 3 * 2 * 4];
    let out = beamform_second(&raw, &tables, 2, &iquv_opts(SampleFlags::default()));

    for v in out.spectra.unwrap().iter() {
        assert_eq!(*v, 0.0);
    }
    for v in out.voltages.unwrap().iter() {
        assert_eq!(*v, c64::new(0.0, 0.0));
    }
}

#[test]
fn antenna_permutation_leaves_the_beam_invariant() {
    // Permuting antennas consistently across the raw data, weights and
    // Jones matrices must leave the coherent sum unchanged up to
    // floating-point reassociation.
    let num_ants = 4;
    let num_chans = 2;

    // Distinct per-input bytes and per-input complex weights.
    let bytes_for = |i_ant: usize, c: usize| -> (u8, u8) {
        (
            crate::voltage::pack_complex((i_ant as i8) - 2, (c as i8) + 1),
            crate::voltage::pack_complex((c as i8) - 1, 3 - (i_ant as i8)),
        )
    };
    let weight_for = |input: usize, c: usize| -> c64 {
        c64::new(0.0, 0.3 * input as f64 + 0.7 * c as f64).exp()
    };
    let jones_for = |i_ant: usize| -> Jones<f64> {
        Jones::from([
            c64::new(1.0, 0.1 * i_ant as f64),
            c64::new(0.05, 0.0),
            c64::new(0.0, -0.05),
            c64::new(1.0, -0.1 * i_ant as f64),
        ])
    };

    let build = |order: &[usize]| -> Array4<c64> {
        let num_inputs = num_ants * 2;
        let mut raw = vec![0u8; num_chans * num_inputs];
        let mut weights = Array3::zeros((1, num_inputs, num_chans));
        let mut inv_jones = vec![];
        for (slot, &i_ant) in order.iter().enumerate() {
            inv_jones.push(jones_for(i_ant));
            for c in 0..num_chans {
                let (x, y) = bytes_for(i_ant, c);
                raw[c * num_inputs + 2 * slot] = x;
                raw[c * num_inputs + 2 * slot + 1] = y;
                weights[(0, 2 * slot, c)] = weight_for(2 * i_ant, c);
                weights[(0, 2 * slot + 1, c)] = weight_for(2 * i_ant + 1, c);
            }
        }
        let tables = CalTables {
            weights,
            inv_jones: Some(inv_jones),
            gains: None,
            flag_weights: vec![1.0; num_inputs],
            wsum: num_inputs as f64,
        };
        let opts = BeamformOpts {
            flags: SampleFlags::default(),
            apply_jones: true,
            detected: None,
            voltages: true,
        };
        beamform_second(&raw, &tables, num_chans, &opts)
            .voltages
            .unwrap()
    };

    let natural = build(&[0, 1, 2, 3]);
    let permuted = build(&[2, 0, 3, 1]);
    for (a, b) in natural.iter().zip(permuted.iter()) {
        assert_abs_diff_eq!(a.re, b.re, epsilon = 1e-10);
        assert_abs_diff_eq!(a.im, b.im, epsilon = 1e-10);
    }
}

#[test]
fn stokes_i_and_q_relate_to_the_auto_powers() {
    // I must be the sum and Q the difference of the two debiased auto-power
    // terms; check with inputs where X and Y differ.
    let tables = simple_tables(
        2,
        1,
        vec![1.0; 4],
        Some(vec![Jones::identity(); 2]),
    );
    // Antenna 0: eX = 3, eY = 1. Antenna 1: eX = 2, eY = -1.
    let raw = [
        crate::voltage::pack_complex(3, 0),
        crate::voltage::pack_complex(1, 0),
        crate::voltage::pack_complex(2, 0),
        crate::voltage::pack_complex(-1, 0),
    ];
    let out = beamform_second(&raw, &tables, 1, &iquv_opts(SampleFlags::default()));
    let spectra = out.spectra.unwrap();

    // Bx = 5, By = 0; N00 = 13, N11 = 2; wsum = 4.
    let xx = (25.0 - 13.0) / 4.0;
    let yy = (0.0 - 2.0) / 4.0;
    assert_abs_diff_eq!(spectra[(0, 0, 0, 0)], (xx + yy) as f32, epsilon = 1e-6);
    assert_abs_diff_eq!(spectra[(0, 0, 1, 0)], (xx - yy) as f32, epsilon = 1e-6);
}
