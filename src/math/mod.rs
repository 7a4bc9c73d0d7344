// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Dense 2x2 complex matrix kernels and reduction helpers used by the
beamforming inner loops.

[`Jones`] already supplies copying, multiplication and Hermitian conjugation;
this module adds the operations it doesn't have: a checked inverse, an
elementwise conjugate and the Frobenius norm, plus the pairwise tree sum used
to combine antennas deterministically.
 */

use marlu::{c64, Jones};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MathError {
    /// A 2x2 matrix couldn't be inverted.
    #[error("2x2 matrix is singular (|det| = {det:e})")]
    SingularMatrix { det: f64 },
}

/// Invert a 2x2 complex matrix. Fails if the determinant magnitude is at the
/// level of machine precision.
pub fn inv2x2(m: Jones<f64>) -> Result<Jones<f64>, MathError> {
    let det = m[0] * m[3] - m[1] * m[2];
    if det.norm() < f64::EPSILON {
        return Err(MathError::SingularMatrix { det: det.norm() });
    }
    let inv_det = 1.0 / det;
    Ok(Jones::from([
        m[3] * inv_det,
        -m[1] * inv_det,
        -m[2] * inv_det,
        m[0] * inv_det,
    ]))
}

/// Elementwise complex conjugate of a 2x2 matrix (not the Hermitian
/// transpose; that is [`Jones::h`]).
pub fn conj2x2(m: Jones<f64>) -> Jones<f64> {
    Jones::from([m[0].conj(), m[1].conj(), m[2].conj(), m[3].conj()])
}

/// The Frobenius norm of a 2x2 complex matrix.
pub fn norm2x2(m: Jones<f64>) -> f64 {
    (m[0].norm_sqr() + m[1].norm_sqr() + m[2].norm_sqr() + m[3].norm_sqr()).sqrt()
}

/// Sum a slice of interleaved X,Y complex samples over antennas with a
/// pairwise tree reduction (doubling stride). On return, `buf[0]` holds the
/// sum of all even-indexed elements and `buf[1]` the sum of all odd-indexed
/// elements. The reduction order is fixed, so the result is deterministic for
/// fixed inputs, and pairwise summation bounds the accumulated rounding
/// error.
pub fn tree_sum_pairs(buf: &mut [c64]) {
    let n = buf.len();
    for pol in 0..2 {
        let mut next_good = 2;
        let mut stride = 4;
        while next_good < n {
            let mut step = pol;
            while step < n {
                if step + next_good < n {
                    buf[step] = buf[step] + buf[step + next_good];
                }
                step += stride;
            }
            stride *= 2;
            next_good *= 2;
        }
    }
}
