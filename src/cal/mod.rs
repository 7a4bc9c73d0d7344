// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Per-second calibration inputs.

The delay/calibration solver runs upstream and leaves behind plain streams:

- a weights file, one real value per antenna-polarisation input (0 flags the
  input), read once per run;
- a phases stream per pointing, `num_inputs * num_chans` radians per second,
  consumed incrementally;
- a Jones stream, four complex pairs per antenna per second, row-major 2x2,
  consumed incrementally.

The solver has already conjugated the sky, so Jones entries are conjugated on
read before Frobenius normalisation and inversion. A zero-norm forward Jones
marks a flagged antenna and maps to the all-zero inverse; the beamforming
loops then see that antenna contribute nothing without any special-casing.

Antenna gains are optional and come as either a MIRIAD-style file (one
complex value per input) or a CASA-style file (one complex value per input
per coarse channel, with one channel selected at load time).
 */

mod error;

pub use error::CalibrationError;

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use log::{debug, trace};
use marlu::{c64, Jones};
use ndarray::prelude::*;
use vec1::Vec1;

use crate::constants::{NUM_COARSE_CHANS, NUM_POLS};
use crate::math::{inv2x2, norm2x2};

/// Everything the beamforming loops need for one second. The weights have
/// shape `[pointing][input][fine_chan]`; the inverse Jones matrices are per
/// antenna.
pub struct CalTables {
    pub weights: Array3<c64>,
    pub inv_jones: Option<Vec<Jones<f64>>>,
    pub gains: Option<Vec<c64>>,
    pub flag_weights: Vec<f64>,
    pub wsum: f64,
}

impl CalTables {
    /// True if every complex weight is zero; a whole second of zeros from the
    /// solver yields a second of zero coherent output, which deserves a
    /// warning but not an abort.
    pub fn all_zero(&self) -> bool {
        self.weights.iter().all(|w| *w == c64::new(0.0, 0.0))
    }
}

/// A whitespace-delimited ASCII stream of numbers, consumed block by block.
/// Keeping the reader open between seconds does the job of the original
/// byte-offset checkpointing.
struct ValueStream {
    file: String,
    reader: BufReader<File>,
    queued: VecDeque<f64>,
}

impl ValueStream {
    fn open(path: &Path) -> Result<ValueStream, CalibrationError> {
        let file = path.display().to_string();
        let f = File::open(path).map_err(|err| CalibrationError::Open {
            file: file.clone(),
            err,
        })?;
        Ok(ValueStream {
            file,
            reader: BufReader::new(f),
            queued: VecDeque::new(),
        })
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<Vec<f64>, CalibrationError> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            if let Some(v) = self.queued.pop_front() {
                out.push(v);
                continue;
            }
            let mut line = String::new();
            if self.reader.read_line(&mut line)? == 0 {
                return Err(CalibrationError::Unparseable {
                    file: self.file.clone(),
                    what,
                    expected: n,
                    got: out.len(),
                });
            }
            for tok in line.split_whitespace() {
                let v: f64 = tok.parse().map_err(|_| CalibrationError::ParseFloat {
                    file: self.file.clone(),
                    text: tok.to_string(),
                })?;
                self.queued.push_back(v);
            }
        }
        Ok(out)
    }
}

/// Supplies calibration tables to the scheduler, one pull per second. The
/// scheduler asks; nothing here calls back into the beamformer.
pub struct CalibrationProvider {
    num_inputs: usize,
    num_chans: usize,
    flag_weights: Vec<f64>,
    wsum: f64,
    phases: Option<Vec1<ValueStream>>,
    jones: Option<ValueStream>,
    gains: Option<Vec<c64>>,
}

impl CalibrationProvider {
    pub fn new(
        num_ants: usize,
        num_chans: usize,
        weights_file: Option<&Path>,
        phases_files: Option<&Vec1<PathBuf>>,
        jones_file: Option<&Path>,
        gains: Option<Vec<c64>>,
    ) -> Result<CalibrationProvider, CalibrationError> {
        let num_inputs = num_ants * NUM_POLS;

        let flag_weights = match weights_file {
            Some(path) => read_weights_file(path, num_inputs)?,
            None => vec![1.0; num_inputs],
        };
        let wsum: f64 = flag_weights.iter().map(|w| w * w).sum();
        if wsum == 0.0 {
            return Err(CalibrationError::AllInputsFlagged);
        }
        debug!("Weight sum over {} inputs: {}", num_inputs, wsum);

        let phases = match phases_files {
            Some(files) => {
                let mut streams = vec![];
                for path in files {
                    streams.push(ValueStream::open(path)?);
                }
                Some(Vec1::try_from_vec(streams).unwrap())
            }
            None => None,
        };
        let jones = match jones_file {
            Some(path) => Some(ValueStream::open(path)?),
            None => None,
        };

        if let Some(gains) = &gains {
            if gains.len() != num_inputs {
                return Err(CalibrationError::ShapeMismatch {
                    file: "antenna gains".to_string(),
                    what: "gains",
                    expected: num_inputs,
                    got: gains.len(),
                });
            }
        }

        Ok(CalibrationProvider {
            num_inputs,
            num_chans,
            flag_weights,
            wsum,
            phases,
            jones,
            gains,
        })
    }

    /// The number of pointings is the number of phases streams; with no
    /// phases there is a single (incoherent or flat-weighted) pointing.
    pub fn num_pointings(&self) -> usize {
        self.phases.as_ref().map(|p| p.len()).unwrap_or(1)
    }

    pub fn wsum(&self) -> f64 {
        self.wsum
    }

    /// Pull the calibration tables for the next second. The streams are
    /// consumed in GPS order; the caller drives exactly one pull per second.
    pub fn next_second(&mut self) -> Result<CalTables, CalibrationError> {
        let num_pointings = self.num_pointings();
        let mut weights = Array3::zeros((num_pointings, self.num_inputs, self.num_chans));

        match &mut self.phases {
            Some(streams) => {
                for (k, stream) in streams.iter_mut().enumerate() {
                    let phases = stream.take(self.num_inputs * self.num_chans, "phases")?;
                    for i in 0..self.num_inputs {
                        let w = self.flag_weights[i];
                        for c in 0..self.num_chans {
                            let phase = phases[i * self.num_chans + c];
                            weights[(k, i, c)] = c64::new(0.0, phase).exp() * w;
                        }
                    }
                }
            }
            None => {
                for i in 0..self.num_inputs {
                    let w = c64::new(self.flag_weights[i], 0.0);
                    weights.slice_mut(s![0, i, ..]).fill(w);
                }
            }
        }

        let inv_jones = match &mut self.jones {
            Some(stream) => Some(read_jones_second(stream, self.num_inputs / NUM_POLS)?),
            None => None,
        };

        Ok(CalTables {
            weights,
            inv_jones,
            gains: self.gains.clone(),
            flag_weights: self.flag_weights.clone(),
            wsum: self.wsum,
        })
    }
}

fn read_weights_file(path: &Path, num_inputs: usize) -> Result<Vec<f64>, CalibrationError> {
    let file = path.display().to_string();
    debug!("Reading weights from {file}");
    let mut stream = ValueStream::open(path)?;
    let weights = stream.take(num_inputs, "weights")?;
    // Trailing values mean the file was made for a different array.
    if stream.take(1, "weights").is_ok() {
        return Err(CalibrationError::ShapeMismatch {
            file,
            what: "weights",
            expected: num_inputs,
            got: num_inputs + 1,
        });
    }
    Ok(weights)
}

/// Read one second's worth of Jones matrices and convert them to normalised
/// inverses.
fn read_jones_second(
    stream: &mut ValueStream,
    num_ants: usize,
) -> Result<Vec<Jones<f64>>, CalibrationError> {
    let mut inv = Vec::with_capacity(num_ants);
    for i_ant in 0..num_ants {
        let vals = stream.take(8, "Jones entries")?;
        // The solver conjugates the sky, so undo that here.
        let mut j = Jones::from([
            c64::new(vals[0], -vals[1]),
            c64::new(vals[2], -vals[3]),
            c64::new(vals[4], -vals[5]),
            c64::new(vals[6], -vals[7]),
        ]);

        let fnorm = norm2x2(j);
        if fnorm == 0.0 {
            // Flagged antenna.
            trace!("Antenna {i_ant} has a zero Jones matrix; flagging");
            inv.push(Jones::default());
            continue;
        }
        j = Jones::from([j[0] / fnorm, j[1] / fnorm, j[2] / fnorm, j[3] / fnorm]);
        inv.push(inv2x2(j)?);
    }
    Ok(inv)
}

/// The recognised antenna-gains file layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GainsFormat {
    /// One complex value per input.
    Miriad,
    /// One complex value per input per coarse channel.
    Casa,
}

/// Read an antenna-gains file, working out its format from the line shape.
/// For CASA-style files, `coarse_chan` selects the column (counted from the
/// other end of the band when `reverse` is set, for observations recorded
/// with descending receiver channels).
pub fn read_gains_file(
    path: &Path,
    num_ants: usize,
    coarse_chan: usize,
    chan_to_get: Option<usize>,
    reverse: bool,
) -> Result<Vec<c64>, CalibrationError> {
    let file = path.display().to_string();
    let num_inputs = num_ants * NUM_POLS;

    let f = File::open(path).map_err(|err| CalibrationError::Open {
        file: file.clone(),
        err,
    })?;
    let mut rows: Vec<Vec<f64>> = vec![];
    for line in BufReader::new(f).lines() {
        let line = line?;
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let mut row = vec![];
        for tok in line.split_whitespace() {
            row.push(tok.parse().map_err(|_| CalibrationError::ParseFloat {
                file: file.clone(),
                text: tok.to_string(),
            })?);
        }
        rows.push(row);
    }

    if rows.len() != num_inputs {
        return Err(CalibrationError::ShapeMismatch {
            file,
            what: "gain rows",
            expected: num_inputs,
            got: rows.len(),
        });
    }

    let tokens = rows[0].len();
    let format = if tokens == 2 {
        GainsFormat::Miriad
    } else if tokens == 2 * NUM_COARSE_CHANS {
        GainsFormat::Casa
    } else {
        return Err(CalibrationError::UnknownGainsFormat { file, tokens });
    };
    debug!("Antenna gains file {file} looks like {format:?}");

    let chan = match format {
        GainsFormat::Miriad => 0,
        GainsFormat::Casa => match chan_to_get {
            Some(c) => c,
            None if reverse => NUM_COARSE_CHANS - 1 - coarse_chan,
            None => coarse_chan,
        },
    };

    let mut gains = Vec::with_capacity(num_inputs);
    for (i, row) in rows.iter().enumerate() {
        if row.len() != tokens {
            return Err(CalibrationError::ShapeMismatch {
                file: format!("{file} (row {i})"),
                what: "gain values",
                expected: tokens,
                got: row.len(),
            });
        }
        gains.push(c64::new(row[2 * chan], row[2 * chan + 1]));
    }
    Ok(gains)
}
