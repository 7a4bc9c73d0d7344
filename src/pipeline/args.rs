// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Handling of beamformer arguments.

Strategy: users give arguments (handled here as [`BeamArgs`]); those are
digested into validated parameters ([`BeamParams`]) which the scheduler
consumes. Keeping the two separate keeps validation in one place and the
run loop free of `Option`s.
 */

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use clap::Parser;
use itertools::Itertools;
use log::debug;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};
use vec1::Vec1;

use super::error::InvalidParamsError;
use crate::constants::{DEFAULT_NUM_CHANS, DEFAULT_SAMPLE_RATE};
use crate::context::ObsContext;
use crate::io::psrfits::SampleType;
use crate::pfb::{InvertMode, SynthesisFilter};
use crate::voltage::SampleFlags;

/// Which output pipeline to run.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, EnumIter, EnumString)]
pub enum BeamMode {
    /// Coherently summed, detected Stokes spectra.
    #[strum(serialize = "detected-coherent")]
    DetectedCoherent,

    /// Phase-discarding sum of antenna intensities.
    #[strum(serialize = "detected-incoherent")]
    DetectedIncoherent,

    /// Coherently summed complex voltages.
    #[strum(serialize = "voltage")]
    Voltage,
}

/// How many detected products to write.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, EnumIter, EnumString)]
pub enum StokesSelection {
    #[strum(serialize = "iquv")]
    Iquv,

    #[strum(serialize = "i")]
    IOnly,
}

lazy_static::lazy_static! {
    static ref MODE_HELP: String = format!(
        "The output pipeline to run. Available modes: {}",
        BeamMode::iter().join(", ")
    );

    static ref STOKES_HELP: String = format!(
        "Detected products to write. 'i' is only valid with detected-incoherent. Available: {}",
        StokesSelection::iter().join(", ")
    );

    static ref INVERT_HELP: String = format!(
        "How to invert the fine channeliser in voltage mode. Available: {}",
        InvertMode::iter().join(", ")
    );

    static ref SAMPLE_TYPE_HELP: String = format!(
        "Detected-output sample format. Available: {}",
        SampleType::iter().join(", ")
    );

    static ref SAMPLE_RATE_HELP: String = format!(
        "Time samples per second of input data. Default: {DEFAULT_SAMPLE_RATE}"
    );

    static ref NUM_CHANS_HELP: String = format!(
        "Fine channels per coarse channel. Default: {DEFAULT_NUM_CHANS}"
    );
}

/// Arguments exposed to users of the `make_beam` binary.
#[derive(Parser, Debug)]
#[clap(name = "make_beam", version, about)]
pub struct BeamArgs {
    /// The MWA observation ID.
    #[clap(short, long)]
    pub obsid: u32,

    /// The first GPS second to beamform.
    #[clap(short, long)]
    pub begin: u64,

    /// The last GPS second to beamform (inclusive).
    #[clap(short, long)]
    pub end: u64,

    /// The directory holding the recombined one-second voltage files.
    #[clap(short = 'd', long)]
    pub data_dir: PathBuf,

    /// Where to put the beams.
    #[clap(short = 'D', long, default_value = ".")]
    pub out_dir: PathBuf,

    /// The 0-offset coarse-channel number to process.
    #[clap(short = 'N', long, default_value = "0")]
    pub coarse_chan: usize,

    #[clap(long, help = MODE_HELP.as_str(), default_value = "detected-coherent")]
    pub mode: BeamMode,

    #[clap(long, help = STOKES_HELP.as_str(), default_value = "iquv")]
    pub stokes: StokesSelection,

    /// The number of antennas.
    #[clap(short = 'a', long, default_value = "128")]
    pub num_ants: usize,

    #[clap(short = 'n', long, help = NUM_CHANS_HELP.as_str(), default_value = "128")]
    pub num_chans: usize,

    #[clap(short = 'r', long, help = SAMPLE_RATE_HELP.as_str(), default_value = "10000")]
    pub sample_rate: usize,

    /// Per-input flag/weight file (one value per antenna-polarisation).
    #[clap(short = 'w', long)]
    pub weights_file: Option<PathBuf>,

    /// Per-second phases file; give one per pointing.
    #[clap(short = 'c', long = "phases-file")]
    pub phases_files: Vec<PathBuf>,

    /// Per-second antenna Jones matrix file; implies applying inverse Jones
    /// matrices.
    #[clap(short = 'j', long)]
    pub jones_file: Option<PathBuf>,

    /// MIRIAD- or CASA-style complex antenna gains.
    #[clap(short = 'g', long)]
    pub gains_file: Option<PathBuf>,

    /// The coarse channel to take from a CASA gains file, if not the one
    /// being processed.
    #[clap(short = 'G', long)]
    pub gains_chan: Option<usize>,

    /// Count the CASA gains channel from the other end of the band.
    #[clap(short = 'R', long)]
    pub gains_reversed: bool,

    #[clap(long, help = INVERT_HELP.as_str(), default_value = "none")]
    pub invert: InvertMode,

    /// The forward channeliser's FIR prototype coefficients, for 'full-128'
    /// inversion.
    #[clap(short = 'm', long)]
    pub filter_file: Option<PathBuf>,

    /// Recompute output scaling every this many seconds; 0 means only at
    /// the start of the run.
    #[clap(short = 'A', long, default_value = "0")]
    pub adaptive_period: u64,

    #[clap(short = 't', long, help = SAMPLE_TYPE_HELP.as_str(), default_value = "8bit")]
    pub sample_type: SampleType,

    /// Swap each antenna's polarisations at decode time.
    #[clap(long)]
    pub swap_pol: bool,

    /// Treat the high nibble of each packed sample as the real part.
    #[clap(long)]
    pub swap_complex: bool,

    /// Conjugate the decoded voltages.
    #[clap(long)]
    pub conjugate_sky: bool,

    /// Centre frequency of the coarse channel [MHz].
    #[clap(short = 'f', long, default_value = "184.96")]
    pub fctr_mhz: f64,

    /// Bandwidth of the coarse channel [MHz].
    #[clap(long, default_value = "1.28")]
    pub bw_mhz: f64,

    /// Source name for the output headers.
    #[clap(short = 's', long, default_value = "unset")]
    pub source: String,

    /// J2000 right ascension string for the output headers.
    #[clap(long, default_value = "00:00:00.0")]
    pub ra: String,

    /// J2000 declination string for the output headers.
    #[clap(long, default_value = "00:00:00.0")]
    pub dec: String,

    /// Project identifier, used in output file names.
    #[clap(short = 'p', long, default_value = "P000")]
    pub project: String,

    /// Print the plan and exit without touching any data.
    #[clap(short = 'E', long)]
    pub dry_run: bool,

    /// The verbosity of the program. The default is to print high-level
    /// information.
    #[clap(short, long, parse(from_occurrences))]
    pub verbosity: u8,
}

/// Validated parameters, ready for the scheduler.
pub struct BeamParams {
    pub context: ObsContext,
    pub mode: BeamMode,
    pub stokes: StokesSelection,
    pub flags: SampleFlags,
    pub apply_jones: bool,
    pub invert: InvertMode,
    pub filter: Option<SynthesisFilter>,
    pub adaptive_period: u64,
    pub sample_type: SampleType,
    pub data_dir: PathBuf,
    pub out_dir: PathBuf,
    pub weights_file: Option<PathBuf>,
    pub phases_files: Option<Vec1<PathBuf>>,
    pub jones_file: Option<PathBuf>,
    pub gains_file: Option<PathBuf>,
    pub gains_chan: Option<usize>,
    pub gains_reversed: bool,
    pub dry_run: bool,
    pub draw_progress: bool,
}

impl BeamArgs {
    /// Check the arguments against each other and build the run parameters.
    pub fn into_params(self) -> Result<BeamParams, InvalidParamsError> {
        if self.begin > self.end {
            return Err(InvalidParamsError::BadWindow {
                begin: self.begin,
                end: self.end,
            });
        }
        if self.num_ants == 0 || self.num_chans == 0 || self.sample_rate == 0 {
            return Err(InvalidParamsError::EmptyDimensions);
        }

        let phases_files = Vec1::try_from_vec(self.phases_files).ok();

        match self.mode {
            BeamMode::DetectedCoherent | BeamMode::Voltage => {
                if phases_files.is_none() {
                    return Err(InvalidParamsError::MissingPhases {
                        mode: self.mode.to_string(),
                    });
                }
                if self.stokes == StokesSelection::IOnly {
                    return Err(InvalidParamsError::StokesIWithCoherent);
                }
            }
            BeamMode::DetectedIncoherent => {
                // The incoherent sum has no phase for calibration to act on.
                if phases_files.is_some() || self.jones_file.is_some() {
                    return Err(InvalidParamsError::IncoherentWithCalibration);
                }
            }
        }

        let filter = match (self.mode, self.invert) {
            (BeamMode::Voltage, InvertMode::Full128) => match &self.filter_file {
                None => return Err(InvalidParamsError::MissingFilter),
                Some(path) => Some(SynthesisFilter::from_coeffs(
                    read_filter_file(path)?,
                    self.num_chans,
                )),
            },
            (BeamMode::Voltage, InvertMode::Partial88) => {
                if self.num_chans != DEFAULT_NUM_CHANS {
                    return Err(InvalidParamsError::BadPartialChans {
                        num_chans: self.num_chans,
                    });
                }
                None
            }
            _ => None,
        };

        let apply_jones = self.jones_file.is_some();
        debug!(
            "Mode {} with {} pointing(s); Jones application: {}",
            self.mode,
            phases_files.as_ref().map(|p| p.len()).unwrap_or(1),
            apply_jones
        );

        Ok(BeamParams {
            context: ObsContext {
                obsid: self.obsid,
                num_ants: self.num_ants,
                num_chans: self.num_chans,
                sample_rate: self.sample_rate,
                coarse_chan: self.coarse_chan,
                begin_gps: self.begin,
                end_gps: self.end,
                fctr_mhz: self.fctr_mhz,
                bw_mhz: self.bw_mhz,
                source: self.source,
                ra_str: self.ra,
                dec_str: self.dec,
                project: self.project,
            },
            mode: self.mode,
            stokes: if self.mode == BeamMode::DetectedIncoherent {
                StokesSelection::IOnly
            } else {
                self.stokes
            },
            flags: SampleFlags {
                swap_complex: self.swap_complex,
                swap_pol: self.swap_pol,
                conjugate_sky: self.conjugate_sky,
            },
            apply_jones,
            invert: self.invert,
            filter,
            adaptive_period: self.adaptive_period,
            sample_type: self.sample_type,
            data_dir: self.data_dir,
            out_dir: self.out_dir,
            weights_file: self.weights_file,
            phases_files,
            jones_file: self.jones_file,
            gains_file: self.gains_file,
            gains_chan: self.gains_chan,
            gains_reversed: self.gains_reversed,
            dry_run: self.dry_run,
            draw_progress: atty::is(atty::Stream::Stdout),
        })
    }
}

fn read_filter_file(path: &PathBuf) -> Result<Vec<f64>, InvalidParamsError> {
    let unreadable = |err: String| InvalidParamsError::FilterUnreadable {
        file: path.clone(),
        err,
    };
    let f = File::open(path).map_err(|e| unreadable(e.to_string()))?;
    let mut coeffs = vec![];
    for line in BufReader::new(f).lines() {
        let line = line.map_err(|e| unreadable(e.to_string()))?;
        for tok in line.split_whitespace() {
            coeffs.push(
                tok.parse()
                    .map_err(|_| unreadable(format!("bad coefficient '{tok}'")))?,
            );
        }
    }
    if coeffs.is_empty() {
        return Err(unreadable("no coefficients".to_string()));
    }
    Ok(coeffs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_args() -> BeamArgs {
        BeamArgs {
            obsid: 1099414416,
            begin: 1099414416,
            end: 1099414417,
            data_dir: PathBuf::from("/data"),
            out_dir: PathBuf::from("."),
            coarse_chan: 0,
            mode: BeamMode::DetectedIncoherent,
            stokes: StokesSelection::IOnly,
            num_ants: 128,
            num_chans: 128,
            sample_rate: 10_000,
            weights_file: None,
            phases_files: vec![],
            jones_file: None,
            gains_file: None,
            gains_chan: None,
            gains_reversed: false,
            invert: InvertMode::None,
            filter_file: None,
            adaptive_period: 0,
            sample_type: SampleType::EightBit,
            swap_pol: false,
            swap_complex: false,
            conjugate_sky: false,
            fctr_mhz: 184.96,
            bw_mhz: 1.28,
            source: "unset".to_string(),
            ra: "00:00:00.0".to_string(),
            dec: "00:00:00.0".to_string(),
            project: "P000".to_string(),
            dry_run: false,
            verbosity: 0,
        }
    }

    #[test]
    fn incoherent_needs_no_calibration() {
        let params = minimal_args().into_params().unwrap();
        assert_eq!(params.stokes, StokesSelection::IOnly);
        assert!(!params.apply_jones);
    }

    #[test]
    fn incoherent_rejects_phases() {
        let mut args = minimal_args();
        args.phases_files = vec![PathBuf::from("phases.txt")];
        assert!(matches!(
            args.into_params(),
            Err(InvalidParamsError::IncoherentWithCalibration)
        ));
    }

    #[test]
    fn coherent_needs_phases() {
        let mut args = minimal_args();
        args.mode = BeamMode::DetectedCoherent;
        args.stokes = StokesSelection::Iquv;
        assert!(matches!(
            args.into_params(),
            Err(InvalidParamsError::MissingPhases { .. })
        ));
    }

    #[test]
    fn full_inversion_needs_a_filter() {
        let mut args = minimal_args();
        args.mode = BeamMode::Voltage;
        args.stokes = StokesSelection::Iquv;
        args.phases_files = vec![PathBuf::from("phases.txt")];
        args.invert = InvertMode::Full128;
        assert!(matches!(
            args.into_params(),
            Err(InvalidParamsError::MissingFilter)
        ));
    }

    #[test]
    fn backwards_window_is_rejected() {
        let mut args = minimal_args();
        args.begin = 10;
        args.end = 9;
        assert!(matches!(
            args.into_params(),
            Err(InvalidParamsError::BadWindow { .. })
        ));
    }

    #[test]
    fn mode_strings_round_trip() {
        for mode in BeamMode::iter() {
            let parsed: BeamMode = mode.to_string().parse().unwrap();
            assert_eq!(parsed, mode);
        }
    }
}
