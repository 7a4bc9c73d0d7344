// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Reading and decoding recombined VCS voltage data.

One second of recombined data is a dense byte buffer of shape
`[sample][fine_chan][input]`, where "input" counts antenna-polarisations (X
then Y for each antenna, so the pair stride gives both pols of an antenna
together). Each byte carries one complex sample: the low nibble is the real
part and the high nibble the imaginary part, both signed 4-bit
two's-complement (-8..=7).

Some observations were captured with upstream conventions that need undoing
at decode time; [`SampleFlags`] covers the three known cases and composes
them as decode, then sky conjugation, then polarisation swap.
 */

mod error;

pub use error::VoltageReadError;

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use log::debug;
use marlu::c64;

/// Sign-extend a 4-bit two's-complement nibble.
#[inline]
const fn nibble_to_i8(n: u8) -> i8 {
    (((n & 0xf) as i8) << 4) >> 4
}

/// Split a packed byte into (real, imaginary) signed 4-bit values.
#[inline]
pub const fn unpack_complex(byte: u8) -> (i8, i8) {
    (nibble_to_i8(byte), nibble_to_i8(byte >> 4))
}

/// Pack (real, imaginary) signed 4-bit values into a byte. Values outside
/// -8..=7 are truncated to their low nibble.
#[inline]
pub const fn pack_complex(re: i8, im: i8) -> u8 {
    (re as u8 & 0xf) | ((im as u8 & 0xf) << 4)
}

/// Switches that undo upstream packing conventions, applied at decode time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleFlags {
    /// Treat the high nibble as the real part and the low nibble as the
    /// imaginary part.
    pub swap_complex: bool,

    /// Exchange the X and Y outputs of each antenna.
    pub swap_pol: bool,

    /// Negate the imaginary part of both outputs.
    pub conjugate_sky: bool,
}

#[inline]
fn decode_one(byte: u8, swap_complex: bool) -> c64 {
    let (re, im) = unpack_complex(byte);
    if swap_complex {
        c64::new(im as f64, re as f64)
    } else {
        c64::new(re as f64, im as f64)
    }
}

/// Decode the two packed bytes of an antenna's polarisation pair into
/// working-precision complex voltages, honouring the [`SampleFlags`].
#[inline]
pub fn decode_pair(x_byte: u8, y_byte: u8, flags: SampleFlags) -> (c64, c64) {
    let mut ex = decode_one(x_byte, flags.swap_complex);
    let mut ey = decode_one(y_byte, flags.swap_complex);
    if flags.conjugate_sky {
        ex = ex.conj();
        ey = ey.conj();
    }
    if flags.swap_pol {
        std::mem::swap(&mut ex, &mut ey);
    }
    (ex, ey)
}

/// Locates and reads one-second recombined voltage files for a single coarse
/// channel.
pub struct VoltageReader {
    data_dir: PathBuf,
    obsid: u32,
    coarse_chan: usize,
    bytes_per_second: usize,
}

impl VoltageReader {
    pub fn new<P: AsRef<Path>>(
        data_dir: P,
        obsid: u32,
        coarse_chan: usize,
        bytes_per_second: usize,
    ) -> VoltageReader {
        VoltageReader {
            data_dir: data_dir.as_ref().to_path_buf(),
            obsid,
            coarse_chan,
            bytes_per_second,
        }
    }

    /// The standard recombined-file naming convention.
    pub fn filename(&self, gps_second: u64) -> PathBuf {
        self.data_dir.join(format!(
            "{}_{}_ch{:03}.dat",
            self.obsid, gps_second, self.coarse_chan
        ))
    }

    /// Read the raw second for `gps_second` into `buf`. The file must be
    /// exactly one second long; anything else means the recombine step
    /// upstream went wrong and the run cannot continue.
    pub fn read_second(&self, gps_second: u64, buf: &mut Vec<u8>) -> Result<(), VoltageReadError> {
        let path = self.filename(gps_second);
        let display = path.display().to_string();

        if !path.exists() {
            return Err(VoltageReadError::InputMissing { file: display });
        }
        let meta_len = std::fs::metadata(&path)?.len() as usize;
        if meta_len != self.bytes_per_second {
            return Err(VoltageReadError::InputMalformed {
                file: display,
                expected: self.bytes_per_second,
                got: meta_len,
            });
        }

        debug!("Reading raw second from {display}");
        buf.clear();
        buf.reserve_exact(self.bytes_per_second);
        let mut file = File::open(&path)?;
        let got = file.read_to_end(buf)?;
        if got != self.bytes_per_second {
            return Err(VoltageReadError::InputMalformed {
                file: display,
                expected: self.bytes_per_second,
                got,
            });
        }
        Ok(())
    }
}
