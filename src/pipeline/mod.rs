// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Driving the beamformer over the observation window.

Seconds are strictly sequential: the adaptive level tracker and the
channeliser-invert tap overlap both carry state from one second into the
next, so there is nothing to gain from speculating ahead. Within a second
the beamforming kernels are data-parallel; between seconds the only overlap
is a staging thread that reads second T+1 from disk while second T is being
beamformed, connected by a bounded channel.

Each second walks the same stages: pull the raw second, refresh the
calibration tables, beamform, re-scale the output levels if an adaptive
period boundary was crossed, quantise, and hand the result to the
containers. A failure at any stage aborts the run without writing the
partial second; a cooperative cancel flag is polled between seconds.
 */

mod args;
mod error;

pub use args::{BeamArgs, BeamMode, BeamParams, StokesSelection};
pub use error::{InvalidParamsError, PipelineError};

use std::thread;

use crossbeam_channel::bounded;
use crossbeam_utils::atomic::AtomicCell;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, trace, warn};
use ndarray::prelude::*;
use scopeguard::defer_on_unwind;

use crate::beamform::{beamform_second, BeamformOpts, DetectedKind};
use crate::cal::{read_gains_file, CalibrationProvider};
use crate::context::ObsContext;
use crate::io::psrfits::{
    floats_to_le_bytes, BinarySubintWriter, SampleType, SubintSink, SubintSpec,
};
use crate::io::vdif::{VdifSpec, VdifWriter};
use crate::levels::{BandpassLevels, VoltageLevels};
use crate::pfb::{InvertMode, VoltageRepacker};
use crate::voltage::VoltageReader;

/// Per-pointing state for a detected output stream.
struct DetectedStream {
    sink: BinarySubintWriter,
    levels: BandpassLevels,
}

/// Per-pointing state for a voltage output stream.
struct VoltageStream {
    repacker: VoltageRepacker,
    levels: VoltageLevels,
    writer: VdifWriter,
}

/// Run the whole window. Polls `cancel` between seconds; a cancelled run is
/// not an error.
pub fn run(params: &BeamParams, cancel: &AtomicCell<bool>) -> Result<(), PipelineError> {
    let ctx = &params.context;
    let num_pols_out = match params.stokes {
        StokesSelection::Iquv => 4,
        StokesSelection::IOnly => 1,
    };

    info!(
        "Beamforming {} second(s) of obsid {}, coarse channel {}, {} mode",
        ctx.num_seconds(),
        ctx.obsid,
        ctx.coarse_chan,
        params.mode
    );
    if params.dry_run {
        info!("Dry run requested; stopping before any data is touched");
        return Ok(());
    }

    let gains = match &params.gains_file {
        Some(path) => Some(read_gains_file(
            path,
            ctx.num_ants,
            ctx.coarse_chan,
            params.gains_chan,
            params.gains_reversed,
        )?),
        None => None,
    };

    let mut provider = CalibrationProvider::new(
        ctx.num_ants,
        ctx.num_chans,
        params.weights_file.as_deref(),
        params.phases_files.as_ref(),
        params.jones_file.as_deref(),
        gains,
    )?;
    let num_pointings = provider.num_pointings();

    let opts = BeamformOpts {
        flags: params.flags,
        apply_jones: params.apply_jones,
        detected: match params.mode {
            BeamMode::DetectedCoherent => Some(DetectedKind::Iquv),
            BeamMode::DetectedIncoherent => Some(DetectedKind::IncoherentI),
            BeamMode::Voltage => None,
        },
        voltages: params.mode == BeamMode::Voltage,
    };

    // Output streams, one per pointing.
    let base_name = |k: usize| {
        params.out_dir.join(format!(
            "{}_{}_ch{:03}_p{:02}",
            ctx.project, ctx.source, ctx.coarse_chan, k
        ))
    };
    let mut detected_streams: Vec<DetectedStream> = vec![];
    let mut voltage_streams: Vec<VoltageStream> = vec![];
    match params.mode {
        BeamMode::DetectedCoherent | BeamMode::DetectedIncoherent => {
            let num_detected = match params.mode {
                BeamMode::DetectedIncoherent => 1,
                _ => num_pointings,
            };
            let spec = SubintSpec {
                nsblk: ctx.sample_rate,
                npol: num_pols_out,
                nchan: ctx.num_chans,
                sample_type: params.sample_type,
            };
            for k in 0..num_detected {
                detected_streams.push(DetectedStream {
                    sink: BinarySubintWriter::create(
                        base_name(k).with_extension("spec.dat"),
                        spec,
                    )?,
                    levels: BandpassLevels::new(ctx.num_chans, num_pols_out),
                });
            }
        }
        BeamMode::Voltage => {
            let spec = VdifSpec {
                samples_per_second: ctx.sample_rate * ctx.num_chans,
            };
            for k in 0..num_pointings {
                let repacker = match params.invert {
                    InvertMode::None => {
                        VoltageRepacker::pass_through(ctx.num_chans, ctx.sample_rate)
                    }
                    InvertMode::Partial88 => {
                        VoltageRepacker::partial(ctx.num_chans, ctx.sample_rate)
                    }
                    InvertMode::Full128 => VoltageRepacker::fir(
                        params
                            .filter
                            .clone()
                            .expect("checked when digesting arguments"),
                        ctx.sample_rate,
                    ),
                };
                let writer =
                    VdifWriter::create(base_name(k), spec, ctx.start_epoch(), *b"mw")?;
                voltage_streams.push(VoltageStream {
                    repacker,
                    levels: VoltageLevels::new(),
                    writer,
                });
            }
        }
    }

    let reader = VoltageReader::new(
        &params.data_dir,
        ctx.obsid,
        ctx.coarse_chan,
        ctx.bytes_per_second(),
    );

    let progress = ProgressBar::with_draw_target(
        Some(ctx.num_seconds() as u64),
        if params.draw_progress {
            ProgressDrawTarget::stdout()
        } else {
            ProgressDrawTarget::hidden()
        },
    )
    .with_style(
        ProgressStyle::default_bar()
            .template("{msg:12}: [{wide_bar:.blue}] {pos:4}/{len:4} seconds ({elapsed_precise}<{eta_precise})")
            .unwrap()
            .progress_chars("=> "),
    )
    .with_message("Beamforming");

    // The staging thread reads raw seconds ahead of the compute loop; the
    // bounded channel keeps at most one second in flight.
    let (tx_raw, rx_raw) = bounded::<(u64, Vec<u8>)>(1);
    let stop = AtomicCell::new(false);

    let scoped_result = thread::scope(|s| {
        let read_handle = {
            // The sender moves into the thread so that a reader error (or a
            // normal end of window) closes the channel and wakes the
            // compute loop.
            let stop = &stop;
            let reader = &reader;
            s.spawn(move || {
                defer_on_unwind! { stop.store(true); }
                for gps in ctx.begin_gps..=ctx.end_gps {
                    if stop.load() || cancel.load() {
                        return Ok(());
                    }
                    let mut buf = vec![];
                    reader.read_second(gps, &mut buf).map_err(|e| {
                        stop.store(true);
                        e
                    })?;
                    if tx_raw.send((gps, buf)).is_err() {
                        // The compute side hung up; it has its own error.
                        return Ok(());
                    }
                }
                Ok(())
            })
        };

        let compute_result = (|| -> Result<(), PipelineError> {
            for second_index in 0..ctx.num_seconds() {
                if cancel.load() {
                    warn!("Cancelled; stopping after {second_index} second(s)");
                    break;
                }
                let (gps, raw) = match rx_raw.recv() {
                    Ok(second) => second,
                    // The reader hit an error and closed the channel; its
                    // error is picked up at join time.
                    Err(_) => break,
                };
                trace!("Second {gps}: loaded");

                let tables = provider.next_second()?;
                if tables.all_zero() {
                    warn!(
                        "Calibration for GPS second {gps} is all zero; \
                         coherent output for this second will be zero"
                    );
                }

                let output = beamform_second(&raw, &tables, ctx.num_chans, &opts);
                trace!("Second {gps}: beamformed");

                // An adaptive-period boundary forces new scales for every
                // stream; otherwise scales are computed once, on the first
                // second.
                let rescale = params.adaptive_period > 0
                    && second_index > 0
                    && second_index as u64 % params.adaptive_period == 0;
                if rescale {
                    debug!("Second {gps}: adaptive period boundary, re-scaling outputs");
                    for stream in detected_streams.iter_mut() {
                        stream.levels.invalidate();
                    }
                    for stream in voltage_streams.iter_mut() {
                        stream.levels.invalidate();
                    }
                }

                if let Some(spectra) = output.spectra.as_ref() {
                    write_detected_second(spectra, &mut detected_streams, params.sample_type)?;
                }
                if let Some(voltages) = output.voltages.as_ref() {
                    write_voltage_second(voltages, &mut voltage_streams, ctx)?;
                }
                trace!("Second {gps}: emitted");

                progress.inc(1);
            }
            Ok(())
        })();

        // Unblock the reader if it's mid-send, then surface its error.
        drop(rx_raw);
        let read_result: Result<(), crate::voltage::VoltageReadError> =
            read_handle.join().unwrap();
        compute_result?;
        read_result?;
        Ok(())
    });

    match &scoped_result {
        Ok(()) => progress.finish_with_message("Done"),
        Err(_) => progress.abandon_with_message("Aborted"),
    }
    scoped_result?;

    info!("Finished cleanly");
    Ok(())
}

/// Quantise and emit one second of detected spectra, one sub-integration
/// per stream.
fn write_detected_second(
    spectra: &Array4<f32>,
    streams: &mut [DetectedStream],
    sample_type: SampleType,
) -> Result<(), PipelineError> {
    let mut bytes = vec![];
    for (k, stream) in streams.iter_mut().enumerate() {
        let second = spectra.index_axis(Axis(0), k);

        match sample_type {
            SampleType::EightBit => {
                if !stream.levels.scales_known() {
                    stream.levels.update(second.view());
                }
                let mut normalised = second.to_owned();
                stream.levels.apply(normalised.view_mut());
                stream.levels.quantise(normalised.view(), &mut bytes);
                stream
                    .sink
                    .write_subint(stream.levels.scales(), stream.levels.offsets(), &bytes)?;
            }
            SampleType::Float32 => {
                // Floats go out unscaled; the scale/offset vectors are
                // vestigial but the layout still carries them.
                let flat = second.as_standard_layout();
                floats_to_le_bytes(flat.as_slice().expect("standard layout"), &mut bytes);
                let unit = vec![1.0f32; second.dim().1 * second.dim().2];
                let zero = vec![0.0f32; unit.len()];
                stream.sink.write_subint(&unit, &zero, &bytes)?;
            }
        }
    }
    Ok(())
}

/// Reconstruct, scale and emit one second of voltage beams. Freshly
/// computed scales go out with the sidecar before any frames quantised
/// against them.
fn write_voltage_second(
    voltages: &Array4<marlu::c64>,
    streams: &mut [VoltageStream],
    ctx: &ObsContext,
) -> Result<(), PipelineError> {
    for (k, stream) in streams.iter_mut().enumerate() {
        let beam = voltages.index_axis(Axis(0), k);
        let mut series = stream.repacker.repack_second(beam);
        if !stream.levels.scales_known() {
            stream.levels.update(&series)?;
            stream
                .writer
                .write_sidecar(ctx, stream.levels.scales(), stream.levels.offsets())?;
        }
        stream.levels.apply(&mut series);
        stream.writer.write_second(&series)?;
    }
    Ok(())
}
