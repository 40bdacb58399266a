//! Behavior of the top/bottom reference rows across an ensemble: master and
//! per-amplifier offsets, even/odd column offsets and how well the reference
//! level tracks the active pixels.

use crate::common::ReferencePixelConfig;
use crate::detector::{DetectorGeometry, PixelMasks, ReferenceCorrector, masked_values};
use crate::domain::{CalibError, CalibResult, CalibrationStage};
use crate::numerics::{
    PolyBasis, mean, median_abs_deviation, median_in_place, poly_eval, poly_fit, population_std,
    robust_std,
};
use ndarray::{Array2, Array3, Axis, s};
use serde::Serialize;

/// Offsets measured on one ramp.
#[derive(Debug, Clone, PartialEq)]
struct RampReferenceOffsets {
    master_mean: f64,
    master_frame_std: f64,
    amp_mean: Vec<f64>,
    amp_frame_std: Vec<f64>,
    even_column: Vec<f64>,
    odd_column: Vec<f64>,
    instability: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferencePixelSummary {
    pub master_bias_mean: f64,
    /// Ramp-to-ramp scatter of the master offset.
    pub master_bias_std: f64,
    pub master_bias_frame_std: f64,
    pub amp_offset_mean: Vec<f64>,
    /// Ramp-to-ramp scatter per channel after removing the master trend.
    pub amp_offset_std: Vec<f64>,
    pub amp_offset_frame_std: Vec<f64>,
    /// Per channel `[intercept, slope]` of the amp offset against the master offset.
    pub master_amp_coefficients: Vec<[f64; 2]>,
    pub even_column_offset: Vec<f64>,
    pub odd_column_offset: Vec<f64>,
    pub reference_instability: Vec<f64>,
    pub ramp_count: usize,
}

fn frame_medians(cube: &Array3<f64>, mask: &Array2<bool>) -> Vec<f64> {
    cube.axis_iter(Axis(0))
        .map(|frame| {
            let mut values = masked_values(frame, mask);
            median_in_place(&mut values).unwrap_or(f64::NAN)
        })
        .collect()
}

fn root_mean_square(values: impl Iterator<Item = f64>) -> f64 {
    let squares: Vec<f64> = values.map(|value| value * value).collect();
    mean(&squares).map_or(f64::NAN, f64::sqrt)
}

pub struct ReferencePixelAccumulator<'a> {
    geometry: DetectorGeometry,
    masks: PixelMasks,
    channel_reference: Vec<Array2<bool>>,
    channel_active: Vec<Array2<bool>>,
    corrector: &'a dyn ReferenceCorrector,
    config: ReferencePixelConfig,
    ramps: Vec<RampReferenceOffsets>,
}

impl<'a> ReferencePixelAccumulator<'a> {
    pub fn new(
        geometry: &DetectorGeometry,
        corrector: &'a dyn ReferenceCorrector,
        config: ReferencePixelConfig,
    ) -> CalibResult<Self> {
        if geometry.borders.top + geometry.borders.bottom == 0 {
            return Err(CalibError::invalid_configuration(
                "CONFIG.REFERENCE_ROWS",
                "reference summary needs top or bottom reference rows",
            ));
        }
        let masks = PixelMasks::from_geometry(geometry);
        let channel_reference = (0..geometry.channel_count)
            .map(|channel| masks.reference_rows_in_channel(channel))
            .collect();
        let channel_active = (0..geometry.channel_count)
            .map(|channel| masks.active_in_channel(channel))
            .collect();
        Ok(Self {
            geometry: *geometry,
            masks,
            channel_reference,
            channel_active,
            corrector,
            config,
            ramps: Vec::new(),
        })
    }

    pub fn ramps_accumulated(&self) -> usize {
        self.ramps.len()
    }

    /// Add one bias- and dark-subtracted ramp that has not been reference
    /// corrected yet.
    pub fn accumulate(&mut self, ramp: Array3<f64>) -> CalibResult<()> {
        let (frames, rows, cols) = ramp.dim();
        if (rows, cols) != self.geometry.shape() {
            return Err(CalibError::invalid_configuration(
                "CONFIG.CUBE_SHAPE",
                format!(
                    "ramp frames are {rows}x{cols} but the detector is {}x{}",
                    self.geometry.rows, self.geometry.cols
                ),
            ));
        }
        if frames < 2 {
            return Err(CalibError::numeric_degeneracy(
                "NUMERIC.CDS_FRAMES",
                format!("reference instability needs at least 2 frames, got {frames}"),
            ));
        }

        let mut ramp = ramp;
        let master = frame_medians(&ramp, &self.masks.reference_rows);
        for (mut frame, level) in ramp.axis_iter_mut(Axis(0)).zip(&master) {
            frame -= *level;
        }

        let mut amp_mean = Vec::with_capacity(self.channel_reference.len());
        let mut amp_frame_std = Vec::with_capacity(self.channel_reference.len());
        let mut even_column = Vec::with_capacity(self.channel_reference.len());
        let mut odd_column = Vec::with_capacity(self.channel_reference.len());
        for mask in &self.channel_reference {
            let amp = frame_medians(&ramp, mask);
            let amp_level = mean(&amp).unwrap_or(f64::NAN);
            amp_mean.push(amp_level);
            amp_frame_std.push(robust_std(&amp).unwrap_or(f64::NAN));

            for (parity, offsets) in [(0, &mut even_column), (1, &mut odd_column)] {
                let parity_mask =
                    Array2::from_shape_fn(mask.dim(), |(row, col)| mask[(row, col)] && col % 2 == parity);
                let values: Vec<f64> = ramp
                    .axis_iter(Axis(0))
                    .flat_map(|frame| masked_values(frame, &parity_mask))
                    .collect();
                offsets.push(mean(&values).map_or(f64::NAN, |level| level - amp_level));
            }
        }

        let corrected = self.corrector.correct(ramp, &self.config.correction)?;
        let cds = &corrected.slice(s![1.., .., ..]) - &corrected.slice(s![..-1, .., ..]);
        let instability = self
            .channel_active
            .iter()
            .zip(&self.channel_reference)
            .map(|(active, reference)| {
                let relative: Vec<f64> = frame_medians(&cds, active)
                    .into_iter()
                    .zip(frame_medians(&cds, reference))
                    .map(|(active, reference)| active - reference)
                    .collect();
                population_std(&relative).map_or(f64::NAN, |std| std / std::f64::consts::SQRT_2)
            })
            .collect();

        self.ramps.push(RampReferenceOffsets {
            master_mean: mean(&master).unwrap_or(f64::NAN),
            master_frame_std: robust_std(&master).unwrap_or(f64::NAN),
            amp_mean,
            amp_frame_std,
            even_column,
            odd_column,
            instability,
        });
        self.config.verbosity.ramp_progress(
            CalibrationStage::ReferencePixels,
            self.ramps.len() - 1,
            None,
        );
        Ok(())
    }

    pub fn finish(self) -> CalibResult<ReferencePixelSummary> {
        if self.ramps.is_empty() {
            return Err(CalibError::invalid_configuration(
                "CONFIG.EMPTY_SOURCE",
                "reference summary needs at least one ramp",
            ));
        }
        let channels = self.geometry.channel_count;
        let count = self.ramps.len();
        let masters: Vec<f64> = self.ramps.iter().map(|ramp| ramp.master_mean).collect();

        let channel_mean = |pick: fn(&RampReferenceOffsets) -> &Vec<f64>| -> Vec<f64> {
            (0..channels)
                .map(|channel| {
                    let values: Vec<f64> = self.ramps.iter().map(|ramp| pick(ramp)[channel]).collect();
                    mean(&values).unwrap_or(f64::NAN)
                })
                .collect()
        };
        let channel_rms = |pick: fn(&RampReferenceOffsets) -> &Vec<f64>| -> Vec<f64> {
            (0..channels)
                .map(|channel| root_mean_square(self.ramps.iter().map(|ramp| pick(ramp)[channel])))
                .collect()
        };

        let amp_offset_mean = channel_mean(|ramp| &ramp.amp_mean);
        let mut master_amp_coefficients = Vec::with_capacity(channels);
        let mut amp_offset_std = Vec::with_capacity(channels);
        for (channel, level) in amp_offset_mean.iter().enumerate() {
            let amps: Vec<f64> = self.ramps.iter().map(|ramp| ramp.amp_mean[channel]).collect();
            let coefficients = match poly_fit(&masters, &amps, 1, PolyBasis::Power) {
                Ok(coefficients) => [coefficients[0], coefficients[1]],
                Err(error) => {
                    tracing::debug!(
                        stage = %CalibrationStage::ReferencePixels,
                        channel,
                        %error,
                        "master offset trend not fitted"
                    );
                    [*level, 0.0]
                }
            };
            let detrended: Vec<f64> = masters
                .iter()
                .zip(&amps)
                .map(|(master, amp)| amp - poly_eval(*master, &coefficients, PolyBasis::Power))
                .collect();
            amp_offset_std.push(robust_std(&detrended).unwrap_or(f64::NAN));
            master_amp_coefficients.push(coefficients);
        }

        let summary = ReferencePixelSummary {
            master_bias_mean: mean(&masters).unwrap_or(f64::NAN),
            master_bias_std: median_abs_deviation(&masters).unwrap_or(f64::NAN),
            master_bias_frame_std: root_mean_square(self.ramps.iter().map(|ramp| ramp.master_frame_std)),
            amp_offset_frame_std: channel_rms(|ramp| &ramp.amp_frame_std),
            even_column_offset: channel_mean(|ramp| &ramp.even_column),
            odd_column_offset: channel_mean(|ramp| &ramp.odd_column),
            reference_instability: channel_rms(|ramp| &ramp.instability),
            amp_offset_mean,
            amp_offset_std,
            master_amp_coefficients,
            ramp_count: count,
        };
        tracing::info!(
            stage = %CalibrationStage::ReferencePixels,
            ramps = count,
            master_bias_mean = summary.master_bias_mean,
            master_bias_frame_std = summary.master_bias_frame_std,
            "reference pixel summary complete"
        );
        Ok(summary)
    }
}
