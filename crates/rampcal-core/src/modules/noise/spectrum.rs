//! Per-channel power spectra of CDS data and the broken power-law model of the
//! correlated 1/f component.

use super::cds::cds_pairs;
use super::one_over_f::FixedPatternExtractor;
use crate::common::constants::{SAVGOL_ORDER, SAVGOL_WINDOW};
use crate::common::{CdsPairing, PowerSpectrumConfig, SpectrumMode};
use crate::detector::{DetectorGeometry, DetectorTiming};
use crate::domain::{CalibError, CalibResult, CalibrationStage};
use crate::numerics::{RealPowerSpectrum, median, median_in_place, next_power_of_two, rfft_frequencies};
use ndarray::{Array2, Array3, ArrayView3, Axis};
use serde::Serialize;

/// CDS (or first-frame differences) with frame medians and then pixel medians
/// removed.
pub fn prepare_spectrum_cube(ramp: &Array3<f64>, cds: bool) -> CalibResult<Array3<f64>> {
    let pairing = if cds {
        CdsPairing::Alternating
    } else {
        CdsPairing::FirstFrame
    };
    let mut cube = cds_pairs(ramp.view(), pairing)?;
    for mut frame in cube.axis_iter_mut(Axis(0)) {
        let mut values: Vec<f64> = frame.iter().copied().collect();
        let level = median_in_place(&mut values).unwrap_or(0.0);
        frame -= level;
    }
    let (_, rows, cols) = cube.dim();
    let mut lane = Vec::with_capacity(cube.len_of(Axis(0)));
    for row in 0..rows {
        for col in 0..cols {
            lane.clear();
            lane.extend(cube.slice(ndarray::s![.., row, col]).iter().copied());
            let level = median_in_place(&mut lane).unwrap_or(0.0);
            cube.slice_mut(ndarray::s![.., row, col]).mapv_inplace(|value| value - level);
        }
    }
    Ok(cube)
}

/// Spectral layout for one slab width: padding and the rFFT plan.
#[derive(Clone)]
struct SlabSpectrum {
    mode: SpectrumMode,
    padded_rows: usize,
    padded_width: usize,
    plan: RealPowerSpectrum,
}

impl SlabSpectrum {
    fn new(
        mode: SpectrumMode,
        rows: usize,
        width: usize,
        frames: usize,
        timing: &DetectorTiming,
        config: &PowerSpectrumConfig,
    ) -> CalibResult<Self> {
        let (padded_rows, padded_width) = if config.include_overhead {
            (rows + timing.extra_lines, width + timing.line_overhead)
        } else {
            (rows, width)
        };
        let length = match mode {
            SpectrumMode::Frame => padded_rows * padded_width,
            SpectrumMode::Pixel => frames,
        };
        let length = if config.pad_power_of_two {
            next_power_of_two(length)
        } else {
            length
        };
        Ok(Self {
            mode,
            padded_rows,
            padded_width,
            plan: RealPowerSpectrum::new(length)?,
        })
    }

    fn bin_count(&self) -> usize {
        self.plan.bin_count()
    }

    /// Mean power spectrum of a readout-ordered slab cube `[frames, rows, width]`.
    fn mean_power(&self, slabs: &Array3<f64>) -> Vec<f64> {
        let (frames, rows, width) = slabs.dim();
        let mut total = vec![0.0; self.bin_count()];
        let mut count = 0usize;
        match self.mode {
            SpectrumMode::Frame => {
                let mut flat = vec![0.0; self.padded_rows * self.padded_width];
                for slab in slabs.axis_iter(Axis(0)) {
                    flat.iter_mut().for_each(|value| *value = 0.0);
                    for ((row, col), value) in slab.indexed_iter() {
                        flat[row * self.padded_width + col] = *value;
                    }
                    for (sum, power) in total.iter_mut().zip(self.plan.power(flat.iter().copied())) {
                        *sum += power;
                    }
                    count += 1;
                }
            }
            SpectrumMode::Pixel => {
                for row in 0..rows {
                    for col in 0..width {
                        let series = (0..frames).map(|frame| slabs[(frame, row, col)]);
                        for (sum, power) in total.iter_mut().zip(self.plan.power(series)) {
                            *sum += power;
                        }
                        count += 1;
                    }
                }
            }
        }
        let norm = count.max(1) as f64;
        total.iter_mut().for_each(|value| *value /= norm);
        total
    }
}

fn channel_slabs(cube: ArrayView3<'_, f64>, geometry: &DetectorGeometry, channel: usize) -> Array3<f64> {
    let (frames, rows, _) = cube.dim();
    let mut slabs = Array3::<f64>::zeros((frames, rows, geometry.channel_width));
    for (mut target, frame) in slabs.axis_iter_mut(Axis(0)).zip(cube.axis_iter(Axis(0))) {
        target.assign(&geometry.channel_in_readout_order(frame, channel));
    }
    slabs
}

/// Averaged spectra over every accumulated ramp.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PowerSpectrum {
    pub frequencies: Vec<f64>,
    /// `[channel, bin]`.
    pub total: Array2<f64>,
    pub correlated: Option<Vec<f64>>,
    /// `[channel, bin]`.
    pub uncorrelated: Option<Array2<f64>>,
    pub ramp_count: usize,
}

impl PowerSpectrum {
    /// Mean of the per-channel total spectra.
    pub fn channel_mean(&self) -> Vec<f64> {
        self.total
            .mean_axis(Axis(0))
            .map(|mean| mean.to_vec())
            .unwrap_or_default()
    }
}

/// Streams ramps and keeps running sums of the per-channel spectra.
pub struct PowerSpectrumAccumulator {
    geometry: DetectorGeometry,
    timing: DetectorTiming,
    config: PowerSpectrumConfig,
    extractor: FixedPatternExtractor,
    layout: Option<SlabSpectrum>,
    total: Option<Array2<f64>>,
    correlated: Option<Vec<f64>>,
    uncorrelated: Option<Array2<f64>>,
    ramp_count: usize,
}

impl PowerSpectrumAccumulator {
    pub fn new(
        geometry: &DetectorGeometry,
        timing: &DetectorTiming,
        config: PowerSpectrumConfig,
    ) -> CalibResult<Self> {
        Ok(Self {
            geometry: *geometry,
            timing: timing.clone(),
            extractor: FixedPatternExtractor::new(geometry, SAVGOL_WINDOW, SAVGOL_ORDER, true)?,
            config,
            layout: None,
            total: None,
            correlated: None,
            uncorrelated: None,
            ramp_count: 0,
        })
    }

    fn add_into(target: &mut Option<Array2<f64>>, spectra: Array2<f64>) -> CalibResult<()> {
        match target {
            Some(sum) if sum.dim() == spectra.dim() => *sum += &spectra,
            Some(_) => {
                return Err(CalibError::invalid_configuration(
                    "CONFIG.CUBE_SHAPE",
                    "ramps with different frame counts cannot share a power spectrum",
                ));
            }
            None => *target = Some(spectra),
        }
        Ok(())
    }

    fn channel_spectra(&self, layout: &SlabSpectrum, cube: ArrayView3<'_, f64>) -> Array2<f64> {
        let channels = self.geometry.channel_count;
        let mut spectra = Array2::<f64>::zeros((channels, layout.bin_count()));
        for channel in 0..channels {
            let slabs = channel_slabs(cube, &self.geometry, channel);
            let power = layout.mean_power(&slabs);
            spectra.row_mut(channel).assign(&ndarray::Array1::from(power));
        }
        spectra
    }

    /// Add one reference-corrected ramp.
    pub fn accumulate(&mut self, ramp: &Array3<f64>) -> CalibResult<()> {
        let cube = prepare_spectrum_cube(ramp, self.config.cds)?;
        let (frames, rows, cols) = cube.dim();
        if (rows, cols) != self.geometry.shape() {
            return Err(CalibError::invalid_configuration(
                "CONFIG.CUBE_SHAPE",
                "power spectrum ramp disagrees with the detector shape",
            ));
        }
        let layout = match &self.layout {
            Some(layout) => layout.clone(),
            None => {
                let layout = SlabSpectrum::new(
                    self.config.mode,
                    rows,
                    self.geometry.channel_width,
                    frames,
                    &self.timing,
                    &self.config,
                )?;
                self.layout = Some(layout.clone());
                layout
            }
        };

        let total = self.channel_spectra(&layout, cube.view());
        Self::add_into(&mut self.total, total)?;

        if self.config.correlated || self.config.uncorrelated {
            let width = self.geometry.channel_width;
            let mut shared = Array3::<f64>::zeros((frames, rows, width));
            let mut private = Array3::<f64>::zeros((frames, rows, cols));
            for (index, image) in cube.axis_iter(Axis(0)).enumerate() {
                let pattern = self.extractor.extract(&image.to_owned(), true)?;
                let (correlated, uncorrelated) = self.extractor.split_correlated(&pattern);
                shared.index_axis_mut(Axis(0), index).assign(&correlated);
                private.index_axis_mut(Axis(0), index).assign(&uncorrelated);
            }
            if self.config.correlated {
                let power = layout.mean_power(&shared);
                match &mut self.correlated {
                    Some(sum) => sum.iter_mut().zip(power).for_each(|(sum, value)| *sum += value),
                    None => self.correlated = Some(power),
                }
            }
            if self.config.uncorrelated {
                let spectra = self.channel_spectra(&layout, private.view());
                Self::add_into(&mut self.uncorrelated, spectra)?;
            }
        }

        self.ramp_count += 1;
        self.config
            .verbosity
            .ramp_progress(CalibrationStage::PowerSpectrum, self.ramp_count - 1, None);
        Ok(())
    }

    pub fn finish(self) -> CalibResult<PowerSpectrum> {
        let (Some(layout), Some(total)) = (self.layout, self.total) else {
            return Err(CalibError::invalid_configuration(
                "CONFIG.EMPTY_SOURCE",
                "power spectrum needs at least one ramp",
            ));
        };
        let count = self.ramp_count as f64;
        let spacing = match self.config.mode {
            SpectrumMode::Frame => 1.0 / self.timing.pixel_rate,
            SpectrumMode::Pixel => self.timing.group_time(),
        };
        let frequencies = rfft_frequencies(layout.bin_count(), spacing);
        tracing::info!(
            stage = %CalibrationStage::PowerSpectrum,
            ramps = self.ramp_count,
            bins = frequencies.len(),
            "power spectra averaged"
        );
        Ok(PowerSpectrum {
            frequencies,
            total: total / count,
            correlated: self
                .correlated
                .map(|sum| sum.into_iter().map(|value| value / count).collect()),
            uncorrelated: self.uncorrelated.map(|sum| sum / count),
            ramp_count: self.ramp_count,
        })
    }
}

/// `f^alpha` with the zero-frequency bin set to zero.
fn power_law_shape(frequencies: &[f64], alpha: f64) -> Vec<f64> {
    frequencies
        .iter()
        .map(|f| if *f > 0.0 { f.powf(alpha) } else { 0.0 })
        .collect()
}

/// Scale factors of `f^alpha` in a low and a high frequency band: medians of
/// `ps / f^alpha` over each band.
pub fn fit_correlated_power_law(
    frequencies: &[f64],
    power: &[f64],
    band_low: [f64; 2],
    band_high: [f64; 2],
    alpha: f64,
) -> CalibResult<[f64; 2]> {
    let shape = power_law_shape(frequencies, alpha);
    let scale_in = |band: [f64; 2]| -> CalibResult<f64> {
        let ratios: Vec<f64> = frequencies
            .iter()
            .zip(&shape)
            .zip(power)
            .filter(|((f, y), _)| **f >= band[0] && **f <= band[1] && **y > 0.0)
            .map(|((_, y), p)| p / y)
            .collect();
        median(&ratios).ok_or_else(|| {
            CalibError::numeric_degeneracy(
                "NUMERIC.SPECTRUM_BAND",
                format!("no frequency bins inside [{}, {}]", band[0], band[1]),
            )
        })
    };
    Ok([scale_in(band_low)?, scale_in(band_high)?])
}

/// Two-segment power law, log-log interpolated between `cut_low` and `cut_high`.
pub fn broken_power_law(
    frequencies: &[f64],
    scales: [f64; 2],
    cut_low: f64,
    cut_high: f64,
    alpha: f64,
) -> Vec<f64> {
    let shape = power_law_shape(frequencies, alpha);
    let mut model: Vec<f64> = frequencies
        .iter()
        .zip(&shape)
        .map(|(f, y)| {
            if *f <= cut_low {
                scales[0] * y
            } else if *f >= cut_high {
                scales[1] * y
            } else {
                f64::NAN
            }
        })
        .collect();

    let anchor = |index: usize| -> Option<(f64, f64)> {
        let (f, value) = (frequencies[index], model[index]);
        (f > 0.0 && value > 0.0).then(|| (f.log10(), value.log10()))
    };
    let low = frequencies.iter().rposition(|f| *f <= cut_low).and_then(anchor);
    let high = frequencies.iter().position(|f| *f >= cut_high).and_then(anchor);

    for (index, f) in frequencies.iter().enumerate() {
        if !(*f > cut_low && *f < cut_high) {
            continue;
        }
        let x = f.log10();
        let log_value = match (low, high) {
            (Some((x0, y0)), Some((x1, y1))) => y0 + (y1 - y0) * (x - x0) / (x1 - x0),
            (Some((_, y)), None) | (None, Some((_, y))) => y,
            (None, None) => f64::NEG_INFINITY,
        };
        model[index] = 10.0_f64.powf(log_value);
    }
    model
}

/// Flat white noise, uncorrelated `1/f`, and the fitted correlated broken law,
/// each normalized so its mean over bins equals its variance share.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoiseSpectrumModel {
    pub frequencies: Vec<f64>,
    pub white: Vec<f64>,
    pub uncorrelated: Vec<f64>,
    pub correlated: Vec<f64>,
    pub total: Vec<f64>,
    pub correlated_scales: [f64; 2],
}

fn normalized(shape: &[f64], variance: f64) -> Vec<f64> {
    let sum: f64 = shape.iter().sum();
    if sum <= 0.0 {
        return vec![0.0; shape.len()];
    }
    let bins = shape.len() as f64;
    shape.iter().map(|y| bins * variance * y / sum).collect()
}

impl NoiseSpectrumModel {
    /// `white`, `uncorrelated` and `correlated` are CDS noise amplitudes in DN.
    pub fn from_components(
        frequencies: &[f64],
        mean_power: &[f64],
        white: f64,
        uncorrelated: f64,
        correlated: f64,
        config: &PowerSpectrumConfig,
    ) -> CalibResult<Self> {
        let flat = vec![1.0; frequencies.len()];
        let white_model = normalized(&flat, white * white);
        let pink = power_law_shape(frequencies, config.alpha);
        let uncorrelated_model =
            normalized(&pink, uncorrelated * uncorrelated / std::f64::consts::SQRT_2);

        let residual: Vec<f64> = mean_power
            .iter()
            .zip(&white_model)
            .zip(&uncorrelated_model)
            .map(|((p, w), u)| p - w - u)
            .collect();
        let scales = fit_correlated_power_law(
            frequencies,
            &residual,
            config.band_low,
            config.band_high,
            config.alpha,
        )?;
        let broken = broken_power_law(
            frequencies,
            scales,
            config.cut_low,
            config.cut_high,
            config.alpha,
        );
        let broken: Vec<f64> = broken.into_iter().map(|v| if v.is_finite() { v } else { 0.0 }).collect();
        let correlated_model =
            normalized(&broken, correlated * correlated / std::f64::consts::SQRT_2);

        let total = white_model
            .iter()
            .zip(&uncorrelated_model)
            .zip(&correlated_model)
            .map(|((w, u), c)| w + u + c)
            .collect();
        Ok(Self {
            frequencies: frequencies.to_vec(),
            white: white_model,
            uncorrelated: uncorrelated_model,
            correlated: correlated_model,
            total,
            correlated_scales: scales,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{broken_power_law, fit_correlated_power_law, normalized, prepare_spectrum_cube};
    use ndarray::Array3;

    #[test]
    fn band_scales_recover_pure_pink_spectrum() {
        let frequencies: Vec<f64> = (0..201).map(|k| k as f64 * 0.5).collect();
        let power: Vec<f64> = frequencies
            .iter()
            .map(|f| if *f > 0.0 { 4.0 / f } else { 0.0 })
            .collect();
        let scales =
            fit_correlated_power_law(&frequencies, &power, [0.0, 1.0], [10.0, 100.0], -1.0)
                .expect("bands populated");
        assert!((scales[0] - 4.0).abs() < 1.0e-12);
        assert!((scales[1] - 4.0).abs() < 1.0e-12);
    }

    #[test]
    fn broken_law_interpolates_between_cuts() {
        let frequencies: Vec<f64> = vec![0.0, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0];
        let model = broken_power_law(&frequencies, [2.0, 8.0], 1.0, 10.0, -1.0);
        assert_eq!(model[0], 0.0);
        assert!((model[2] - 2.0).abs() < 1.0e-12);
        assert!((model[5] - 0.8).abs() < 1.0e-12);
        // Straight line in log-log between (1, 2) and (10, 0.8).
        let expected = 10f64.powf(2f64.log10() + (0.8f64.log10() - 2f64.log10()) * 5f64.log10());
        assert!((model[4] - expected).abs() < 1.0e-12);
    }

    #[test]
    fn normalized_shape_has_mean_equal_to_variance() {
        let shape = vec![0.0, 1.0, 0.5, 0.25];
        let model = normalized(&shape, 3.0);
        let mean = model.iter().sum::<f64>() / model.len() as f64;
        assert!((mean - 3.0).abs() < 1.0e-12);
    }

    #[test]
    fn prepared_cube_has_zero_pixel_medians() {
        let ramp = Array3::from_shape_fn((6, 3, 3), |(k, r, c)| (k * 5 + r * 2 + c) as f64 + (k % 2) as f64 * 0.3);
        let cube = prepare_spectrum_cube(&ramp, true).expect("cube");
        assert_eq!(cube.dim(), (3, 3, 3));
        for value in cube.iter() {
            assert!(value.abs() < 1.0e-12);
        }
    }
}
