//! Super dark ramp: robust ensemble average of bias-corrected dark ramps with
//! per-ramp pixel classification.
//!
//! Ramps stream through [`DarkRampBuilder::accumulate`] one at a time; only the
//! running sums, the per-ramp offset images and the classification masks are
//! retained.

use crate::common::DarkRampConfig;
use crate::common::constants::{
    LARGE_OFFSET_LIMIT, NEGATIVE_FIRST_FRAME, NOISE_FLOOR_DN, RC_FIRST_FRAME_LIMIT,
    RC_LAST_FRAME_LIMIT, ZERO_GROUP_FIT_RANGE,
};
use crate::detector::{DetectorGeometry, PixelMasks};
use crate::domain::{CalibError, CalibResult, CalibrationStage};
use crate::numerics::{
    PolyBasis, PolyFitter, median, median_in_place, poly_eval, poly_eval_cube, poly_fit,
    robust_mean_stack, robust_std,
};
use ndarray::{Array2, Array3, ArrayView1, ArrayView3, Axis, Zip, s, stack};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelClass {
    /// Well described by a linear or quadratic ramp.
    Poly,
    Deviant,
    Negative,
    Other,
}

/// Class masks for one ramp; reference pixels carry no class.
#[derive(Debug, Clone, PartialEq)]
pub struct RampClassification {
    pub poly: Array2<bool>,
    pub deviant: Array2<bool>,
    pub negative: Array2<bool>,
    pub other: Array2<bool>,
}

impl RampClassification {
    fn empty(shape: (usize, usize)) -> Self {
        Self {
            poly: Array2::from_elem(shape, false),
            deviant: Array2::from_elem(shape, false),
            negative: Array2::from_elem(shape, false),
            other: Array2::from_elem(shape, false),
        }
    }

    fn set(&mut self, row: usize, col: usize, class: PixelClass) {
        let target = match class {
            PixelClass::Poly => &mut self.poly,
            PixelClass::Deviant => &mut self.deviant,
            PixelClass::Negative => &mut self.negative,
            PixelClass::Other => &mut self.other,
        };
        target[(row, col)] = true;
    }
}

/// Class masks of the whole ensemble, `[ramp, row, col]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationStack {
    pub poly: Array3<bool>,
    pub deviant: Array3<bool>,
    pub negative: Array3<bool>,
    pub other: Array3<bool>,
}

impl ClassificationStack {
    fn from_ramps(ramps: &[RampClassification], shape: (usize, usize)) -> Self {
        let gather = |pick: fn(&RampClassification) -> &Array2<bool>| -> Array3<bool> {
            let views: Vec<_> = ramps.iter().map(|ramp| pick(ramp).view()).collect();
            stack(Axis(0), &views).unwrap_or_else(|_| Array3::from_elem((0, shape.0, shape.1), false))
        };
        Self {
            poly: gather(|ramp| &ramp.poly),
            deviant: gather(|ramp| &ramp.deviant),
            negative: gather(|ramp| &ramp.negative),
            other: gather(|ramp| &ramp.other),
        }
    }

    pub fn ramp_count(&self) -> usize {
        self.poly.len_of(Axis(0))
    }

    pub fn class_at(&self, ramp: usize, row: usize, col: usize) -> Option<PixelClass> {
        let index = (ramp, row, col);
        if *self.poly.get(index)? {
            Some(PixelClass::Poly)
        } else if self.deviant[index] {
            Some(PixelClass::Deviant)
        } else if self.negative[index] {
            Some(PixelClass::Negative)
        } else if self.other[index] {
            Some(PixelClass::Other)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DarkRampProducts {
    /// `[groups, rows, cols]`, bias-corrected ensemble average.
    pub super_dark_ramp: Array3<f64>,
    /// Residual bias to fold into the super bias.
    pub bias_offset: Array2<f64>,
    pub classification: ClassificationStack,
    /// Ramps in which each pixel entered the masked average.
    pub good_count: Array2<usize>,
    /// True where the masked average was used, false where the fallback was.
    pub masked_path: Array2<bool>,
    pub ensemble_size: usize,
}

/// How the first group's derivative is recovered before extrapolating to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroGroupFit {
    /// Legendre fit of the early differences, log-log when all are positive.
    Polynomial { degree: usize },
    /// Linear extrapolation from the first two differences.
    NoFit,
}

/// Zero-group (bias) offset of one pixel's ramp: `y[0] - dy0`.
///
/// Only the first `max_frames` samples are used.
pub fn zero_group_offset(samples: &[f64], fit: ZeroGroupFit, max_frames: usize) -> f64 {
    let used = &samples[..samples.len().min(max_frames)];
    if used.len() < 2 {
        return 0.0;
    }
    let differences: Vec<f64> = used.windows(2).map(|pair| pair[1] - pair[0]).collect();
    used[0] - first_difference(&differences, fit)
}

fn first_difference(differences: &[f64], fit: ZeroGroupFit) -> f64 {
    let fallback = || {
        if differences.len() >= 2 {
            2.0 * differences[0] - differences[1]
        } else {
            differences[0]
        }
    };
    let ZeroGroupFit::Polynomial { degree } = fit else {
        return fallback();
    };

    let count = differences.len();
    let [first, last] = ZERO_GROUP_FIT_RANGE;
    let last = last.min(count - 1);
    if first > last || last - first + 1 < degree + 1 || count < 2 {
        return fallback();
    }
    let abscissa: Vec<f64> = (first..=last).map(|index| (index + 1) as f64).collect();
    let ordinate = &differences[first..=last];

    if ordinate.iter().all(|value| *value > 0.0) {
        let log_x: Vec<f64> = abscissa.iter().map(|x| (x + 1.0).log10()).collect();
        let log_y: Vec<f64> = ordinate.iter().map(|y| y.log10()).collect();
        let basis = PolyBasis::Legendre {
            domain: [1.0_f64.log10(), (count as f64).log10()],
        };
        if let Ok(coefficients) = poly_fit(&log_x, &log_y, degree, basis) {
            let value = 10.0_f64.powf(poly_eval(0.0, &coefficients, basis));
            if value.is_finite() {
                return value;
            }
        }
    }

    let basis = PolyBasis::Legendre {
        domain: [1.0, count as f64],
    };
    match poly_fit(&abscissa, ordinate, degree, basis) {
        Ok(coefficients) => poly_eval(0.0, &coefficients, basis),
        Err(_) => fallback(),
    }
}

/// Population std of first differences over `sqrt(2)`, floored.
fn difference_noise(ramp: ArrayView1<'_, f64>) -> f64 {
    let count = ramp.len().saturating_sub(1);
    if count == 0 {
        return NOISE_FLOOR_DN;
    }
    let differences: Vec<f64> = (0..count).map(|k| ramp[k + 1] - ramp[k]).collect();
    let center = differences.iter().sum::<f64>() / count as f64;
    let variance = differences
        .iter()
        .map(|value| (value - center).powi(2))
        .sum::<f64>()
        / count as f64;
    (variance.sqrt() / std::f64::consts::SQRT_2).max(NOISE_FLOOR_DN)
}

fn reduced_chi_square<I>(residuals: I, noise: f64, dof: usize) -> f64
where
    I: IntoIterator<Item = f64>,
{
    let total: f64 = residuals
        .into_iter()
        .map(|residual| (residual / noise).powi(2))
        .sum();
    total / dof.max(1) as f64
}

struct RampFit {
    classification: RampClassification,
    offset: Array2<f64>,
}

pub struct DarkRampBuilder {
    config: DarkRampConfig,
    times: Vec<f64>,
    reference: Array2<bool>,
    frames: Option<usize>,
    masked_sum: Array3<f64>,
    unmasked_sum: Array3<f64>,
    good_count: Array2<usize>,
    offsets: Vec<Array2<f64>>,
    classes: Vec<RampClassification>,
}

impl DarkRampBuilder {
    /// `times[k]` is the time of group `k`; ramps may not be longer than `times`.
    pub fn new(geometry: &DetectorGeometry, times: Vec<f64>, config: DarkRampConfig) -> Self {
        let masks = PixelMasks::from_geometry(geometry);
        let shape = geometry.shape();
        Self {
            config,
            times,
            reference: masks.reference,
            frames: None,
            masked_sum: Array3::zeros((0, shape.0, shape.1)),
            unmasked_sum: Array3::zeros((0, shape.0, shape.1)),
            good_count: Array2::zeros(shape),
            offsets: Vec::new(),
            classes: Vec::new(),
        }
    }

    pub fn ramps_accumulated(&self) -> usize {
        self.classes.len()
    }

    /// Classify, offset-correct and accumulate one ramp.
    pub fn accumulate(&mut self, ramp: Array3<f64>) -> CalibResult<PixelClassCounts> {
        let (frames, rows, cols) = ramp.dim();
        if (rows, cols) != self.reference.dim() {
            return Err(CalibError::invalid_configuration(
                "CONFIG.CUBE_SHAPE",
                format!(
                    "ramp frames are {rows}x{cols} but the detector is {}x{}",
                    self.reference.nrows(),
                    self.reference.ncols()
                ),
            ));
        }
        match self.frames {
            Some(expected) if expected != frames => {
                return Err(CalibError::invalid_configuration(
                    "CONFIG.CUBE_SHAPE",
                    format!("ramp has {frames} groups but the ensemble has {expected}"),
                ));
            }
            Some(_) => {}
            None => {
                if frames < 4 || frames > self.times.len() {
                    return Err(CalibError::invalid_configuration(
                        "CONFIG.DARK_FRAMES",
                        format!(
                            "dark ramps need between 4 and {} groups, got {frames}",
                            self.times.len()
                        ),
                    ));
                }
                self.frames = Some(frames);
                self.masked_sum = Array3::zeros((frames, rows, cols));
                self.unmasked_sum = Array3::zeros((frames, rows, cols));
            }
        }

        let fit = self.fit_ramp(ramp.view())?;
        let mut ramp = ramp;
        for mut frame in ramp.axis_iter_mut(Axis(0)) {
            frame -= &fit.offset;
        }

        let good = Zip::from(&fit.classification.poly)
            .and(&self.reference)
            .map_collect(|poly, reference| *poly || *reference);
        Zip::from(&mut self.good_count)
            .and(&good)
            .for_each(|count, keep| *count += usize::from(*keep));
        for (k, frame) in ramp.axis_iter(Axis(0)).enumerate() {
            let mut masked = self.masked_sum.index_axis_mut(Axis(0), k);
            Zip::from(&mut masked)
                .and(&frame)
                .and(&good)
                .for_each(|sum, value, keep| {
                    if *keep {
                        *sum += value;
                    }
                });
            let mut unmasked = self.unmasked_sum.index_axis_mut(Axis(0), k);
            unmasked += &frame;
        }

        let counts = PixelClassCounts::from_classification(&fit.classification);
        self.offsets.push(fit.offset);
        self.classes.push(fit.classification);
        self.config.verbosity.ramp_progress(
            CalibrationStage::DarkRamp,
            self.classes.len() - 1,
            None,
        );
        Ok(counts)
    }

    fn fit_ramp(&self, ramp: ArrayView3<'_, f64>) -> CalibResult<RampFit> {
        let (frames, rows, cols) = ramp.dim();
        let times = &self.times[..frames];
        let cutoff = self.config.chi_square_cutoff;
        let saturation = self.config.saturation_level;

        let linear = PolyFitter::new(&times[1..], 1, PolyBasis::Power)?;
        let quadratic = PolyFitter::new(&times[1..], 2, PolyBasis::Power)?;
        let coefficients = linear.fit_cube(ramp.slice(s![1.., .., ..]))?;
        let model = poly_eval_cube(times, coefficients.view(), PolyBasis::Power);

        let mut intercept = coefficients.index_axis(Axis(0), 0).to_owned();
        let slopes = coefficients.index_axis(Axis(0), 1).to_owned();
        let mut chi = Array2::<f64>::zeros((rows, cols));
        let mut saturated = Array2::from_elem((rows, cols), false);
        let mut samples = vec![0.0; frames - 1];

        for row in 0..rows {
            for col in 0..cols {
                let series = ramp.slice(s![.., row, col]);
                if series.iter().any(|value| *value >= saturation) {
                    saturated[(row, col)] = true;
                    chi[(row, col)] = f64::NAN;
                    continue;
                }
                if series.iter().all(|value| *value == series[0]) {
                    continue;
                }
                let noise = difference_noise(series);
                let linear_chi = reduced_chi_square(
                    (0..frames).map(|k| series[k] - model[(k, row, col)]),
                    noise,
                    frames - 1,
                );
                chi[(row, col)] = linear_chi;
                if self.reference[(row, col)] || linear_chi <= cutoff {
                    continue;
                }

                for (slot, value) in samples.iter_mut().zip(series.iter().skip(1)) {
                    *slot = *value;
                }
                let refit = quadratic.fit(&samples)?;
                chi[(row, col)] = reduced_chi_square(
                    times
                        .iter()
                        .zip(series.iter())
                        .map(|(t, value)| value - poly_eval(*t, &refit, PolyBasis::Power)),
                    noise,
                    frames - 2,
                );
                intercept[(row, col)] = refit[0];
            }
        }

        let span = *times.last().unwrap_or(&0.0);
        let slope_values: Vec<f64> = slopes.iter().copied().collect();
        let slope_center = median(&slope_values).unwrap_or(0.0);
        let slope_spread = robust_std(&slope_values).unwrap_or(0.0);
        let deviant_limit = (slope_center + self.config.deviant_sigma * slope_spread) * span;

        let mut classification = RampClassification::empty((rows, cols));
        let mut offset = intercept;
        let mut early = Vec::with_capacity(self.config.zero_group_frames);
        for row in 0..rows {
            for col in 0..cols {
                if self.reference[(row, col)] {
                    continue;
                }
                let value = chi[(row, col)];
                if value.is_finite() && value <= cutoff {
                    classification.set(row, col, PixelClass::Poly);
                    continue;
                }

                let rise = ramp[(frames - 1, row, col)] - ramp[(1, row, col)];
                let class = if saturated[(row, col)] {
                    PixelClass::Other
                } else if rise > deviant_limit {
                    PixelClass::Deviant
                } else if rise < -deviant_limit {
                    PixelClass::Negative
                } else {
                    PixelClass::Other
                };
                classification.set(row, col, class);

                early.clear();
                early.extend(
                    ramp.slice(s![..frames.min(self.config.zero_group_frames), row, col])
                        .iter()
                        .copied(),
                );
                offset[(row, col)] = zero_group_offset(
                    &early,
                    ZeroGroupFit::Polynomial { degree: 1 },
                    self.config.zero_group_frames,
                );
            }
        }

        Ok(RampFit {
            classification,
            offset,
        })
    }

    /// Average the ensemble and run the offset clean-up passes.
    pub fn finish(self) -> CalibResult<DarkRampProducts> {
        let ensemble_size = self.classes.len();
        if ensemble_size == 0 {
            return Err(CalibError::invalid_configuration(
                "CONFIG.EMPTY_SOURCE",
                "dark ramp needs at least one ramp",
            ));
        }
        let shape = self.reference.dim();
        let threshold = self.config.coverage_fraction * ensemble_size as f64;
        let masked_path = self.good_count.mapv(|count| count as f64 >= threshold);
        let fallback_pixels = masked_path.iter().filter(|flag| !**flag).count();
        if fallback_pixels > 0 {
            tracing::warn!(
                stage = %CalibrationStage::DarkRamp,
                pixels = fallback_pixels,
                ramps = ensemble_size,
                "insufficient coverage, using unmasked average"
            );
        }

        let mut average = self.unmasked_sum / ensemble_size as f64;
        for (mut frame, masked) in average
            .axis_iter_mut(Axis(0))
            .zip(self.masked_sum.axis_iter(Axis(0)))
        {
            Zip::from(&mut frame)
                .and(&masked)
                .and(&masked_path)
                .and(&self.good_count)
                .for_each(|value, sum, use_masked, count| {
                    if *use_masked && *count > 0 {
                        *value = sum / *count as f64;
                    }
                });
        }

        let offset_views: Vec<_> = self.offsets.iter().map(Array2::view).collect();
        let offsets = stack(Axis(0), &offset_views).map_err(|error| {
            CalibError::internal("SYS.DARK_OFFSETS", format!("offset stack failed: {error}"))
        })?;
        let mut bias_offset = robust_mean_stack(offsets.view());

        let zero_group_frames = self.config.zero_group_frames;
        let active = self.reference.mapv(|flag| !flag);
        let last = average.len_of(Axis(0)) - 1;

        // Negative starts (active only) and RC-like pixels, from the same average.
        let mut correction = Array2::<f64>::zeros(shape);
        for ((row, col), delta) in correction.indexed_iter_mut() {
            let first = average[(0, row, col)];
            let rc_like = first > RC_FIRST_FRAME_LIMIT || average[(last, row, col)] > RC_LAST_FRAME_LIMIT;
            let negative = first < NEGATIVE_FIRST_FRAME && active[(row, col)];
            let fit = if rc_like {
                ZeroGroupFit::Polynomial { degree: 2 }
            } else if negative {
                ZeroGroupFit::Polynomial { degree: 1 }
            } else {
                continue;
            };
            let series: Vec<f64> = average.slice(s![.., row, col]).to_vec();
            *delta = zero_group_offset(&series, fit, zero_group_frames);
        }
        apply_offset(&mut average, &mut bias_offset, &correction);

        let mut correction = Array2::<f64>::zeros(shape);
        for ((row, col), delta) in correction.indexed_iter_mut() {
            if average[(0, row, col)] > LARGE_OFFSET_LIMIT {
                let series: Vec<f64> = average.slice(s![.., row, col]).to_vec();
                *delta = zero_group_offset(&series, ZeroGroupFit::NoFit, zero_group_frames);
            }
        }
        apply_offset(&mut average, &mut bias_offset, &correction);

        let classification = ClassificationStack::from_ramps(&self.classes, shape);
        tracing::info!(
            stage = %CalibrationStage::DarkRamp,
            ramps = ensemble_size,
            fallback_pixels,
            "super dark ramp assembled"
        );

        Ok(DarkRampProducts {
            super_dark_ramp: average,
            bias_offset,
            classification,
            good_count: self.good_count,
            masked_path,
            ensemble_size,
        })
    }
}

fn apply_offset(average: &mut Array3<f64>, bias_offset: &mut Array2<f64>, correction: &Array2<f64>) {
    for mut frame in average.axis_iter_mut(Axis(0)) {
        frame -= correction;
    }
    *bias_offset += correction;
}

/// Per-ramp class tallies over active pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PixelClassCounts {
    pub poly: usize,
    pub deviant: usize,
    pub negative: usize,
    pub other: usize,
}

impl PixelClassCounts {
    fn from_classification(classification: &RampClassification) -> Self {
        let count = |mask: &Array2<bool>| mask.iter().filter(|flag| **flag).count();
        Self {
            poly: count(&classification.poly),
            deviant: count(&classification.deviant),
            negative: count(&classification.negative),
            other: count(&classification.other),
        }
    }
}

/// Dark-current rate image: coefficient 1 of a per-pixel fit against `times`.
pub fn dark_slope_image(
    super_dark_ramp: &Array3<f64>,
    times: &[f64],
    degree: usize,
) -> CalibResult<Array2<f64>> {
    let frames = super_dark_ramp.len_of(Axis(0));
    if times.len() < frames {
        return Err(CalibError::invalid_configuration(
            "CONFIG.DARK_FRAMES",
            format!("{} times supplied for {frames} groups", times.len()),
        ));
    }
    let fitter = PolyFitter::new(&times[..frames], degree.max(1), PolyBasis::Power)?;
    let coefficients = fitter.fit_cube(super_dark_ramp.view())?;
    Ok(coefficients.index_axis_move(Axis(0), 1))
}

/// Per-channel median ramps and their mean, in DN.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DarkRampAverages {
    /// `[channel][group]`.
    pub per_channel: Vec<Vec<f64>>,
    pub all: Vec<f64>,
}

impl DarkRampAverages {
    /// Mean over channels of each channel's linear slope, scaled by `gain` (e-/s).
    pub fn mean_dark_current(&self, times: &[f64], gain: f64) -> CalibResult<f64> {
        let mut slopes = Vec::with_capacity(self.per_channel.len());
        for ramp in &self.per_channel {
            let coefficients = poly_fit(&times[..ramp.len()], ramp, 1, PolyBasis::Power)?;
            slopes.push(coefficients[1]);
        }
        if slopes.is_empty() {
            return Err(CalibError::numeric_degeneracy(
                "NUMERIC.DARK_CHANNELS",
                "no channel ramps to average",
            ));
        }
        Ok(gain * slopes.iter().sum::<f64>() / slopes.len() as f64)
    }
}

pub fn channel_ramp_averages(
    super_dark_ramp: &Array3<f64>,
    geometry: &DetectorGeometry,
) -> DarkRampAverages {
    let frames = super_dark_ramp.len_of(Axis(0));
    let per_channel: Vec<Vec<f64>> = (0..geometry.channel_count)
        .map(|channel| {
            let slab = super_dark_ramp.slice(s![.., .., geometry.channel_columns(channel)]);
            slab.axis_iter(Axis(0))
                .map(|frame| {
                    let mut values: Vec<f64> = frame.iter().copied().collect();
                    median_in_place(&mut values).unwrap_or(0.0)
                })
                .collect()
        })
        .collect();
    let all = (0..frames)
        .map(|k| {
            per_channel.iter().map(|ramp| ramp[k]).sum::<f64>() / per_channel.len().max(1) as f64
        })
        .collect();
    DarkRampAverages { per_channel, all }
}

#[cfg(test)]
mod tests {
    use super::{
        DarkRampBuilder, PixelClass, ZeroGroupFit, channel_ramp_averages, dark_slope_image,
        zero_group_offset,
    };
    use crate::common::DarkRampConfig;
    use crate::detector::{DetectorGeometry, ReferenceBorders, ScanLayout};
    use crate::domain::CalibErrorCategory;
    use ndarray::Array3;

    fn geometry() -> DetectorGeometry {
        DetectorGeometry {
            rows: 6,
            cols: 8,
            channel_count: 2,
            channel_width: 4,
            borders: ReferenceBorders {
                bottom: 1,
                top: 1,
                left: 0,
                right: 0,
            },
            scan_layout: ScanLayout::default(),
        }
    }

    fn times(frames: usize) -> Vec<f64> {
        (1..=frames).map(|k| k as f64 * 10.0).collect()
    }

    #[test]
    fn zero_group_offset_recovers_intercept_of_linear_ramp() {
        let samples: Vec<f64> = (0..12).map(|k| 40.0 + 3.0 * k as f64).collect();
        let offset = zero_group_offset(&samples, ZeroGroupFit::Polynomial { degree: 1 }, 15);
        // First difference extrapolates to 3, so the offset is y0 - 3.
        assert!((offset - 37.0).abs() < 1.0e-8, "{offset}");
        let no_fit = zero_group_offset(&samples, ZeroGroupFit::NoFit, 15);
        assert!((no_fit - 37.0).abs() < 1.0e-12);
    }

    #[test]
    fn zero_group_offset_handles_short_series() {
        assert_eq!(zero_group_offset(&[5.0], ZeroGroupFit::NoFit, 15), 0.0);
        let offset = zero_group_offset(&[5.0, 7.0], ZeroGroupFit::Polynomial { degree: 1 }, 15);
        assert!((offset - 3.0).abs() < 1.0e-12);
    }

    #[test]
    fn clean_linear_ramps_are_all_poly() {
        let geometry = geometry();
        let mut builder = DarkRampBuilder::new(&geometry, times(8), DarkRampConfig::default());
        for _ in 0..3 {
            let ramp = Array3::from_shape_fn((8, 6, 8), |(k, r, c)| {
                0.01 * (r * 8 + c + 1) as f64 * (k + 1) as f64 * 10.0
            });
            let counts = builder.accumulate(ramp).expect("accumulate");
            assert_eq!(counts.poly, 4 * 8);
        }
        let products = builder.finish().expect("finish");
        assert_eq!(products.ensemble_size, 3);
        assert!(products.masked_path.iter().all(|flag| *flag));
        assert_eq!(products.classification.class_at(0, 2, 3), Some(PixelClass::Poly));
        assert_eq!(products.classification.class_at(0, 0, 3), None);
        assert!(products.bias_offset.iter().all(|value| value.abs() < 1.0e-6));
    }

    #[test]
    fn identical_flat_ramps_are_all_poly() {
        let geometry = geometry();
        for level in [0.0, 1000.0] {
            let mut builder = DarkRampBuilder::new(&geometry, times(8), DarkRampConfig::default());
            for _ in 0..3 {
                let counts = builder
                    .accumulate(Array3::from_elem((8, 6, 8), level))
                    .expect("accumulate");
                assert_eq!(counts.poly, 4 * 8, "level {level}: {counts:?}");
                assert_eq!(counts.other, 0);
            }
            let products = builder.finish().expect("finish");
            assert_eq!(products.classification.class_at(0, 2, 3), Some(PixelClass::Poly));
            assert!(products.masked_path.iter().all(|flag| *flag));
            // The constant level is an offset, not dark signal.
            assert!(products.super_dark_ramp.iter().all(|value| value.abs() < 1.0e-6));
            assert!(
                products
                    .bias_offset
                    .iter()
                    .all(|value| (value - level).abs() < 1.0e-6),
                "level {level}"
            );
        }
    }

    #[test]
    fn configured_saturation_level_routes_ramps_to_other() {
        let geometry = geometry();
        let t = times(8);
        let config = DarkRampConfig {
            saturation_level: 40_000.0,
            ..DarkRampConfig::default()
        };
        let mut builder = DarkRampBuilder::new(&geometry, t.clone(), config);
        let ramp = Array3::from_shape_fn((8, 6, 8), |(k, r, c)| {
            if (r, c) == (2, 3) && k >= 5 {
                40_000.0
            } else {
                linear_value(r, c, t[k])
            }
        });
        let counts = builder.accumulate(ramp).expect("accumulate");
        assert_eq!(counts.other, 1, "{counts:?}");
        assert_eq!(counts.poly, 4 * 8 - 1);
    }

    fn linear_value(r: usize, c: usize, t: f64) -> f64 {
        0.01 * (r * 8 + c + 1) as f64 * t
    }

    fn cubic_value(t: f64) -> f64 {
        0.02 * (t - 55.0).powi(3)
    }

    #[test]
    fn coverage_threshold_decides_between_masked_and_fallback_average() {
        let geometry = geometry();
        let t = times(10);
        let mut builder = DarkRampBuilder::new(&geometry, t.clone(), DarkRampConfig::default());
        // Four ramps put the threshold at exactly three good samples.
        for ramp_index in 0..4 {
            let ramp = Array3::from_shape_fn((10, 6, 8), |(k, r, c)| match (r, c) {
                (2, 3) if ramp_index == 0 => cubic_value(t[k]),
                (3, 5) if ramp_index < 2 => cubic_value(t[k]),
                _ => linear_value(r, c, t[k]),
            });
            builder.accumulate(ramp).expect("accumulate");
        }
        let products = builder.finish().expect("finish");

        assert_eq!(products.classification.class_at(0, 2, 3), Some(PixelClass::Deviant));
        assert_eq!(products.good_count[(2, 3)], 3);
        assert!(products.masked_path[(2, 3)]);
        let last = products.super_dark_ramp[(9, 2, 3)];
        assert!((last - linear_value(2, 3, 100.0)).abs() < 1.0e-6, "{last}");

        assert_eq!(products.good_count[(3, 5)], 2);
        assert!(!products.masked_path[(3, 5)]);
    }

    #[test]
    fn saturated_ramp_is_kept_out_of_the_masked_average() {
        let geometry = geometry();
        let t = times(10);
        let mut builder = DarkRampBuilder::new(&geometry, t.clone(), DarkRampConfig::default());
        for ramp_index in 0..10 {
            let ramp = if ramp_index == 3 {
                Array3::from_elem((10, 6, 8), 65_535.0)
            } else {
                Array3::from_shape_fn((10, 6, 8), |(k, r, c)| linear_value(r, c, t[k]))
            };
            let counts = builder.accumulate(ramp).expect("accumulate");
            if ramp_index == 3 {
                assert_eq!(counts.poly, 0);
                assert_eq!(counts.other, 4 * 8);
            }
        }
        let products = builder.finish().expect("finish");

        assert_eq!(products.classification.class_at(3, 2, 3), Some(PixelClass::Other));
        for row in 1..5 {
            for col in 0..8 {
                assert!(products.masked_path[(row, col)]);
                let expected = linear_value(row, col, 100.0);
                let value = products.super_dark_ramp[(9, row, col)];
                assert!((value - expected).abs() < 1.0e-6, "({row}, {col}): {value}");
            }
        }
    }

    #[test]
    fn mismatched_ramp_shape_is_rejected() {
        let mut builder = DarkRampBuilder::new(&geometry(), times(8), DarkRampConfig::default());
        builder
            .accumulate(Array3::zeros((8, 6, 8)))
            .expect("first ramp");
        let error = builder
            .accumulate(Array3::zeros((7, 6, 8)))
            .expect_err("group mismatch");
        assert_eq!(error.category(), CalibErrorCategory::InvalidConfiguration);
    }

    #[test]
    fn finishing_without_ramps_is_configuration_error() {
        let builder = DarkRampBuilder::new(&geometry(), times(8), DarkRampConfig::default());
        let error = builder.finish().expect_err("empty ensemble");
        assert_eq!(error.placeholder(), "CONFIG.EMPTY_SOURCE");
    }

    #[test]
    fn slope_image_and_channel_averages_follow_the_ramp() {
        let geometry = geometry();
        let t = times(5);
        let ramp = Array3::from_shape_fn((5, 6, 8), |(k, _, c)| {
            let rate = if c < 4 { 0.5 } else { 1.5 };
            rate * t[k]
        });
        let slope = dark_slope_image(&ramp, &t, 1).expect("slope");
        assert!((slope[(3, 1)] - 0.5).abs() < 1.0e-10);
        assert!((slope[(3, 6)] - 1.5).abs() < 1.0e-10);

        let averages = channel_ramp_averages(&ramp, &geometry);
        assert_eq!(averages.per_channel.len(), 2);
        let current = averages.mean_dark_current(&t, 2.0).expect("dark current");
        assert!((current - 2.0).abs() < 1.0e-10, "{current}");
    }
}
