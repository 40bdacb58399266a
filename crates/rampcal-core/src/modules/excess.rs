//! Effective slope noise as a function of group count and the two-parameter
//! excess-variance model fitted to it.
//!
//! Rapid ramps are resampled into each readout pattern, fitted over the first
//! `g` groups for a range of `g`, and the measured scatter of the slope images
//! is compared against the shot plus read noise expectation.

use super::kernel::KernelDeconvolver;
use crate::common::EffectiveNoiseConfig;
use crate::detector::{
    DetectorGeometry, DetectorTiming, PixelMasks, ReadoutPattern, excess_variance_model,
    masked_values, theoretical_slope_noise,
};
use crate::domain::{CalibError, CalibResult, CalibrationStage};
use crate::numerics::{LmConfig, PolyBasis, PolyFitter, median_abs_deviation, median_in_place, minimize};
use ndarray::{Array2, Array3, Axis, s};
use serde::Serialize;

/// Group-averaged cube of `pattern` built from a rapid ramp.
///
/// `groups` defaults to every complete group the ramp holds. Leading
/// `first_frame_delay` frames and the dropped frames between groups are
/// discarded.
pub fn resample_ramp(
    cube: &Array3<f64>,
    pattern: &ReadoutPattern,
    groups: Option<usize>,
) -> CalibResult<Array3<f64>> {
    let (frames, rows, cols) = cube.dim();
    let groups = groups.unwrap_or_else(|| pattern.group_count_from(frames));
    let required = pattern.frames_required(groups);
    if groups == 0 || pattern.frames_per_group == 0 || required > frames {
        return Err(CalibError::invalid_configuration(
            "CONFIG.RESAMPLE_FRAMES",
            format!(
                "pattern {} needs {required} frames for {groups} groups but the ramp has {frames}",
                pattern.name
            ),
        ));
    }
    if pattern.is_rapid() {
        return Ok(cube.slice(s![0..groups, .., ..]).to_owned());
    }

    let stride = pattern.frames_per_group + pattern.drop_frames_per_group;
    let mut resampled = Array3::<f64>::zeros((groups, rows, cols));
    for (group, mut target) in resampled.axis_iter_mut(Axis(0)).enumerate() {
        let start = pattern.first_frame_delay + group * stride;
        let block = cube.slice(s![start..start + pattern.frames_per_group, .., ..]);
        if let Some(average) = block.mean_axis(Axis(0)) {
            target.assign(&average);
        }
    }
    Ok(resampled)
}

fn linspace_floor(start: usize, stop: usize, count: usize) -> impl Iterator<Item = usize> {
    let step = (stop as f64 - start as f64) / (count - 1) as f64;
    (0..count).map(move |i| (start as f64 + i as f64 * step + 1.0e-9).floor() as usize)
}

/// Group counts at which the effective noise is sampled for a ramp of `groups`
/// groups.
pub fn default_group_counts(groups: usize, rapid: bool) -> Vec<usize> {
    if groups < 2 {
        return Vec::new();
    }
    let mut counts: Vec<usize> = if rapid {
        [2, 3, 5]
            .into_iter()
            .chain(linspace_floor(10, groups, 15))
            .collect()
    } else if groups < 20 {
        (2..=groups).collect()
    } else {
        [2, 3].into_iter().chain(linspace_floor(5, groups, 16)).collect()
    };
    for count in &mut counts {
        *count = (*count).clamp(2, groups);
    }
    counts.sort_unstable();
    counts.dedup();
    counts
}

/// Measured slope noise of one readout pattern, in DN/s.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveNoiseCurve {
    pub pattern: ReadoutPattern,
    pub group_counts: Vec<usize>,
    /// Group-average times of the resampled ramp, seconds.
    pub times: Vec<f64>,
    /// `[pool][group_count]`: one row per channel, then the reference pool.
    pub spatial: Option<Vec<Vec<f64>>>,
    pub temporal: Option<Vec<Vec<f64>>>,
    pub ramp_count: usize,
}

impl EffectiveNoiseCurve {
    /// Spatial estimate when available, else temporal.
    pub fn preferred(&self) -> Option<&Vec<Vec<f64>>> {
        self.spatial.as_ref().or(self.temporal.as_ref())
    }

    /// Quadrature mean over the active channels for each group count.
    pub fn channel_noise(&self, channel_count: usize) -> CalibResult<Vec<f64>> {
        let pools = self.preferred().ok_or_else(|| {
            CalibError::invalid_configuration(
                "CONFIG.EFFECTIVE_NOISE_ESTIMATOR",
                "effective noise was computed with neither estimator enabled",
            )
        })?;
        let channels = channel_count.min(pools.len());
        if channels == 0 {
            return Err(CalibError::numeric_degeneracy(
                "NUMERIC.EFFECTIVE_NOISE_CHANNELS",
                "effective noise curve has no channel rows",
            ));
        }
        Ok((0..self.group_counts.len())
            .map(|index| {
                let power: f64 = pools[..channels]
                    .iter()
                    .map(|row| row[index] * row[index])
                    .sum();
                (power / channels as f64).sqrt()
            })
            .collect())
    }
}

/// Streams ramps of one readout pattern into an [`EffectiveNoiseCurve`].
pub struct EffectiveNoiseAccumulator<'a> {
    pattern: ReadoutPattern,
    groups: usize,
    group_counts: Vec<usize>,
    times: Vec<f64>,
    fitters: Vec<PolyFitter>,
    pools: Vec<Array2<bool>>,
    spatial_enabled: bool,
    temporal_enabled: bool,
    deconvolver: Option<&'a KernelDeconvolver>,
    config: EffectiveNoiseConfig,
    /// `[group_count][pool][ramp]`.
    spatial: Vec<Vec<Vec<f64>>>,
    /// Welford running mean and sum of squared deviations per group count.
    running_mean: Vec<Array2<f64>>,
    running_m2: Vec<Array2<f64>>,
    ramps: usize,
}

impl<'a> EffectiveNoiseAccumulator<'a> {
    /// `frames` is the length of the rapid ramps that will be streamed.
    pub fn new(
        geometry: &DetectorGeometry,
        timing: &DetectorTiming,
        pattern: &ReadoutPattern,
        frames: usize,
        config: &EffectiveNoiseConfig,
        deconvolver: Option<&'a KernelDeconvolver>,
    ) -> CalibResult<Self> {
        let groups = pattern.group_count_from(frames);
        let group_counts: Vec<usize> = match &config.group_counts {
            Some(counts) => counts
                .iter()
                .copied()
                .filter(|count| (2..=groups).contains(count))
                .collect(),
            None => default_group_counts(groups, pattern.is_rapid()),
        };
        if group_counts.is_empty() {
            return Err(CalibError::invalid_configuration(
                "CONFIG.EFFECTIVE_NOISE_GROUPS",
                format!(
                    "pattern {} yields {groups} groups from {frames} frames; at least 2 are needed",
                    pattern.name
                ),
            ));
        }

        let times = pattern.group_times(groups, timing.frame_time);
        let fitters = group_counts
            .iter()
            .map(|count| PolyFitter::new(&times[..*count], 1, PolyBasis::Power))
            .collect::<Result<Vec<_>, _>>()?;

        let masks = PixelMasks::from_geometry(geometry);
        let mut pools: Vec<Array2<bool>> = (0..geometry.channel_count)
            .map(|channel| masks.active_in_channel(channel))
            .collect();
        pools.push(masks.reference);

        let shape = geometry.shape();
        let slots = group_counts.len();
        Ok(Self {
            pattern: pattern.clone(),
            groups,
            times,
            fitters,
            spatial: vec![vec![Vec::new(); pools.len()]; slots],
            running_mean: vec![Array2::zeros(shape); slots],
            running_m2: vec![Array2::zeros(shape); slots],
            pools,
            spatial_enabled: config.spatial,
            temporal_enabled: config.temporal,
            deconvolver: deconvolver.filter(|_| config.deconvolve),
            config: config.clone(),
            group_counts,
            ramps: 0,
        })
    }

    pub fn group_counts(&self) -> &[usize] {
        &self.group_counts
    }

    pub fn ramps_accumulated(&self) -> usize {
        self.ramps
    }

    /// Add one bias-subtracted, corrected rapid ramp.
    pub fn accumulate(&mut self, ramp: &Array3<f64>) -> CalibResult<()> {
        let resampled = resample_ramp(ramp, &self.pattern, Some(self.groups))?;
        self.ramps += 1;
        let weight = self.ramps as f64;

        for (slot, (count, fitter)) in self.group_counts.iter().zip(&self.fitters).enumerate() {
            let head = resampled.slice(s![0..*count, .., ..]);
            let slope = fitter.fit_cube(head)?.index_axis_move(Axis(0), 1);
            let slope = match self.deconvolver {
                Some(deconvolver) => deconvolver.apply(&slope)?,
                None => slope,
            };
            if slope.dim() != self.running_mean[slot].dim() {
                return Err(CalibError::invalid_configuration(
                    "CONFIG.CUBE_SHAPE",
                    format!(
                        "ramp frames are {:?} but the detector is {:?}",
                        slope.dim(),
                        self.running_mean[slot].dim()
                    ),
                ));
            }

            if self.spatial_enabled {
                for (pool, mask) in self.pools.iter().enumerate() {
                    let values = masked_values(slope.view(), mask);
                    let spread = median_abs_deviation(&values).unwrap_or(f64::NAN);
                    self.spatial[slot][pool].push(spread);
                }
            }
            if self.temporal_enabled {
                let mean = &mut self.running_mean[slot];
                let m2 = &mut self.running_m2[slot];
                ndarray::Zip::from(mean)
                    .and(m2)
                    .and(&slope)
                    .for_each(|mean, m2, value| {
                        let delta = value - *mean;
                        *mean += delta / weight;
                        *m2 += delta * (value - *mean);
                    });
            }
        }
        self.config
            .verbosity
            .ramp_progress(CalibrationStage::EffectiveNoise, self.ramps - 1, None);
        Ok(())
    }

    pub fn finish(self) -> CalibResult<EffectiveNoiseCurve> {
        if self.ramps == 0 {
            return Err(CalibError::invalid_configuration(
                "CONFIG.EMPTY_SOURCE",
                "effective noise needs at least one ramp",
            ));
        }
        let pool_count = self.pools.len();

        let spatial = self.spatial_enabled.then(|| {
            (0..pool_count)
                .map(|pool| {
                    self.spatial
                        .iter()
                        .map(|per_pool| {
                            let mut values: Vec<f64> = per_pool[pool]
                                .iter()
                                .copied()
                                .filter(|value| value.is_finite())
                                .collect();
                            median_in_place(&mut values).unwrap_or(f64::NAN)
                        })
                        .collect()
                })
                .collect()
        });

        let temporal = (self.temporal_enabled && self.ramps > 1).then(|| {
            let variances: Vec<Array2<f64>> = self
                .running_m2
                .iter()
                .map(|m2| m2 / self.ramps as f64)
                .collect();
            self.pools
                .iter()
                .map(|mask| {
                    variances
                        .iter()
                        .map(|variance| {
                            let mut values = masked_values(variance.view(), mask);
                            median_in_place(&mut values).map_or(f64::NAN, f64::sqrt)
                        })
                        .collect()
                })
                .collect()
        });
        if self.temporal_enabled && self.ramps < 2 {
            tracing::warn!(
                stage = %CalibrationStage::EffectiveNoise,
                pattern = %self.pattern.name,
                "temporal effective noise needs at least 2 ramps; skipped"
            );
        }

        tracing::info!(
            stage = %CalibrationStage::EffectiveNoise,
            pattern = %self.pattern.name,
            ramps = self.ramps,
            group_counts = self.group_counts.len(),
            "effective noise curve complete"
        );
        Ok(EffectiveNoiseCurve {
            pattern: self.pattern,
            group_counts: self.group_counts,
            times: self.times,
            spatial,
            temporal,
            ramp_count: self.ramps,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExcessVarianceFit {
    /// `[p0, p1]` of `12 (n-1)/(n+1) p0² - p1/√m`.
    pub params: [f64; 2],
    /// e- per frame.
    pub read_noise: f64,
    /// e-/s.
    pub dark_current: f64,
    pub cost: f64,
    pub converged: bool,
    pub iterations: usize,
    pub residual_count: usize,
}

impl ExcessVarianceFit {
    /// Slope noise in e-/s expected for `groups` groups read with `timing`.
    pub fn predicted_noise(&self, groups: usize, timing: &DetectorTiming) -> f64 {
        theoretical_slope_noise(
            groups,
            timing,
            self.read_noise,
            self.dark_current,
            Some(self.params),
        )
    }
}

/// One pattern's points, pre-scaled to integrated e-² so the residual closure
/// only evaluates the model.
struct PatternPoints {
    groups: Vec<f64>,
    frames_per_group: f64,
    observed: Vec<f64>,
}

/// Read noise implied by the two-group point of the first curve.
fn read_noise_from_curve(
    noise: &[f64],
    timing: &DetectorTiming,
    dark_current: f64,
) -> CalibResult<f64> {
    let first = noise.first().copied().filter(|value| value.is_finite()).ok_or_else(|| {
        CalibError::numeric_degeneracy(
            "NUMERIC.READ_NOISE",
            "first effective noise point is missing; read noise cannot be derived",
        )
    })?;
    let integrated = first * timing.group_time() * timing.gain;
    // Dark shot noise of a single frame.
    let variance = (integrated * integrated - dark_current * timing.frame_time) / 2.0;
    if variance < 0.0 {
        tracing::warn!(
            stage = %CalibrationStage::ExcessVariance,
            variance,
            "dark shot noise exceeds the measured two-group noise; read noise clamped to zero"
        );
    }
    Ok(variance.max(0.0).sqrt())
}

/// Fit the excess-variance parameters jointly over every pattern's curve.
///
/// `timing` describes the detector; each curve's own pattern supplies the
/// group cadence. Missing `dark_current` or `read_noise` are taken from
/// `timing`, and the read noise falls back to the first curve's two-group point.
pub fn fit_excess_variance(
    curves: &[EffectiveNoiseCurve],
    timing: &DetectorTiming,
    channel_count: usize,
    dark_current: Option<f64>,
    read_noise: Option<f64>,
    initial: [f64; 2],
) -> CalibResult<ExcessVarianceFit> {
    let first = curves.first().ok_or_else(|| {
        CalibError::invalid_configuration(
            "CONFIG.EXCESS_CURVES",
            "excess variance fit needs at least one effective noise curve",
        )
    })?;
    let dark_current = dark_current.or(timing.dark_current).ok_or_else(|| {
        CalibError::invalid_configuration(
            "CONFIG.DARK_CURRENT",
            "dark current is neither configured nor derived from the dark ramp",
        )
    })?;
    let read_noise = match read_noise.or(timing.read_noise) {
        Some(value) => value,
        None => read_noise_from_curve(
            &first.channel_noise(channel_count)?,
            &timing.with_pattern(&first.pattern),
            dark_current,
        )?,
    };

    let mut points = Vec::with_capacity(curves.len());
    for curve in curves {
        let pattern_timing = timing.with_pattern(&curve.pattern);
        let noise = curve.channel_noise(channel_count)?;
        let t_g = pattern_timing.group_time();
        let mut groups = Vec::with_capacity(noise.len());
        let mut observed = Vec::with_capacity(noise.len());
        for (count, measured) in curve.group_counts.iter().zip(noise) {
            if !measured.is_finite() {
                continue;
            }
            let t = (*count as f64 - 1.0) * t_g;
            let expected =
                theoretical_slope_noise(*count, &pattern_timing, read_noise, dark_current, None);
            let measured = measured * timing.gain * t;
            let expected = expected * t;
            groups.push(*count as f64);
            observed.push(measured * measured - expected * expected);
        }
        points.push(PatternPoints {
            groups,
            frames_per_group: curve.pattern.frames_per_group as f64,
            observed,
        });
    }
    let residual_count: usize = points.iter().map(|pattern| pattern.observed.len()).sum();

    let result = minimize::<2, _>(
        |params| {
            points
                .iter()
                .flat_map(|pattern| {
                    pattern.groups.iter().zip(&pattern.observed).map(|(groups, observed)| {
                        observed
                            - excess_variance_model(*groups, pattern.frames_per_group, *params)
                    })
                })
                .collect()
        },
        initial,
        &LmConfig::default(),
    )?;
    if !result.converged {
        tracing::warn!(
            stage = %CalibrationStage::ExcessVariance,
            iterations = result.iterations,
            "excess variance fit stopped before converging"
        );
    }
    tracing::info!(
        stage = %CalibrationStage::ExcessVariance,
        p0 = result.params[0],
        p1 = result.params[1],
        read_noise,
        dark_current,
        "excess variance fit complete"
    );
    Ok(ExcessVarianceFit {
        params: result.params,
        read_noise,
        dark_current,
        cost: result.cost,
        converged: result.converged,
        iterations: result.iterations,
        residual_count,
    })
}

#[cfg(test)]
mod tests {
    use super::{
        EffectiveNoiseAccumulator, EffectiveNoiseCurve, default_group_counts, fit_excess_variance,
        read_noise_from_curve, resample_ramp,
    };
    use crate::common::EffectiveNoiseConfig;
    use crate::detector::{
        DetectorGeometry, DetectorTiming, ReadoutPattern, ReferenceBorders, ScanLayout,
        theoretical_slope_noise,
    };
    use crate::domain::{CalibErrorCategory, Verbosity};
    use ndarray::Array3;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn timing() -> DetectorTiming {
        DetectorTiming {
            frame_time: 10.0,
            gain: 2.0,
            dark_current: Some(0.05),
            read_noise: Some(12.0),
            ..DetectorTiming::default()
        }
    }

    #[test]
    fn resampling_averages_groups_and_skips_dropped_frames() {
        let cube = Array3::from_shape_fn((12, 2, 2), |(k, _, _)| k as f64);
        let pattern = ReadoutPattern::new("SHALLOW", 2, 1);
        let resampled = resample_ramp(&cube, &pattern, None).expect("resample");
        let levels: Vec<f64> = resampled.outer_iter().map(|frame| frame[(1, 1)]).collect();
        assert_eq!(levels, vec![0.5, 3.5, 6.5, 9.5]);

        let mut delayed = pattern.clone();
        delayed.first_frame_delay = 1;
        let resampled = resample_ramp(&cube, &delayed, Some(4)).expect("resample");
        assert_eq!(resampled[(0, 0, 0)], 1.5);
        assert_eq!(resampled[(3, 0, 0)], 10.5);
    }

    #[test]
    fn resampling_beyond_the_ramp_is_rejected() {
        let cube = Array3::<f64>::zeros((12, 2, 2));
        let error = resample_ramp(&cube, &ReadoutPattern::new("SHALLOW", 2, 1), Some(5))
            .expect_err("too many groups");
        assert_eq!(error.category(), CalibErrorCategory::InvalidConfiguration);
    }

    #[test]
    fn default_group_counts_follow_pattern_kind() {
        assert_eq!(default_group_counts(10, true), vec![2, 3, 5, 10]);
        let rapid = default_group_counts(108, true);
        assert_eq!(rapid.len(), 18);
        assert_eq!(&rapid[..5], &[2, 3, 5, 10, 17]);
        assert_eq!(rapid.last(), Some(&108));
        assert_eq!(default_group_counts(12, false), (2..=12).collect::<Vec<_>>());
        let long = default_group_counts(50, false);
        assert_eq!(&long[..4], &[2, 3, 5, 8]);
        assert_eq!(long.last(), Some(&50));
        assert!(default_group_counts(1, true).is_empty());
    }

    #[test]
    fn white_read_noise_gives_least_squares_slope_noise() {
        let geometry = DetectorGeometry {
            rows: 40,
            cols: 32,
            channel_count: 2,
            channel_width: 16,
            borders: ReferenceBorders {
                bottom: 4,
                top: 4,
                left: 4,
                right: 4,
            },
            scan_layout: ScanLayout::default(),
        };
        let timing = timing();
        let config = EffectiveNoiseConfig {
            verbosity: Verbosity::Quiet,
            ..EffectiveNoiseConfig::default()
        };
        let pattern = ReadoutPattern::new("RAPID", 1, 0);
        let mut accumulator =
            EffectiveNoiseAccumulator::new(&geometry, &timing, &pattern, 10, &config, None)
                .expect("accumulator");
        assert_eq!(accumulator.group_counts(), &[2, 3, 5, 10]);

        let sigma = 5.0;
        let mut rng = StdRng::seed_from_u64(11);
        let normal = Normal::new(0.0, sigma).expect("normal");
        for _ in 0..5 {
            let ramp = Array3::from_shape_fn((10, 40, 32), |(k, _, _)| {
                0.3 * k as f64 + normal.sample(&mut rng)
            });
            accumulator.accumulate(&ramp).expect("accumulate");
        }
        let curve = accumulator.finish().expect("curve");
        let spatial = curve.spatial.as_ref().expect("spatial");
        assert_eq!(spatial.len(), 3);

        for (index, groups) in curve.group_counts.iter().enumerate() {
            let g = *groups as f64;
            let expected = sigma * (12.0 / (g * (g * g - 1.0))).sqrt() / timing.frame_time;
            for pool in 0..2 {
                let measured = spatial[pool][index];
                assert!(
                    (measured - expected).abs() / expected < 0.15,
                    "g={groups} pool={pool}: {measured} vs {expected}"
                );
            }
        }
        let temporal = curve.temporal.as_ref().expect("temporal");
        assert!(temporal[0][0] > 0.0 && temporal[0][0] < 2.0 * spatial[0][0]);
    }

    fn synthetic_curve(
        pattern: ReadoutPattern,
        timing: &DetectorTiming,
        groups: Vec<usize>,
        excess: [f64; 2],
    ) -> EffectiveNoiseCurve {
        let pattern_timing = timing.with_pattern(&pattern);
        let noise: Vec<f64> = groups
            .iter()
            .map(|count| {
                theoretical_slope_noise(*count, &pattern_timing, 12.0, 0.05, Some(excess))
                    / timing.gain
            })
            .collect();
        EffectiveNoiseCurve {
            pattern,
            times: Vec::new(),
            spatial: Some(vec![noise.clone(), noise.clone(), noise]),
            temporal: None,
            group_counts: groups,
            ramp_count: 1,
        }
    }

    #[test]
    fn excess_parameters_are_recovered_jointly_across_patterns() {
        let timing = timing();
        let truth = [2.0, 30.0];
        let curves = vec![
            synthetic_curve(
                ReadoutPattern::new("RAPID", 1, 0),
                &timing,
                vec![2, 3, 5, 10, 20, 40],
                truth,
            ),
            synthetic_curve(
                ReadoutPattern::new("BRIGHT2", 2, 0),
                &timing,
                vec![2, 4, 8, 16],
                truth,
            ),
        ];
        let fit = fit_excess_variance(&curves, &timing, 2, None, None, [1.5, 10.0])
            .expect("excess fit");
        assert_eq!(fit.residual_count, 10);
        assert!((fit.params[0].abs() - 2.0).abs() < 1.0e-3, "{:?}", fit.params);
        assert!((fit.params[1] - 30.0).abs() < 1.0e-2, "{:?}", fit.params);

        let predicted = fit.predicted_noise(10, &timing);
        let expected = theoretical_slope_noise(10, &timing, 12.0, 0.05, Some(truth));
        assert!((predicted - expected).abs() / expected < 1.0e-4);
    }

    #[test]
    fn read_noise_defaults_to_the_two_group_point() {
        let timing = DetectorTiming {
            read_noise: None,
            ..timing()
        };
        let curves = vec![synthetic_curve(
            ReadoutPattern::new("RAPID", 1, 0),
            &timing,
            vec![2, 3, 5, 10],
            [0.0, 0.0],
        )];
        let fit = fit_excess_variance(&curves, &timing, 2, None, None, [1.5, 10.0])
            .expect("excess fit");
        assert!((fit.read_noise - 12.0).abs() / 12.0 < 0.01, "{}", fit.read_noise);
    }

    #[test]
    fn two_group_read_noise_removes_one_frame_of_dark_shot_noise() {
        let timing = DetectorTiming {
            frame_time: 10.0,
            frames_per_group: 2,
            drop_frames_per_group: 2,
            gain: 2.0,
            ..DetectorTiming::default()
        };
        // 2 rn² + i_dark t_f with rn = 10 e-, i_dark = 5 e-/s.
        let integrated: f64 = 2.0 * 100.0 + 5.0 * 10.0;
        let first = integrated.sqrt() / (timing.group_time() * timing.gain);
        let read_noise = read_noise_from_curve(&[first], &timing, 5.0).expect("read noise");
        assert!((read_noise - 10.0).abs() < 1.0e-9, "{read_noise}");

        let clamped = read_noise_from_curve(&[first], &timing, 1.0e3).expect("clamped");
        assert_eq!(clamped, 0.0);
        let missing = read_noise_from_curve(&[], &timing, 5.0).expect_err("no points");
        assert_eq!(missing.category(), CalibErrorCategory::NumericDegeneracy);
    }

    #[test]
    fn single_point_is_underdetermined() {
        let timing = timing();
        let curves = vec![synthetic_curve(
            ReadoutPattern::new("RAPID", 1, 0),
            &timing,
            vec![2],
            [1.0, 1.0],
        )];
        let error = fit_excess_variance(&curves, &timing, 2, None, None, [1.5, 10.0])
            .expect_err("one residual");
        assert_eq!(error.category(), CalibErrorCategory::NumericDegeneracy);
    }
}
