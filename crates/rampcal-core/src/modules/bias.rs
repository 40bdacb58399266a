//! Super bias: the zero-time intercept of every ramp, combined across the
//! ensemble. The per-ramp fits are independent and run on a bounded pool.

use crate::common::BiasConfig;
use crate::detector::{DetectorTiming, RampSource, RampUnit, ReferenceCorrector};
use crate::domain::{CalibError, CalibResult, CalibrationStage};
use crate::numerics::{
    PolyBasis, PolyFitter, histogram_mode, median_abs_deviation, median_stack, robust_std_stack,
};
use ndarray::{Array2, Array3, Axis, stack};
use rayon::prelude::*;
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};

#[derive(Debug, Clone, PartialEq)]
pub struct SuperBias {
    pub mean: Array2<f64>,
    pub sigma: Array2<f64>,
}

impl SuperBias {
    /// New bias with a residual offset image folded in; sigma is unchanged.
    pub fn updated(&self, offset: &Array2<f64>) -> Self {
        Self {
            mean: &self.mean + offset,
            sigma: self.sigma.clone(),
        }
    }
}

/// Peak of the bias-uncertainty distribution (reset noise) and its spread, in DN.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct KtcNoise {
    pub peak: f64,
    pub spread: f64,
}

pub fn ktc_noise(sigma_values: &[f64], bin_size: f64) -> Option<KtcNoise> {
    let peak = histogram_mode(sigma_values, bin_size)?;
    let spread = median_abs_deviation(sigma_values)?;
    Some(KtcNoise { peak, spread })
}

/// Fit one ramp and return its intercept image.
fn intercept_image(
    source: &dyn RampSource,
    corrector: &dyn ReferenceCorrector,
    timing: &DetectorTiming,
    config: &BiasConfig,
    unit: RampUnit,
) -> CalibResult<Array2<f64>> {
    let cube = source.load(unit)?;
    let cube = corrector.correct(cube, &config.correction)?;
    let frames = cube.len_of(Axis(0));
    let times = timing.time_axis(frames);
    let fitter = PolyFitter::new(&times, config.fit_degree, PolyBasis::Power)?;
    let coefficients = fitter.fit_cube(cube.view())?;
    Ok(coefficients.index_axis_move(Axis(0), 0))
}

/// Build the super bias from every unit the source offers.
///
/// Results are ordered by task index. The first failing task aborts the pass;
/// a panicking worker surfaces as `PoolFailure`.
pub fn build_super_bias(
    source: &dyn RampSource,
    corrector: &dyn ReferenceCorrector,
    timing: &DetectorTiming,
    config: &BiasConfig,
) -> CalibResult<SuperBias> {
    let tasks = source.units();
    if tasks.is_empty() {
        return Err(CalibError::invalid_configuration(
            "CONFIG.EMPTY_SOURCE",
            "super bias needs at least one ramp",
        ));
    }
    tracing::info!(
        stage = %CalibrationStage::SuperBias,
        tasks = tasks.len(),
        workers = config.worker_count,
        "fitting ramp intercepts"
    );

    let total = tasks.len();
    let run_task = |(index, unit): (usize, &RampUnit)| -> CalibResult<Array2<f64>> {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            intercept_image(source, corrector, timing, config, *unit)
        }));
        let image = outcome.map_err(|_| {
            CalibError::pool_failure(
                "POOL.WORKER_PANIC",
                format!(
                    "bias worker panicked on container {} integration {}",
                    unit.container, unit.integration
                ),
            )
        })??;
        config
            .verbosity
            .ramp_progress(CalibrationStage::SuperBias, index, Some(total));
        Ok(image)
    };

    let intercepts: Vec<Array2<f64>> = if config.worker_count <= 1 {
        tasks.iter().enumerate().map(run_task).collect::<CalibResult<_>>()?
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_count)
            .build()
            .map_err(|error| {
                CalibError::pool_failure("POOL.BUILD", format!("worker pool failed: {error}"))
            })?;
        pool.install(|| {
            tasks
                .par_iter()
                .enumerate()
                .map(run_task)
                .collect::<CalibResult<_>>()
        })?
    };

    let views: Vec<_> = intercepts.iter().map(Array2::view).collect();
    let stacked: Array3<f64> = stack(Axis(0), &views).map_err(|error| {
        CalibError::invalid_configuration(
            "CONFIG.CUBE_SHAPE",
            format!("ramps disagree on frame shape: {error}"),
        )
    })?;

    Ok(SuperBias {
        mean: median_stack(stacked.view()),
        sigma: robust_std_stack(stacked.view()),
    })
}

#[cfg(test)]
mod tests {
    use super::{SuperBias, build_super_bias, ktc_noise};
    use crate::common::BiasConfig;
    use crate::detector::{
        DetectorTiming, IdentityCorrector, MemoryRampSource, RampSource, RampUnit,
    };
    use crate::domain::{CalibErrorCategory, CalibResult};
    use ndarray::{Array2, Array3};

    fn timing() -> DetectorTiming {
        DetectorTiming {
            frame_time: 1.0,
            ..DetectorTiming::default()
        }
    }

    fn linear_ramp(intercept: f64, slope: f64) -> Array3<f64> {
        Array3::from_shape_fn((6, 3, 4), |(k, r, c)| {
            intercept + (r + c) as f64 + slope * (k + 1) as f64
        })
    }

    #[test]
    fn intercepts_recover_bias_in_parallel_and_sequentially() {
        let ramps: Vec<_> = [10.0, 11.0, 12.0, 1000.0, 11.0]
            .iter()
            .map(|bias| linear_ramp(*bias, 2.5))
            .collect();
        let source = MemoryRampSource::from_ramps(ramps);

        for workers in [1, 3] {
            let config = BiasConfig {
                worker_count: workers,
                ..BiasConfig::default()
            };
            let bias = build_super_bias(&source, &IdentityCorrector, &timing(), &config)
                .expect("bias");
            assert!((bias.mean[(0, 0)] - 11.0).abs() < 1.0e-8, "{}", bias.mean[(0, 0)]);
            assert!((bias.mean[(2, 3)] - 16.0).abs() < 1.0e-8);
            assert!(bias.sigma[(1, 1)] < 5.0);
        }
    }

    struct FailingSource;

    impl RampSource for FailingSource {
        fn units(&self) -> Vec<RampUnit> {
            (0..4)
                .map(|container| RampUnit {
                    container,
                    integration: 0,
                })
                .collect()
        }

        fn integration_count(&self, _container: usize) -> CalibResult<usize> {
            Ok(1)
        }

        fn load(&self, unit: RampUnit) -> CalibResult<Array3<f64>> {
            if unit.container == 2 {
                panic!("corrupt container");
            }
            Ok(Array3::zeros((4, 2, 2)))
        }
    }

    #[test]
    fn worker_panic_aborts_the_pass() {
        let config = BiasConfig {
            worker_count: 2,
            ..BiasConfig::default()
        };
        let error = build_super_bias(&FailingSource, &IdentityCorrector, &timing(), &config)
            .expect_err("pool failure");
        assert_eq!(error.category(), CalibErrorCategory::PoolFailure);
    }

    #[test]
    fn ktc_peak_sits_on_dominant_sigma() {
        let mut values = vec![3.1; 50];
        values.extend([5.0, 7.0, 9.0]);
        let noise = ktc_noise(&values, 0.25).expect("non-empty");
        assert!((noise.peak - 3.225).abs() < 1.0e-9, "{}", noise.peak);
    }

    #[test]
    fn updated_bias_adds_offset() {
        let bias = SuperBias {
            mean: Array2::from_elem((2, 2), 1.0),
            sigma: Array2::from_elem((2, 2), 0.5),
        };
        let updated = bias.updated(&Array2::from_elem((2, 2), 0.25));
        assert_eq!(updated.mean[(1, 0)], 1.25);
        assert_eq!(updated.sigma, bias.sigma);
    }
}
