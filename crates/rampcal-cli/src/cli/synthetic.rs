//! Deterministic synthetic dark ramps for exercising the calibration stages.
//!
//! Fixed structure (bias pattern, dark current, hot pixels with a symmetric
//! IPC leak) is drawn once from the seed; every ramp then adds its own kTC
//! offset, per-channel offsets, row-correlated noise and white read noise.
//! Ramps are regenerated on each load, so every pass sees identical data.

use ndarray::{Array2, Array3, Axis};
use rampcal_core::detector::{
    DetectorGeometry, DetectorTiming, RampSource, RampUnit, check_integration_index,
};
use rampcal_core::{CalibError, CalibResult};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Injected detector properties, all in DN or DN/s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(super) struct SyntheticDetector {
    pub(super) bias_level: f64,
    pub(super) bias_spread: f64,
    pub(super) ktc_noise: f64,
    pub(super) dark_rate: f64,
    pub(super) hot_pixel_rate: f64,
    /// Hot pixels sit on a square grid with this pitch; 0 disables them.
    pub(super) hot_pixel_spacing: usize,
    /// Fraction leaked into each of the four nearest neighbors.
    pub(super) ipc_alpha: f64,
    pub(super) read_noise: f64,
    /// Per-row offset shared by every channel.
    pub(super) correlated_noise: f64,
    /// Per-frame offset of each channel, removable with the reference rows.
    pub(super) channel_offset_noise: f64,
}

impl Default for SyntheticDetector {
    fn default() -> Self {
        Self {
            bias_level: 12_000.0,
            bias_spread: 40.0,
            ktc_noise: 8.0,
            dark_rate: 0.02,
            hot_pixel_rate: 60.0,
            hot_pixel_spacing: 8,
            ipc_alpha: 0.01,
            read_noise: 5.0,
            correlated_noise: 2.0,
            channel_offset_noise: 5.0,
        }
    }
}

fn normal(mean: f64, sigma: f64, what: &str) -> CalibResult<Normal<f64>> {
    Normal::new(mean, sigma).map_err(|error| {
        CalibError::invalid_configuration(
            "CONFIG.SYNTHETIC",
            format!("{what} sigma {sigma} is not usable: {error}"),
        )
    })
}

/// Rate image after the symmetric nearest-neighbor leak.
fn apply_ipc(rate: &Array2<f64>, alpha: f64) -> Array2<f64> {
    let (rows, cols) = rate.dim();
    Array2::from_shape_fn((rows, cols), |(row, col)| {
        let mut leaked = 0.0;
        if row > 0 {
            leaked += rate[(row - 1, col)];
        }
        if row + 1 < rows {
            leaked += rate[(row + 1, col)];
        }
        if col > 0 {
            leaked += rate[(row, col - 1)];
        }
        if col + 1 < cols {
            leaked += rate[(row, col + 1)];
        }
        (1.0 - 4.0 * alpha) * rate[(row, col)] + alpha * leaked
    })
}

pub(super) struct SyntheticRampSource {
    geometry: DetectorGeometry,
    detector: SyntheticDetector,
    times: Vec<f64>,
    ramps: usize,
    seed: u64,
    bias: Array2<f64>,
    rate: Array2<f64>,
}

impl SyntheticRampSource {
    pub(super) fn new(
        geometry: &DetectorGeometry,
        timing: &DetectorTiming,
        detector: SyntheticDetector,
        ramps: usize,
        frames: usize,
        seed: u64,
    ) -> CalibResult<Self> {
        if frames < 4 {
            return Err(CalibError::invalid_configuration(
                "CONFIG.SYNTHETIC_FRAMES",
                format!("synthetic ramps need at least 4 frames, got {frames}"),
            ));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let spread = normal(detector.bias_level, detector.bias_spread, "bias")?;
        let bias = Array2::from_shape_fn(geometry.shape(), |_| spread.sample(&mut rng));

        let spacing = detector.hot_pixel_spacing;
        let intrinsic = Array2::from_shape_fn(geometry.shape(), |(row, col)| {
            if geometry.is_reference(row, col) {
                0.0
            } else if spacing > 0 && row % spacing == 0 && col % spacing == 0 {
                detector.hot_pixel_rate
            } else {
                detector.dark_rate
            }
        });
        let rate = apply_ipc(&intrinsic, detector.ipc_alpha);

        Ok(Self {
            geometry: *geometry,
            times: timing.time_axis(frames),
            detector,
            ramps,
            seed,
            bias,
            rate,
        })
    }

    pub(super) fn hot_pixel_count(&self) -> usize {
        let spacing = self.detector.hot_pixel_spacing;
        if spacing == 0 {
            return 0;
        }
        (0..self.geometry.rows)
            .step_by(spacing)
            .flat_map(|row| (0..self.geometry.cols).step_by(spacing).map(move |col| (row, col)))
            .filter(|&(row, col)| !self.geometry.is_reference(row, col))
            .count()
    }

    fn generate(&self, integration: usize) -> CalibResult<Array3<f64>> {
        let detector = &self.detector;
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(1 + integration as u64));
        let ktc = normal(0.0, detector.ktc_noise, "kTC")?;
        let white = normal(0.0, detector.read_noise, "read noise")?;
        let correlated = normal(0.0, detector.correlated_noise, "correlated noise")?;
        let channel_offset = normal(0.0, detector.channel_offset_noise, "channel offset")?;

        let reset = self.bias.mapv(|level| level + ktc.sample(&mut rng));
        let (rows, cols) = self.geometry.shape();
        let mut cube = Array3::<f64>::zeros((self.times.len(), rows, cols));
        for (frame, mut image) in cube.axis_iter_mut(Axis(0)).enumerate() {
            let elapsed = self.times[frame];
            let offsets: Vec<f64> = (0..self.geometry.channel_count)
                .map(|_| channel_offset.sample(&mut rng))
                .collect();
            let row_noise: Vec<f64> = (0..rows).map(|_| correlated.sample(&mut rng)).collect();
            for ((row, col), value) in image.indexed_iter_mut() {
                let channel = self.geometry.channel_of_column(col);
                *value = reset[(row, col)]
                    + self.rate[(row, col)] * elapsed
                    + offsets[channel]
                    + row_noise[row]
                    + white.sample(&mut rng);
            }
        }
        Ok(cube)
    }
}

impl RampSource for SyntheticRampSource {
    fn units(&self) -> Vec<RampUnit> {
        (0..self.ramps)
            .map(|integration| RampUnit {
                container: 0,
                integration,
            })
            .collect()
    }

    fn integration_count(&self, container: usize) -> CalibResult<usize> {
        if container != 0 {
            return Err(CalibError::invalid_configuration(
                "CONFIG.CONTAINER_INDEX",
                format!("synthetic source has one container, {container} requested"),
            ));
        }
        Ok(self.ramps)
    }

    fn load(&self, unit: RampUnit) -> CalibResult<Array3<f64>> {
        let available = self.integration_count(unit.container)?;
        check_integration_index(unit, available)?;
        self.generate(unit.integration)
    }
}
