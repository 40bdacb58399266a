//! Whole-column offsets that jump between states within a ramp (random
//! telegraph behavior in the column buffers or preamps).

use crate::common::ColumnVariationConfig;
use crate::detector::DetectorGeometry;
use crate::domain::{CalibError, CalibResult, CalibrationStage};
use crate::numerics::{mean, median_in_place, population_std, robust_std};
use ndarray::{Array2, Array3, Axis, s};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnVariations {
    /// `[frames, outliers]`: zero-centered column ramps of every flagged column.
    pub ramps: Array2<f64>,
    /// Mean fraction of columns flagged per ramp.
    pub probability: f64,
    pub outlier_counts: Vec<usize>,
}

/// Zero-centered column median ramps, `[frames, cols]`.
fn column_ramps(cube: &Array3<f64>, geometry: &DetectorGeometry) -> Array2<f64> {
    let (frames, _, cols) = cube.dim();
    let mut ramps = Array2::<f64>::zeros((frames, cols));
    let mut scratch = Vec::with_capacity(cube.len_of(Axis(1)));
    for (frame, image) in cube.axis_iter(Axis(0)).enumerate() {
        for (col, column) in image.axis_iter(Axis(1)).enumerate() {
            scratch.clear();
            scratch.extend(column.iter().copied());
            ramps[(frame, col)] = median_in_place(&mut scratch).unwrap_or(0.0);
        }
    }

    for mut column in ramps.axis_iter_mut(Axis(1)) {
        let mut values = column.to_vec();
        let level = median_in_place(&mut values).unwrap_or(0.0);
        column -= level;
    }
    for channel in 0..geometry.channel_count {
        let mut slab = ramps.slice_mut(s![.., geometry.channel_columns(channel)]);
        for mut row in slab.axis_iter_mut(Axis(0)) {
            let mut values = row.to_vec();
            let level = median_in_place(&mut values).unwrap_or(0.0);
            row -= level;
        }
    }
    ramps
}

/// Columns whose mean or scatter sits more than one robust sigma above the
/// typical column.
fn outlier_columns(ramps: &Array2<f64>, edge_exclusion: usize) -> Vec<usize> {
    let cols = ramps.len_of(Axis(1));
    let (averages, spreads): (Vec<f64>, Vec<f64>) = ramps
        .axis_iter(Axis(1))
        .map(|column| {
            let values = column.to_vec();
            (
                mean(&values).unwrap_or(0.0),
                population_std(&values).unwrap_or(0.0),
            )
        })
        .unzip();
    let limit = |values: &[f64]| {
        let mut scratch = values.to_vec();
        median_in_place(&mut scratch).unwrap_or(0.0) + robust_std(values).unwrap_or(0.0)
    };
    let average_limit = limit(&averages);
    let spread_limit = limit(&spreads);

    (0..cols)
        .filter(|col| *col >= edge_exclusion && *col + edge_exclusion < cols)
        .filter(|col| averages[*col].abs() > average_limit || spreads[*col] > spread_limit)
        .collect()
}

pub struct ColumnVariationAccumulator {
    geometry: DetectorGeometry,
    config: ColumnVariationConfig,
    frames: Option<usize>,
    /// One zero-centered ramp per flagged column.
    outliers: Vec<Vec<f64>>,
    outlier_counts: Vec<usize>,
}

impl ColumnVariationAccumulator {
    pub fn new(geometry: &DetectorGeometry, config: ColumnVariationConfig) -> Self {
        Self {
            geometry: *geometry,
            config,
            frames: None,
            outliers: Vec::new(),
            outlier_counts: Vec::new(),
        }
    }

    /// Add one bias-subtracted, dark-ramp-subtracted, corrected ramp.
    pub fn accumulate(&mut self, ramp: &Array3<f64>) -> CalibResult<usize> {
        let (frames, rows, cols) = ramp.dim();
        if (rows, cols) != self.geometry.shape() || self.frames.is_some_and(|known| known != frames) {
            return Err(CalibError::invalid_configuration(
                "CONFIG.CUBE_SHAPE",
                format!(
                    "ramp is {frames}x{rows}x{cols}; expected {}x{}x{}",
                    self.frames.unwrap_or(frames),
                    self.geometry.rows,
                    self.geometry.cols
                ),
            ));
        }
        self.frames = Some(frames);

        let ramps = column_ramps(ramp, &self.geometry);
        let flagged = outlier_columns(&ramps, self.config.edge_exclusion);
        for col in &flagged {
            self.outliers.push(ramps.column(*col).to_vec());
        }
        self.outlier_counts.push(flagged.len());
        self.config.verbosity.ramp_progress(
            CalibrationStage::ColumnVariations,
            self.outlier_counts.len() - 1,
            None,
        );
        Ok(flagged.len())
    }

    pub fn finish(self) -> CalibResult<ColumnVariations> {
        let Some(frames) = self.frames else {
            return Err(CalibError::invalid_configuration(
                "CONFIG.EMPTY_SOURCE",
                "column variations need at least one ramp",
            ));
        };
        let cols = self.geometry.cols as f64;
        let fractions: Vec<f64> = self
            .outlier_counts
            .iter()
            .map(|count| *count as f64 / cols)
            .collect();
        let probability = mean(&fractions).unwrap_or(0.0);
        let ramps = Array2::from_shape_fn((frames, self.outliers.len()), |(frame, outlier)| {
            self.outliers[outlier][frame]
        });
        tracing::info!(
            stage = %CalibrationStage::ColumnVariations,
            ramps = self.outlier_counts.len(),
            outliers = self.outliers.len(),
            probability,
            "column variations complete"
        );
        Ok(ColumnVariations {
            ramps,
            probability,
            outlier_counts: self.outlier_counts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::ColumnVariationAccumulator;
    use crate::common::ColumnVariationConfig;
    use crate::detector::{DetectorGeometry, ReferenceBorders, ScanLayout};
    use crate::domain::Verbosity;
    use ndarray::Array3;

    fn geometry() -> DetectorGeometry {
        DetectorGeometry {
            rows: 8,
            cols: 32,
            channel_count: 2,
            channel_width: 16,
            borders: ReferenceBorders::default(),
            scan_layout: ScanLayout::default(),
        }
    }

    fn config() -> ColumnVariationConfig {
        ColumnVariationConfig {
            verbosity: Verbosity::Quiet,
            ..ColumnVariationConfig::default()
        }
    }

    fn ramp_with_jump(col: usize) -> Array3<f64> {
        Array3::from_shape_fn((10, 8, 32), |(k, _, c)| {
            let jump = if c == col && k >= 5 { 20.0 } else { 0.0 };
            // Channel-wide drifts and a per-column bias are removed before flagging.
            let drift = if c < 16 { 0.5 * k as f64 } else { -(k as f64) };
            100.0 + c as f64 + drift + jump
        })
    }

    #[test]
    fn jumping_column_is_the_only_outlier() {
        let mut accumulator = ColumnVariationAccumulator::new(&geometry(), config());
        assert_eq!(accumulator.accumulate(&ramp_with_jump(10)).expect("ramp"), 1);
        assert_eq!(accumulator.accumulate(&ramp_with_jump(20)).expect("ramp"), 1);
        let variations = accumulator.finish().expect("variations");
        assert_eq!(variations.ramps.dim(), (10, 2));
        assert!((variations.probability - 1.0 / 32.0).abs() < 1.0e-12);
        assert!((variations.ramps[(0, 0)] + 10.0).abs() < 1.0e-9);
        assert!((variations.ramps[(9, 0)] - 10.0).abs() < 1.0e-9);
    }

    #[test]
    fn jumps_at_the_edges_are_ignored() {
        let mut accumulator = ColumnVariationAccumulator::new(&geometry(), config());
        assert_eq!(accumulator.accumulate(&ramp_with_jump(1)).expect("ramp"), 0);
        assert_eq!(accumulator.accumulate(&ramp_with_jump(30)).expect("ramp"), 0);
        let variations = accumulator.finish().expect("variations");
        assert_eq!(variations.ramps.dim(), (10, 0));
        assert_eq!(variations.probability, 0.0);
    }

    #[test]
    fn frame_count_must_stay_constant() {
        let mut accumulator = ColumnVariationAccumulator::new(&geometry(), config());
        accumulator.accumulate(&ramp_with_jump(10)).expect("ramp");
        let short = Array3::<f64>::zeros((5, 8, 32));
        let error = accumulator.accumulate(&short).expect_err("frame mismatch");
        assert_eq!(error.placeholder(), "CONFIG.CUBE_SHAPE");
    }
}
