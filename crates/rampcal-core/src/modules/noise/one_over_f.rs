//! Extraction of the row-correlated (1/f) pattern from CDS images and its split
//! into the part shared by all channels and the per-channel remainder.

use crate::common::constants::OUTLIER_MAD_FACTOR;
use crate::detector::DetectorGeometry;
use crate::domain::CalibResult;
use crate::numerics::{SavGolFilter, median_abs_deviation, median_in_place};
use ndarray::{Array2, Axis, s};

#[derive(Debug, Clone, Copy)]
pub struct FixedPatternExtractor {
    geometry: DetectorGeometry,
    filter: SavGolFilter,
    outlier_rejection: bool,
}

impl FixedPatternExtractor {
    pub fn new(
        geometry: &DetectorGeometry,
        savgol_window: usize,
        savgol_order: usize,
        outlier_rejection: bool,
    ) -> CalibResult<Self> {
        Ok(Self {
            geometry: *geometry,
            filter: SavGolFilter::new(savgol_window, savgol_order)?,
            outlier_rejection,
        })
    }

    fn outlier_mask(&self, image: &Array2<f64>) -> Array2<bool> {
        let mut values: Vec<f64> = image.iter().copied().collect();
        let center = median_in_place(&mut values).unwrap_or(0.0);
        let spread = median_abs_deviation(&values).unwrap_or(0.0);
        let limit = OUTLIER_MAD_FACTOR * spread;
        image.mapv(|value| (value - center).abs() > limit)
    }

    /// Smoothed per-channel row profile of `image`, broadcast across each
    /// channel's columns.
    ///
    /// With `reject_outliers` (and rejection enabled) pixels far from the image
    /// median are left out of the row medians.
    pub fn extract(&self, image: &Array2<f64>, reject_outliers: bool) -> CalibResult<Array2<f64>> {
        let mask = if reject_outliers && self.outlier_rejection {
            Some(self.outlier_mask(image))
        } else {
            None
        };

        let mut pattern = Array2::<f64>::zeros(image.dim());
        let mut scratch = Vec::with_capacity(self.geometry.channel_width);
        for channel in 0..self.geometry.channel_count {
            let columns = self.geometry.channel_columns(channel);
            let profile: Vec<f64> = image
                .axis_iter(Axis(0))
                .enumerate()
                .map(|(row, values)| {
                    scratch.clear();
                    for col in columns.clone() {
                        let rejected = mask.as_ref().is_some_and(|mask| mask[(row, col)]);
                        if !rejected {
                            scratch.push(values[col]);
                        }
                    }
                    median_in_place(&mut scratch).unwrap_or(f64::NAN)
                })
                .collect();
            let smoothed = self.filter.smooth(&profile)?;

            let mut slab = pattern.slice_mut(s![.., columns]);
            for (mut row, level) in slab.axis_iter_mut(Axis(0)).zip(smoothed) {
                row.fill(level);
            }
        }
        Ok(pattern)
    }

    /// Shared pattern in readout order (`[rows, channel_width]`) and the
    /// per-channel remainder in detector orientation.
    pub fn split_correlated(&self, pattern: &Array2<f64>) -> (Array2<f64>, Array2<f64>) {
        split_correlated(pattern, &self.geometry)
    }
}

pub fn split_correlated(pattern: &Array2<f64>, geometry: &DetectorGeometry) -> (Array2<f64>, Array2<f64>) {
    let mut correlated = Array2::<f64>::zeros((geometry.rows, geometry.channel_width));
    for channel in 0..geometry.channel_count {
        correlated += &geometry.channel_in_readout_order(pattern.view(), channel);
    }
    correlated /= geometry.channel_count.max(1) as f64;

    let mut tiled = Array2::<f64>::zeros(pattern.dim());
    for channel in 0..geometry.channel_count {
        geometry.store_channel(tiled.view_mut(), channel, &correlated);
    }
    (correlated, pattern - &tiled)
}
