//! Per-ramp decomposition of CDS noise into total, white, correlated and
//! uncorrelated 1/f components for the active and reference pools.

use super::cds::{CdsNoise, cds_noise, cds_pairs, pool_series};
use super::one_over_f::FixedPatternExtractor;
use crate::common::{NoiseConfig, NoiseEstimator};
use crate::detector::{DetectorGeometry, PixelMasks};
use crate::domain::{CalibError, CalibResult, CalibrationStage};
use crate::numerics::median_in_place;
use ndarray::{Array2, Array3, Axis, Zip, s};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseComponent {
    /// Reference-corrected ramp without column fix.
    Total,
    /// Column-fixed ramp with its own row pattern removed.
    White,
    CorrelatedPink,
    UncorrelatedPink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CdsEstimator {
    Temporal,
    Spatial,
}

impl CdsEstimator {
    fn pick(self, noise: CdsNoise) -> f64 {
        match self {
            Self::Temporal => noise.temporal,
            Self::Spatial => noise.spatial,
        }
    }

    fn selected(choice: NoiseEstimator) -> &'static [CdsEstimator] {
        match choice {
            NoiseEstimator::Spatial => &[CdsEstimator::Spatial],
            NoiseEstimator::Temporal => &[CdsEstimator::Temporal],
            NoiseEstimator::Average => &[CdsEstimator::Spatial, CdsEstimator::Temporal],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelPool {
    Active,
    Reference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NoiseKey {
    pub component: NoiseComponent,
    pub estimator: CdsEstimator,
    pub pool: PixelPool,
}

impl NoiseKey {
    pub const fn new(component: NoiseComponent, estimator: CdsEstimator, pool: PixelPool) -> Self {
        Self {
            component,
            estimator,
            pool,
        }
    }
}

/// Per-ramp, per-channel noise values keyed by component, estimator and pool.
///
/// `CorrelatedPink` rows hold a single value since the shared pattern is one
/// channel wide.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NoiseComponentDict {
    rows: BTreeMap<NoiseKey, Vec<Vec<f64>>>,
}

fn nan_median(values: &[f64]) -> f64 {
    let mut finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    median_in_place(&mut finite).unwrap_or(f64::NAN)
}

impl NoiseComponentDict {
    pub fn record(&mut self, key: NoiseKey, values: Vec<f64>) {
        self.rows.entry(key).or_default().push(values);
    }

    pub fn rows(&self, key: NoiseKey) -> Option<&[Vec<f64>]> {
        self.rows.get(&key).map(Vec::as_slice)
    }

    pub fn ramp_count(&self) -> usize {
        self.rows.values().map(Vec::len).max().unwrap_or(0)
    }

    /// Per-channel median over ramps; non-finite entries are skipped.
    pub fn median_over_ramps(&self, key: NoiseKey) -> Option<Vec<f64>> {
        let rows = self.rows.get(&key)?;
        let width = rows.first()?.len();
        Some(
            (0..width)
                .map(|channel| {
                    let column: Vec<f64> = rows.iter().filter_map(|row| row.get(channel).copied()).collect();
                    nan_median(&column)
                })
                .collect(),
        )
    }

    /// Root mean square over every ramp, channel and estimator of one component.
    pub fn rms(&self, component: NoiseComponent, pool: PixelPool) -> Option<f64> {
        let values: Vec<f64> = [CdsEstimator::Spatial, CdsEstimator::Temporal]
            .iter()
            .filter_map(|estimator| self.rows.get(&NoiseKey::new(component, *estimator, pool)))
            .flatten()
            .flatten()
            .copied()
            .filter(|value| value.is_finite())
            .collect();
        if values.is_empty() {
            return None;
        }
        Some((values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt())
    }

    /// Headline values for the chosen estimator; `Average` averages the spatial
    /// and temporal results.
    pub fn summary(&self, choice: NoiseEstimator) -> CalibResult<CdsNoiseSummary> {
        let estimators = CdsEstimator::selected(choice);
        let missing = |key: NoiseKey| {
            CalibError::numeric_degeneracy(
                "NUMERIC.NOISE_EMPTY",
                format!("no {:?} {:?} {:?} noise rows recorded", key.component, key.estimator, key.pool),
            )
        };
        let median_of = |key: NoiseKey| self.median_over_ramps(key).ok_or_else(|| missing(key));

        let mut total: Vec<f64> = Vec::new();
        let mut white: Vec<f64> = Vec::new();
        let mut pink_uncorrelated: Vec<f64> = Vec::new();
        let mut pink_correlated = 0.0;
        let mut reference_ratio = 0.0;
        let add = |target: &mut Vec<f64>, values: Vec<f64>| {
            if target.is_empty() {
                *target = values;
            } else {
                for (sum, value) in target.iter_mut().zip(values) {
                    *sum += value;
                }
            }
        };

        for estimator in estimators {
            let key = |component, pool| NoiseKey::new(component, *estimator, pool);
            add(&mut total, median_of(key(NoiseComponent::Total, PixelPool::Active))?);
            add(&mut white, median_of(key(NoiseComponent::White, PixelPool::Active))?);
            add(
                &mut pink_uncorrelated,
                median_of(key(NoiseComponent::UncorrelatedPink, PixelPool::Active))?,
            );
            let correlated = self
                .rows
                .get(&key(NoiseComponent::CorrelatedPink, PixelPool::Active))
                .ok_or_else(|| missing(key(NoiseComponent::CorrelatedPink, PixelPool::Active)))?;
            let flat: Vec<f64> = correlated.iter().flatten().copied().collect();
            pink_correlated += nan_median(&flat);

            let active = self
                .rows
                .get(&key(NoiseComponent::White, PixelPool::Active))
                .ok_or_else(|| missing(key(NoiseComponent::White, PixelPool::Active)))?;
            let reference = self
                .rows
                .get(&key(NoiseComponent::White, PixelPool::Reference))
                .ok_or_else(|| missing(key(NoiseComponent::White, PixelPool::Reference)))?;
            let ratios: Vec<f64> = active
                .iter()
                .flatten()
                .zip(reference.iter().flatten())
                .map(|(act, reference)| reference / act)
                .filter(|ratio| ratio.is_finite())
                .collect();
            if !ratios.is_empty() {
                reference_ratio += ratios.iter().sum::<f64>() / ratios.len() as f64;
            }
        }

        let count = estimators.len() as f64;
        let scale = |values: Vec<f64>| values.into_iter().map(|v| v / count).collect::<Vec<_>>();
        Ok(CdsNoiseSummary {
            total: scale(total),
            white: scale(white),
            pink_uncorrelated: scale(pink_uncorrelated),
            pink_correlated: pink_correlated / count,
            reference_ratio: reference_ratio / count,
        })
    }
}

/// Per-channel CDS noise components, in DN.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CdsNoiseSummary {
    pub total: Vec<f64>,
    pub white: Vec<f64>,
    pub pink_uncorrelated: Vec<f64>,
    pub pink_correlated: f64,
    /// Mean of reference-pool over active-pool white noise.
    pub reference_ratio: f64,
}

/// Streams ramps into a [`NoiseComponentDict`].
pub struct NoiseDecomposer {
    geometry: DetectorGeometry,
    masks: PixelMasks,
    config: NoiseConfig,
    extractor: FixedPatternExtractor,
    dict: NoiseComponentDict,
}

impl NoiseDecomposer {
    pub fn new(geometry: &DetectorGeometry, config: NoiseConfig) -> CalibResult<Self> {
        let extractor = FixedPatternExtractor::new(
            geometry,
            config.savgol_window,
            config.savgol_order,
            config.outlier_rejection,
        )?;
        Ok(Self {
            geometry: *geometry,
            masks: PixelMasks::from_geometry(geometry),
            config,
            extractor,
            dict: NoiseComponentDict::default(),
        })
    }

    fn active_masks(&self, goodness: Option<&Array2<bool>>) -> Vec<Array2<bool>> {
        (0..self.geometry.channel_count)
            .map(|channel| {
                let mut mask = self.masks.active_in_channel(channel);
                if let Some(good) = goodness.filter(|_| self.config.use_goodness_mask) {
                    Zip::from(&mut mask).and(good).for_each(|keep, good| *keep &= *good);
                }
                mask
            })
            .collect()
    }

    fn record_pools(
        &mut self,
        component: NoiseComponent,
        cube: &Array3<f64>,
        active: &[Array2<bool>],
        with_reference: bool,
    ) -> CalibResult<()> {
        let pairing = self.config.pairing;
        let mut spatial = Vec::with_capacity(active.len());
        let mut temporal = Vec::with_capacity(active.len());
        for mask in active {
            let noise = cds_noise(pool_series(cube.view(), mask).view(), pairing)?;
            spatial.push(noise.spatial);
            temporal.push(noise.temporal);
        }
        self.dict.record(NoiseKey::new(component, CdsEstimator::Spatial, PixelPool::Active), spatial);
        self.dict.record(NoiseKey::new(component, CdsEstimator::Temporal, PixelPool::Active), temporal);

        if with_reference {
            let mut spatial = Vec::with_capacity(active.len());
            let mut temporal = Vec::with_capacity(active.len());
            for channel in 0..self.geometry.channel_count {
                let mask = self.masks.reference_rows_in_channel(channel);
                let noise = cds_noise(pool_series(cube.view(), &mask).view(), pairing)?;
                spatial.push(noise.spatial);
                temporal.push(noise.temporal);
            }
            self.dict
                .record(NoiseKey::new(component, CdsEstimator::Spatial, PixelPool::Reference), spatial);
            self.dict
                .record(NoiseKey::new(component, CdsEstimator::Temporal, PixelPool::Reference), temporal);
        }
        Ok(())
    }

    /// Add one ramp.
    ///
    /// `total` is reference-corrected without the column fix, `white` the same
    /// ramp corrected with it. `goodness` restricts the active pool.
    pub fn accumulate(
        &mut self,
        total: &Array3<f64>,
        white: &Array3<f64>,
        goodness: Option<&Array2<bool>>,
    ) -> CalibResult<()> {
        let shape = self.geometry.shape();
        if (total.dim().1, total.dim().2) != shape || white.dim() != total.dim() {
            return Err(CalibError::invalid_configuration(
                "CONFIG.CUBE_SHAPE",
                "noise ramps disagree with the detector shape",
            ));
        }
        let active = self.active_masks(goodness);

        self.record_pools(NoiseComponent::Total, total, &active, true)?;

        let frames = total.len_of(Axis(0)).min(self.config.pink_frame_limit);
        let pairs = cds_pairs(total.slice(s![..frames, .., ..]), self.config.pairing)?;
        let pair_count = pairs.len_of(Axis(0));
        let width = self.geometry.channel_width;
        let mut uncorrelated = Array3::<f64>::zeros(pairs.dim());
        let mut correlated = Array3::<f64>::zeros((pair_count, shape.0, width));
        for (index, image) in pairs.axis_iter(Axis(0)).enumerate() {
            let pattern = self.extractor.extract(&image.to_owned(), true)? / std::f64::consts::SQRT_2;
            let (shared, private) = self.extractor.split_correlated(&pattern);
            correlated.index_axis_mut(Axis(0), index).assign(&shared);
            uncorrelated.index_axis_mut(Axis(0), index).assign(&private);
        }
        self.record_pools(NoiseComponent::UncorrelatedPink, &uncorrelated, &active, false)?;

        let mut footprint = self.masks.active.slice(s![.., ..width]).to_owned();
        if let Some(good) = goodness.filter(|_| self.config.use_goodness_mask) {
            Zip::from(&mut footprint)
                .and(&good.slice(s![.., ..width]))
                .for_each(|keep, good| *keep &= *good);
        }
        let shared = cds_noise(pool_series(correlated.view(), &footprint).view(), self.config.pairing)?;
        self.dict.record(
            NoiseKey::new(NoiseComponent::CorrelatedPink, CdsEstimator::Spatial, PixelPool::Active),
            vec![shared.spatial],
        );
        self.dict.record(
            NoiseKey::new(NoiseComponent::CorrelatedPink, CdsEstimator::Temporal, PixelPool::Active),
            vec![shared.temporal],
        );

        let mut detector_only = white.clone();
        for mut frame in detector_only.axis_iter_mut(Axis(0)) {
            let pattern = self.extractor.extract(&frame.to_owned(), false)?;
            frame -= &pattern;
        }
        self.record_pools(NoiseComponent::White, &detector_only, &active, true)?;

        self.config.verbosity.ramp_progress(
            CalibrationStage::Noise,
            self.dict.ramp_count() - 1,
            None,
        );
        Ok(())
    }

    pub fn finish(self) -> NoiseComponentDict {
        tracing::info!(
            stage = %CalibrationStage::Noise,
            ramps = self.dict.ramp_count(),
            "noise components collected"
        );
        self.dict
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CdsEstimator, NoiseComponent, NoiseComponentDict, NoiseKey, PixelPool,
    };
    use crate::common::NoiseEstimator;

    fn filled_dict() -> NoiseComponentDict {
        let mut dict = NoiseComponentDict::default();
        for (estimator, scale) in [(CdsEstimator::Spatial, 1.0), (CdsEstimator::Temporal, 3.0)] {
            for ramp in 0..3 {
                let bump = ramp as f64 * 0.1;
                let active = |component| NoiseKey::new(component, estimator, PixelPool::Active);
                dict.record(active(NoiseComponent::Total), vec![10.0 * scale + bump, 11.0 * scale]);
                dict.record(active(NoiseComponent::White), vec![8.0 * scale, 8.0 * scale]);
                dict.record(active(NoiseComponent::UncorrelatedPink), vec![2.0 * scale, 3.0 * scale]);
                dict.record(active(NoiseComponent::CorrelatedPink), vec![1.5 * scale]);
                dict.record(
                    NoiseKey::new(NoiseComponent::White, estimator, PixelPool::Reference),
                    vec![4.0 * scale, 4.0 * scale],
                );
            }
        }
        dict
    }

    #[test]
    fn median_over_ramps_is_per_channel() {
        let dict = filled_dict();
        let key = NoiseKey::new(NoiseComponent::Total, CdsEstimator::Spatial, PixelPool::Active);
        let medians = dict.median_over_ramps(key).expect("rows");
        assert!((medians[0] - 10.1).abs() < 1.0e-12);
        assert!((medians[1] - 11.0).abs() < 1.0e-12);
        assert_eq!(dict.ramp_count(), 3);
    }

    #[test]
    fn average_summary_blends_estimators() {
        let dict = filled_dict();
        let spatial = dict.summary(NoiseEstimator::Spatial).expect("summary");
        assert!((spatial.white[0] - 8.0).abs() < 1.0e-12);
        assert!((spatial.reference_ratio - 0.5).abs() < 1.0e-12);
        let average = dict.summary(NoiseEstimator::Average).expect("summary");
        assert!((average.white[1] - 16.0).abs() < 1.0e-12);
        assert!((average.pink_correlated - 3.0).abs() < 1.0e-12);
        assert!((average.reference_ratio - 0.5).abs() < 1.0e-12);
    }

    #[test]
    fn missing_rows_are_reported() {
        let dict = NoiseComponentDict::default();
        assert!(dict.summary(NoiseEstimator::Temporal).is_err());
        assert!(dict.rms(NoiseComponent::White, PixelPool::Active).is_none());
    }
}
