//! Correlated double sampling and the two CDS noise estimators.

use crate::common::CdsPairing;
use crate::domain::{CalibError, CalibResult};
use crate::numerics::{median_in_place, population_std};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, s};
use serde::Serialize;

/// Difference images of a frame sequence; the leading axis is the frame axis.
pub fn cds_pairs(frames: ArrayView3<'_, f64>, pairing: CdsPairing) -> CalibResult<Array3<f64>> {
    let count = frames.len_of(Axis(0));
    if count < 2 {
        return Err(CalibError::numeric_degeneracy(
            "NUMERIC.CDS_FRAMES",
            format!("CDS pairing needs at least 2 frames, got {count}"),
        ));
    }
    let pairs = match pairing {
        CdsPairing::Alternating => {
            let n = count / 2;
            &frames.slice(s![1..2 * n;2, .., ..]) - &frames.slice(s![0..2 * n;2, .., ..])
        }
        CdsPairing::Consecutive => &frames.slice(s![1.., .., ..]) - &frames.slice(s![..-1, .., ..]),
        CdsPairing::FirstFrame => {
            let first = frames.slice(s![0..1, .., ..]);
            &frames.slice(s![1.., .., ..]) - &first
        }
    };
    Ok(pairs)
}

/// Pixels selected by `mask` from every frame, `[frames, pixels]`.
pub fn pool_series(cube: ArrayView3<'_, f64>, mask: &Array2<bool>) -> Array2<f64> {
    let selected: Vec<(usize, usize)> = mask
        .indexed_iter()
        .filter_map(|(index, keep)| keep.then_some(index))
        .collect();
    let frames = cube.len_of(Axis(0));
    Array2::from_shape_fn((frames, selected.len()), |(frame, pixel)| {
        let (row, col) = selected[pixel];
        cube[(frame, row, col)]
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CdsNoise {
    /// Scatter of each pixel across pairs, `sqrt(median(variance))`.
    pub temporal: f64,
    /// Scatter across pixels within each pair, `sqrt(median(variance))`.
    pub spatial: f64,
}

fn root_median_variance(stds: impl Iterator<Item = f64>) -> f64 {
    let mut variances: Vec<f64> = stds.map(|std| std * std).collect();
    median_in_place(&mut variances).map_or(f64::NAN, f64::sqrt)
}

/// CDS noise of a `[frames, pixels]` pool. An empty pool yields NaN estimates.
pub fn cds_noise(series: ArrayView2<'_, f64>, pairing: CdsPairing) -> CalibResult<CdsNoise> {
    let cube = series.insert_axis(Axis(2));
    let pairs = cds_pairs(cube, pairing)?.index_axis_move(Axis(2), 0);

    let temporal = root_median_variance(pairs.axis_iter(Axis(1)).map(|pixel| {
        population_std(&pixel.to_vec()).unwrap_or(f64::NAN)
    }));
    let spatial = root_median_variance(pairs.axis_iter(Axis(0)).map(|pair| {
        population_std(&pair.to_vec()).unwrap_or(f64::NAN)
    }));
    Ok(CdsNoise { temporal, spatial })
}
