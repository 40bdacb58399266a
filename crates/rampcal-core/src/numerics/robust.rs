//! Outlier-resistant location and scale estimators.
//!
//! All helpers take plain slices and return `None` on empty input so callers
//! can decide whether an empty pixel pool is an error or a skip.

use ndarray::{Array2, ArrayView3, Axis};

/// Scale factor converting a median absolute deviation into a Gaussian sigma.
pub const MAD_TO_SIGMA: f64 = 0.6745;

const RESISTANT_MEAN_CUT: f64 = 3.0;
const BIWEIGHT_TUNING: f64 = 6.0;
const TINY_SCALE: f64 = 1.0e-20;
const HISTOGRAM_WINDOW_SIGMA: f64 = 10.0;
const MAX_HISTOGRAM_BINS: usize = 1 << 16;

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation (`ddof = 0`).
pub fn population_std(values: &[f64]) -> Option<f64> {
    let center = mean(values)?;
    let variance = values
        .iter()
        .map(|value| (value - center).powi(2))
        .sum::<f64>()
        / values.len() as f64;
    Some(variance.sqrt())
}

pub fn median(values: &[f64]) -> Option<f64> {
    let mut scratch = values.to_vec();
    median_in_place(&mut scratch)
}

/// Median that reorders `values`; even lengths average the two middle samples.
pub fn median_in_place(values: &mut [f64]) -> Option<f64> {
    let len = values.len();
    if len == 0 {
        return None;
    }

    let upper_index = len / 2;
    let (lower, upper, _) = values.select_nth_unstable_by(upper_index, f64::total_cmp);
    let upper = *upper;
    if len % 2 == 1 {
        return Some(upper);
    }

    let lower_max = lower
        .iter()
        .copied()
        .max_by(f64::total_cmp)
        .unwrap_or(upper);
    Some(0.5 * (lower_max + upper))
}

/// Median absolute deviation scaled to a Gaussian sigma.
pub fn median_abs_deviation(values: &[f64]) -> Option<f64> {
    let center = median(values)?;
    let mut deviations: Vec<f64> = values.iter().map(|value| (value - center).abs()).collect();
    median_in_place(&mut deviations).map(|mad| mad / MAD_TO_SIGMA)
}

/// Biweight estimate of the standard deviation.
///
/// Falls back to the mean absolute deviation when more than half the samples
/// sit exactly on the median, and returns zero for constant input.
pub fn robust_std(values: &[f64]) -> Option<f64> {
    let center = median(values)?;
    let mut deviations: Vec<f64> = values.iter().map(|value| (value - center).abs()).collect();
    let mut scale = median_in_place(&mut deviations).unwrap_or(0.0) / MAD_TO_SIGMA;
    if scale < TINY_SCALE {
        scale = mean(&deviations).unwrap_or(0.0) / 0.80;
    }
    if scale < TINY_SCALE {
        return Some(0.0);
    }

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for value in values {
        let offset = value - center;
        let u = offset / (BIWEIGHT_TUNING * scale);
        let u2 = u * u;
        if u2 >= 1.0 {
            continue;
        }
        numerator += offset * offset * (1.0 - u2).powi(4);
        denominator += (1.0 - u2) * (1.0 - 5.0 * u2);
    }

    let count = values.len() as f64;
    let variance = count * numerator / (denominator * (denominator - 1.0));
    if variance.is_finite() && variance > 0.0 {
        Some(variance.sqrt())
    } else {
        Some(0.0)
    }
}

/// Mean of the samples within 3 sigma (MAD based) of the median.
pub fn robust_mean(values: &[f64]) -> Option<f64> {
    robust_mean_with_cut(values, RESISTANT_MEAN_CUT)
}

pub fn robust_mean_with_cut(values: &[f64], cut: f64) -> Option<f64> {
    let center = median(values)?;
    let scale = median_abs_deviation(values).unwrap_or(0.0);
    let limit = cut * scale;

    let (sum, count) = values
        .iter()
        .filter(|value| (*value - center).abs() <= limit)
        .fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    if count == 0 {
        return Some(center);
    }
    Some(sum / count as f64)
}

/// Center of the most populated histogram bin.
///
/// The histogram spans the finite samples within `HISTOGRAM_WINDOW_SIGMA`
/// robust sigmas of the median, and never more than `MAX_HISTOGRAM_BINS` bins,
/// so a stray extreme value cannot blow up the bin count.
pub fn histogram_mode(values: &[f64], bin_size: f64) -> Option<f64> {
    if !(bin_size.is_finite() && bin_size > 0.0) {
        return None;
    }
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    let center = median(&finite)?;
    let spread = median_abs_deviation(&finite).unwrap_or(0.0);
    let reach = (HISTOGRAM_WINDOW_SIGMA * spread).min(0.5 * (MAX_HISTOGRAM_BINS - 1) as f64 * bin_size);
    let min = finite.iter().copied().min_by(f64::total_cmp)?;
    let max = finite.iter().copied().max_by(f64::total_cmp)?;
    let low = (center - reach).max(min);
    let high = (center + reach).min(max);

    let bin_count = ((((high - low) / bin_size).floor() as usize) + 1).min(MAX_HISTOGRAM_BINS);
    let mut counts = vec![0usize; bin_count];
    for value in finite.iter().filter(|value| (low..=high).contains(*value)) {
        let index = (((value - low) / bin_size).floor() as usize).min(bin_count - 1);
        counts[index] += 1;
    }

    let mut peak = 0;
    for (index, count) in counts.iter().enumerate() {
        if *count > counts[peak] {
            peak = index;
        }
    }
    Some(low + (peak as f64 + 0.5) * bin_size)
}

/// Reduce a `[n, rows, cols]` stack along its first axis pixel by pixel.
pub fn reduce_stack<F>(stack: ArrayView3<'_, f64>, mut reducer: F) -> Array2<f64>
where
    F: FnMut(&mut [f64]) -> f64,
{
    let (_, rows, cols) = stack.dim();
    let mut scratch = Vec::with_capacity(stack.len_of(Axis(0)));
    Array2::from_shape_fn((rows, cols), |(row, col)| {
        scratch.clear();
        scratch.extend(stack.slice(ndarray::s![.., row, col]).iter().copied());
        reducer(&mut scratch)
    })
}

pub fn median_stack(stack: ArrayView3<'_, f64>) -> Array2<f64> {
    reduce_stack(stack, |values| median_in_place(values).unwrap_or(f64::NAN))
}

pub fn robust_mean_stack(stack: ArrayView3<'_, f64>) -> Array2<f64> {
    reduce_stack(stack, |values| robust_mean(values).unwrap_or(f64::NAN))
}

pub fn robust_std_stack(stack: ArrayView3<'_, f64>) -> Array2<f64> {
    reduce_stack(stack, |values| robust_std(values).unwrap_or(f64::NAN))
}

#[cfg(test)]
mod tests {
    use super::{
        histogram_mode, median, median_abs_deviation, median_stack, population_std,
        robust_mean, robust_std,
    };
    use ndarray::Array3;

    #[test]
    fn median_handles_odd_even_and_empty_inputs() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn median_abs_deviation_scales_to_gaussian_sigma() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        let mad = median_abs_deviation(&values).expect("non-empty");
        assert!((mad - 1.0 / 0.6745).abs() < 1.0e-12);
    }

    #[test]
    fn robust_mean_ignores_single_large_outlier() {
        let mut values = vec![10.0, 10.5, 9.5, 10.2, 9.8, 10.1, 9.9];
        values.push(1.0e6);
        let resistant = robust_mean(&values).expect("non-empty");
        assert!((resistant - 10.0).abs() < 0.1, "got {resistant}");
    }

    #[test]
    fn robust_std_of_constant_input_is_zero() {
        assert_eq!(robust_std(&[5.0; 12]), Some(0.0));
    }

    #[test]
    fn robust_std_matches_population_std_for_symmetric_spread() {
        let values: Vec<f64> = (0..2001).map(|i| ((i as f64) * 0.7).sin()).collect();
        let robust = robust_std(&values).expect("non-empty");
        let plain = population_std(&values).expect("non-empty");
        assert!((robust - plain).abs() / plain < 0.25, "{robust} vs {plain}");
    }

    #[test]
    fn histogram_mode_reports_bin_center_of_peak() {
        let values = [1.0, 1.1, 1.2, 1.15, 3.0, 5.0];
        let mode = histogram_mode(&values, 0.25).expect("non-empty");
        assert!((mode - 1.125).abs() < 1.0e-12, "got {mode}");
    }

    #[test]
    fn histogram_mode_ignores_extreme_outliers() {
        let mut values: Vec<f64> = (0..200).map(|i| 100.0 + (i % 7) as f64).collect();
        values.extend([103.0; 40]);
        values.push(1.0e15);
        values.push(-1.0e12);
        let mode = histogram_mode(&values, 1.0).expect("non-empty");
        assert!((mode - 103.0).abs() <= 0.5, "got {mode}");
    }

    #[test]
    fn median_stack_reduces_along_first_axis() {
        let stack = Array3::from_shape_fn((3, 2, 2), |(k, r, c)| (k * 10 + r + c) as f64);
        let reduced = median_stack(stack.view());
        assert_eq!(reduced[(0, 0)], 10.0);
        assert_eq!(reduced[(1, 1)], 12.0);
    }
}
