//! Savitzky-Golay smoothing with polynomial edge interpolation.

use super::polyfit::{PolyBasis, PolyFitError, PolyFitter, poly_eval};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SavGolError {
    #[error("Savitzky-Golay window must be odd and >= 1, got {window}")]
    InvalidWindow { window: usize },
    #[error("Savitzky-Golay order {order} must be smaller than window {window}")]
    OrderTooHigh { order: usize, window: usize },
    #[error("Savitzky-Golay local fit failed: {0}")]
    Fit(#[from] PolyFitError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavGolFilter {
    window: usize,
    order: usize,
}

impl SavGolFilter {
    pub fn new(window: usize, order: usize) -> Result<Self, SavGolError> {
        if window == 0 || window % 2 == 0 {
            return Err(SavGolError::InvalidWindow { window });
        }
        if order >= window {
            return Err(SavGolError::OrderTooHigh { order, window });
        }
        Ok(Self { window, order })
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Smooth `samples`; the window shrinks to the largest odd length that fits.
    ///
    /// Non-finite samples are bridged by linear interpolation first.
    pub fn smooth(&self, samples: &[f64]) -> Result<Vec<f64>, SavGolError> {
        let filled = fill_gaps(samples);
        let len = filled.len();
        if len == 0 {
            return Ok(filled);
        }

        let window = if self.window <= len {
            self.window
        } else if len % 2 == 1 {
            len
        } else {
            len - 1
        };
        if window < 3 {
            return Ok(filled);
        }
        let order = self.order.min(window - 1);
        let half = window / 2;

        let offsets: Vec<f64> = (0..window).map(|i| i as f64 - half as f64).collect();
        let local = PolyFitter::new(&offsets, order, PolyBasis::Power)?;

        let mut smoothed = vec![0.0; len];
        for index in half..(len - half) {
            let coefficients = local.fit(&filled[(index - half)..=(index + half)])?;
            smoothed[index] = coefficients[0];
        }

        let head = local.fit(&filled[0..window])?;
        for (index, value) in smoothed.iter_mut().enumerate().take(half) {
            *value = poly_eval(index as f64 - half as f64, &head, PolyBasis::Power);
        }
        let tail = local.fit(&filled[(len - window)..len])?;
        for index in (len - half)..len {
            let offset = (index - (len - window)) as f64 - half as f64;
            smoothed[index] = poly_eval(offset, &tail, PolyBasis::Power);
        }

        Ok(smoothed)
    }
}

/// Replace non-finite samples by linear interpolation between finite neighbors.
///
/// Leading and trailing gaps take the nearest finite value; an all-missing
/// input becomes zeros.
pub fn fill_gaps(samples: &[f64]) -> Vec<f64> {
    let finite: Vec<usize> = samples
        .iter()
        .enumerate()
        .filter(|(_, value)| value.is_finite())
        .map(|(index, _)| index)
        .collect();
    let (Some(&first), Some(&last)) = (finite.first(), finite.last()) else {
        return vec![0.0; samples.len()];
    };

    let mut filled = samples.to_vec();
    for value in filled.iter_mut().take(first) {
        *value = samples[first];
    }
    for value in filled.iter_mut().skip(last + 1) {
        *value = samples[last];
    }
    for pair in finite.windows(2) {
        let (left, right) = (pair[0], pair[1]);
        if right - left < 2 {
            continue;
        }
        let span = (right - left) as f64;
        for index in (left + 1)..right {
            let weight = (index - left) as f64 / span;
            filled[index] = samples[left] * (1.0 - weight) + samples[right] * weight;
        }
    }
    filled
}

#[cfg(test)]
mod tests {
    use super::{SavGolError, SavGolFilter, fill_gaps};

    #[test]
    fn smoothing_preserves_cubic_exactly() {
        let samples: Vec<f64> = (0..80)
            .map(|i| {
                let x = i as f64 * 0.1;
                1.0 - 2.0 * x + 0.3 * x * x - 0.05 * x * x * x
            })
            .collect();
        let smoothed = SavGolFilter::new(31, 3)
            .expect("filter")
            .smooth(&samples)
            .expect("smooth");
        for (value, expected) in smoothed.iter().zip(&samples) {
            assert!((value - expected).abs() < 1.0e-8, "{value} vs {expected}");
        }
    }

    #[test]
    fn smoothing_reduces_alternating_noise() {
        let samples: Vec<f64> = (0..64)
            .map(|i| if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        let smoothed = SavGolFilter::new(31, 3)
            .expect("filter")
            .smooth(&samples)
            .expect("smooth");
        let interior_peak = smoothed[16..48]
            .iter()
            .fold(0.0_f64, |acc, value| acc.max(value.abs()));
        assert!(interior_peak < 0.2, "peak {interior_peak}");
    }

    #[test]
    fn short_inputs_shrink_the_window() {
        let samples = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let smoothed = SavGolFilter::new(31, 3)
            .expect("filter")
            .smooth(&samples)
            .expect("smooth");
        for (value, expected) in smoothed.iter().zip(samples) {
            assert!((value - expected).abs() < 1.0e-10);
        }
    }

    #[test]
    fn even_window_is_rejected() {
        assert_eq!(
            SavGolFilter::new(30, 3),
            Err(SavGolError::InvalidWindow { window: 30 })
        );
    }

    #[test]
    fn gaps_are_bridged_linearly() {
        let filled = fill_gaps(&[f64::NAN, 2.0, f64::NAN, f64::NAN, 8.0, f64::NAN]);
        let expected = [2.0, 2.0, 4.0, 6.0, 8.0, 8.0];
        for (value, wanted) in filled.iter().zip(expected) {
            assert!((value - wanted).abs() < 1.0e-12);
        }
    }
}
